//! Merge step for incoming change batches
//!
//! 1. Drop changes authored by the local site, and changes with no origin
//! 2. Take the highest `db_version` per remaining origin
//! 3. Apply the changes and raise those cursors in one store transaction
//!
//! The store never lowers a cursor, so replaying a batch, or receiving an
//! older one late, leaves every cursor where it was.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::error::SyncResult;
use crate::store::LocalStore;
use crate::types::{ChangeRecord, SiteId};

/// Changes to apply and cursors to raise for one batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergePlan {
    pub changes: Vec<ChangeRecord>,
    pub cursors: BTreeMap<SiteId, u64>,
    /// Changes dropped because the local site authored them
    pub dropped_local: usize,
    /// Changes dropped because they carry no origin
    pub dropped_missing_origin: usize,
}

impl MergePlan {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn cursor_list(&self) -> Vec<(SiteId, u64)> {
        self.cursors.iter().map(|(site, version)| (*site, *version)).collect()
    }
}

/// Result of merging one batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    /// Changes handed to the store
    pub applied: usize,
    /// Cells whose value changed
    pub updated: usize,
    /// Cursors raised, per origin
    pub cursors: Vec<(SiteId, u64)>,
    pub dropped_local: usize,
    pub dropped_missing_origin: usize,
}

/// Filter a batch and compute the cursor bump per origin
pub fn plan(local: &SiteId, batch: Vec<ChangeRecord>) -> MergePlan {
    let mut plan = MergePlan::default();

    for change in batch {
        let Some(origin) = change.origin else {
            plan.dropped_missing_origin += 1;
            continue;
        };
        if origin == *local {
            plan.dropped_local += 1;
            continue;
        }

        let cursor = plan.cursors.entry(origin).or_insert(0);
        *cursor = (*cursor).max(change.db_version);
        plan.changes.push(change);
    }

    plan
}

/// Merge a batch received from a peer into the store
pub fn merge_batch<S: LocalStore + ?Sized>(
    store: &S,
    batch: Vec<ChangeRecord>,
) -> SyncResult<MergeOutcome> {
    let local = store.site_id();
    let plan = plan(&local, batch);

    if plan.dropped_local > 0 {
        debug!(count = plan.dropped_local, "Dropped changes authored locally");
    }
    if plan.dropped_missing_origin > 0 {
        warn!(count = plan.dropped_missing_origin, "Dropped changes without an origin");
    }

    let mut outcome = MergeOutcome {
        dropped_local: plan.dropped_local,
        dropped_missing_origin: plan.dropped_missing_origin,
        ..MergeOutcome::default()
    };
    if plan.is_empty() {
        return Ok(outcome);
    }

    let cursors = plan.cursor_list();
    outcome.updated = store.apply_changes_atomic(&plan.changes, &cursors)?;
    outcome.applied = plan.changes.len();
    outcome.cursors = cursors;

    debug!(
        applied = outcome.applied,
        updated = outcome.updated,
        origins = outcome.cursors.len(),
        "Merged change batch"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    fn change(origin: Option<SiteId>, db_version: u64) -> ChangeRecord {
        ChangeRecord {
            table: "set".to_string(),
            row: format!("r{}", db_version),
            column: "reps".to_string(),
            value: Value::Integer(db_version as i64),
            col_version: 1,
            db_version,
            seq: 0,
            origin,
        }
    }

    #[test]
    fn test_plan_drops_local_and_originless() {
        let local = SiteId::random();
        let remote = SiteId::random();

        let plan = plan(
            &local,
            vec![change(Some(remote), 1), change(Some(local), 9), change(None, 4)],
        );

        assert_eq!(plan.changes.len(), 1);
        assert_eq!(plan.dropped_local, 1);
        assert_eq!(plan.dropped_missing_origin, 1);
        assert!(!plan.cursors.contains_key(&local));
    }

    #[test]
    fn test_plan_takes_max_per_origin() {
        let local = SiteId::random();
        let x = SiteId::random();
        let y = SiteId::random();

        let plan = plan(
            &local,
            vec![
                change(Some(x), 5),
                change(Some(y), 2),
                change(Some(x), 3),
                change(Some(y), 1),
            ],
        );

        assert_eq!(plan.cursors.get(&x), Some(&5));
        assert_eq!(plan.cursors.get(&y), Some(&2));
    }

    #[test]
    fn test_all_local_batch_is_empty_plan() {
        let local = SiteId::random();
        let plan = plan(&local, vec![change(Some(local), 1), change(Some(local), 2)]);
        assert!(plan.is_empty());
        assert!(plan.cursors.is_empty());
    }
}
