//! Cell Storage - the replicated dataset and its change log
//!
//! Cells are keyed by `table\0row\0column`. The change log is keyed by
//! `origin (32) || db_version (8, BE) || seq (4, BE)` so one origin's changes
//! form a contiguous, ordered range.

use std::collections::BTreeMap;

use redb::{ReadableTable, Table, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};

use super::{Storage, COUNTERS_TABLE};
use crate::error::SyncError;
use crate::types::{ChangeRecord, SiteId, Value};

/// Table for dataset cells (key: cell key, value: serialized CellState)
pub(crate) const CELLS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("cells");

/// Table for the change log (key: change key, value: serialized ChangeRecord)
pub(crate) const CHANGES_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("changes");

const DB_VERSION_KEY: &str = "db_version";
const CHANGE_KEY_LEN: usize = 32 + 8 + 4;

/// One row of a table, with its live columns
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub id: String,
    pub columns: BTreeMap<String, Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CellState {
    value: Value,
    col_version: u64,
    db_version: u64,
    origin: SiteId,
}

fn cell_key(table: &str, row: &str, column: &str) -> String {
    format!("{}\0{}\0{}", table, row, column)
}

fn split_cell_key(key: &str) -> Option<(&str, &str, &str)> {
    let mut parts = key.splitn(3, '\0');
    Some((parts.next()?, parts.next()?, parts.next()?))
}

fn change_key(origin: &SiteId, db_version: u64, seq: u32) -> [u8; CHANGE_KEY_LEN] {
    let mut key = [0u8; CHANGE_KEY_LEN];
    key[..32].copy_from_slice(origin.as_bytes());
    key[32..40].copy_from_slice(&db_version.to_be_bytes());
    key[40..].copy_from_slice(&seq.to_be_bytes());
    key
}

/// Last-writer-wins on `(col_version, origin)`. Returns whether the cell changed.
fn merge_cell(
    cells: &mut Table<'_, &'static str, &'static [u8]>,
    change: &ChangeRecord,
    origin: SiteId,
) -> Result<bool, SyncError> {
    let key = cell_key(&change.table, &change.row, &change.column);

    let current = match cells.get(key.as_str())? {
        Some(data) => Some(postcard::from_bytes::<CellState>(data.value())?),
        None => None,
    };
    if let Some(current) = current {
        if (change.col_version, origin) <= (current.col_version, current.origin) {
            return Ok(false);
        }
    }

    let state = CellState {
        value: change.value.clone(),
        col_version: change.col_version,
        db_version: change.db_version,
        origin,
    };
    let serialized = postcard::to_allocvec(&state)?;
    cells.insert(key.as_str(), serialized.as_slice())?;
    Ok(true)
}

/// Apply remote changes inside an open write transaction.
///
/// Every change is validated and recorded in the change log. The first
/// invalid change returns an error, leaving the transaction to be dropped.
pub(super) fn merge_changes(
    write_txn: &WriteTransaction,
    changes: &[ChangeRecord],
) -> Result<usize, SyncError> {
    let mut cells = write_txn.open_table(CELLS_TABLE)?;
    let mut log = write_txn.open_table(CHANGES_TABLE)?;

    let mut updated = 0;
    for change in changes {
        change.validate()?;
        let origin = change
            .origin
            .ok_or_else(|| SyncError::InvalidChange("change has no origin".to_string()))?;

        if merge_cell(&mut cells, change, origin)? {
            updated += 1;
        }

        let key = change_key(&origin, change.db_version, change.seq);
        let serialized = postcard::to_allocvec(change)?;
        log.insert(key.as_slice(), serialized.as_slice())?;
    }
    Ok(updated)
}

impl Storage {
    // ═══════════════════════════════════════════════════════════════════════
    // Local Writes
    // ═══════════════════════════════════════════════════════════════════════

    /// Write several columns of one row as a single local transaction.
    ///
    /// All columns share the next local `db_version`; each gets its own `seq`.
    /// Returns the change records that were logged.
    pub fn write_row(
        &self,
        table: &str,
        row: &str,
        columns: &[(&str, Value)],
    ) -> Result<Vec<ChangeRecord>, SyncError> {
        if columns.is_empty() {
            return Err(SyncError::InvalidOperation(
                "write_row needs at least one column".to_string(),
            ));
        }

        let origin = self.site_id();
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        let records = {
            let mut counters = write_txn.open_table(COUNTERS_TABLE)?;
            let db_version = counters.get(DB_VERSION_KEY)?.map(|v| v.value()).unwrap_or(0) + 1;
            counters.insert(DB_VERSION_KEY, db_version)?;

            let mut cells = write_txn.open_table(CELLS_TABLE)?;
            let mut log = write_txn.open_table(CHANGES_TABLE)?;

            let mut records = Vec::with_capacity(columns.len());
            for (seq, (column, value)) in columns.iter().enumerate() {
                let key = cell_key(table, row, column);
                let col_version = match cells.get(key.as_str())? {
                    Some(data) => postcard::from_bytes::<CellState>(data.value())?.col_version,
                    None => 0,
                } + 1;

                let change = ChangeRecord {
                    table: table.to_string(),
                    row: row.to_string(),
                    column: column.to_string(),
                    value: value.clone(),
                    col_version,
                    db_version,
                    seq: seq as u32,
                    origin: Some(origin),
                };
                change.validate()?;

                merge_cell(&mut cells, &change, origin)?;
                let serialized = postcard::to_allocvec(&change)?;
                log.insert(change_key(&origin, db_version, change.seq).as_slice(), serialized.as_slice())?;
                records.push(change);
            }
            records
        };
        write_txn.commit()?;

        tracing::debug!(table, row, changes = records.len(), "Local write committed");
        Ok(records)
    }

    /// Write a single cell as a local transaction
    pub fn write_cell(
        &self,
        table: &str,
        row: &str,
        column: &str,
        value: Value,
    ) -> Result<ChangeRecord, SyncError> {
        self.write_row(table, row, &[(column, value)])?
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::Storage("local write produced no change".to_string()))
    }

    /// Highest `db_version` this site has authored
    pub fn local_db_version(&self) -> Result<u64, SyncError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(COUNTERS_TABLE)?;
        Ok(table.get(DB_VERSION_KEY)?.map(|v| v.value()).unwrap_or(0))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Reads
    // ═══════════════════════════════════════════════════════════════════════

    /// Read one cell
    pub fn read_cell(&self, table: &str, row: &str, column: &str) -> Result<Option<Value>, SyncError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let cells = read_txn.open_table(CELLS_TABLE)?;

        let key = cell_key(table, row, column);
        match cells.get(key.as_str())? {
            Some(data) => Ok(Some(postcard::from_bytes::<CellState>(data.value())?.value)),
            None => Ok(None),
        }
    }

    /// Read every column of one row. Empty if the row doesn't exist.
    pub fn read_row(&self, table: &str, row: &str) -> Result<BTreeMap<String, Value>, SyncError> {
        let prefix = format!("{}\0{}\0", table, row);
        let upper = format!("{}\0{}\x01", table, row);

        Ok(self
            .scan_cells(&prefix, &upper)?
            .into_iter()
            .map(|(_, column, value)| (column, value))
            .collect())
    }

    /// List all rows of a table, ordered by row id
    pub fn list_rows(&self, table: &str) -> Result<Vec<Row>, SyncError> {
        let prefix = format!("{}\0", table);
        let upper = format!("{}\x01", table);

        let mut rows: Vec<Row> = Vec::new();
        for (row, column, value) in self.scan_cells(&prefix, &upper)? {
            match rows.last_mut() {
                Some(last) if last.id == row => {
                    last.columns.insert(column, value);
                }
                _ => {
                    let mut columns = BTreeMap::new();
                    columns.insert(column, value);
                    rows.push(Row { id: row, columns });
                }
            }
        }
        Ok(rows)
    }

    fn scan_cells(&self, lower: &str, upper: &str) -> Result<Vec<(String, String, Value)>, SyncError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let cells = read_txn.open_table(CELLS_TABLE)?;

        let mut out = Vec::new();
        for entry in cells.range::<&str>(lower..upper)? {
            let (key, data) = entry?;
            let Some((_, row, column)) = split_cell_key(key.value()) else {
                return Err(SyncError::Storage(format!("malformed cell key {:?}", key.value())));
            };
            let state: CellState = postcard::from_bytes(data.value())?;
            out.push((row.to_string(), column.to_string(), state.value));
        }
        Ok(out)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Change Log
    // ═══════════════════════════════════════════════════════════════════════

    /// Changes authored by `origin` with `db_version > cursor`, in order
    pub fn changes_since(&self, origin: &SiteId, cursor: u64) -> Result<Vec<ChangeRecord>, SyncError> {
        let Some(first) = cursor.checked_add(1) else {
            return Ok(Vec::new());
        };
        let start = change_key(origin, first, 0);
        let end = change_key(origin, u64::MAX, u32::MAX);

        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let log = read_txn.open_table(CHANGES_TABLE)?;

        let mut changes = Vec::new();
        for entry in log.range::<&[u8]>(start.as_slice()..=end.as_slice())? {
            let (_, data) = entry?;
            changes.push(postcard::from_bytes(data.value())?);
        }
        Ok(changes)
    }
}
