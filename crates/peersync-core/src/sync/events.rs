//! Sync events and per-peer sync state
//!
//! ## Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  PeerSyncState: per-peer request state                          │
//! │  ├── Idle: nothing outstanding                                  │
//! │  └── RequestSent: waiting for a changes message                 │
//! │                                                                 │
//! │  SyncEvent: notifications about sync activity                   │
//! │  ├── PeerConnected / PeerDisconnected                           │
//! │  ├── ChangesApplied: the dataset changed                        │
//! │  ├── MergeRejected: a batch was discarded                       │
//! │  └── RoundCompleted: a heartbeat round finished                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::transport::Direction;
use crate::types::SiteId;

/// Request state of one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerSyncState {
    #[default]
    Idle,
    /// A request for changes past `version` is outstanding
    RequestSent { version: u64, since: Instant },
}

impl PeerSyncState {
    pub fn is_idle(&self) -> bool {
        matches!(self, PeerSyncState::Idle)
    }

    /// Fall back to Idle once a request has been outstanding for `timeout`
    pub fn expire(self, now: Instant, timeout: Duration) -> Self {
        match self {
            PeerSyncState::RequestSent { since, .. } if now.duration_since(since) >= timeout => {
                PeerSyncState::Idle
            }
            state => state,
        }
    }
}

impl fmt::Display for PeerSyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerSyncState::Idle => write!(f, "Idle"),
            PeerSyncState::RequestSent { version, .. } => write!(f, "Request sent (since {})", version),
        }
    }
}

/// Outcome of one heartbeat round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundSummary {
    /// Peers a request was attempted for
    pub attempted: usize,
    /// Peers the request was sent to
    pub succeeded: usize,
    /// Peers that couldn't be reached, errored or panicked
    pub failed: usize,
}

/// Notifications about sync activity
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A connection to a peer is open
    PeerConnected { peer: SiteId, direction: Direction },

    /// A peer's connection closed or failed
    PeerDisconnected { peer: SiteId },

    /// A batch from `from` was merged and the dataset may have changed
    ChangesApplied {
        from: SiteId,
        /// Changes that survived filtering and were applied
        changes: usize,
        /// Cells whose value changed
        updated: usize,
        /// Cursors raised by the batch
        cursors: Vec<(SiteId, u64)>,
    },

    /// A batch from `from` was discarded and no cursor moved
    MergeRejected { from: SiteId, reason: String },

    /// A heartbeat round finished
    RoundCompleted(RoundSummary),
}
