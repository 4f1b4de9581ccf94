//! Synchronization layer
//!
//! ## Overview
//!
//! Every replica keeps, per peer, a cursor: the highest `db_version` of that
//! peer's changes it has merged. Syncing is a pull: we send our cursor for a
//! peer, the peer answers with its own changes past it, and we merge them and
//! raise the cursor in the same transaction.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  SyncOrchestrator                                               │
//! │  ├── heartbeat / trigger_sync_now → sync_peer(id)               │
//! │  ├── ConnectionManager (one connection per peer)                │
//! │  │   └── Transport (memory, iroh)                               │
//! │  ├── protocol: {changes?, request?, name?}                      │
//! │  ├── merge: filter, max per origin, atomic apply                │
//! │  └── PeerDirectory (observable peer table)                      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod connection;
pub mod events;
pub mod merge;
pub mod orchestrator;
pub mod protocol;

pub use connection::{ConnectionEvent, ConnectionManager, PeerConnection};
pub use events::{PeerSyncState, RoundSummary, SyncEvent};
pub use merge::{merge_batch, MergeOutcome, MergePlan};
pub use orchestrator::SyncOrchestrator;
pub use protocol::{Message, SyncRequest, WireMessage};
