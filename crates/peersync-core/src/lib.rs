//! # peersync Core
//!
//! Local-first replica sync over direct peer connections.
//!
//! ## Overview
//!
//! Every replica owns a full copy of the dataset and a site id. Local edits
//! commit immediately and are logged as change records stamped with the
//! author's site id and a local `db_version`. On a heartbeat, each replica
//! asks every known peer for that peer's own changes past the cursor it last
//! merged, then applies the answer and raises the cursor in one transaction.
//!
//! ## Core Principles
//!
//! - **Local-first**: edits never wait on the network
//! - **Pull-based**: a replica only ever receives what it asked for
//! - **Idempotent merge**: replaying a batch changes nothing
//! - **Isolated peers**: one unreachable peer never delays the others
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use peersync_core::{SyncConfig, SyncEngine, Value};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut engine = SyncEngine::new(SyncConfig::default()).await?;
//!
//!     engine.write_cell("workout", "w1", "title", Value::Text("Legs".into()))?;
//!
//!     engine.start_networking().await?;
//!     engine.trigger_sync_now().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod peers;
pub mod storage;
pub mod store;
pub mod sync;
pub mod transport;
pub mod types;

// Re-exports
pub use config::{ConfigError, SyncConfig};
pub use engine::SyncEngine;
pub use error::{SyncError, SyncResult};
pub use identity::SiteKey;
pub use peers::PeerDirectory;
pub use storage::{Row, Storage};
pub use store::{LocalStore, StoreGate, StoreOpener};
pub use sync::{
    merge_batch, ConnectionEvent, ConnectionManager, Message, MergeOutcome, MergePlan,
    PeerConnection, PeerSyncState, RoundSummary, SyncEvent, SyncOrchestrator, SyncRequest,
    WireMessage,
};
pub use transport::memory::{Fault, MemoryNetwork, MemoryTransport};
pub use transport::quic::{IrohTransport, SYNC_ALPN};
pub use transport::{Channel, ChannelEvent, Direction, Transport};
pub use types::{ChangeRecord, PeerRecord, PeerUpdate, SiteId, Value};
