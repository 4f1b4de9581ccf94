//! Sync wire protocol
//!
//! Every frame is one [`WireMessage`] serialized with postcard. A message
//! carries any subset of three independent fields:
//!
//! ```text
//! Message {
//!   changes?: [ChangeRecord]   // changes pushed to the recipient
//!   request?: { version }      // "send me your changes past this cursor"
//!   name?:    String           // sender's display name
//! }
//! ```
//!
//! ## Message Flow
//!
//! ```text
//! Node A                                   Node B
//!   |                                        |
//!   |--- {request: {version: 0}, name} ----->|
//!   |                                        |  changes_since(B, 0)
//!   |<-- {changes: [c1, c2, c3]} ------------|
//!   |                                        |
//!   |  (merge, cursor[B] = 3)                |
//! ```

use serde::{Deserialize, Serialize};

use crate::types::ChangeRecord;

/// Ask the recipient for its changes past `version`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub version: u64,
}

/// One protocol message. Each present field is handled independently.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub changes: Option<Vec<ChangeRecord>>,
    pub request: Option<SyncRequest>,
    pub name: Option<String>,
}

impl Message {
    /// A request for changes past `version`
    pub fn request(version: u64) -> Self {
        Self {
            request: Some(SyncRequest { version }),
            ..Self::default()
        }
    }

    /// A batch of changes
    pub fn changes(changes: Vec<ChangeRecord>) -> Self {
        Self {
            changes: Some(changes),
            ..Self::default()
        }
    }

    /// Attach the sender's display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// True if no field is present
    pub fn is_empty(&self) -> bool {
        self.changes.is_none() && self.request.is_none() && self.name.is_none()
    }
}

/// Wrapper for versioned messages
///
/// New protocol versions are added as variants; a node that can't decode a
/// frame drops it whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    /// Protocol version 1
    V1(Message),
}

impl WireMessage {
    pub fn new(msg: Message) -> Self {
        WireMessage::V1(msg)
    }

    /// Encode wire message to bytes using postcard
    pub fn encode(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Decode wire message from bytes using postcard
    pub fn decode(data: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(data)
    }

    /// Unwrap the inner Message
    pub fn into_inner(self) -> Message {
        match self {
            WireMessage::V1(msg) => msg,
        }
    }

    /// Get the protocol version
    pub fn version(&self) -> u8 {
        match self {
            WireMessage::V1(_) => 1,
        }
    }
}
