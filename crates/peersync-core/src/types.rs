//! Core types for peersync

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Identifier of one replica.
///
/// The same 32 bytes tag every change the replica authors and address it on
/// the transport (they are the public key of the site's transport identity).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SiteId(pub [u8; 32]);

impl SiteId {
    /// Create a random SiteId (tests and in-memory meshes)
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create a SiteId from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes of the SiteId
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse from a byte slice, which must be exactly 32 bytes long
    pub fn from_slice(bytes: &[u8]) -> Result<Self, SyncError> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SyncError::InvalidSiteId(format!("expected 32 bytes, got {}", bytes.len())))?;
        Ok(Self(arr))
    }

    /// Full hex representation
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 8 hex chars, for logs and compact display
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SiteId({})", self.short())
    }
}

impl FromStr for SiteId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|e| SyncError::InvalidSiteId(e.to_string()))?;
        Self::from_slice(&bytes)
    }
}

/// A peer as recorded in the local store's peer table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// The peer's site id
    pub id: SiteId,
    /// Display name the peer announced for itself
    pub name: Option<String>,
    /// Cursor: every change authored by this peer up to this version is merged
    pub version: u64,
    /// Unix timestamp of the last update to this record
    pub last_seen: i64,
}

impl PeerRecord {
    /// A fresh record with version 0
    pub fn new(id: SiteId) -> Self {
        Self {
            id,
            name: None,
            version: 0,
            last_seen: chrono::Utc::now().timestamp(),
        }
    }

    /// Merge a partial update into this record.
    ///
    /// Only supplied fields are overwritten and the version never decreases.
    pub fn apply(&mut self, update: &PeerUpdate) {
        if let Some(ref name) = update.name {
            self.name = Some(name.clone());
        }
        if let Some(version) = update.version {
            self.version = self.version.max(version);
        }
        self.last_seen = chrono::Utc::now().timestamp();
    }

    /// Name to show for this peer, falling back to the short id
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.id.short())
    }
}

/// Partial update for a [`PeerRecord`]; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerUpdate {
    pub name: Option<String>,
    pub version: Option<u64>,
}

impl PeerUpdate {
    /// Only touch `last_seen`
    pub fn touch() -> Self {
        Self::default()
    }

    /// Update the display name
    pub fn name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            version: None,
        }
    }

    /// Raise the cursor to `version`
    pub fn version(version: u64) -> Self {
        Self {
            name: None,
            version: Some(version),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// A cell value in the replicated dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    /// Parse a command-line literal: integers and reals are detected,
    /// `null` maps to [`Value::Null`], anything else is text.
    pub fn parse_literal(s: &str) -> Self {
        if s == "null" {
            Value::Null
        } else if let Ok(i) = s.parse::<i64>() {
            Value::Integer(i)
        } else if let Ok(f) = s.parse::<f64>() {
            Value::Real(f)
        } else {
            Value::Text(s.to_string())
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Real(r) => write!(f, "{}", r),
            Value::Text(s) => write!(f, "{}", s),
            Value::Blob(b) => write!(f, "x'{}'", hex::encode(b)),
        }
    }
}

/// One column-level mutation, as recorded in a store's change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Target table
    pub table: String,
    /// Primary key of the target row
    pub row: String,
    /// Target column
    pub column: String,
    /// New value
    pub value: Value,
    /// Per-cell logical clock used for last-writer-wins
    pub col_version: u64,
    /// Per-origin sequence number of the transaction that made the change
    pub db_version: u64,
    /// Position of the change within its transaction
    pub seq: u32,
    /// Site that authored the change. Changes without an origin are never applied.
    pub origin: Option<SiteId>,
}

impl ChangeRecord {
    /// Check that table, row and column are usable as storage keys
    pub fn validate(&self) -> Result<(), SyncError> {
        for (what, ident) in [("table", &self.table), ("row", &self.row), ("column", &self.column)] {
            if ident.is_empty() {
                return Err(SyncError::InvalidChange(format!("empty {} name", what)));
            }
            if ident.contains('\0') {
                return Err(SyncError::InvalidChange(format!("NUL in {} name", what)));
            }
        }
        Ok(())
    }
}
