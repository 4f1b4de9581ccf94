//! Site identity
//!
//! A site is identified by an iroh secret key generated once per store. Its
//! public key is the [`SiteId`], so the id that tags a replica's changes is
//! also the address other peers dial.

use iroh::SecretKey;

use crate::types::SiteId;

/// Secret half of a site's identity
#[derive(Clone)]
pub struct SiteKey {
    secret: SecretKey,
}

impl SiteKey {
    /// Generate a fresh identity
    pub fn generate() -> Self {
        Self {
            secret: SecretKey::generate(&mut rand::rng()),
        }
    }

    /// Restore an identity from its persisted bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            secret: SecretKey::from(bytes),
        }
    }

    /// Bytes to persist
    pub fn to_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// The public site id
    pub fn site_id(&self) -> SiteId {
        SiteId::from_bytes(*self.secret.public().as_bytes())
    }

    /// The key as the transport expects it
    pub fn secret_key(&self) -> SecretKey {
        self.secret.clone()
    }
}

impl std::fmt::Debug for SiteKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiteKey")
            .field("site_id", &self.site_id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_site_id_is_stable_across_restore() {
        let key = SiteKey::generate();
        let restored = SiteKey::from_bytes(key.to_bytes());
        assert_eq!(key.site_id(), restored.site_id());
    }

    #[test]
    fn test_distinct_keys_distinct_sites() {
        assert_ne!(SiteKey::generate().site_id(), SiteKey::generate().site_id());
    }
}
