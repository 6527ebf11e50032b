//! Subscriber credential decryption.
//!
//! Stored credentials are opaque bytes. A `CredentialStore` turns them into a
//! usable signing key or reports that none is available. Key material never
//! leaves this module unwrapped and is zeroized on drop.

use std::fmt;
use std::sync::Arc;

use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Private key bytes, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey(Vec<u8>);

impl SecretKey {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey([REDACTED; {}])", self.0.len())
    }
}

/// Decrypts stored credentials.
pub trait CredentialStore: Send + Sync {
    /// Returns `None` when the blob cannot be turned into a key.
    fn decrypt(&self, blob: &[u8]) -> Option<SecretKey>;
}

pub type DynCredentialStore = Arc<dyn CredentialStore>;

/// Private key length in bytes.
const KEY_LEN: usize = 32;

/// Credentials stored as a hex-encoded 32-byte private key.
///
/// Accepts surrounding whitespace and an optional `0x` prefix. Intended for
/// paper trading and deployments that keep encryption at rest in the database
/// layer.
#[derive(Debug, Default, Clone, Copy)]
pub struct HexKeyCredentialStore;

impl CredentialStore for HexKeyCredentialStore {
    fn decrypt(&self, blob: &[u8]) -> Option<SecretKey> {
        let text = std::str::from_utf8(blob).ok()?;
        let trimmed = text.trim();
        let hex_str = trimmed.strip_prefix("0x").unwrap_or(trimmed);

        let bytes = Zeroizing::new(hex::decode(hex_str).ok()?);
        if bytes.len() != KEY_LEN {
            return None;
        }
        Some(SecretKey::new(bytes.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    #[test]
    fn test_hex_store_accepts_prefix_and_whitespace() {
        let store = HexKeyCredentialStore;
        let plain = store.decrypt(KEY.as_bytes()).unwrap();
        let prefixed = store.decrypt(format!(" 0x{KEY}\n").as_bytes()).unwrap();

        assert_eq!(plain.len(), 32);
        assert_eq!(plain.expose(), prefixed.expose());
    }

    #[test]
    fn test_hex_store_rejects_bad_blobs() {
        let store = HexKeyCredentialStore;
        assert!(store.decrypt(b"").is_none());
        assert!(store.decrypt(b"not-hex").is_none());
        assert!(store.decrypt(b"abcd").is_none());
        assert!(store.decrypt(&[0xff, 0xfe]).is_none());
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let key = SecretKey::new(vec![1, 2, 3]);
        assert_eq!(format!("{key:?}"), "SecretKey([REDACTED; 3])");
    }
}
