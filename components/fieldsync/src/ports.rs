/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The environment the sync core runs against, as injectable traits.
//!
//! Production wiring supplies platform implementations (the OS keystore, the
//! connectivity monitor, the app's crypto); tests swap in the fakes. The
//! core never touches a platform API directly.

use parking_lot::Mutex;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use types::Timestamp;

/// Wall-clock time. A trait so tests can get funky with it.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;

    fn sleep(&self, ms: u64) {
        std::thread::sleep(std::time::Duration::from_millis(ms));
    }
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Mints identifiers and random bytes. Local record ids must be
/// collision-free across devices without coordination; they are never shown
/// to the server (the server assigns its own ids on first upsert).
pub trait IdSource: Send + Sync {
    fn new_local_id(&self, prefix: &str) -> String;
    fn random_bytes(&self, n: usize) -> Vec<u8>;
}

/// 9 random bytes as 12 base64url characters, so ids stay short enough to
/// index well but carry 72 bits of entropy.
pub struct RandomIds;

impl IdSource for RandomIds {
    fn new_local_id(&self, prefix: &str) -> String {
        use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
        let mut bytes = [0u8; 9];
        rand::thread_rng().fill_bytes(&mut bytes);
        format!("{}-{}", prefix, URL_SAFE_NO_PAD.encode(bytes))
    }

    fn random_bytes(&self, n: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; n];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    None,
    Cellular,
    Wifi,
    Other,
}

/// Connectivity snapshot fed by the platform's network monitor.
pub trait NetworkInfo: Send + Sync {
    fn is_online(&self) -> bool;
    fn connection_type(&self) -> ConnectionType;
}

/// Durable small-value storage for tokens and the sync cursor. The host must
/// back this with something other applications can't read (keychain,
/// keystore); the core only relies on `get` returning what `put` stored,
/// across process restarts.
pub trait SecureStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn put(&self, key: &str, value: &str);
    fn delete(&self, key: &str);
}

/// In-memory secure store. Fine for tests; obviously not durable.
#[derive(Default)]
pub struct MemorySecureStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemorySecureStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecureStore for MemorySecureStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    fn put(&self, key: &str, value: &str) {
        self.values.lock().insert(key.to_string(), value.to_string());
    }

    fn delete(&self, key: &str) {
        self.values.lock().remove(key);
    }
}

/// Hashing, injected rather than bundled - the host already ships a crypto
/// library and we don't want a second one. Used to derive stable dedupe keys
/// for photos that don't have a server id yet.
pub trait Crypto: Send + Sync {
    fn sha256_hex(&self, data: &[u8]) -> String;
}

/// Reads blob bytes (photos, signatures) from a device URI so the engine can
/// hand them to `RemoteStore::upload_blob`.
pub trait BlobReader: Send + Sync {
    fn read(&self, uri: &str) -> anyhow::Result<Vec<u8>>;
}

/// Convenience bundle so constructors don't take eight arguments.
#[derive(Clone)]
pub struct Environment {
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdSource>,
    pub network: Arc<dyn NetworkInfo>,
    pub secure: Arc<dyn SecureStore>,
    pub crypto: Arc<dyn Crypto>,
    pub blobs: Arc<dyn BlobReader>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_ids_are_prefixed_and_unique() {
        let ids = RandomIds;
        let a = ids.new_local_id("wo");
        let b = ids.new_local_id("wo");
        assert!(a.starts_with("wo-"));
        assert_eq!(a.len(), "wo-".len() + 12);
        assert_ne!(a, b);
    }

    #[test]
    fn test_random_bytes_len() {
        assert_eq!(RandomIds.random_bytes(16).len(), 16);
    }

    #[test]
    fn test_memory_secure_store() {
        let store = MemorySecureStore::new();
        assert_eq!(store.get("k"), None);
        store.put("k", "v");
        assert_eq!(store.get("k").as_deref(), Some("v"));
        store.delete("k");
        assert_eq!(store.get("k"), None);
    }
}
