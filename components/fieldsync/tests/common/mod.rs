/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Shared fakes for the end-to-end scenarios: a hand-cranked clock, a
//! scriptable remote store, and an environment wired for tests.

#![allow(dead_code)]

use fieldsync::ports::{
    BlobReader, Clock, ConnectionType, Crypto, Environment, IdSource, MemorySecureStore,
    NetworkInfo, SecureStore,
};
use fieldsync::records::RecordKind;
use fieldsync::remote::{JsonMap, RemoteError, RemoteStore, ServerRecord};
use fieldsync::settings::SyncSettings;
use fieldsync::telemetry::TestTelemetry;
use fieldsync::token::{RefreshedToken, TokenRefresher, ACCESS_TOKEN_KEY, TOKEN_EXPIRY_KEY};
use fieldsync::store::SyncStore;
use fieldsync::Timestamp;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub struct FakeClock {
    now_ms: AtomicU64,
}

impl FakeClock {
    pub fn at(ms: u64) -> Arc<Self> {
        Arc::new(Self {
            now_ms: AtomicU64::new(ms),
        })
    }
    pub fn set(&self, ms: u64) {
        self.now_ms.store(ms, Ordering::SeqCst);
    }
    pub fn advance(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.now_ms.load(Ordering::SeqCst))
    }
    fn sleep(&self, _ms: u64) {}
}

/// Deterministic ids: `wo-t1`, `asset-t2`, ...
pub struct FixedIds {
    counter: AtomicU32,
}

impl FixedIds {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            counter: AtomicU32::new(0),
        })
    }
}

impl IdSource for FixedIds {
    fn new_local_id(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-t{}", prefix, n)
    }
    fn random_bytes(&self, n: usize) -> Vec<u8> {
        vec![0x42; n]
    }
}

pub struct FakeNetwork {
    online: AtomicBool,
    connection: Mutex<ConnectionType>,
}

impl FakeNetwork {
    pub fn wifi() -> Arc<Self> {
        Arc::new(Self {
            online: AtomicBool::new(true),
            connection: Mutex::new(ConnectionType::Wifi),
        })
    }
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
    pub fn set_connection(&self, connection: ConnectionType) {
        *self.connection.lock().unwrap() = connection;
    }
}

impl NetworkInfo for FakeNetwork {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
    fn connection_type(&self) -> ConnectionType {
        *self.connection.lock().unwrap()
    }
}

/// Not remotely SHA-256, but deterministic, which is all the matching logic
/// needs.
pub struct FakeCrypto;

impl Crypto for FakeCrypto {
    fn sha256_hex(&self, data: &[u8]) -> String {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in data {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        format!("{:016x}", hash)
    }
}

pub struct FakeBlobs {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl FakeBlobs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            files: Mutex::new(HashMap::new()),
        })
    }
    pub fn insert(&self, uri: &str, bytes: Vec<u8>) {
        self.files.lock().unwrap().insert(uri.to_string(), bytes);
    }
}

impl BlobReader for FakeBlobs {
    fn read(&self, uri: &str) -> anyhow::Result<Vec<u8>> {
        Ok(self
            .files
            .lock()
            .unwrap()
            .get(uri)
            .cloned()
            .unwrap_or_else(|| uri.as_bytes().to_vec()))
    }
}

pub struct FakeRefresher;

impl TokenRefresher for FakeRefresher {
    fn refresh(&self, _refresh_token: &str) -> anyhow::Result<RefreshedToken> {
        anyhow::bail!("refresh endpoint not reachable in tests")
    }
}

#[derive(Clone, Copy, Debug)]
pub enum FailKind {
    Network,
    Timeout,
    Http(u16),
}

/// An in-memory stand-in for the real service. Scriptable failures, a log
/// of everything upserted, and a monotonically-advancing server clock.
pub struct FakeRemote {
    pull_rows: Mutex<Vec<(RecordKind, ServerRecord)>>,
    pub upserts: Mutex<Vec<(RecordKind, JsonMap)>>,
    pub uploaded_blobs: Mutex<Vec<(String, usize)>>,
    fail_next_upserts: Mutex<u32>,
    fail_next_fetches: Mutex<u32>,
    fail_kind: Mutex<FailKind>,
    next_server_id: AtomicU32,
    server_now_ms: AtomicU64,
    fetch_delay_ms: AtomicU64,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pull_rows: Mutex::new(Vec::new()),
            upserts: Mutex::new(Vec::new()),
            uploaded_blobs: Mutex::new(Vec::new()),
            fail_next_upserts: Mutex::new(0),
            fail_next_fetches: Mutex::new(0),
            fail_kind: Mutex::new(FailKind::Network),
            next_server_id: AtomicU32::new(0),
            server_now_ms: AtomicU64::new(1000),
            fetch_delay_ms: AtomicU64::new(0),
        })
    }

    /// Make every fetch block for a while; lets tests overlap two syncs.
    pub fn set_fetch_delay(&self, ms: u64) {
        self.fetch_delay_ms.store(ms, Ordering::SeqCst);
    }

    /// Queue a row for the next pull of `kind`.
    pub fn add_pull_row(&self, kind: RecordKind, id: &str, updated_at_ms: u64, fields: Value) {
        let Value::Object(fields) = fields else {
            panic!("fields must be an object");
        };
        self.pull_rows.lock().unwrap().push((
            kind,
            ServerRecord {
                id: id.to_string(),
                updated_at: Timestamp(updated_at_ms),
                fields,
            },
        ));
    }

    pub fn fail_upserts(&self, count: u32, kind: FailKind) {
        *self.fail_next_upserts.lock().unwrap() = count;
        *self.fail_kind.lock().unwrap() = kind;
    }

    pub fn fail_fetches(&self, count: u32, kind: FailKind) {
        *self.fail_next_fetches.lock().unwrap() = count;
        *self.fail_kind.lock().unwrap() = kind;
    }

    /// How many fresh server ids were handed out.
    pub fn created_count(&self) -> u32 {
        self.next_server_id.load(Ordering::SeqCst)
    }

    pub fn upsert_count(&self) -> usize {
        self.upserts.lock().unwrap().len()
    }

    fn make_error(&self) -> RemoteError {
        match *self.fail_kind.lock().unwrap() {
            FailKind::Network => RemoteError::network("network request failed"),
            FailKind::Timeout => RemoteError::timeout("request timed out"),
            FailKind::Http(401) => RemoteError::http(401, "JWT expired"),
            FailKind::Http(status) => RemoteError::http(status, "server said no"),
        }
    }
}

impl RemoteStore for FakeRemote {
    fn fetch_since(
        &self,
        kind: RecordKind,
        since: Option<Timestamp>,
    ) -> Result<Vec<ServerRecord>, RemoteError> {
        let delay = self.fetch_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(std::time::Duration::from_millis(delay));
        }
        {
            let mut fails = self.fail_next_fetches.lock().unwrap();
            if *fails > 0 {
                *fails -= 1;
                return Err(self.make_error());
            }
        }
        Ok(self
            .pull_rows
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, row)| *k == kind && since.map_or(true, |cursor| row.updated_at > cursor))
            .map(|(_, row)| row.clone())
            .collect())
    }

    fn upsert(&self, kind: RecordKind, body: &JsonMap) -> Result<ServerRecord, RemoteError> {
        {
            let mut fails = self.fail_next_upserts.lock().unwrap();
            if *fails > 0 {
                *fails -= 1;
                return Err(self.make_error());
            }
        }
        self.upserts.lock().unwrap().push((kind, body.clone()));
        let id = match body.get("id").and_then(Value::as_str) {
            Some(existing) => existing.to_string(),
            None => format!("S{}", self.next_server_id.fetch_add(1, Ordering::SeqCst) + 1),
        };
        let updated_at = Timestamp(self.server_now_ms.fetch_add(1000, Ordering::SeqCst) + 1000);
        let mut fields = body.clone();
        fields.remove("id");
        Ok(ServerRecord {
            id,
            updated_at,
            fields,
        })
    }

    fn upload_blob(&self, path: &str, bytes: &[u8]) -> Result<String, RemoteError> {
        self.uploaded_blobs
            .lock()
            .unwrap()
            .push((path.to_string(), bytes.len()));
        Ok(format!("https://cdn.example.com/{}", path))
    }
}

pub struct Harness {
    pub store: SyncStore,
    pub remote: Arc<FakeRemote>,
    pub clock: Arc<FakeClock>,
    pub network: Arc<FakeNetwork>,
    pub secure: Arc<MemorySecureStore>,
    pub telemetry: Arc<TestTelemetry>,
    pub blobs: Arc<FakeBlobs>,
    pub ids: Arc<FixedIds>,
}

pub fn harness() -> Harness {
    let clock = FakeClock::at(50_000);
    let remote = FakeRemote::new();
    let network = FakeNetwork::wifi();
    let secure = Arc::new(MemorySecureStore::new());
    let telemetry = Arc::new(TestTelemetry::new());
    let blobs = FakeBlobs::new();
    let ids = FixedIds::new();

    // A signed-in device with a comfortably fresh token.
    secure.put(ACCESS_TOKEN_KEY, "test-access-token");
    secure.put(TOKEN_EXPIRY_KEY, "99999999999");

    let env = Environment {
        clock: Arc::clone(&clock) as Arc<dyn Clock>,
        ids: Arc::clone(&ids) as Arc<dyn IdSource>,
        network: Arc::clone(&network) as Arc<dyn NetworkInfo>,
        secure: Arc::clone(&secure) as Arc<dyn SecureStore>,
        crypto: Arc::new(FakeCrypto),
        blobs: Arc::clone(&blobs) as Arc<dyn BlobReader>,
    };
    let store = SyncStore::new_in_memory(
        Arc::clone(&remote) as Arc<dyn RemoteStore>,
        Arc::new(FakeRefresher),
        env,
        Arc::clone(&telemetry) as Arc<dyn fieldsync::telemetry::TelemetrySink>,
        SyncSettings::default(),
    )
    .expect("store should open");

    Harness {
        store,
        remote,
        clock,
        network,
        secure,
        telemetry,
        blobs,
        ids,
    }
}
