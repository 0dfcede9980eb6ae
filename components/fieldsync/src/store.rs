/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The surface the application consumes.
//!
//! One `SyncStore` per database. `perform_sync` runs under a single-flight
//! lock: a second caller (background schedule racing a manual pull) doesn't
//! start a second cycle, it waits for the running one and gets its result.
//! Status reads touch only the database briefly and never the sync lock, so
//! the UI stays responsive mid-cycle.

use crate::db::SyncDb;
use crate::error::Result;
use crate::ports::Environment;
use crate::queue::{self, RetryEntry};
use crate::records::SyncEnvelope;
use crate::remote::RemoteStore;
use crate::settings::SyncSettings;
use crate::sync::engine::{SyncEngine, SyncResult, LAST_ERROR_KEY, LAST_SYNC_AT_KEY};
use crate::telemetry::TelemetrySink;
use crate::token::{TokenManager, TokenRefresher};
use interrupt_support::InterruptFlag;
use parking_lot::{Condvar, Mutex};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use types::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Syncing,
    Error,
    Offline,
}

/// Point-in-time snapshot handed to status readers and subscribers. A
/// subscriber callback should consume this snapshot rather than calling
/// back into the store - it may be invoked while internal locks are held.
#[derive(Debug, Clone)]
pub struct StoreStatus {
    pub state: SyncState,
    pub last_sync_at: Option<Timestamp>,
    pub pending_changes: u32,
    pub error: Option<String>,
}

pub type StateCallback = Box<dyn Fn(&StoreStatus) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

struct FlightState {
    in_flight: bool,
    last_result: Option<SyncResult>,
}

struct StoreState {
    flight: Mutex<FlightState>,
    flight_done: Condvar,
    subscribers: Mutex<Vec<(u64, StateCallback)>>,
    next_subscriber_id: AtomicU64,
}

impl StoreState {
    fn new() -> Self {
        Self {
            flight: Mutex::new(FlightState {
                in_flight: false,
                last_result: None,
            }),
            flight_done: Condvar::new(),
            subscribers: Mutex::new(Vec::new()),
            next_subscriber_id: AtomicU64::new(0),
        }
    }

    fn notify(&self, status: &StoreStatus) {
        for (_, callback) in self.subscribers.lock().iter() {
            callback(status);
        }
    }
}

pub struct SyncStore {
    db: Arc<Mutex<SyncDb>>,
    engine: SyncEngine,
    env: Environment,
    interrupt: InterruptFlag,
    state: Arc<StoreState>,
}

impl SyncStore {
    pub fn new(
        path: impl AsRef<Path>,
        remote: Arc<dyn RemoteStore>,
        refresher: Arc<dyn TokenRefresher>,
        env: Environment,
        telemetry: Arc<dyn TelemetrySink>,
        settings: SyncSettings,
    ) -> Result<Self> {
        let db = Arc::new(Mutex::new(SyncDb::open(path)?));
        Ok(Self::with_db(db, remote, refresher, env, telemetry, settings))
    }

    pub fn new_in_memory(
        remote: Arc<dyn RemoteStore>,
        refresher: Arc<dyn TokenRefresher>,
        env: Environment,
        telemetry: Arc<dyn TelemetrySink>,
        settings: SyncSettings,
    ) -> Result<Self> {
        let db = Arc::new(Mutex::new(SyncDb::open_in_memory()?));
        Ok(Self::with_db(db, remote, refresher, env, telemetry, settings))
    }

    fn with_db(
        db: Arc<Mutex<SyncDb>>,
        remote: Arc<dyn RemoteStore>,
        refresher: Arc<dyn TokenRefresher>,
        env: Environment,
        telemetry: Arc<dyn TelemetrySink>,
        settings: SyncSettings,
    ) -> Self {
        let state = Arc::new(StoreState::new());
        let tokens = TokenManager::new(
            Arc::clone(&env.secure),
            refresher,
            Arc::clone(&env.clock),
            &settings,
        );
        let engine = SyncEngine::new(
            Arc::clone(&db),
            remote,
            env.clone(),
            tokens,
            telemetry,
            settings,
        );

        // Record writes (the UI's and the engine's alike) flow out to
        // subscribers as fresh status snapshots.
        {
            let observer_state = Arc::clone(&state);
            let observer_env = env.clone();
            db.lock().add_observer(Box::new(move |sync_db, _kind| {
                let status = build_status(sync_db, &observer_env, &observer_state);
                observer_state.notify(&status);
            }));
        }

        Self {
            db,
            engine,
            env,
            interrupt: InterruptFlag::new(),
            state,
        }
    }

    /// The underlying store, for the application's own reads and writes.
    pub fn db(&self) -> Arc<Mutex<SyncDb>> {
        Arc::clone(&self.db)
    }

    /// Mint the envelope for a row the application is about to create.
    pub fn new_envelope(&self, kind: crate::records::RecordKind) -> SyncEnvelope {
        SyncEnvelope::new_local(
            self.env.ids.new_local_id(kind.id_prefix()),
            self.env.clock.now(),
        )
    }

    /// Run a sync cycle, or join the one already running.
    pub fn perform_sync(&self) -> SyncResult {
        {
            let mut flight = self.state.flight.lock();
            if flight.in_flight {
                log::debug!("sync already in flight; joining");
                while flight.in_flight {
                    self.state.flight_done.wait(&mut flight);
                }
                return flight
                    .last_result
                    .clone()
                    .unwrap_or_else(|| SyncResult {
                        success: false,
                        error: Some("sync produced no result".to_string()),
                        ..Default::default()
                    });
            }
            flight.in_flight = true;
        }
        self.notify_state_change();

        let scope = self.interrupt.begin_scope();
        let result = self.engine.sync(&scope);

        {
            let mut flight = self.state.flight.lock();
            flight.in_flight = false;
            flight.last_result = Some(result.clone());
        }
        self.state.flight_done.notify_all();
        self.notify_state_change();
        result
    }

    /// Ask the in-flight cycle (if any) to stop at its next suspension
    /// point.
    pub fn cancel_sync(&self) {
        self.interrupt.interrupt();
    }

    pub fn get_status(&self) -> StoreStatus {
        let db = self.db.lock();
        build_status(&db, &self.env, &self.state)
    }

    pub fn get_pending_count(&self) -> Result<u32> {
        let db = self.db.lock();
        db.pending_count()
    }

    /// Retry-queue entries that ran out of budget; they need a human.
    pub fn get_blocking_issues(&self) -> Result<Vec<RetryEntry>> {
        let db = self.db.lock();
        queue::blocking_issues(&db)
    }

    pub fn on_state_change(&self, callback: StateCallback) -> SubscriptionId {
        let id = self.state.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.state.subscribers.lock().push((id, callback));
        SubscriptionId(id)
    }

    pub fn cancel_subscription(&self, id: SubscriptionId) {
        self.state.subscribers.lock().retain(|(sid, _)| *sid != id.0);
    }

    /// The platform's network monitor should call this when connectivity
    /// flips, so subscribers hear about offline/online transitions that
    /// happen between syncs.
    pub fn connectivity_changed(&self) {
        self.notify_state_change();
    }

    fn notify_state_change(&self) {
        let status = self.get_status();
        self.state.notify(&status);
    }
}

fn build_status(db: &SyncDb, env: &Environment, state: &StoreState) -> StoreStatus {
    let pending_changes = db.pending_count().unwrap_or(0);
    let last_sync_at = env
        .secure
        .get(LAST_SYNC_AT_KEY)
        .and_then(|s| s.parse::<u64>().ok())
        .map(Timestamp);
    let error = env.secure.get(LAST_ERROR_KEY);
    let in_flight = state.flight.lock().in_flight;

    let sync_state = if !env.network.is_online() {
        SyncState::Offline
    } else if in_flight {
        SyncState::Syncing
    } else if error.is_some() {
        SyncState::Error
    } else {
        SyncState::Idle
    };
    StoreStatus {
        state: sync_state,
        last_sync_at,
        pending_changes,
        error,
    }
}
