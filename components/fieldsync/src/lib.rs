/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Offline-first sync core for the quarry field-maintenance app.
//!
//! The device's SQLite store is the source of truth; this crate reconciles
//! it with the authoritative service, tolerating weeks of disconnection,
//! flaky networks and concurrent edits from other devices. The app wires in
//! its platform pieces (network monitor, secure store, HTTP client, crypto)
//! through the port traits in [`ports`] and [`remote`], and talks to
//! [`store::SyncStore`] for everything else.

#![allow(unknown_lints)]
#![warn(rust_2018_idioms)]

pub mod classify;
pub mod db;
pub mod error;
pub mod ports;
pub mod query;
pub mod queue;
pub mod records;
pub mod remote;
pub mod schema;
pub mod settings;
pub mod store;
pub mod sync;
pub mod telemetry;
pub mod token;

pub use db::SyncDb;
pub use error::{Error, ErrorCategory, Result};
pub use query::{Filter, QueryOptions, QueryValue, SortDirection};
pub use records::{
    Asset, AssetStatus, FailureType, MeterReading, Priority, RecordKind, SyncEnvelope, SyncRecord,
    SyncStatus, WorkOrder, WorkOrderPhoto, WorkOrderStatus,
};
pub use remote::{RemoteError, RemoteStore, ServerRecord};
pub use settings::SyncSettings;
pub use store::{StoreStatus, SyncState, SyncStore};
pub use sync::{SyncEngine, SyncResult};
pub use token::{RefreshedToken, TokenRefresher};
pub use types::Timestamp;
