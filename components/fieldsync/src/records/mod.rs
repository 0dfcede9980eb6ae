/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The four record families and the sync envelope they share.
//!
//! Domain fields vary per family; the envelope (`guid`, `server_id`,
//! `sync_status`, `local_updated_at`, `server_updated_at`) is identical, and
//! everything the engine does generically - pushing, pulling, merging - goes
//! through the [`SyncRecord`] trait rather than per-family code.

mod asset;
mod meter_reading;
mod photo;
mod work_order;

pub use asset::{Asset, AssetStatus};
pub use meter_reading::MeterReading;
pub use photo::WorkOrderPhoto;
pub use work_order::{FailureType, Priority, WorkOrder, WorkOrderStatus};

use crate::error::{Error, Result};
use crate::remote::JsonMap;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::Row;
use serde_json::Value;
use types::Timestamp;

/// Where a row stands relative to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Matches the last known server state.
    Synced = 0,
    /// Holds local mutations the server hasn't seen.
    Pending = 1,
    /// A divergence was found that needs human review.
    Conflict = 2,
}

impl SyncStatus {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(SyncStatus::Synced),
            1 => Ok(SyncStatus::Pending),
            2 => Ok(SyncStatus::Conflict),
            v => Err(Error::MalformedRecord(format!("bad sync status: {}", v))),
        }
    }
}

impl ToSql for SyncStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(*self as u8 as i64))
    }
}

impl FromSql for SyncStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        SyncStatus::from_u8(value.as_i64()? as u8).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// Which table a record or queue entry belongs to. The string forms double
/// as the local table names and the server collection names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Asset,
    WorkOrder,
    MeterReading,
    WorkOrderPhoto,
}

impl RecordKind {
    /// Parents before children, so foreign keys can be rewritten as we go.
    pub const IN_PUSH_ORDER: [RecordKind; 4] = [
        RecordKind::Asset,
        RecordKind::WorkOrder,
        RecordKind::MeterReading,
        RecordKind::WorkOrderPhoto,
    ];

    pub fn table_name(self) -> &'static str {
        match self {
            RecordKind::Asset => "assets",
            RecordKind::WorkOrder => "work_orders",
            RecordKind::MeterReading => "meter_readings",
            RecordKind::WorkOrderPhoto => "work_order_photos",
        }
    }

    pub fn from_table_name(s: &str) -> Result<Self> {
        match s {
            "assets" => Ok(RecordKind::Asset),
            "work_orders" => Ok(RecordKind::WorkOrder),
            "meter_readings" => Ok(RecordKind::MeterReading),
            "work_order_photos" => Ok(RecordKind::WorkOrderPhoto),
            other => Err(Error::MalformedRecord(format!(
                "unknown record table: {}",
                other
            ))),
        }
    }

    pub fn id_prefix(self) -> &'static str {
        match self {
            RecordKind::Asset => "asset",
            RecordKind::WorkOrder => "wo",
            RecordKind::MeterReading => "mr",
            RecordKind::WorkOrderPhoto => "photo",
        }
    }

    /// The foreign key this kind carries, if any: (field name, parent kind).
    /// Used to translate between local guids and server ids at the sync
    /// boundary.
    pub fn parent_fk(self) -> Option<(&'static str, RecordKind)> {
        match self {
            RecordKind::Asset => None,
            RecordKind::WorkOrder => Some(("asset_id", RecordKind::Asset)),
            RecordKind::MeterReading => Some(("asset_id", RecordKind::Asset)),
            RecordKind::WorkOrderPhoto => Some(("work_order_id", RecordKind::WorkOrder)),
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table_name())
    }
}

/// The sync metadata carried by every row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEnvelope {
    /// Device-local primary key; stable for the life of the row.
    pub guid: String,
    /// Authoritative key, set once the server first acknowledges the row and
    /// never cleared or changed after that.
    pub server_id: Option<String>,
    pub sync_status: SyncStatus,
    pub local_updated_at: Timestamp,
    pub server_updated_at: Option<Timestamp>,
}

impl SyncEnvelope {
    /// Envelope for a row created locally, not yet on the server.
    pub fn new_local(guid: String, now: Timestamp) -> Self {
        Self {
            guid,
            server_id: None,
            sync_status: SyncStatus::Pending,
            local_updated_at: now,
            server_updated_at: None,
        }
    }

    /// Envelope for a row first seen in a pull.
    pub fn new_from_server(guid: String, server_id: String, server_ts: Timestamp) -> Self {
        Self {
            guid,
            server_id: Some(server_id),
            sync_status: SyncStatus::Synced,
            local_updated_at: server_ts,
            server_updated_at: Some(server_ts),
        }
    }

    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self> {
        Ok(Self {
            guid: row.get("guid")?,
            server_id: row.get("server_id")?,
            sync_status: row.get("sync_status")?,
            local_updated_at: row.get("local_updated_at")?,
            server_updated_at: row.get("server_updated_at")?,
        })
    }

    /// Record a local mutation: back to pending, with a per-row monotonic
    /// update time even if the wall clock stalled or went backwards.
    pub fn note_local_change(&mut self, now: Timestamp) {
        self.local_updated_at = Timestamp(std::cmp::max(now.0, self.local_updated_at.0 + 1));
        self.sync_status = SyncStatus::Pending;
    }

    /// First server acknowledgment. Errors if something tries to re-assign a
    /// different server id later - that's invariant-breaking, not mergeable.
    pub fn set_server_id(&mut self, server_id: String) -> Result<()> {
        match &self.server_id {
            None => {
                self.server_id = Some(server_id);
                Ok(())
            }
            Some(existing) if *existing == server_id => Ok(()),
            Some(existing) => Err(Error::EnvelopeViolation(format!(
                "server id for {} already set to {}, refusing {}",
                self.guid, existing, server_id
            ))),
        }
    }

    /// The server's clock only moves forward; ignore regressions.
    pub fn advance_server_updated_at(&mut self, ts: Timestamp) {
        if self.server_updated_at.map_or(true, |cur| ts >= cur) {
            self.server_updated_at = Some(ts);
        }
    }
}

/// What the engine needs from each record family.
pub trait SyncRecord: Sized {
    const KIND: RecordKind;

    fn envelope(&self) -> &SyncEnvelope;
    fn envelope_mut(&mut self) -> &mut SyncEnvelope;

    fn from_row(row: &Row<'_>) -> Result<Self>;

    /// Write this row (insert or replace, keyed by guid).
    fn persist(&self, conn: &rusqlite::Connection) -> Result<()>;

    /// Domain fields as a flat snake_case map in server naming. Foreign keys
    /// are still local guids at this point; the engine rewrites them to
    /// server ids just before upsert.
    fn to_server_fields(&self) -> JsonMap;

    /// Overwrite domain fields from a server (or merged) field map. Keys the
    /// map doesn't carry are left alone.
    fn apply_server_fields(&mut self, fields: &JsonMap) -> Result<()>;

    /// Build a fresh local row from a pulled server record.
    fn from_server_fields(envelope: SyncEnvelope, fields: &JsonMap) -> Result<Self>;

    /// The parent this row must not be pushed before: (kind, fk field name,
    /// local guid of the parent).
    fn parent_ref(&self) -> Option<(RecordKind, &'static str, &str)> {
        None
    }

    /// Retry-queue priority; lower pushes earlier.
    fn push_priority(&self) -> i64 {
        match Self::KIND {
            RecordKind::WorkOrderPhoto => 300,
            _ => 200,
        }
    }
}

// JSON map accessors used by apply_server_fields/merging. Server payloads
// are allowed to omit keys or carry null; both read as None.

pub(crate) fn field_str(fields: &JsonMap, key: &str) -> Option<String> {
    fields.get(key).and_then(Value::as_str).map(str::to_string)
}

pub(crate) fn field_i64(fields: &JsonMap, key: &str) -> Option<i64> {
    fields.get(key).and_then(Value::as_i64)
}

pub(crate) fn field_f64(fields: &JsonMap, key: &str) -> Option<f64> {
    fields.get(key).and_then(Value::as_f64)
}

pub(crate) fn field_bool(fields: &JsonMap, key: &str) -> Option<bool> {
    fields.get(key).and_then(Value::as_bool)
}

pub(crate) fn field_timestamp(fields: &JsonMap, key: &str) -> Option<Timestamp> {
    fields
        .get(key)
        .and_then(Value::as_str)
        .and_then(crate::remote::parse_iso8601)
}

pub(crate) fn opt_str_value(v: &Option<String>) -> Value {
    match v {
        Some(s) => Value::String(s.clone()),
        None => Value::Null,
    }
}

pub(crate) fn opt_ts_value(v: &Option<Timestamp>) -> Value {
    match v {
        Some(ts) => Value::String(crate::remote::format_iso8601(*ts)),
        None => Value::Null,
    }
}

/// Implements the string/SQL/JSON plumbing for a TEXT-backed enum.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn from_str(s: &str) -> $crate::error::Result<Self> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err($crate::error::Error::MalformedRecord(format!(
                        concat!("bad ", stringify!($name), ": {}"),
                        other
                    ))),
                }
            }
        }

        impl ::rusqlite::types::ToSql for $name {
            fn to_sql(&self) -> ::rusqlite::Result<::rusqlite::types::ToSqlOutput<'_>> {
                Ok(self.as_str().into())
            }
        }

        impl ::rusqlite::types::FromSql for $name {
            fn column_result(
                value: ::rusqlite::types::ValueRef<'_>,
            ) -> ::rusqlite::types::FromSqlResult<Self> {
                $name::from_str(value.as_str()?)
                    .map_err(|e| ::rusqlite::types::FromSqlError::Other(Box::new(e)))
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

pub(crate) use text_enum;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_local_change_is_monotonic() {
        let mut env = SyncEnvelope::new_local("wo-1".into(), Timestamp(1000));
        env.sync_status = SyncStatus::Synced;
        // Clock going backwards still advances the row time.
        env.note_local_change(Timestamp(500));
        assert_eq!(env.local_updated_at, Timestamp(1001));
        assert_eq!(env.sync_status, SyncStatus::Pending);
        env.note_local_change(Timestamp(5000));
        assert_eq!(env.local_updated_at, Timestamp(5000));
    }

    #[test]
    fn test_server_id_set_once() {
        let mut env = SyncEnvelope::new_local("wo-1".into(), Timestamp(1000));
        env.set_server_id("S1".into()).unwrap();
        // Idempotent for the same id.
        env.set_server_id("S1".into()).unwrap();
        assert!(env.set_server_id("S2".into()).is_err());
        assert_eq!(env.server_id.as_deref(), Some("S1"));
    }

    #[test]
    fn test_server_updated_at_never_regresses() {
        let mut env = SyncEnvelope::new_local("wo-1".into(), Timestamp(1000));
        env.advance_server_updated_at(Timestamp(2000));
        env.advance_server_updated_at(Timestamp(1500));
        assert_eq!(env.server_updated_at, Some(Timestamp(2000)));
        env.advance_server_updated_at(Timestamp(2500));
        assert_eq!(env.server_updated_at, Some(Timestamp(2500)));
    }
}
