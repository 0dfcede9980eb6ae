/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Fieldsync schema, version 1.
//!
//! Seven tables:
//!
//! - the four record tables (`assets`, `work_orders`, `meter_readings`,
//!   `work_order_photos`), each carrying its domain columns plus the shared
//!   sync envelope (`guid`, `server_id`, `sync_status`, `local_updated_at`,
//!   `server_updated_at`);
//! - `retry_queue`, the durable queue of failed pushes and blob uploads;
//! - `conflict_log`, the append-only audit trail of merges;
//! - `sync_meta`, a small key-value table for bookkeeping that doesn't
//!   belong in the host's secure store.
//!
//! `sync_status` is stored as an integer (0 synced / 1 pending / 2
//! conflict). Foreign keys between record tables hold *local* guids; server
//! ids only ever appear in the `server_id` column and on the wire.

use rusqlite::Connection;
use sql_support::open_database::{ConnectionInitializer, Result};

pub const VERSION: u32 = 1;

const ENVELOPE_SQL: &str = "
    guid                TEXT NOT NULL PRIMARY KEY,
    server_id           TEXT UNIQUE,
    sync_status         INTEGER NOT NULL DEFAULT 1,
    local_updated_at    INTEGER NOT NULL,
    server_updated_at   INTEGER
";

lazy_static::lazy_static! {
    static ref CREATE_SCHEMA_SQL: String = format!(
        "CREATE TABLE assets (
            {envelope},
            asset_number            TEXT NOT NULL,
            site_id                 TEXT NOT NULL,
            name                    TEXT NOT NULL,
            description             TEXT,
            category                TEXT,
            status                  TEXT NOT NULL,
            location                TEXT,
            meter_type              TEXT,
            meter_unit              TEXT,
            meter_current_reading   REAL,
            created_at              INTEGER NOT NULL
        );

        CREATE TABLE work_orders (
            {envelope},
            wo_number               TEXT NOT NULL,
            site_id                 TEXT NOT NULL,
            asset_id                TEXT,
            title                   TEXT NOT NULL,
            description             TEXT,
            priority                TEXT NOT NULL,
            status                  TEXT NOT NULL,
            assigned_to             TEXT,
            due_at                  INTEGER,
            started_at              INTEGER,
            completed_at            INTEGER,
            completed_by            TEXT,
            completion_notes        TEXT,
            failure_type            TEXT NOT NULL DEFAULT 'none',
            time_spent_minutes      INTEGER NOT NULL DEFAULT 0,
            signature_url           TEXT,
            signature_at            INTEGER,
            signature_hash          TEXT,
            signature_code          TEXT,
            voice_note_url          TEXT,
            needs_enrichment        INTEGER NOT NULL DEFAULT 0,
            is_quick_log            INTEGER NOT NULL DEFAULT 0,
            created_at              INTEGER NOT NULL
        );

        CREATE TABLE meter_readings (
            {envelope},
            asset_id                TEXT NOT NULL,
            reading_value           REAL NOT NULL,
            reading_at              INTEGER NOT NULL,
            recorded_by             TEXT,
            notes                   TEXT
        );

        CREATE TABLE work_order_photos (
            {envelope},
            work_order_id           TEXT NOT NULL,
            local_uri               TEXT NOT NULL,
            remote_url              TEXT,
            caption                 TEXT,
            taken_at                INTEGER NOT NULL
        );

        CREATE INDEX idx_assets_status ON assets(sync_status);
        CREATE INDEX idx_work_orders_status ON work_orders(sync_status);
        CREATE INDEX idx_work_orders_asset ON work_orders(asset_id);
        CREATE INDEX idx_meter_readings_status ON meter_readings(sync_status);
        CREATE INDEX idx_meter_readings_asset ON meter_readings(asset_id);
        CREATE INDEX idx_photos_status ON work_order_photos(sync_status);
        CREATE INDEX idx_photos_work_order ON work_order_photos(work_order_id);

        CREATE TABLE retry_queue (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            record_kind         TEXT NOT NULL,
            record_guid         TEXT NOT NULL,
            operation           TEXT NOT NULL,
            priority            INTEGER NOT NULL,
            attempt_count       INTEGER NOT NULL DEFAULT 0,
            max_attempts        INTEGER NOT NULL,
            next_eligible_at    INTEGER NOT NULL,
            last_attempt_at     INTEGER,
            leased_at           INTEGER,
            last_error          TEXT,
            error_category      TEXT,
            status              TEXT NOT NULL DEFAULT 'pending',
            enqueued_at         INTEGER NOT NULL,
            UNIQUE (record_kind, record_guid, operation)
        );

        CREATE INDEX idx_retry_queue_eligible
            ON retry_queue(status, next_eligible_at, priority, enqueued_at);

        CREATE TABLE conflict_log (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            at                  INTEGER NOT NULL,
            record_kind         TEXT NOT NULL,
            record_guid         TEXT NOT NULL,
            resolutions         TEXT NOT NULL,
            escalations         TEXT NOT NULL,
            auto_resolved       INTEGER NOT NULL,
            local_snapshot      TEXT NOT NULL,
            server_snapshot     TEXT NOT NULL
        );

        CREATE INDEX idx_conflict_log_at ON conflict_log(at);

        CREATE TABLE sync_meta (
            key                 TEXT PRIMARY KEY,
            value               NOT NULL
        ) WITHOUT ROWID;",
        envelope = ENVELOPE_SQL,
    );
}

pub struct FieldsyncConnectionInitializer;

impl ConnectionInitializer for FieldsyncConnectionInitializer {
    const NAME: &'static str = "fieldsync db";
    const END_VERSION: u32 = VERSION;

    fn prepare(&self, conn: &Connection) -> Result<()> {
        // WAL keeps queue journaling cheap; the device has no tmp partition
        // worth spilling to. journal_mode returns the resulting mode as a
        // row, so it can't go through execute_batch.
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA temp_store = 2;")?;
        Ok(())
    }

    fn init(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(&CREATE_SCHEMA_SQL)?;
        Ok(())
    }

    fn upgrade_from(&self, _conn: &Connection, version: u32) -> Result<()> {
        Err(sql_support::open_database::Error::IncompatibleVersion(
            version,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sql_support::open_database::open_memory_database;
    use sql_support::ConnExt;

    #[test]
    fn test_create_schema() {
        let conn = open_memory_database(&FieldsyncConnectionInitializer).unwrap();
        let tables: Vec<String> = conn
            .query_rows_and_then_cached(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
                [],
                |row| row.get::<_, String>(0),
            )
            .unwrap();
        assert_eq!(
            tables,
            vec![
                "assets",
                "conflict_log",
                "meter_readings",
                "retry_queue",
                "sync_meta",
                "work_order_photos",
                "work_orders",
            ]
        );
        let version: u32 = ConnExt::query_one(&conn, "PRAGMA user_version").unwrap();
        assert_eq!(version, VERSION);
    }
}
