/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Append-only audit trail of conflict resolutions.
//!
//! Every merge that found real divergence lands here, auto-resolved or not,
//! with full before/after snapshots so a supervisor can reconstruct what
//! the merge did months later. Nothing updates these rows; the only delete
//! is the retention prune at the end of a successful cycle.

use super::merge::{Escalation, FieldResolution, MergeOutcome};
use crate::db::SyncDb;
use crate::error::Result;
use crate::records::RecordKind;
use crate::remote::JsonMap;
use rusqlite::{named_params, Row};
use serde_json::Value;
use sql_support::ConnExt;
use types::Timestamp;

#[derive(Debug, Clone)]
pub struct ConflictLogEntry {
    pub id: i64,
    pub at: Timestamp,
    pub kind: RecordKind,
    pub record_guid: String,
    pub resolutions: Vec<FieldResolution>,
    pub escalations: Vec<Escalation>,
    pub auto_resolved: bool,
    pub local_snapshot: Value,
    pub server_snapshot: Value,
}

impl ConflictLogEntry {
    fn from_row(row: &Row<'_>) -> Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            at: row.get("at")?,
            kind: RecordKind::from_table_name(&row.get::<_, String>("record_kind")?)?,
            record_guid: row.get("record_guid")?,
            resolutions: serde_json::from_str(&row.get::<_, String>("resolutions")?)?,
            escalations: serde_json::from_str(&row.get::<_, String>("escalations")?)?,
            auto_resolved: row.get("auto_resolved")?,
            local_snapshot: serde_json::from_str(&row.get::<_, String>("local_snapshot")?)?,
            server_snapshot: serde_json::from_str(&row.get::<_, String>("server_snapshot")?)?,
        })
    }
}

/// Record one resolved conflict. Runs inside the same transaction that
/// applies the merged fields, so the log can't disagree with the data.
pub fn append(
    conn: &impl ConnExt,
    at: Timestamp,
    kind: RecordKind,
    record_guid: &str,
    outcome: &MergeOutcome,
    local_snapshot: &JsonMap,
    server_snapshot: &JsonMap,
) -> Result<()> {
    conn.execute_cached(
        "INSERT INTO conflict_log (
            at, record_kind, record_guid, resolutions, escalations,
            auto_resolved, local_snapshot, server_snapshot
        ) VALUES (
            :at, :kind, :guid, :resolutions, :escalations,
            :auto_resolved, :local_snapshot, :server_snapshot
        )",
        named_params! {
            ":at": at,
            ":kind": kind.table_name(),
            ":guid": record_guid,
            ":resolutions": serde_json::to_string(&outcome.resolutions)?,
            ":escalations": serde_json::to_string(&outcome.escalations)?,
            ":auto_resolved": outcome.auto_resolved(),
            ":local_snapshot": serde_json::to_string(local_snapshot)?,
            ":server_snapshot": serde_json::to_string(server_snapshot)?,
        },
    )?;
    Ok(())
}

/// Newest first, for the review UI.
pub fn recent(db: &SyncDb, limit: u32) -> Result<Vec<ConflictLogEntry>> {
    db.query_rows_and_then_cached(
        "SELECT * FROM conflict_log ORDER BY at DESC, id DESC LIMIT :limit",
        named_params! { ":limit": limit },
        |row| ConflictLogEntry::from_row(row),
    )
}

pub fn entries_for_record(db: &SyncDb, record_guid: &str) -> Result<Vec<ConflictLogEntry>> {
    db.query_rows_and_then_cached(
        "SELECT * FROM conflict_log WHERE record_guid = :guid ORDER BY at ASC, id ASC",
        named_params! { ":guid": record_guid },
        |row| ConflictLogEntry::from_row(row),
    )
}

/// Drop entries past the retention window. Returns how many went.
pub fn prune(db: &SyncDb, now: Timestamp, retention_ms: u64) -> Result<u32> {
    let cutoff = now - std::time::Duration::from_millis(retention_ms);
    let deleted = db.execute_cached(
        "DELETE FROM conflict_log WHERE at < :cutoff",
        named_params! { ":cutoff": cutoff },
    )?;
    if deleted > 0 {
        log::debug!("pruned {} conflict-log entries", deleted);
    }
    Ok(deleted as u32)
}
