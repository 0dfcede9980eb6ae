/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The durable retry queue.
//!
//! Every failed push or blob upload lives here as exactly one row keyed by
//! (record kind, record guid, operation). Entries wait out an exponential
//! full-jitter backoff, get leased while a cycle works on them, and move to
//! `failed` once their budget is spent - at which point they stop retrying
//! and surface as blocking issues instead.
//!
//! Each state change is a single SQL statement against the same database as
//! the records themselves, so a crash can interrupt an attempt but never
//! lose or duplicate an entry.

use crate::classify::Classified;
use crate::db::SyncDb;
use crate::error::Result;
use crate::records::{text_enum, RecordKind};
use rusqlite::{named_params, Row};
use sql_support::ConnExt;
use types::Timestamp;

pub const BACKOFF_BASE_MS: u64 = 1000;
const BACKOFF_CAP_TRANSIENT_MS: u64 = 5 * 60 * 1000;
const BACKOFF_CAP_RATE_LIMITED_MS: u64 = 15 * 60 * 1000;
const BACKOFF_CAP_UNKNOWN_MS: u64 = 30 * 1000;

/// Priority for photo blob uploads; they cost real bandwidth, so everything
/// else goes first.
pub const BLOB_UPLOAD_PRIORITY: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOperation {
    Push,
    UploadBlob,
}

text_enum!(RetryOperation {
    Push => "push",
    UploadBlob => "upload_blob",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStatus {
    Pending,
    InProgress,
    Failed,
}

text_enum!(RetryStatus {
    Pending => "pending",
    InProgress => "in_progress",
    Failed => "failed",
});

#[derive(Debug, Clone)]
pub struct RetryEntry {
    pub id: i64,
    pub kind: RecordKind,
    pub record_guid: String,
    pub operation: RetryOperation,
    pub priority: i64,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub next_eligible_at: Timestamp,
    pub last_attempt_at: Option<Timestamp>,
    pub leased_at: Option<Timestamp>,
    pub last_error: Option<String>,
    pub error_category: Option<String>,
    pub status: RetryStatus,
    pub enqueued_at: Timestamp,
}

impl RetryEntry {
    fn from_row(row: &Row<'_>) -> Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            kind: RecordKind::from_table_name(&row.get::<_, String>("record_kind")?)?,
            record_guid: row.get("record_guid")?,
            operation: row.get("operation")?,
            priority: row.get("priority")?,
            attempt_count: row.get("attempt_count")?,
            max_attempts: row.get("max_attempts")?,
            next_eligible_at: row.get("next_eligible_at")?,
            last_attempt_at: row.get("last_attempt_at")?,
            leased_at: row.get("leased_at")?,
            last_error: row.get("last_error")?,
            error_category: row.get("error_category")?,
            status: row.get("status")?,
            enqueued_at: row.get("enqueued_at")?,
        })
    }
}

/// What `mark_failed` decided to do with the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    /// Still has budget; will become eligible at the given time.
    Scheduled(Timestamp),
    /// Out of budget (or the error isn't retryable); now a blocking issue.
    Exhausted,
}

/// Full-jitter exponential backoff: `min(cap, base * 2^(attempt-1)) *
/// (0.5 + jitter)` with `jitter` in [0, 0.5). Pure so tests can pin the
/// jitter; callers draw it from `rand`.
pub fn backoff_delay_ms(bucket: &str, attempt: u32, jitter: f64) -> u64 {
    let cap = match bucket {
        "transient-rate-limited" => BACKOFF_CAP_RATE_LIMITED_MS,
        "unknown" => BACKOFF_CAP_UNKNOWN_MS,
        _ => BACKOFF_CAP_TRANSIENT_MS,
    };
    let exponent = attempt.saturating_sub(1).min(20);
    let raw = BACKOFF_BASE_MS.saturating_mul(1u64 << exponent).min(cap);
    (raw as f64 * (0.5 + jitter.clamp(0.0, 0.4999))) as u64
}

/// Record a fresh failure for a row that has no queue entry yet. The first
/// attempt has already happened (that's what failed), so the entry starts at
/// `attempt_count = 1`. Crash-safe against double-enqueue via the unique
/// key.
pub fn enqueue_failure(
    db: &SyncDb,
    kind: RecordKind,
    record_guid: &str,
    operation: RetryOperation,
    priority: i64,
    classified: &Classified,
    now: Timestamp,
    jitter: f64,
) -> Result<RetryDisposition> {
    // A budget of one means the attempt that just failed was the only one
    // allowed; park it with the non-retryable errors.
    let (status, disposition) = if classified.should_retry && classified.max_retries > 1 {
        let delay = backoff_delay_ms(classified.category.bucket(), 1, jitter);
        let next = now + std::time::Duration::from_millis(delay);
        (RetryStatus::Pending, RetryDisposition::Scheduled(next))
    } else {
        (RetryStatus::Failed, RetryDisposition::Exhausted)
    };
    let next_eligible_at = match disposition {
        RetryDisposition::Scheduled(ts) => ts,
        RetryDisposition::Exhausted => now,
    };
    db.execute_cached(
        "INSERT INTO retry_queue (
            record_kind, record_guid, operation, priority, attempt_count,
            max_attempts, next_eligible_at, last_attempt_at, leased_at,
            last_error, error_category, status, enqueued_at
        ) VALUES (
            :kind, :guid, :operation, :priority, 1,
            :max_attempts, :next_eligible_at, :now, NULL,
            :last_error, :category, :status, :now
        )
        ON CONFLICT (record_kind, record_guid, operation) DO UPDATE SET
            attempt_count = attempt_count + 1,
            next_eligible_at = excluded.next_eligible_at,
            last_attempt_at = excluded.last_attempt_at,
            leased_at = NULL,
            last_error = excluded.last_error,
            error_category = excluded.error_category,
            status = excluded.status",
        named_params! {
            ":kind": kind.table_name(),
            ":guid": record_guid,
            ":operation": operation,
            ":priority": priority,
            ":max_attempts": classified.max_retries,
            ":next_eligible_at": next_eligible_at,
            ":now": now,
            ":last_error": classified.technical_message,
            ":category": classified.category.bucket(),
            ":status": status,
        },
    )?;
    Ok(disposition)
}

/// Pending entries whose backoff has elapsed, most urgent first, bounded so
/// one cycle can't spend forever on retries.
pub fn get_retryable_items(db: &SyncDb, now: Timestamp, limit: u32) -> Result<Vec<RetryEntry>> {
    db.query_rows_and_then_cached(
        "SELECT * FROM retry_queue
         WHERE status = 'pending' AND next_eligible_at <= :now
         ORDER BY priority ASC, enqueued_at ASC
         LIMIT :limit",
        named_params! { ":now": now, ":limit": limit },
        |row| RetryEntry::from_row(row),
    )
}

/// Take the lease on an entry for this cycle.
pub fn mark_in_progress(db: &SyncDb, id: i64, now: Timestamp) -> Result<()> {
    db.execute_cached(
        "UPDATE retry_queue SET status = 'in_progress', leased_at = :now WHERE id = :id",
        named_params! { ":id": id, ":now": now },
    )?;
    Ok(())
}

/// The push went through; the entry has served its purpose.
pub fn mark_completed(db: &SyncDb, id: i64) -> Result<()> {
    db.execute_cached(
        "DELETE FROM retry_queue WHERE id = :id",
        named_params! { ":id": id },
    )?;
    Ok(())
}

/// Give the lease back without consuming an attempt (cancellation, or a
/// parent that still lacks a server id).
pub fn release_lease(db: &SyncDb, id: i64) -> Result<()> {
    db.execute_cached(
        "UPDATE retry_queue SET status = 'pending', leased_at = NULL
         WHERE id = :id AND status = 'in_progress'",
        named_params! { ":id": id },
    )?;
    Ok(())
}

/// Release every live lease, attempt uncounted. Cancellation path: the
/// cycle stops mid-queue and whatever it was holding goes back to pending.
pub fn release_all_leases(db: &SyncDb) -> Result<u32> {
    let changed = db.execute_cached(
        "UPDATE retry_queue SET status = 'pending', leased_at = NULL
         WHERE status = 'in_progress'",
        [],
    )?;
    Ok(changed as u32)
}

/// Put every lease abandoned by a dead cycle back up for grabs.
pub fn recover_stale_items(db: &SyncDb, now: Timestamp, lease_timeout_ms: u64) -> Result<u32> {
    let cutoff = now - std::time::Duration::from_millis(lease_timeout_ms);
    let changed = db.execute_cached(
        "UPDATE retry_queue SET status = 'pending', leased_at = NULL
         WHERE status = 'in_progress' AND (leased_at IS NULL OR leased_at <= :cutoff)",
        named_params! { ":cutoff": cutoff },
    )?;
    if changed > 0 {
        log::info!("recovered {} stale retry-queue leases", changed);
    }
    Ok(changed as u32)
}

/// Record an attempt that failed. Either schedules the next attempt or, once
/// the budget is spent (or the error isn't retryable at all), parks the
/// entry as `failed`.
pub fn mark_failed(
    db: &SyncDb,
    entry: &RetryEntry,
    classified: &Classified,
    now: Timestamp,
    jitter: f64,
) -> Result<RetryDisposition> {
    let attempt = entry.attempt_count + 1;
    let budget = entry.max_attempts.min(classified.max_retries.max(1));
    let disposition = if !classified.should_retry || attempt >= budget {
        RetryDisposition::Exhausted
    } else {
        let delay = backoff_delay_ms(classified.category.bucket(), attempt, jitter);
        RetryDisposition::Scheduled(now + std::time::Duration::from_millis(delay))
    };
    let (status, next_eligible_at) = match disposition {
        RetryDisposition::Scheduled(ts) => (RetryStatus::Pending, ts),
        RetryDisposition::Exhausted => (RetryStatus::Failed, now),
    };
    db.execute_cached(
        "UPDATE retry_queue SET
            attempt_count = :attempt,
            next_eligible_at = :next_eligible_at,
            last_attempt_at = :now,
            leased_at = NULL,
            last_error = :last_error,
            error_category = :category,
            status = :status
         WHERE id = :id",
        named_params! {
            ":id": entry.id,
            ":attempt": attempt,
            ":next_eligible_at": next_eligible_at,
            ":now": now,
            ":last_error": classified.technical_message,
            ":category": classified.category.bucket(),
            ":status": status,
        },
    )?;
    Ok(disposition)
}

/// Entries that gave up; shown to the user, never retried automatically.
pub fn blocking_issues(db: &SyncDb) -> Result<Vec<RetryEntry>> {
    db.query_rows_and_then_cached(
        "SELECT * FROM retry_queue WHERE status = 'failed'
         ORDER BY priority ASC, enqueued_at ASC",
        [],
        |row| RetryEntry::from_row(row),
    )
}

/// Does this row already have an entry (any state)? Used to keep the main
/// push from double-scheduling work the queue owns.
pub fn has_entry(
    db: &SyncDb,
    kind: RecordKind,
    record_guid: &str,
    operation: RetryOperation,
) -> Result<bool> {
    let n: i64 = db.db.query_row(
        "SELECT COUNT(*) FROM retry_queue
         WHERE record_kind = ?1 AND record_guid = ?2 AND operation = ?3",
        rusqlite::params![kind.table_name(), record_guid, operation],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

/// Work still owed: pending plus leased.
pub fn depth(db: &SyncDb) -> Result<u32> {
    Ok(db.db.query_row(
        "SELECT COUNT(*) FROM retry_queue WHERE status IN ('pending', 'in_progress')",
        [],
        |row| row.get(0),
    )?)
}

/// Age of the oldest live entry, for the queue-health gauge.
pub fn oldest_entry_age_ms(db: &SyncDb, now: Timestamp) -> Result<Option<u64>> {
    let oldest: Option<Timestamp> = db.db.query_row(
        "SELECT MIN(enqueued_at) FROM retry_queue WHERE status IN ('pending', 'in_progress')",
        [],
        |row| row.get(0),
    )?;
    Ok(oldest.map(|ts| now.millis_since(ts)))
}
