/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! One sync cycle, start to finish.
//!
//! The order is fixed: recover stale retry leases, drain a bounded slice of
//! the retry queue, push pending rows parents-first, pull server changes
//! since the cursor (resolving conflicts as they land), upload blobs when
//! the network is right for it, then advance the cursor and prune the
//! conflict log. The cursor only moves when the whole sequence finished, so
//! an aborted cycle re-observes the same server rows next time - safe,
//! because everything applies idempotently by server id.
//!
//! Per-row push failures never escape: they're classified and parked in the
//! retry queue. Only whole-cycle problems (offline, auth, local store
//! breakage) surface as a failed `SyncResult`.

use crate::classify::classify;
use crate::db::{get_record_in, SyncDb};
use crate::error::{Error, ErrorCategory, Result};
use crate::ports::{ConnectionType, Environment};
use crate::queue::{self, RetryDisposition, RetryEntry, RetryOperation};
use crate::records::{
    Asset, MeterReading, RecordKind, SyncEnvelope, SyncRecord, SyncStatus, WorkOrder,
    WorkOrderPhoto,
};
use crate::remote::{JsonMap, RemoteError, RemoteStore, ServerRecord};
use crate::settings::SyncSettings;
use crate::sync::{conflict_log, merge};
use crate::telemetry::{CycleRecorder, TelemetrySink};
use crate::token::TokenManager;
use interrupt_support::Interruptee;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use std::sync::Arc;
use types::Timestamp;

pub const LAST_SYNC_AT_KEY: &str = "sync.last_sync_at";
pub const LAST_ERROR_KEY: &str = "sync.last_error";

/// What `perform_sync` hands back to the caller.
#[derive(Debug, Clone, Default)]
pub struct SyncResult {
    pub success: bool,
    pub pushed: u32,
    pub pulled: u32,
    pub conflicts: u32,
    pub queued_for_retry: u32,
    pub duration_ms: u64,
    pub error: Option<String>,
    /// Coarse bucket ("auth", "transient", ...) when the cycle failed.
    pub error_category: Option<String>,
}

impl SyncResult {
    fn offline() -> Self {
        Self {
            success: false,
            error: Some("Device is offline".to_string()),
            error_category: Some("transient".to_string()),
            ..Default::default()
        }
    }

    fn cancelled(duration_ms: u64) -> Self {
        Self {
            success: false,
            duration_ms,
            error: Some("cancelled".to_string()),
            ..Default::default()
        }
    }
}

enum PushOutcome {
    Done,
    /// Parent row has no server id yet; try again next cycle.
    ParentNotReady,
    /// The local row vanished (or no longer needs this operation).
    RecordGone,
}

pub struct SyncEngine {
    db: Arc<Mutex<SyncDb>>,
    remote: Arc<dyn RemoteStore>,
    env: Environment,
    tokens: TokenManager,
    telemetry: Arc<dyn TelemetrySink>,
    settings: SyncSettings,
}

impl SyncEngine {
    pub fn new(
        db: Arc<Mutex<SyncDb>>,
        remote: Arc<dyn RemoteStore>,
        env: Environment,
        tokens: TokenManager,
        telemetry: Arc<dyn TelemetrySink>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            db,
            remote,
            env,
            tokens,
            telemetry,
            settings,
        }
    }

    /// Run one full cycle. Never panics out; every outcome is a
    /// `SyncResult`.
    pub fn sync(&self, scope: &dyn Interruptee) -> SyncResult {
        if !self.env.network.is_online() {
            log::info!("sync skipped: device is offline");
            return SyncResult::offline();
        }

        let mut cycle = CycleRecorder::start(&*self.telemetry);
        match self.run_cycle(scope, &mut cycle) {
            Ok(()) => {
                let (depth, oldest) = self.queue_health();
                let duration_ms = cycle.finish(&*self.telemetry, true, depth, oldest);
                log::info!(
                    "sync finished: pushed {} pulled {} conflicts {} queued {} in {}ms",
                    cycle.pushed,
                    cycle.pulled,
                    cycle.conflicts,
                    cycle.queued_for_retry,
                    duration_ms
                );
                SyncResult {
                    success: true,
                    pushed: cycle.pushed,
                    pulled: cycle.pulled,
                    conflicts: cycle.conflicts,
                    queued_for_retry: cycle.queued_for_retry,
                    duration_ms,
                    error: None,
                    error_category: None,
                }
            }
            Err(Error::Interrupted(_)) => {
                log::info!("sync cancelled; releasing queue leases");
                self.release_leases();
                let (depth, oldest) = self.queue_health();
                let duration_ms = cycle.finish(&*self.telemetry, false, depth, oldest);
                SyncResult::cancelled(duration_ms)
            }
            Err(e) => {
                let (message, category) = describe_cycle_error(&e);
                log::warn!("sync failed: {}", message);
                self.release_leases();
                self.env.secure.put(LAST_ERROR_KEY, &message);
                let (depth, oldest) = self.queue_health();
                let duration_ms = cycle.finish(&*self.telemetry, false, depth, oldest);
                SyncResult {
                    success: false,
                    pushed: cycle.pushed,
                    pulled: cycle.pulled,
                    conflicts: cycle.conflicts,
                    queued_for_retry: cycle.queued_for_retry,
                    duration_ms,
                    error: Some(message),
                    error_category: Some(category),
                }
            }
        }
    }

    fn run_cycle(&self, scope: &dyn Interruptee, cycle: &mut CycleRecorder) -> Result<()> {
        // A cycle that can't present a token can't do anything else either.
        if self.tokens.ensure_valid_token().is_none() {
            return Err(Error::AuthRequired);
        }

        let now = self.env.clock.now();
        {
            let db = self.db.lock();
            queue::recover_stale_items(&db, now, self.settings.lease_timeout_ms)?;
        }

        self.process_retry_queue(scope, cycle)?;

        // Parents strictly before children.
        self.push_pending::<Asset>(scope, cycle)?;
        self.push_pending_work_orders(scope, cycle)?;
        self.push_pending::<MeterReading>(scope, cycle)?;
        self.push_pending::<WorkOrderPhoto>(scope, cycle)?;

        let cursor = self.read_cursor();
        self.pull_changes::<Asset>(scope, cycle, cursor)?;
        self.pull_changes::<WorkOrder>(scope, cycle, cursor)?;
        self.pull_changes::<MeterReading>(scope, cycle, cursor)?;
        self.pull_changes::<WorkOrderPhoto>(scope, cycle, cursor)?;

        self.sync_blobs(scope, cycle)?;

        let now = self.env.clock.now();
        self.env
            .secure
            .put(LAST_SYNC_AT_KEY, &now.as_millis().to_string());
        self.env.secure.delete(LAST_ERROR_KEY);

        {
            let db = self.db.lock();
            conflict_log::prune(&db, now, self.settings.conflict_log_retention_ms)?;
        }
        Ok(())
    }

    pub fn read_cursor(&self) -> Option<Timestamp> {
        self.env
            .secure
            .get(LAST_SYNC_AT_KEY)
            .and_then(|s| s.parse::<u64>().ok())
            .map(Timestamp)
    }

    fn queue_health(&self) -> (u32, Option<u64>) {
        let db = self.db.lock();
        let depth = queue::depth(&db).unwrap_or(0);
        let oldest = queue::oldest_entry_age_ms(&db, self.env.clock.now()).unwrap_or(None);
        (depth, oldest)
    }

    fn release_leases(&self) {
        let db = self.db.lock();
        if let Err(e) = queue::release_all_leases(&db) {
            log::warn!("failed to release queue leases: {}", e);
        }
    }

    fn jitter(&self) -> f64 {
        rand::thread_rng().gen_range(0.0..0.5)
    }

    // Step 3: bounded drain of the retry queue, most urgent first.
    fn process_retry_queue(
        &self,
        scope: &dyn Interruptee,
        cycle: &mut CycleRecorder,
    ) -> Result<()> {
        let now = self.env.clock.now();
        let items = {
            let db = self.db.lock();
            queue::get_retryable_items(&db, now, self.settings.max_retry_items_per_cycle)?
        };
        if items.is_empty() {
            return Ok(());
        }
        log::debug!("processing {} retry-queue entries", items.len());
        for entry in items {
            scope.err_if_interrupted()?;
            {
                let db = self.db.lock();
                queue::mark_in_progress(&db, entry.id, self.env.clock.now())?;
            }
            let outcome = match entry.operation {
                RetryOperation::Push => self.retry_push(&entry),
                RetryOperation::UploadBlob => self.retry_blob(&entry),
            };
            self.settle_retry_entry(cycle, &entry, outcome)?;
        }
        Ok(())
    }

    fn retry_push(&self, entry: &RetryEntry) -> Result<PushOutcome> {
        match entry.kind {
            RecordKind::Asset => self.push_by_guid::<Asset>(&entry.record_guid),
            RecordKind::WorkOrder => self.push_by_guid::<WorkOrder>(&entry.record_guid),
            RecordKind::MeterReading => self.push_by_guid::<MeterReading>(&entry.record_guid),
            RecordKind::WorkOrderPhoto => self.push_by_guid::<WorkOrderPhoto>(&entry.record_guid),
        }
    }

    fn retry_blob(&self, entry: &RetryEntry) -> Result<PushOutcome> {
        let photo: Option<WorkOrderPhoto> = {
            let db = self.db.lock();
            db.get_record(&entry.record_guid)?
        };
        match photo {
            None => Ok(PushOutcome::RecordGone),
            Some(photo) if !photo.needs_upload() => Ok(PushOutcome::Done),
            Some(photo) => {
                self.upload_photo(&photo)?;
                Ok(PushOutcome::Done)
            }
        }
    }

    fn settle_retry_entry(
        &self,
        cycle: &mut CycleRecorder,
        entry: &RetryEntry,
        outcome: Result<PushOutcome>,
    ) -> Result<()> {
        let now = self.env.clock.now();
        match outcome {
            Ok(PushOutcome::Done) => {
                let db = self.db.lock();
                queue::mark_completed(&db, entry.id)?;
                cycle.pushed += 1;
                Ok(())
            }
            Ok(PushOutcome::ParentNotReady) => {
                // Not an attempt; the parent just hasn't made it up yet.
                let db = self.db.lock();
                queue::release_lease(&db, entry.id)?;
                Ok(())
            }
            Ok(PushOutcome::RecordGone) => {
                let gone = classify(&RemoteError::http(404, "record not found"));
                let db = self.db.lock();
                queue::mark_failed(&db, entry, &gone, now, self.jitter())?;
                Ok(())
            }
            Err(Error::Remote(remote_err)) => {
                let classified = classify(&remote_err);
                let auth = matches!(classified.category, ErrorCategory::Auth(_));
                let disposition = {
                    let db = self.db.lock();
                    queue::mark_failed(&db, entry, &classified, now, self.jitter())?
                };
                if matches!(disposition, RetryDisposition::Scheduled(_)) {
                    cycle.queued_for_retry += 1;
                }
                if auth {
                    return Err(Error::AuthRequired);
                }
                log::warn!(
                    "retry of {} {} failed ({}): {}",
                    entry.kind,
                    entry.record_guid,
                    classified.category.bucket(),
                    classified.technical_message
                );
                Ok(())
            }
            // Interruption and local-store trouble are cycle-fatal; give the
            // lease back so the next cycle can have another go.
            Err(e) => {
                let db = self.db.lock();
                queue::release_lease(&db, entry.id)?;
                Err(e)
            }
        }
    }

    // Step 4: push rows the queue doesn't already own.
    fn push_pending<T: SyncRecord>(
        &self,
        scope: &dyn Interruptee,
        cycle: &mut CycleRecorder,
    ) -> Result<()> {
        let records: Vec<T> = {
            let db = self.db.lock();
            db.pending_records()?
        };
        self.push_records(scope, cycle, records)
    }

    fn push_pending_work_orders(
        &self,
        scope: &dyn Interruptee,
        cycle: &mut CycleRecorder,
    ) -> Result<()> {
        let mut records: Vec<WorkOrder> = {
            let db = self.db.lock();
            db.pending_records()?
        };
        // Emergencies first; the sort is stable so equal priorities keep
        // their oldest-edit-first order.
        records.sort_by_key(|wo| wo.push_priority());
        self.push_records(scope, cycle, records)
    }

    fn push_records<T: SyncRecord>(
        &self,
        scope: &dyn Interruptee,
        cycle: &mut CycleRecorder,
        records: Vec<T>,
    ) -> Result<()> {
        for record in records {
            scope.err_if_interrupted()?;
            let guid = record.envelope().guid.clone();
            let owned_by_queue = {
                let db = self.db.lock();
                queue::has_entry(&db, T::KIND, &guid, RetryOperation::Push)?
            };
            if owned_by_queue {
                continue;
            }
            match self.push_record(&record) {
                Ok(PushOutcome::Done) => cycle.pushed += 1,
                Ok(PushOutcome::ParentNotReady) => {
                    log::debug!(
                        "skipping {} {}: parent has no server id yet",
                        T::KIND,
                        guid
                    );
                }
                Ok(PushOutcome::RecordGone) => {}
                Err(Error::Remote(remote_err)) => {
                    let classified = classify(&remote_err);
                    if matches!(classified.category, ErrorCategory::Auth(_)) {
                        return Err(Error::AuthRequired);
                    }
                    log::warn!(
                        "push of {} {} failed ({}): {}",
                        T::KIND,
                        guid,
                        classified.category.bucket(),
                        classified.technical_message
                    );
                    let disposition = {
                        let db = self.db.lock();
                        queue::enqueue_failure(
                            &db,
                            T::KIND,
                            &guid,
                            RetryOperation::Push,
                            record.push_priority(),
                            &classified,
                            self.env.clock.now(),
                            self.jitter(),
                        )?
                    };
                    if matches!(disposition, RetryDisposition::Scheduled(_)) {
                        cycle.queued_for_retry += 1;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn push_by_guid<T: SyncRecord>(&self, guid: &str) -> Result<PushOutcome> {
        let record: Option<T> = {
            let db = self.db.lock();
            db.get_record(guid)?
        };
        match record {
            None => Ok(PushOutcome::RecordGone),
            // Settled some other way (e.g. a pull merged it) - nothing to do.
            Some(r) if r.envelope().sync_status != SyncStatus::Pending => Ok(PushOutcome::Done),
            Some(r) => self.push_record(&r),
        }
    }

    /// Upsert one row. On success the acknowledgment is folded into the
    /// *current* row state, so an edit made while the request was in flight
    /// stays pending instead of being silently marked synced.
    fn push_record<T: SyncRecord>(&self, record: &T) -> Result<PushOutcome> {
        let payload = match self.build_payload(record)? {
            Some(payload) => payload,
            None => return Ok(PushOutcome::ParentNotReady),
        };
        let server_record = self.remote.upsert(T::KIND, &payload)?;

        let db = self.db.lock();
        let pushed_at = record.envelope().local_updated_at;
        let guid = record.envelope().guid.clone();
        db.in_batch(|tx| {
            let fresh: Option<T> = get_record_in(tx, &guid)?;
            let Some(mut fresh) = fresh else {
                return Ok(());
            };
            let edited_in_flight = fresh.envelope().local_updated_at > pushed_at;
            fresh.envelope_mut().set_server_id(server_record.id.clone())?;
            fresh
                .envelope_mut()
                .advance_server_updated_at(server_record.updated_at);
            if !edited_in_flight {
                fresh.envelope_mut().sync_status = SyncStatus::Synced;
            }
            fresh.persist(tx)?;
            Ok(())
        })?;
        db.notify_changed(T::KIND);
        Ok(PushOutcome::Done)
    }

    /// Wire body for one row: domain fields, foreign keys rewritten to
    /// server ids, plus our own server id when we have one (that's what
    /// makes the upsert idempotent).
    fn build_payload<T: SyncRecord>(&self, record: &T) -> Result<Option<JsonMap>> {
        let mut fields = record.to_server_fields();
        if let Some((parent_kind, fk_field, parent_guid)) = record.parent_ref() {
            let parent_server_id = {
                let db = self.db.lock();
                db.server_id_for(parent_kind, parent_guid)?
            };
            match parent_server_id {
                Some(server_id) => {
                    fields.insert(fk_field.to_string(), Value::String(server_id));
                }
                None => return Ok(None),
            }
        }
        if let Some(server_id) = &record.envelope().server_id {
            fields.insert("id".to_string(), Value::String(server_id.clone()));
        }
        Ok(Some(fields))
    }

    // Step 5: pull one table and reconcile row by row.
    fn pull_changes<T: SyncRecord>(
        &self,
        scope: &dyn Interruptee,
        cycle: &mut CycleRecorder,
        cursor: Option<Timestamp>,
    ) -> Result<()> {
        scope.err_if_interrupted()?;
        let server_rows = self.remote.fetch_since(T::KIND, cursor)?;
        if server_rows.is_empty() {
            return Ok(());
        }
        log::debug!("pulled {} {} rows", server_rows.len(), T::KIND);
        for server_record in server_rows {
            scope.err_if_interrupted()?;
            self.apply_incoming::<T>(cycle, server_record)?;
        }
        Ok(())
    }

    fn apply_incoming<T: SyncRecord>(
        &self,
        cycle: &mut CycleRecorder,
        server_record: ServerRecord,
    ) -> Result<()> {
        let db = self.db.lock();
        let existing = self.find_local_match::<T>(&db, &server_record)?;
        match existing {
            None => {
                // Never seen: create locally, already in sync.
                let guid = self.env.ids.new_local_id(T::KIND.id_prefix());
                let envelope = SyncEnvelope::new_from_server(
                    guid,
                    server_record.id.clone(),
                    server_record.updated_at,
                );
                let fields = self.remap_fks_to_local(&db, T::KIND, server_record.fields)?;
                let record = T::from_server_fields(envelope, &fields)?;
                db.save_record(&record)?;
                cycle.pulled += 1;
            }
            Some(mut record)
                if record.envelope().sync_status == SyncStatus::Synced =>
            {
                // No local changes: the server's word is final.
                let fields =
                    self.remap_fks_to_local(&db, T::KIND, server_record.fields)?;
                record.apply_server_fields(&fields)?;
                record.envelope_mut().set_server_id(server_record.id)?;
                record
                    .envelope_mut()
                    .advance_server_updated_at(server_record.updated_at);
                db.save_record(&record)?;
                cycle.pulled += 1;
            }
            Some(mut record) => {
                // Local mutations meet a server change: merge field by
                // field. Rewrite our FKs to server ids first so identical
                // references don't read as conflicts.
                let local_fields = self.fields_for_merge(&db, &record)?;
                let outcome = merge::resolve(
                    T::KIND,
                    &local_fields,
                    record.envelope().local_updated_at,
                    &server_record,
                    self.settings.clock_skew_tolerance_ms,
                );
                let merged =
                    self.remap_fks_to_local(&db, T::KIND, outcome.merged_fields.clone())?;
                let now = self.env.clock.now();
                let guid = record.envelope().guid.clone();
                db.in_batch(|tx| {
                    record.apply_server_fields(&merged)?;
                    record.envelope_mut().set_server_id(server_record.id.clone())?;
                    record
                        .envelope_mut()
                        .advance_server_updated_at(server_record.updated_at);
                    record.envelope_mut().sync_status = if outcome.auto_resolved() {
                        SyncStatus::Synced
                    } else {
                        SyncStatus::Conflict
                    };
                    record.persist(tx)?;
                    if outcome.has_conflict || !outcome.escalations.is_empty() {
                        conflict_log::append(
                            tx,
                            now,
                            T::KIND,
                            &guid,
                            &outcome,
                            &local_fields,
                            &server_record.fields,
                        )?;
                    }
                    Ok(())
                })?;
                db.notify_changed(T::KIND);
                cycle.pulled += 1;
                if outcome.has_conflict {
                    cycle.conflicts += 1;
                }
                cycle.escalations += outcome.escalations.len() as u32;
                if !outcome.escalations.is_empty() {
                    log::warn!(
                        "conflict on {} {} escalated: {:?}",
                        T::KIND,
                        guid,
                        outcome.escalations
                    );
                }
            }
        }
        Ok(())
    }

    /// Locate the local row a server record corresponds to: by server id,
    /// by guid (first sync against ids seeded from the server), and for
    /// photos by content key when the row was pushed but the response lost.
    fn find_local_match<T: SyncRecord>(
        &self,
        db: &SyncDb,
        server_record: &ServerRecord,
    ) -> Result<Option<T>> {
        if let Some(record) = db.get_record_by_server_id(&server_record.id)? {
            return Ok(Some(record));
        }
        if let Some(record) = db.get_record(&server_record.id)? {
            return Ok(Some(record));
        }
        if T::KIND == RecordKind::WorkOrderPhoto {
            if let Some(uri) = server_record.fields.get("local_uri").and_then(Value::as_str) {
                let server_key = self.env.crypto.sha256_hex(uri.as_bytes());
                for photo in db.photos_without_server_id()? {
                    let local_key = self.env.crypto.sha256_hex(photo.local_uri.as_bytes());
                    if local_key == server_key {
                        return Ok(db.get_record(&photo.envelope.guid)?);
                    }
                }
            }
        }
        Ok(None)
    }

    /// The local row as a wire-shaped field map with FKs in server-id form,
    /// ready to diff against a server record.
    fn fields_for_merge<T: SyncRecord>(&self, db: &SyncDb, record: &T) -> Result<JsonMap> {
        let mut fields = record.to_server_fields();
        if let Some((parent_kind, fk_field, parent_guid)) = record.parent_ref() {
            if let Some(server_id) = db.server_id_for(parent_kind, parent_guid)? {
                fields.insert(fk_field.to_string(), Value::String(server_id));
            }
        }
        Ok(fields)
    }

    /// The reverse: server-id FKs in a pulled/merged field map become local
    /// guids where we know the parent. An unknown parent keeps the raw
    /// server id; a later pull that creates the parent will straighten new
    /// children out, and the value is still unique either way.
    fn remap_fks_to_local(
        &self,
        db: &SyncDb,
        kind: RecordKind,
        mut fields: JsonMap,
    ) -> Result<JsonMap> {
        if let Some((fk_field, parent_kind)) = kind.parent_fk() {
            if let Some(server_id) = fields.get(fk_field).and_then(Value::as_str) {
                if let Some(guid) = db.local_guid_for_server_id(parent_kind, server_id)? {
                    fields.insert(fk_field.to_string(), Value::String(guid));
                }
            }
        }
        Ok(fields)
    }

    // Step 6: blob uploads, WiFi-gated.
    fn sync_blobs(&self, scope: &dyn Interruptee, cycle: &mut CycleRecorder) -> Result<()> {
        if self.settings.blob_requires_wifi
            && self.env.network.connection_type() != ConnectionType::Wifi
        {
            log::debug!("skipping blob uploads: not on WiFi");
            return Ok(());
        }
        let photos = {
            let db = self.db.lock();
            db.photos_needing_upload()?
        };
        for photo in photos {
            scope.err_if_interrupted()?;
            let guid = photo.envelope.guid.clone();
            let owned_by_queue = {
                let db = self.db.lock();
                queue::has_entry(&db, RecordKind::WorkOrderPhoto, &guid, RetryOperation::UploadBlob)?
            };
            if owned_by_queue {
                continue;
            }
            match self.upload_photo(&photo) {
                Ok(()) => {}
                Err(Error::Remote(remote_err)) => {
                    let classified = classify(&remote_err);
                    if matches!(classified.category, ErrorCategory::Auth(_)) {
                        return Err(Error::AuthRequired);
                    }
                    log::warn!(
                        "blob upload for photo {} failed ({}): {}",
                        guid,
                        classified.category.bucket(),
                        classified.technical_message
                    );
                    let disposition = {
                        let db = self.db.lock();
                        queue::enqueue_failure(
                            &db,
                            RecordKind::WorkOrderPhoto,
                            &guid,
                            RetryOperation::UploadBlob,
                            queue::BLOB_UPLOAD_PRIORITY,
                            &classified,
                            self.env.clock.now(),
                            self.jitter(),
                        )?
                    };
                    if matches!(disposition, RetryDisposition::Scheduled(_)) {
                        cycle.queued_for_retry += 1;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Upload a photo's bytes, then upsert its row so the server learns the
    /// remote URL.
    fn upload_photo(&self, photo: &WorkOrderPhoto) -> Result<()> {
        let bytes = self.env.blobs.read(&photo.local_uri).map_err(|e| {
            Error::Remote(RemoteError::new(
                None,
                Some("blob-read"),
                format!("could not read local blob {}: {:#}", photo.local_uri, e),
            ))
        })?;
        let path = format!("photos/{}", photo.envelope.guid);
        let url = self.remote.upload_blob(&path, &bytes)?;
        log::debug!("uploaded photo {} ({} bytes)", photo.envelope.guid, bytes.len());

        let updated = {
            let db = self.db.lock();
            let Some(mut fresh) = db.get_record::<WorkOrderPhoto>(&photo.envelope.guid)? else {
                return Ok(());
            };
            fresh.remote_url = Some(url);
            fresh.envelope.note_local_change(self.env.clock.now());
            db.save_record(&fresh)?;
            fresh
        };
        // Tell the server about the URL right away; a failure here leaves
        // the row pending and the regular push path picks it up.
        match self.push_record(&updated) {
            Ok(_) => Ok(()),
            Err(Error::Remote(e)) => {
                log::warn!(
                    "photo {} row update after blob upload failed: {}",
                    updated.envelope.guid,
                    e
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn describe_cycle_error(e: &Error) -> (String, String) {
    match e {
        Error::AuthRequired => (
            "Please sign in again".to_string(),
            "auth".to_string(),
        ),
        Error::Remote(remote_err) => {
            let classified = classify(remote_err);
            (
                format!("{}: {}", classified.user_message, classified.technical_message),
                classified.category.bucket().to_string(),
            )
        }
        other => (other.to_string(), "unknown".to_string()),
    }
}
