/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The local store (one SQLite connection plus change observers).
//!
//! `SyncDb` is the single source of truth on the device. It is deliberately
//! dumb about sync semantics: it persists envelopes and domain fields,
//! answers typed queries, and tells observers that a table changed. Deciding
//! *what* to write during a merge is the resolver's job, and orchestration
//! is the engine's.

use crate::error::Result;
use crate::query::{build_select, Filter, QueryOptions};
use crate::records::{RecordKind, SyncRecord, SyncStatus, WorkOrderPhoto};
use crate::schema::FieldsyncConnectionInitializer;
use parking_lot::Mutex;
use rusqlite::types::{FromSql, ToSql};
use rusqlite::{named_params, Connection};
use sql_support::open_database;
use sql_support::{ConnExt, UncheckedTransaction};
use std::ops::Deref;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Called after a committed write touches a table. Receives the db so it can
/// run follow-up queries; it must not try to re-lock whatever mutex the
/// caller used to reach this `SyncDb`.
pub type ChangeObserver = Box<dyn Fn(&SyncDb, RecordKind) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverId(u64);

#[derive(Default)]
struct ChangeObservers {
    observers: Mutex<Vec<(u64, ChangeObserver)>>,
    next_id: AtomicU64,
}

pub struct SyncDb {
    pub(crate) db: Connection,
    observers: ChangeObservers,
}

impl ConnExt for SyncDb {
    #[inline]
    fn conn(&self) -> &Connection {
        &self.db
    }
}

impl Deref for SyncDb {
    type Target = Connection;
    #[inline]
    fn deref(&self) -> &Connection {
        &self.db
    }
}

impl SyncDb {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::with_connection(open_database::open_database(
            path,
            &FieldsyncConnectionInitializer,
        )?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::with_connection(open_database::open_memory_database(
            &FieldsyncConnectionInitializer,
        )?))
    }

    fn with_connection(db: Connection) -> Self {
        Self {
            db,
            observers: ChangeObservers::default(),
        }
    }

    // Key-value bookkeeping, same shape as every other component's meta
    // table.

    pub fn put_meta(&self, key: &str, value: &dyn ToSql) -> Result<()> {
        self.execute_cached(
            "REPLACE INTO sync_meta (key, value) VALUES (:key, :value)",
            named_params! { ":key": key, ":value": value },
        )?;
        Ok(())
    }

    pub fn get_meta<T: FromSql>(&self, key: &str) -> Result<Option<T>> {
        self.try_query_row(
            "SELECT value FROM sync_meta WHERE key = :key",
            named_params! { ":key": key },
            |row| Ok(row.get(0)?),
        )
    }

    pub fn delete_meta(&self, key: &str) -> Result<()> {
        self.execute_cached(
            "DELETE FROM sync_meta WHERE key = :key",
            named_params! { ":key": key },
        )?;
        Ok(())
    }

    // Typed record access. All four tables share the envelope columns, so
    // these are generic over the family.

    pub fn get_record<T: SyncRecord>(&self, guid: &str) -> Result<Option<T>> {
        get_record_in(self, guid)
    }

    pub fn get_record_by_server_id<T: SyncRecord>(&self, server_id: &str) -> Result<Option<T>> {
        self.try_query_row(
            &format!(
                "SELECT * FROM {} WHERE server_id = :server_id",
                T::KIND.table_name()
            ),
            named_params! { ":server_id": server_id },
            |row| T::from_row(row),
        )
    }

    /// Run a structured query against one record family. The UI's list
    /// screens live on this; the engine itself sticks to the narrower typed
    /// accessors below.
    pub fn query_records<T: SyncRecord>(
        &self,
        filter: Option<&Filter>,
        options: &QueryOptions,
    ) -> Result<Vec<T>> {
        let (sql, params) = build_select(T::KIND.table_name(), filter, options)?;
        self.query_rows_and_then_cached(
            &sql,
            rusqlite::params_from_iter(params.iter()),
            |row| T::from_row(row),
        )
    }

    /// Rows holding unsent local mutations, oldest edit first.
    pub fn pending_records<T: SyncRecord>(&self) -> Result<Vec<T>> {
        self.query_rows_and_then_cached(
            &format!(
                "SELECT * FROM {} WHERE sync_status = :status ORDER BY local_updated_at ASC",
                T::KIND.table_name()
            ),
            named_params! { ":status": SyncStatus::Pending },
            |row| T::from_row(row),
        )
    }

    /// The server id of one row, if it has been acknowledged.
    pub fn server_id_for(&self, kind: RecordKind, guid: &str) -> Result<Option<String>> {
        Ok(self
            .try_query_row(
                &format!(
                    "SELECT server_id FROM {} WHERE guid = :guid",
                    kind.table_name()
                ),
                named_params! { ":guid": guid },
                |row| row.get::<_, Option<String>>(0).map_err(crate::error::Error::from),
            )?
            .flatten())
    }

    /// Reverse lookup: the local guid holding a given server id.
    pub fn local_guid_for_server_id(
        &self,
        kind: RecordKind,
        server_id: &str,
    ) -> Result<Option<String>> {
        self.try_query_row(
            &format!(
                "SELECT guid FROM {} WHERE server_id = :server_id",
                kind.table_name()
            ),
            named_params! { ":server_id": server_id },
            |row| row.get(0).map_err(crate::error::Error::from),
        )
    }

    /// Photos the server hasn't acknowledged yet; candidates for content
    /// matching during pull.
    pub fn photos_without_server_id(&self) -> Result<Vec<WorkOrderPhoto>> {
        self.query_rows_and_then_cached(
            "SELECT * FROM work_order_photos WHERE server_id IS NULL",
            [],
            |row| WorkOrderPhoto::from_row(row),
        )
    }

    /// Photos whose bytes haven't reached the server yet.
    pub fn photos_needing_upload(&self) -> Result<Vec<WorkOrderPhoto>> {
        self.query_rows_and_then_cached(
            "SELECT * FROM work_order_photos
             WHERE local_uri != '' AND remote_url IS NULL
             ORDER BY local_updated_at ASC",
            [],
            |row| WorkOrderPhoto::from_row(row),
        )
    }

    pub fn count_pending(&self, kind: RecordKind) -> Result<u32> {
        Ok(self.db.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE sync_status = ?",
                kind.table_name()
            ),
            [&SyncStatus::Pending as &dyn ToSql],
            |row| row.get(0),
        )?)
    }

    /// Pending rows across every table, plus blob uploads still owed for
    /// rows that are otherwise settled.
    pub fn pending_count(&self) -> Result<u32> {
        let mut total = 0;
        for kind in RecordKind::IN_PUSH_ORDER {
            total += self.count_pending(kind)?;
        }
        let blobs: u32 = self.db.query_row(
            "SELECT COUNT(*) FROM work_order_photos
             WHERE local_uri != '' AND remote_url IS NULL AND sync_status = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(total + blobs)
    }

    /// Write one record and tell observers. For multi-row writes use
    /// `in_batch` and notify once at the end.
    pub fn save_record<T: SyncRecord>(&self, record: &T) -> Result<()> {
        record.persist(&self.db)?;
        self.notify_changed(T::KIND);
        Ok(())
    }

    /// Run `f` inside a single transaction; everything it writes lands
    /// atomically or not at all. Observers are *not* notified here - the
    /// caller knows which tables it touched.
    pub fn in_batch<R>(&self, f: impl FnOnce(&UncheckedTransaction<'_>) -> Result<R>) -> Result<R> {
        let tx = self.unchecked_transaction_imm()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    // Observers; this is how "observable queries" reach the UI layer. One
    // callback per subscription, fired per changed table after the write.

    pub fn add_observer(&self, observer: ChangeObserver) -> ObserverId {
        let id = self.observers.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers.observers.lock().push((id, observer));
        ObserverId(id)
    }

    pub fn remove_observer(&self, id: ObserverId) {
        self.observers
            .observers
            .lock()
            .retain(|(oid, _)| *oid != id.0);
    }

    pub fn notify_changed(&self, kind: RecordKind) {
        for (_, observer) in self.observers.observers.lock().iter() {
            observer(self, kind);
        }
    }
}

/// As `SyncDb::get_record`, but usable inside a transaction.
pub fn get_record_in<T: SyncRecord>(conn: &impl ConnExt, guid: &str) -> Result<Option<T>> {
    conn.try_query_row(
        &format!("SELECT * FROM {} WHERE guid = :guid", T::KIND.table_name()),
        named_params! { ":guid": guid },
        |row| T::from_row(row),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{Asset, SyncEnvelope, WorkOrder};
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;
    use types::Timestamp;

    fn db() -> SyncDb {
        SyncDb::open_in_memory().unwrap()
    }

    fn wo(guid: &str, at: u64) -> WorkOrder {
        WorkOrder::new(
            SyncEnvelope::new_local(guid.into(), Timestamp(at)),
            format!("WO-{}", guid),
            "site-9".into(),
            "Grease bearings".into(),
        )
    }

    #[test]
    fn test_meta_round_trip() {
        let db = db();
        assert_eq!(db.get_meta::<i64>("x").unwrap(), None);
        db.put_meta("x", &42i64).unwrap();
        assert_eq!(db.get_meta::<i64>("x").unwrap(), Some(42));
        db.delete_meta("x").unwrap();
        assert_eq!(db.get_meta::<i64>("x").unwrap(), None);
    }

    #[test]
    fn test_save_and_fetch_record() {
        let db = db();
        let mut record = wo("wo-1", 1000);
        db.save_record(&record).unwrap();

        let got: WorkOrder = db.get_record("wo-1").unwrap().unwrap();
        assert_eq!(got, record);
        assert!(db.get_record::<WorkOrder>("wo-2").unwrap().is_none());

        record.envelope.set_server_id("S1".into()).unwrap();
        record.envelope.sync_status = SyncStatus::Synced;
        db.save_record(&record).unwrap();
        let got: WorkOrder = db.get_record_by_server_id("S1").unwrap().unwrap();
        assert_eq!(got.envelope.guid, "wo-1");
    }

    #[test]
    fn test_pending_queries_and_counts() {
        let db = db();
        db.save_record(&wo("wo-1", 1000)).unwrap();
        db.save_record(&wo("wo-2", 2000)).unwrap();
        let mut synced = wo("wo-3", 3000);
        synced.envelope.sync_status = SyncStatus::Synced;
        db.save_record(&synced).unwrap();

        let pending: Vec<WorkOrder> = db.pending_records().unwrap();
        assert_eq!(
            pending.iter().map(|r| r.envelope.guid.as_str()).collect::<Vec<_>>(),
            vec!["wo-1", "wo-2"]
        );
        assert_eq!(db.count_pending(RecordKind::WorkOrder).unwrap(), 2);
        assert_eq!(db.count_pending(RecordKind::Asset).unwrap(), 0);
        assert_eq!(db.pending_count().unwrap(), 2);
    }

    #[test]
    fn test_query_records() {
        use crate::query::{Filter, QueryOptions, SortDirection};
        let db = db();
        let mut high = wo("wo-1", 1000);
        high.priority = crate::records::Priority::High;
        db.save_record(&high).unwrap();
        let mut low = wo("wo-2", 2000);
        low.priority = crate::records::Priority::Low;
        low.title = "Check belt tension".to_string();
        db.save_record(&low).unwrap();

        let found: Vec<WorkOrder> = db
            .query_records(
                Some(&Filter::And(vec![
                    Filter::Eq("site_id", "site-9".into()),
                    Filter::In("priority", vec!["high".into(), "emergency".into()]),
                ])),
                &QueryOptions::default(),
            )
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].envelope.guid, "wo-1");

        let found: Vec<WorkOrder> = db
            .query_records(
                Some(&Filter::Like("title", "%belt%".to_string())),
                &QueryOptions {
                    order_by: Some(("local_updated_at", SortDirection::Descending)),
                    limit: Some(10),
                    skip: None,
                },
            )
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].envelope.guid, "wo-2");
    }

    #[test]
    fn test_batch_is_atomic() {
        let db = db();
        let result: Result<()> = db.in_batch(|tx| {
            wo("wo-1", 1000).persist(tx)?;
            Err(crate::error::Error::MalformedRecord("boom".into()))
        });
        assert!(result.is_err());
        assert!(db.get_record::<WorkOrder>("wo-1").unwrap().is_none());

        db.in_batch(|tx| {
            wo("wo-1", 1000).persist(tx)?;
            wo("wo-2", 2000).persist(tx)?;
            Ok(())
        })
        .unwrap();
        assert_eq!(db.count_pending(RecordKind::WorkOrder).unwrap(), 2);
    }

    #[test]
    fn test_observers_fire_on_save() {
        let db = db();
        let count = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&count);
        let id = db.add_observer(Box::new(move |_db, kind| {
            assert_eq!(kind, RecordKind::WorkOrder);
            seen.fetch_add(1, Ordering::Relaxed);
        }));
        db.save_record(&wo("wo-1", 1000)).unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 1);
        db.remove_observer(id);
        db.save_record(&wo("wo-2", 2000)).unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_photos_needing_upload() {
        let db = db();
        let mut photo = WorkOrderPhoto::new(
            SyncEnvelope::new_local("photo-1".into(), Timestamp(1000)),
            "wo-1".into(),
            "file:///p/1.jpg".into(),
            Timestamp(900),
        );
        db.save_record(&photo).unwrap();
        assert_eq!(db.photos_needing_upload().unwrap().len(), 1);

        photo.remote_url = Some("https://cdn.example.com/1.jpg".into());
        db.save_record(&photo).unwrap();
        assert!(db.photos_needing_upload().unwrap().is_empty());
    }

    #[test]
    fn test_asset_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fieldsync.db");
        {
            let db = SyncDb::open(&path).unwrap();
            db.save_record(&Asset::new(
                SyncEnvelope::new_local("asset-1".into(), Timestamp(1000)),
                "A-17".into(),
                "site-9".into(),
                "Primary crusher".into(),
            ))
            .unwrap();
        }
        // Reopen; the row survived.
        let db = SyncDb::open(&path).unwrap();
        let got: Asset = db.get_record("asset-1").unwrap().unwrap();
        assert_eq!(got.name, "Primary crusher");
    }
}
