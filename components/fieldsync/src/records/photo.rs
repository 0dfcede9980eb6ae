/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use super::{field_str, field_timestamp, opt_str_value, RecordKind, SyncEnvelope, SyncRecord};
use crate::error::Result;
use crate::remote::{format_iso8601, JsonMap};
use rusqlite::{named_params, Connection, Row};
use serde_json::{json, Value};
use sql_support::ConnExt;
use types::Timestamp;

/// A photo attached to a work order. The image bytes live on the device at
/// `local_uri` until the blob step uploads them and fills in `remote_url`;
/// the row itself syncs like any other record.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkOrderPhoto {
    pub envelope: SyncEnvelope,
    pub work_order_id: String,
    pub local_uri: String,
    pub remote_url: Option<String>,
    pub caption: Option<String>,
    pub taken_at: Timestamp,
}

impl WorkOrderPhoto {
    pub fn new(
        envelope: SyncEnvelope,
        work_order_id: String,
        local_uri: String,
        taken_at: Timestamp,
    ) -> Self {
        Self {
            envelope,
            work_order_id,
            local_uri,
            remote_url: None,
            caption: None,
            taken_at,
        }
    }

    /// Still waiting for its bytes to reach the server.
    pub fn needs_upload(&self) -> bool {
        !self.local_uri.is_empty() && self.remote_url.is_none()
    }
}

impl SyncRecord for WorkOrderPhoto {
    const KIND: RecordKind = RecordKind::WorkOrderPhoto;

    fn envelope(&self) -> &SyncEnvelope {
        &self.envelope
    }

    fn envelope_mut(&mut self) -> &mut SyncEnvelope {
        &mut self.envelope
    }

    fn from_row(row: &Row<'_>) -> Result<Self> {
        Ok(Self {
            envelope: SyncEnvelope::from_row(row)?,
            work_order_id: row.get("work_order_id")?,
            local_uri: row.get("local_uri")?,
            remote_url: row.get("remote_url")?,
            caption: row.get("caption")?,
            taken_at: row.get("taken_at")?,
        })
    }

    fn persist(&self, conn: &Connection) -> Result<()> {
        conn.execute_cached(
            "INSERT OR REPLACE INTO work_order_photos (
                guid, server_id, sync_status, local_updated_at, server_updated_at,
                work_order_id, local_uri, remote_url, caption, taken_at
            ) VALUES (
                :guid, :server_id, :sync_status, :local_updated_at, :server_updated_at,
                :work_order_id, :local_uri, :remote_url, :caption, :taken_at
            )",
            named_params! {
                ":guid": self.envelope.guid,
                ":server_id": self.envelope.server_id,
                ":sync_status": self.envelope.sync_status,
                ":local_updated_at": self.envelope.local_updated_at,
                ":server_updated_at": self.envelope.server_updated_at,
                ":work_order_id": self.work_order_id,
                ":local_uri": self.local_uri,
                ":remote_url": self.remote_url,
                ":caption": self.caption,
                ":taken_at": self.taken_at,
            },
        )?;
        Ok(())
    }

    fn to_server_fields(&self) -> JsonMap {
        let mut fields = JsonMap::new();
        fields.insert("work_order_id".into(), json!(self.work_order_id));
        fields.insert("local_uri".into(), json!(self.local_uri));
        fields.insert("remote_url".into(), opt_str_value(&self.remote_url));
        fields.insert("caption".into(), opt_str_value(&self.caption));
        fields.insert(
            "taken_at".into(),
            Value::String(format_iso8601(self.taken_at)),
        );
        fields
    }

    fn apply_server_fields(&mut self, fields: &JsonMap) -> Result<()> {
        if let Some(v) = field_str(fields, "work_order_id") {
            self.work_order_id = v;
        }
        if let Some(v) = field_str(fields, "local_uri") {
            self.local_uri = v;
        }
        if fields.contains_key("remote_url") {
            self.remote_url = field_str(fields, "remote_url");
        }
        if fields.contains_key("caption") {
            self.caption = field_str(fields, "caption");
        }
        if let Some(ts) = field_timestamp(fields, "taken_at") {
            self.taken_at = ts;
        }
        Ok(())
    }

    fn from_server_fields(envelope: SyncEnvelope, fields: &JsonMap) -> Result<Self> {
        let taken_at = envelope.local_updated_at;
        let mut photo =
            WorkOrderPhoto::new(envelope, String::new(), String::new(), taken_at);
        photo.apply_server_fields(fields)?;
        Ok(photo)
    }

    fn parent_ref(&self) -> Option<(RecordKind, &'static str, &str)> {
        Some((RecordKind::WorkOrder, "work_order_id", &self.work_order_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_upload() {
        let mut photo = WorkOrderPhoto::new(
            SyncEnvelope::new_local("photo-1".into(), Timestamp(1000)),
            "wo-1".into(),
            "file:///photos/img1.jpg".into(),
            Timestamp(900),
        );
        assert!(photo.needs_upload());
        photo.remote_url = Some("https://cdn.example.com/img1.jpg".into());
        assert!(!photo.needs_upload());
    }

    #[test]
    fn test_photos_sort_behind_other_records() {
        let photo = WorkOrderPhoto::new(
            SyncEnvelope::new_local("photo-1".into(), Timestamp(1000)),
            "wo-1".into(),
            "file:///photos/img1.jpg".into(),
            Timestamp(900),
        );
        assert_eq!(photo.push_priority(), 300);
    }
}
