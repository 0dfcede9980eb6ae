/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use super::{
    field_f64, field_str, field_timestamp, opt_str_value, RecordKind, SyncEnvelope, SyncRecord,
};
use crate::error::Result;
use crate::remote::{format_iso8601, JsonMap};
use rusqlite::{named_params, Connection, Row};
use serde_json::{json, Value};
use sql_support::ConnExt;
use types::Timestamp;

#[derive(Debug, Clone, PartialEq)]
pub struct MeterReading {
    pub envelope: SyncEnvelope,
    pub asset_id: String,
    pub reading_value: f64,
    pub reading_at: Timestamp,
    pub recorded_by: Option<String>,
    pub notes: Option<String>,
}

impl MeterReading {
    pub fn new(
        envelope: SyncEnvelope,
        asset_id: String,
        reading_value: f64,
        reading_at: Timestamp,
    ) -> Self {
        Self {
            envelope,
            asset_id,
            reading_value,
            reading_at,
            recorded_by: None,
            notes: None,
        }
    }
}

impl SyncRecord for MeterReading {
    const KIND: RecordKind = RecordKind::MeterReading;

    fn envelope(&self) -> &SyncEnvelope {
        &self.envelope
    }

    fn envelope_mut(&mut self) -> &mut SyncEnvelope {
        &mut self.envelope
    }

    fn from_row(row: &Row<'_>) -> Result<Self> {
        Ok(Self {
            envelope: SyncEnvelope::from_row(row)?,
            asset_id: row.get("asset_id")?,
            reading_value: row.get("reading_value")?,
            reading_at: row.get("reading_at")?,
            recorded_by: row.get("recorded_by")?,
            notes: row.get("notes")?,
        })
    }

    fn persist(&self, conn: &Connection) -> Result<()> {
        conn.execute_cached(
            "INSERT OR REPLACE INTO meter_readings (
                guid, server_id, sync_status, local_updated_at, server_updated_at,
                asset_id, reading_value, reading_at, recorded_by, notes
            ) VALUES (
                :guid, :server_id, :sync_status, :local_updated_at, :server_updated_at,
                :asset_id, :reading_value, :reading_at, :recorded_by, :notes
            )",
            named_params! {
                ":guid": self.envelope.guid,
                ":server_id": self.envelope.server_id,
                ":sync_status": self.envelope.sync_status,
                ":local_updated_at": self.envelope.local_updated_at,
                ":server_updated_at": self.envelope.server_updated_at,
                ":asset_id": self.asset_id,
                ":reading_value": self.reading_value,
                ":reading_at": self.reading_at,
                ":recorded_by": self.recorded_by,
                ":notes": self.notes,
            },
        )?;
        Ok(())
    }

    fn to_server_fields(&self) -> JsonMap {
        let mut fields = JsonMap::new();
        fields.insert("asset_id".into(), json!(self.asset_id));
        fields.insert("reading_value".into(), json!(self.reading_value));
        fields.insert(
            "reading_at".into(),
            Value::String(format_iso8601(self.reading_at)),
        );
        fields.insert("recorded_by".into(), opt_str_value(&self.recorded_by));
        fields.insert("notes".into(), opt_str_value(&self.notes));
        fields
    }

    fn apply_server_fields(&mut self, fields: &JsonMap) -> Result<()> {
        if let Some(v) = field_str(fields, "asset_id") {
            self.asset_id = v;
        }
        if let Some(v) = field_f64(fields, "reading_value") {
            self.reading_value = v;
        }
        if let Some(ts) = field_timestamp(fields, "reading_at") {
            self.reading_at = ts;
        }
        if fields.contains_key("recorded_by") {
            self.recorded_by = field_str(fields, "recorded_by");
        }
        if fields.contains_key("notes") {
            self.notes = field_str(fields, "notes");
        }
        Ok(())
    }

    fn from_server_fields(envelope: SyncEnvelope, fields: &JsonMap) -> Result<Self> {
        let reading_at = envelope.local_updated_at;
        let mut reading = MeterReading::new(envelope, String::new(), 0.0, reading_at);
        reading.apply_server_fields(fields)?;
        Ok(reading)
    }

    fn parent_ref(&self) -> Option<(RecordKind, &'static str, &str)> {
        Some((RecordKind::Asset, "asset_id", &self.asset_id))
    }
}
