/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use super::{
    field_f64, field_str, field_timestamp, opt_str_value, text_enum, RecordKind, SyncEnvelope,
    SyncRecord,
};
use crate::error::Result;
use crate::remote::{format_iso8601, JsonMap};
use rusqlite::{named_params, Connection, Row};
use serde_json::{json, Value};
use sql_support::ConnExt;
use types::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetStatus {
    Operational,
    Limited,
    Down,
}

text_enum!(AssetStatus {
    Operational => "operational",
    Limited => "limited",
    Down => "down",
});

#[derive(Debug, Clone, PartialEq)]
pub struct Asset {
    pub envelope: SyncEnvelope,
    pub asset_number: String,
    pub site_id: String,
    pub name: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub status: AssetStatus,
    pub location: Option<String>,
    // The optional meter triple; all three set or none.
    pub meter_type: Option<String>,
    pub meter_unit: Option<String>,
    pub meter_current_reading: Option<f64>,
    pub created_at: Timestamp,
}

impl Asset {
    pub fn new(envelope: SyncEnvelope, asset_number: String, site_id: String, name: String) -> Self {
        let created_at = envelope.local_updated_at;
        Self {
            envelope,
            asset_number,
            site_id,
            name,
            description: None,
            category: None,
            status: AssetStatus::Operational,
            location: None,
            meter_type: None,
            meter_unit: None,
            meter_current_reading: None,
            created_at,
        }
    }
}

impl SyncRecord for Asset {
    const KIND: RecordKind = RecordKind::Asset;

    fn envelope(&self) -> &SyncEnvelope {
        &self.envelope
    }

    fn envelope_mut(&mut self) -> &mut SyncEnvelope {
        &mut self.envelope
    }

    fn from_row(row: &Row<'_>) -> Result<Self> {
        Ok(Self {
            envelope: SyncEnvelope::from_row(row)?,
            asset_number: row.get("asset_number")?,
            site_id: row.get("site_id")?,
            name: row.get("name")?,
            description: row.get("description")?,
            category: row.get("category")?,
            status: row.get("status")?,
            location: row.get("location")?,
            meter_type: row.get("meter_type")?,
            meter_unit: row.get("meter_unit")?,
            meter_current_reading: row.get("meter_current_reading")?,
            created_at: row.get("created_at")?,
        })
    }

    fn persist(&self, conn: &Connection) -> Result<()> {
        conn.execute_cached(
            "INSERT OR REPLACE INTO assets (
                guid, server_id, sync_status, local_updated_at, server_updated_at,
                asset_number, site_id, name, description, category, status,
                location, meter_type, meter_unit, meter_current_reading, created_at
            ) VALUES (
                :guid, :server_id, :sync_status, :local_updated_at, :server_updated_at,
                :asset_number, :site_id, :name, :description, :category, :status,
                :location, :meter_type, :meter_unit, :meter_current_reading, :created_at
            )",
            named_params! {
                ":guid": self.envelope.guid,
                ":server_id": self.envelope.server_id,
                ":sync_status": self.envelope.sync_status,
                ":local_updated_at": self.envelope.local_updated_at,
                ":server_updated_at": self.envelope.server_updated_at,
                ":asset_number": self.asset_number,
                ":site_id": self.site_id,
                ":name": self.name,
                ":description": self.description,
                ":category": self.category,
                ":status": self.status,
                ":location": self.location,
                ":meter_type": self.meter_type,
                ":meter_unit": self.meter_unit,
                ":meter_current_reading": self.meter_current_reading,
                ":created_at": self.created_at,
            },
        )?;
        Ok(())
    }

    fn to_server_fields(&self) -> JsonMap {
        let mut fields = JsonMap::new();
        fields.insert("asset_number".into(), json!(self.asset_number));
        fields.insert("site_id".into(), json!(self.site_id));
        fields.insert("name".into(), json!(self.name));
        fields.insert("description".into(), opt_str_value(&self.description));
        fields.insert("category".into(), opt_str_value(&self.category));
        fields.insert("status".into(), json!(self.status.as_str()));
        fields.insert("location".into(), opt_str_value(&self.location));
        fields.insert("meter_type".into(), opt_str_value(&self.meter_type));
        fields.insert("meter_unit".into(), opt_str_value(&self.meter_unit));
        fields.insert(
            "meter_current_reading".into(),
            match self.meter_current_reading {
                Some(v) => json!(v),
                None => Value::Null,
            },
        );
        fields.insert(
            "created_at".into(),
            Value::String(format_iso8601(self.created_at)),
        );
        fields
    }

    fn apply_server_fields(&mut self, fields: &JsonMap) -> Result<()> {
        if let Some(v) = field_str(fields, "asset_number") {
            self.asset_number = v;
        }
        if let Some(v) = field_str(fields, "site_id") {
            self.site_id = v;
        }
        if let Some(v) = field_str(fields, "name") {
            self.name = v;
        }
        if fields.contains_key("description") {
            self.description = field_str(fields, "description");
        }
        if fields.contains_key("category") {
            self.category = field_str(fields, "category");
        }
        if let Some(s) = field_str(fields, "status") {
            self.status = AssetStatus::from_str(&s)?;
        }
        if fields.contains_key("location") {
            self.location = field_str(fields, "location");
        }
        if fields.contains_key("meter_type") {
            self.meter_type = field_str(fields, "meter_type");
        }
        if fields.contains_key("meter_unit") {
            self.meter_unit = field_str(fields, "meter_unit");
        }
        if fields.contains_key("meter_current_reading") {
            self.meter_current_reading = field_f64(fields, "meter_current_reading");
        }
        if let Some(ts) = field_timestamp(fields, "created_at") {
            self.created_at = ts;
        }
        Ok(())
    }

    fn from_server_fields(envelope: SyncEnvelope, fields: &JsonMap) -> Result<Self> {
        let mut asset = Asset::new(envelope, String::new(), String::new(), String::new());
        asset.apply_server_fields(fields)?;
        Ok(asset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meter_reading_survives_round_trip() {
        let mut asset = Asset::new(
            SyncEnvelope::new_local("asset-1".into(), Timestamp(1000)),
            "A-17".into(),
            "site-9".into(),
            "Primary crusher".into(),
        );
        asset.meter_type = Some("hours".into());
        asset.meter_unit = Some("h".into());
        asset.meter_current_reading = Some(1500.5);

        let fields = asset.to_server_fields();
        assert_eq!(fields["meter_current_reading"], json!(1500.5));

        let envelope = SyncEnvelope::new_from_server("asset-2".into(), "A1".into(), Timestamp(2000));
        let back = Asset::from_server_fields(envelope, &fields).unwrap();
        assert_eq!(back.meter_current_reading, Some(1500.5));
        assert_eq!(back.status, AssetStatus::Operational);
    }

    #[test]
    fn test_null_clears_optional_fields() {
        let mut asset = Asset::new(
            SyncEnvelope::new_local("asset-1".into(), Timestamp(1000)),
            "A-17".into(),
            "site-9".into(),
            "Conveyor".into(),
        );
        asset.location = Some("north pit".into());
        let mut fields = JsonMap::new();
        fields.insert("location".into(), Value::Null);
        asset.apply_server_fields(&fields).unwrap();
        assert_eq!(asset.location, None);
    }
}
