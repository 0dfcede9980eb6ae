/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use super::{
    field_bool, field_i64, field_str, field_timestamp, opt_str_value, opt_ts_value, text_enum,
    RecordKind, SyncEnvelope, SyncRecord,
};
use crate::error::Result;
use crate::remote::{format_iso8601, JsonMap};
use rusqlite::{named_params, Connection, Row};
use serde_json::{json, Value};
use sql_support::ConnExt;
use types::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Low,
    Medium,
    High,
    Emergency,
}

text_enum!(Priority {
    Low => "low",
    Medium => "medium",
    High => "high",
    Emergency => "emergency",
});

impl Priority {
    /// Base retry-queue priority; emergencies jump the line.
    pub fn queue_rank(self) -> i64 {
        match self {
            Priority::Emergency => 0,
            Priority::High => 50,
            Priority::Medium => 100,
            Priority::Low => 150,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOrderStatus {
    Open,
    InProgress,
    Completed,
}

text_enum!(WorkOrderStatus {
    Open => "open",
    InProgress => "in_progress",
    Completed => "completed",
});

impl WorkOrderStatus {
    /// Ordering for the status-precedence merge rule: work never moves
    /// backwards just because another device is behind.
    pub fn precedence(self) -> u8 {
        match self {
            WorkOrderStatus::Open => 0,
            WorkOrderStatus::InProgress => 1,
            WorkOrderStatus::Completed => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    None,
    WoreOut,
    Broke,
    Unknown,
}

text_enum!(FailureType {
    None => "none",
    WoreOut => "wore_out",
    Broke => "broke",
    Unknown => "unknown",
});

#[derive(Debug, Clone, PartialEq)]
pub struct WorkOrder {
    pub envelope: SyncEnvelope,
    pub wo_number: String,
    pub site_id: String,
    pub asset_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub priority: Priority,
    pub status: WorkOrderStatus,
    pub assigned_to: Option<String>,
    pub due_at: Option<Timestamp>,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub completed_by: Option<String>,
    pub completion_notes: Option<String>,
    pub failure_type: FailureType,
    pub time_spent_minutes: i64,
    pub signature_url: Option<String>,
    pub signature_at: Option<Timestamp>,
    pub signature_hash: Option<String>,
    pub signature_code: Option<String>,
    pub voice_note_url: Option<String>,
    /// Quick logs are captured with the bare minimum of fields in the field
    /// and filled in back at the office.
    pub needs_enrichment: bool,
    pub is_quick_log: bool,
    pub created_at: Timestamp,
}

impl WorkOrder {
    pub fn new(envelope: SyncEnvelope, wo_number: String, site_id: String, title: String) -> Self {
        let created_at = envelope.local_updated_at;
        Self {
            envelope,
            wo_number,
            site_id,
            asset_id: None,
            title,
            description: None,
            priority: Priority::Medium,
            status: WorkOrderStatus::Open,
            assigned_to: None,
            due_at: None,
            started_at: None,
            completed_at: None,
            completed_by: None,
            completion_notes: None,
            failure_type: FailureType::None,
            time_spent_minutes: 0,
            signature_url: None,
            signature_at: None,
            signature_hash: None,
            signature_code: None,
            voice_note_url: None,
            needs_enrichment: false,
            is_quick_log: false,
            created_at,
        }
    }
}

impl SyncRecord for WorkOrder {
    const KIND: RecordKind = RecordKind::WorkOrder;

    fn envelope(&self) -> &SyncEnvelope {
        &self.envelope
    }

    fn envelope_mut(&mut self) -> &mut SyncEnvelope {
        &mut self.envelope
    }

    fn from_row(row: &Row<'_>) -> Result<Self> {
        Ok(Self {
            envelope: SyncEnvelope::from_row(row)?,
            wo_number: row.get("wo_number")?,
            site_id: row.get("site_id")?,
            asset_id: row.get("asset_id")?,
            title: row.get("title")?,
            description: row.get("description")?,
            priority: row.get("priority")?,
            status: row.get("status")?,
            assigned_to: row.get("assigned_to")?,
            due_at: row.get("due_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            completed_by: row.get("completed_by")?,
            completion_notes: row.get("completion_notes")?,
            failure_type: row.get("failure_type")?,
            time_spent_minutes: row.get("time_spent_minutes")?,
            signature_url: row.get("signature_url")?,
            signature_at: row.get("signature_at")?,
            signature_hash: row.get("signature_hash")?,
            signature_code: row.get("signature_code")?,
            voice_note_url: row.get("voice_note_url")?,
            needs_enrichment: row.get("needs_enrichment")?,
            is_quick_log: row.get("is_quick_log")?,
            created_at: row.get("created_at")?,
        })
    }

    fn persist(&self, conn: &Connection) -> Result<()> {
        conn.execute_cached(
            "INSERT OR REPLACE INTO work_orders (
                guid, server_id, sync_status, local_updated_at, server_updated_at,
                wo_number, site_id, asset_id, title, description, priority, status,
                assigned_to, due_at, started_at, completed_at, completed_by,
                completion_notes, failure_type, time_spent_minutes,
                signature_url, signature_at, signature_hash, signature_code,
                voice_note_url, needs_enrichment, is_quick_log, created_at
            ) VALUES (
                :guid, :server_id, :sync_status, :local_updated_at, :server_updated_at,
                :wo_number, :site_id, :asset_id, :title, :description, :priority, :status,
                :assigned_to, :due_at, :started_at, :completed_at, :completed_by,
                :completion_notes, :failure_type, :time_spent_minutes,
                :signature_url, :signature_at, :signature_hash, :signature_code,
                :voice_note_url, :needs_enrichment, :is_quick_log, :created_at
            )",
            named_params! {
                ":guid": self.envelope.guid,
                ":server_id": self.envelope.server_id,
                ":sync_status": self.envelope.sync_status,
                ":local_updated_at": self.envelope.local_updated_at,
                ":server_updated_at": self.envelope.server_updated_at,
                ":wo_number": self.wo_number,
                ":site_id": self.site_id,
                ":asset_id": self.asset_id,
                ":title": self.title,
                ":description": self.description,
                ":priority": self.priority,
                ":status": self.status,
                ":assigned_to": self.assigned_to,
                ":due_at": self.due_at,
                ":started_at": self.started_at,
                ":completed_at": self.completed_at,
                ":completed_by": self.completed_by,
                ":completion_notes": self.completion_notes,
                ":failure_type": self.failure_type,
                ":time_spent_minutes": self.time_spent_minutes,
                ":signature_url": self.signature_url,
                ":signature_at": self.signature_at,
                ":signature_hash": self.signature_hash,
                ":signature_code": self.signature_code,
                ":voice_note_url": self.voice_note_url,
                ":needs_enrichment": self.needs_enrichment,
                ":is_quick_log": self.is_quick_log,
                ":created_at": self.created_at,
            },
        )?;
        Ok(())
    }

    fn to_server_fields(&self) -> JsonMap {
        let mut fields = JsonMap::new();
        fields.insert("wo_number".into(), json!(self.wo_number));
        fields.insert("site_id".into(), json!(self.site_id));
        fields.insert("asset_id".into(), opt_str_value(&self.asset_id));
        fields.insert("title".into(), json!(self.title));
        fields.insert("description".into(), opt_str_value(&self.description));
        fields.insert("priority".into(), json!(self.priority.as_str()));
        fields.insert("status".into(), json!(self.status.as_str()));
        fields.insert("assigned_to".into(), opt_str_value(&self.assigned_to));
        fields.insert("due_at".into(), opt_ts_value(&self.due_at));
        fields.insert("started_at".into(), opt_ts_value(&self.started_at));
        fields.insert("completed_at".into(), opt_ts_value(&self.completed_at));
        fields.insert("completed_by".into(), opt_str_value(&self.completed_by));
        fields.insert(
            "completion_notes".into(),
            opt_str_value(&self.completion_notes),
        );
        fields.insert("failure_type".into(), json!(self.failure_type.as_str()));
        fields.insert("time_spent_minutes".into(), json!(self.time_spent_minutes));
        fields.insert("signature_url".into(), opt_str_value(&self.signature_url));
        fields.insert("signature_at".into(), opt_ts_value(&self.signature_at));
        fields.insert("signature_hash".into(), opt_str_value(&self.signature_hash));
        fields.insert("signature_code".into(), opt_str_value(&self.signature_code));
        fields.insert("voice_note_url".into(), opt_str_value(&self.voice_note_url));
        fields.insert("needs_enrichment".into(), json!(self.needs_enrichment));
        fields.insert("is_quick_log".into(), json!(self.is_quick_log));
        fields.insert(
            "created_at".into(),
            Value::String(format_iso8601(self.created_at)),
        );
        fields
    }

    fn apply_server_fields(&mut self, fields: &JsonMap) -> Result<()> {
        if let Some(v) = field_str(fields, "wo_number") {
            self.wo_number = v;
        }
        if let Some(v) = field_str(fields, "site_id") {
            self.site_id = v;
        }
        if fields.contains_key("asset_id") {
            self.asset_id = field_str(fields, "asset_id");
        }
        if let Some(v) = field_str(fields, "title") {
            self.title = v;
        }
        if fields.contains_key("description") {
            self.description = field_str(fields, "description");
        }
        if let Some(s) = field_str(fields, "priority") {
            self.priority = Priority::from_str(&s)?;
        }
        if let Some(s) = field_str(fields, "status") {
            self.status = WorkOrderStatus::from_str(&s)?;
        }
        if fields.contains_key("assigned_to") {
            self.assigned_to = field_str(fields, "assigned_to");
        }
        if fields.contains_key("due_at") {
            self.due_at = field_timestamp(fields, "due_at");
        }
        if fields.contains_key("started_at") {
            self.started_at = field_timestamp(fields, "started_at");
        }
        if fields.contains_key("completed_at") {
            self.completed_at = field_timestamp(fields, "completed_at");
        }
        if fields.contains_key("completed_by") {
            self.completed_by = field_str(fields, "completed_by");
        }
        if fields.contains_key("completion_notes") {
            self.completion_notes = field_str(fields, "completion_notes");
        }
        if let Some(s) = field_str(fields, "failure_type") {
            self.failure_type = FailureType::from_str(&s)?;
        }
        if let Some(v) = field_i64(fields, "time_spent_minutes") {
            self.time_spent_minutes = v;
        }
        if fields.contains_key("signature_url") {
            self.signature_url = field_str(fields, "signature_url");
        }
        if fields.contains_key("signature_at") {
            self.signature_at = field_timestamp(fields, "signature_at");
        }
        if fields.contains_key("signature_hash") {
            self.signature_hash = field_str(fields, "signature_hash");
        }
        if fields.contains_key("signature_code") {
            self.signature_code = field_str(fields, "signature_code");
        }
        if fields.contains_key("voice_note_url") {
            self.voice_note_url = field_str(fields, "voice_note_url");
        }
        if let Some(v) = field_bool(fields, "needs_enrichment") {
            self.needs_enrichment = v;
        }
        if let Some(v) = field_bool(fields, "is_quick_log") {
            self.is_quick_log = v;
        }
        if let Some(ts) = field_timestamp(fields, "created_at") {
            self.created_at = ts;
        }
        Ok(())
    }

    fn from_server_fields(envelope: SyncEnvelope, fields: &JsonMap) -> Result<Self> {
        let mut wo = WorkOrder::new(envelope, String::new(), String::new(), String::new());
        wo.apply_server_fields(fields)?;
        Ok(wo)
    }

    fn parent_ref(&self) -> Option<(RecordKind, &'static str, &str)> {
        self.asset_id
            .as_deref()
            .map(|guid| (RecordKind::Asset, "asset_id", guid))
    }

    fn push_priority(&self) -> i64 {
        // Updates to rows the server already has are less urgent than
        // getting a new work order up at all.
        let update_penalty = if self.envelope.server_id.is_some() {
            200
        } else {
            0
        };
        self.priority.queue_rank() + update_penalty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::SyncStatus;

    fn sample() -> WorkOrder {
        let mut wo = WorkOrder::new(
            SyncEnvelope::new_local("wo-1".into(), Timestamp(1000)),
            "WO-1042".into(),
            "site-9".into(),
            "Replace hose".into(),
        );
        wo.priority = Priority::High;
        wo.description = Some("leaks left side".into());
        wo
    }

    #[test]
    fn test_enum_round_trips() {
        for p in [
            Priority::Low,
            Priority::Medium,
            Priority::High,
            Priority::Emergency,
        ] {
            assert_eq!(Priority::from_str(p.as_str()).unwrap(), p);
        }
        assert!(Priority::from_str("urgent").is_err());
        assert_eq!(
            WorkOrderStatus::from_str("in_progress").unwrap(),
            WorkOrderStatus::InProgress
        );
        assert_eq!(FailureType::from_str("wore_out").unwrap(), FailureType::WoreOut);
    }

    #[test]
    fn test_server_fields_round_trip() {
        let wo = sample();
        let fields = wo.to_server_fields();
        assert_eq!(fields["title"], "Replace hose");
        assert_eq!(fields["priority"], "high");
        assert_eq!(fields["asset_id"], Value::Null);

        let envelope = SyncEnvelope::new_from_server("wo-2".into(), "S1".into(), Timestamp(2000));
        let back = WorkOrder::from_server_fields(envelope, &fields).unwrap();
        assert_eq!(back.title, wo.title);
        assert_eq!(back.priority, wo.priority);
        assert_eq!(back.description, wo.description);
        assert_eq!(back.created_at, wo.created_at);
        assert_eq!(back.envelope.sync_status, SyncStatus::Synced);
    }

    #[test]
    fn test_push_priority() {
        let mut wo = sample();
        assert_eq!(wo.push_priority(), 50);
        wo.priority = Priority::Emergency;
        assert_eq!(wo.push_priority(), 0);
        wo.envelope.set_server_id("S1".into()).unwrap();
        assert_eq!(wo.push_priority(), 200);
    }

    #[test]
    fn test_parent_ref_follows_asset() {
        let mut wo = sample();
        assert!(wo.parent_ref().is_none());
        wo.asset_id = Some("asset-7".into());
        let (kind, field, guid) = wo.parent_ref().unwrap();
        assert_eq!(kind, RecordKind::Asset);
        assert_eq!(field, "asset_id");
        assert_eq!(guid, "asset-7");
    }
}
