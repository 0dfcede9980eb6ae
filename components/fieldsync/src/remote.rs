/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The remote-store port.
//!
//! The core is an *engine*, not a client: it never opens a socket itself.
//! The embedding application implements [`RemoteStore`] over whatever
//! transport it has, and normalizes every failure into a [`RemoteError`]
//! before it reaches us - classification (see `classify`) only ever looks at
//! that one shape, instead of sniffing arbitrary error objects.

use crate::records::RecordKind;
use chrono::{DateTime, SecondsFormat};
use serde_json::{Map, Value};
use std::fmt;
use types::Timestamp;

pub type JsonMap = Map<String, Value>;

/// The normalized failure shape every `RemoteStore` method reports.
///
/// `status` is HTTP-like but may be synthesized (a raw socket failure has
/// none); `code` is a short machine code when the backend provides one (e.g.
/// PostgREST's `PGRST204`); `message` is always present and is surfaced
/// verbatim as the "technical message".
#[derive(Debug)]
pub struct RemoteError {
    pub status: Option<u16>,
    pub code: Option<String>,
    pub message: String,
    pub source: Option<anyhow::Error>,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "[{}] {}", status, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for RemoteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| {
            let source: &(dyn std::error::Error + Send + Sync + 'static) = e.as_ref();
            source as &(dyn std::error::Error + 'static)
        })
    }
}

impl RemoteError {
    pub fn new(status: Option<u16>, code: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.map(str::to_string),
            message: message.into(),
            source: None,
        }
    }

    /// A transport-level failure with no HTTP exchange at all.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(None, None, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(Some(408), None, message)
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::new(Some(status), None, message)
    }

    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }
}

/// One row as the server hands it back: its authoritative id, its update
/// time (already converted from the wire's ISO-8601 to milliseconds), and
/// the remaining domain fields as a flat snake_case map.
#[derive(Debug, Clone)]
pub struct ServerRecord {
    pub id: String,
    pub updated_at: Timestamp,
    pub fields: JsonMap,
}

impl ServerRecord {
    /// Split a wire row into id / updated_at / everything else. Rows missing
    /// either key are malformed - the server always includes both.
    pub fn from_wire(row: Value) -> Result<Self, RemoteError> {
        let mut fields = match row {
            Value::Object(map) => map,
            other => {
                return Err(RemoteError::new(
                    None,
                    Some("bad-row"),
                    format!("server row is not an object: {}", other),
                ))
            }
        };
        let id = match fields.remove("id") {
            Some(Value::String(s)) if !s.is_empty() => s,
            _ => {
                return Err(RemoteError::new(
                    None,
                    Some("bad-row"),
                    "server row has no id",
                ))
            }
        };
        let updated_at = match fields.remove("updated_at") {
            Some(Value::String(s)) => parse_iso8601(&s).ok_or_else(|| {
                RemoteError::new(
                    None,
                    Some("bad-row"),
                    format!("unparseable updated_at: {}", s),
                )
            })?,
            _ => {
                return Err(RemoteError::new(
                    None,
                    Some("bad-row"),
                    "server row has no updated_at",
                ))
            }
        };
        Ok(Self {
            id,
            updated_at,
            fields,
        })
    }
}

/// What the engine needs from the authoritative service. Implementations
/// must apply the configured per-call timeout and are expected to be
/// blocking; the engine owns scheduling.
pub trait RemoteStore: Send + Sync {
    /// Rows of `kind` changed strictly after `since` (all rows when `None`).
    fn fetch_since(
        &self,
        kind: RecordKind,
        since: Option<Timestamp>,
    ) -> Result<Vec<ServerRecord>, RemoteError>;

    /// Create-or-update one row. Idempotent by server id when the body
    /// carries `id`; creates otherwise. Returns the full canonical row.
    fn upsert(&self, kind: RecordKind, body: &JsonMap) -> Result<ServerRecord, RemoteError>;

    /// Upload opaque bytes, returning the public URL.
    fn upload_blob(&self, path: &str, bytes: &[u8]) -> Result<String, RemoteError>;
}

/// "1970-01-01T00:00:02Z" -> 2000. Accepts any RFC-3339 offset and
/// normalizes to UTC milliseconds.
pub fn parse_iso8601(s: &str) -> Option<Timestamp> {
    let dt = DateTime::parse_from_rfc3339(s).ok()?;
    let ms = dt.timestamp_millis();
    if ms < 0 {
        return None;
    }
    Some(Timestamp(ms as u64))
}

pub fn format_iso8601(ts: Timestamp) -> String {
    match DateTime::from_timestamp_millis(ts.as_millis_i64()) {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
        // Out-of-range timestamps can't come from `Timestamp`, but don't
        // panic over it.
        None => "1970-01-01T00:00:00.000Z".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_iso8601_round_trip() {
        assert_eq!(parse_iso8601("1970-01-01T00:00:02Z"), Some(Timestamp(2000)));
        assert_eq!(
            parse_iso8601("2024-05-01T10:30:00.250+02:00"),
            Some(Timestamp(1_714_552_200_250))
        );
        assert_eq!(parse_iso8601("not a date"), None);
        let ts = Timestamp(1_714_552_200_250);
        assert_eq!(parse_iso8601(&format_iso8601(ts)), Some(ts));
    }

    #[test]
    fn test_server_record_from_wire() {
        let record = ServerRecord::from_wire(json!({
            "id": "S1",
            "updated_at": "1970-01-01T00:00:02Z",
            "title": "Replace hose",
            "priority": "high",
        }))
        .unwrap();
        assert_eq!(record.id, "S1");
        assert_eq!(record.updated_at, Timestamp(2000));
        assert_eq!(record.fields["title"], "Replace hose");
        // id/updated_at are not left in the field map.
        assert!(!record.fields.contains_key("id"));
        assert!(!record.fields.contains_key("updated_at"));
    }

    #[test]
    fn test_server_record_rejects_malformed() {
        assert!(ServerRecord::from_wire(json!({"updated_at": "1970-01-01T00:00:02Z"})).is_err());
        assert!(ServerRecord::from_wire(json!({"id": "S1"})).is_err());
        assert!(ServerRecord::from_wire(json!({"id": "S1", "updated_at": "garbage"})).is_err());
        assert!(ServerRecord::from_wire(json!([1, 2])).is_err());
    }

    #[test]
    fn test_remote_error_display() {
        let e = RemoteError::http(503, "service unavailable");
        assert_eq!(e.to_string(), "[503] service unavailable");
        let e = RemoteError::network("connection refused");
        assert_eq!(e.to_string(), "connection refused");
    }
}
