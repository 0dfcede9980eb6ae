/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Per-field merging for pulls that land on locally-modified rows.
//!
//! [`resolve`] is a pure function: (local fields, server record, kind,
//! skew) in, merge outcome out. No I/O, no clock reads - the engine applies
//! the outcome in one write afterwards. Field maps are the same flat
//! snake_case shape that goes over the wire, with foreign keys already
//! rewritten to server ids by the caller so identical references compare
//! equal.
//!
//! Escalations never block a merge; they flag the row for human review and
//! ride along into the conflict log.

use crate::records::RecordKind;
use crate::remote::{JsonMap, ServerRecord};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use types::Timestamp;

/// Separator between the two halves of an `append_both` merge; ugly on
/// purpose so the technician sees both versions and cleans up.
pub const APPEND_SEPARATOR: &str = "\n---\n";

const EXTREME_READING_ABSOLUTE: f64 = 10_000.0;
const EXTREME_READING_FACTOR: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeRule {
    LastWriteWins,
    HigherWins,
    AppendBoth,
    StatusPrecedence,
    ServerWins,
    LocalWins,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Escalation {
    ExtremeReadingJump,
    DoubleCompletion,
    SignatureOverwriteAttempt,
    FailureTypeDisagreement,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldResolution {
    pub field: String,
    pub rule: MergeRule,
}

#[derive(Debug)]
pub struct MergeOutcome {
    /// At least one field genuinely diverged.
    pub has_conflict: bool,
    /// Full field map to apply locally: server values overlaid with every
    /// local win and merged text.
    pub merged_fields: JsonMap,
    pub resolutions: Vec<FieldResolution>,
    pub escalations: Vec<Escalation>,
}

impl MergeOutcome {
    pub fn auto_resolved(&self) -> bool {
        self.escalations.is_empty()
    }
}

fn rule_for(kind: RecordKind, field: &str) -> MergeRule {
    use MergeRule::*;
    match kind {
        RecordKind::WorkOrder => match field {
            "description" | "completion_notes" => AppendBoth,
            "status" => StatusPrecedence,
            "time_spent_minutes" => HigherWins,
            "wo_number" | "site_id" | "asset_id" | "created_at" => ServerWins,
            "signature_url" | "signature_at" | "signature_hash" | "signature_code" => ServerWins,
            "is_quick_log" | "needs_enrichment" => LocalWins,
            _ => LastWriteWins,
        },
        RecordKind::Asset => match field {
            "meter_current_reading" => HigherWins,
            "asset_number" | "site_id" | "created_at" => ServerWins,
            _ => LastWriteWins,
        },
        RecordKind::MeterReading => match field {
            "reading_value" => HigherWins,
            "asset_id" => ServerWins,
            _ => LastWriteWins,
        },
        RecordKind::WorkOrderPhoto => match field {
            "caption" => AppendBoth,
            "work_order_id" => ServerWins,
            "local_uri" => LocalWins,
            _ => LastWriteWins,
        },
    }
}

fn is_signature_field(kind: RecordKind, field: &str) -> bool {
    kind == RecordKind::WorkOrder
        && matches!(
            field,
            "signature_url" | "signature_at" | "signature_hash" | "signature_code"
        )
}

fn is_meter_field(kind: RecordKind, field: &str) -> bool {
    matches!(
        (kind, field),
        (RecordKind::Asset, "meter_current_reading") | (RecordKind::MeterReading, "reading_value")
    )
}

// Null and absent read the same: "this side has nothing to say".
fn non_null<'a>(v: Option<&'a Value>) -> Option<&'a Value> {
    v.filter(|v| !v.is_null())
}

fn status_precedence(s: &str) -> u8 {
    match s {
        "open" => 0,
        "in_progress" => 1,
        "completed" => 2,
        _ => 0,
    }
}

/// Merge one pending local row against the server's version of it.
pub fn resolve(
    kind: RecordKind,
    local_fields: &JsonMap,
    local_updated_at: Timestamp,
    server: &ServerRecord,
    clock_skew_ms: u64,
) -> MergeOutcome {
    let mut merged = server.fields.clone();
    let mut resolutions = Vec::new();
    let mut escalations = Vec::new();

    // Sorted union of keys so the outcome (and the audit log) doesn't
    // depend on map iteration order.
    let keys: BTreeSet<&str> = local_fields
        .keys()
        .chain(server.fields.keys())
        .map(String::as_str)
        .collect();

    for key in keys {
        let local = non_null(local_fields.get(key));
        let remote = non_null(server.fields.get(key));
        let (local, remote) = match (local, remote) {
            // Only we have a value: it stands, and it isn't a conflict.
            (Some(l), None) => {
                merged.insert(key.to_string(), l.clone());
                continue;
            }
            // Only the server has a value (or neither): merged already
            // carries it.
            (None, _) => continue,
            (Some(l), Some(r)) => {
                if l == r {
                    continue;
                }
                (l, r)
            }
        };

        let rule = rule_for(kind, key);
        match rule {
            MergeRule::LastWriteWins => {
                if lww_prefers_local(local_updated_at, server.updated_at, clock_skew_ms) {
                    merged.insert(key.to_string(), local.clone());
                }
            }
            MergeRule::HigherWins => {
                let l = local.as_f64().unwrap_or(f64::MIN);
                let r = remote.as_f64().unwrap_or(f64::MIN);
                if l > r {
                    merged.insert(key.to_string(), local.clone());
                }
                if is_meter_field(kind, key) && is_extreme_jump(l.min(r), l.max(r)) {
                    escalations.push(Escalation::ExtremeReadingJump);
                }
            }
            MergeRule::AppendBoth => {
                if let (Some(l), Some(r)) = (local.as_str(), remote.as_str()) {
                    merged.insert(key.to_string(), Value::String(append_both(l, r)));
                } else if lww_prefers_local(local_updated_at, server.updated_at, clock_skew_ms) {
                    merged.insert(key.to_string(), local.clone());
                }
            }
            MergeRule::StatusPrecedence => {
                let l = local.as_str().unwrap_or_default();
                let r = remote.as_str().unwrap_or_default();
                if status_precedence(l) > status_precedence(r) {
                    merged.insert(key.to_string(), local.clone());
                }
            }
            MergeRule::ServerWins => {
                if is_signature_field(kind, key) {
                    // Signatures are set-once: the value this device already
                    // holds stays, and the attempted replacement goes to a
                    // human.
                    merged.insert(key.to_string(), local.clone());
                    if !escalations.contains(&Escalation::SignatureOverwriteAttempt) {
                        escalations.push(Escalation::SignatureOverwriteAttempt);
                    }
                }
                // Otherwise merged already holds the server value.
            }
            MergeRule::LocalWins => {
                merged.insert(key.to_string(), local.clone());
            }
        }
        resolutions.push(FieldResolution {
            field: key.to_string(),
            rule,
        });
    }

    escalations.extend(cross_field_escalations(kind, local_fields, &server.fields));

    MergeOutcome {
        has_conflict: !resolutions.is_empty(),
        merged_fields: merged,
        resolutions,
        escalations,
    }
}

/// Within the skew window the clocks can't be trusted to order the edits,
/// so the server wins; beyond it, the later edit does.
fn lww_prefers_local(local: Timestamp, server: Timestamp, skew_ms: u64) -> bool {
    let diff = local.as_millis().abs_diff(server.as_millis());
    diff >= skew_ms && local > server
}

fn append_both(local: &str, server: &str) -> String {
    // A re-merge shouldn't stack separators forever.
    if local.contains(server) {
        return local.to_string();
    }
    if server.contains(local) {
        return server.to_string();
    }
    format!("{}{}{}", local, APPEND_SEPARATOR, server)
}

fn is_extreme_jump(lower: f64, higher: f64) -> bool {
    let jump = higher - lower;
    jump > EXTREME_READING_ABSOLUTE || (lower > 0.0 && higher > lower * EXTREME_READING_FACTOR)
}

// Escalations that need to see more than one field at a time.
fn cross_field_escalations(
    kind: RecordKind,
    local: &JsonMap,
    server: &JsonMap,
) -> Vec<Escalation> {
    let mut out = Vec::new();
    if kind != RecordKind::WorkOrder {
        return out;
    }
    let str_of = |map: &JsonMap, key: &str| -> Option<String> {
        map.get(key).and_then(Value::as_str).map(str::to_string)
    };
    let both_completed = str_of(local, "status").as_deref() == Some("completed")
        && str_of(server, "status").as_deref() == Some("completed");
    if both_completed {
        let l_by = str_of(local, "completed_by");
        let s_by = str_of(server, "completed_by");
        if l_by.is_some() && s_by.is_some() && l_by != s_by {
            out.push(Escalation::DoubleCompletion);
        }
        let l_ft = str_of(local, "failure_type");
        let s_ft = str_of(server, "failure_type");
        if let (Some(l), Some(s)) = (l_ft, s_ft) {
            if l != s && l != "none" && s != "none" {
                out.push(Escalation::FailureTypeDisagreement);
            }
        }
    }
    out
}
