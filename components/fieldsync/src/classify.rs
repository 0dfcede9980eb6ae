/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Sorts remote failures into retry/no-retry buckets.
//!
//! Everything downstream - the retry queue's budgets and backoff caps, the
//! "please sign in again" prompt, the blocking-issues list - keys off the
//! output of [`classify`]. It's a pure function over the normalized
//! [`RemoteError`] shape: same error in, same classification out.

use crate::error::{AuthKind, ErrorCategory, PermanentKind, TransientKind, ValidationKind};
use crate::remote::RemoteError;

#[derive(Debug, Clone)]
pub struct Classified {
    pub category: ErrorCategory,
    pub should_retry: bool,
    pub max_retries: u32,
    pub requires_user_action: bool,
    pub http_status: Option<u16>,
    /// Fixed per-category string, safe to show in the UI.
    pub user_message: &'static str,
    /// Whatever the error actually said, for logs and the queue.
    pub technical_message: String,
}

pub fn classify(err: &RemoteError) -> Classified {
    let category = categorize(err);
    let (should_retry, max_retries) = retry_budget(category);
    Classified {
        category,
        should_retry,
        max_retries,
        requires_user_action: matches!(category, ErrorCategory::Auth(_)),
        http_status: effective_status(err),
        user_message: user_message(category),
        technical_message: err.message.clone(),
    }
}

/// The status we classify on: the explicit one if present, else one parsed
/// out of a PostgREST-style `PGRST<NNN>` code (NNN >= 300 mirrors an HTTP
/// status closely enough to reuse the same table).
fn effective_status(err: &RemoteError) -> Option<u16> {
    if err.status.is_some() {
        return err.status;
    }
    let code = err.code.as_deref()?;
    let n: u16 = code.strip_prefix("PGRST")?.parse().ok()?;
    if n >= 300 {
        Some(n)
    } else {
        None
    }
}

fn categorize(err: &RemoteError) -> ErrorCategory {
    let message = err.message.to_lowercase();

    // Timeouts first: a 400 with "timed out" in the body is a timeout, not
    // bad data.
    if contains_any(&message, &["timeout", "timed out"]) {
        return ErrorCategory::Transient(TransientKind::Timeout);
    }

    // A bare message with no status at all is usually the transport talking.
    let status = effective_status(err);
    if status.is_none() && looks_like_network_error(&message) {
        return ErrorCategory::Transient(TransientKind::Network);
    }

    if let Some(status) = status {
        match status {
            408 => return ErrorCategory::Transient(TransientKind::Timeout),
            503 | 504 => return ErrorCategory::Transient(TransientKind::ServiceUnavailable),
            429 => return ErrorCategory::Transient(TransientKind::RateLimited),
            401 => return ErrorCategory::Auth(AuthKind::TokenExpired),
            403 => return ErrorCategory::Auth(AuthKind::Forbidden),
            400 => return ErrorCategory::Validation(ValidationKind::BadRequest),
            422 => return ErrorCategory::Validation(ValidationKind::ConstraintViolation),
            404 => return ErrorCategory::Permanent(PermanentKind::NotFound),
            500..=599 => return ErrorCategory::Permanent(PermanentKind::ServerError),
            _ => {}
        }
    }

    if contains_any(&message, &["rate limit", "throttle", "quota"]) {
        return ErrorCategory::Transient(TransientKind::RateLimited);
    }
    if contains_any(&message, &["unauthorized", "jwt expired", "invalid token"]) {
        return ErrorCategory::Auth(AuthKind::TokenExpired);
    }
    if contains_any(&message, &["forbidden"]) {
        return ErrorCategory::Auth(AuthKind::Forbidden);
    }
    if contains_any(&message, &["invalid input", "constraint violation", "malformed"]) {
        return ErrorCategory::Validation(ValidationKind::BadRequest);
    }
    if looks_like_network_error(&message) {
        return ErrorCategory::Transient(TransientKind::Network);
    }

    ErrorCategory::Unknown
}

fn looks_like_network_error(message: &str) -> bool {
    contains_any(
        message,
        &[
            "network",
            "connection",
            "offline",
            "unreachable",
            "dns",
            "socket",
            "fetch failed",
        ],
    )
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

fn retry_budget(category: ErrorCategory) -> (bool, u32) {
    match category {
        ErrorCategory::Transient(TransientKind::RateLimited) => (true, 5),
        ErrorCategory::Transient(_) => (true, 10),
        ErrorCategory::Auth(_) => (false, 0),
        ErrorCategory::Validation(_) => (false, 0),
        ErrorCategory::Permanent(_) => (false, 0),
        ErrorCategory::Unknown => (true, 3),
    }
}

fn user_message(category: ErrorCategory) -> &'static str {
    match category {
        ErrorCategory::Transient(TransientKind::RateLimited) => {
            "Server is busy; sync will retry shortly"
        }
        ErrorCategory::Transient(_) => "Server is temporarily busy",
        ErrorCategory::Auth(_) => "Please sign in again",
        ErrorCategory::Validation(_) => "Data validation failed",
        ErrorCategory::Permanent(_) => "The server rejected this change",
        ErrorCategory::Unknown => "Something went wrong; sync will retry",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket_of(err: RemoteError) -> &'static str {
        classify(&err).category.bucket()
    }

    #[test]
    fn test_status_table() {
        // (status, expected bucket, should_retry, max_retries)
        let cases: &[(u16, &str, bool, u32)] = &[
            (408, "transient", true, 10),
            (503, "transient", true, 10),
            (504, "transient", true, 10),
            (429, "transient-rate-limited", true, 5),
            (401, "auth", false, 0),
            (403, "auth", false, 0),
            (400, "validation", false, 0),
            (422, "validation", false, 0),
            (404, "permanent", false, 0),
            (500, "permanent", false, 0),
            (502, "permanent", false, 0),
        ];
        for &(status, bucket, retry, budget) in cases {
            let c = classify(&RemoteError::http(status, "whatever"));
            assert_eq!(c.category.bucket(), bucket, "status {}", status);
            assert_eq!(c.should_retry, retry, "status {}", status);
            assert_eq!(c.max_retries, budget, "status {}", status);
        }
    }

    #[test]
    fn test_message_table() {
        let cases: &[(&str, &str)] = &[
            ("Network request failed", "transient"),
            ("connection reset by peer", "transient"),
            ("DNS lookup failed", "transient"),
            ("rate limit exceeded", "transient-rate-limited"),
            ("request quota exhausted", "transient-rate-limited"),
            ("JWT expired", "auth"),
            ("invalid token provided", "auth"),
            ("Unauthorized", "auth"),
            ("invalid input syntax for type uuid", "validation"),
            ("constraint violation on wo_number", "validation"),
            ("malformed payload", "validation"),
            ("the frobnicator exploded", "unknown"),
        ];
        for &(message, bucket) in cases {
            assert_eq!(bucket_of(RemoteError::network(message)), bucket, "{}", message);
        }
    }

    #[test]
    fn test_timeout_beats_validation() {
        // Status says bad request; message says the request never finished.
        let err = RemoteError::http(400, "upstream request timed out");
        assert_eq!(
            classify(&err).category,
            ErrorCategory::Transient(TransientKind::Timeout)
        );
    }

    #[test]
    fn test_network_pattern_beats_nothing_but_not_status() {
        // Bare message object: network wins.
        assert_eq!(bucket_of(RemoteError::network("connection refused")), "transient");
        // With a real status, the status wins.
        let err = RemoteError::http(422, "connection field is malformed");
        assert_eq!(
            classify(&err).category,
            ErrorCategory::Validation(ValidationKind::ConstraintViolation)
        );
    }

    #[test]
    fn test_pgrst_codes() {
        let err = RemoteError::new(None, Some("PGRST301"), "JWT expired");
        let c = classify(&err);
        assert_eq!(c.category, ErrorCategory::Auth(AuthKind::TokenExpired));
        assert_eq!(c.http_status, Some(301));
        // Codes below 300 don't map to a status; the message decides.
        let err = RemoteError::new(None, Some("PGRST100"), "parsing error in filter");
        assert_eq!(classify(&err).category.bucket(), "unknown");
    }

    #[test]
    fn test_classifier_is_deterministic() {
        let err = RemoteError::http(503, "Service Unavailable");
        let a = classify(&err);
        let b = classify(&err);
        assert_eq!(a.category, b.category);
        assert_eq!(a.user_message, b.user_message);
        assert_eq!(a.technical_message, b.technical_message);
        assert_eq!(a.user_message, "Server is temporarily busy");
    }

    #[test]
    fn test_technical_message_is_verbatim() {
        let err = RemoteError::http(500, "ERROR 1337: spline reticulation failed");
        assert_eq!(
            classify(&err).technical_message,
            "ERROR 1337: spline reticulation failed"
        );
    }
}
