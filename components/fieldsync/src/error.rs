/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use crate::remote::RemoteError;

/// The taxonomy every failure is sorted into, independent of how it arrived
/// (HTTP status, thrown message, synthesized code). The retry queue, the
/// status surface and the user-facing messages all key off this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Transient(TransientKind),
    Auth(AuthKind),
    Validation(ValidationKind),
    Permanent(PermanentKind),
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    Network,
    Timeout,
    RateLimited,
    ServiceUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
    TokenExpired,
    Forbidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationKind {
    BadRequest,
    ConstraintViolation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermanentKind {
    NotFound,
    ServerError,
}

impl ErrorCategory {
    /// The coarse bucket persisted on retry-queue entries and used to pick
    /// backoff caps. Rate limiting gets its own bucket; the other transient
    /// kinds share one.
    pub fn bucket(&self) -> &'static str {
        match self {
            ErrorCategory::Transient(TransientKind::RateLimited) => "transient-rate-limited",
            ErrorCategory::Transient(_) => "transient",
            ErrorCategory::Auth(_) => "auth",
            ErrorCategory::Validation(_) => "validation",
            ErrorCategory::Permanent(_) => "permanent",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Error executing SQL: {0}")]
    SqlError(#[from] rusqlite::Error),

    #[error("Error opening database: {0}")]
    OpenDatabaseError(#[from] sql_support::open_database::Error),

    #[error("Error parsing JSON data: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Remote operation failed: {0}")]
    Remote(#[from] RemoteError),

    #[error("Authentication required")]
    AuthRequired,

    #[error("Sync envelope violation: {0}")]
    EnvelopeViolation(String),

    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    #[error("The operation was interrupted")]
    Interrupted(#[from] interrupt_support::Interrupted),

    #[error("Unexpected error: {0}")]
    Unexpected(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
