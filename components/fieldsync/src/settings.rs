/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

/// Tunables consumed by the sync core. The embedding application constructs
/// one of these (usually `Default::default()`) and hands it to the store;
/// nothing here is read from disk.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Upper bound on retry-queue entries processed per sync cycle.
    pub max_retry_items_per_cycle: u32,
    /// Consider an access token stale this long before its actual expiry.
    pub token_refresh_skew_ms: u64,
    /// How long past expiry an access token may still be used while the
    /// refresh endpoint is unreachable.
    pub offline_token_grace_ms: u64,
    /// Skip photo/signature blob uploads unless the device is on WiFi.
    pub blob_requires_wifi: bool,
    /// An in-progress retry-queue lease older than this is considered
    /// abandoned and recovered at the start of the next cycle.
    pub lease_timeout_ms: u64,
    /// Conflict-log entries older than this are pruned.
    pub conflict_log_retention_ms: u64,
    /// Two timestamps closer than this are treated as simultaneous during
    /// last-write-wins merging.
    pub clock_skew_tolerance_ms: u64,
    /// Per-call timeout the remote-store implementation should apply. The
    /// core doesn't enforce this itself; it's plumbed through so the host's
    /// client and the engine agree on one number.
    pub remote_timeout_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_retry_items_per_cycle: 25,
            token_refresh_skew_ms: 5 * 60 * 1000,
            offline_token_grace_ms: 7 * 24 * 60 * 60 * 1000,
            blob_requires_wifi: true,
            lease_timeout_ms: 2 * 60 * 1000,
            conflict_log_retention_ms: 90 * 24 * 60 * 60 * 1000,
            clock_skew_tolerance_ms: 2000,
            remote_timeout_ms: 30 * 1000,
        }
    }
}
