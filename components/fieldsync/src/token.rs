/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Access-token lifecycle with an offline grace window.
//!
//! Technicians spend days at sites with no coverage, so "token expired"
//! must not mean "app stops working". The policy:
//!
//! 1. token comfortably fresh -> use it;
//! 2. stale or nearly so -> try the refresh endpoint;
//! 3. refresh unreachable -> keep using the stale token for up to the
//!    offline grace window (the first online sync may then eat a 401, get
//!    classified as auth, and the next cycle refreshes for real);
//! 4. grace exhausted -> give up and make the user sign in again.

use crate::ports::{Clock, SecureStore};
use crate::settings::SyncSettings;
use std::sync::Arc;
use types::Timestamp;

pub const ACCESS_TOKEN_KEY: &str = "auth.access_token";
pub const REFRESH_TOKEN_KEY: &str = "auth.refresh_token";
pub const USER_ID_KEY: &str = "auth.user_id";
pub const SITE_ID_KEY: &str = "auth.site_id";
pub const TOKEN_EXPIRY_KEY: &str = "auth.token_expiry_ms";

/// What a successful refresh hands back.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: Timestamp,
}

/// The refresh endpoint, behind a trait so tests can make it succeed, fail,
/// or take forever.
pub trait TokenRefresher: Send + Sync {
    fn refresh(&self, refresh_token: &str) -> anyhow::Result<RefreshedToken>;
}

pub struct TokenManager {
    secure: Arc<dyn SecureStore>,
    refresher: Arc<dyn TokenRefresher>,
    clock: Arc<dyn Clock>,
    refresh_skew_ms: u64,
    offline_grace_ms: u64,
}

impl TokenManager {
    pub fn new(
        secure: Arc<dyn SecureStore>,
        refresher: Arc<dyn TokenRefresher>,
        clock: Arc<dyn Clock>,
        settings: &SyncSettings,
    ) -> Self {
        Self {
            secure,
            refresher,
            clock,
            refresh_skew_ms: settings.token_refresh_skew_ms,
            offline_grace_ms: settings.offline_token_grace_ms,
        }
    }

    fn stored_expiry(&self) -> Option<Timestamp> {
        self.secure
            .get(TOKEN_EXPIRY_KEY)
            .and_then(|s| s.parse::<u64>().ok())
            .map(Timestamp)
    }

    fn store_refreshed(&self, token: &RefreshedToken) {
        self.secure.put(ACCESS_TOKEN_KEY, &token.access_token);
        self.secure.put(REFRESH_TOKEN_KEY, &token.refresh_token);
        self.secure
            .put(TOKEN_EXPIRY_KEY, &token.expires_at.as_millis().to_string());
    }

    /// The access token the next remote call should present, or `None` when
    /// there's nothing usable and the user must re-authenticate.
    pub fn ensure_valid_token(&self) -> Option<String> {
        let access_token = self.secure.get(ACCESS_TOKEN_KEY)?;
        let expiry = self.stored_expiry().unwrap_or(Timestamp(0));
        let now = self.clock.now();

        if now + std::time::Duration::from_millis(self.refresh_skew_ms) < expiry {
            return Some(access_token);
        }

        match self.secure.get(REFRESH_TOKEN_KEY) {
            Some(refresh_token) => match self.refresher.refresh(&refresh_token) {
                Ok(refreshed) => {
                    log::debug!("access token refreshed, new expiry {}", refreshed.expires_at);
                    self.store_refreshed(&refreshed);
                    Some(refreshed.access_token)
                }
                Err(e) => {
                    log::warn!("token refresh failed: {:#}", e);
                    self.grace_token(access_token, expiry, now)
                }
            },
            None => self.grace_token(access_token, expiry, now),
        }
    }

    // Refresh didn't happen. An expired token is still presentable inside
    // the offline grace window; past that we force a re-login.
    fn grace_token(&self, access_token: String, expiry: Timestamp, now: Timestamp) -> Option<String> {
        let grace_end = expiry + std::time::Duration::from_millis(self.offline_grace_ms);
        if now <= grace_end {
            log::debug!(
                "using stale access token inside offline grace ({}ms past expiry)",
                now.millis_since(expiry)
            );
            Some(access_token)
        } else {
            log::warn!("access token past offline grace; re-authentication required");
            None
        }
    }

    /// Wipe stored credentials (sign-out, or a refresh-token revocation).
    pub fn clear(&self) {
        self.secure.delete(ACCESS_TOKEN_KEY);
        self.secure.delete(REFRESH_TOKEN_KEY);
        self.secure.delete(TOKEN_EXPIRY_KEY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::MemorySecureStore;
    use std::cell::Cell;
    use std::sync::Mutex;

    // A clock tests can wind by hand. The Cell is behind a Mutex only
    // because Clock is Send + Sync; tests are single-threaded.
    struct FakeClock(Mutex<Cell<u64>>);

    impl FakeClock {
        fn at(ms: u64) -> Arc<Self> {
            Arc::new(Self(Mutex::new(Cell::new(ms))))
        }
        fn set(&self, ms: u64) {
            self.0.lock().unwrap().set(ms);
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> Timestamp {
            Timestamp(self.0.lock().unwrap().get())
        }
        fn sleep(&self, _ms: u64) {}
    }

    enum RefreshBehavior {
        Succeed,
        Fail,
    }

    struct FakeRefresher {
        behavior: Mutex<RefreshBehavior>,
        calls: Mutex<Cell<u32>>,
    }

    impl FakeRefresher {
        fn new(behavior: RefreshBehavior) -> Arc<Self> {
            Arc::new(Self {
                behavior: Mutex::new(behavior),
                calls: Mutex::new(Cell::new(0)),
            })
        }
        fn calls(&self) -> u32 {
            self.calls.lock().unwrap().get()
        }
    }

    impl TokenRefresher for FakeRefresher {
        fn refresh(&self, refresh_token: &str) -> anyhow::Result<RefreshedToken> {
            let calls = self.calls.lock().unwrap();
            calls.set(calls.get() + 1);
            match *self.behavior.lock().unwrap() {
                RefreshBehavior::Succeed => Ok(RefreshedToken {
                    access_token: "access-2".into(),
                    refresh_token: format!("{}-next", refresh_token),
                    expires_at: Timestamp(2_000_000),
                }),
                RefreshBehavior::Fail => anyhow::bail!("refresh endpoint unreachable"),
            }
        }
    }

    const HOUR: u64 = 60 * 60 * 1000;
    const DAY: u64 = 24 * HOUR;

    fn seeded_store(expiry_ms: u64) -> Arc<MemorySecureStore> {
        let store = Arc::new(MemorySecureStore::new());
        store.put(ACCESS_TOKEN_KEY, "access-1");
        store.put(REFRESH_TOKEN_KEY, "refresh-1");
        store.put(TOKEN_EXPIRY_KEY, &expiry_ms.to_string());
        store
    }

    fn manager(
        store: Arc<MemorySecureStore>,
        refresher: Arc<FakeRefresher>,
        clock: Arc<FakeClock>,
    ) -> TokenManager {
        TokenManager::new(store, refresher, clock, &SyncSettings::default())
    }

    #[test]
    fn test_fresh_token_used_without_refresh() {
        let clock = FakeClock::at(0);
        let refresher = FakeRefresher::new(RefreshBehavior::Succeed);
        let mgr = manager(seeded_store(HOUR), Arc::clone(&refresher), clock);
        assert_eq!(mgr.ensure_valid_token().as_deref(), Some("access-1"));
        assert_eq!(refresher.calls(), 0);
    }

    #[test]
    fn test_token_inside_skew_is_refreshed() {
        // 4 minutes to expiry, skew is 5 - refresh now rather than mid-sync.
        let clock = FakeClock::at(HOUR - 4 * 60 * 1000);
        let refresher = FakeRefresher::new(RefreshBehavior::Succeed);
        let store = seeded_store(HOUR);
        let mgr = manager(Arc::clone(&store), Arc::clone(&refresher), clock);
        assert_eq!(mgr.ensure_valid_token().as_deref(), Some("access-2"));
        assert_eq!(refresher.calls(), 1);
        // The rotated refresh token was persisted.
        assert_eq!(store.get(REFRESH_TOKEN_KEY).as_deref(), Some("refresh-1-next"));
        assert_eq!(store.get(TOKEN_EXPIRY_KEY).as_deref(), Some("2000000"));
    }

    #[test]
    fn test_offline_grace_serves_stale_token() {
        let clock = FakeClock::at(HOUR + 3 * DAY);
        let refresher = FakeRefresher::new(RefreshBehavior::Fail);
        let mgr = manager(seeded_store(HOUR), Arc::clone(&refresher), clock);
        // Refresh fails, but 3 days past expiry is inside the 7-day grace.
        assert_eq!(mgr.ensure_valid_token().as_deref(), Some("access-1"));
        assert_eq!(refresher.calls(), 1);
    }

    #[test]
    fn test_grace_expires() {
        let clock = FakeClock::at(HOUR);
        let refresher = FakeRefresher::new(RefreshBehavior::Fail);
        let mgr = manager(seeded_store(HOUR), refresher, Arc::clone(&clock));
        clock.set(HOUR + 7 * DAY);
        // Exactly at the boundary still works...
        assert_eq!(mgr.ensure_valid_token().as_deref(), Some("access-1"));
        // ...one millisecond past it does not.
        clock.set(HOUR + 7 * DAY + 1);
        assert_eq!(mgr.ensure_valid_token(), None);
    }

    #[test]
    fn test_no_stored_token_means_none() {
        let clock = FakeClock::at(0);
        let refresher = FakeRefresher::new(RefreshBehavior::Succeed);
        let mgr = manager(Arc::new(MemorySecureStore::new()), refresher, clock);
        assert_eq!(mgr.ensure_valid_token(), None);
    }

    #[test]
    fn test_clear_forgets_credentials() {
        let clock = FakeClock::at(0);
        let refresher = FakeRefresher::new(RefreshBehavior::Succeed);
        let store = seeded_store(HOUR);
        let mgr = manager(Arc::clone(&store), refresher, clock);
        mgr.clear();
        assert_eq!(store.get(ACCESS_TOKEN_KEY), None);
        assert_eq!(mgr.ensure_valid_token(), None);
    }
}
