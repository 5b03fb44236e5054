//! Short-lived cache of the authenticated identity.

use parking_lot::RwLock;
use std::time::Duration;
use tokio::time::Instant;

/// Snapshot of the authenticated identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthState {
    /// Authenticated user, if any.
    pub user_id: Option<String>,
    /// Whether the session is authenticated.
    pub is_authenticated: bool,
    /// When the state was recorded.
    pub last_updated: Instant,
    /// When the state stops being trusted.
    pub expires_at: Instant,
}

/// Holds the last auth probe result for a fixed lifetime.
///
/// The entry expires after the configured TTL even if nothing invalidates
/// it.
#[derive(Debug)]
pub struct AuthStateCache {
    ttl: Duration,
    state: RwLock<Option<AuthState>>,
}

impl AuthStateCache {
    /// Creates an empty cache.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: RwLock::new(None),
        }
    }

    /// Records a probe result.
    pub fn set(&self, user_id: Option<String>, is_authenticated: bool) -> AuthState {
        let now = Instant::now();
        let state = AuthState {
            user_id,
            is_authenticated,
            last_updated: now,
            expires_at: now + self.ttl,
        };
        *self.state.write() = Some(state.clone());
        state
    }

    /// Returns the cached state unless it has expired.
    pub fn get(&self) -> Option<AuthState> {
        let now = Instant::now();
        self.state
            .read()
            .as_ref()
            .filter(|s| now < s.expires_at)
            .cloned()
    }

    /// Returns the last recorded state, expired or not.
    pub fn last(&self) -> Option<AuthState> {
        self.state.read().clone()
    }

    /// Returns the cached user id unless the state has expired.
    pub fn user_id(&self) -> Option<String> {
        self.get().and_then(|s| s.user_id)
    }

    /// Drops the cached state.
    pub fn invalidate(&self) {
        *self.state.write() = None;
    }
}
