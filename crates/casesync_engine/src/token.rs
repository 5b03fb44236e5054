//! Credential storage, expiry tracking and periodic refresh.

use crate::auth_cache::AuthStateCache;
use crate::error::EngineResult;
use crate::hub::ClientHub;
use crate::stats::EngineStats;
use crate::{now_millis, Signal, SignalSender};
use async_trait::async_trait;
use casesync_protocol::{AuthenticatePayload, Event};
use casesync_store::LocalStore;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Store table holding the single token record.
pub const TOKEN_TABLE: &str = "_token";
const TOKEN_KEY: &str = "current";

/// The current credentials. Timestamps are Unix millis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInfo {
    /// Access token.
    pub access_token: String,
    /// Refresh token.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Access token expiry.
    #[serde(default)]
    pub token_expires_at: Option<i64>,
    /// Tenant identifier.
    #[serde(default)]
    pub tenant_code: Option<String>,
    /// First time this session stored a token.
    pub created_at: i64,
    /// Last time the record was overwritten.
    pub updated_at: i64,
}

impl TokenInfo {
    /// Returns true if the token has a non-empty tenant code.
    pub fn has_tenant_code(&self) -> bool {
        self.tenant_code.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Returns true if the expiry lies at or before `now`.
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.token_expires_at.is_some_and(|exp| exp <= now)
    }

    /// Returns true if the remaining lifetime is within `(0, window]`.
    pub fn expires_within(&self, now: i64, window: Duration) -> bool {
        let window = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        match self.token_expires_at {
            Some(exp) => {
                let remaining = exp.saturating_sub(now);
                remaining > 0 && remaining <= window
            }
            None => false,
        }
    }
}

/// Credentials returned by a refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    /// New access token.
    pub access_token: String,
    /// New refresh token; the old one is kept when absent.
    pub refresh_token: Option<String>,
    /// New expiry.
    pub token_expires_at: Option<i64>,
}

/// Exchanges a refresh token for new credentials.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Refreshes the given token.
    async fn refresh(&self, token: &TokenInfo) -> EngineResult<TokenGrant>;
}

/// Why auth state was cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearReason {
    /// The token has no tenant code.
    TenantMissing,
    /// The token expired.
    Expired,
    /// Refreshing the token failed.
    RefreshFailed,
    /// The remote service rejected the token.
    Rejected,
    /// A client invalidated the session.
    Invalidated,
}

impl ClearReason {
    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ClearReason::TenantMissing => "tenant_code_missing",
            ClearReason::Expired => "token_expired",
            ClearReason::RefreshFailed => "refresh_failed",
            ClearReason::Rejected => "token_rejected",
            ClearReason::Invalidated => "invalidated",
        }
    }
}

/// Outcome of a token check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenCheck {
    /// No token stored.
    NoToken,
    /// Token valid and not expiring soon.
    Valid,
    /// Token was refreshed.
    Refreshed,
    /// Token expiring soon but no refresher is configured.
    RefreshUnavailable,
    /// Auth state was cleared.
    Cleared(ClearReason),
}

/// Owns the current token.
pub struct TokenManager {
    store: Arc<LocalStore>,
    auth: Arc<AuthStateCache>,
    hub: Arc<ClientHub>,
    stats: Arc<EngineStats>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    refresh_window: Duration,
    current: RwLock<Option<TokenInfo>>,
    signals: SignalSender,
}

impl TokenManager {
    pub(crate) fn new(
        store: Arc<LocalStore>,
        auth: Arc<AuthStateCache>,
        hub: Arc<ClientHub>,
        stats: Arc<EngineStats>,
        refresher: Option<Arc<dyn TokenRefresher>>,
        refresh_window: Duration,
        signals: SignalSender,
    ) -> Self {
        let current = match store.get_as::<TokenInfo>(TOKEN_TABLE, TOKEN_KEY) {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "failed to load stored token");
                None
            }
        };
        Self {
            store,
            auth,
            hub,
            stats,
            refresher,
            refresh_window,
            current: RwLock::new(current),
            signals,
        }
    }

    /// Stores credentials, keeping the original `created_at`.
    pub fn store_token(&self, payload: &AuthenticatePayload) -> EngineResult<TokenInfo> {
        let now = now_millis();
        let created_at = self
            .current
            .read()
            .as_ref()
            .map_or(now, |existing| existing.created_at);
        let token = TokenInfo {
            access_token: payload.token.clone(),
            refresh_token: payload.refresh_token.clone(),
            token_expires_at: payload.token_expires_at,
            tenant_code: payload.tenant_code.clone(),
            created_at,
            updated_at: now,
        };
        self.persist(token)
    }

    /// Returns the current token.
    pub fn get_token(&self) -> Option<TokenInfo> {
        self.current.read().clone()
    }

    /// Returns the current access token.
    pub fn access_token(&self) -> Option<String> {
        self.current.read().as_ref().map(|t| t.access_token.clone())
    }

    /// Deletes the stored token.
    pub fn clear_token(&self) -> EngineResult<()> {
        *self.current.write() = None;
        self.store.delete(TOKEN_TABLE, TOKEN_KEY)?;
        Ok(())
    }

    /// Returns true if the token's expiry is in the past.
    pub fn is_token_expired(&self) -> bool {
        self.current
            .read()
            .as_ref()
            .is_some_and(|t| t.is_expired_at(now_millis()))
    }

    /// Returns true if the token expires within `window`.
    pub fn is_token_expiring_soon(&self, window: Duration) -> bool {
        self.current
            .read()
            .as_ref()
            .is_some_and(|t| t.expires_within(now_millis(), window))
    }

    /// Returns true if the token carries a tenant code.
    pub fn has_tenant_code(&self) -> bool {
        self.current
            .read()
            .as_ref()
            .is_some_and(TokenInfo::has_tenant_code)
    }

    /// Runs one token check: clears, refreshes or leaves the token.
    pub async fn check(&self) -> TokenCheck {
        let Some(token) = self.get_token() else {
            return TokenCheck::NoToken;
        };
        if !token.has_tenant_code() {
            return self.clear_auth_state(ClearReason::TenantMissing);
        }
        let now = now_millis();
        if token.is_expired_at(now) {
            return self.clear_auth_state(ClearReason::Expired);
        }
        if !token.expires_within(now, self.refresh_window) {
            return TokenCheck::Valid;
        }
        let Some(refresher) = self.refresher.clone() else {
            debug!("token expiring soon, no refresher configured");
            return TokenCheck::RefreshUnavailable;
        };

        match refresher.refresh(&token).await {
            Ok(grant) => match self.apply_grant(&token, grant) {
                Ok(refreshed) => {
                    self.stats.record_token_refresh();
                    info!(expires_at = ?refreshed.token_expires_at, "token refreshed");
                    self.hub.broadcast(Event::TokenRefreshed {
                        token_expires_at: refreshed.token_expires_at,
                    });
                    let _ = self.signals.send(Signal::TokenRefreshed);
                    TokenCheck::Refreshed
                }
                Err(e) => {
                    warn!(error = %e, "failed to persist refreshed token");
                    self.clear_auth_state(ClearReason::RefreshFailed)
                }
            },
            Err(e) => {
                warn!(error = %e, "token refresh failed");
                self.clear_auth_state(ClearReason::RefreshFailed)
            }
        }
    }

    /// Clears the token and cached auth state, and tells every client.
    pub fn clear_auth_state(&self, reason: ClearReason) -> TokenCheck {
        if let Err(e) = self.clear_token() {
            warn!(error = %e, "failed to delete stored token");
        }
        self.auth.invalidate();
        info!(reason = reason.as_str(), "auth state cleared");
        self.hub.broadcast(Event::AuthStateCleared {
            reason: reason.as_str().to_string(),
        });
        if reason == ClearReason::TenantMissing {
            self.hub.broadcast(Event::TenantCodeMissing);
        }
        let _ = self.signals.send(Signal::AuthCleared);
        TokenCheck::Cleared(reason)
    }

    /// Runs [`check`](Self::check) immediately and then every `interval`
    /// until `shutdown` flips.
    pub(crate) fn spawn_timer(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let outcome = self.check().await;
                        debug!(?outcome, "token check");
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    fn apply_grant(&self, old: &TokenInfo, grant: TokenGrant) -> EngineResult<TokenInfo> {
        let token = TokenInfo {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token.or_else(|| old.refresh_token.clone()),
            token_expires_at: grant.token_expires_at,
            tenant_code: old.tenant_code.clone(),
            created_at: old.created_at,
            updated_at: now_millis(),
        };
        self.persist(token)
    }

    fn persist(&self, token: TokenInfo) -> EngineResult<TokenInfo> {
        self.store.put_as(TOKEN_TABLE, TOKEN_KEY, &token)?;
        *self.current.write() = Some(token.clone());
        Ok(token)
    }
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("has_token", &self.current.read().is_some())
            .field("has_refresher", &self.refresher.is_some())
            .finish()
    }
}
