//! Configuration for the engine.

use crate::cache::CacheScope;
use crate::incremental::ConflictStrategy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Configuration for engine timers, policies and the table catalog.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Timeout for establishing the transport.
    pub connect_timeout: Duration,
    /// Timeout for a liveness probe.
    pub probe_timeout: Duration,
    /// Interval of the background health check.
    pub health_check_interval: Duration,
    /// Reconnection backoff.
    pub backoff: BackoffConfig,
    /// Interval of the token check timer.
    pub token_check_interval: Duration,
    /// Tokens expiring within this window are refreshed.
    pub token_refresh_window: Duration,
    /// Lifetime of the cached auth state.
    pub auth_cache_ttl: Duration,
    /// Cached tables older than this are refreshed in the background.
    pub cache_stale_after: Duration,
    /// Offline queue key for mutations queued by the router.
    pub offline_sync_key: String,
    /// Conflict strategy for live-driven cache updates.
    pub conflict_strategy: ConflictStrategy,
    /// Per-table caching rules.
    pub catalog: TableCatalog,
}

impl EngineConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(8),
            probe_timeout: Duration::from_secs(8),
            health_check_interval: Duration::from_secs(30),
            backoff: BackoffConfig::default(),
            token_check_interval: Duration::from_secs(5 * 60),
            token_refresh_window: Duration::from_secs(10 * 60),
            auth_cache_ttl: Duration::from_secs(30),
            cache_stale_after: Duration::from_secs(5 * 60),
            offline_sync_key: "pending_mutations".to_string(),
            conflict_strategy: ConflictStrategy::Remote,
            catalog: TableCatalog::default(),
        }
    }

    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the probe timeout.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Sets the health check interval.
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Sets the reconnection backoff.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the token check interval.
    pub fn with_token_check_interval(mut self, interval: Duration) -> Self {
        self.token_check_interval = interval;
        self
    }

    /// Sets the token refresh window.
    pub fn with_token_refresh_window(mut self, window: Duration) -> Self {
        self.token_refresh_window = window;
        self
    }

    /// Sets the auth cache lifetime.
    pub fn with_auth_cache_ttl(mut self, ttl: Duration) -> Self {
        self.auth_cache_ttl = ttl;
        self
    }

    /// Sets the cache staleness threshold.
    pub fn with_cache_stale_after(mut self, after: Duration) -> Self {
        self.cache_stale_after = after;
        self
    }

    /// Sets the router's offline queue key.
    pub fn with_offline_sync_key(mut self, key: impl Into<String>) -> Self {
        self.offline_sync_key = key.into();
        self
    }

    /// Sets the conflict strategy for live-driven updates.
    pub fn with_conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = strategy;
        self
    }

    /// Sets the table catalog.
    pub fn with_catalog(mut self, catalog: TableCatalog) -> Self {
        self.catalog = catalog;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Capped exponential backoff for reconnection.
///
/// `delay(n) = min(base * 2^min(n, max_exponent), cap)`. Attempts are
/// unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay of the first attempt.
    pub base: Duration,
    /// Upper bound of any delay.
    pub cap: Duration,
    /// Largest exponent applied to the base.
    pub max_exponent: u32,
}

impl BackoffConfig {
    /// Creates a backoff configuration.
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            max_exponent: 6,
        }
    }

    /// Sets the largest exponent.
    pub fn with_max_exponent(mut self, max_exponent: u32) -> Self {
        self.max_exponent = max_exponent;
        self
    }

    /// Calculates the delay before attempt `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(self.max_exponent).min(31);
        let factor = 1u32 << exponent;
        self.base.saturating_mul(factor).min(self.cap)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(5))
    }
}

/// Caching rule for one table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableRule {
    /// Eligible for local-first resolution.
    pub auto_sync: bool,
    /// Rows differ per user; cached per user.
    pub private: bool,
    /// Field holding the case reference; cached per case when set.
    pub case_field: Option<String>,
}

impl TableRule {
    /// A rule for an auto-sync table.
    pub fn auto_sync() -> Self {
        Self {
            auto_sync: true,
            ..Self::default()
        }
    }

    /// Marks the table private.
    pub fn private(mut self) -> Self {
        self.private = true;
        self
    }

    /// Scopes the table by case through `field`.
    pub fn case_scoped(mut self, field: impl Into<String>) -> Self {
        self.case_field = Some(field.into());
        self
    }
}

/// Per-table caching rules.
#[derive(Debug, Clone, Default)]
pub struct TableCatalog {
    rules: BTreeMap<String, TableRule>,
}

impl TableCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a table rule.
    pub fn with_table(mut self, table: impl Into<String>, rule: TableRule) -> Self {
        self.rules.insert(table.into(), rule);
        self
    }

    /// Marks tables auto-sync with default scoping.
    pub fn with_auto_sync<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for table in tables {
            self.rules.entry(table.into()).or_default().auto_sync = true;
        }
        self
    }

    /// Marks tables private.
    pub fn with_private<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for table in tables {
            self.rules.entry(table.into()).or_default().private = true;
        }
        self
    }

    /// Returns the rule for a table (the default rule if none is set).
    pub fn rule(&self, table: &str) -> TableRule {
        self.rules.get(table).cloned().unwrap_or_default()
    }

    /// Returns true if the table is auto-sync.
    pub fn is_auto_sync(&self, table: &str) -> bool {
        self.rules.get(table).is_some_and(|r| r.auto_sync)
    }

    /// Returns true if the table is private.
    pub fn is_private(&self, table: &str) -> bool {
        self.rules.get(table).is_some_and(|r| r.private)
    }

    /// Returns the cache scope of a table: per user when private, per case
    /// when case-scoped.
    pub fn scope_for(
        &self,
        table: &str,
        user_id: Option<&str>,
        case_id: Option<&str>,
    ) -> CacheScope {
        let rule = self.rule(table);
        CacheScope {
            user_id: user_id.filter(|_| rule.private).map(str::to_string),
            case_id: case_id
                .filter(|_| rule.case_field.is_some())
                .map(str::to_string),
        }
    }

    /// Returns every auto-sync table.
    pub fn auto_sync_tables(&self) -> Vec<&str> {
        self.rules
            .iter()
            .filter(|(_, r)| r.auto_sync)
            .map(|(t, _)| t.as_str())
            .collect()
    }
}

/// Remote connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Remote endpoint URL.
    pub endpoint: String,
    /// Namespace to select.
    pub namespace: String,
    /// Database to select.
    pub database: String,
    /// Access token to authenticate with.
    #[serde(default, alias = "token", skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
}

impl ConnectionConfig {
    /// Creates a configuration without credentials.
    pub fn new(
        endpoint: impl Into<String>,
        namespace: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            namespace: namespace.into(),
            database: database.into(),
            auth: None,
        }
    }

    /// Sets the access token.
    pub fn with_auth(mut self, token: impl Into<String>) -> Self {
        self.auth = Some(token.into());
        self
    }

    /// Decides what a switch from `self` to `next` requires.
    pub fn diff(&self, next: &ConnectionConfig) -> ConfigChange {
        if self.endpoint != next.endpoint {
            ConfigChange::Reconnect
        } else if self.namespace != next.namespace || self.database != next.database {
            ConfigChange::Reselect
        } else if self.auth != next.auth {
            ConfigChange::Reauth
        } else {
            ConfigChange::Unchanged
        }
    }
}

/// What reconfiguring a live connection requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigChange {
    /// Nothing.
    Unchanged,
    /// Authenticate again.
    Reauth,
    /// Select namespace and database, then authenticate.
    Reselect,
    /// Tear down and reconnect.
    Reconnect,
}
