//! Connection manager.
//!
//! Owns the remote connection and drives [`ConnectionState`] through
//! [`ConnectionState::on`], executing the effects each transition returns.
//! A latch serializes connection attempts; late callers wait for the
//! in-flight attempt and then see its result. Reconnection is debounced by
//! a flag so overlapping failure signals start one retry chain.

use crate::auth_cache::{AuthState, AuthStateCache};
use crate::config::{BackoffConfig, ConfigChange, ConnectionConfig, EngineConfig};
use crate::error::{EngineError, EngineResult, ErrorClass};
use crate::hub::ClientHub;
use crate::remote::RemoteDatabase;
use crate::state::{ConnectionEvent, ConnectionState, Effect};
use crate::stats::EngineStats;
use crate::token::{ClearReason, TokenManager};
use crate::{Signal, SignalSender};
use casesync_protocol::{AuthenticatePayload, Event, Value};
use casesync_store::LocalStore;
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Store table holding the working connection configuration.
pub const CONNECTION_TABLE: &str = "_connection_config";
const CONNECTION_KEY: &str = "current";

/// Liveness probe.
pub const PROBE_QUERY: &str = "RETURN true";
/// Auth probe.
pub const AUTH_PROBE_QUERY: &str = "RETURN $auth";

/// Connection status reported to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Current state.
    pub state: ConnectionState,
    /// Endpoint in use.
    pub endpoint: Option<String>,
    /// Namespace in use.
    pub namespace: Option<String>,
    /// Database in use.
    pub database: Option<String>,
    /// Whether the session is authenticated.
    pub authenticated: bool,
    /// Authenticated user.
    pub user_id: Option<String>,
    /// Reconnection attempts since the last success.
    pub reconnect_attempts: u32,
    /// Last connection error.
    pub error: Option<String>,
}

impl ConnectionInfo {
    /// Encodes the info as a response payload.
    pub fn to_value(&self) -> Value {
        Value::object([
            ("state", Value::from(self.state.as_str())),
            ("endpoint", Value::from(self.endpoint.clone())),
            ("namespace", Value::from(self.namespace.clone())),
            ("database", Value::from(self.database.clone())),
            ("authenticated", Value::Bool(self.authenticated)),
            ("userId", Value::from(self.user_id.clone())),
            ("reconnectAttempts", Value::from(self.reconnect_attempts)),
            ("error", Value::from(self.error.clone())),
        ])
    }
}

/// Owns the single remote connection.
pub struct ConnectionManager {
    connect_timeout: Duration,
    probe_timeout: Duration,
    health_check_interval: Duration,
    backoff: BackoffConfig,
    remote: Arc<dyn RemoteDatabase>,
    store: Arc<LocalStore>,
    tokens: Arc<TokenManager>,
    auth: Arc<AuthStateCache>,
    hub: Arc<ClientHub>,
    stats: Arc<EngineStats>,
    state: RwLock<ConnectionState>,
    last_error: RwLock<Option<String>>,
    current: RwLock<Option<ConnectionConfig>>,
    latch: tokio::sync::Mutex<()>,
    auth_refresh: tokio::sync::Mutex<()>,
    reconnecting: AtomicBool,
    attempts: AtomicU32,
    health: Mutex<Option<JoinHandle<()>>>,
    signals: SignalSender,
    shutdown: watch::Receiver<bool>,
}

impl ConnectionManager {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: &EngineConfig,
        remote: Arc<dyn RemoteDatabase>,
        store: Arc<LocalStore>,
        tokens: Arc<TokenManager>,
        auth: Arc<AuthStateCache>,
        hub: Arc<ClientHub>,
        stats: Arc<EngineStats>,
        signals: SignalSender,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            probe_timeout: config.probe_timeout,
            health_check_interval: config.health_check_interval,
            backoff: config.backoff,
            remote,
            store,
            tokens,
            auth,
            hub,
            stats,
            state: RwLock::new(ConnectionState::Disconnected),
            last_error: RwLock::new(None),
            current: RwLock::new(None),
            latch: tokio::sync::Mutex::new(()),
            auth_refresh: tokio::sync::Mutex::new(()),
            reconnecting: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            health: Mutex::new(None),
            signals,
            shutdown,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Returns true if the connection is believed healthy.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Returns the configuration in use, or the persisted one.
    pub fn config(&self) -> Option<ConnectionConfig> {
        self.current.read().clone().or_else(|| self.load_persisted())
    }

    /// Returns the connection status.
    pub fn info(&self) -> ConnectionInfo {
        let config = self.current.read().clone();
        let auth = self.auth.get();
        ConnectionInfo {
            state: self.state(),
            endpoint: config.as_ref().map(|c| c.endpoint.clone()),
            namespace: config.as_ref().map(|c| c.namespace.clone()),
            database: config.as_ref().map(|c| c.database.clone()),
            authenticated: auth.as_ref().is_some_and(|a| a.is_authenticated),
            user_id: auth.and_then(|a| a.user_id),
            reconnect_attempts: self.attempts.load(Ordering::SeqCst),
            error: self.last_error.read().clone(),
        }
    }

    /// Makes sure a connection exists for `config` (or the configuration in
    /// use, or the persisted one) and returns the resulting status.
    ///
    /// Without any configuration the state is left alone and the status
    /// carries an error.
    pub async fn ensure_connection(
        self: &Arc<Self>,
        config: Option<ConnectionConfig>,
    ) -> ConnectionInfo {
        let _latch = self.latch.lock().await;
        let Some(config) = config.or_else(|| self.config()) else {
            *self.last_error.write() = Some(EngineError::NotConfigured.to_string());
            return self.info();
        };

        match self.state() {
            ConnectionState::Connected => self.reconcile(config).await,
            ConnectionState::Reconnecting => {
                *self.current.write() = Some(config.clone());
                match self.establish(&config).await {
                    Ok(()) => {
                        self.stats.record_reconnect_success();
                        self.fire(ConnectionEvent::ReconnectSucceeded);
                    }
                    Err(e) => {
                        self.fire(ConnectionEvent::ReconnectFailed(e.to_string()));
                    }
                }
            }
            ConnectionState::Disconnected | ConnectionState::Error | ConnectionState::Connecting => {
                *self.current.write() = Some(config.clone());
                self.fire(ConnectionEvent::ConnectRequested);
                self.connect_fresh(&config).await;
            }
        }
        self.info()
    }

    /// Applies a configuration to a live connection.
    async fn reconcile(self: &Arc<Self>, config: ConnectionConfig) {
        let change = self
            .current
            .read()
            .as_ref()
            .map_or(ConfigChange::Reconnect, |current| current.diff(&config));
        *self.current.write() = Some(config.clone());

        match change {
            ConfigChange::Unchanged => match self.probe().await {
                Ok(()) => debug!("probe confirmed connection"),
                Err(e) => {
                    warn!(error = %e, "liveness probe failed");
                    self.fire(ConnectionEvent::TransportLost(e.to_string()));
                }
            },
            ConfigChange::Reauth => {
                if let Err(e) = self.authenticate_session(&config).await {
                    self.report_failure(&e);
                }
                self.persist(&config);
            }
            ConfigChange::Reselect => {
                let result = async {
                    self.remote
                        .use_ns(&config.namespace, &config.database)
                        .await?;
                    self.authenticate_session(&config).await
                }
                .await;
                match result {
                    Ok(()) => self.persist(&config),
                    Err(e) => self.report_failure(&e),
                }
            }
            ConfigChange::Reconnect => {
                info!(endpoint = %config.endpoint, "endpoint changed, reconnecting");
                if let Err(e) = self.remote.close().await {
                    debug!(error = %e, "close before reconnect failed");
                }
                self.fire(ConnectionEvent::Reconfigure);
                self.connect_fresh(&config).await;
            }
        }
    }

    async fn connect_fresh(self: &Arc<Self>, config: &ConnectionConfig) {
        match self.establish(config).await {
            Ok(()) => {
                info!(endpoint = %config.endpoint, "connected");
                self.fire(ConnectionEvent::ConnectSucceeded);
            }
            Err(e) => {
                warn!(endpoint = %config.endpoint, error = %e, "connect failed");
                self.fire(ConnectionEvent::ConnectFailed(e.to_string()));
            }
        }
    }

    /// Connects, selects, probes and authenticates. Authentication failures
    /// clear auth state without failing the connection.
    async fn establish(&self, config: &ConnectionConfig) -> EngineResult<()> {
        with_timeout(self.connect_timeout, self.remote.connect(&config.endpoint)).await?;
        self.remote
            .use_ns(&config.namespace, &config.database)
            .await?;
        self.probe().await?;
        self.authenticate_session(config).await
    }

    /// Runs the liveness probe under the probe timeout.
    pub async fn probe(&self) -> EngineResult<()> {
        with_timeout(
            self.probe_timeout,
            self.remote.query(PROBE_QUERY, &Value::Null),
        )
        .await
        .map(|_| ())
    }

    /// Authenticates with the configured or stored token, if any.
    ///
    /// Only connection-class failures are returned.
    async fn authenticate_session(&self, config: &ConnectionConfig) -> EngineResult<()> {
        let Some(token) = config.auth.clone().or_else(|| self.tokens.access_token()) else {
            self.auth.set(None, false);
            return Ok(());
        };
        match self.remote.authenticate(&token).await {
            Ok(()) => match self.refresh_auth_state().await {
                Ok(_) => Ok(()),
                Err(e) if e.class() == ErrorClass::Connection => Err(e),
                Err(e) => {
                    warn!(error = %e, "auth probe failed");
                    Ok(())
                }
            },
            Err(e) if e.class() == ErrorClass::Connection => Err(e),
            Err(e) => {
                warn!(error = %e, "authentication rejected");
                self.forget_token_locally();
                self.tokens.clear_auth_state(ClearReason::Rejected);
                Ok(())
            }
        }
    }

    /// Runs the auth probe and records the identity.
    pub async fn refresh_auth_state(&self) -> EngineResult<AuthState> {
        let results = with_timeout(
            self.probe_timeout,
            self.remote.query(AUTH_PROBE_QUERY, &Value::Null),
        )
        .await?;
        Ok(self.record_identity(results.first().and_then(identity_of)))
    }

    /// Caches an identity resolved by an auth probe. Clients are told only
    /// when it differs from the last one recorded.
    pub(crate) fn record_identity(&self, user_id: Option<String>) -> AuthState {
        let previous = self.auth.last();
        let state = self.auth.set(user_id.clone(), user_id.is_some());
        let changed = previous.map_or(true, |p| {
            p.user_id != state.user_id || p.is_authenticated != state.is_authenticated
        });
        if changed {
            self.hub.broadcast(Event::AuthStateChanged {
                authenticated: state.is_authenticated,
                user_id,
            });
        }
        state
    }

    /// Returns the auth state, probing again when the cached entry has
    /// expired on a live connection. Concurrent callers share one probe.
    pub async fn auth_state(self: &Arc<Self>) -> Option<AuthState> {
        if let Some(state) = self.auth.get() {
            return Some(state);
        }
        if !self.is_connected() {
            return None;
        }
        let _refresh = self.auth_refresh.lock().await;
        if let Some(state) = self.auth.get() {
            return Some(state);
        }
        match self.refresh_auth_state().await {
            Ok(state) => {
                self.stats.record_auth_refresh();
                debug!(authenticated = state.is_authenticated, "auth state refreshed");
                Some(state)
            }
            Err(e) => {
                warn!(error = %e, "auth state refresh failed");
                self.report_failure(&e);
                None
            }
        }
    }

    /// Returns the authenticated user, refreshing an expired auth state.
    pub async fn current_user(self: &Arc<Self>) -> Option<String> {
        self.auth_state().await.and_then(|state| state.user_id)
    }

    /// Returns the connection status with a current auth state.
    pub async fn status(self: &Arc<Self>) -> ConnectionInfo {
        self.auth_state().await;
        self.info()
    }

    /// Stores a token and authenticates the live session with it.
    pub async fn authenticate(
        self: &Arc<Self>,
        payload: &AuthenticatePayload,
    ) -> EngineResult<ConnectionInfo> {
        self.tokens.store_token(payload)?;
        let updated = {
            let mut current = self.current.write();
            current.as_mut().map(|config| {
                config.auth = Some(payload.token.clone());
                config.clone()
            })
        };
        if let Some(config) = &updated {
            self.persist(config);
        }
        if !self.is_connected() {
            return Ok(self.info());
        }
        match self.remote.authenticate(&payload.token).await {
            Ok(()) => {
                self.refresh_auth_state().await?;
                Ok(self.info())
            }
            Err(e) if e.class() == ErrorClass::Connection => {
                self.report_failure(&e);
                Err(e)
            }
            Err(e) => {
                self.forget_token_locally();
                self.tokens.clear_auth_state(ClearReason::Rejected);
                Err(e)
            }
        }
    }

    /// Re-authenticates the live session after a token refresh.
    pub(crate) async fn reauthenticate(self: &Arc<Self>) {
        let Some(token) = self.tokens.access_token() else {
            return;
        };
        let updated = {
            let mut current = self.current.write();
            current.as_mut().map(|config| {
                config.auth = Some(token.clone());
                config.clone()
            })
        };
        if let Some(config) = &updated {
            self.persist(config);
        }
        if !self.is_connected() {
            return;
        }
        match self.remote.authenticate(&token).await {
            Ok(()) => debug!("session re-authenticated"),
            Err(e) if e.class() == ErrorClass::Connection => self.report_failure(&e),
            Err(e) => {
                warn!(error = %e, "re-authentication rejected");
                self.forget_token_locally();
                self.tokens.clear_auth_state(ClearReason::Rejected);
            }
        }
    }

    /// Drops the session's credentials locally and remotely.
    pub(crate) async fn forget_credentials(self: &Arc<Self>) {
        self.forget_token_locally();
        self.auth.invalidate();
        if self.is_connected() {
            if let Err(e) = self.remote.invalidate().await {
                self.report_failure(&e);
            }
        }
    }

    /// Clears the stored token and notifies clients. The session's
    /// credentials are dropped by the engine when the clear is signalled.
    pub fn invalidate(&self) -> ConnectionInfo {
        self.tokens.clear_auth_state(ClearReason::Invalidated);
        self.info()
    }

    /// Closes the transport and restarts reconnection from attempt zero.
    pub async fn force_reconnect(self: &Arc<Self>) -> ConnectionInfo {
        if let Err(e) = self.remote.close().await {
            debug!(error = %e, "close before forced reconnect failed");
        }
        self.fire(ConnectionEvent::ForceReconnect);
        self.info()
    }

    /// Disconnects and stops timers.
    pub async fn disconnect(self: &Arc<Self>) {
        self.fire(ConnectionEvent::Disconnect);
        if let Err(e) = self.remote.close().await {
            debug!(error = %e, "close on disconnect failed");
        }
    }

    /// Starts reconnection if `error` means the transport is gone.
    pub fn report_failure(self: &Arc<Self>, error: &EngineError) {
        if error.triggers_reconnect() && self.is_connected() {
            self.fire(ConnectionEvent::TransportLost(error.to_string()));
        }
    }

    /// Handles a transport close reported by the remote.
    pub(crate) fn transport_lost(self: &Arc<Self>, reason: &str) {
        self.fire(ConnectionEvent::TransportLost(reason.to_string()));
    }

    /// Applies an event and executes the resulting effects.
    fn fire(self: &Arc<Self>, event: ConnectionEvent) -> ConnectionState {
        let transition = {
            let mut state = self.state.write();
            let transition = (*state).on(&event);
            *state = transition.state;
            transition
        };
        match &event {
            ConnectionEvent::ConnectFailed(e)
            | ConnectionEvent::HealthCheckFailed(e)
            | ConnectionEvent::TransportLost(e)
            | ConnectionEvent::ReconnectFailed(e) => *self.last_error.write() = Some(e.clone()),
            ConnectionEvent::ConnectSucceeded | ConnectionEvent::ReconnectSucceeded => {
                *self.last_error.write() = None
            }
            _ => {}
        }
        for effect in transition.effects {
            self.run(effect);
        }
        transition.state
    }

    fn run(self: &Arc<Self>, effect: Effect) {
        match effect {
            Effect::Broadcast { from, to, error } => {
                info!(from = from.as_str(), to = to.as_str(), "connection state changed");
                self.hub.broadcast(Event::ConnectionStateChanged {
                    state: to.as_str().to_string(),
                    previous: from.as_str().to_string(),
                    error,
                });
            }
            Effect::StartHealthCheck => self.start_health_check(),
            Effect::StopHealthCheck => self.stop_health_check(),
            Effect::ScheduleReconnect => self.schedule_reconnect(),
            Effect::InvalidateAuth => self.auth.invalidate(),
            Effect::PersistConfig => {
                if let Some(config) = self.current.read().clone() {
                    self.persist(&config);
                }
            }
            Effect::ResetAttempts => self.attempts.store(0, Ordering::SeqCst),
            Effect::Established => {
                let _ = self.signals.send(Signal::Established);
            }
        }
    }

    fn start_health_check(self: &Arc<Self>) {
        let this = self.clone();
        let interval = self.health_check_interval;
        let mut shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if !this.is_connected() {
                    break;
                }
                if let Err(e) = this.probe().await {
                    this.stats.record_health_check_failure();
                    warn!(error = %e, "health check failed");
                    this.fire(ConnectionEvent::HealthCheckFailed(e.to_string()));
                    break;
                }
            }
        });
        if let Some(previous) = self.health.lock().replace(handle) {
            previous.abort();
        }
    }

    fn stop_health_check(&self) {
        if let Some(handle) = self.health.lock().take() {
            handle.abort();
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move { this.reconnect_loop().await });
    }

    /// Retries until connected, disconnected or shut down. Attempts are
    /// unbounded.
    async fn reconnect_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        loop {
            let attempt = self.attempts.load(Ordering::SeqCst);
            let delay = self.backoff.delay_for_attempt(attempt);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    self.reconnecting.store(false, Ordering::SeqCst);
                    return;
                }
            }

            let _latch = self.latch.lock().await;
            if matches!(
                self.state(),
                ConnectionState::Connected | ConnectionState::Disconnected
            ) || *shutdown.borrow()
            {
                self.reconnecting.store(false, Ordering::SeqCst);
                return;
            }
            let Some(config) = self.config() else {
                warn!("no connection configuration, giving up reconnect");
                self.reconnecting.store(false, Ordering::SeqCst);
                return;
            };

            self.fire(ConnectionEvent::ReconnectAttempt);
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            self.stats.record_reconnect_attempt();
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);

            match self.establish(&config).await {
                Ok(()) => {
                    self.stats.record_reconnect_success();
                    info!(attempt, delay_ms, "reconnected");
                    self.reconnecting.store(false, Ordering::SeqCst);
                    self.fire(ConnectionEvent::ReconnectSucceeded);
                    return;
                }
                Err(e) => {
                    warn!(attempt, delay_ms, error = %e, "reconnect attempt failed");
                    self.fire(ConnectionEvent::ReconnectFailed(e.to_string()));
                }
            }
        }
    }

    fn persist(&self, config: &ConnectionConfig) {
        if let Err(e) = self.store.put_as(CONNECTION_TABLE, CONNECTION_KEY, config) {
            warn!(error = %e, "failed to persist connection configuration");
        }
    }

    fn load_persisted(&self) -> Option<ConnectionConfig> {
        match self.store.get_as(CONNECTION_TABLE, CONNECTION_KEY) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "failed to load connection configuration");
                None
            }
        }
    }

    fn forget_token_locally(&self) {
        let updated = {
            let mut current = self.current.write();
            current.as_mut().and_then(|config| {
                config.auth.take()?;
                Some(config.clone())
            })
        };
        if let Some(config) = &updated {
            self.persist(config);
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("attempts", &self.attempts.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Races `future` against `limit`. A timeout is a connection-class failure.
async fn with_timeout<T>(
    limit: Duration,
    future: impl Future<Output = EngineResult<T>>,
) -> EngineResult<T> {
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::Timeout(limit)),
    }
}

/// Extracts the user id from an auth probe result.
pub(crate) fn identity_of(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Record(rid) => Some(rid.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(_) => value.get("id").and_then(identity_of),
        Value::Array(items) => items.first().and_then(identity_of),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRemote;
    use casesync_protocol::{OutboundMessage, RecordId};
    use tokio::sync::mpsc;

    struct Fixture {
        manager: Arc<ConnectionManager>,
        mock: Arc<MockRemote>,
        store: Arc<LocalStore>,
        client: mpsc::UnboundedReceiver<OutboundMessage>,
        signals: mpsc::UnboundedReceiver<Signal>,
        _stop: watch::Sender<bool>,
    }

    fn fixture_with(store: Arc<LocalStore>) -> Fixture {
        let config = EngineConfig::default();
        let mock = Arc::new(MockRemote::new());
        let hub = Arc::new(ClientHub::new());
        let client = hub.register("tab");
        let auth = Arc::new(AuthStateCache::new(config.auth_cache_ttl));
        let stats = Arc::new(EngineStats::default());
        let (tx, signals) = mpsc::unbounded_channel();
        let tokens = Arc::new(TokenManager::new(
            store.clone(),
            auth.clone(),
            hub.clone(),
            stats.clone(),
            None,
            config.token_refresh_window,
            tx.clone(),
        ));
        let (stop, shutdown) = watch::channel(false);
        let manager = Arc::new(ConnectionManager::new(
            &config,
            mock.clone(),
            store.clone(),
            tokens,
            auth,
            hub,
            stats,
            tx,
            shutdown,
        ));
        Fixture {
            manager,
            mock,
            store,
            client,
            signals,
            _stop: stop,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(LocalStore::open_in_memory().unwrap()))
    }

    fn config() -> ConnectionConfig {
        ConnectionConfig::new("ws://db", "ns", "db").with_auth("tok")
    }

    fn states(rx: &mut mpsc::UnboundedReceiver<OutboundMessage>) -> Vec<String> {
        let mut states = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let OutboundMessage::Event(Event::ConnectionStateChanged { state, .. }) = msg {
                states.push(state);
            }
        }
        states
    }

    #[tokio::test(start_paused = true)]
    async fn connects_authenticates_and_persists() {
        let mut f = fixture();
        f.mock
            .set_auth_user(Value::object([("id", Value::Record(RecordId::new("user", "u1")))]));

        let info = f.manager.ensure_connection(Some(config())).await;
        assert_eq!(info.state, ConnectionState::Connected);
        assert!(info.authenticated);
        assert_eq!(info.user_id.as_deref(), Some("user:u1"));
        assert_eq!(f.mock.token().as_deref(), Some("tok"));
        assert_eq!(states(&mut f.client), vec!["connecting", "connected"]);
        assert_eq!(f.signals.try_recv().unwrap(), Signal::Established);

        let persisted: ConnectionConfig = f
            .store
            .get_as(CONNECTION_TABLE, CONNECTION_KEY)
            .unwrap()
            .unwrap();
        assert_eq!(persisted, config());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_config_reports_error_without_state_change() {
        let mut f = fixture();
        let info = f.manager.ensure_connection(None).await;
        assert_eq!(info.state, ConnectionState::Disconnected);
        assert_eq!(
            info.error.as_deref(),
            Some("no connection configuration available")
        );
        assert!(states(&mut f.client).is_empty());
        assert_eq!(f.mock.calls("connect"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn persisted_config_self_heals_after_restart() {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        {
            let f = fixture_with(store.clone());
            f.manager.ensure_connection(Some(config())).await;
        }
        let f = fixture_with(store);
        let info = f.manager.ensure_connection(None).await;
        assert_eq!(info.state, ConnectionState::Connected);
        assert_eq!(info.endpoint.as_deref(), Some("ws://db"));
    }

    #[tokio::test(start_paused = true)]
    async fn connected_fast_path_checks_liveness_without_reconnecting() {
        let f = fixture();
        f.manager.ensure_connection(Some(config())).await;
        let connects = f.mock.calls("connect");
        let liveness_checks = f.mock.queries_matching(PROBE_QUERY);

        let info = f.manager.ensure_connection(None).await;
        assert_eq!(info.state, ConnectionState::Connected);
        assert_eq!(f.mock.calls("connect"), connects);
        assert_eq!(f.mock.calls("use_ns"), 1);
        assert_eq!(f.mock.queries_matching(PROBE_QUERY), liveness_checks + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_liveness_check_on_open_socket_triggers_reconnect() {
        let f = fixture();
        f.manager.ensure_connection(Some(config())).await;
        f.mock.hang_queries(true);
        assert!(f.mock.is_connected());

        let info = f.manager.ensure_connection(None).await;
        assert_eq!(info.state, ConnectionState::Reconnecting);
        assert_eq!(info.error.as_deref(), Some("operation timed out after 8s"));

        f.mock.hang_queries(false);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(f.manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_auth_state_is_refreshed_once() {
        let mut f = fixture();
        f.mock.set_auth_user(Value::from("user:u1"));
        f.manager.ensure_connection(Some(config())).await;
        assert_eq!(f.mock.queries_matching(AUTH_PROBE_QUERY), 1);
        let _ = states(&mut f.client);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(f.manager.info().user_id.is_none());

        let (a, b) = tokio::join!(f.manager.current_user(), f.manager.current_user());
        assert_eq!(a.as_deref(), Some("user:u1"));
        assert_eq!(b.as_deref(), Some("user:u1"));
        assert_eq!(f.mock.queries_matching(AUTH_PROBE_QUERY), 2);

        let status = f.manager.status().await;
        assert!(status.authenticated);
        assert_eq!(f.mock.queries_matching(AUTH_PROBE_QUERY), 2);

        // Same identity, so no auth_state_changed event.
        let mut kinds = Vec::new();
        while let Ok(msg) = f.client.try_recv() {
            kinds.push(msg.kind().to_string());
        }
        assert!(!kinds.contains(&"auth_state_changed".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_auth_state_stays_empty_while_disconnected() {
        let f = fixture();
        f.mock.set_auth_user(Value::from("user:u1"));
        f.manager.ensure_connection(Some(config())).await;
        f.manager.disconnect().await;
        tokio::time::sleep(Duration::from_secs(31)).await;

        assert!(f.manager.current_user().await.is_none());
        assert_eq!(f.mock.queries_matching(AUTH_PROBE_QUERY), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn config_diff_chooses_minimal_work() {
        let f = fixture();
        f.manager.ensure_connection(Some(config())).await;
        let connects = f.mock.calls("connect");

        f.manager
            .ensure_connection(Some(config().with_auth("tok2")))
            .await;
        assert_eq!(f.mock.token().as_deref(), Some("tok2"));
        assert_eq!(f.mock.calls("connect"), connects);
        assert_eq!(f.mock.calls("use_ns"), 1);

        let mut other_db = config().with_auth("tok2");
        other_db.database = "other".into();
        f.manager.ensure_connection(Some(other_db)).await;
        assert_eq!(f.mock.calls("use_ns"), 2);
        assert_eq!(f.mock.calls("connect"), connects);

        let moved = ConnectionConfig::new("ws://elsewhere", "ns", "other").with_auth("tok2");
        let info = f.manager.ensure_connection(Some(moved)).await;
        assert_eq!(info.state, ConnectionState::Connected);
        assert_eq!(f.mock.calls("connect"), connects + 1);
        assert_eq!(f.mock.calls("close"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_retries_with_backoff_until_connected() {
        let mut f = fixture();
        f.mock.fail_connects(3);

        let info = f.manager.ensure_connection(Some(config())).await;
        assert_eq!(info.state, ConnectionState::Error);
        assert_eq!(info.error.as_deref(), Some("connection error: connection refused"));

        // Backoff: 100ms, 200ms, 400ms.
        tokio::time::sleep(Duration::from_millis(2_000)).await;
        assert_eq!(f.manager.state(), ConnectionState::Connected);
        assert_eq!(f.mock.calls("connect"), 4);
        assert_eq!(
            states(&mut f.client),
            vec!["connecting", "error", "reconnecting", "connected"]
        );
        assert_eq!(f.manager.info().reconnect_attempts, 0);
        assert!(f.manager.info().error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn transport_loss_reconnects() {
        let mut f = fixture();
        f.manager.ensure_connection(Some(config())).await;
        let _ = states(&mut f.client);
        let _ = f.signals.try_recv();

        f.mock.drop_connection("reset");
        f.manager.transport_lost("reset");
        assert_eq!(f.manager.state(), ConnectionState::Reconnecting);
        assert!(f.manager.info().user_id.is_none());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(f.manager.state(), ConnectionState::Connected);
        assert_eq!(states(&mut f.client), vec!["reconnecting", "connected"]);
        assert_eq!(f.signals.try_recv().unwrap(), Signal::Established);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_failures_start_one_retry_chain() {
        let f = fixture();
        f.manager.ensure_connection(Some(config())).await;
        f.mock.set_unreachable(true);

        f.manager.transport_lost("eof");
        f.manager.report_failure(&EngineError::connection("probe failed"));
        f.manager.transport_lost("eof again");

        tokio::time::sleep(Duration::from_millis(150)).await;
        // One attempt after the first 100ms delay.
        assert_eq!(f.mock.calls("connect"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn health_check_failure_triggers_reconnect() {
        let f = fixture();
        f.manager.ensure_connection(Some(config())).await;
        f.mock.set_unreachable(true);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(f.manager.state(), ConnectionState::Reconnecting);

        f.mock.set_unreachable(false);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(f.manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_token_keeps_connection_unauthenticated() {
        let mut f = fixture();
        f.mock.reject_auth(true);
        let info = f.manager.ensure_connection(Some(config())).await;
        assert_eq!(info.state, ConnectionState::Connected);
        assert!(!info.authenticated);

        let mut kinds = Vec::new();
        while let Ok(msg) = f.client.try_recv() {
            kinds.push(msg.kind().to_string());
        }
        assert!(kinds.contains(&"auth_state_cleared".to_string()));
        assert!(f.manager.config().unwrap().auth.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn force_reconnect_resets_and_reconnects() {
        let f = fixture();
        f.manager.ensure_connection(Some(config())).await;
        let info = f.manager.force_reconnect().await;
        assert_eq!(info.state, ConnectionState::Reconnecting);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(f.manager.state(), ConnectionState::Connected);
        assert_eq!(f.mock.calls("connect"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_stops_reconnection() {
        let f = fixture();
        f.mock.fail_connects(100);
        f.manager.ensure_connection(Some(config())).await;
        f.manager.disconnect().await;
        let connects = f.mock.calls("connect");

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(f.manager.state(), ConnectionState::Disconnected);
        assert!(f.mock.calls("connect") <= connects + 1);
    }

    #[test]
    fn identity_extraction() {
        assert_eq!(identity_of(&Value::Null), None);
        assert_eq!(
            identity_of(&Value::Record(RecordId::new("user", "u1"))).as_deref(),
            Some("user:u1")
        );
        assert_eq!(
            identity_of(&Value::object([("id", Value::from("user:u2"))])).as_deref(),
            Some("user:u2")
        );
    }
}
