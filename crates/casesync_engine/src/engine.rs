//! Engine root.
//!
//! Owns every component and the background tasks: the token timer, the
//! remote event listener and the signal loop that reacts to connection
//! re-establishment.

use crate::auth_cache::AuthStateCache;
use crate::cache::DataCache;
use crate::config::EngineConfig;
use crate::connection::{ConnectionInfo, ConnectionManager};
use crate::dispatcher::Dispatcher;
use crate::error::EngineResult;
use crate::hub::{ClientHub, ClientReceiver};
use crate::live::{LiveRegistry, Subscriber};
use crate::offline::OfflineQueue;
use crate::query::{HeuristicExtractor, TableExtractor};
use crate::remote::{RemoteDatabase, RemoteEvent};
use crate::router::QueryRouter;
use crate::stats::{EngineStats, StatsSnapshot};
use crate::token::{TokenManager, TokenRefresher};
use crate::Signal;
use casesync_protocol::{Request, Response};
use casesync_store::LocalStore;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Builds an [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteDatabase>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    extractor: Arc<dyn TableExtractor>,
}

impl EngineBuilder {
    /// Sets the token refresher.
    pub fn refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// Replaces the table extractor.
    pub fn extractor(mut self, extractor: Arc<dyn TableExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    /// Wires the components together. Nothing runs until
    /// [`Engine::start`].
    pub fn build(self) -> Engine {
        let Self {
            config,
            store,
            remote,
            refresher,
            extractor,
        } = self;
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let hub = Arc::new(ClientHub::new());
        let stats = Arc::new(EngineStats::default());
        let auth = Arc::new(AuthStateCache::new(config.auth_cache_ttl));
        let tokens = Arc::new(TokenManager::new(
            store.clone(),
            auth.clone(),
            hub.clone(),
            stats.clone(),
            refresher,
            config.token_refresh_window,
            signal_tx.clone(),
        ));
        let connection = Arc::new(ConnectionManager::new(
            &config,
            remote.clone(),
            store.clone(),
            tokens.clone(),
            auth.clone(),
            hub.clone(),
            stats.clone(),
            signal_tx,
            shutdown_rx,
        ));
        let live = Arc::new(LiveRegistry::new(remote.clone(), hub.clone(), stats.clone()));
        let router = Arc::new(QueryRouter::new(
            config.clone(),
            DataCache::new(store.clone()),
            OfflineQueue::new(store.clone()),
            remote.clone(),
            connection.clone(),
            live.clone(),
            hub.clone(),
            auth,
            stats.clone(),
            extractor,
        ));
        let dispatcher = Dispatcher::new(
            config.catalog.clone(),
            connection.clone(),
            tokens.clone(),
            router.clone(),
            live.clone(),
            stats.clone(),
        );

        Engine {
            config,
            store,
            remote,
            hub,
            stats,
            tokens,
            connection,
            live,
            router,
            dispatcher,
            signals: Mutex::new(Some(signal_rx)),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }
}

/// The background sync engine.
pub struct Engine {
    config: EngineConfig,
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteDatabase>,
    hub: Arc<ClientHub>,
    stats: Arc<EngineStats>,
    tokens: Arc<TokenManager>,
    connection: Arc<ConnectionManager>,
    live: Arc<LiveRegistry>,
    router: Arc<QueryRouter>,
    dispatcher: Dispatcher,
    signals: Mutex<Option<mpsc::UnboundedReceiver<Signal>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Starts building an engine over a local store and a remote.
    pub fn builder(
        config: EngineConfig,
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteDatabase>,
    ) -> EngineBuilder {
        EngineBuilder {
            config,
            store,
            remote,
            refresher: None,
            extractor: Arc::new(HeuristicExtractor),
        }
    }

    /// Starts the background tasks and reconnects with the persisted
    /// configuration, if any. Calling it twice is a no-op.
    pub async fn start(&self) -> EngineResult<()> {
        let Some(signals) = self.signals.lock().take() else {
            debug!("engine already started");
            return Ok(());
        };

        match self.router.cache().clear_temporary() {
            Ok(removed) if removed > 0 => info!(removed, "cleared temporary cache entries"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to clear temporary cache entries"),
        }

        let timer = self
            .tokens
            .clone()
            .spawn_timer(self.config.token_check_interval, self.shutdown.subscribe());
        let listener = self.spawn_event_listener();
        let signal_loop = self.spawn_signal_loop(signals);
        self.tasks.lock().extend([timer, listener, signal_loop]);

        if self.connection.config().is_some() {
            let info = self.connection.ensure_connection(None).await;
            info!(state = info.state.as_str(), "restored connection on start");
        }
        Ok(())
    }

    fn spawn_event_listener(&self) -> JoinHandle<()> {
        let mut events = self.remote.subscribe_events();
        let mut shutdown = self.shutdown.subscribe();
        let connection = self.connection.clone();
        let live = self.live.clone();
        let router = self.router.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    event = events.recv() => match event {
                        Ok(RemoteEvent::Live(notification)) => {
                            let targets = live.dispatch(&notification);
                            if !targets.is_empty() {
                                router.apply_live_change(&targets, &notification);
                            }
                        }
                        Ok(RemoteEvent::Disconnected { reason }) => {
                            connection.transport_lost(&reason);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "remote events lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    fn spawn_signal_loop(&self, mut signals: mpsc::UnboundedReceiver<Signal>) -> JoinHandle<()> {
        let mut shutdown = self.shutdown.subscribe();
        let connection = self.connection.clone();
        let live = self.live.clone();
        let router = self.router.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    signal = signals.recv() => match signal {
                        Some(Signal::Established) => {
                            live.resubscribe_all().await;
                            if let Err(e) = router.replay_offline().await {
                                warn!(error = %e, "offline replay failed");
                            }
                            router.reopen_page_feeds().await;
                        }
                        Some(Signal::TokenRefreshed) => connection.reauthenticate().await,
                        Some(Signal::AuthCleared) => connection.forget_credentials().await,
                        None => break,
                    },
                }
            }
        })
    }

    /// Registers a client tab and returns its message stream.
    pub fn register_client(&self, id: impl Into<String>) -> ClientReceiver {
        self.hub.register(id)
    }

    /// Unregisters a client tab and drops everything it subscribed to.
    pub async fn unregister_client(&self, id: &str) {
        self.hub.unregister(id);
        let feeds = self
            .live
            .unsubscribe_all(&Subscriber::Client(id.to_string()))
            .await;
        let pages = self.router.release_client(id).await;
        debug!(client = id, feeds, pages, "client unregistered");
    }

    /// Handles a request and returns its response.
    pub async fn handle(&self, request: &Request) -> Response {
        self.dispatcher.dispatch(request).await
    }

    /// Handles a request and posts the response to the originating client.
    /// Returns false when the client is gone and the response was dropped.
    pub async fn handle_and_reply(&self, request: &Request) -> bool {
        let response = self.handle(request).await;
        match &request.origin_id {
            Some(origin) => self.hub.send(origin, response),
            None => {
                debug!(kind = %request.kind, "dropping response without origin");
                false
            }
        }
    }

    /// Stops timers and background tasks and closes the connection.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.connection.disconnect().await;
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "background task failed");
                }
            }
        }
        if let Err(e) = self.store.sync() {
            warn!(error = %e, "failed to sync local store");
        }
        info!("engine stopped");
    }

    /// Returns the counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Returns the connection status.
    pub fn connection_info(&self) -> ConnectionInfo {
        self.connection.info()
    }

    /// Returns the connection manager.
    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Returns the query router.
    pub fn router(&self) -> &Arc<QueryRouter> {
        &self.router
    }

    /// Returns the live subscription registry.
    pub fn live(&self) -> &Arc<LiveRegistry> {
        &self.live
    }

    /// Returns the token manager.
    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    /// Returns the client hub.
    pub fn hub(&self) -> &Arc<ClientHub> {
        &self.hub
    }

    /// Returns the local store.
    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("connection", &self.connection)
            .field("live", &self.live)
            .field("clients", &self.hub.len())
            .finish_non_exhaustive()
    }
}
