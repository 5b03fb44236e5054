//! Query router and data cache manager.
//!
//! Decides per query whether to answer from the local cache or the remote,
//! keeps cached tables in step with writes and live feeds, and owns the
//! router's offline mutation queue.

use crate::auth_cache::AuthStateCache;
use crate::cache::{CacheScope, DataCache, SyncStatus};
use crate::config::EngineConfig;
use crate::connection::{identity_of, ConnectionManager, AUTH_PROBE_QUERY};
use crate::error::{EngineError, EngineResult};
use crate::hub::{ClientHub, ClientId};
use crate::incremental::{row_key, ConflictStrategy, IncrementalUpdate};
use crate::live::{FeedTarget, LiveRegistry, Subscriber};
use crate::offline::OfflineQueue;
use crate::query::{CacheTarget, QueryDescriptor, TableExtractor};
use crate::remote::{rows_of, LiveAction, LiveNotification, RemoteDatabase};
use crate::stats::EngineStats;
use casesync_protocol::{
    CacheClass, ChangeAction, Event, IncrementalPayload, PageDataPayload, RecordId, Resource,
    Value,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

type PageKey = (String, CacheScope);

#[derive(Debug)]
struct PageEntry {
    class: CacheClass,
    clients: BTreeSet<ClientId>,
}

/// Outcome of an offline queue replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Mutations applied remotely.
    pub replayed: usize,
    /// Mutations rejected by the remote and dropped.
    pub dropped: usize,
    /// Mutations still queued.
    pub remaining: usize,
}

/// Routes queries between the local cache and the remote.
pub struct QueryRouter {
    config: EngineConfig,
    cache: DataCache,
    offline: OfflineQueue,
    remote: Arc<dyn RemoteDatabase>,
    connection: Arc<ConnectionManager>,
    live: Arc<LiveRegistry>,
    hub: Arc<ClientHub>,
    auth: Arc<AuthStateCache>,
    stats: Arc<EngineStats>,
    extractor: Arc<dyn TableExtractor>,
    pages: Mutex<BTreeMap<PageKey, PageEntry>>,
    syncing: Mutex<HashSet<PageKey>>,
}

impl QueryRouter {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: EngineConfig,
        cache: DataCache,
        offline: OfflineQueue,
        remote: Arc<dyn RemoteDatabase>,
        connection: Arc<ConnectionManager>,
        live: Arc<LiveRegistry>,
        hub: Arc<ClientHub>,
        auth: Arc<AuthStateCache>,
        stats: Arc<EngineStats>,
        extractor: Arc<dyn TableExtractor>,
    ) -> Self {
        Self {
            config,
            cache,
            offline,
            remote,
            connection,
            live,
            hub,
            auth,
            stats,
            extractor,
            pages: Mutex::new(BTreeMap::new()),
            syncing: Mutex::new(HashSet::new()),
        }
    }

    /// Returns the data cache.
    pub fn cache(&self) -> &DataCache {
        &self.cache
    }

    /// Returns the offline queue store.
    pub fn offline(&self) -> &OfflineQueue {
        &self.offline
    }

    /// Describes `sql`, preferring an explicit descriptor.
    pub fn describe(&self, sql: &str, descriptor: Option<QueryDescriptor>) -> QueryDescriptor {
        descriptor
            .map(QueryDescriptor::normalized)
            .unwrap_or_else(|| self.extractor.describe(sql))
    }

    /// Runs a query, answering from the cache when it can. Returns one
    /// result per statement.
    pub async fn query(
        self: &Arc<Self>,
        sql: &str,
        vars: &Value,
        descriptor: Option<QueryDescriptor>,
    ) -> EngineResult<Vec<Value>> {
        let started = Instant::now();
        let descriptor = self.describe(sql, descriptor);

        if descriptor.is_write() {
            let results = self.run_remote(sql, vars, &descriptor.tables, started).await?;
            self.mark_written(&descriptor);
            return Ok(results);
        }
        if descriptor.is_personal_data() {
            return self.personal_query(sql, vars, &descriptor, started).await;
        }
        if let Some(target) = descriptor.cache_target(&self.config.catalog) {
            if let Some(scope) = self.query_scope(&target.table, vars).await {
                return self.cached_query(sql, vars, &target, scope, started).await;
            }
        }

        self.presync(&descriptor.tables, vars).await;
        self.run_remote(sql, vars, &descriptor.tables, started).await
    }

    async fn cached_query(
        self: &Arc<Self>,
        sql: &str,
        vars: &Value,
        target: &CacheTarget,
        scope: CacheScope,
        started: Instant,
    ) -> EngineResult<Vec<Value>> {
        let table = target.table.as_str();
        if let Some(rows) = self.cached_rows(table, &scope) {
            self.stats.record_cache_hit();
            if self.connection.is_connected()
                && !self.cache.is_fresh(table, &scope, self.config.cache_stale_after)
            {
                self.refresh_in_background(table, &scope);
            }
            return self.serve_local(target, rows, started).await;
        }

        self.stats.record_cache_miss();
        if !self.connection.is_connected() {
            return Err(EngineError::connection(format!(
                "not connected and no cached rows for {table}"
            )));
        }

        match self.sync_table(table, &scope, CacheClass::Persistent).await {
            Ok(_) => {
                if let Some(rows) = self.cached_rows(table, &scope) {
                    return self.serve_local(target, rows, started).await;
                }
            }
            Err(e) if e.triggers_reconnect() => {
                self.connection.report_failure(&e);
                return Err(e);
            }
            Err(e) => warn!(table, error = %e, "just-in-time sync failed"),
        }

        let tables = [target.table.clone()];
        let results = self.run_remote(sql, vars, &tables, started).await?;
        if let Some(rows) = results.get(target.data_index) {
            let rows = rows_of(rows.clone());
            if let Err(e) = self
                .cache
                .write_table(table, &scope, CacheClass::Persistent, rows)
            {
                warn!(table, error = %e, "failed to cache remote result");
            }
        }
        Ok(results)
    }

    /// Returns cached rows, or `None` on an empty or unreadable entry.
    fn cached_rows(&self, table: &str, scope: &CacheScope) -> Option<Vec<Value>> {
        match self.cache.rows(table, scope) {
            Ok(rows) if !rows.is_empty() => Some(rows),
            Ok(_) => None,
            Err(e) => {
                warn!(table, error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    /// Builds the statement-shaped result for cached rows, running the auth
    /// probe when the query had one.
    async fn serve_local(
        &self,
        target: &CacheTarget,
        rows: Vec<Value>,
        started: Instant,
    ) -> EngineResult<Vec<Value>> {
        let count = rows.len();
        let mut results = vec![Value::Null; target.result_len.max(1)];
        if let Some(slot) = results.get_mut(target.data_index) {
            *slot = Value::Array(rows);
        }
        if let Some(probe) = target.probe_index {
            let auth = self.auth_probe().await;
            if let Some(slot) = results.get_mut(probe) {
                *slot = auth;
            }
        }
        info!(
            source = "local",
            rows = count,
            elapsed_ms = elapsed_ms(started),
            tables = %target.table,
            "query served"
        );
        Ok(results)
    }

    /// Returns the auth probe result, from the remote when connected and
    /// from the auth cache otherwise. A remote answer refreshes the cache.
    async fn auth_probe(&self) -> Value {
        if self.connection.is_connected() {
            match self.remote.query(AUTH_PROBE_QUERY, &Value::Null).await {
                Ok(results) => {
                    let result = results.into_iter().next().unwrap_or_default();
                    self.connection.record_identity(identity_of(&result));
                    return result;
                }
                Err(e) => debug!(error = %e, "auth probe failed, using cached state"),
            }
        }
        match self.auth.get() {
            Some(state) if state.is_authenticated => state
                .user_id
                .map(|id| Value::object([("id", reference(&id))]))
                .unwrap_or_default(),
            _ => Value::Null,
        }
    }

    /// Serves a personal-data query from the merged document, or runs it
    /// remotely and merges its components.
    async fn personal_query(
        &self,
        sql: &str,
        vars: &Value,
        descriptor: &QueryDescriptor,
        started: Instant,
    ) -> EngineResult<Vec<Value>> {
        let case_id = case_var(vars, None);
        let connected = self.connection.is_connected();

        if let Some(user_id) = self.connection.current_user().await {
            match self
                .cache
                .get_personal_data(Some(&user_id), case_id.as_deref())
            {
                Ok(Some(doc)) if !connected || is_recent(doc.synced_at, &self.config) => {
                    self.stats.record_cache_hit();
                    let results = descriptor
                        .statements
                        .iter()
                        .map(|statement| {
                            if statement.auth_probe {
                                Value::object([("id", reference(&user_id))])
                            } else {
                                statement
                                    .component
                                    .as_deref()
                                    .and_then(|name| doc.component(name))
                                    .map(|items| Value::Array(items.to_vec()))
                                    .unwrap_or_default()
                            }
                        })
                        .collect();
                    info!(
                        source = "local",
                        elapsed_ms = elapsed_ms(started),
                        tables = %descriptor.tables.join(","),
                        "personal data served"
                    );
                    return Ok(results);
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "personal data read failed, treating as miss"),
            }
        }

        if !connected {
            return Err(EngineError::connection("not connected and no cached personal data"));
        }
        self.stats.record_cache_miss();
        let results = self.run_remote(sql, vars, &descriptor.tables, started).await?;

        let mut user_id = self.auth.user_id();
        let mut patch = Value::empty_object();
        for (statement, result) in descriptor.statements.iter().zip(&results) {
            if statement.auth_probe {
                user_id = identity_of(result);
                self.connection.record_identity(user_id.clone());
            } else if let Some(name) = &statement.component {
                patch.insert(name.clone(), result.clone());
            }
        }
        if let Some(user_id) = user_id {
            if let Err(e) =
                self.cache
                    .sync_personal_data(Some(&user_id), case_id.as_deref(), &patch)
            {
                warn!(error = %e, "failed to cache personal data");
            }
        }
        Ok(results)
    }

    /// Runs a mutation remotely, or queues it when offline and allowed.
    pub async fn mutate(
        self: &Arc<Self>,
        sql: &str,
        vars: &Value,
        queue_offline: bool,
    ) -> EngineResult<Value> {
        let started = Instant::now();
        if queue_offline && !self.connection.is_connected() {
            return self.enqueue(sql, vars);
        }

        let descriptor = self.extractor.describe(sql);
        match self.run_remote(sql, vars, &descriptor.tables, started).await {
            Ok(results) => {
                self.mark_written(&descriptor);
                Ok(Value::Array(results))
            }
            Err(e) if queue_offline && e.triggers_reconnect() => self.enqueue(sql, vars),
            Err(e) => Err(e),
        }
    }

    fn enqueue(&self, sql: &str, vars: &Value) -> EngineResult<Value> {
        let item = Value::object([("sql", Value::from(sql)), ("vars", vars.clone())]);
        let position = self.offline.push(&self.config.offline_sync_key, item)?;
        self.stats.record_offline_queued();
        info!(position, "mutation queued offline");
        Ok(Value::object([
            ("queued", Value::Bool(true)),
            ("position", Value::from(position)),
        ]))
    }

    /// Replays queued mutations in order. A connection failure stops the
    /// replay and keeps the rest; a rejected mutation is dropped.
    pub async fn replay_offline(self: &Arc<Self>) -> EngineResult<ReplayReport> {
        let key = self.config.offline_sync_key.as_str();
        let mut queue: VecDeque<Value> = self.offline.restore(key)?.into();
        let mut report = ReplayReport::default();
        if queue.is_empty() {
            return Ok(report);
        }

        while let Some(item) = queue.front() {
            let Some(sql) = item.get("sql").and_then(Value::as_str).map(str::to_string) else {
                warn!("dropping malformed queued mutation");
                queue.pop_front();
                report.dropped += 1;
                continue;
            };
            let vars = item.get("vars").cloned().unwrap_or_default();
            match self.remote.query(&sql, &vars).await {
                Ok(_) => {
                    report.replayed += 1;
                    self.stats.record_offline_replayed();
                    self.mark_written(&self.extractor.describe(&sql));
                    queue.pop_front();
                }
                Err(e) if e.triggers_reconnect() => {
                    warn!(error = %e, "offline replay interrupted");
                    self.connection.report_failure(&e);
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "dropping rejected queued mutation");
                    report.dropped += 1;
                    queue.pop_front();
                }
            }
            let rest: Vec<Value> = queue.iter().cloned().collect();
            self.offline.persist(key, &rest)?;
        }

        if queue.is_empty() {
            self.offline.clear(key)?;
        }
        report.remaining = queue.len();
        info!(
            replayed = report.replayed,
            dropped = report.dropped,
            remaining = report.remaining,
            "offline queue replayed"
        );
        Ok(report)
    }

    // CRUD

    /// Selects a table or record remotely.
    pub async fn select(&self, resource: &Resource) -> EngineResult<Value> {
        self.stats.record_remote_query();
        self.remote
            .select(resource)
            .await
            .inspect_err(|e| self.connection.report_failure(e))
    }

    /// Creates a record remotely and caches it.
    pub async fn create(&self, resource: &Resource, data: Option<Value>) -> EngineResult<Value> {
        self.stats.record_remote_query();
        let result = self
            .remote
            .create(resource, data)
            .await
            .inspect_err(|e| self.connection.report_failure(e))?;
        self.write_through(resource.table(), &result);
        Ok(result)
    }

    /// Replaces records remotely and caches them.
    pub async fn update(&self, resource: &Resource, data: Option<Value>) -> EngineResult<Value> {
        self.stats.record_remote_query();
        let result = self
            .remote
            .update(resource, data)
            .await
            .inspect_err(|e| self.connection.report_failure(e))?;
        self.write_through(resource.table(), &result);
        Ok(result)
    }

    /// Merges into records remotely and caches them.
    pub async fn merge(&self, resource: &Resource, data: Value) -> EngineResult<Value> {
        self.stats.record_remote_query();
        let result = self
            .remote
            .merge(resource, data)
            .await
            .inspect_err(|e| self.connection.report_failure(e))?;
        self.write_through(resource.table(), &result);
        Ok(result)
    }

    /// Deletes records remotely and drops them from the cache.
    pub async fn delete(&self, resource: &Resource) -> EngineResult<Value> {
        self.stats.record_remote_query();
        let result = self
            .remote
            .delete(resource)
            .await
            .inspect_err(|e| self.connection.report_failure(e))?;
        let table = resource.table();
        let mut keys: BTreeSet<String> = rows_of(result.clone())
            .iter()
            .filter_map(row_key)
            .collect();
        match resource.record() {
            Some(rid) => {
                keys.insert(rid.id.clone());
            }
            None => {
                if let Err(e) = self.cache.remove_table_rows(table) {
                    warn!(table, error = %e, "failed to clear cached rows");
                }
            }
        }
        for key in keys {
            if let Err(e) = self.cache.remove_row(table, &key) {
                warn!(table, key = %key, error = %e, "failed to drop cached row");
            }
        }
        Ok(result)
    }

    fn write_through(&self, table: &str, result: &Value) {
        let rows = rows_of(result.clone());
        if let Err(e) = self.cache.upsert_rows(table, &rows) {
            warn!(table, error = %e, "failed to write through to cache");
        }
    }

    // Page data

    /// Registers `client` for each table of a page, syncing and opening an
    /// engine-owned live feed per table. Returns `{tables: {name: rows}}`.
    pub async fn subscribe_page(
        self: &Arc<Self>,
        client: &str,
        payload: &PageDataPayload,
    ) -> EngineResult<Value> {
        let mut tables = BTreeMap::new();
        for table in &payload.tables {
            let Some(scope) = self
                .page_scope(table, payload.user_id.as_deref(), payload.case_id.as_deref())
                .await
            else {
                warn!(table = %table, "private page table without an authenticated user");
                tables.insert(table.clone(), Value::Array(Vec::new()));
                continue;
            };
            self.pages
                .lock()
                .entry((table.clone(), scope.clone()))
                .or_insert_with(|| PageEntry {
                    class: payload.cache_type,
                    clients: BTreeSet::new(),
                })
                .clients
                .insert(client.to_string());

            if self.connection.is_connected() {
                if !self.cache.is_fresh(table, &scope, self.config.cache_stale_after) {
                    if let Err(e) = self.sync_table(table, &scope, payload.cache_type).await {
                        warn!(table = %table, error = %e, "page sync failed");
                        self.connection.report_failure(&e);
                    }
                }
                self.open_page_feed(table, &scope).await;
            }

            let rows = self.cache.rows(table, &scope).unwrap_or_else(|e| {
                warn!(table = %table, error = %e, "cache read failed");
                Vec::new()
            });
            tables.insert(table.clone(), Value::Array(rows));
        }
        Ok(Value::object([("tables", Value::Object(tables))]))
    }

    /// Removes `client` from a page's tables. Returns how many tables it
    /// left.
    pub async fn unsubscribe_page(&self, client: &str, payload: &PageDataPayload) -> usize {
        let mut left = 0;
        for table in &payload.tables {
            let Some(scope) = self
                .page_scope(table, payload.user_id.as_deref(), payload.case_id.as_deref())
                .await
            else {
                continue;
            };
            if self.leave_page(client, &(table.clone(), scope)).await {
                left += 1;
            }
        }
        left
    }

    /// Removes `client` from every page.
    pub async fn release_client(&self, client: &str) -> usize {
        let keys: Vec<PageKey> = self
            .pages
            .lock()
            .iter()
            .filter(|(_, entry)| entry.clients.contains(client))
            .map(|(key, _)| key.clone())
            .collect();
        let mut left = 0;
        for key in keys {
            if self.leave_page(client, &key).await {
                left += 1;
            }
        }
        left
    }

    async fn leave_page(&self, client: &str, key: &PageKey) -> bool {
        let (was_member, emptied) = {
            let mut pages = self.pages.lock();
            let Some(entry) = pages.get_mut(key) else {
                return false;
            };
            let was_member = entry.clients.remove(client);
            let emptied = entry.clients.is_empty().then_some(entry.class);
            if emptied.is_some() {
                pages.remove(key);
            }
            (was_member, emptied)
        };

        if let Some(class) = emptied {
            let (table, scope) = key;
            let subscriber = Subscriber::Cache {
                table: table.clone(),
                scope: scope.clone(),
            };
            self.live.unsubscribe_all(&subscriber).await;
            if class == CacheClass::Temporary {
                if let Err(e) =
                    self.cache
                        .clear_table(table, Some(scope), Some(CacheClass::Temporary))
                {
                    warn!(table = %table, error = %e, "failed to clear temporary cache");
                }
            }
            debug!(table = %table, "page table released");
        }
        was_member
    }

    /// Re-syncs every page table and opens any missing feed. Runs after a
    /// connection is re-established.
    pub async fn reopen_page_feeds(self: &Arc<Self>) {
        let pages: Vec<(PageKey, CacheClass)> = self
            .pages
            .lock()
            .iter()
            .map(|(key, entry)| (key.clone(), entry.class))
            .collect();
        for ((table, scope), class) in pages {
            if let Err(e) = self.sync_table(&table, &scope, class).await {
                warn!(table = %table, error = %e, "page resync failed");
                if e.triggers_reconnect() {
                    self.connection.report_failure(&e);
                    return;
                }
            }
            self.open_page_feed(&table, &scope).await;
        }
    }

    /// Returns the clients viewing a page table.
    pub fn page_clients(&self, table: &str, scope: &CacheScope) -> Vec<ClientId> {
        self.pages
            .lock()
            .get(&(table.to_string(), scope.clone()))
            .map(|entry| entry.clients.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn open_page_feed(&self, table: &str, scope: &CacheScope) {
        let subscriber = Subscriber::Cache {
            table: table.to_string(),
            scope: scope.clone(),
        };
        if self.live.is_subscribed(&subscriber) {
            return;
        }
        let (sql, vars) = self.table_query("LIVE SELECT", table, scope);
        if let Err(e) = self.live.subscribe(&sql, &vars, subscriber).await {
            warn!(table, error = %e, "failed to open page feed");
        }
    }

    /// Applies a live change to the cached tables it targets and tells the
    /// page's clients.
    pub fn apply_live_change(&self, targets: &[FeedTarget], notification: &LiveNotification) {
        let action = match notification.action {
            LiveAction::Create => ChangeAction::Insert,
            LiveAction::Update => ChangeAction::Update,
            LiveAction::Delete => ChangeAction::Delete,
            LiveAction::Close => return,
        };
        let Some(key) = row_key(&notification.result) else {
            debug!(live_id = %notification.live_id, "live change without a record id");
            return;
        };
        let update = IncrementalUpdate::new(action, key.clone(), notification.result.clone());
        for target in targets {
            match self.cache.apply_incremental(
                &target.table,
                &target.scope,
                &update,
                self.config.conflict_strategy,
            ) {
                Ok(outcome) => {
                    let clients = self.page_clients(&target.table, &target.scope);
                    self.hub.send_to(
                        &clients,
                        &Event::IncrementalUpdateProcessed {
                            table: target.table.clone(),
                            id: key.clone(),
                            outcome: outcome.as_str().to_string(),
                        },
                    );
                }
                Err(e) => warn!(table = %target.table, error = %e, "failed to apply live change"),
            }
        }
    }

    /// Applies a client-supplied incremental update and broadcasts the
    /// outcome.
    pub fn process_incremental(&self, payload: &IncrementalPayload) -> EngineResult<Value> {
        let update = IncrementalUpdate::from_payload(payload)?;
        let strategy = match payload.strategy.as_deref() {
            Some(name) => name.parse::<ConflictStrategy>()?,
            None => self.config.conflict_strategy,
        };
        let scope = self.config.catalog.scope_for(
            &payload.table,
            payload.user_id.as_deref(),
            payload.case_id.as_deref(),
        );
        let outcome = self
            .cache
            .apply_incremental(&payload.table, &scope, &update, strategy)?;
        debug!(table = %payload.table, key = %update.key, outcome = outcome.as_str(), strategy = strategy.as_str(), "incremental update");
        self.hub.broadcast(Event::IncrementalUpdateProcessed {
            table: payload.table.clone(),
            id: update.key.clone(),
            outcome: outcome.as_str().to_string(),
        });
        Ok(Value::object([
            ("outcome", Value::from(outcome.as_str())),
            ("changed", Value::Bool(outcome.changed())),
        ]))
    }

    // Sync

    /// Fetches a whole table (or its case slice) and replaces the cached
    /// rows. Returns the row count.
    pub async fn sync_table(
        &self,
        table: &str,
        scope: &CacheScope,
        class: CacheClass,
    ) -> EngineResult<usize> {
        let (sql, vars) = self.table_query("SELECT", table, scope);
        let class = match self.cache.read_table(table, scope) {
            Ok(Some(doc)) => doc.cache_type,
            _ => class,
        };
        if let Err(e) = self.cache.update_sync_status(table, scope, SyncStatus::Syncing, None) {
            warn!(table, error = %e, "failed to mark sync start");
        }
        self.stats.record_jit_sync();
        let started = Instant::now();

        match self.remote.query(&sql, &vars).await {
            Ok(results) => {
                let rows = rows_of(results.into_iter().next().unwrap_or_default());
                let count = rows.len();
                self.cache.write_table(table, scope, class, rows)?;
                self.cache
                    .update_sync_status(table, scope, SyncStatus::Synced, None)?;
                info!(
                    source = "remote",
                    rows = count,
                    elapsed_ms = elapsed_ms(started),
                    tables = table,
                    "table synced"
                );
                Ok(count)
            }
            Err(e) => {
                if let Err(store) =
                    self.cache
                        .update_sync_status(table, scope, SyncStatus::Failed, Some(e.to_string()))
                {
                    warn!(table, error = %store, "failed to record sync failure");
                }
                Err(e)
            }
        }
    }

    fn refresh_in_background(self: &Arc<Self>, table: &str, scope: &CacheScope) {
        let key = (table.to_string(), scope.clone());
        if !self.syncing.lock().insert(key.clone()) {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            let (table, scope) = &key;
            if let Err(e) = this.sync_table(table, scope, CacheClass::Persistent).await {
                warn!(table = %table, error = %e, "background refresh failed");
                this.connection.report_failure(&e);
            }
            this.syncing.lock().remove(&key);
        });
    }

    /// Pre-syncs the auto-sync tables of a query that runs remotely.
    async fn presync(self: &Arc<Self>, tables: &[String], vars: &Value) {
        if !self.connection.is_connected() {
            return;
        }
        for table in tables {
            if !self.config.catalog.is_auto_sync(table) {
                continue;
            }
            let Some(scope) = self.query_scope(table, vars).await else {
                continue;
            };
            if !self.cache.is_fresh(table, &scope, self.config.cache_stale_after) {
                self.refresh_in_background(table, &scope);
            }
        }
    }

    async fn run_remote(
        &self,
        sql: &str,
        vars: &Value,
        tables: &[String],
        started: Instant,
    ) -> EngineResult<Vec<Value>> {
        self.stats.record_remote_query();
        match self.remote.query(sql, vars).await {
            Ok(results) => {
                info!(
                    source = "remote",
                    rows = row_count(&results),
                    elapsed_ms = elapsed_ms(started),
                    tables = %tables.join(","),
                    "query executed"
                );
                Ok(results)
            }
            Err(e) => {
                warn!(
                    source = "remote",
                    elapsed_ms = elapsed_ms(started),
                    tables = %tables.join(","),
                    error = %e,
                    "query failed"
                );
                self.connection.report_failure(&e);
                Err(e)
            }
        }
    }

    fn mark_written(&self, descriptor: &QueryDescriptor) {
        for table in descriptor.written_tables() {
            if !self.config.catalog.is_auto_sync(&table) {
                continue;
            }
            if let Err(e) = self.cache.mark_stale(&table) {
                warn!(table = %table, error = %e, "failed to mark table stale");
            }
        }
    }

    /// The cache scope of a query on `table`. `None` when the scope cannot
    /// be determined (a private table without a user, or a case-scoped
    /// table without a case variable).
    async fn query_scope(&self, table: &str, vars: &Value) -> Option<CacheScope> {
        let rule = self.config.catalog.rule(table);
        let user_id = if rule.private {
            Some(self.connection.current_user().await?)
        } else {
            None
        };
        let case_id = match &rule.case_field {
            Some(field) => Some(case_var(vars, Some(field.as_str()))?),
            None => None,
        };
        Some(CacheScope::new(user_id, case_id))
    }

    /// The cache scope of a page table. `None` for a private table when no
    /// user is given or authenticated.
    async fn page_scope(
        &self,
        table: &str,
        user_id: Option<&str>,
        case_id: Option<&str>,
    ) -> Option<CacheScope> {
        let user_id = match user_id {
            Some(user_id) => Some(user_id.to_string()),
            None if self.config.catalog.is_private(table) => {
                Some(self.connection.current_user().await?)
            }
            None => None,
        };
        Some(
            self.config
                .catalog
                .scope_for(table, user_id.as_deref(), case_id),
        )
    }

    /// `<verb> * FROM <table>`, filtered by case for case-scoped tables.
    fn table_query(&self, verb: &str, table: &str, scope: &CacheScope) -> (String, Value) {
        let rule = self.config.catalog.rule(table);
        match (&rule.case_field, &scope.case_id) {
            (Some(field), Some(case_id)) => (
                format!("{verb} * FROM {table} WHERE {field} = $case"),
                Value::object([("case", reference(case_id))]),
            ),
            _ => (format!("{verb} * FROM {table}"), Value::Null),
        }
    }
}

impl std::fmt::Debug for QueryRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryRouter")
            .field("pages", &self.pages.lock().len())
            .finish_non_exhaustive()
    }
}

/// A `table:key` string as a reference, anything else as text.
fn reference(text: &str) -> Value {
    match RecordId::parse(text) {
        Some(rid) => Value::Record(rid),
        None => Value::from(text),
    }
}

/// Reads the case id from query variables.
fn case_var(vars: &Value, field: Option<&str>) -> Option<String> {
    let candidates = ["case", "caseId", "case_id"];
    field
        .into_iter()
        .chain(candidates)
        .find_map(|name| match vars.get(name)? {
            Value::Record(rid) => Some(rid.to_string()),
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            _ => None,
        })
}

fn is_recent(synced_at: i64, config: &EngineConfig) -> bool {
    let max_age = i64::try_from(config.cache_stale_after.as_millis()).unwrap_or(i64::MAX);
    crate::now_millis().saturating_sub(synced_at) < max_age
}

fn row_count(results: &[Value]) -> usize {
    results
        .iter()
        .map(|r| match r {
            Value::Array(rows) => rows.len(),
            Value::Null => 0,
            _ => 1,
        })
        .sum()
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TABLE_CACHE;
    use crate::config::{ConnectionConfig, TableCatalog, TableRule};
    use crate::engine::Engine;
    use crate::mock::MockRemote;
    use casesync_store::LocalStore;
    use std::time::Duration;

    const PERSONAL: &str = "RETURN $auth; SELECT * FROM operation; SELECT * FROM menu_item";

    fn row(id: &str, name: &str) -> Value {
        Value::object([("id", Value::from(id)), ("name", Value::from(name))])
    }

    fn engine_with(config: EngineConfig) -> (Engine, Arc<MockRemote>) {
        let mock = Arc::new(MockRemote::new());
        mock.set_auth_user(Value::from("user:u1"));
        mock.set_table("case", vec![row("c1", "Alpha")]);
        mock.set_table("note", vec![row("n1", "Call the trustee")]);
        mock.set_table("operation", vec![row("op1", "case.read")]);
        mock.set_table("menu_item", vec![row("m1", "Cases")]);
        let catalog = TableCatalog::new()
            .with_table("case", TableRule::auto_sync())
            .with_table("creditor", TableRule::auto_sync().case_scoped("case"))
            .with_table("note", TableRule::auto_sync().private());
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let engine = Engine::builder(config.with_catalog(catalog), store, mock.clone()).build();
        (engine, mock)
    }

    async fn connected() -> (Engine, Arc<MockRemote>) {
        let (engine, mock) = engine_with(EngineConfig::new());
        engine.start().await.unwrap();
        engine
            .connection()
            .ensure_connection(Some(ConnectionConfig::new("ws://db", "ns", "db")))
            .await;
        (engine, mock)
    }

    fn cached(engine: &Engine, table: &str) -> Vec<Value> {
        engine
            .router()
            .cache()
            .rows(table, &CacheScope::global())
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn cache_hit_keeps_the_statement_shape() {
        let (engine, mock) = connected().await;
        let router = engine.router();
        router
            .sync_table("case", &CacheScope::global(), CacheClass::Persistent)
            .await
            .unwrap();

        let results = router
            .query("RETURN $auth; SELECT * FROM case", &Value::Null, None)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0], Value::from("user:u1"));
        assert_eq!(results[1].as_array().unwrap().len(), 1);
        assert_eq!(mock.queries_matching("SELECT * FROM case"), 1);
        assert_eq!(engine.stats().cache_hits, 1);
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn empty_sync_falls_through_to_remote() {
        let (engine, mock) = connected().await;
        mock.respond("SELECT * FROM case", vec![Value::Array(Vec::new())]);

        let results = engine
            .router()
            .query("select * from case", &Value::Null, None)
            .await
            .unwrap();
        assert_eq!(results[0].as_array().unwrap().len(), 1);
        assert_eq!(mock.queries_matching("SELECT * FROM case"), 1);
        assert_eq!(mock.queries_matching("select * from case"), 1);
        assert_eq!(cached(&engine, "case").len(), 1);
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_cache_entry_is_read_remotely() {
        let (engine, mock) = connected().await;
        let store = engine.router().cache().store().clone();
        store
            .update(TABLE_CACHE, "case||", Value::object([("rows", Value::from("garbage"))]))
            .unwrap();

        let results = engine
            .router()
            .query("SELECT * FROM case", &Value::Null, None)
            .await
            .unwrap();
        assert_eq!(results[0].as_array().unwrap().len(), 1);
        assert_eq!(mock.queries_matching("SELECT * FROM case"), 1);
        assert_eq!(cached(&engine, "case").len(), 1);
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn personal_data_is_split_into_components_and_served_locally() {
        let (engine, mock) = connected().await;
        let router = engine.router();

        let first = router.query(PERSONAL, &Value::Null, None).await.unwrap();
        assert_eq!(first.len(), 3);
        let doc = router
            .cache()
            .get_personal_data(Some("user:u1"), None)
            .unwrap()
            .unwrap();
        assert_eq!(doc.component("operations").map(<[Value]>::len), Some(1));
        assert_eq!(doc.component("menus").map(<[Value]>::len), Some(1));

        let second = router.query(PERSONAL, &Value::Null, None).await.unwrap();
        assert_eq!(mock.queries_matching("SELECT * FROM operation"), 1);
        assert_eq!(
            second[0],
            Value::object([("id", Value::Record(RecordId::new("user", "u1")))])
        );
        assert_eq!(second[1], first[1]);
        assert_eq!(second[2], first[2]);
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn personal_data_merges_into_the_stored_document() {
        let (engine, mock) = engine_with(EngineConfig::new().with_cache_stale_after(Duration::ZERO));
        engine.start().await.unwrap();
        engine
            .connection()
            .ensure_connection(Some(ConnectionConfig::new("ws://db", "ns", "db")))
            .await;
        let router = engine.router();
        router
            .cache()
            .sync_personal_data(
                Some("user:u1"),
                None,
                &Value::object([("global_roles", Value::Array(vec![Value::from("admin")]))]),
            )
            .unwrap();

        router
            .query("RETURN $auth; SELECT * FROM operation", &Value::Null, None)
            .await
            .unwrap();
        assert_eq!(mock.queries_matching("SELECT * FROM operation"), 1);
        let doc = router
            .cache()
            .get_personal_data(Some("user:u1"), None)
            .unwrap()
            .unwrap();
        assert_eq!(doc.component("global_roles"), Some(&[Value::from("admin")][..]));
        assert_eq!(doc.component("operations").map(<[Value]>::len), Some(1));
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn private_table_stays_user_scoped_after_auth_expiry() {
        let (engine, mock) = connected().await;
        let router = engine.router();
        for _ in 0..2 {
            router.query(PERSONAL, &Value::Null, None).await.unwrap();
            router.query("SELECT * FROM note", &Value::Null, None).await.unwrap();
        }

        tokio::time::sleep(Duration::from_secs(31)).await;
        for _ in 0..3 {
            router.query(PERSONAL, &Value::Null, None).await.unwrap();
            let notes = router.query("SELECT * FROM note", &Value::Null, None).await.unwrap();
            assert_eq!(notes[0].as_array().unwrap().len(), 1);
        }

        assert_eq!(mock.queries_matching("SELECT * FROM operation"), 1);
        assert_eq!(mock.queries_matching("SELECT * FROM note"), 1);
        assert!(engine.connection_info().authenticated);
        assert_eq!(engine.stats().auth_refreshes, 1);
        let scope = CacheScope::new(Some("user:u1".into()), None);
        assert_eq!(router.cache().rows("note", &scope).unwrap().len(), 1);
        assert!(router.cache().rows("note", &CacheScope::global()).unwrap().is_empty());
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn remote_query_presyncs_each_auto_sync_table() {
        let (engine, mock) = connected().await;
        mock.set_table(
            "creditor",
            vec![Value::object([
                ("id", Value::from("cr1")),
                ("case", Value::Record(RecordId::new("case", "c1"))),
            ])],
        );
        let vars = Value::object([("case", Value::from("case:c1"))]);

        engine
            .router()
            .query("SELECT * FROM case, creditor", &vars, None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(cached(&engine, "case").len(), 1);
        let slice = CacheScope::new(None, Some("case:c1".into()));
        assert_eq!(engine.router().cache().rows("creditor", &slice).unwrap().len(), 1);
        assert_eq!(mock.queries_matching("SELECT * FROM creditor WHERE case = $case"), 1);
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn record_writes_go_through_to_cached_tables() {
        let (engine, _mock) = connected().await;
        let router = engine.router();
        router
            .sync_table("case", &CacheScope::global(), CacheClass::Persistent)
            .await
            .unwrap();
        let c1 = Resource::Record(RecordId::new("case", "c1"));
        let c2 = Resource::Record(RecordId::new("case", "c2"));

        router
            .create(&c2, Some(Value::object([("name", Value::from("Beta"))])))
            .await
            .unwrap();
        assert_eq!(cached(&engine, "case").len(), 2);

        router
            .update(&c1, Some(Value::object([("name", Value::from("Renamed"))])))
            .await
            .unwrap();
        router
            .merge(&c2, Value::object([("status", Value::from("open"))]))
            .await
            .unwrap();
        let rows = cached(&engine, "case");
        let by_key = |key: &str| rows.iter().find(|r| row_key(r).as_deref() == Some(key)).cloned();
        assert_eq!(by_key("c1").unwrap().get("name"), Some(&Value::from("Renamed")));
        let beta = by_key("c2").unwrap();
        assert_eq!(beta.get("name"), Some(&Value::from("Beta")));
        assert_eq!(beta.get("status"), Some(&Value::from("open")));
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn deletes_drop_cached_rows() {
        let (engine, mock) = connected().await;
        mock.set_table("case", vec![row("c1", "Alpha"), row("c2", "Beta"), row("c3", "Gamma")]);
        let router = engine.router();
        router
            .sync_table("case", &CacheScope::global(), CacheClass::Persistent)
            .await
            .unwrap();

        router
            .delete(&Resource::Record(RecordId::new("case", "c1")))
            .await
            .unwrap();
        let keys: Vec<_> = cached(&engine, "case").iter().filter_map(row_key).collect();
        assert_eq!(keys, vec!["c2", "c3"]);

        router
            .delete(&Resource::Table("case".into()))
            .await
            .unwrap();
        assert!(cached(&engine, "case").is_empty());
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn replay_drops_a_rejected_mutation_and_continues() {
        let (engine, mock) = engine_with(EngineConfig::new());
        let router = engine.router();
        for sql in [
            "UPDATE case:c1 SET status = 'open'",
            "UPDATE case:c1 SET bogus = 1",
            "UPDATE case:c1 SET status = 'closed'",
        ] {
            let queued = router.mutate(sql, &Value::Null, true).await.unwrap();
            assert_eq!(queued.get("queued"), Some(&Value::Bool(true)));
        }
        engine
            .connection()
            .ensure_connection(Some(ConnectionConfig::new("ws://db", "ns", "db")))
            .await;
        mock.reject_queries_containing("bogus");

        let report = router.replay_offline().await.unwrap();
        assert_eq!(
            report,
            ReplayReport {
                replayed: 2,
                dropped: 1,
                remaining: 0
            }
        );
        assert_eq!(mock.queries_matching("status = 'closed'"), 1);
        assert!(router.offline().restore("pending_mutations").unwrap().is_empty());
        assert_eq!(router.replay_offline().await.unwrap(), ReplayReport::default());
    }
}
