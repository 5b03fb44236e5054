//! Message dispatcher.
//!
//! Turns one inbound [`Request`] into one [`Response`] for the originating
//! client. Payloads arrive with tagged references already decoded.

use crate::cache::{CacheScope, SyncFilter, SyncRecordUpdate, SyncStatus};
use crate::config::{ConnectionConfig, TableCatalog};
use crate::connection::ConnectionManager;
use crate::error::{EngineError, EngineResult};
use crate::incremental::plain_key;
use crate::live::{LiveRegistry, Subscriber};
use crate::query::QueryDescriptor;
use crate::router::QueryRouter;
use crate::stats::EngineStats;
use crate::token::{ClearReason, TokenManager};
use casesync_protocol::{
    from_value, to_value, AuthenticatePayload, CacheRecordPayload, CrudPayload, KillPayload,
    LivePayload, MutatePayload, OfflineQueuePayload, PageDataPayload, PersonalDataPayload,
    QueryPayload, RecordKeyPayload, Request, RequestKind, Response, SyncRecordPayload,
    SyncScopePayload, SyncStatusPayload, TableCachePayload, UpdateCachePayload, Value,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Routes requests to the engine's components.
#[derive(Debug)]
pub struct Dispatcher {
    catalog: TableCatalog,
    connection: Arc<ConnectionManager>,
    tokens: Arc<TokenManager>,
    router: Arc<QueryRouter>,
    live: Arc<LiveRegistry>,
    stats: Arc<EngineStats>,
}

impl Dispatcher {
    pub(crate) fn new(
        catalog: TableCatalog,
        connection: Arc<ConnectionManager>,
        tokens: Arc<TokenManager>,
        router: Arc<QueryRouter>,
        live: Arc<LiveRegistry>,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            catalog,
            connection,
            tokens,
            router,
            live,
            stats,
        }
    }

    /// Handles one request. Never fails: errors become `<type>_error`
    /// responses carrying `{message, class}`.
    pub async fn dispatch(&self, request: &Request) -> Response {
        self.stats.record_request();
        let correlation_id = request.correlation_id.clone();
        let kind = match request.request_kind() {
            Ok(kind) => kind,
            Err(e) => {
                self.stats.record_error();
                warn!(kind = %request.kind, "unknown message type");
                let error = EngineError::from(e);
                return Response::error(
                    &request.kind,
                    correlation_id,
                    error.to_string(),
                    error.class().as_str(),
                );
            }
        };

        let started = Instant::now();
        if kind.needs_connection() {
            self.connection.ensure_connection(None).await;
        }
        match self.handle(kind, request).await {
            Ok(payload) => {
                debug!(
                    kind = kind.as_str(),
                    elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "request handled"
                );
                Response::ok(kind.as_str(), correlation_id, payload)
            }
            Err(e) => {
                self.stats.record_error();
                warn!(kind = kind.as_str(), class = e.class().as_str(), error = %e, "request failed");
                Response::error(kind.as_str(), correlation_id, e.to_string(), e.class().as_str())
            }
        }
    }

    async fn handle(&self, kind: RequestKind, request: &Request) -> EngineResult<Value> {
        let payload = &request.payload;
        match kind {
            // Connection
            RequestKind::Connect => {
                let config: ConnectionConfig = decode(payload)?;
                if payload.get("token").is_some() {
                    let auth: AuthenticatePayload = decode(payload)?;
                    self.tokens.store_token(&auth)?;
                }
                Ok(self.connection.ensure_connection(Some(config)).await.to_value())
            }
            RequestKind::Authenticate => {
                let auth: AuthenticatePayload = decode(payload)?;
                Ok(self.connection.authenticate(&auth).await?.to_value())
            }
            RequestKind::Invalidate => Ok(self.connection.invalidate().to_value()),
            RequestKind::ForceReconnect => Ok(self.connection.force_reconnect().await.to_value()),
            RequestKind::GetConnectionState => Ok(self.connection.status().await.to_value()),

            // Data
            RequestKind::Query => {
                let query: QueryPayload = decode(payload)?;
                let descriptor = query
                    .descriptor
                    .as_ref()
                    .map(decode::<QueryDescriptor>)
                    .transpose()?;
                let results = self.router.query(&query.sql, &query.vars, descriptor).await?;
                Ok(Value::Array(results))
            }
            RequestKind::Mutate => {
                let mutation: MutatePayload = decode(payload)?;
                self.router
                    .mutate(&mutation.sql, &mutation.vars, mutation.queue_offline)
                    .await
            }
            RequestKind::Create => {
                let crud: CrudPayload = decode(payload)?;
                self.router.create(&crud.resource()?, crud.data).await
            }
            RequestKind::Select => {
                let crud: CrudPayload = decode(payload)?;
                self.router.select(&crud.resource()?).await
            }
            RequestKind::Update => {
                let crud: CrudPayload = decode(payload)?;
                self.router.update(&crud.resource()?, crud.data).await
            }
            RequestKind::Merge => {
                let crud: CrudPayload = decode(payload)?;
                let data = crud
                    .data
                    .clone()
                    .ok_or_else(|| EngineError::invalid("merge requires data"))?;
                self.router.merge(&crud.resource()?, data).await
            }
            RequestKind::Delete => {
                let crud: CrudPayload = decode(payload)?;
                self.router.delete(&crud.resource()?).await
            }

            // Live
            RequestKind::Live => {
                let live: LivePayload = decode(payload)?;
                let client = origin(request)?;
                let id = self
                    .live
                    .subscribe(&live.query, &live.vars, Subscriber::Client(client))
                    .await?;
                Ok(Value::object([("id", Value::from(id))]))
            }
            RequestKind::Kill => {
                let kill: KillPayload = decode(payload)?;
                let client = origin(request)?;
                let killed = self
                    .live
                    .unsubscribe(&kill.id, &Subscriber::Client(client))
                    .await?;
                Ok(Value::object([("killed", Value::Bool(killed))]))
            }

            // Token
            RequestKind::CheckTenantCode => {
                let has_tenant_code = self.tokens.has_tenant_code();
                if !has_tenant_code && self.tokens.get_token().is_some() {
                    self.tokens.clear_auth_state(ClearReason::TenantMissing);
                }
                Ok(Value::object([("hasTenantCode", Value::Bool(has_tenant_code))]))
            }
            RequestKind::RecoverTokens => match self.tokens.get_token() {
                Some(token) => Ok(to_value(&token)?),
                None => Ok(Value::Null),
            },

            // Page data and cache
            RequestKind::SubscribePageData => {
                let page: PageDataPayload = decode(payload)?;
                let client = origin(request)?;
                self.router.subscribe_page(&client, &page).await
            }
            RequestKind::UnsubscribePageData => {
                let page: PageDataPayload = decode(payload)?;
                let client = origin(request)?;
                let left = self.router.unsubscribe_page(&client, &page).await;
                Ok(Value::object([("left", Value::from(left))]))
            }
            RequestKind::QueryCachedData => {
                let query: TableCachePayload = decode(payload)?;
                let scope = self.scope(&query.table, &query.user_id, &query.case_id);
                let rows = self
                    .router
                    .cache()
                    .read_table(&query.table, &scope)?
                    .filter(|doc| query.cache_type.map_or(true, |class| class == doc.cache_type))
                    .map(|doc| doc.rows)
                    .unwrap_or_default();
                Ok(Value::Array(rows))
            }
            RequestKind::UpdateCachedData => {
                let update: UpdateCachePayload = decode(payload)?;
                let scope = self.scope(&update.table, &update.user_id, &update.case_id);
                let doc = self.router.cache().write_table(
                    &update.table,
                    &scope,
                    update.cache_type,
                    update.data,
                )?;
                Ok(Value::object([
                    ("table", Value::from(doc.table)),
                    ("rows", Value::from(doc.rows.len())),
                ]))
            }
            RequestKind::ClearTableCache => {
                let clear: TableCachePayload = decode(payload)?;
                let scope = (clear.user_id.is_some() || clear.case_id.is_some())
                    .then(|| self.scope(&clear.table, &clear.user_id, &clear.case_id));
                let removed =
                    self.router
                        .cache()
                        .clear_table(&clear.table, scope.as_ref(), clear.cache_type)?;
                Ok(Value::object([("removed", Value::from(removed))]))
            }
            RequestKind::ClearAllCache => {
                let removed = self.router.cache().clear_all()?;
                Ok(Value::object([("removed", Value::from(removed))]))
            }
            RequestKind::CacheRecord => {
                let record: CacheRecordPayload = decode(payload)?;
                let doc = self.router.cache().cache_record(
                    &record.table,
                    &plain_key(&record.record_id),
                    record.data,
                    record.cache_type,
                )?;
                Ok(doc.data)
            }
            RequestKind::GetCachedRecord => {
                let key: RecordKeyPayload = decode(payload)?;
                Ok(self
                    .router
                    .cache()
                    .get_cached_record(&key.table, &plain_key(&key.record_id))?
                    .unwrap_or_default())
            }
            RequestKind::ClearCachedRecord => {
                let key: RecordKeyPayload = decode(payload)?;
                let removed = self
                    .router
                    .cache()
                    .clear_cached_record(&key.table, &plain_key(&key.record_id))?;
                Ok(Value::object([("removed", Value::Bool(removed))]))
            }

            // Personal data
            RequestKind::SyncUserPersonalData => {
                let personal: PersonalDataPayload = decode(payload)?;
                let data = personal
                    .data
                    .as_ref()
                    .ok_or_else(|| EngineError::invalid("sync_user_personal_data requires data"))?;
                let doc = self.router.cache().sync_personal_data(
                    personal.user_id.as_deref(),
                    personal.case_id.as_deref(),
                    data,
                )?;
                Ok(to_value(&doc)?)
            }
            RequestKind::GetUserPersonalData => {
                let personal: PersonalDataPayload = decode(payload)?;
                match self
                    .router
                    .cache()
                    .get_personal_data(personal.user_id.as_deref(), personal.case_id.as_deref())?
                {
                    Some(doc) => Ok(to_value(&doc)?),
                    None => Ok(Value::Null),
                }
            }
            RequestKind::ClearUserPersonalData => {
                let personal: PersonalDataPayload = decode(payload)?;
                let removed = self
                    .router
                    .cache()
                    .clear_personal_data(personal.user_id.as_deref(), personal.case_id.as_deref())?;
                Ok(Value::object([("removed", Value::from(removed))]))
            }

            // Sync
            RequestKind::ProcessIncrementalUpdate => {
                self.router.process_incremental(&decode(payload)?)
            }
            RequestKind::CreateSyncRecord => {
                let sync: SyncRecordPayload = decode(payload)?;
                let scope = self.scope(&sync.table, &sync.user_id, &sync.case_id);
                let cache = self.router.cache();
                let mut record = cache.create_sync_record(&sync.table, &scope)?;
                let update = sync_update(&sync)?;
                if has_changes(&update) {
                    record = cache.update_sync_record(&sync.table, &scope, update)?;
                }
                Ok(to_value(&record)?)
            }
            RequestKind::GetSyncRecord => {
                let sync: SyncRecordPayload = decode(payload)?;
                let scope = self.scope(&sync.table, &sync.user_id, &sync.case_id);
                match self.router.cache().get_sync_record(&sync.table, &scope)? {
                    Some(record) => Ok(to_value(&record)?),
                    None => Ok(Value::Null),
                }
            }
            RequestKind::UpdateSyncRecord => {
                let sync: SyncRecordPayload = decode(payload)?;
                let scope = self.scope(&sync.table, &sync.user_id, &sync.case_id);
                let record =
                    self.router
                        .cache()
                        .update_sync_record(&sync.table, &scope, sync_update(&sync)?)?;
                Ok(to_value(&record)?)
            }
            RequestKind::UpdateSyncStatus => {
                let status: SyncStatusPayload = decode(payload)?;
                let scope = self.scope(&status.table, &status.user_id, &status.case_id);
                let record = self.router.cache().update_sync_status(
                    &status.table,
                    &scope,
                    status.status.parse::<SyncStatus>()?,
                    status.error,
                )?;
                Ok(to_value(&record)?)
            }
            RequestKind::ClearSyncRecords => {
                let filter: SyncScopePayload = decode(payload)?;
                let removed = self.router.cache().clear_sync_records(&SyncFilter {
                    table: filter.table,
                    user_id: filter.user_id,
                    case_id: filter.case_id,
                })?;
                Ok(Value::object([("removed", Value::from(removed))]))
            }

            // Offline queue
            RequestKind::PersistOfflineQueue => {
                let queue: OfflineQueuePayload = decode(payload)?;
                self.router.offline().persist(&queue.sync_key, &queue.queue)?;
                Ok(Value::object([("persisted", Value::from(queue.queue.len()))]))
            }
            RequestKind::RestoreOfflineQueue => {
                let queue: OfflineQueuePayload = decode(payload)?;
                let items = self.router.offline().restore(&queue.sync_key)?;
                Ok(Value::object([("queue", Value::Array(items))]))
            }
            RequestKind::ClearOfflineQueue => {
                let queue: OfflineQueuePayload = decode(payload)?;
                self.router.offline().clear(&queue.sync_key)?;
                Ok(Value::object([("cleared", Value::Bool(true))]))
            }
        }
    }

    fn scope(&self, table: &str, user_id: &Option<String>, case_id: &Option<String>) -> CacheScope {
        self.catalog
            .scope_for(table, user_id.as_deref(), case_id.as_deref())
    }
}

fn decode<T: DeserializeOwned>(payload: &Value) -> EngineResult<T> {
    Ok(from_value(payload)?)
}

fn origin(request: &Request) -> EngineResult<String> {
    request
        .origin_id
        .clone()
        .ok_or_else(|| EngineError::invalid(format!("{} requires an originId", request.kind)))
}

fn sync_update(payload: &SyncRecordPayload) -> EngineResult<SyncRecordUpdate> {
    Ok(SyncRecordUpdate {
        last_sync_timestamp: payload.last_sync_timestamp,
        last_sync_id: payload.last_sync_id.clone(),
        status: payload
            .status
            .as_deref()
            .map(str::parse::<SyncStatus>)
            .transpose()?,
        retry_count: payload.retry_count,
    })
}

fn has_changes(update: &SyncRecordUpdate) -> bool {
    update.last_sync_timestamp.is_some()
        || update.last_sync_id.is_some()
        || update.status.is_some()
        || update.retry_count.is_some()
}
