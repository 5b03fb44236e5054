//! End-to-end tests driving the engine through client requests.

use casesync_engine::{
    ClientReceiver, ConnectionState, Engine, EngineConfig, MockRemote, TableCatalog, TableRule,
};
use casesync_protocol::{Event, OutboundMessage, RecordId, Request, Response, Value};
use casesync_store::LocalStore;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    engine: Engine,
    mock: Arc<MockRemote>,
}

impl Harness {
    async fn start() -> Self {
        let mock = Arc::new(MockRemote::new());
        mock.set_table(
            "case",
            vec![
                Value::object([("id", Value::from("c1")), ("name", Value::from("Alpha"))]),
                Value::object([("id", Value::from("c2")), ("name", Value::from("Beta"))]),
            ],
        );
        mock.set_auth_user(Value::object([(
            "id",
            Value::Record(RecordId::new("user", "u1")),
        )]));
        let catalog = TableCatalog::new()
            .with_table("case", TableRule::auto_sync())
            .with_table("note", TableRule::auto_sync().case_scoped("case"));
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let engine = Engine::builder(EngineConfig::new().with_catalog(catalog), store, mock.clone())
            .build();
        engine.start().await.unwrap();
        Self { engine, mock }
    }

    async fn request(&self, kind: &str, payload: Value) -> Response {
        self.engine
            .handle(&Request::new(kind, payload).with_origin("tab-1"))
            .await
    }

    async fn connect(&self) -> Response {
        self.request(
            "connect",
            Value::object([
                ("endpoint", Value::from("ws://db.example")),
                ("namespace", Value::from("ns")),
                ("database", Value::from("cases")),
            ]),
        )
        .await
    }
}

fn events(rx: &mut ClientReceiver) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(message) = rx.try_recv() {
        if let OutboundMessage::Event(event) = message {
            events.push(event);
        }
    }
    events
}

fn query(sql: &str) -> Value {
    Value::object([("sql", Value::from(sql))])
}

#[tokio::test(start_paused = true)]
async fn connect_authenticate_and_serve_from_cache() {
    let h = Harness::start().await;
    let connected = h.connect().await;
    assert!(connected.is_ok(), "{connected:?}");
    assert_eq!(connected.kind, "connect_response");
    assert_eq!(connected.payload.get("state").and_then(Value::as_str), Some("connected"));

    let auth = h
        .request(
            "authenticate",
            Value::object([("token", Value::from("t-1")), ("tenantCode", Value::from("acme"))]),
        )
        .await;
    assert!(auth.is_ok(), "{auth:?}");
    assert_eq!(auth.payload.get("authenticated").and_then(Value::as_bool), Some(true));
    assert_eq!(h.mock.token().as_deref(), Some("t-1"));

    for _ in 0..2 {
        let response = h.request("query", query("SELECT * FROM case")).await;
        assert!(response.is_ok(), "{response:?}");
        let rows = response.payload.as_array().unwrap()[0].as_array().unwrap().clone();
        assert_eq!(rows.len(), 2);
    }
    assert_eq!(h.mock.queries_matching("FROM case"), 1);

    let stats = h.engine.stats();
    assert_eq!(stats.cache_misses, 1);
    assert_eq!(stats.cache_hits, 1);
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unknown_type_is_a_protocol_error() {
    let h = Harness::start().await;
    let response = h.request("teleport", Value::Null).await;
    assert_eq!(response.kind, "teleport_error");
    assert_eq!(response.error_message(), Some("unknown message type: teleport"));
    assert_eq!(response.payload.get("class").and_then(Value::as_str), Some("protocol"));
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn live_requires_an_origin() {
    let h = Harness::start().await;
    h.connect().await;
    let response = h
        .engine
        .handle(&Request::new(
            "live",
            Value::object([("query", Value::from("LIVE SELECT * FROM case"))]),
        ))
        .await;
    assert_eq!(response.kind, "live_error");
    assert_eq!(h.mock.calls("live"), 0);
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn live_subscriptions_survive_reconnect() {
    let h = Harness::start().await;
    h.connect().await;
    let mut tab = h.engine.register_client("tab-1");

    let opened = h
        .request("live", Value::object([("query", Value::from("LIVE SELECT * FROM case"))]))
        .await;
    let old_id = opened.payload.get("id").and_then(Value::as_str).unwrap().to_string();
    events(&mut tab);

    h.mock.set_unreachable(true);
    h.mock.drop_connection("socket closed");
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_ne!(h.engine.connection_info().state, ConnectionState::Connected);

    h.mock.set_unreachable(false);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.engine.connection_info().state, ConnectionState::Connected);

    let seen = events(&mut tab);
    let new_id = seen
        .iter()
        .find_map(|event| match event {
            Event::LiveQueryUuidChanged { old_id: from, new_id } if *from == old_id => {
                Some(new_id.clone())
            }
            _ => None,
        })
        .expect("id change notice");
    assert!(seen.iter().any(|event| matches!(
        event,
        Event::ConnectionStateChanged { state, .. } if state == "reconnecting"
    )));

    h.mock.emit_live(
        &new_id,
        casesync_engine::LiveAction::Update,
        Value::object([("id", Value::Record(RecordId::new("case", "c1")))]),
    );
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(events(&mut tab)
        .iter()
        .any(|event| matches!(event, Event::LiveUpdate { id, .. } if *id == new_id)));
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn offline_mutations_replay_after_reconnect() {
    let h = Harness::start().await;
    h.connect().await;
    h.mock.set_unreachable(true);
    h.mock.drop_connection("network down");
    tokio::time::sleep(Duration::from_millis(10)).await;

    let mutation = |sql: &str| {
        Value::object([("sql", Value::from(sql)), ("queueOffline", Value::Bool(true))])
    };
    let first = h
        .request("mutate", mutation("UPDATE case:c1 SET name = 'A'"))
        .await;
    assert!(first.is_ok(), "{first:?}");
    assert_eq!(first.payload.get("queued").and_then(Value::as_bool), Some(true));
    let second = h
        .request("mutate", mutation("UPDATE case:c2 SET name = 'B'"))
        .await;
    assert_eq!(second.payload.get("position").and_then(Value::as_u64), Some(2));

    let rejected = h
        .request("mutate", query("UPDATE case:c3 SET name = 'C'"))
        .await;
    assert_eq!(rejected.kind, "mutate_error");

    h.mock.set_unreachable(false);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.engine.connection_info().state, ConnectionState::Connected);

    let replayed: Vec<String> = h
        .mock
        .queries()
        .into_iter()
        .filter(|sql| sql.starts_with("UPDATE"))
        .collect();
    assert_eq!(
        replayed,
        vec![
            "UPDATE case:c1 SET name = 'A'".to_string(),
            "UPDATE case:c2 SET name = 'B'".to_string(),
        ]
    );
    let restored = h
        .request(
            "restore_offline_queue",
            Value::object([("syncKey", Value::from("pending_mutations"))]),
        )
        .await;
    assert_eq!(restored.payload.get("queue"), Some(&Value::Array(Vec::new())));
    assert_eq!(h.engine.stats().offline_replayed, 2);
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn incremental_updates_resolve_against_cached_rows() {
    let h = Harness::start().await;
    let mut tab = h.engine.register_client("tab-1");
    let stored = h
        .request(
            "update_cached_data",
            Value::object([
                ("table", Value::from("note")),
                ("caseId", Value::from("case:c1")),
                ("cacheType", Value::from("persistent")),
                (
                    "data",
                    Value::Array(vec![Value::object([
                        ("id", Value::from("n1")),
                        ("text", Value::from("old")),
                        ("updated_at", Value::from(100i64)),
                    ])]),
                ),
            ]),
        )
        .await;
    assert!(stored.is_ok(), "{stored:?}");

    let stale = h
        .request(
            "process_incremental_update",
            Value::object([
                ("table", Value::from("note")),
                ("caseId", Value::from("case:c1")),
                ("action", Value::from("update")),
                ("strategy", Value::from("timestamp")),
                (
                    "data",
                    Value::object([
                        ("id", Value::from("n1")),
                        ("text", Value::from("older")),
                        ("updated_at", Value::from(50i64)),
                    ]),
                ),
            ]),
        )
        .await;
    assert!(stale.is_ok(), "{stale:?}");
    assert_eq!(stale.payload.get("changed").and_then(Value::as_bool), Some(false));

    let fresh = h
        .request(
            "process_incremental_update",
            Value::object([
                ("table", Value::from("note")),
                ("caseId", Value::from("case:c1")),
                ("action", Value::from("update")),
                ("strategy", Value::from("timestamp")),
                (
                    "data",
                    Value::object([
                        ("id", Value::from("n1")),
                        ("text", Value::from("new")),
                        ("updated_at", Value::from(200i64)),
                    ]),
                ),
            ]),
        )
        .await;
    assert_eq!(fresh.payload.get("changed").and_then(Value::as_bool), Some(true));

    let cached = h
        .request(
            "query_cached_data",
            Value::object([("table", Value::from("note")), ("caseId", Value::from("case:c1"))]),
        )
        .await;
    let rows = cached.payload.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("text").and_then(Value::as_str), Some("new"));

    let processed = events(&mut tab)
        .into_iter()
        .filter(|event| matches!(event, Event::IncrementalUpdateProcessed { .. }))
        .count();
    assert_eq!(processed, 2);
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn missing_tenant_code_clears_auth_state() {
    let h = Harness::start().await;
    h.connect().await;
    let mut tab = h.engine.register_client("tab-1");
    h.request("authenticate", Value::object([("token", Value::from("t-1"))]))
        .await;

    let checked = h.request("check_tenant_code", Value::Null).await;
    assert_eq!(
        checked.payload.get("hasTenantCode").and_then(Value::as_bool),
        Some(false)
    );
    let seen = events(&mut tab);
    assert!(seen.iter().any(|event| matches!(event, Event::TenantCodeMissing)));
    assert!(seen
        .iter()
        .any(|event| matches!(event, Event::AuthStateCleared { reason } if reason == "tenant_code_missing")));

    let recovered = h.request("recover_tokens", Value::Null).await;
    assert_eq!(recovered.payload, Value::Null);
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn replies_reach_only_the_origin() {
    let h = Harness::start().await;
    let mut tab1 = h.engine.register_client("tab-1");
    let mut tab2 = h.engine.register_client("tab-2");

    let request = Request::new("get_connection_state", Value::Null)
        .with_correlation_id("r-1")
        .with_origin("tab-2");
    assert!(h.engine.handle_and_reply(&request).await);

    assert!(tab1.try_recv().is_err());
    match tab2.try_recv() {
        Ok(OutboundMessage::Response(response)) => {
            assert_eq!(response.kind, "get_connection_state_response");
            assert_eq!(response.correlation_id.as_deref(), Some("r-1"));
        }
        other => panic!("unexpected message: {other:?}"),
    }

    h.engine.unregister_client("tab-2").await;
    assert!(!h.engine.handle_and_reply(&request).await);
    h.engine.shutdown().await;
}
