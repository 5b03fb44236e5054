//! WebSocket remote.
//!
//! Speaks JSON-RPC (`{"id", "method", "params"}`) over one socket. A reader
//! task routes replies to waiting calls by id; frames without an id are
//! live notifications. Record references travel as `table:key` strings.

use crate::error::{EngineError, EngineResult};
use crate::remote::{LiveAction, LiveNotification, RemoteDatabase, RemoteEvent};
use async_trait::async_trait;
use casesync_protocol::{RecordId, Resource, Value};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, WsMessage>;
type WsReader = SplitStream<WsStream>;
type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<serde_json::Value, RpcFailure>>>>>;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug)]
enum RpcFailure {
    Remote(String),
    Closed(String),
}

struct Session {
    writer: Arc<tokio::sync::Mutex<WsWriter>>,
    reader: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

/// [`RemoteDatabase`] over a WebSocket JSON-RPC connection.
pub struct WsRemote {
    request_timeout: Duration,
    heartbeat_interval: Duration,
    session: Mutex<Option<Session>>,
    pending: Pending,
    connected: Arc<AtomicBool>,
    next_id: AtomicU64,
    events: broadcast::Sender<RemoteEvent>,
}

impl WsRemote {
    /// Creates an unconnected remote.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            request_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(25),
            session: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            connected: Arc::new(AtomicBool::new(false)),
            next_id: AtomicU64::new(0),
            events,
        }
    }

    /// Sets how long a call waits for its reply.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the ping interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    fn writer(&self) -> EngineResult<Arc<tokio::sync::Mutex<WsWriter>>> {
        self.session
            .lock()
            .as_ref()
            .map(|session| session.writer.clone())
            .ok_or_else(|| EngineError::connection("not connected"))
    }

    async fn call(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> EngineResult<serde_json::Value> {
        let writer = self.writer()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let frame = json!({ "id": id, "method": method, "params": params });
        let sent = writer.lock().await.send(WsMessage::Text(frame.to_string())).await;
        if let Err(e) = sent {
            self.pending.lock().remove(&id);
            return Err(EngineError::connection(e.to_string()));
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(RpcFailure::Remote(message)))) => Err(classify(method, message)),
            Ok(Ok(Err(RpcFailure::Closed(reason)))) => Err(EngineError::connection(reason)),
            Ok(Err(_)) => Err(EngineError::connection("connection closed")),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(EngineError::Timeout(self.request_timeout))
            }
        }
    }

    async fn call_value(&self, method: &str, params: Vec<serde_json::Value>) -> EngineResult<Value> {
        let result = self.call(method, params).await?;
        Ok(lift_record_ids(Value::from_json(result)))
    }

    fn teardown(&self) -> Option<Arc<tokio::sync::Mutex<WsWriter>>> {
        let session = self.session.lock().take()?;
        session.reader.abort();
        session.heartbeat.abort();
        self.connected.store(false, Ordering::SeqCst);
        fail_pending(&self.pending, "connection closed");
        Some(session.writer)
    }
}

impl Default for WsRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WsRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsRemote")
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .field("pending", &self.pending.lock().len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RemoteDatabase for WsRemote {
    async fn connect(&self, endpoint: &str) -> EngineResult<()> {
        if let Some(writer) = self.teardown() {
            let _ = writer.lock().await.close().await;
        }

        let (stream, response) = connect_async(endpoint)
            .await
            .map_err(|e| EngineError::connection(e.to_string()))?;
        info!(endpoint, status = %response.status(), "websocket connected");

        let (write, read) = stream.split();
        let writer = Arc::new(tokio::sync::Mutex::new(write));
        self.connected.store(true, Ordering::SeqCst);

        let reader = tokio::spawn(read_loop(
            read,
            self.pending.clone(),
            self.connected.clone(),
            self.events.clone(),
        ));
        let heartbeat = tokio::spawn(heartbeat_loop(writer.clone(), self.heartbeat_interval));

        *self.session.lock() = Some(Session {
            writer,
            reader,
            heartbeat,
        });
        Ok(())
    }

    async fn use_ns(&self, namespace: &str, database: &str) -> EngineResult<()> {
        self.call("use", vec![json!(namespace), json!(database)])
            .await
            .map(|_| ())
    }

    async fn authenticate(&self, token: &str) -> EngineResult<()> {
        self.call("authenticate", vec![json!(token)]).await.map(|_| ())
    }

    async fn invalidate(&self) -> EngineResult<()> {
        self.call("invalidate", Vec::new()).await.map(|_| ())
    }

    async fn query(&self, sql: &str, vars: &Value) -> EngineResult<Vec<Value>> {
        let vars = match vars {
            Value::Null => json!({}),
            other => to_wire(other),
        };
        let result = self.call("query", vec![json!(sql), vars]).await?;
        statement_results(result)
    }

    async fn select(&self, resource: &Resource) -> EngineResult<Value> {
        self.call_value("select", vec![thing(resource)]).await
    }

    async fn create(&self, resource: &Resource, data: Option<Value>) -> EngineResult<Value> {
        let mut params = vec![thing(resource)];
        params.extend(data.as_ref().map(to_wire));
        self.call_value("create", params).await
    }

    async fn update(&self, resource: &Resource, data: Option<Value>) -> EngineResult<Value> {
        let mut params = vec![thing(resource)];
        params.extend(data.as_ref().map(to_wire));
        self.call_value("update", params).await
    }

    async fn merge(&self, resource: &Resource, data: Value) -> EngineResult<Value> {
        self.call_value("merge", vec![thing(resource), to_wire(&data)])
            .await
    }

    async fn delete(&self, resource: &Resource) -> EngineResult<Value> {
        self.call_value("delete", vec![thing(resource)]).await
    }

    async fn live(&self, sql: &str, vars: &Value) -> EngineResult<String> {
        let results = self.query(sql, vars).await?;
        match results.into_iter().next() {
            Some(Value::String(id)) => Ok(id),
            Some(other) => Err(EngineError::query(format!(
                "live query returned {} instead of an id",
                other.kind()
            ))),
            None => Err(EngineError::query("live query returned no id")),
        }
    }

    async fn kill(&self, live_id: &str) -> EngineResult<()> {
        self.call("kill", vec![json!(live_id)]).await.map(|_| ())
    }

    async fn close(&self) -> EngineResult<()> {
        if let Some(writer) = self.teardown() {
            if let Err(e) = writer.lock().await.close().await {
                debug!(error = %e, "websocket close failed");
            }
        }
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<RemoteEvent> {
        self.events.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

async fn read_loop(
    mut read: WsReader,
    pending: Pending,
    connected: Arc<AtomicBool>,
    events: broadcast::Sender<RemoteEvent>,
) {
    let reason = loop {
        match read.next().await {
            Some(Ok(WsMessage::Text(text))) => route(&text, &pending, &events),
            Some(Ok(WsMessage::Binary(data))) => match String::from_utf8(data) {
                Ok(text) => route(&text, &pending, &events),
                Err(_) => warn!("dropping non-utf8 binary frame"),
            },
            Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {}
            Some(Ok(WsMessage::Close(frame))) => {
                break frame
                    .map(|f| f.reason.to_string())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "closed by server".to_string());
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => break e.to_string(),
            None => break "stream ended".to_string(),
        }
    };
    warn!(reason = %reason, "websocket closed");
    connected.store(false, Ordering::SeqCst);
    fail_pending(&pending, &reason);
    let _ = events.send(RemoteEvent::Disconnected { reason });
}

async fn heartbeat_loop(writer: Arc<tokio::sync::Mutex<WsWriter>>, interval: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        ticker.tick().await;
        let mut w = writer.lock().await;
        if w.send(WsMessage::Ping(Vec::new())).await.is_err() {
            break;
        }
    }
}

fn fail_pending(pending: &Pending, reason: &str) {
    for (_, tx) in pending.lock().drain() {
        let _ = tx.send(Err(RpcFailure::Closed(reason.to_string())));
    }
}

fn route(text: &str, pending: &Pending, events: &broadcast::Sender<RemoteEvent>) {
    let json: serde_json::Value = match serde_json::from_str(text) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "dropping malformed frame");
            return;
        }
    };
    match json.get("id").and_then(reply_id) {
        Some(id) => {
            let Some(tx) = pending.lock().remove(&id) else {
                debug!(id, "reply for unknown call");
                return;
            };
            let reply = match json.get("error") {
                Some(error) if !error.is_null() => Err(RpcFailure::Remote(error_message(error))),
                _ => Ok(json.get("result").cloned().unwrap_or_default()),
            };
            let _ = tx.send(reply);
        }
        None => match notification_of(&json) {
            Some(notification) => {
                let _ = events.send(RemoteEvent::Live(notification));
            }
            None => debug!("ignoring frame without id"),
        },
    }
}

fn reply_id(id: &serde_json::Value) -> Option<u64> {
    id.as_u64().or_else(|| id.as_str().and_then(|s| s.parse().ok()))
}

fn notification_of(json: &serde_json::Value) -> Option<LiveNotification> {
    let result = json.get("result")?;
    let live_id = result.get("id")?.as_str()?.to_string();
    let action = LiveAction::parse(result.get("action")?.as_str()?)?;
    let payload = result.get("result").cloned().unwrap_or_default();
    Some(LiveNotification {
        live_id,
        action,
        result: lift_record_ids(Value::from_json(payload)),
    })
}

fn error_message(error: &serde_json::Value) -> String {
    error
        .get("message")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string())
}

fn classify(method: &str, message: String) -> EngineError {
    match method {
        "authenticate" | "signin" | "invalidate" => EngineError::auth(message),
        _ => EngineError::query(message),
    }
}

/// Unpacks `[{status, result}]`. The first failed statement fails the call.
fn statement_results(result: serde_json::Value) -> EngineResult<Vec<Value>> {
    let serde_json::Value::Array(statements) = result else {
        return Ok(vec![lift_record_ids(Value::from_json(result))]);
    };
    statements
        .into_iter()
        .map(|mut statement| {
            let status = statement
                .get("status")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("OK")
                .to_ascii_uppercase();
            let result = statement
                .get_mut("result")
                .map(serde_json::Value::take)
                .unwrap_or_default();
            if status == "OK" {
                Ok(lift_record_ids(Value::from_json(result)))
            } else {
                let message = match result {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                Err(EngineError::query(message))
            }
        })
        .collect()
}

fn thing(resource: &Resource) -> serde_json::Value {
    serde_json::Value::String(resource.to_string())
}

/// Encodes a value for the wire with references as `table:key` strings.
fn to_wire(value: &Value) -> serde_json::Value {
    match value {
        Value::Record(rid) => serde_json::Value::String(rid.to_string()),
        Value::Array(items) => serde_json::Value::Array(items.iter().map(to_wire).collect()),
        Value::Object(map) => serde_json::Value::Object(
            map.iter().map(|(k, v)| (k.clone(), to_wire(v))).collect(),
        ),
        other => other.to_json(),
    }
}

/// Turns `table:key` strings in `id` fields into references.
fn lift_record_ids(value: Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.into_iter().map(lift_record_ids).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| {
                    let v = match v {
                        Value::String(s) if k == "id" => match RecordId::parse(&s) {
                            Some(rid) => Value::Record(rid),
                            None => Value::String(s),
                        },
                        other => lift_record_ids(other),
                    };
                    (k, v)
                })
                .collect(),
        ),
        other => other,
    }
}
