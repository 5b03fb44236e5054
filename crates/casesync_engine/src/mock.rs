//! In-memory remote database for testing.

use crate::error::{EngineError, EngineResult};
use crate::remote::{LiveAction, LiveNotification, RemoteDatabase, RemoteEvent};
use async_trait::async_trait;
use casesync_protocol::{RecordId, Resource, Value};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tokio::sync::broadcast;

/// A scriptable in-memory [`RemoteDatabase`].
///
/// Understands the probe statements `RETURN true` and `RETURN $auth`,
/// `SELECT * FROM <table> [WHERE <field> = $<var>]`, and record-level CRUD.
/// Anything else returns an empty result unless scripted with
/// [`MockRemote::respond`].
#[derive(Debug)]
pub struct MockRemote {
    tables: Mutex<BTreeMap<String, Vec<Value>>>,
    responses: Mutex<HashMap<String, Vec<Value>>>,
    calls: Mutex<HashMap<&'static str, usize>>,
    query_log: Mutex<Vec<String>>,
    auth_user: Mutex<Option<Value>>,
    token: Mutex<Option<String>>,
    live_feeds: Mutex<HashMap<String, String>>,
    stable_ids: Mutex<HashMap<String, String>>,
    kills: Mutex<Vec<String>>,
    connected: AtomicBool,
    unreachable: AtomicBool,
    reject_auth: AtomicBool,
    fail_live: AtomicBool,
    stable_live_ids: AtomicBool,
    hang_queries: AtomicBool,
    rejected: Mutex<Vec<String>>,
    live_ids: Mutex<HashMap<String, String>>,
    failing_connects: AtomicU32,
    next_live: AtomicU64,
    events: broadcast::Sender<RemoteEvent>,
}

impl MockRemote {
    /// Creates a reachable mock with no data.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            tables: Mutex::new(BTreeMap::new()),
            responses: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            query_log: Mutex::new(Vec::new()),
            auth_user: Mutex::new(None),
            token: Mutex::new(None),
            live_feeds: Mutex::new(HashMap::new()),
            stable_ids: Mutex::new(HashMap::new()),
            kills: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            unreachable: AtomicBool::new(false),
            reject_auth: AtomicBool::new(false),
            fail_live: AtomicBool::new(false),
            stable_live_ids: AtomicBool::new(false),
            hang_queries: AtomicBool::new(false),
            rejected: Mutex::new(Vec::new()),
            live_ids: Mutex::new(HashMap::new()),
            failing_connects: AtomicU32::new(0),
            next_live: AtomicU64::new(1),
            events,
        }
    }

    /// Replaces the rows of a table.
    pub fn set_table(&self, table: &str, rows: Vec<Value>) {
        let rows = rows
            .into_iter()
            .map(|row| with_record_id(table, row))
            .collect();
        self.tables.lock().insert(table.to_string(), rows);
    }

    /// Returns the rows of a table.
    pub fn table(&self, table: &str) -> Vec<Value> {
        self.tables.lock().get(table).cloned().unwrap_or_default()
    }

    /// Scripts the result of an exact query text.
    pub fn respond(&self, sql: &str, results: Vec<Value>) {
        self.responses.lock().insert(sql.trim().to_string(), results);
    }

    /// Sets the value returned by `RETURN $auth`.
    pub fn set_auth_user(&self, user: Value) {
        *self.auth_user.lock() = Some(user);
    }

    /// Makes the next `n` connect attempts fail.
    pub fn fail_connects(&self, n: u32) {
        self.failing_connects.store(n, Ordering::SeqCst);
    }

    /// Makes every call fail with a connection error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
        if unreachable {
            self.connected.store(false, Ordering::SeqCst);
        }
    }

    /// Makes authentication fail.
    pub fn reject_auth(&self, reject: bool) {
        self.reject_auth.store(reject, Ordering::SeqCst);
    }

    /// Makes opening live feeds fail.
    pub fn fail_live(&self, fail: bool) {
        self.fail_live.store(fail, Ordering::SeqCst);
    }

    /// Reuses the same live id for the same query text across calls.
    pub fn set_stable_live_ids(&self, stable: bool) {
        self.stable_live_ids.store(stable, Ordering::SeqCst);
    }

    /// Makes queries never complete while the socket stays open.
    pub fn hang_queries(&self, hang: bool) {
        self.hang_queries.store(hang, Ordering::SeqCst);
    }

    /// Rejects, with a query error, every query whose text contains
    /// `needle`.
    pub fn reject_queries_containing(&self, needle: &str) {
        self.rejected.lock().push(needle.to_string());
    }

    /// Scripts the id returned when opening a live feed for `sql`.
    pub fn set_live_id(&self, sql: &str, id: &str) {
        self.live_ids.lock().insert(sql.to_string(), id.to_string());
    }

    /// Closes the transport from the server side.
    pub fn drop_connection(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.events.send(RemoteEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    /// Delivers a live notification.
    pub fn emit_live(&self, live_id: &str, action: LiveAction, result: Value) {
        let _ = self.events.send(RemoteEvent::Live(LiveNotification {
            live_id: live_id.to_string(),
            action,
            result,
        }));
    }

    /// Returns how many times a method was called.
    pub fn calls(&self, method: &str) -> usize {
        self.calls.lock().get(method).copied().unwrap_or(0)
    }

    /// Returns every query text received, in order.
    pub fn queries(&self) -> Vec<String> {
        self.query_log.lock().clone()
    }

    /// Returns how many received queries contain `needle`.
    pub fn queries_matching(&self, needle: &str) -> usize {
        self.query_log
            .lock()
            .iter()
            .filter(|q| q.contains(needle))
            .count()
    }

    /// Returns the open live feeds as `(id, query)`.
    pub fn live_feeds(&self) -> Vec<(String, String)> {
        let mut feeds: Vec<_> = self
            .live_feeds
            .lock()
            .iter()
            .map(|(id, sql)| (id.clone(), sql.clone()))
            .collect();
        feeds.sort();
        feeds
    }

    /// Returns every killed live id, in order.
    pub fn kills(&self) -> Vec<String> {
        self.kills.lock().clone()
    }

    /// Returns the token of the last successful authentication.
    pub fn token(&self) -> Option<String> {
        self.token.lock().clone()
    }

    fn record(&self, method: &'static str) {
        *self.calls.lock().entry(method).or_insert(0) += 1;
    }

    fn check_reachable(&self) -> EngineResult<()> {
        if self.unreachable.load(Ordering::SeqCst) || !self.connected.load(Ordering::SeqCst) {
            return Err(EngineError::connection("mock remote unreachable"));
        }
        Ok(())
    }

    fn run_statement(&self, statement: &str, vars: &Value) -> Value {
        let lower = statement.to_ascii_lowercase();
        if lower == "return true" {
            return Value::Bool(true);
        }
        if lower == "return $auth" {
            return self.auth_user.lock().clone().unwrap_or(Value::Null);
        }
        if let Some(rest) = lower.strip_prefix("select * from ") {
            let mut words = rest.split_whitespace();
            let table = words.next().unwrap_or_default().to_string();
            let rows = self.table(&table);
            let filter = parse_var_filter(&words.collect::<Vec<_>>());
            let rows = match filter {
                Some((field, var)) => {
                    let expected = vars.get(&var).cloned().unwrap_or(Value::Null);
                    rows.into_iter()
                        .filter(|row| same_ref(row.get(&field), &expected))
                        .collect()
                }
                None => rows,
            };
            return Value::Array(rows);
        }
        Value::Array(Vec::new())
    }

    fn target_records<F>(&self, resource: &Resource, mut f: F) -> Value
    where
        F: FnMut(&mut Vec<Value>, Option<&RecordId>) -> Value,
    {
        let mut tables = self.tables.lock();
        let rows = tables.entry(resource.table().to_string()).or_default();
        f(rows, resource.record())
    }
}

impl Default for MockRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteDatabase for MockRemote {
    async fn connect(&self, _endpoint: &str) -> EngineResult<()> {
        self.record("connect");
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(EngineError::connection("connection refused"));
        }
        let remaining = self.failing_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(EngineError::connection("connection refused"));
        }
        self.connected.store(true, Ordering::SeqCst);
        // A fresh socket has no live feeds.
        self.live_feeds.lock().clear();
        Ok(())
    }

    async fn use_ns(&self, _namespace: &str, _database: &str) -> EngineResult<()> {
        self.record("use_ns");
        self.check_reachable()
    }

    async fn authenticate(&self, token: &str) -> EngineResult<()> {
        self.record("authenticate");
        self.check_reachable()?;
        if self.reject_auth.load(Ordering::SeqCst) {
            return Err(EngineError::auth("token rejected"));
        }
        *self.token.lock() = Some(token.to_string());
        Ok(())
    }

    async fn invalidate(&self) -> EngineResult<()> {
        self.record("invalidate");
        *self.token.lock() = None;
        Ok(())
    }

    async fn query(&self, sql: &str, vars: &Value) -> EngineResult<Vec<Value>> {
        self.record("query");
        self.check_reachable()?;
        if self.hang_queries.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let sql = sql.trim();
        self.query_log.lock().push(sql.to_string());
        if self.rejected.lock().iter().any(|needle| sql.contains(needle.as_str())) {
            return Err(EngineError::query("statement rejected"));
        }
        if let Some(results) = self.responses.lock().get(sql) {
            return Ok(results.clone());
        }
        Ok(sql
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|statement| self.run_statement(statement, vars))
            .collect())
    }

    async fn select(&self, resource: &Resource) -> EngineResult<Value> {
        self.record("select");
        self.check_reachable()?;
        Ok(self.target_records(resource, |rows, record| match record {
            Some(rid) => rows
                .iter()
                .find(|row| key_of(row) == Some(rid.id.as_str()))
                .cloned()
                .unwrap_or(Value::Null),
            None => Value::Array(rows.clone()),
        }))
    }

    async fn create(&self, resource: &Resource, data: Option<Value>) -> EngineResult<Value> {
        self.record("create");
        self.check_reachable()?;
        let key = match resource.record() {
            Some(rid) => rid.id.clone(),
            None => format!("gen{}", self.next_live.fetch_add(1, Ordering::SeqCst)),
        };
        let row = with_key(resource.table(), &key, data.unwrap_or_else(Value::empty_object));
        Ok(self.target_records(resource, |rows, _| {
            rows.push(row.clone());
            row.clone()
        }))
    }

    async fn update(&self, resource: &Resource, data: Option<Value>) -> EngineResult<Value> {
        self.record("update");
        self.check_reachable()?;
        let table = resource.table().to_string();
        let data = data.unwrap_or_else(Value::empty_object);
        Ok(self.target_records(resource, |rows, record| {
            let mut changed = Vec::new();
            for row in rows.iter_mut() {
                let key = key_of(row).map(str::to_string);
                if let Some(key) = key {
                    if record.map_or(true, |rid| rid.id == key) {
                        *row = with_key(&table, &key, data.clone());
                        changed.push(row.clone());
                    }
                }
            }
            single_or_all(record, changed)
        }))
    }

    async fn merge(&self, resource: &Resource, data: Value) -> EngineResult<Value> {
        self.record("merge");
        self.check_reachable()?;
        Ok(self.target_records(resource, |rows, record| {
            let mut changed = Vec::new();
            for row in rows.iter_mut() {
                if record.map_or(true, |rid| key_of(row) == Some(rid.id.as_str())) {
                    row.merge(&data);
                    changed.push(row.clone());
                }
            }
            single_or_all(record, changed)
        }))
    }

    async fn delete(&self, resource: &Resource) -> EngineResult<Value> {
        self.record("delete");
        self.check_reachable()?;
        Ok(self.target_records(resource, |rows, record| {
            let (removed, kept): (Vec<_>, Vec<_>) = rows
                .drain(..)
                .partition(|row| record.map_or(true, |rid| key_of(row) == Some(rid.id.as_str())));
            *rows = kept;
            single_or_all(record, removed)
        }))
    }

    async fn live(&self, sql: &str, _vars: &Value) -> EngineResult<String> {
        self.record("live");
        self.check_reachable()?;
        if self.fail_live.load(Ordering::SeqCst) {
            return Err(EngineError::query("live query rejected"));
        }
        let scripted = self.live_ids.lock().get(sql).cloned();
        let id = if let Some(id) = scripted {
            id
        } else if self.stable_live_ids.load(Ordering::SeqCst) {
            let mut stable = self.stable_ids.lock();
            let next = stable.len() + 1;
            stable
                .entry(sql.to_string())
                .or_insert_with(|| format!("live-{next}"))
                .clone()
        } else {
            format!("live-{}", self.next_live.fetch_add(1, Ordering::SeqCst))
        };
        self.live_feeds.lock().insert(id.clone(), sql.to_string());
        Ok(id)
    }

    async fn kill(&self, live_id: &str) -> EngineResult<()> {
        self.record("kill");
        self.check_reachable()?;
        self.live_feeds.lock().remove(live_id);
        self.kills.lock().push(live_id.to_string());
        Ok(())
    }

    async fn close(&self) -> EngineResult<()> {
        self.record("close");
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<RemoteEvent> {
        self.events.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

fn key_of(row: &Value) -> Option<&str> {
    match row.get("id")? {
        Value::Record(rid) => Some(rid.id.as_str()),
        Value::String(s) => Some(s.as_str()),
        _ => None,
    }
}

fn with_key(table: &str, key: &str, mut row: Value) -> Value {
    if row.as_object().is_none() {
        row = Value::empty_object();
    }
    row.insert("id", Value::Record(RecordId::new(table, key)));
    row
}

fn with_record_id(table: &str, row: Value) -> Value {
    match key_of(&row).map(str::to_string) {
        Some(key) => with_key(table, &key, row),
        None => row,
    }
}

fn single_or_all(record: Option<&RecordId>, rows: Vec<Value>) -> Value {
    match record {
        Some(_) => rows.into_iter().next().unwrap_or(Value::Null),
        None => Value::Array(rows),
    }
}

/// Parses `where <field> = $<var>` from the words after the table name.
fn parse_var_filter(words: &[&str]) -> Option<(String, String)> {
    match words {
        ["where", field, "=", var, ..] => {
            let var = var.strip_prefix('$')?;
            Some((field.to_string(), var.to_string()))
        }
        _ => None,
    }
}

fn same_ref(actual: Option<&Value>, expected: &Value) -> bool {
    match (actual, expected) {
        (Some(Value::Record(rid)), Value::String(s)) => rid.id == *s || rid.to_string() == *s,
        (Some(actual), expected) => actual == expected,
        (None, _) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, name: &str) -> Value {
        Value::object([("id", Value::from(id)), ("name", Value::from(name))])
    }

    #[tokio::test]
    async fn calls_fail_until_connected() {
        let mock = MockRemote::new();
        assert!(mock.query("RETURN true", &Value::Null).await.is_err());
        mock.connect("mem://").await.unwrap();
        let results = mock.query("RETURN true", &Value::Null).await.unwrap();
        assert_eq!(results, vec![Value::Bool(true)]);
        assert_eq!(mock.calls("query"), 2);
    }

    #[tokio::test]
    async fn scripted_connect_failures() {
        let mock = MockRemote::new();
        mock.fail_connects(2);
        assert!(mock.connect("mem://").await.is_err());
        assert!(mock.connect("mem://").await.is_err());
        assert!(mock.connect("mem://").await.is_ok());
        assert!(mock.is_connected());
    }

    #[tokio::test]
    async fn select_statements_serve_table_rows() {
        let mock = MockRemote::new();
        mock.connect("mem://").await.unwrap();
        mock.set_table("case", vec![row("c1", "Alpha"), row("c2", "Beta")]);
        mock.set_auth_user(Value::object([("id", Value::from("user:u1"))]));

        let results = mock
            .query("RETURN $auth; SELECT * FROM case", &Value::Null)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].as_array().unwrap().len(), 2);
        assert_eq!(mock.queries_matching("FROM case"), 1);
    }

    #[tokio::test]
    async fn var_filter_matches_record_references() {
        let mock = MockRemote::new();
        mock.connect("mem://").await.unwrap();
        mock.set_table(
            "claim",
            vec![
                Value::object([
                    ("id", Value::from("k1")),
                    ("case", Value::Record(RecordId::new("case", "c1"))),
                ]),
                Value::object([
                    ("id", Value::from("k2")),
                    ("case", Value::Record(RecordId::new("case", "c2"))),
                ]),
            ],
        );
        let vars = Value::object([("case", Value::from("c1"))]);
        let results = mock
            .query("SELECT * FROM claim WHERE case = $case", &vars)
            .await
            .unwrap();
        assert_eq!(results[0].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn crud_round_trip() {
        let mock = MockRemote::new();
        mock.connect("mem://").await.unwrap();
        let rid = Resource::Record(RecordId::new("case", "c1"));

        mock.create(&rid, Some(Value::object([("name", Value::from("A"))])))
            .await
            .unwrap();
        let merged = mock
            .merge(&rid, Value::object([("status", Value::from("open"))]))
            .await
            .unwrap();
        assert_eq!(merged.get("name"), Some(&Value::from("A")));
        assert_eq!(merged.get("status"), Some(&Value::from("open")));

        mock.delete(&rid).await.unwrap();
        assert_eq!(mock.select(&rid).await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn live_ids_and_kills() {
        let mock = MockRemote::new();
        mock.connect("mem://").await.unwrap();
        let a = mock.live("LIVE SELECT * FROM case", &Value::Null).await.unwrap();
        let b = mock.live("LIVE SELECT * FROM case", &Value::Null).await.unwrap();
        assert_ne!(a, b);

        mock.set_stable_live_ids(true);
        let c = mock.live("LIVE SELECT * FROM note", &Value::Null).await.unwrap();
        let d = mock.live("LIVE SELECT * FROM note", &Value::Null).await.unwrap();
        assert_eq!(c, d);

        mock.kill(&a).await.unwrap();
        assert_eq!(mock.kills(), vec![a]);
    }

    #[tokio::test]
    async fn rejected_queries_fail_as_query_errors() {
        let mock = MockRemote::new();
        mock.connect("mem://").await.unwrap();
        mock.reject_queries_containing("case:bad");
        let err = mock
            .query("UPDATE case:bad SET x = 1", &Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Query);
        assert!(mock.query("UPDATE case:ok SET x = 1", &Value::Null).await.is_ok());
    }

    #[tokio::test]
    async fn drop_connection_emits_event() {
        let mock = MockRemote::new();
        mock.connect("mem://").await.unwrap();
        let mut events = mock.subscribe_events();
        mock.drop_connection("reset by peer");
        assert!(!mock.is_connected());
        assert_eq!(
            events.recv().await.unwrap(),
            RemoteEvent::Disconnected {
                reason: "reset by peer".into()
            }
        );
    }
}
