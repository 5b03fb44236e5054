//! Incremental updates against cached rows.
//!
//! [`resolve`] decides what one insert/update/delete does to a local row;
//! the strategy is chosen per call.

use crate::error::{EngineError, EngineResult};
use casesync_protocol::{ChangeAction, IncrementalPayload, RecordId, Value};
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// How a conflicting incoming row is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStrategy {
    /// Keep the local row.
    Local,
    /// Overwrite with the incoming row.
    #[default]
    Remote,
    /// The row with the later `updated_at` wins.
    Timestamp,
}

impl ConflictStrategy {
    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::Local => "local",
            ConflictStrategy::Remote => "remote",
            ConflictStrategy::Timestamp => "timestamp",
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStrategy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(ConflictStrategy::Local),
            "remote" => Ok(ConflictStrategy::Remote),
            "timestamp" => Ok(ConflictStrategy::Timestamp),
            other => Err(EngineError::invalid(format!(
                "unknown conflict strategy: {other}"
            ))),
        }
    }
}

/// One incoming change.
#[derive(Debug, Clone, PartialEq)]
pub struct IncrementalUpdate {
    /// Change kind.
    pub action: ChangeAction,
    /// Key of the changed row.
    pub key: String,
    /// Incoming row data.
    pub data: Value,
}

impl IncrementalUpdate {
    /// Creates an update.
    pub fn new(action: ChangeAction, key: impl Into<String>, data: Value) -> Self {
        Self {
            action,
            key: key.into(),
            data,
        }
    }

    /// Builds an update from a request payload. The key is `recordId` or
    /// the `id` field of the data.
    pub fn from_payload(payload: &IncrementalPayload) -> EngineResult<Self> {
        let key = payload
            .record_id
            .as_deref()
            .map(plain_key)
            .or_else(|| row_key(&payload.data))
            .ok_or_else(|| EngineError::invalid("incremental update has no record id"))?;
        Ok(Self::new(payload.action, key, payload.data.clone()))
    }
}

/// What an update did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateOutcome {
    /// A new row was written.
    Inserted,
    /// A newer row replaced the local one.
    Updated,
    /// The row was removed.
    Deleted,
    /// A conflict left the local row in place.
    KeptLocal,
    /// A conflict replaced the local row.
    Overwritten,
    /// Delete of a row that is not cached.
    NotFound,
}

impl UpdateOutcome {
    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateOutcome::Inserted => "inserted",
            UpdateOutcome::Updated => "updated",
            UpdateOutcome::Deleted => "deleted",
            UpdateOutcome::KeptLocal => "kept_local",
            UpdateOutcome::Overwritten => "overwritten",
            UpdateOutcome::NotFound => "not_found",
        }
    }

    /// Returns true if the local row changed.
    pub fn changed(&self) -> bool {
        matches!(
            self,
            UpdateOutcome::Inserted
                | UpdateOutcome::Updated
                | UpdateOutcome::Deleted
                | UpdateOutcome::Overwritten
        )
    }
}

/// The change to make to the local row.
#[derive(Debug, Clone, PartialEq)]
pub enum RowChange {
    /// Write this row.
    Put(Value),
    /// Remove the row.
    Remove,
    /// Leave the row alone.
    Keep,
}

/// Decides the effect of `update` on `local`.
pub fn resolve(
    local: Option<&Value>,
    update: &IncrementalUpdate,
    strategy: ConflictStrategy,
) -> (UpdateOutcome, RowChange) {
    match (update.action, local) {
        (ChangeAction::Insert | ChangeAction::Update, None) => {
            (UpdateOutcome::Inserted, RowChange::Put(update.data.clone()))
        }
        (ChangeAction::Insert, Some(local)) => conflict(local, &update.data, strategy),
        (ChangeAction::Update, Some(local)) => {
            if version(&update.data) > version(local) {
                (UpdateOutcome::Updated, RowChange::Put(update.data.clone()))
            } else {
                conflict(local, &update.data, strategy)
            }
        }
        (ChangeAction::Delete, Some(_)) => (UpdateOutcome::Deleted, RowChange::Remove),
        (ChangeAction::Delete, None) => (UpdateOutcome::NotFound, RowChange::Keep),
    }
}

/// Applies `update` to a list of rows keyed by their `id` field.
pub fn apply_to_rows(
    rows: &mut Vec<Value>,
    update: &IncrementalUpdate,
    strategy: ConflictStrategy,
) -> UpdateOutcome {
    let position = rows
        .iter()
        .position(|row| row_key(row).as_deref() == Some(update.key.as_str()));
    let (outcome, change) = resolve(position.map(|i| &rows[i]), update, strategy);
    match (change, position) {
        (RowChange::Put(row), Some(i)) => rows[i] = row,
        (RowChange::Put(row), None) => rows.push(row),
        (RowChange::Remove, Some(i)) => {
            rows.remove(i);
        }
        (RowChange::Remove, None) | (RowChange::Keep, _) => {}
    }
    outcome
}

fn conflict(
    local: &Value,
    remote: &Value,
    strategy: ConflictStrategy,
) -> (UpdateOutcome, RowChange) {
    let remote_wins = match strategy {
        ConflictStrategy::Local => false,
        ConflictStrategy::Remote => true,
        ConflictStrategy::Timestamp => {
            updated_at(remote).cmp(&updated_at(local)) == Ordering::Greater
        }
    };
    if remote_wins {
        (UpdateOutcome::Overwritten, RowChange::Put(remote.clone()))
    } else {
        (UpdateOutcome::KeptLocal, RowChange::Keep)
    }
}

fn version(row: &Value) -> i64 {
    row.get("version").and_then(Value::as_i64).unwrap_or(0)
}

/// `updated_at` as Unix millis. Accepts RFC 3339 text or a number.
fn updated_at(row: &Value) -> Option<i64> {
    match row.get("updated_at")? {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|t| t.timestamp_millis()),
        other => other.as_i64(),
    }
}

/// Returns the key of a row from its `id` field.
pub(crate) fn row_key(row: &Value) -> Option<String> {
    match row.get("id")? {
        Value::Record(rid) => Some(rid.id.clone()),
        Value::String(text) => Some(plain_key(text)),
        _ => None,
    }
}

/// `case:c1` becomes `c1`; a plain key is returned unchanged.
pub(crate) fn plain_key(text: &str) -> String {
    RecordId::parse(text).map_or_else(|| text.to_string(), |rid| rid.id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(key: &str, version: i64, updated_at: &str, name: &str) -> Value {
        Value::object([
            ("id", Value::Record(RecordId::new("creditor", key))),
            ("version", Value::from(version)),
            ("updated_at", Value::from(updated_at)),
            ("name", Value::from(name)),
        ])
    }

    fn local_v2() -> Vec<Value> {
        vec![row("k1", 2, "2026-03-01T10:00:00Z", "local")]
    }

    #[test]
    fn older_remote_update_under_each_strategy() {
        let incoming = row("k1", 1, "2026-03-02T10:00:00Z", "remote");
        let update = IncrementalUpdate::new(ChangeAction::Update, "k1", incoming.clone());

        let mut rows = local_v2();
        assert_eq!(
            apply_to_rows(&mut rows, &update, ConflictStrategy::Remote),
            UpdateOutcome::Overwritten
        );
        assert_eq!(rows, vec![incoming.clone()]);

        let mut rows = local_v2();
        assert_eq!(
            apply_to_rows(&mut rows, &update, ConflictStrategy::Local),
            UpdateOutcome::KeptLocal
        );
        assert_eq!(rows, local_v2());

        // Incoming updated_at is later, so it wins.
        let mut rows = local_v2();
        assert_eq!(
            apply_to_rows(&mut rows, &update, ConflictStrategy::Timestamp),
            UpdateOutcome::Overwritten
        );
        assert_eq!(rows, vec![incoming]);

        // Incoming updated_at is earlier, so local stays.
        let stale = row("k1", 1, "2026-02-01T10:00:00Z", "remote");
        let update = IncrementalUpdate::new(ChangeAction::Update, "k1", stale);
        let mut rows = local_v2();
        assert_eq!(
            apply_to_rows(&mut rows, &update, ConflictStrategy::Timestamp),
            UpdateOutcome::KeptLocal
        );
        assert_eq!(rows, local_v2());
    }

    #[test]
    fn newer_version_wins_regardless_of_strategy() {
        let incoming = row("k1", 3, "2020-01-01T00:00:00Z", "remote");
        let update = IncrementalUpdate::new(ChangeAction::Update, "k1", incoming.clone());
        let mut rows = local_v2();
        assert_eq!(
            apply_to_rows(&mut rows, &update, ConflictStrategy::Local),
            UpdateOutcome::Updated
        );
        assert_eq!(rows, vec![incoming]);
    }

    #[test]
    fn update_of_missing_row_inserts() {
        let incoming = row("k9", 1, "2026-03-01T10:00:00Z", "new");
        let update = IncrementalUpdate::new(ChangeAction::Update, "k9", incoming);
        let mut rows = local_v2();
        assert_eq!(
            apply_to_rows(&mut rows, &update, ConflictStrategy::Local),
            UpdateOutcome::Inserted
        );
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn insert_of_existing_row_is_a_conflict() {
        let incoming = row("k1", 5, "2026-03-01T10:00:00Z", "dup");
        let update = IncrementalUpdate::new(ChangeAction::Insert, "k1", incoming);
        let mut rows = local_v2();
        assert_eq!(
            apply_to_rows(&mut rows, &update, ConflictStrategy::Local),
            UpdateOutcome::KeptLocal
        );
    }

    #[test]
    fn delete_removes_or_reports_missing() {
        let update = IncrementalUpdate::new(ChangeAction::Delete, "k1", Value::Null);
        let mut rows = local_v2();
        assert_eq!(
            apply_to_rows(&mut rows, &update, ConflictStrategy::Remote),
            UpdateOutcome::Deleted
        );
        assert!(rows.is_empty());
        assert_eq!(
            apply_to_rows(&mut rows, &update, ConflictStrategy::Remote),
            UpdateOutcome::NotFound
        );
    }

    #[test]
    fn numeric_timestamps_compare() {
        let local = Value::object([("updated_at", Value::from(2_000i64))]);
        let remote = Value::object([("updated_at", Value::from(1_000i64))]);
        let update = IncrementalUpdate::new(ChangeAction::Insert, "k", remote);
        assert_eq!(
            resolve(Some(&local), &update, ConflictStrategy::Timestamp).0,
            UpdateOutcome::KeptLocal
        );
    }

    #[test]
    fn payload_keys() {
        let payload = IncrementalPayload {
            table: "creditor".into(),
            action: ChangeAction::Update,
            data: Value::object([("id", Value::from("creditor:k7"))]),
            record_id: None,
            strategy: None,
            user_id: None,
            case_id: None,
        };
        assert_eq!(IncrementalUpdate::from_payload(&payload).unwrap().key, "k7");

        let missing = IncrementalPayload {
            data: Value::empty_object(),
            ..payload
        };
        assert!(IncrementalUpdate::from_payload(&missing).is_err());
    }

    #[test]
    fn strategies_parse() {
        assert_eq!(
            "Timestamp".parse::<ConflictStrategy>().unwrap(),
            ConflictStrategy::Timestamp
        );
        assert!("newest".parse::<ConflictStrategy>().is_err());
    }
}
