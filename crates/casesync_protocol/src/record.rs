//! Record references.

use crate::error::{ProtocolError, ProtocolResult};
use crate::value::Value;
use std::fmt;
use std::str::FromStr;

/// A reference to a single record: a table name plus a key within it.
///
/// Displays and parses as `table:key`. Keys wrapped in `⟨⟩` or backticks
/// (as the remote service prints complex keys) are unwrapped on parse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId {
    /// Table name.
    pub tb: String,
    /// Key within the table.
    pub id: String,
}

impl RecordId {
    /// Creates a new record id.
    pub fn new(tb: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            tb: tb.into(),
            id: id.into(),
        }
    }

    /// Parses `table:key`, returning `None` when there is no separator.
    pub fn parse(text: &str) -> Option<Self> {
        let (tb, id) = text.split_once(':')?;
        if tb.is_empty() || id.is_empty() || !is_table_name(tb) {
            return None;
        }
        let bracketed = id
            .strip_prefix('⟨')
            .and_then(|s| s.strip_suffix('⟩'))
            .or_else(|| id.strip_prefix('`').and_then(|s| s.strip_suffix('`')));
        match bracketed {
            Some(inner) if !inner.is_empty() => Some(Self::new(tb, inner)),
            Some(_) => None,
            None if is_plain_key(id) => Some(Self::new(tb, id)),
            None => None,
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tb, self.id)
    }
}

impl FromStr for RecordId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| ProtocolError::InvalidRecordId(s.to_string()))
    }
}

/// Returns true if `name` looks like a table identifier.
pub(crate) fn is_table_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Unbracketed keys are limited to identifier characters and dashes.
fn is_plain_key(key: &str) -> bool {
    key.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// The target of a CRUD request: a whole table or one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    /// Every record in a table.
    Table(String),
    /// A single record.
    Record(RecordId),
}

impl Resource {
    /// Returns the table this resource belongs to.
    pub fn table(&self) -> &str {
        match self {
            Resource::Table(tb) => tb,
            Resource::Record(rid) => &rid.tb,
        }
    }

    /// Returns the record id if this resource names a single record.
    pub fn record(&self) -> Option<&RecordId> {
        match self {
            Resource::Table(_) => None,
            Resource::Record(rid) => Some(rid),
        }
    }

    /// Decodes a resource from a payload value.
    ///
    /// Accepts a table name (`"case"`), a `table:key` string, or a tagged
    /// record reference.
    pub fn from_value(value: &Value) -> ProtocolResult<Self> {
        match value {
            Value::Record(rid) => Ok(Resource::Record(rid.clone())),
            Value::String(text) => {
                if let Some(rid) = RecordId::parse(text) {
                    Ok(Resource::Record(rid))
                } else if is_table_name(text) {
                    Ok(Resource::Table(text.clone()))
                } else {
                    Err(ProtocolError::invalid(format!("invalid resource: {text}")))
                }
            }
            other => Err(ProtocolError::invalid(format!(
                "resource must be a table name or record id, got {}",
                other.kind()
            ))),
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Table(tb) => f.write_str(tb),
            Resource::Record(rid) => rid.fmt(f),
        }
    }
}
