//! In-memory queries over a table.

use casesync_protocol::Value;

/// A simple query: equality filters, one sort key, a row limit.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalQuery {
    /// Table to read.
    pub table: String,
    /// `field = value` conditions, all of which must hold.
    pub filter: Vec<(String, Value)>,
    /// Field to order by.
    pub order_by: Option<String>,
    /// Whether to order descending.
    pub descending: bool,
    /// Maximum number of rows.
    pub limit: Option<usize>,
}

impl LocalQuery {
    /// Creates a query returning every row of a table.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: Vec::new(),
            order_by: None,
            descending: false,
            limit: None,
        }
    }

    /// Adds an equality condition.
    #[must_use]
    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter.push((field.into(), value.into()));
        self
    }

    /// Orders ascending by a field.
    #[must_use]
    pub fn order_by(mut self, field: impl Into<String>) -> Self {
        self.order_by = Some(field.into());
        self
    }

    /// Reverses the ordering.
    #[must_use]
    pub fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    /// Limits the number of rows.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns true if `row` satisfies every condition.
    pub fn matches(&self, row: &Value) -> bool {
        self.filter
            .iter()
            .all(|(field, expected)| row.get(field).is_some_and(|v| field_eq(v, expected)))
    }

    /// Filters, orders and limits rows.
    pub fn apply<'a>(&self, rows: impl IntoIterator<Item = &'a Value>) -> Vec<Value> {
        let mut out: Vec<Value> = rows
            .into_iter()
            .filter(|row| self.matches(row))
            .cloned()
            .collect();

        if let Some(field) = &self.order_by {
            out.sort_by(|a, b| {
                let ord = a
                    .get(field)
                    .unwrap_or(&Value::Null)
                    .compare(b.get(field).unwrap_or(&Value::Null));
                if self.descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }
        if let Some(limit) = self.limit {
            out.truncate(limit);
        }
        out
    }
}

/// Equality that lets a plain key or `table:key` string match a reference.
fn field_eq(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    match (actual, expected) {
        (Value::Record(rid), Value::String(s)) | (Value::String(s), Value::Record(rid)) => {
            rid.id == *s || rid.to_string() == *s
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use casesync_protocol::RecordId;

    fn row(id: &str, status: &str, n: i64) -> Value {
        Value::object([
            ("id", Value::Record(RecordId::new("case", id))),
            ("status", Value::from(status)),
            ("n", Value::from(n)),
        ])
    }

    #[test]
    fn filter_order_limit() {
        let rows = vec![row("a", "open", 3), row("b", "closed", 1), row("c", "open", 2)];
        let result = LocalQuery::new("case")
            .filter("status", "open")
            .order_by("n")
            .descending()
            .limit(1)
            .apply(&rows);
        assert_eq!(result, vec![row("a", "open", 3)]);
    }

    #[test]
    fn string_keys_match_references() {
        let r = row("a", "open", 1);
        assert!(LocalQuery::new("case").filter("id", "a").matches(&r));
        assert!(LocalQuery::new("case").filter("id", "case:a").matches(&r));
        assert!(!LocalQuery::new("case").filter("id", "b").matches(&r));
    }

    #[test]
    fn missing_field_never_matches() {
        let r = row("a", "open", 1);
        assert!(!LocalQuery::new("case").filter("owner", Value::Null).matches(&r));
    }
}
