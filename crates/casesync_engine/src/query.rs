//! Query descriptors and table-name extraction.
//!
//! The engine treats query text as opaque. A [`TableExtractor`] turns it
//! into a [`QueryDescriptor`] naming the tables each statement touches and
//! whether the query contains an auth probe. A caller may also supply the
//! descriptor directly.
//!
//! Extraction is best effort: a missed table only disables caching for
//! that query.

use crate::config::TableCatalog;
use serde::{Deserialize, Serialize};

/// Kind of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatementKind {
    /// `SELECT`.
    Select,
    /// `INSERT` or `CREATE`.
    Insert,
    /// `UPDATE`.
    Update,
    /// `DELETE`.
    Delete,
    /// Anything else, including probes.
    #[default]
    Other,
}

impl StatementKind {
    /// Returns true for statements that write.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            StatementKind::Insert | StatementKind::Update | StatementKind::Delete
        )
    }
}

/// One statement of a query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatementInfo {
    /// Statement kind.
    pub kind: StatementKind,
    /// Tables referenced by the statement.
    pub tables: Vec<String>,
    /// The statement is an auth probe (`RETURN $auth`).
    pub auth_probe: bool,
    /// The select narrows or reshapes its rows: a filtering, ordering or
    /// grouping clause, or a projection other than `*`.
    pub filtered: bool,
    /// Personal-data component this statement yields, if any.
    pub component: Option<String>,
}

impl StatementInfo {
    /// A plain select of one table.
    pub fn select(table: impl Into<String>) -> Self {
        Self {
            kind: StatementKind::Select,
            tables: vec![table.into()],
            ..Self::default()
        }
    }

    /// An auth probe.
    pub fn auth_probe() -> Self {
        Self {
            auth_probe: true,
            ..Self::default()
        }
    }
}

/// Structured description of a query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryDescriptor {
    /// Statements in order.
    pub statements: Vec<StatementInfo>,
    /// Every referenced table, deduplicated, in first-seen order.
    pub tables: Vec<String>,
    /// The query contains an auth probe.
    pub needs_auth_probe: bool,
}

/// A query the router may answer from a cached table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheTarget {
    /// Table to read.
    pub table: String,
    /// Index of the data statement among the statements.
    pub data_index: usize,
    /// Index of the auth probe statement, if any.
    pub probe_index: Option<usize>,
    /// Number of statements (result slots).
    pub result_len: usize,
}

impl QueryDescriptor {
    /// Builds a descriptor from statements.
    pub fn from_statements(statements: Vec<StatementInfo>) -> Self {
        let mut tables: Vec<String> = Vec::new();
        for table in statements.iter().flat_map(|s| s.tables.iter()) {
            if !tables.contains(table) {
                tables.push(table.clone());
            }
        }
        let needs_auth_probe = statements.iter().any(|s| s.auth_probe);
        Self {
            statements,
            tables,
            needs_auth_probe,
        }
    }

    /// Fills `tables` and `needs_auth_probe` from the statements when a
    /// caller supplied only statements.
    pub fn normalized(self) -> Self {
        if self.statements.is_empty() {
            return self;
        }
        let needs_auth_probe = self.needs_auth_probe;
        let mut normalized = Self::from_statements(self.statements);
        normalized.needs_auth_probe |= needs_auth_probe;
        normalized
    }

    /// Returns the data statements (everything but auth probes).
    pub fn data_statements(&self) -> impl Iterator<Item = (usize, &StatementInfo)> {
        self.statements
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.auth_probe)
    }

    /// Returns true if any statement writes.
    pub fn is_write(&self) -> bool {
        self.statements.iter().any(|s| s.kind.is_write())
    }

    /// Returns the tables written by the query.
    pub fn written_tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = Vec::new();
        for statement in self.statements.iter().filter(|s| s.kind.is_write()) {
            for table in &statement.tables {
                if !tables.contains(table) {
                    tables.push(table.clone());
                }
            }
        }
        tables
    }

    /// Returns the cache target if the query is one unfiltered select of a
    /// single auto-sync table, optionally paired with an auth probe.
    pub fn cache_target(&self, catalog: &TableCatalog) -> Option<CacheTarget> {
        let data: Vec<_> = self.data_statements().collect();
        let [(data_index, statement)] = data.as_slice() else {
            return None;
        };
        if statement.kind != StatementKind::Select
            || statement.filtered
            || statement.component.is_some()
            || statement.tables.len() != 1
        {
            return None;
        }
        let table = &statement.tables[0];
        if !catalog.is_auto_sync(table) {
            return None;
        }
        Some(CacheTarget {
            table: table.clone(),
            data_index: *data_index,
            probe_index: self.statements.iter().position(|s| s.auth_probe),
            result_len: self.statements.len(),
        })
    }

    /// Returns true for a personal-data query: an auth probe combined with
    /// permission, menu or role statements.
    pub fn is_personal_data(&self) -> bool {
        self.needs_auth_probe && self.statements.iter().any(|s| s.component.is_some())
    }
}

/// Produces a [`QueryDescriptor`] from query text.
pub trait TableExtractor: Send + Sync {
    /// Describes `sql`.
    fn describe(&self, sql: &str) -> QueryDescriptor;
}

/// Keyword-based extractor for the four basic statement shapes.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicExtractor;

/// Table fragments that mark a personal-data component, in match order.
const COMPONENTS: &[(&str, &str)] = &[
    ("case_role", "case_roles"),
    ("global_role", "global_roles"),
    ("menu", "menus"),
    ("operation", "operations"),
    ("permission", "operations"),
];

const CLAUSE_KEYWORDS: &[&str] = &[
    "where", "limit", "start", "order", "group", "split", "fetch", "timeout", "parallel",
    "explain", "with", "omit",
];

const FILTER_KEYWORDS: &[&str] = &[
    "where", "limit", "start", "order", "group", "split", "fetch", "omit",
];

impl TableExtractor for HeuristicExtractor {
    fn describe(&self, sql: &str) -> QueryDescriptor {
        QueryDescriptor::from_statements(
            split_statements(sql)
                .iter()
                .map(|s| describe_statement(s))
                .collect(),
        )
    }
}

/// Splits on `;` outside quotes. Empty statements are dropped.
fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in sql.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => {
                quote = None;
                current.push(c);
            }
            (Some(_), c) => current.push(c),
            (None, '\'' | '"' | '`') => {
                quote = Some(c);
                current.push(c);
            }
            (None, ';') => {
                statements.push(std::mem::take(&mut current));
            }
            (None, c) => current.push(c),
        }
    }
    statements.push(current);
    statements
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn tokens(statement: &str) -> Vec<String> {
    statement
        .split(|c: char| c.is_whitespace() || c == ',' || c == '(' || c == ')')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Strips a record key (`case:c1` becomes `case`) and quoting.
fn table_name(token: &str) -> Option<String> {
    let name = token
        .trim_matches(|c| c == '`' || c == '"' || c == '\'')
        .split(':')
        .next()?
        .to_ascii_lowercase();
    let valid = !name.is_empty()
        && !name.starts_with('$')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    valid.then_some(name)
}

fn describe_statement(statement: &str) -> StatementInfo {
    let words = tokens(statement);
    let lower: Vec<String> = words.iter().map(|w| w.to_ascii_lowercase()).collect();

    if lower.len() == 2 && lower[0] == "return" && lower[1] == "$auth" {
        return StatementInfo::auth_probe();
    }

    let (kind, tables) = match lower.first().map(String::as_str) {
        Some("select") => (StatementKind::Select, tables_after(&lower, "from")),
        Some("insert") => (StatementKind::Insert, tables_after(&lower, "into")),
        Some("create") => (StatementKind::Insert, tables_at(&lower, 1)),
        Some("update") => (StatementKind::Update, tables_at(&lower, 1)),
        Some("delete") => {
            let start = if lower.get(1).map(String::as_str) == Some("from") { 2 } else { 1 };
            (StatementKind::Delete, tables_at(&lower, start))
        }
        _ => (StatementKind::Other, Vec::new()),
    };

    let filtered = kind == StatementKind::Select
        && (!selects_everything(&lower)
            || targets_record(&lower)
            || lower.iter().any(|w| FILTER_KEYWORDS.contains(&w.as_str())));
    let component = (kind == StatementKind::Select)
        .then(|| component_for(&tables))
        .flatten();

    StatementInfo {
        kind,
        tables,
        auth_probe: false,
        filtered,
        component,
    }
}

/// True when the projection between `SELECT` and `FROM` is exactly `*`.
fn selects_everything(words: &[String]) -> bool {
    let projection: Vec<&str> = words
        .iter()
        .skip(1)
        .take_while(|w| *w != "from")
        .map(String::as_str)
        .collect();
    projection == ["*"]
}

/// True when a `FROM` target names a single record (`case:c1`).
fn targets_record(words: &[String]) -> bool {
    words
        .iter()
        .skip_while(|w| *w != "from")
        .skip(1)
        .take_while(|w| !CLAUSE_KEYWORDS.contains(&w.as_str()))
        .any(|w| w.contains(':'))
}

/// Tables listed after `keyword`, up to the next clause keyword.
fn tables_after(words: &[String], keyword: &str) -> Vec<String> {
    match words.iter().position(|w| w == keyword) {
        Some(at) => tables_at(words, at + 1),
        None => Vec::new(),
    }
}

fn tables_at(words: &[String], start: usize) -> Vec<String> {
    let mut tables = Vec::new();
    for word in words.iter().skip(start) {
        if word == "only" {
            continue;
        }
        if CLAUSE_KEYWORDS.contains(&word.as_str())
            || matches!(word.as_str(), "set" | "content" | "merge" | "patch" | "return")
            || word.starts_with(['{', '['])
        {
            break;
        }
        if let Some(table) = table_name(word) {
            if !tables.contains(&table) {
                tables.push(table);
            }
        }
    }
    tables
}

fn component_for(tables: &[String]) -> Option<String> {
    COMPONENTS
        .iter()
        .find(|(fragment, _)| tables.iter().any(|t| t.contains(fragment)))
        .map(|(_, component)| component.to_string())
}
