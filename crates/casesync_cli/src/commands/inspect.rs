//! Inspect command implementation.

use casesync_protocol::Value;
use casesync_store::{LocalStore, StoreConfig};
use serde::Serialize;
use std::path::Path;

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store path.
    pub path: String,
    /// Log size in bytes.
    pub log_bytes: u64,
    /// Frames in the log.
    pub frames: u64,
    /// Frames superseded by later writes.
    pub garbage_frames: u64,
    /// Number of live records.
    pub records: usize,
    /// Record count per table.
    pub tables: Vec<TableStats>,
}

/// Statistics for a single table.
#[derive(Debug, Serialize)]
pub struct TableStats {
    /// Table name.
    pub name: String,
    /// Number of records.
    pub records: usize,
}

/// Runs the inspect command.
pub fn run(path: &Path, table: Option<&str>, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No store found at {:?}", path).into());
    }
    let store = LocalStore::open_dir(path, StoreConfig::default())?;

    if let Some(table) = table {
        let records = Value::Array(store.select_all(table));
        println!("{}", serde_json::to_string_pretty(&records.to_json())?);
        return Ok(());
    }

    let result = summarize(&store, path);
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }
    Ok(())
}

fn summarize(store: &LocalStore, path: &Path) -> InspectResult {
    let stats = store.stats();
    InspectResult {
        path: path.display().to_string(),
        log_bytes: stats.log_bytes,
        frames: stats.frames,
        garbage_frames: stats.garbage_frames,
        records: stats.records,
        tables: store
            .tables()
            .into_iter()
            .map(|(name, records)| TableStats { name, records })
            .collect(),
    }
}

fn print_text_output(result: &InspectResult) {
    println!("Store: {}", result.path);
    println!();
    println!("Log:");
    println!("  Size:          {} bytes", result.log_bytes);
    println!("  Frames:        {}", result.frames);
    println!("  Garbage:       {}", result.garbage_frames);
    println!();
    println!("Tables ({} records):", result.records);
    if result.tables.is_empty() {
        println!("  (none)");
    }
    for table in &result.tables {
        println!("  {:<28} {}", table.name, table.records);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn summary_lists_tables() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open_dir(dir.path(), StoreConfig::default()).unwrap();
        store
            .create("_token", Some("current"), Value::object([("access_token", Value::from("t"))]))
            .unwrap();
        store.create("note", None, Value::empty_object()).unwrap();
        store.create("note", None, Value::empty_object()).unwrap();

        let result = summarize(&store, dir.path());
        assert_eq!(result.records, 3);
        let notes = result.tables.iter().find(|t| t.name == "note").unwrap();
        assert_eq!(notes.records, 2);
        assert!(result.log_bytes > 0);
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(run(&dir.path().join("absent"), None, "text").is_err());
    }
}
