//! Compact command implementation.

use casesync_store::{CompactionReport, LocalStore, StoreConfig};
use std::path::Path;

/// Runs the compact command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No store found at {:?}", path).into());
    }
    println!("Compacting store at {:?}", path);
    println!();

    let store = LocalStore::open_dir(path, StoreConfig::default())?;
    let stats = store.stats();
    println!("  Frames:      {}", stats.frames);
    println!("  Garbage:     {}", stats.garbage_frames);

    let report = store.compact()?;
    store.sync()?;
    print_report(&report);
    println!("✓ Compaction complete");
    Ok(())
}

fn print_report(report: &CompactionReport) {
    let saved = report.before_bytes.saturating_sub(report.after_bytes);
    println!();
    println!("  Size before: {} bytes", report.before_bytes);
    println!("  Size after:  {} bytes", report.after_bytes);
    println!(
        "  Space saved: {} bytes ({:.1}%)",
        saved,
        if report.before_bytes > 0 {
            (saved as f64 / report.before_bytes as f64) * 100.0
        } else {
            0.0
        }
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use casesync_protocol::Value;
    use tempfile::tempdir;

    #[test]
    fn compaction_shrinks_rewritten_log() {
        let dir = tempdir().unwrap();
        {
            let store = LocalStore::open_dir(dir.path(), StoreConfig::default()).unwrap();
            for i in 0..20i64 {
                store
                    .update("counter", "one", Value::object([("n", Value::from(i))]))
                    .unwrap();
            }
        }
        run(dir.path()).unwrap();

        let store = LocalStore::open_dir(dir.path(), StoreConfig::default()).unwrap();
        assert_eq!(store.len("counter"), 1);
        assert_eq!(store.stats().garbage_frames, 0);
    }
}
