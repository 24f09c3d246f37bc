//! Compact command implementation.

use super::open_existing;
use convsync_core::CompactionReport;
use std::path::Path;

/// Runs the compact command.
pub fn run(path: &Path, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_existing(path)?;
    let stats = store.stats()?;
    let live = stats.conversations + stats.messages + stats.artifacts;

    if dry_run {
        println!("Dry run - no changes will be made");
        println!("  Log size:      {} bytes", stats.log_bytes);
        println!("  Live records:  {live}");
        println!("  Markers:       {}", stats.markers);
        return Ok(());
    }

    let report = store.compact()?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &CompactionReport) {
    let saved = report.bytes_before.saturating_sub(report.bytes_after);
    let percent = if report.bytes_before > 0 {
        saved as f64 * 100.0 / report.bytes_before as f64
    } else {
        0.0
    };
    println!("Compaction complete");
    println!("  Before:   {} bytes", report.bytes_before);
    println!("  After:    {} bytes", report.bytes_after);
    println!("  Records:  {}", report.records);
    println!("  Saved:    {saved} bytes ({percent:.1}%)");
}

#[cfg(test)]
mod tests {
    use super::*;
    use convsync_core::{LocalStore, StoreConfig};
    use convsync_testkit::sample_conversation;

    #[test]
    fn compacts_a_closed_store() {
        let dir = tempfile::tempdir().unwrap();
        let before = {
            let store = LocalStore::open(dir.path(), StoreConfig::default()).unwrap();
            for round in 0..10 {
                let mut conversation = sample_conversation("c1");
                conversation.title = format!("title {round}");
                store.put(conversation).unwrap();
            }
            store.log_bytes().unwrap()
        };

        run(dir.path(), true).unwrap();
        run(dir.path(), false).unwrap();

        let reopened = open_existing(dir.path()).unwrap();
        assert!(reopened.log_bytes().unwrap() < before);
        assert_eq!(reopened.get_conversation("c1").unwrap().title, "title 9");
        assert_eq!(reopened.pending_counts().conversations, 1);
    }

    #[test]
    fn missing_store_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(run(&dir.path().join("absent"), false).is_err());
    }
}
