//! Inspect command implementation.

use super::open_existing;
use chrono::DateTime;
use convsync_core::{LocalStore, MetaKey, StoreStats};
use serde::Serialize;
use std::path::Path;

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store path.
    pub path: String,
    /// Log size in bytes.
    pub log_bytes: u64,
    /// Sequence number of the last commit.
    pub last_sequence: u64,
    /// Stored conversations.
    pub conversations: usize,
    /// Stored messages.
    pub messages: usize,
    /// Stored artifacts.
    pub artifacts: usize,
    /// Pending records per kind.
    pub pending: PendingSummary,
    /// Records carrying a marker.
    pub marker_count: usize,
    /// End of the last clean drain cycle (RFC 3339).
    pub last_full_sync: Option<String>,
    /// Cursor of the remote change feed.
    pub server_cursor: Option<i64>,
    /// Marker details (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub markers: Option<Vec<MarkerSummary>>,
}

/// Pending counts.
#[derive(Debug, Serialize)]
pub struct PendingSummary {
    /// Pending conversations.
    pub conversations: u64,
    /// Pending messages.
    pub messages: u64,
    /// Pending artifacts.
    pub artifacts: u64,
}

/// One marker.
#[derive(Debug, Serialize)]
pub struct MarkerSummary {
    /// Record key as `kind:id`.
    pub key: String,
    /// Marker kind.
    pub kind: String,
    /// Reason.
    pub reason: String,
    /// Detection time (RFC 3339).
    pub detected_at: String,
}

/// Runs the inspect command.
pub fn run(path: &Path, show_markers: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_existing(path)?;
    let result = inspect(&store, path, show_markers)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }
    Ok(())
}

/// Collects the inspection result of an open store.
pub fn inspect(
    store: &LocalStore,
    path: &Path,
    show_markers: bool,
) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let StoreStats {
        conversations,
        messages,
        artifacts,
        pending,
        markers,
        log_bytes,
        last_sequence,
    } = store.stats()?;

    let marker_details = show_markers.then(|| {
        store
            .markers()
            .into_iter()
            .map(|(key, marker)| MarkerSummary {
                key: key.to_string(),
                kind: format!("{:?}", marker.kind),
                reason: marker.reason,
                detected_at: marker.detected_at.to_rfc3339(),
            })
            .collect()
    });

    Ok(InspectResult {
        path: path.display().to_string(),
        log_bytes,
        last_sequence: last_sequence.as_u64(),
        conversations,
        messages,
        artifacts,
        pending: PendingSummary {
            conversations: pending.conversations,
            messages: pending.messages,
            artifacts: pending.artifacts,
        },
        marker_count: markers,
        last_full_sync: store
            .meta(MetaKey::LastFullSync)
            .and_then(DateTime::from_timestamp_millis)
            .map(|at| at.to_rfc3339()),
        server_cursor: store.meta(MetaKey::ServerCursor),
        markers: marker_details,
    })
}

fn print_text_output(result: &InspectResult) {
    println!("convsync store: {}", result.path);
    println!();
    println!("Log:");
    println!("  Size:           {} bytes", result.log_bytes);
    println!("  Last sequence:  {}", result.last_sequence);
    println!();
    println!("Records:          stored / pending");
    println!(
        "  Conversations:  {} / {}",
        result.conversations, result.pending.conversations
    );
    println!("  Messages:       {} / {}", result.messages, result.pending.messages);
    println!("  Artifacts:      {} / {}", result.artifacts, result.pending.artifacts);
    println!();
    println!("Sync:");
    println!(
        "  Last full sync: {}",
        result.last_full_sync.as_deref().unwrap_or("never")
    );
    match result.server_cursor {
        Some(cursor) => println!("  Server cursor:  {cursor}"),
        None => println!("  Server cursor:  none"),
    }
    println!("  Markers:        {}", result.marker_count);

    if let Some(markers) = &result.markers {
        for marker in markers {
            println!(
                "    {} [{}] {} ({})",
                marker.key, marker.kind, marker.reason, marker.detected_at
            );
        }
    }
}
