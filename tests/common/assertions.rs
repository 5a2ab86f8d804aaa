//! Custom test assertions for integration tests

use export_subscriber::PumpEvent;
use std::path::Path;
use std::time::Duration;
use tokio::sync::broadcast;
use walkdir::WalkDir;

/// Wait for the first event matching `predicate`
///
/// Returns `None` on timeout or when the channel closes.
pub async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<PumpEvent>,
    timeout: Duration,
    mut predicate: F,
) -> Option<PumpEvent>
where
    F: FnMut(&PumpEvent) -> bool,
{
    tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Names of all files below `dir`, sorted
pub fn artifact_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// Assert that `file` holds exactly `expected`
pub fn assert_file_eq(file: &Path, expected: &str) {
    let actual = std::fs::read_to_string(file)
        .unwrap_or_else(|e| panic!("failed to read {}: {e}", file.display()));
    assert_eq!(actual, expected, "content of {}", file.display());
}
