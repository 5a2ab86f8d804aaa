//! Utility functions for string normalization and local file handling

use crate::types::BlobNotification;
use std::path::{Path, PathBuf};

/// File name of the per-message metadata artifact
pub const METADATA_FILE_NAME: &str = "metadata.json";

/// Canonical form used for every case-insensitive comparison
/// (content type, content encoding, blob type, base-URL prefixes)
///
/// # Examples
///
/// ```
/// use export_subscriber::utils::normalize;
///
/// assert_eq!(normalize("  Application/X-JsonLines "), "application/x-jsonlines");
/// ```
#[must_use]
pub fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Compare two strings after normalization
#[must_use]
pub fn eq_normalized(a: &str, b: &str) -> bool {
    normalize(a) == normalize(b)
}

/// Create a working file for a blob download inside `temp_dir`
///
/// The file is deleted when the returned handle is dropped, so a failed
/// message never leaves its download behind.
pub fn create_working_file(temp_dir: &Path) -> std::io::Result<tempfile::NamedTempFile> {
    tempfile::Builder::new()
        .prefix("blob-")
        .suffix(".download")
        .tempfile_in(temp_dir)
}

/// Name of the artifact holding the record at `index`
#[must_use]
pub fn record_file_name(index: usize) -> String {
    format!("{index:010}.json")
}

/// Output folder for one notification
///
/// When the configured root does not exist the batch is detached: every
/// write succeeds without touching the filesystem. This keeps a
/// misconfigured output path from stopping the pump, at the price of
/// records that are processed but not persisted.
#[derive(Debug)]
pub struct OutputBatch {
    folder: Option<PathBuf>,
}

impl OutputBatch {
    /// Create `<root>/<message_id>` if `root` exists
    pub fn create(root: &Path, message_id: &str) -> std::io::Result<Self> {
        if !root.is_dir() {
            tracing::warn!(
                output_dir = %root.display(),
                message_id = %message_id,
                "Output folder does not exist, records will not be persisted"
            );
            return Ok(Self { folder: None });
        }
        let folder = root.join(message_id);
        std::fs::create_dir_all(&folder)?;
        Ok(Self {
            folder: Some(folder),
        })
    }

    /// Folder the batch writes to, if any
    pub fn folder(&self) -> Option<&Path> {
        self.folder.as_deref()
    }

    /// Persist one raw record line
    pub fn write_record(&self, index: usize, line: &str) -> std::io::Result<()> {
        match &self.folder {
            Some(folder) => std::fs::write(folder.join(record_file_name(index)), line),
            None => Ok(()),
        }
    }

    /// Seal the batch with the serialized notification
    pub fn write_metadata(&self, notification: &BlobNotification) -> std::io::Result<()> {
        let Some(folder) = &self.folder else {
            return Ok(());
        };
        let json = serde_json::to_string(notification)?;
        std::fs::write(folder.join(METADATA_FILE_NAME), json)
    }
}
