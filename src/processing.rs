//! Line-batch processing of downloaded blobs.
//!
//! A blob of the supported kind is read as line-delimited JSON (gzip-decoded
//! when announced), each line is parsed and logged, and the raw line is
//! persisted as the next artifact of the message's output batch. The batch
//! is sealed with a `metadata.json` holding the notification.

use crate::config::{PumpConfig, StorageConfig};
use crate::error::ProcessingError;
use crate::types::{BlobNotification, TestData};
use crate::utils::{OutputBatch, eq_normalized};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// Turns a downloaded blob into record artifacts
#[derive(Clone, Debug)]
pub struct LineBatchProcessor {
    supported_blob_type: String,
    supported_content_type: String,
    output_root: PathBuf,
}

impl LineBatchProcessor {
    /// Create a processor for one blob type
    pub fn new(
        supported_blob_type: impl Into<String>,
        supported_content_type: impl Into<String>,
        output_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            supported_blob_type: supported_blob_type.into(),
            supported_content_type: supported_content_type.into(),
            output_root: output_root.into(),
        }
    }

    /// Create a processor from the pump and storage sections
    pub fn from_config(pump: &PumpConfig, storage: &StorageConfig) -> Self {
        Self::new(
            pump.supported_blob_type.clone(),
            pump.supported_content_type.clone(),
            storage.output_dir.clone(),
        )
    }

    /// Whether `notification` is of the kind this processor handles
    pub fn accepts(&self, notification: &BlobNotification) -> bool {
        eq_normalized(&notification.blob_type, &self.supported_blob_type)
    }

    /// Process the blob in `local_file`, returning the number of records written
    ///
    /// Other blob types are skipped and report zero records. The supported
    /// type with a foreign content type fails before any folder is created.
    /// `stop` is checked before every line; the blocking write has ended by
    /// the time this returns.
    pub async fn process(
        &self,
        message_id: &str,
        notification: &BlobNotification,
        local_file: &Path,
        stop: &CancellationToken,
    ) -> Result<usize, ProcessingError> {
        if !self.accepts(notification) {
            tracing::debug!(
                message_id = %message_id,
                blob_type = %notification.blob_type,
                "Skipping unsupported blob type"
            );
            return Ok(0);
        }
        if !eq_normalized(&notification.content_type, &self.supported_content_type) {
            return Err(ProcessingError::UnsupportedContentType {
                content_type: notification.content_type.clone(),
            });
        }

        let root = self.output_root.clone();
        let message_id = message_id.to_string();
        let notification = notification.clone();
        let local_file = local_file.to_path_buf();
        let stop = stop.clone();
        tokio::task::spawn_blocking(move || {
            write_batch(&root, &message_id, &notification, &local_file, &stop)
        })
        .await
        .map_err(|e| ProcessingError::Task(e.to_string()))?
    }
}

fn write_batch(
    root: &Path,
    message_id: &str,
    notification: &BlobNotification,
    local_file: &Path,
    stop: &CancellationToken,
) -> Result<usize, ProcessingError> {
    let file = File::open(local_file).map_err(|source| ProcessingError::Io {
        path: local_file.to_path_buf(),
        source,
    })?;
    let body: Box<dyn Read> = if notification.is_gzip() {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    let mut batch: Option<OutputBatch> = None;
    let mut written = 0usize;
    for (index, line) in BufReader::new(body).lines().enumerate() {
        if stop.is_cancelled() {
            tracing::warn!(
                message_id = %message_id,
                records = written,
                "Processing stopped before the end of the blob"
            );
            return Err(ProcessingError::Interrupted { written });
        }
        let line = line.map_err(ProcessingError::Decode)?;
        if line.trim().is_empty() {
            tracing::debug!(message_id = %message_id, line = index, "Skipping blank line");
            continue;
        }

        let record: TestData = serde_json::from_str(&line)
            .map_err(|source| ProcessingError::InvalidRecord { index, source })?;
        tracing::info!(
            message_id = %message_id,
            id = record.id,
            name = record.name.as_deref().unwrap_or_default(),
            subitems = record.subitems.as_ref().map_or(0, Vec::len),
            "Imported record"
        );

        if batch.is_none() {
            batch = Some(open_batch(root, message_id)?);
        }
        if let Some(batch) = &batch {
            batch
                .write_record(written, &line)
                .map_err(|source| io_error(batch, source))?;
        }
        written += 1;
    }

    let batch = match batch {
        Some(batch) => batch,
        None => open_batch(root, message_id)?,
    };
    batch
        .write_metadata(notification)
        .map_err(|source| io_error(&batch, source))?;

    tracing::info!(
        message_id = %message_id,
        records = written,
        folder = ?batch.folder(),
        "Blob processed"
    );
    Ok(written)
}

fn open_batch(root: &Path, message_id: &str) -> Result<OutputBatch, ProcessingError> {
    OutputBatch::create(root, message_id).map_err(|source| ProcessingError::Io {
        path: root.join(message_id),
        source,
    })
}

fn io_error(batch: &OutputBatch, source: std::io::Error) -> ProcessingError {
    ProcessingError::Io {
        path: batch.folder().map(Path::to_path_buf).unwrap_or_default(),
        source,
    }
}
