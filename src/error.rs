//! Error types for export-subscriber
//!
//! This module provides the error taxonomy for the pump:
//! - Domain-specific error types (issuer, blob fetch, processing, transport)
//! - An explicit classification ([`ErrorClass`]) that the pump's state machine
//!   consumes to decide between acknowledging, recovering credentials, or
//!   leaving a message to the broker's redelivery

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for export-subscriber operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for export-subscriber
///
/// Each variant carries enough context to log the failure without the
/// original call site.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "issuer.url")
        key: Option<String>,
    },

    /// Credential issuer call failed
    #[error("credential issuer error: {0}")]
    Issuer(#[from] IssuerError),

    /// Blob download failed
    #[error("blob fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Blob body could not be turned into records
    #[error("processing error: {0}")]
    Processing(#[from] ProcessingError),

    /// Messaging transport reported a failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Notification payload could not be deserialized
    #[error("malformed notification: {0}")]
    MalformedNotification(#[source] serde_json::Error),

    /// Subscription connection descriptor could not be parsed
    #[error("invalid connection descriptor: {0}")]
    InvalidDescriptor(String),

    /// Fetch and processing did not finish inside the message lock window
    #[error("message handling exceeded the {seconds}s processing deadline")]
    DeadlineExceeded {
        /// Deadline that was exceeded, in seconds
        seconds: u64,
    },

    /// No credential bundle has been issued yet
    #[error("no credential bundle available")]
    NoCredentials,

    /// Operation cancelled by the shutdown signal
    #[error("operation cancelled")]
    Cancelled,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

/// Errors returned by the credential issuer
#[derive(Debug, Error)]
pub enum IssuerError {
    /// Issuer answered with a non-success status
    #[error("issuer rejected the request with status {status}{hint}")]
    Rejected {
        /// HTTP status code returned by the issuer
        status: u16,
        /// Extra guidance for well-known statuses (empty otherwise)
        hint: &'static str,
    },

    /// Issuer response could not be interpreted
    #[error("invalid issuer response: {0}")]
    InvalidResponse(String),

    /// Request never reached the issuer
    #[error("issuer unreachable: {0}")]
    Unreachable(#[from] reqwest::Error),
}

/// Blob download errors
#[derive(Debug, Error)]
pub enum FetchError {
    /// No issued base URL covers the blob URI
    #[error("unable to find a token for the url '{uri}'")]
    NoMatchingCredential {
        /// Blob URI from the notification
        uri: String,
    },

    /// Storage rejected the token (expired or revoked)
    #[error("storage rejected the access token with status {status}")]
    Unauthorized {
        /// HTTP status code (401 or 403)
        status: u16,
    },

    /// Storage answered with another non-success status
    #[error("storage returned status {status} for '{uri}'")]
    Http {
        /// HTTP status code
        status: u16,
        /// Blob URI without the token query
        uri: String,
    },

    /// Download was cancelled before it finished
    #[error("download cancelled")]
    Cancelled,

    /// Transfer failed at the network level
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Writing the local copy failed
    #[error("failed to write {path}: {source}")]
    Io {
        /// Local destination path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

/// Line-batch processing errors
#[derive(Debug, Error)]
pub enum ProcessingError {
    /// Blob content type is not line-delimited JSON
    #[error("blob content is {content_type} which is not supported in this job")]
    UnsupportedContentType {
        /// Content type announced by the notification
        content_type: String,
    },

    /// A line could not be parsed as a record
    #[error("record {index} is not a valid record: {source}")]
    InvalidRecord {
        /// Zero-based line index within the blob
        index: usize,
        /// Parse failure
        #[source]
        source: serde_json::Error,
    },

    /// Blob body could not be decoded (corrupt gzip stream, invalid UTF-8)
    #[error("failed to decode blob body: {0}")]
    Decode(#[source] std::io::Error),

    /// Reading the working file or writing an artifact failed
    #[error("I/O error at {path}: {source}")]
    Io {
        /// File or folder involved
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Processing was stopped between lines
    #[error("processing stopped after {written} records")]
    Interrupted {
        /// Records persisted before the stop
        written: usize,
    },

    /// Background processing task panicked or was aborted
    #[error("processing task failed: {0}")]
    Task(String),
}

/// Messaging transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Broker refused the connection descriptor (expired or revoked)
    #[error("subscription unauthorized: {0}")]
    Unauthorized(String),

    /// Connection dropped or was closed
    #[error("subscription disconnected: {0}")]
    Disconnected(String),

    /// Any other transport failure
    #[error("{0}")]
    Other(String),
}

/// Which credential a 401/403-class failure refers to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialScope {
    /// The subscription connection descriptor
    Subscription,
    /// A blob access token
    Blob,
}

/// How the pump reacts to a failure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retrying the same input can never succeed; acknowledge and drop
    Permanent,
    /// A credential expired; refresh and rebuild the affected client
    CredentialExpired(CredentialScope),
    /// Blob URI is not covered by the issued credentials
    NoMatchingCredential,
    /// Shutdown interrupted the work
    Cancelled,
    /// Left to the broker's redelivery policy
    Unclassified,
}

impl Error {
    /// Classify this error for the pump's state machine
    pub fn classify(&self) -> ErrorClass {
        match self {
            Error::MalformedNotification(_) => ErrorClass::Permanent,
            Error::Processing(e) => e.classify(),
            Error::Fetch(e) => e.classify(),
            Error::Transport(TransportError::Unauthorized(_)) => {
                ErrorClass::CredentialExpired(CredentialScope::Subscription)
            }
            Error::Cancelled => ErrorClass::Cancelled,
            _ => ErrorClass::Unclassified,
        }
    }

    /// Shorthand for a configuration error on a specific key
    pub(crate) fn config(key: &str, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.to_string()),
        }
    }
}

impl FetchError {
    /// Classify a fetch failure
    pub fn classify(&self) -> ErrorClass {
        match self {
            FetchError::Unauthorized { .. } => {
                ErrorClass::CredentialExpired(CredentialScope::Blob)
            }
            FetchError::NoMatchingCredential { .. } => ErrorClass::NoMatchingCredential,
            FetchError::Cancelled => ErrorClass::Cancelled,
            _ => ErrorClass::Unclassified,
        }
    }
}

impl ProcessingError {
    /// Classify a processing failure
    pub fn classify(&self) -> ErrorClass {
        match self {
            ProcessingError::UnsupportedContentType { .. } => ErrorClass::Permanent,
            ProcessingError::Interrupted { .. } => ErrorClass::Cancelled,
            _ => ErrorClass::Unclassified,
        }
    }
}
