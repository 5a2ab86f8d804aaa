//! # export-subscriber
//!
//! Consumer for blob-available notifications whose credentials expire
//! underneath it.
//!
//! A [`SubscriptionPump`] receives one notification at a time, downloads
//! the referenced blob with a short-lived storage token, turns the
//! line-delimited JSON body into record artifacts and acknowledges the
//! notification once they are written. The credential bundle behind both
//! the subscription and the storage tokens is rotated on 401/403 answers,
//! no more often than the configured minimum interval; a refresh asked for
//! too early pauses the pump instead.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use export_subscriber::pump::memory::InMemoryBroker;
//! use export_subscriber::{Collaborators, Config, SubscriptionPump, run_with_shutdown};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_json_file("appsettings.json")?;
//!     let collaborators = Collaborators::http(&config, Arc::new(InMemoryBroker::new()))?;
//!     let pump = SubscriptionPump::new(config, collaborators)?;
//!
//!     // Watch state transitions
//!     let mut events = pump.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     run_with_shutdown(pump).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Blob download with issued storage tokens
pub mod blob;
/// Wall-clock abstraction
pub mod clock;
/// Configuration types
pub mod config;
/// Credential storage and rotation
pub mod credentials;
/// Subscription connection descriptor parsing
pub mod descriptor;
/// Error types
pub mod error;
/// Line-batch processing of downloaded blobs
pub mod processing;
/// Receive/process/acknowledge loop
pub mod pump;
/// Retry logic with exponential backoff
pub mod retry;
/// Core types and events
pub mod types;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use blob::{BlobFetcher, BlobTransport, HttpBlobTransport};
pub use clock::{Clock, MockClock, SystemClock};
pub use config::{Config, IssuerConfig, PumpConfig, RetryConfig, StorageConfig};
pub use credentials::{
    CredentialIssuer, CredentialRefresher, CredentialStore, HttpCredentialIssuer,
};
pub use descriptor::SubscriptionDescriptor;
pub use error::{
    CredentialScope, Error, ErrorClass, FetchError, IssuerError, ProcessingError, Result,
    TransportError,
};
pub use processing::LineBatchProcessor;
pub use pump::{
    Collaborators, CooldownGate, MessageTransport, ReceiverOptions, SubscriptionConnector,
    SubscriptionPump,
};
pub use types::{
    BlobNotification, CredentialBundle, HandleOutcome, InboundMessage, PumpEvent, PumpState,
    RefreshOutcome,
};

use tokio_util::sync::CancellationToken;

/// Helper function to run the pump with graceful signal handling.
///
/// Starts the pump if needed, runs it, and cancels it on a termination
/// signal. A message in flight at that point is abandoned, never completed.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use export_subscriber::pump::memory::InMemoryBroker;
/// use export_subscriber::{Collaborators, Config, SubscriptionPump, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = Config::from_json_file("appsettings.json")?;
///     let collaborators = Collaborators::http(&config, Arc::new(InMemoryBroker::new()))?;
///     let pump = SubscriptionPump::new(config, collaborators)?;
///
///     // Run with automatic signal handling
///     run_with_shutdown(pump).await?;
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(mut pump: SubscriptionPump) -> Result<()> {
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    let watcher = tokio::spawn(async move {
        wait_for_signal().await;
        signal_cancel.cancel();
    });

    let result = pump.run(cancel).await;
    watcher.abort();
    result
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
