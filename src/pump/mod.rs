//! Subscription pump: the receive/process/acknowledge loop.
//!
//! The pump owns the only thread of control that touches the credential
//! store, the cooldown gate and the two credential-bound clients (the
//! subscription and the blob fetcher). Messages are handled strictly one at
//! a time:
//!
//! 1. The cooldown gate is checked; a held message is abandoned and the pump
//!    waits out the cooldown.
//! 2. The body is deserialized; a malformed body is acknowledged and dropped.
//! 3. The blob is downloaded to a working file and processed, inside the
//!    processing deadline.
//! 4. The message is completed. Permanent failures are completed and
//!    dropped; anything else is abandoned and handed to
//!    [`SubscriptionPump::handle_error`].

mod gate;
pub mod memory;
mod transport;

#[cfg(test)]
mod tests;

pub use gate::{CooldownGate, GateDecision};
pub use transport::{MessageTransport, ReceiverOptions, SubscriptionConnector};

use crate::blob::{BlobFetcher, BlobTransport, HttpBlobTransport};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::credentials::{
    CredentialIssuer, CredentialRefresher, CredentialStore, HttpCredentialIssuer,
};
use crate::descriptor::SubscriptionDescriptor;
use crate::error::{CredentialScope, Error, ErrorClass, Result, TransportError};
use crate::processing::LineBatchProcessor;
use crate::retry::retry_with_backoff;
use crate::types::{
    BlobNotification, HandleOutcome, InboundMessage, PumpEvent, PumpState, RefreshOutcome,
};
use crate::utils::create_working_file;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// External collaborators the pump talks to
#[derive(Clone)]
pub struct Collaborators {
    /// Source of credential bundles
    pub issuer: Arc<dyn CredentialIssuer>,
    /// Opens the subscription
    pub connector: Arc<dyn SubscriptionConnector>,
    /// Downloads blob bytes
    pub blob_transport: Arc<dyn BlobTransport>,
    /// Time source
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// HTTP issuer, HTTP blob downloads and the system clock around `connector`
    pub fn http(config: &Config, connector: Arc<dyn SubscriptionConnector>) -> Result<Self> {
        Ok(Self {
            issuer: Arc::new(HttpCredentialIssuer::new(&config.issuer)?),
            connector,
            blob_transport: Arc::new(HttpBlobTransport::new()),
            clock: Arc::new(SystemClock),
        })
    }
}

/// Single-handler consumer of blob notifications
pub struct SubscriptionPump {
    config: Config,
    store: CredentialStore,
    refresher: CredentialRefresher,
    connector: Arc<dyn SubscriptionConnector>,
    blob_transport: Arc<dyn BlobTransport>,
    clock: Arc<dyn Clock>,
    processor: LineBatchProcessor,
    gate: CooldownGate,
    subscription: Option<Box<dyn MessageTransport>>,
    fetcher: Option<BlobFetcher>,
    event_tx: broadcast::Sender<PumpEvent>,
}

impl SubscriptionPump {
    /// Create a pump; nothing is contacted until [`start`](Self::start)
    pub fn new(config: Config, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let (event_tx, _) = broadcast::channel(config.pump.event_capacity);
        let refresher = CredentialRefresher::new(
            collaborators.issuer,
            collaborators.clock.clone(),
            config.pump.min_refresh_interval,
            config.pump.cooldown,
            event_tx.clone(),
        );
        let processor = LineBatchProcessor::from_config(&config.pump, &config.storage);

        Ok(Self {
            config,
            store: CredentialStore::new(),
            refresher,
            connector: collaborators.connector,
            blob_transport: collaborators.blob_transport,
            clock: collaborators.clock,
            processor,
            gate: CooldownGate::new(),
            subscription: None,
            fetcher: None,
            event_tx,
        })
    }

    /// Subscribe to pump events
    pub fn subscribe(&self) -> broadcast::Receiver<PumpEvent> {
        self.event_tx.subscribe()
    }

    /// Current gate state
    pub fn state(&self) -> PumpState {
        self.gate.state()
    }

    /// Credential store backing the pump
    pub fn credentials(&self) -> &CredentialStore {
        &self.store
    }

    /// Whether [`start`](Self::start) has connected the subscription
    pub fn is_connected(&self) -> bool {
        self.subscription.is_some()
    }

    fn emit(&self, event: PumpEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Fetch the first bundle, open the subscription and build the fetcher
    ///
    /// The first fetch is retried with backoff. Failing to get any
    /// credential or to open the subscription is the only fatal error.
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!(
            blob_type = %self.config.pump.supported_blob_type,
            "Starting subscription pump"
        );
        let refresher = &self.refresher;
        let store = &self.store;
        retry_with_backoff(&self.config.retry, || refresher.refresh_now(store)).await?;

        self.connect_subscription().await?;
        self.rebuild_fetcher().await?;
        Ok(())
    }

    async fn current_descriptor(&self) -> Result<SubscriptionDescriptor> {
        let bundle = self.store.current().await.ok_or(Error::NoCredentials)?;
        SubscriptionDescriptor::parse(&bundle.connection_descriptor, &bundle.subscription_name)
    }

    /// (Re)open the subscription with the current bundle
    async fn connect_subscription(&mut self) -> Result<()> {
        let descriptor = self.current_descriptor().await?;
        if let Some(old) = self.subscription.take()
            && let Err(e) = old.close().await
        {
            tracing::warn!(error = %e, "Failed to close previous subscription");
        }

        let options = ReceiverOptions::sequential(self.config.pump.prefetch_count);
        let subscription = self.connector.connect(&descriptor, options).await?;
        tracing::info!(
            topic = %descriptor.topic,
            subscription = %descriptor.subscription_name,
            prefetch = options.prefetch_count,
            "Subscription connected"
        );
        self.subscription = Some(subscription);
        Ok(())
    }

    /// Replace the blob fetcher with one built from the current bundle
    async fn rebuild_fetcher(&mut self) -> Result<()> {
        let bundle = self.store.current().await.ok_or(Error::NoCredentials)?;
        let fetcher = BlobFetcher::from_bundle(&bundle, self.blob_transport.clone());
        tracing::info!(endpoints = fetcher.endpoint_count(), "Blob fetcher ready");
        self.fetcher = Some(fetcher);
        Ok(())
    }

    /// Run until `cancel` fires
    ///
    /// Starts the pump first if [`start`](Self::start) has not been called.
    /// Single-message failures are handled and logged; only startup failures
    /// are returned.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        if !self.is_connected() {
            self.start().await?;
        }
        tracing::info!("Subscription pump running");

        let poll_interval = self.config.pump.poll_interval;
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let idle = match self.poll_once(&cancel).await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) if e.classify() == ErrorClass::Cancelled => break,
                Err(e) => {
                    self.handle_error(&e).await;
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Receive and handle at most one message
    ///
    /// Returns `Ok(None)` when the subscription had nothing waiting.
    pub async fn poll_once(&mut self, cancel: &CancellationToken) -> Result<Option<HandleOutcome>> {
        let subscription = self
            .subscription
            .as_deref()
            .ok_or_else(|| TransportError::Disconnected("subscription not connected".into()))?;

        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            received = subscription.receive() => received?,
        };
        match message {
            Some(message) => self.handle_message(message, cancel).await.map(Some),
            None => Ok(None),
        }
    }

    /// Handle one received message through to complete or abandon
    pub async fn handle_message(
        &mut self,
        message: InboundMessage,
        cancel: &CancellationToken,
    ) -> Result<HandleOutcome> {
        let was_cooling = matches!(self.gate.state(), PumpState::CooldownActive { .. });
        match self.gate.check(self.clock.now()) {
            GateDecision::Open => {}
            GateDecision::Closed => {
                self.abandon(&message, "pump stopped").await;
                return Err(Error::Cancelled);
            }
            GateDecision::Hold { resume_at } => {
                tracing::warn!(
                    message_id = %message.message_id,
                    resume_at = %resume_at,
                    "Pausing, returning message to the subscription"
                );
                self.abandon(&message, "cooldown active").await;
                if !was_cooling {
                    self.emit(PumpEvent::CooldownStarted { resume_at });
                }

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = self.clock.sleep_until(resume_at) => {}
                }
                self.gate.resume();
                tracing::info!("Cooldown over, resuming");
                self.emit(PumpEvent::CooldownEnded);
                return Ok(HandleOutcome::Deferred);
            }
        }

        let notification = match BlobNotification::from_body(&message.body) {
            Ok(notification) => notification,
            Err(e) => {
                return self
                    .drop_message(&message, &Error::MalformedNotification(e))
                    .await;
            }
        };
        tracing::info!(
            message_id = %message.message_id,
            blob_type = %notification.blob_type,
            correlation_id = %notification.correlation_id,
            content_type = %notification.content_type,
            delivery_count = message.delivery_count,
            "Got notification"
        );

        let deadline = self.config.pump.processing_deadline();
        let stop = cancel.child_token();
        let work = self.fetch_and_process(&message, &notification, &stop);
        tokio::pin!(work);
        let result = tokio::select! {
            biased;
            result = &mut work => result,
            _ = tokio::time::sleep(deadline) => {
                tracing::warn!(
                    message_id = %message.message_id,
                    deadline_secs = deadline.as_secs(),
                    "Processing deadline reached, stopping"
                );
                stop.cancel();
                work.await
            }
        };
        let result = match result {
            Err(_) if stop.is_cancelled() && !cancel.is_cancelled() => {
                Err(Error::DeadlineExceeded {
                    seconds: deadline.as_secs(),
                })
            }
            other => other,
        };

        match result {
            Ok(records) => {
                self.complete(&message).await?;
                tracing::info!(
                    message_id = %message.message_id,
                    records,
                    "Message completed"
                );
                self.emit(PumpEvent::MessageCompleted {
                    message_id: message.message_id.clone(),
                    records,
                });
                Ok(HandleOutcome::Completed { records })
            }
            Err(e) if e.classify() == ErrorClass::Permanent => {
                self.drop_message(&message, &e).await
            }
            Err(e) => {
                self.abandon(&message, &e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Download and process one blob, stopping early once `stop` fires
    async fn fetch_and_process(
        &self,
        message: &InboundMessage,
        notification: &BlobNotification,
        stop: &CancellationToken,
    ) -> Result<usize> {
        if !self.processor.accepts(notification) {
            tracing::debug!(
                message_id = %message.message_id,
                blob_type = %notification.blob_type,
                "Blob type not handled by this job, skipping download"
            );
            return Ok(0);
        }

        let fetcher = self.fetcher.as_ref().ok_or(Error::NoCredentials)?;
        let working = create_working_file(&self.config.storage.temp_dir)?;
        fetcher.download(notification, working.path(), stop).await?;
        let records = self
            .processor
            .process(&message.message_id, notification, working.path(), stop)
            .await?;
        Ok(records)
    }

    async fn complete(&self, message: &InboundMessage) -> Result<()> {
        let subscription = self
            .subscription
            .as_deref()
            .ok_or_else(|| TransportError::Disconnected("subscription not connected".into()))?;
        subscription.complete(message).await?;
        Ok(())
    }

    async fn drop_message(
        &self,
        message: &InboundMessage,
        error: &Error,
    ) -> Result<HandleOutcome> {
        self.complete(message).await?;
        let reason = error.to_string();
        tracing::warn!(
            message_id = %message.message_id,
            error = %reason,
            "Message dropped permanently"
        );
        self.emit(PumpEvent::MessageDropped {
            message_id: message.message_id.clone(),
            reason: reason.clone(),
        });
        Ok(HandleOutcome::Dropped { reason })
    }

    async fn abandon(&self, message: &InboundMessage, reason: &str) {
        if let Some(subscription) = self.subscription.as_deref()
            && let Err(e) = subscription.abandon(message).await
        {
            tracing::warn!(
                message_id = %message.message_id,
                error = %e,
                "Failed to abandon message, the lock will expire instead"
            );
        }
        tracing::debug!(message_id = %message.message_id, reason, "Message abandoned");
        self.emit(PumpEvent::MessageAbandoned {
            message_id: message.message_id.clone(),
            reason: reason.to_string(),
        });
    }

    /// React to a failure reported by message handling or the transport
    ///
    /// Expired credentials are refreshed (subject to the minimum interval)
    /// and the affected client is rebuilt. Everything else is logged and
    /// left to the broker's redelivery.
    pub async fn handle_error(&mut self, error: &Error) {
        match error.classify() {
            ErrorClass::CredentialExpired(scope) => {
                tracing::warn!(error = %error, scope = ?scope, "Access denied, refreshing credentials");
                self.recover_credentials(scope).await;
            }
            ErrorClass::NoMatchingCredential => {
                tracing::error!(error = %error, "No issued credential covers the blob");
                self.emit(PumpEvent::ConfigurationFault {
                    error: error.to_string(),
                });
            }
            ErrorClass::Cancelled => {
                tracing::debug!("Message handling cancelled");
            }
            ErrorClass::Permanent | ErrorClass::Unclassified => {
                tracing::warn!(error = %error, "Message handling failed, left for redelivery");
                if matches!(error, Error::Transport(TransportError::Disconnected(_))) {
                    self.reconnect().await;
                }
            }
        }
    }

    /// Refresh the bundle (subject to the minimum interval) and rebuild `scope`
    async fn recover_credentials(&mut self, scope: CredentialScope) {
        match self
            .refresher
            .refresh_if_due(&self.store, &mut self.gate)
            .await
        {
            Ok(RefreshOutcome::Refreshed) => {}
            Ok(RefreshOutcome::Denied) => {
                tracing::info!("Rebuilding with the current credentials");
            }
            Err(e) => {
                tracing::error!(error = %e, "Credential refresh failed");
                return;
            }
        }
        self.rebuild(scope).await;
    }

    /// Reopen a lost subscription
    ///
    /// A descriptor the broker no longer accepts goes through credential
    /// recovery instead of being retried as is.
    async fn reconnect(&mut self) {
        match self.connect_subscription().await {
            Ok(()) => self.emit(PumpEvent::SubscriptionRebuilt),
            Err(e)
                if e.classify() == ErrorClass::CredentialExpired(CredentialScope::Subscription) =>
            {
                tracing::warn!(error = %e, "Subscription descriptor rejected, refreshing credentials");
                self.recover_credentials(CredentialScope::Subscription).await;
            }
            Err(e) => tracing::error!(error = %e, "Failed to reconnect subscription"),
        }
    }

    async fn rebuild(&mut self, scope: CredentialScope) {
        match scope {
            CredentialScope::Subscription => match self.connect_subscription().await {
                Ok(()) => self.emit(PumpEvent::SubscriptionRebuilt),
                Err(e) => tracing::error!(error = %e, "Failed to rebuild subscription"),
            },
            CredentialScope::Blob => match self.rebuild_fetcher().await {
                Ok(()) => self.emit(PumpEvent::FetcherRebuilt),
                Err(e) => tracing::error!(error = %e, "Failed to rebuild blob fetcher"),
            },
        }
    }

    /// Close the subscription and enter the terminal state
    pub async fn shutdown(&mut self) {
        tracing::info!("Stopping subscription pump");
        self.gate.stop();
        if let Some(subscription) = self.subscription.take()
            && let Err(e) = subscription.close().await
        {
            tracing::warn!(error = %e, "Failed to close subscription");
        }
        self.emit(PumpEvent::Stopped);
        tracing::info!("Subscription pump stopped");
    }
}
