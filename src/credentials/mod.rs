//! Credential bundle storage and rotation.
//!
//! - [`CredentialStore`] holds the current bundle and answers freshness
//! - [`CredentialRefresher`] calls the issuer, rate-limited by a minimum
//!   refresh interval; a refresh that comes too soon arms the pump's
//!   cooldown instead
//! - [`issuer`] defines the issuer seam and its HTTP client

pub mod issuer;

pub use issuer::{
    AccessTokenProvider, CredentialIssuer, DEFAULT_ISSUE_PATH, HttpCredentialIssuer,
    StaticAccessToken,
};

use crate::clock::Clock;
use crate::error::Result;
use crate::pump::CooldownGate;
use crate::types::{CredentialBundle, PumpEvent, RefreshOutcome};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Holder of the current credential bundle
///
/// Readers get an `Arc` snapshot and never see a half-replaced bundle.
#[derive(Clone, Debug, Default)]
pub struct CredentialStore {
    current: Arc<RwLock<Option<Arc<CredentialBundle>>>>,
}

impl CredentialStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current bundle
    pub async fn current(&self) -> Option<Arc<CredentialBundle>> {
        self.current.read().await.clone()
    }

    /// Replace the bundle as a whole
    pub async fn replace(&self, bundle: CredentialBundle) {
        *self.current.write().await = Some(Arc::new(bundle));
    }

    /// Whether the bundle is younger than `min_age` at `now`
    ///
    /// An empty store is never fresh, which forces the initial fetch.
    pub async fn is_fresh(&self, min_age: chrono::Duration, now: DateTime<Utc>) -> bool {
        match self.current.read().await.as_ref() {
            Some(bundle) => now - bundle.issued_at < min_age,
            None => false,
        }
    }
}

/// Rate-limited front of the credential issuer
pub struct CredentialRefresher {
    issuer: Arc<dyn CredentialIssuer>,
    clock: Arc<dyn Clock>,
    min_interval: chrono::Duration,
    cooldown: chrono::Duration,
    event_tx: tokio::sync::broadcast::Sender<PumpEvent>,
}

impl CredentialRefresher {
    /// Create a refresher
    pub fn new(
        issuer: Arc<dyn CredentialIssuer>,
        clock: Arc<dyn Clock>,
        min_interval: std::time::Duration,
        cooldown: std::time::Duration,
        event_tx: tokio::sync::broadcast::Sender<PumpEvent>,
    ) -> Self {
        Self {
            issuer,
            clock,
            min_interval: to_chrono(min_interval),
            cooldown: to_chrono(cooldown),
            event_tx,
        }
    }

    /// Refresh the bundle unless it was issued less than the minimum
    /// interval ago.
    ///
    /// A denied refresh arms `gate` with the configured cooldown so the pump
    /// stops hammering an issuer that keeps handing out rejected credentials.
    /// Issuer failures are returned to the caller.
    pub async fn refresh_if_due(
        &self,
        store: &CredentialStore,
        gate: &mut CooldownGate,
    ) -> Result<RefreshOutcome> {
        let now = self.clock.now();
        if store.is_fresh(self.min_interval, now).await {
            let resume_at = now + self.cooldown;
            tracing::warn!(
                resume_at = %resume_at,
                "Can not refresh credentials now, already refreshed recently; pausing"
            );
            gate.arm(resume_at);
            let _ = self.event_tx.send(PumpEvent::RefreshDenied { resume_at });
            return Ok(RefreshOutcome::Denied);
        }

        self.refresh_now(store).await?;
        Ok(RefreshOutcome::Refreshed)
    }

    /// Call the issuer unconditionally and store the result
    pub async fn refresh_now(&self, store: &CredentialStore) -> Result<()> {
        tracing::info!(issuer = self.issuer.name(), "Getting new credentials");
        let issued = self.issuer.issue().await?;
        let issued_at = self.clock.now();
        let bundle = issued.into_bundle(issued_at);
        tracing::info!(
            subscription = %bundle.subscription_name,
            endpoints = bundle.blob_endpoints.len(),
            issued_at = %issued_at,
            "Credentials refreshed"
        );
        store.replace(bundle).await;
        let _ = self
            .event_tx
            .send(PumpEvent::CredentialsRefreshed { issued_at });
        Ok(())
    }
}

fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
