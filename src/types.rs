//! Core types for export-subscriber

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// Blob-available notification as carried on the topic
///
/// Field names are camelCase on the wire; PascalCase is accepted as well
/// because some publishers serialize with their language defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobNotification {
    /// Logical record kind (e.g. "testdata"), may carry a version suffix
    #[serde(alias = "BlobType")]
    pub blob_type: String,

    /// Id used to track the blob across systems, typically a GUID
    #[serde(default, alias = "CorrelationId")]
    pub correlation_id: String,

    /// MIME type of the blob body
    #[serde(alias = "ContentType")]
    pub content_type: String,

    /// Either empty/absent or "gzip", with HTTP Content-Encoding semantics
    #[serde(default, alias = "ContentEncoding")]
    pub content_encoding: Option<String>,

    /// Absolute URI of the blob
    #[serde(alias = "Uri")]
    pub uri: Url,

    /// Publisher-defined properties
    #[serde(default, alias = "Properties")]
    pub properties: Option<serde_json::Map<String, serde_json::Value>>,
}

impl BlobNotification {
    /// Deserialize a notification from a raw message body
    pub fn from_body(body: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(body)
    }

    /// Whether the body is gzip-encoded
    pub fn is_gzip(&self) -> bool {
        self.content_encoding
            .as_deref()
            .is_some_and(|encoding| crate::utils::eq_normalized(encoding, "gzip"))
    }
}

/// One line of a "testdata" blob
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestData {
    /// Record id
    #[serde(alias = "Id")]
    pub id: i64,

    /// Display name
    #[serde(default, alias = "Name")]
    pub name: Option<String>,

    /// Nested items; their shape is owned by the publisher
    #[serde(default, alias = "Subitems")]
    pub subitems: Option<Vec<serde_json::Value>>,
}

/// A storage base URL and the token query that authorizes it
#[derive(Clone, PartialEq, Eq)]
pub struct BlobEndpoint {
    /// Scheme, authority and path of the storage container
    pub base_url: String,
    /// Query string (without the leading `?`) carrying the access token
    pub token_query: String,
}

impl BlobEndpoint {
    /// Split an issued "base URL with token" into its base and query parts
    pub fn from_url(url: &Url) -> Self {
        let mut base = url.clone();
        base.set_query(None);
        base.set_fragment(None);
        Self {
            base_url: base.to_string(),
            token_query: url.query().unwrap_or_default().to_string(),
        }
    }
}

impl fmt::Debug for BlobEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobEndpoint")
            .field("base_url", &self.base_url)
            .field("token_query", &"<redacted>")
            .finish()
    }
}

/// Credentials as returned by the issuer, before they are timestamped
#[derive(Clone)]
pub struct IssuedCredentials {
    /// Opaque descriptor used to open the subscription
    pub connection_descriptor: String,
    /// Subscription to receive from
    pub subscription_name: String,
    /// Storage endpoints, in issuer order
    pub blob_endpoints: Vec<BlobEndpoint>,
}

impl IssuedCredentials {
    /// Stamp the credentials with their local receipt time
    pub fn into_bundle(self, issued_at: DateTime<Utc>) -> CredentialBundle {
        CredentialBundle {
            connection_descriptor: self.connection_descriptor,
            subscription_name: self.subscription_name,
            blob_endpoints: self.blob_endpoints,
            issued_at,
        }
    }
}

impl fmt::Debug for IssuedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCredentials")
            .field("connection_descriptor", &"<redacted>")
            .field("subscription_name", &self.subscription_name)
            .field("blob_endpoints", &self.blob_endpoints)
            .finish()
    }
}

/// The complete credential set issued together
///
/// Bundles are never edited; a refresh replaces the whole bundle.
#[derive(Clone)]
pub struct CredentialBundle {
    /// Opaque descriptor used to open the subscription
    pub connection_descriptor: String,
    /// Subscription to receive from
    pub subscription_name: String,
    /// Storage endpoints, in issuer order
    pub blob_endpoints: Vec<BlobEndpoint>,
    /// Local time the bundle was received
    pub issued_at: DateTime<Utc>,
}

impl fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("connection_descriptor", &"<redacted>")
            .field("subscription_name", &self.subscription_name)
            .field("blob_endpoints", &self.blob_endpoints)
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

/// Pump gate state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PumpState {
    /// Messages are handled as they arrive
    Active,
    /// A refresh was denied; the next message will hit the cooldown gate
    CooldownPending {
        /// When message handling may resume
        resume_at: DateTime<Utc>,
    },
    /// The pump is waiting out a cooldown
    CooldownActive {
        /// When message handling resumes
        resume_at: DateTime<Utc>,
    },
    /// The pump has shut down
    Stopped,
}

/// Result of a refresh attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new bundle was issued and stored
    Refreshed,
    /// The current bundle is too young; a cooldown was armed instead
    Denied,
}

/// How a single message was terminally handled
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Processed and acknowledged
    Completed {
        /// Records written for the message
        records: usize,
    },
    /// Acknowledged without processing (permanent failure)
    Dropped {
        /// Why the message was dropped
        reason: String,
    },
    /// Returned to the broker unprocessed because of the cooldown gate
    Deferred,
}

/// A message received from the subscription
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    /// Broker-assigned unique id, also names the output folder
    pub message_id: String,
    /// Raw body (UTF-8 JSON notification)
    pub body: Vec<u8>,
    /// How many times the broker has delivered this message
    pub delivery_count: u32,
}

impl InboundMessage {
    /// Create a first-delivery message
    pub fn new(message_id: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            message_id: message_id.into(),
            body: body.into(),
            delivery_count: 1,
        }
    }
}

/// Event emitted by the pump on every state transition
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PumpEvent {
    /// A new credential bundle was stored
    CredentialsRefreshed {
        /// Local issue time of the new bundle
        issued_at: DateTime<Utc>,
    },
    /// A refresh was attempted too soon after the last one
    RefreshDenied {
        /// End of the armed cooldown
        resume_at: DateTime<Utc>,
    },
    /// The cooldown gate engaged
    CooldownStarted {
        /// When message handling resumes
        resume_at: DateTime<Utc>,
    },
    /// The cooldown elapsed and the pump is active again
    CooldownEnded,
    /// The subscription connection was rebuilt
    SubscriptionRebuilt,
    /// The blob fetcher was rebuilt with the current tokens
    FetcherRebuilt,
    /// A message was processed and acknowledged
    MessageCompleted {
        /// Broker message id
        message_id: String,
        /// Records written
        records: usize,
    },
    /// A message was acknowledged without being processed
    MessageDropped {
        /// Broker message id
        message_id: String,
        /// Why it was dropped
        reason: String,
    },
    /// A message was returned to the broker
    MessageAbandoned {
        /// Broker message id
        message_id: String,
        /// Why it was abandoned
        reason: String,
    },
    /// A blob URI is not covered by any issued credential
    ConfigurationFault {
        /// Description of the mismatch
        error: String,
    },
    /// The pump stopped
    Stopped,
}
