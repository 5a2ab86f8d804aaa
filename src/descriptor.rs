//! Parsing of the subscription connection descriptor.
//!
//! The issuer hands out a `Key=Value;Key=Value` connection string. The pump
//! only needs to find the topic and keep the rest opaque for the transport.

use crate::error::{Error, Result};
use std::fmt;

/// Parsed subscription connection descriptor
#[derive(Clone, PartialEq, Eq)]
pub struct SubscriptionDescriptor {
    /// Broker endpoint (e.g. `sb://namespace.example/`)
    pub endpoint: String,
    /// Topic the subscription belongs to
    pub topic: String,
    /// Subscription to receive from
    pub subscription_name: String,
    /// Name of the shared access policy, if any
    pub shared_access_key_name: Option<String>,
    shared_access_key: Option<String>,
    raw: String,
}

impl SubscriptionDescriptor {
    /// Parse `connection_string` for `subscription_name`
    ///
    /// The topic comes from the `EntityPath` pair. Without one, the first
    /// path segment of the endpoint is used instead.
    pub fn parse(connection_string: &str, subscription_name: &str) -> Result<Self> {
        let mut endpoint = None;
        let mut entity_path = None;
        let mut key_name = None;
        let mut key = None;

        for pair in connection_string.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let Some((name, value)) = pair.split_once('=') else {
                return Err(Error::InvalidDescriptor(
                    "expected Key=Value pairs separated by ';'".into(),
                ));
            };
            let value = value.trim().to_string();
            match name.trim().to_ascii_lowercase().as_str() {
                "endpoint" => endpoint = Some(value),
                "entitypath" => entity_path = Some(value),
                "sharedaccesskeyname" => key_name = Some(value),
                "sharedaccesskey" => key = Some(value),
                _ => {}
            }
        }

        let endpoint = endpoint
            .filter(|e| !e.is_empty())
            .ok_or_else(|| Error::InvalidDescriptor("missing Endpoint".into()))?;

        let topic = match entity_path.filter(|p| !p.is_empty()) {
            Some(path) => path,
            None => topic_from_path(connection_string)?,
        };

        if subscription_name.trim().is_empty() {
            return Err(Error::InvalidDescriptor("missing subscription name".into()));
        }

        Ok(Self {
            endpoint,
            topic,
            subscription_name: subscription_name.trim().to_string(),
            shared_access_key_name: key_name,
            shared_access_key: key,
            raw: connection_string.to_string(),
        })
    }

    /// Shared access key, if the descriptor carries one
    pub fn shared_access_key(&self) -> Option<&str> {
        self.shared_access_key.as_deref()
    }

    /// Connection string as issued
    pub fn as_connection_string(&self) -> &str {
        &self.raw
    }
}

/// `sb://host/topic;...` -> `topic`
fn topic_from_path(connection_string: &str) -> Result<String> {
    let parts: Vec<&str> = connection_string.split('/').collect();
    if parts.len() < 4 {
        return Err(Error::InvalidDescriptor(
            "no EntityPath and no topic in the endpoint path".into(),
        ));
    }
    let topic = parts[3].split(';').next().unwrap_or_default().trim();
    if topic.is_empty() {
        return Err(Error::InvalidDescriptor(
            "no EntityPath and no topic in the endpoint path".into(),
        ));
    }
    Ok(topic.to_string())
}

impl fmt::Debug for SubscriptionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionDescriptor")
            .field("endpoint", &self.endpoint)
            .field("topic", &self.topic)
            .field("subscription_name", &self.subscription_name)
            .field("shared_access_key_name", &self.shared_access_key_name)
            .field("shared_access_key", &"<redacted>")
            .finish()
    }
}
