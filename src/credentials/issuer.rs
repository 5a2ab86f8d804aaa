//! Credential issuer seam and its HTTP client.

use crate::config::IssuerConfig;
use crate::error::{Error, IssuerError, Result};
use crate::types::{BlobEndpoint, IssuedCredentials};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use url::Url;

/// Path used when the configured issuer URL has none
pub const DEFAULT_ISSUE_PATH: &str = "/api/external/integration/export/temporaryendpoints";

/// Source of short-lived credential bundles
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    /// Issue a new bundle. One call per refresh; no internal retry.
    async fn issue(&self) -> std::result::Result<IssuedCredentials, IssuerError>;

    /// Human-readable name for logging
    fn name(&self) -> &'static str;
}

/// Provider of the bearer token presented to the issuer
///
/// Certificate lookup and token exchange live behind this trait.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    /// Token for `resource_id`, or `None` to send an anonymous request
    async fn access_token(
        &self,
        resource_id: Option<&str>,
    ) -> std::result::Result<Option<String>, IssuerError>;
}

/// Pre-acquired token taken from configuration
#[derive(Clone, Default)]
pub struct StaticAccessToken(Option<String>);

impl StaticAccessToken {
    /// Wrap an optional token
    pub fn new(token: Option<String>) -> Self {
        Self(token)
    }
}

#[async_trait]
impl AccessTokenProvider for StaticAccessToken {
    async fn access_token(
        &self,
        _resource_id: Option<&str>,
    ) -> std::result::Result<Option<String>, IssuerError> {
        Ok(self.0.clone())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IssueRequest<'a> {
    integration_name: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueResponse {
    #[serde(alias = "ServiceBusSubscriptionConnectionString")]
    service_bus_subscription_connection_string: String,
    #[serde(alias = "ServiceBusSubscriptionName")]
    service_bus_subscription_name: String,
    #[serde(default, alias = "BlobBaseUrlsWithToken")]
    blob_base_urls_with_token: Vec<Url>,
}

/// HTTP client for the temporary-endpoints issuer
pub struct HttpCredentialIssuer {
    client: reqwest::Client,
    endpoint: Url,
    integration_name: String,
    resource_id: Option<String>,
    tokens: Arc<dyn AccessTokenProvider>,
}

impl HttpCredentialIssuer {
    /// Build a client from configuration, using the configured static token
    pub fn new(config: &IssuerConfig) -> Result<Self> {
        let tokens = Arc::new(StaticAccessToken::new(config.access_token.clone()));
        Self::with_token_provider(config, tokens)
    }

    /// Build a client that asks `tokens` for a bearer token on every call
    pub fn with_token_provider(
        config: &IssuerConfig,
        tokens: Arc<dyn AccessTokenProvider>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint: resolve_endpoint(&config.url)?,
            integration_name: config.integration_name.clone(),
            resource_id: config.resource_id.clone(),
            tokens,
        })
    }

    /// Endpoint the issue request is posted to
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

/// Append [`DEFAULT_ISSUE_PATH`] when `url` has no path of its own
pub fn resolve_endpoint(url: &str) -> Result<Url> {
    let parsed = Url::parse(url.trim())
        .map_err(|e| Error::config("issuer.url", format!("invalid issuer URL: {e}")))?;
    if parsed.path() == "/" || parsed.path().is_empty() {
        return parsed
            .join(DEFAULT_ISSUE_PATH)
            .map_err(|e| Error::config("issuer.url", format!("invalid issuer URL: {e}")));
    }
    Ok(parsed)
}

#[async_trait]
impl CredentialIssuer for HttpCredentialIssuer {
    async fn issue(&self) -> std::result::Result<IssuedCredentials, IssuerError> {
        let token = self.tokens.access_token(self.resource_id.as_deref()).await?;

        tracing::info!(
            host = self.endpoint.host_str().unwrap_or_default(),
            "Acquiring temporary connection secrets"
        );
        let mut request = self.client.post(self.endpoint.clone()).json(&IssueRequest {
            integration_name: &self.integration_name,
        });
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let hint = if status == reqwest::StatusCode::FORBIDDEN {
                " (the integration has not been granted access yet)"
            } else {
                ""
            };
            return Err(IssuerError::Rejected {
                status: status.as_u16(),
                hint,
            });
        }

        let body = response.text().await?;
        let parsed: IssueResponse = serde_json::from_str(&body)
            .map_err(|e| IssuerError::InvalidResponse(e.to_string()))?;
        if parsed.service_bus_subscription_connection_string.trim().is_empty() {
            return Err(IssuerError::InvalidResponse(
                "empty subscription connection string".into(),
            ));
        }

        Ok(IssuedCredentials {
            connection_descriptor: parsed.service_bus_subscription_connection_string,
            subscription_name: parsed.service_bus_subscription_name,
            blob_endpoints: parsed
                .blob_base_urls_with_token
                .iter()
                .map(BlobEndpoint::from_url)
                .collect(),
        })
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
