use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use super::{AccessEnforcer, UsageMeter};
use crate::config::EnforcerConfig;
use crate::ids::{SessionId, SubscriberId};

#[derive(Debug, Serialize)]
struct GrantRequest<'a> {
    subscriber: &'a SubscriberId,
    session_id: &'a SessionId,
}

#[derive(Debug, Deserialize)]
struct UsageResponse {
    bytes: u64,
}

/// REST client for a network-access controller
pub struct HttpEnforcer {
    client: Client,
    endpoint: Url,
    access_token: Option<String>,
}

impl HttpEnforcer {
    /// Create a client for the configured controller endpoint
    pub fn new(config: &EnforcerConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .as_deref()
            .context("No enforcer endpoint configured")?;

        // Validate HTTPS
        let endpoint = Url::parse(endpoint).context("Invalid enforcer endpoint")?;

        if endpoint.scheme() != "https" {
            anyhow::bail!(
                "Enforcer endpoint must use HTTPS (got: {})",
                endpoint.scheme()
            );
        }

        if endpoint.cannot_be_a_base() {
            anyhow::bail!("Enforcer endpoint cannot be used as a base URL: {}", endpoint);
        }

        let client = Client::builder()
            .user_agent(format!("hotspot-engine/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.request_timeout))
            .https_only(true)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            endpoint,
            access_token: config.access_token.clone(),
        })
    }

    /// `{endpoint}/grants[/{session}[/usage]]`
    fn grants_url(&self, session_id: Option<&SessionId>, usage: bool) -> Result<Url> {
        let mut url = self.endpoint.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| anyhow::anyhow!("Enforcer endpoint cannot be a base URL"))?;
            segments.pop_if_empty().push("grants");
            if let Some(session_id) = session_id {
                segments.push(&session_id.to_string());
                if usage {
                    segments.push("usage");
                }
            }
        }
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// Map controller status codes to errors
fn check_status(response: &Response, action: &str, url: &Url) -> Result<()> {
    match response.status() {
        status if status.is_success() => Ok(()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            anyhow::bail!(
                "Access denied ({}) while trying to {}. Check the enforcer access token.\nURL: {}",
                response.status(),
                action,
                url
            )
        }
        status => {
            anyhow::bail!("Controller returned unexpected status {} while trying to {}: {}", status, action, url)
        }
    }
}

#[async_trait]
impl AccessEnforcer for HttpEnforcer {
    async fn grant(&self, subscriber: &SubscriberId, session_id: &SessionId) -> Result<()> {
        let url = self.grants_url(None, false)?;
        tracing::debug!("Granting access for session {} via {}", session_id, url);

        let response = self
            .authorize(self.client.post(url.clone()))
            .json(&GrantRequest {
                subscriber,
                session_id,
            })
            .send()
            .await
            .context("Failed to connect to access controller")?;

        // An existing grant for this session is a confirmation
        if response.status() == StatusCode::CONFLICT {
            tracing::info!("Grant for session {} already present", session_id);
            return Ok(());
        }

        check_status(&response, "grant access", &url)
    }

    async fn revoke(&self, _subscriber: &SubscriberId, session_id: &SessionId) -> Result<()> {
        let url = self.grants_url(Some(session_id), false)?;
        tracing::debug!("Revoking access for session {} via {}", session_id, url);

        let response = self
            .authorize(self.client.delete(url.clone()))
            .send()
            .await
            .context("Failed to connect to access controller")?;

        // Nothing to revoke is a confirmation
        if response.status() == StatusCode::NOT_FOUND {
            tracing::info!("Grant for session {} already gone", session_id);
            return Ok(());
        }

        check_status(&response, "revoke access", &url)
    }
}

#[async_trait]
impl UsageMeter for HttpEnforcer {
    async fn bytes_transferred(
        &self,
        _subscriber: &SubscriberId,
        session_id: &SessionId,
    ) -> Result<u64> {
        let url = self.grants_url(Some(session_id), true)?;

        let response = self
            .authorize(self.client.get(url.clone()))
            .send()
            .await
            .context("Failed to connect to access controller")?;

        check_status(&response, "read usage", &url)?;

        let usage: UsageResponse = response
            .json()
            .await
            .context("Failed to parse usage response")?;

        Ok(usage.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(endpoint: &str) -> EnforcerConfig {
        EnforcerConfig {
            endpoint: Some(endpoint.to_string()),
            ..EnforcerConfig::default()
        }
    }

    #[test]
    fn http_enforcer_rejects_http() {
        assert!(HttpEnforcer::new(&config("http://controller.local/api")).is_err());
    }

    #[test]
    fn http_enforcer_accepts_https() {
        assert!(HttpEnforcer::new(&config("https://controller.local/api")).is_ok());
    }

    #[test]
    fn http_enforcer_validates_url() {
        assert!(HttpEnforcer::new(&config("not-a-url")).is_err());
    }

    #[test]
    fn http_enforcer_requires_endpoint() {
        assert!(HttpEnforcer::new(&EnforcerConfig::default()).is_err());
    }

    #[test]
    fn builds_grant_urls() {
        let enforcer = HttpEnforcer::new(&config("https://controller.local/api/")).unwrap();
        let session_id = SessionId::new();

        assert_eq!(
            enforcer.grants_url(None, false).unwrap().as_str(),
            "https://controller.local/api/grants"
        );
        assert_eq!(
            enforcer.grants_url(Some(&session_id), true).unwrap().as_str(),
            format!("https://controller.local/api/grants/{}/usage", session_id)
        );
    }
}
