//! Tenant credential resolution
//!
//! Each job resolves its own [`GraphClient`] per tenant through a
//! [`CredentialResolver`]. Tokens are obtained with the OAuth2
//! client-credentials grant and cached only inside that job's client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hyper::Method;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::client::RetryingClient;
use crate::config::{ApiConfig, TenantCredentials};
use crate::error::{MigrationError, Result};
use crate::graph::{GraphClient, GraphRequest, GraphTransport};

/// Application permission scope for the Graph API
pub const GRAPH_DEFAULT_SCOPE: &str = "https://graph.microsoft.com/.default";

/// Tokens are refreshed this long before they expire
const EXPIRY_SKEW: Duration = Duration::from_secs(120);

/// Source of bearer tokens for one tenant
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<String>;
}

/// Fixed token, for tests and pre-issued tokens
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Debug)]
struct CachedToken {
    access_token: String,
    refresh_at: Instant,
}

/// OAuth2 client-credentials grant against `{login}/{tenant}/oauth2/v2.0/token`
pub struct ClientCredentialsTokenProvider {
    transport: Arc<dyn GraphTransport>,
    token_url: String,
    client_id: String,
    client_secret: String,
    cached: Mutex<Option<CachedToken>>,
}

impl ClientCredentialsTokenProvider {
    pub fn new(
        transport: Arc<dyn GraphTransport>,
        login_base_url: &str,
        tenant_id: &str,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            token_url: format!(
                "{}/{}/oauth2/v2.0/token",
                login_base_url.trim_end_matches('/'),
                tenant_id
            ),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            cached: Mutex::new(None),
        }
    }

    fn form_body(&self) -> String {
        [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", GRAPH_DEFAULT_SCOPE),
        ]
        .iter()
        .map(|(key, value)| format!("{}={}", key, utf8_percent_encode(value, NON_ALPHANUMERIC)))
        .collect::<Vec<_>>()
        .join("&")
    }

    async fn request_token(&self) -> Result<TokenResponse> {
        let request = GraphRequest::new(Method::POST, self.token_url.as_str())
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(Bytes::from(self.form_body()));

        let response = self.transport.send(request).await.map_err(|e| {
            MigrationError::CredentialError(format!("Token request failed: {}", e))
        })?;

        if !response.is_success() {
            return Err(MigrationError::CredentialError(format!(
                "Token endpoint returned HTTP {}: {}",
                response.status,
                String::from_utf8_lossy(&response.body)
            )));
        }

        response.json::<TokenResponse>().map_err(|e| {
            MigrationError::CredentialError(format!("Malformed token response: {}", e))
        })
    }
}

#[async_trait]
impl TokenProvider for ClientCredentialsTokenProvider {
    async fn token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.access_token.clone());
            }
        }

        let response = self.request_token().await?;
        let lifetime = Duration::from_secs(response.expires_in).saturating_sub(EXPIRY_SKEW);
        debug!("Obtained access token valid for {}s", response.expires_in);

        let access_token = response.access_token;
        *cached = Some(CachedToken {
            access_token: access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(access_token)
    }
}

/// Resolves an authenticated client for a tenant
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn client_for(&self, tenant_id: &str) -> Result<Arc<GraphClient>>;
}

/// Resolver backed by the `[[tenants]]` configuration entries
pub struct ConfigCredentialResolver {
    api: ApiConfig,
    tenants: Vec<TenantCredentials>,
    transport: Arc<dyn GraphTransport>,
    retrying: RetryingClient,
}

impl ConfigCredentialResolver {
    pub fn new(
        api: ApiConfig,
        tenants: Vec<TenantCredentials>,
        transport: Arc<dyn GraphTransport>,
        retrying: RetryingClient,
    ) -> Self {
        Self {
            api,
            tenants,
            transport,
            retrying,
        }
    }
}

#[async_trait]
impl CredentialResolver for ConfigCredentialResolver {
    async fn client_for(&self, tenant_id: &str) -> Result<Arc<GraphClient>> {
        let creds = self
            .tenants
            .iter()
            .find(|t| t.tenant_id == tenant_id)
            .ok_or_else(|| {
                MigrationError::CredentialError(format!("No credentials configured for tenant {}", tenant_id))
            })?;

        let provider = ClientCredentialsTokenProvider::new(
            Arc::clone(&self.transport),
            &self.api.login_base_url,
            tenant_id,
            creds.client_id.clone(),
            creds.secret()?,
        );

        // Fail the job up front rather than on its first API call
        provider.token().await?;
        info!(tenant = tenant_id, "Resolved tenant credentials");

        Ok(Arc::new(GraphClient::new(
            tenant_id,
            self.api.graph_base_url.clone(),
            Arc::new(provider),
            Arc::clone(&self.transport),
            self.retrying.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RetryPolicy;
    use crate::graph::GraphResponse;
    use crate::rate_limiter::TenantRateLimiter;
    use mockall::mock;

    mock! {
        Transport {}

        #[async_trait]
        impl GraphTransport for Transport {
            async fn send(&self, request: GraphRequest) -> Result<GraphResponse>;
        }
    }

    fn token_response(status: u16, body: &str) -> GraphResponse {
        GraphResponse {
            status,
            headers: Vec::new(),
            body: Bytes::from(body.to_string()),
        }
    }

    fn tenant(secret: Option<&str>) -> TenantCredentials {
        TenantCredentials {
            tenant_id: "contoso".to_string(),
            client_id: "app-id".to_string(),
            client_secret: secret.map(str::to_string),
            client_secret_env: None,
        }
    }

    #[tokio::test]
    async fn test_static_token() {
        assert_eq!(StaticToken::new("abc").token().await.unwrap(), "abc");
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_credentials_grant_is_cached() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(1)
            .withf(|request| {
                let body = String::from_utf8_lossy(request.body.as_deref().unwrap_or_default()).to_string();
                request.url == "https://login.example/contoso/oauth2/v2.0/token"
                    && body.contains("grant_type=client%5Fcredentials")
                    && body.contains("client_secret=s%20cret")
                    && body.contains("scope=https%3A%2F%2Fgraph%2Emicrosoft%2Ecom%2F%2Edefault")
            })
            .returning(|_| Ok(token_response(200, r#"{"access_token":"tok","expires_in":3600}"#)));

        let provider = ClientCredentialsTokenProvider::new(
            Arc::new(transport),
            "https://login.example/",
            "contoso",
            "app-id",
            "s cret",
        );

        assert_eq!(provider.token().await.unwrap(), "tok");
        tokio::time::advance(Duration::from_secs(600)).await;
        assert_eq!(provider.token().await.unwrap(), "tok");
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_refreshed_before_expiry() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(2)
            .returning(|_| Ok(token_response(200, r#"{"access_token":"tok","expires_in":300}"#)));

        let provider =
            ClientCredentialsTokenProvider::new(Arc::new(transport), "https://login.example", "t", "id", "secret");
        provider.token().await.unwrap();
        // 300s lifetime minus 120s skew
        tokio::time::advance(Duration::from_secs(181)).await;
        provider.token().await.unwrap();
    }

    #[tokio::test]
    async fn test_token_endpoint_rejection_is_credential_error() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .returning(|_| Ok(token_response(401, r#"{"error":"invalid_client"}"#)));

        let provider =
            ClientCredentialsTokenProvider::new(Arc::new(transport), "https://login.example", "t", "id", "bad");
        let err = provider.token().await.unwrap_err();
        assert!(matches!(err, MigrationError::CredentialError(msg) if msg.contains("invalid_client")));
    }

    #[tokio::test]
    async fn test_resolver_requires_configured_tenant() {
        let resolver = ConfigCredentialResolver::new(
            ApiConfig::default(),
            vec![tenant(Some("secret"))],
            Arc::new(MockTransport::new()),
            RetryingClient::new(TenantRateLimiter::new(), RetryPolicy::default()),
        );

        let err = resolver.client_for("fabrikam").await.unwrap_err();
        assert!(matches!(err, MigrationError::CredentialError(_)));
    }

    #[tokio::test]
    async fn test_resolver_builds_client_after_token_check() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(1)
            .returning(|_| Ok(token_response(200, r#"{"access_token":"tok"}"#)));

        let resolver = ConfigCredentialResolver::new(
            ApiConfig::default(),
            vec![tenant(Some("secret"))],
            Arc::new(transport),
            RetryingClient::new(TenantRateLimiter::new(), RetryPolicy::default()),
        );

        let client = resolver.client_for("contoso").await.unwrap();
        assert_eq!(client.tenant_id(), "contoso");
    }
}
