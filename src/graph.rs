//! HTTP access to the Graph API
//!
//! [`GraphTransport`] is the raw request/response seam. [`HyperTransport`]
//! implements it on hyper with rustls. [`GraphClient`] binds a transport to
//! one tenant: it attaches the bearer token, resolves relative paths against
//! the API base URL, maps non-success statuses to [`MigrationError`] and runs
//! every request through the shared [`RetryingClient`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::Method;
use hyper_util::client::legacy::connect::{Connect, HttpConnector};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

use crate::auth::TokenProvider;
use crate::client::RetryingClient;
use crate::error::{MigrationError, Result};
use crate::rate_limiter::ServiceClass;
use crate::transfer::ByteRange;

/// Characters escaped inside one path segment of a Graph URL
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'&')
    .add(b'\'')
    .add(b'+')
    .add(b'/')
    .add(b':')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Percent-encode a name for use as a single URL path segment
pub fn encode_segment(name: &str) -> String {
    utf8_percent_encode(name, PATH_SEGMENT).to_string()
}

/// A single outbound request
#[derive(Debug, Clone)]
pub struct GraphRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

impl GraphRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }

    /// Serialize `body` as the JSON request body
    pub fn json<B: Serialize + ?Sized>(self, body: &B) -> Result<Self> {
        let bytes = serde_json::to_vec(body)?;
        Ok(self
            .header("Content-Type", "application/json")
            .body(Bytes::from(bytes)))
    }
}

/// A fully buffered response
#[derive(Debug, Clone)]
pub struct GraphResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl GraphResponse {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302 | 303 | 307 | 308)
    }

    /// Turn a non-success status into the matching error
    pub fn error_for_status(self) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        let body = String::from_utf8_lossy(&self.body);
        Err(MigrationError::from_status(
            self.status,
            self.header("Retry-After"),
            &body,
        ))
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| {
            MigrationError::InvalidResponse(format!("Failed to decode response body: {}", e))
        })
    }
}

/// Raw HTTP seam, mocked in tests
#[async_trait]
pub trait GraphTransport: Send + Sync {
    async fn send(&self, request: GraphRequest) -> Result<GraphResponse>;
}

/// Hyper-based transport
pub struct HyperTransport<C> {
    client: Client<C, Full<Bytes>>,
    timeout: Duration,
}

impl HyperTransport<hyper_rustls::HttpsConnector<HttpConnector>> {
    /// HTTPS transport trusting the platform's native roots
    pub fn https(timeout: Duration) -> Result<Self> {
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|e| MigrationError::ConfigError(format!("Failed to load TLS roots: {}", e)))?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        Ok(Self::with_connector(connector, timeout))
    }
}

impl<C> HyperTransport<C>
where
    C: Connect + Clone + Send + Sync + 'static,
{
    pub fn with_connector(connector: C, timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Self { client, timeout }
    }
}

#[async_trait]
impl<C> GraphTransport for HyperTransport<C>
where
    C: Connect + Clone + Send + Sync + 'static,
{
    async fn send(&self, request: GraphRequest) -> Result<GraphResponse> {
        let mut builder = hyper::Request::builder()
            .method(request.method)
            .uri(request.url.as_str());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let http_request = builder
            .body(Full::new(request.body.unwrap_or_default()))
            .map_err(|e| MigrationError::NetworkError(format!("Invalid request: {}", e)))?;

        let response = tokio::time::timeout(self.timeout, self.client.request(http_request))
            .await
            .map_err(|_| MigrationError::NetworkError(format!("Request to {} timed out", request.url)))?
            .map_err(|e| MigrationError::NetworkError(e.to_string()))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();

        let body = tokio::time::timeout(self.timeout, response.into_body().collect())
            .await
            .map_err(|_| MigrationError::NetworkError("Reading response body timed out".to_string()))?
            .map_err(|e| MigrationError::NetworkError(e.to_string()))?
            .to_bytes();

        trace!("{} -> {} ({} bytes)", request.url, status, body.len());
        Ok(GraphResponse {
            status,
            headers,
            body,
        })
    }
}

/// Authenticated client bound to one tenant
///
/// A fresh instance is resolved for every job so credentials never outlive
/// the job; the rate limiter inside `retrying` is shared process-wide.
pub struct GraphClient {
    tenant_id: String,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
    transport: Arc<dyn GraphTransport>,
    retrying: RetryingClient,
}

impl std::fmt::Debug for GraphClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphClient")
            .field("tenant_id", &self.tenant_id)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl GraphClient {
    pub fn new(
        tenant_id: impl Into<String>,
        base_url: impl Into<String>,
        tokens: Arc<dyn TokenProvider>,
        transport: Arc<dyn GraphTransport>,
        retrying: RetryingClient,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
            transport,
            retrying,
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn retrying(&self) -> &RetryingClient {
        &self.retrying
    }

    /// Resolve a path against the API base URL; absolute URLs (next links) pass through
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    async fn authorized(&self, request: GraphRequest) -> Result<GraphRequest> {
        let token = self.tokens.token().await?;
        Ok(request.header("Authorization", format!("Bearer {}", token)))
    }

    /// Send a request built by `build`, with auth, status mapping and retries
    pub async fn send<F>(&self, class: ServiceClass, operation_name: &str, build: F) -> Result<GraphResponse>
    where
        F: Fn() -> Result<GraphRequest>,
    {
        let build = &build;
        self.retrying
            .execute(&self.tenant_id, class, operation_name, || async move {
                let request = self.authorized(build()?).await?;
                self.transport.send(request).await?.error_for_status()
            })
            .await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, class: ServiceClass, path: &str) -> Result<T> {
        let url = self.url(path);
        let response = self
            .send(class, "GET", || Ok(GraphRequest::new(Method::GET, url.as_str())))
            .await?;
        response.json()
    }

    pub async fn post_json<B, T>(&self, class: ServiceClass, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.url(path);
        let response = self
            .send(class, "POST", || GraphRequest::new(Method::POST, url.as_str()).json(body))
            .await?;
        response.json()
    }

    /// POST whose response body is not needed (204 or ignored)
    pub async fn post<B: Serialize + ?Sized>(&self, class: ServiceClass, path: &str, body: &B) -> Result<()> {
        let url = self.url(path);
        self.send(class, "POST", || GraphRequest::new(Method::POST, url.as_str()).json(body))
            .await?;
        Ok(())
    }

    pub async fn patch<B: Serialize + ?Sized>(&self, class: ServiceClass, path: &str, body: &B) -> Result<()> {
        let url = self.url(path);
        self.send(class, "PATCH", || GraphRequest::new(Method::PATCH, url.as_str()).json(body))
            .await?;
        Ok(())
    }

    /// PUT raw content with the bearer token (single-shot uploads)
    pub async fn put_content<T: DeserializeOwned>(
        &self,
        class: ServiceClass,
        path: &str,
        content: Bytes,
    ) -> Result<T> {
        let url = self.url(path);
        let response = self
            .send(class, "PUT content", || {
                Ok(GraphRequest::new(Method::PUT, url.as_str())
                    .header("Content-Type", "application/octet-stream")
                    .body(content.clone()))
            })
            .await?;
        response.json()
    }

    /// PUT one chunk to a pre-authenticated upload session URL
    ///
    /// Upload URLs carry their own authorization, so no bearer token is sent.
    pub async fn put_chunk(
        &self,
        class: ServiceClass,
        upload_url: &str,
        range: ByteRange,
        total_size: u64,
        chunk: Bytes,
    ) -> Result<GraphResponse> {
        let chunk = &chunk;
        self.retrying
            .execute(&self.tenant_id, class, "PUT chunk", || async move {
                let request = GraphRequest::new(Method::PUT, upload_url)
                    .header("Content-Length", range.len().to_string())
                    .header("Content-Range", range.content_range(total_size))
                    .body(chunk.clone());
                self.transport.send(request).await?.error_for_status()
            })
            .await
    }

    /// Download content, following one redirect to the pre-authenticated location
    pub async fn download(
        &self,
        class: ServiceClass,
        path: &str,
        range: Option<ByteRange>,
    ) -> Result<Bytes> {
        let url = self.url(path);
        let url = url.as_str();
        self.retrying
            .execute(&self.tenant_id, class, "GET content", || async move {
                let mut request = GraphRequest::new(Method::GET, url);
                if let Some(range) = range {
                    request = request.header("Range", range.range_header());
                }
                let response = self.transport.send(self.authorized(request).await?).await?;

                let response = if response.is_redirect() {
                    let location = response.header("Location").ok_or_else(|| {
                        MigrationError::InvalidResponse("Redirect without Location header".to_string())
                    })?;
                    let mut follow = GraphRequest::new(Method::GET, location);
                    if let Some(range) = range {
                        follow = follow.header("Range", range.range_header());
                    }
                    self.transport.send(follow).await?
                } else {
                    response
                };

                Ok(response.error_for_status()?.body)
            })
            .await
    }
}
