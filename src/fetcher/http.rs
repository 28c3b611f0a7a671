//! HTTP adapter for the remote API
//!
//! [`ApiHttpClient`] performs exactly one exchange per call and reports the
//! result as an [`AttemptReport`]; it never retries. Retrying, rate limiting
//! and timeouts around it belong to the scheduler and the paginator.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, RETRY_AFTER};
use reqwest::{Client, Method, Response, Url};
use secrecy::ExposeSecret;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::engine::scheduler::Operation;
use crate::engine::{EngineConfig, EngineError};
use crate::{AttemptReport, NetworkErrorKind, WorkItem};

/// One HTTP exchange to perform for a work item
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    /// HTTP method
    pub method: Method,
    /// Path relative to the base URL, or an absolute URL
    pub path: String,
    /// Query parameters
    pub query: Vec<(String, String)>,
    /// JSON body
    pub body: Option<Value>,
}

impl ApiRequest {
    /// Request with `method` and `path`
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    /// GET request
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// Add a query parameter
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Set the JSON body
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Authenticated JSON client bound to one base URL
#[derive(Debug, Clone)]
pub struct ApiHttpClient {
    client: Client,
    base_url: String,
}

impl ApiHttpClient {
    /// Build a client from the run configuration
    ///
    /// Sends `Accept: application/json` and, when a token is configured, a
    /// bearer `Authorization` header marked sensitive so it never shows in
    /// debug output.
    ///
    /// # Errors
    /// Returns `EngineError::HttpClientError` if the token is not a valid
    /// header value or the TLS backend cannot be initialised
    pub fn from_config(config: &EngineConfig) -> Result<Self, EngineError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(token) = &config.token {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
                .map_err(|_| {
                    EngineError::HttpClientError(
                        "API token contains characters not allowed in a header".to_string(),
                    )
                })?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| EngineError::HttpClientError(e.to_string()))?;

        Ok(Self::with_client(client, &config.base_url))
    }

    /// Wrap an existing reqwest client
    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Base URL without trailing slash
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Resolve `path` against the base URL; absolute URLs pass through.
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Resolve a link the server handed back, relative or absolute.
    pub fn resolve_link(&self, link: &str) -> String {
        if link.starts_with("http://") || link.starts_with("https://") {
            return link.to_string();
        }
        match Url::parse(&self.base_url).and_then(|base| base.join(link)) {
            Ok(url) if link.starts_with('/') => url.to_string(),
            _ => self.url_for(link),
        }
    }

    /// Send `request` once.
    ///
    /// Only 2xx responses come back as `Ok`; everything else, transport
    /// failures included, is turned into an [`AttemptReport`].
    pub async fn send(&self, request: &ApiRequest) -> Result<Response, AttemptReport> {
        let url = self.url_for(&request.path);
        debug!(method = %request.method, url = %url, "Sending request");

        let mut builder = self.client.request(request.method.clone(), &url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(network_report)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_retry_after(v, Utc::now()));
        let body = response.text().await.unwrap_or_default();
        let body = body.trim();
        debug!(status = status.as_u16(), retry_after = ?retry_after, "Request failed");

        Err(AttemptReport::Response {
            status: status.as_u16(),
            retry_after,
            message: (!body.is_empty()).then(|| body.to_string()),
        })
    }

    /// Send `request` once and decode the JSON body of a 2xx response.
    pub async fn get_json(&self, request: &ApiRequest) -> Result<Value, AttemptReport> {
        let response = self.send(request).await?;
        response
            .json::<Value>()
            .await
            .map_err(|e| AttemptReport::Invalid(format!("invalid JSON response: {}", e)))
    }
}

fn network_report(error: reqwest::Error) -> AttemptReport {
    let kind = if error.is_timeout() {
        NetworkErrorKind::Timeout
    } else if error.is_connect() {
        NetworkErrorKind::Connect
    } else {
        NetworkErrorKind::Other
    };
    AttemptReport::Network {
        kind,
        message: format!("network error: {}", error),
    }
}

/// Parse a `Retry-After` value: delta seconds or an HTTP date.
///
/// Dates in the past yield a zero wait.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    Some(
        at.with_timezone(&Utc)
            .signed_duration_since(now)
            .to_std()
            .unwrap_or(Duration::ZERO),
    )
}

/// [`Operation`] that performs one [`ApiRequest`] per attempt
pub struct HttpOperation {
    client: Arc<ApiHttpClient>,
}

impl HttpOperation {
    /// Operation over a shared client
    pub fn new(client: Arc<ApiHttpClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Operation<ApiRequest> for HttpOperation {
    async fn execute(&self, item: &WorkItem<ApiRequest>) -> AttemptReport {
        match self.client.send(&item.payload).await {
            Ok(response) => AttemptReport::status(response.status().as_u16()),
            Err(report) => report,
        }
    }
}
