//! HTTP capability handed to elements
//!
//! Elements never build their own HTTP clients. A single `Api` object is
//! injected per flow and shared by reference across every element, so it
//! must be stateless per call. `HttpApi` is the reqwest-backed default;
//! tests inject their own implementation.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use thiserror::Error;

/// Errors from the HTTP capability
#[derive(Error, Debug)]
pub enum ApiError {
    /// The server answered with a non-success status
    #[error("{status} {status_text}: {method} request to {url} failed\n{body}")]
    Status {
        /// Numeric status code
        status: u16,
        /// Canonical reason phrase
        status_text: String,
        /// Upper-case HTTP method
        method: String,
        /// Request URL
        url: String,
        /// Response body, pretty-printed when it was JSON
        body: String,
    },

    /// The request could not be sent or the response could not be read
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// No access token could be obtained
    #[error("Access token unavailable: {0}")]
    Token(String),
}

impl ApiError {
    /// Build a status error from the parts of a failed response
    pub fn status(
        status: StatusCode,
        method: &Method,
        url: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self::Status {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            method: method.as_str().to_uppercase(),
            url: url.into(),
            body: body.into(),
        }
    }

    /// Status code, if the server answered at all
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Request(err) => err.status().map(|s| s.as_u16()),
            Self::Token(_) => None,
        }
    }
}

/// Source of bearer credentials for API calls
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Return a currently valid access token
    async fn access_token(&self) -> Result<String, ApiError>;
}

/// A fixed token, e.g. read from the environment
#[derive(Clone, Debug)]
pub struct StaticToken(String);

impl StaticToken {
    /// Wrap a token
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self) -> Result<String, ApiError> {
        if self.0.is_empty() {
            return Err(ApiError::Token("empty token".to_string()));
        }
        Ok(self.0.clone())
    }
}

/// CRUD-style capability object injected into elements
#[async_trait]
pub trait Api: Send + Sync {
    /// GET `path`
    async fn get(&self, path: &str) -> Result<Value, ApiError>;

    /// POST `body` to `path`
    async fn post(&self, path: &str, body: Value) -> Result<Value, ApiError>;

    /// PUT `body` to `path`
    async fn put(&self, path: &str, body: Value) -> Result<Value, ApiError>;

    /// DELETE `path`
    async fn delete(&self, path: &str) -> Result<Value, ApiError>;

    /// Current access token
    async fn access_token(&self) -> Result<String, ApiError>;
}

/// reqwest-backed `Api` that resolves paths against a base URL
#[derive(Clone)]
pub struct HttpApi {
    client: Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpApi {
    /// Create an API client for `base_url`
    pub fn new(base_url: impl Into<String>, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
        }
    }

    /// Use a preconfigured client (timeouts, proxies, ...)
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    async fn send(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, ApiError> {
        let url = self.url(path);
        let token = self.tokens.access_token().await?;

        let mut request = self.client.request(method.clone(), &url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            tracing::debug!(status = status.as_u16(), url = %url, "API request failed");
            return Err(ApiError::status(status, &method, url, pretty_body(&text)));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

impl std::fmt::Debug for HttpApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpApi")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[async_trait]
impl Api for HttpApi {
    async fn get(&self, path: &str) -> Result<Value, ApiError> {
        self.send(Method::GET, path, None).await
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, ApiError> {
        self.send(Method::POST, path, Some(body)).await
    }

    async fn put(&self, path: &str, body: Value) -> Result<Value, ApiError> {
        self.send(Method::PUT, path, Some(body)).await
    }

    async fn delete(&self, path: &str) -> Result<Value, ApiError> {
        self.send(Method::DELETE, path, None).await
    }

    async fn access_token(&self) -> Result<String, ApiError> {
        self.tokens.access_token().await
    }
}

fn pretty_body(text: &str) -> String {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| serde_json::to_string_pretty(&v).ok())
        .unwrap_or_else(|| text.to_string())
}
