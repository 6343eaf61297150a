//! Store transport
//!
//! Performs exactly one HTTP request against a signed URL and reports upload
//! progress while the body is being sent. Retries, signing and interpretation
//! of the response belong to the callers in [`crate::upload`].

use crate::config::TransportConfig;
use crate::upload::ProgressSample;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::CONTENT_LENGTH;
use reqwest::Method;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Callback invoked on every progress tick of a request body
pub type ProgressCallback = Arc<dyn Fn(ProgressSample) + Send + Sync>;

/// Transport errors
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Request cancelled")]
    Cancelled,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else if e.is_builder() {
            TransportError::InvalidRequest(e.to_string())
        } else {
            TransportError::Network(e.to_string())
        }
    }
}

/// A single request against a signed URL
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl TransportRequest {
    pub fn new(method: Method, url: impl Into<String>, body: Bytes) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body,
        }
    }

    pub fn put(url: impl Into<String>, body: Bytes) -> Self {
        Self::new(Method::PUT, url, body)
    }

    pub fn post(url: impl Into<String>, body: Bytes) -> Self {
        Self::new(Method::POST, url, body)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::DELETE, url, Bytes::new())
    }

    /// Append a header (chainable)
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Value of a header previously added, case-insensitive
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Response of a store request
#[derive(Debug, Clone, Default)]
pub struct TransportResponse {
    pub status: u16,
    /// Header names are lowercase
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl TransportResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Check for a 2xx status
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn etag(&self) -> Option<&str> {
        self.header("etag").filter(|etag| !etag.is_empty())
    }
}

/// Performs single HTTP requests with progress reporting
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send the request, resolving early with [`TransportError::Cancelled`]
    /// once `cancel` fires.
    async fn send(
        &self,
        request: TransportRequest,
        progress: Option<ProgressCallback>,
        cancel: CancellationToken,
    ) -> Result<TransportResponse, TransportError>;
}

/// Transport backed by `reqwest`
pub struct ReqwestTransport {
    client: reqwest::Client,
    chunk_size: usize,
}

impl ReqwestTransport {
    /// Create a new transport
    pub fn new(config: &TransportConfig) -> Result<Self, TransportError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.timeout() {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;

        Ok(Self {
            client,
            chunk_size: config.chunk_size.max(1),
        })
    }

    /// Get the body chunk size
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

/// Wrap `body` in a stream that reports each chunk as it is handed to the
/// connection.
fn progress_body(body: Bytes, chunk_size: usize, progress: ProgressCallback) -> reqwest::Body {
    let total = body.len() as u64;
    let len = body.len();
    let chunks = (0..len)
        .step_by(chunk_size)
        .map(move |start| body.slice(start..usize::min(start + chunk_size, len)));

    let mut loaded = 0u64;
    let stream = futures::stream::iter(chunks).map(move |chunk| {
        loaded += chunk.len() as u64;
        progress(ProgressSample::new(loaded, total));
        Ok::<_, std::io::Error>(chunk)
    });

    reqwest::Body::wrap_stream(stream)
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(
        &self,
        request: TransportRequest,
        progress: Option<ProgressCallback>,
        cancel: CancellationToken,
    ) -> Result<TransportResponse, TransportError> {
        let mut builder = self.client.request(request.method.clone(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let body = match progress {
            Some(progress) if !request.body.is_empty() => {
                // Streaming bodies lose their length; stores reject chunked PUTs.
                builder = builder.header(CONTENT_LENGTH, request.body.len());
                progress_body(request.body, self.chunk_size, progress)
            }
            _ => reqwest::Body::from(request.body),
        };

        let exchange = async {
            let response = builder.body(body).send().await?;
            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|value| (name.as_str().to_ascii_lowercase(), value.to_string()))
                })
                .collect();
            let body = response.text().await?;

            Ok::<_, TransportError>(TransportResponse {
                status,
                headers,
                body,
            })
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(method = %request.method, "Request cancelled in flight");
                Err(TransportError::Cancelled)
            }
            result = exchange => result,
        }
    }
}
