//! Signing collaborator
//!
//! Every store operation runs against a short-lived URL issued by an external
//! signing route. The route is called with `GET <endpoint>?name=&mime=&method=`
//! plus an optional `query` parameter that selects the multipart
//! sub-operation, and answers with the signed URL as plain text.
//!
//! | Operation | Method | Extra query |
//! |-----------|--------|-------------|
//! | PutObject | `PUT` | - |
//! | CreateMultipartUpload | `POST` | `?uploads` |
//! | UploadPart | `PUT` | `?partNumber=<n>&uploadId=<id>` |
//! | CompleteMultipartUpload | `POST` | `?uploadId=<id>` |
//! | AbortMultipartUpload | `DELETE` | `?uploadId=<id>` |
//!
//! # Example
//!
//! ```no_run
//! use presign_uploadr::config::SignerConfig;
//! use presign_uploadr::signer::{HttpSigner, SignRequest, Signer};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let signer = HttpSigner::new(&SignerConfig {
//!     endpoint: "http://localhost:4000/sign".into(),
//!     expires_seconds: None,
//!     timeout_seconds: 30,
//! })?;
//!
//! let url = signer.sign(&SignRequest::put_object("photo.jpg", "image/jpeg")).await?;
//! println!("PUT to {}", url);
//! # Ok(())
//! # }
//! ```

use crate::config::SignerConfig;
use crate::metrics;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Content type used for every part upload
pub const PART_CONTENT_TYPE: &str = "application/octet-stream";

/// Content type of the completion body
pub const COMPLETE_CONTENT_TYPE: &str = "application/xml";

/// Signing errors
#[derive(Error, Debug, Clone)]
pub enum SignError {
    #[error("Signing endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("Signing endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Signing endpoint returned an invalid URL: {0:?}")]
    InvalidUrl(String),
}

impl SignError {
    /// HTTP status reported by the signing endpoint, if it answered at all
    pub fn status(&self) -> Option<u16> {
        match self {
            SignError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// HTTP method the signed URL authorizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignMethod {
    Put,
    Post,
    Delete,
}

impl SignMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignMethod::Put => "PUT",
            SignMethod::Post => "POST",
            SignMethod::Delete => "DELETE",
        }
    }
}

/// The store operation a signed URL is requested for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignOperation {
    PutObject,
    CreateMultipartUpload,
    UploadPart { part_number: u32, upload_id: String },
    CompleteMultipartUpload { upload_id: String },
    AbortMultipartUpload { upload_id: String },
}

impl SignOperation {
    /// Short label used for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            SignOperation::PutObject => "put_object",
            SignOperation::CreateMultipartUpload => "create_multipart_upload",
            SignOperation::UploadPart { .. } => "upload_part",
            SignOperation::CompleteMultipartUpload { .. } => "complete_multipart_upload",
            SignOperation::AbortMultipartUpload { .. } => "abort_multipart_upload",
        }
    }

    pub fn method(&self) -> SignMethod {
        match self {
            SignOperation::PutObject | SignOperation::UploadPart { .. } => SignMethod::Put,
            SignOperation::CreateMultipartUpload
            | SignOperation::CompleteMultipartUpload { .. } => SignMethod::Post,
            SignOperation::AbortMultipartUpload { .. } => SignMethod::Delete,
        }
    }

    /// Sub-resource query appended to the object URL, including the leading `?`
    pub fn query(&self) -> Option<String> {
        match self {
            SignOperation::PutObject => None,
            SignOperation::CreateMultipartUpload => Some("?uploads".to_string()),
            SignOperation::UploadPart {
                part_number,
                upload_id,
            } => Some(format!(
                "?partNumber={}&uploadId={}",
                part_number, upload_id
            )),
            SignOperation::CompleteMultipartUpload { upload_id }
            | SignOperation::AbortMultipartUpload { upload_id } => {
                Some(format!("?uploadId={}", upload_id))
            }
        }
    }
}

/// A request for one signed URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignRequest {
    pub name: String,
    pub mime: String,
    pub operation: SignOperation,
    pub expires: Option<Duration>,
}

impl SignRequest {
    pub fn new(name: impl Into<String>, mime: impl Into<String>, operation: SignOperation) -> Self {
        Self {
            name: name.into(),
            mime: mime.into(),
            operation,
            expires: None,
        }
    }

    pub fn put_object(name: impl Into<String>, mime: impl Into<String>) -> Self {
        Self::new(name, mime, SignOperation::PutObject)
    }

    pub fn create_multipart_upload(name: impl Into<String>, mime: impl Into<String>) -> Self {
        Self::new(name, mime, SignOperation::CreateMultipartUpload)
    }

    pub fn upload_part(name: impl Into<String>, part_number: u32, upload_id: &str) -> Self {
        Self::new(
            name,
            PART_CONTENT_TYPE,
            SignOperation::UploadPart {
                part_number,
                upload_id: upload_id.to_string(),
            },
        )
    }

    pub fn complete_multipart_upload(name: impl Into<String>, upload_id: &str) -> Self {
        Self::new(
            name,
            COMPLETE_CONTENT_TYPE,
            SignOperation::CompleteMultipartUpload {
                upload_id: upload_id.to_string(),
            },
        )
    }

    pub fn abort_multipart_upload(name: impl Into<String>, upload_id: &str) -> Self {
        Self::new(
            name,
            "",
            SignOperation::AbortMultipartUpload {
                upload_id: upload_id.to_string(),
            },
        )
    }

    /// Ask the signer for a specific URL lifetime
    pub fn with_expires(mut self, expires: Option<Duration>) -> Self {
        self.expires = expires;
        self
    }

    /// Query parameters sent to the signing route
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("name", self.name.clone()),
            ("mime", self.mime.clone()),
            ("method", self.operation.method().as_str().to_string()),
        ];
        if let Some(query) = self.operation.query() {
            pairs.push(("query", query));
        }
        if let Some(expires) = self.expires {
            pairs.push(("expires", expires.as_secs().to_string()));
        }
        pairs
    }
}

/// Issues pre-signed URLs
#[async_trait]
pub trait Signer: Send + Sync {
    /// Resolve a signed URL for the request
    async fn sign(&self, request: &SignRequest) -> Result<String, SignError>;
}

/// Signer backed by an HTTP signing route
pub struct HttpSigner {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpSigner {
    /// Create a new HTTP signer
    pub fn new(config: &SignerConfig) -> Result<Self, SignError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| SignError::Unreachable(e.to_string()))?;

        Ok(Self {
            endpoint: config.endpoint.clone(),
            client,
        })
    }

    /// Get the signing endpoint URL
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Signer for HttpSigner {
    #[tracing::instrument(
        name = "signer.sign",
        skip(self, request),
        fields(
            sign.operation = request.operation.label(),
            sign.method = request.operation.method().as_str(),
            object.name = %request.name,
            http.status_code = tracing::field::Empty
        ),
        err
    )]
    async fn sign(&self, request: &SignRequest) -> Result<String, SignError> {
        let operation = request.operation.label();

        let response = self
            .client
            .get(&self.endpoint)
            .query(&request.query_pairs())
            .send()
            .await
            .map_err(|e| {
                metrics::record_sign_request(operation, false);
                SignError::Unreachable(e.to_string())
            })?;

        let status = response.status();
        tracing::Span::current().record("http.status_code", status.as_u16());

        let body = response.text().await.map_err(|e| {
            metrics::record_sign_request(operation, false);
            SignError::Unreachable(e.to_string())
        })?;

        if !status.is_success() {
            metrics::record_sign_request(operation, false);
            return Err(SignError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let url = body.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            metrics::record_sign_request(operation, false);
            return Err(SignError::InvalidUrl(url.to_string()));
        }

        metrics::record_sign_request(operation, true);
        tracing::debug!(operation = operation, "Signed URL issued");

        Ok(url.to_string())
    }
}
