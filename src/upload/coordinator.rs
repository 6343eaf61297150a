//! Upload coordinator
//!
//! Entry point for uploading one object. Decides between a direct PUT and a
//! multipart session from the object size and owns the caller-facing
//! configuration.
//!
//! # Example
//!
//! ```no_run
//! use presign_uploadr::config::Config;
//! use presign_uploadr::upload::{FileSource, UploadCoordinator};
//! use std::sync::Arc;
//!
//! # async fn example(config: Config) -> Result<(), Box<dyn std::error::Error>> {
//! let object = Arc::new(FileSource::open("video.mp4").await?);
//! let mut upload = UploadCoordinator::builder(object)
//!     .from_config(&config)?
//!     .build()?;
//! upload.set("Cache-Control", "max-age=3600");
//!
//! let mut events = upload.subscribe();
//! tokio::spawn(async move {
//!     while let Some(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//! });
//!
//! let result = upload.end().await?;
//! println!("Uploaded {} bytes in {} parts", result.bytes_written, result.parts_count);
//! # Ok(())
//! # }
//! ```

use super::multipart::{MultipartSession, SessionStatus};
use super::put_object::DirectPut;
use super::{
    EventSink, ObjectSource, RetryPolicy, UploadContext, UploadError, UploadEvent, UploadJob,
    UploadResult,
};
use crate::config::{Config, ConfigError, ProgressAggregation, UploadConfig};
use crate::signer::{HttpSigner, Signer};
use crate::transport::{ReqwestTransport, Transport};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Finished,
}

/// Uploads one object through pre-signed URLs
pub struct UploadCoordinator {
    job: UploadJob,
    signer: Arc<dyn Signer>,
    transport: Arc<dyn Transport>,
    events: EventSink,
    cancel: CancellationToken,
    phase: Mutex<Phase>,
    /// Live multipart session, so `abort()` can go through it
    session: Mutex<Option<Arc<MultipartSession>>>,
    attempt_id: Uuid,
}

impl UploadCoordinator {
    /// Start configuring an upload of `object`
    pub fn builder(object: Arc<dyn ObjectSource>) -> UploadCoordinatorBuilder {
        UploadCoordinatorBuilder::new(object)
    }

    /// Add or replace a transport header sent with the object (chainable)
    ///
    /// Headers go out on the direct PUT and on the multipart initiate call.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.job.headers.insert(name.into(), value.into());
        self
    }

    /// Register for upload events
    pub fn subscribe(&self) -> UnboundedReceiver<UploadEvent> {
        self.events.subscribe()
    }

    pub fn job(&self) -> &UploadJob {
        &self.job
    }

    /// Identifier of this attempt, attached to its logs
    pub fn attempt_id(&self) -> Uuid {
        self.attempt_id
    }

    /// Whether `end()` will take the multipart path
    pub fn is_multipart(&self) -> bool {
        self.job.is_multipart()
    }

    /// Run the upload
    ///
    /// Only one attempt per coordinator: a second call fails with
    /// [`UploadError::AlreadyStarted`] and emits nothing.
    #[tracing::instrument(
        name = "upload",
        skip(self),
        fields(
            upload.id = %self.attempt_id,
            object.name = %self.job.name,
            upload.bytes = self.job.object_len(),
            upload.multipart = self.job.is_multipart()
        )
    )]
    pub async fn end(&self) -> Result<UploadResult, UploadError> {
        {
            let mut phase = self.phase.lock();
            if *phase != Phase::Idle {
                return Err(UploadError::AlreadyStarted);
            }
            *phase = Phase::Running;
        }

        let ctx = UploadContext::new(
            self.job.clone(),
            self.signer.clone(),
            self.transport.clone(),
            self.events.clone(),
        );

        let result = if self.job.is_multipart() {
            tracing::debug!(
                threshold = self.job.multipart_threshold,
                max_parts = self.job.max_parts,
                "Using multipart upload"
            );
            let session = Arc::new(MultipartSession::new(ctx, self.cancel.clone()));
            *self.session.lock() = Some(session.clone());
            session.end().await
        } else {
            DirectPut::new(ctx, self.cancel.clone()).run().await
        };

        *self.phase.lock() = Phase::Finished;
        result
    }

    /// Abort the upload
    ///
    /// Before `end()` this only emits `abort`; while running it also cancels
    /// every in-flight request; after the upload finished it does nothing.
    pub fn abort(&self) {
        match *self.phase.lock() {
            Phase::Idle => self.events.abort(),
            Phase::Running => {
                tracing::info!(upload.id = %self.attempt_id, "Aborting upload");
                match self.session.lock().as_ref() {
                    Some(session) => session.abort(),
                    None => {
                        self.events.abort();
                        self.cancel.cancel();
                    }
                }
            }
            Phase::Finished => {}
        }
    }

    /// Status of the multipart session, once one has been started
    pub fn session_status(&self) -> Option<SessionStatus> {
        self.session.lock().as_ref().map(|session| session.status())
    }
}

/// Builder for [`UploadCoordinator`]
pub struct UploadCoordinatorBuilder {
    object: Arc<dyn ObjectSource>,
    name: Option<String>,
    content_type: Option<String>,
    acl: String,
    headers: BTreeMap<String, String>,
    multipart_threshold: u64,
    max_parts: usize,
    concurrent_parts: Option<NonZeroUsize>,
    retry: RetryPolicy,
    progress: ProgressAggregation,
    sign_expires: Option<Duration>,
    abort_timeout: Duration,
    signer: Option<Arc<dyn Signer>>,
    transport: Option<Arc<dyn Transport>>,
}

impl UploadCoordinatorBuilder {
    fn new(object: Arc<dyn ObjectSource>) -> Self {
        let mut builder = Self {
            object,
            name: None,
            content_type: None,
            acl: String::new(),
            headers: BTreeMap::new(),
            multipart_threshold: 0,
            max_parts: 0,
            concurrent_parts: None,
            retry: RetryPolicy::none(),
            progress: ProgressAggregation::default(),
            sign_expires: None,
            abort_timeout: Duration::ZERO,
            signer: None,
            transport: None,
        };
        builder.apply_upload_config(&UploadConfig::default());
        builder
    }

    fn apply_upload_config(&mut self, config: &UploadConfig) {
        self.acl = config.acl.clone();
        self.headers.extend(config.headers.clone());
        self.multipart_threshold = config.multipart_threshold;
        self.max_parts = config.max_parts;
        self.concurrent_parts = config.concurrency_limit();
        self.retry = RetryPolicy::new(config.part_retries, config.retry_backoff());
        self.progress = config.progress;
        self.abort_timeout = config.abort_timeout();
    }

    /// Apply a validated configuration, creating the HTTP signer and transport
    pub fn from_config(mut self, config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;
        self.apply_upload_config(&config.upload);
        self.sign_expires = config.signer.expires();

        let signer = HttpSigner::new(&config.signer)
            .map_err(|e| ConfigError::ValidationError(format!("signer: {}", e)))?;
        let transport = ReqwestTransport::new(&config.transport)
            .map_err(|e| ConfigError::ValidationError(format!("transport: {}", e)))?;

        self.signer = Some(Arc::new(signer));
        self.transport = Some(Arc::new(transport));
        Ok(self)
    }

    /// Remote object name; defaults to the source's name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Object content type; defaults to the source's guessed type
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn acl(mut self, acl: impl Into<String>) -> Self {
        self.acl = acl.into();
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Objects strictly larger than this go multipart
    pub fn multipart_threshold(mut self, bytes: u64) -> Self {
        self.multipart_threshold = bytes;
        self
    }

    pub fn max_parts(mut self, max_parts: usize) -> Self {
        self.max_parts = max_parts;
        self
    }

    pub fn concurrent_parts(mut self, limit: Option<NonZeroUsize>) -> Self {
        self.concurrent_parts = limit;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn progress(mut self, progress: ProgressAggregation) -> Self {
        self.progress = progress;
        self
    }

    pub fn sign_expires(mut self, expires: Option<Duration>) -> Self {
        self.sign_expires = expires;
        self
    }

    /// Bound on the remote abort issued after a failure or `abort()`
    pub fn abort_timeout(mut self, timeout: Duration) -> Self {
        self.abort_timeout = timeout;
        self
    }

    pub fn signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Build the coordinator, naming the first missing field
    pub fn build(self) -> Result<UploadCoordinator, ConfigError> {
        let signer = self.signer.ok_or(ConfigError::MissingField("signer"))?;
        let transport = self.transport.ok_or(ConfigError::MissingField("transport"))?;

        let name = self
            .name
            .or_else(|| self.object.name().map(str::to_string))
            .filter(|name| !name.trim().is_empty())
            .ok_or(ConfigError::MissingField("name"))?;
        let content_type = self
            .content_type
            .or_else(|| self.object.content_type().map(str::to_string))
            .filter(|content_type| !content_type.trim().is_empty())
            .ok_or(ConfigError::MissingField("content_type"))?;

        if self.acl.trim().is_empty() {
            return Err(ConfigError::MissingField("acl"));
        }
        if self.max_parts == 0 {
            return Err(ConfigError::ValidationError(
                "max_parts must be at least 1".into(),
            ));
        }

        let job = UploadJob {
            object: self.object,
            name,
            content_type,
            acl: self.acl,
            headers: self.headers,
            multipart_threshold: self.multipart_threshold,
            max_parts: self.max_parts,
            concurrent_parts: self.concurrent_parts,
            retry: self.retry,
            progress: self.progress,
            sign_expires: self.sign_expires,
            abort_timeout: self.abort_timeout,
        };

        Ok(UploadCoordinator {
            job,
            signer,
            transport,
            events: EventSink::new(),
            cancel: CancellationToken::new(),
            phase: Mutex::new(Phase::Idle),
            session: Mutex::new(None),
            attempt_id: Uuid::new_v4(),
        })
    }
}
