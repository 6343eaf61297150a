//! Upload module
//!
//! Uploads an object through pre-signed URLs, either with a single PUT or, above
//! the multipart threshold, as an S3 multipart upload whose parts travel
//! concurrently.
//!
//! ```text
//! UploadCoordinator::end()
//!   ├── len <= threshold ──> DirectPut
//!   └── len >  threshold ──> MultipartSession
//!                              ├── planner::plan()
//!                              ├── N x PartTransfer (concurrent)
//!                              └── CompleteMultipartUpload
//! ```

use crate::config::{ConfigError, ProgressAggregation};
use crate::signer::{SignError, SignRequest, Signer};
use crate::transport::{Transport, TransportError};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

pub mod coordinator;
pub mod multipart;
pub mod part;
pub mod planner;
pub mod put_object;
pub mod source;
pub mod xml;

pub use coordinator::{UploadCoordinator, UploadCoordinatorBuilder};
pub use multipart::{MultipartSession, SessionStatus};
pub use part::{PartDescriptor, PartStatus, PartTransfer};
pub use source::{FileSource, ObjectSource};

/// Upload errors
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Signing failed: {0}")]
    Sign(#[from] SignError),

    #[error("Transport failed: {0}")]
    Transport(TransportError),

    #[error("Store returned {status}: {body}")]
    Store { status: u16, body: String },

    #[error("No UploadId in response")]
    SessionIdMissing,

    #[error("Malformed store response: {0}")]
    MalformedResponse(String),

    #[error("Invalid part plan: {0}")]
    InvalidPlan(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Upload aborted")]
    Aborted,

    #[error("Upload already started")]
    AlreadyStarted,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Part task failed: {0}")]
    Task(String),
}

impl From<TransportError> for UploadError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Cancelled => UploadError::Aborted,
            other => UploadError::Transport(other),
        }
    }
}

impl UploadError {
    /// HTTP status carried by the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            UploadError::Store { status, .. } => Some(*status),
            UploadError::Sign(e) => e.status(),
            _ => None,
        }
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            UploadError::Sign(_) => "sign",
            UploadError::Transport(_) => "transport",
            UploadError::Store { .. } => "store",
            UploadError::SessionIdMissing => "session_id_missing",
            UploadError::MalformedResponse(_) => "malformed_response",
            UploadError::InvalidPlan(_) => "invalid_plan",
            UploadError::IoError(_) => "io",
            UploadError::Aborted => "aborted",
            UploadError::AlreadyStarted => "already_started",
            UploadError::Config(_) => "config",
            UploadError::Task(_) => "task",
        }
    }

    /// Whether a part attempt that failed this way may be tried again
    pub fn is_retryable(&self) -> bool {
        match self {
            UploadError::Transport(TransportError::Network(_))
            | UploadError::Transport(TransportError::Timeout) => true,
            UploadError::Store { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// Progress of a single request body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSample {
    pub loaded: u64,
    pub total: u64,
}

impl ProgressSample {
    pub fn new(loaded: u64, total: u64) -> Self {
        Self { loaded, total }
    }

    /// A sample for a fully transferred body
    pub fn complete(total: u64) -> Self {
        Self::new(total, total)
    }

    /// `loaded / total * 100`; an empty body counts as done
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.loaded as f64 / self.total as f64 * 100.0
    }
}

/// Events observable by the caller of an upload
///
/// Every attempt ends with exactly one terminal event (`End` or `Error`),
/// optionally preceded by `Abort`.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    Progress { loaded: u64, total: u64, percent: f64 },
    Error { message: String, status: Option<u16> },
    Abort,
    End,
}

impl UploadEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadEvent::Error { .. } | UploadEvent::End)
    }
}

/// Fan-out of upload events to every subscriber
///
/// Once a terminal event has gone out, the sink stays silent.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    subscribers: Arc<Mutex<Vec<UnboundedSender<UploadEvent>>>>,
    finished: Arc<AtomicBool>,
}

impl EventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new receiver
    pub fn subscribe(&self) -> UnboundedReceiver<UploadEvent> {
        let (tx, rx) = unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    fn emit(&self, event: UploadEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn progress(&self, loaded: u64, total: u64, percent: f64) {
        if self.is_finished() {
            return;
        }
        self.emit(UploadEvent::Progress {
            loaded,
            total,
            percent: percent.clamp(0.0, 100.0),
        });
    }

    pub fn abort(&self) {
        if self.is_finished() {
            return;
        }
        self.emit(UploadEvent::Abort);
    }

    /// Emit the terminal event for `result`; later calls are ignored
    pub fn finish<T>(&self, result: &Result<T, UploadError>) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        let event = match result {
            Ok(_) => UploadEvent::End,
            Err(e) => UploadEvent::Error {
                message: e.to_string(),
                status: e.status(),
            },
        };
        self.emit(event);
    }
}

/// Bounded retry for part uploads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Fail on the first error
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Duration::ZERO,
        }
    }

    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Delay before retry number `attempt` (0-based): `backoff * 2^attempt`
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// Result of a successful upload
#[derive(Debug, Clone)]
pub struct UploadResult {
    pub etag: Option<String>,
    pub version_id: Option<String>,
    pub bytes_written: u64,
    pub parts_count: usize,
    /// Multipart session id, absent for direct uploads
    pub upload_id: Option<String>,
}

/// Immutable per-upload configuration
#[derive(Clone)]
pub struct UploadJob {
    pub object: Arc<dyn ObjectSource>,
    pub name: String,
    pub content_type: String,
    pub acl: String,
    pub headers: BTreeMap<String, String>,
    pub multipart_threshold: u64,
    pub max_parts: usize,
    pub concurrent_parts: Option<NonZeroUsize>,
    pub retry: RetryPolicy,
    pub progress: ProgressAggregation,
    pub sign_expires: Option<Duration>,
    /// Upper bound on the remote abort after failure or cancellation
    pub abort_timeout: Duration,
}

impl UploadJob {
    pub fn object_len(&self) -> u64 {
        self.object.len()
    }

    /// Whether the object is large enough to go multipart
    pub fn is_multipart(&self) -> bool {
        self.object_len() > self.multipart_threshold
    }

    /// Apply the configured URL lifetime to a sign request
    pub fn sign_request(&self, request: SignRequest) -> SignRequest {
        request.with_expires(self.sign_expires)
    }
}

impl std::fmt::Debug for UploadJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadJob")
            .field("name", &self.name)
            .field("content_type", &self.content_type)
            .field("len", &self.object_len())
            .field("acl", &self.acl)
            .field("multipart_threshold", &self.multipart_threshold)
            .field("max_parts", &self.max_parts)
            .finish_non_exhaustive()
    }
}

/// Collaborators shared by every step of one upload
#[derive(Clone)]
pub struct UploadContext {
    pub job: Arc<UploadJob>,
    pub signer: Arc<dyn Signer>,
    pub transport: Arc<dyn Transport>,
    pub events: EventSink,
}

impl UploadContext {
    pub fn new(
        job: UploadJob,
        signer: Arc<dyn Signer>,
        transport: Arc<dyn Transport>,
        events: EventSink,
    ) -> Self {
        Self {
            job: Arc::new(job),
            signer,
            transport,
            events,
        }
    }
}
