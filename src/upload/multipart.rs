//! Multipart upload session
//!
//! Drives one S3 multipart upload through pre-signed URLs:
//!
//! ```text
//! Initiating ──> Uploading ──> Completing ──> Done
//!     │              │              │
//!     └──────────────┴──────────────┴──> Failed
//!
//! any non-terminal state ──abort()──> Aborted
//! ```
//!
//! Parts run concurrently as tokio tasks. They never touch the session state;
//! progress arrives over a channel and outcomes through the task join, and
//! only the session's own step functions mutate [`SessionState`].

use super::part::{CompletedPart, PartDescriptor, PartOutcome, PartReport, PartStatus, PartTransfer};
use super::{planner, xml, ProgressSample, UploadContext, UploadError, UploadResult};
use crate::config::ProgressAggregation;
use crate::metrics;
use crate::signer::SignRequest;
use crate::transport::{TransportError, TransportRequest};
use bytes::Bytes;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Overall status of a multipart session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Initiating,
    Uploading,
    Completing,
    Done,
    Failed,
    Aborted,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Done | SessionStatus::Failed | SessionStatus::Aborted
        )
    }

    /// Transitions only move forward; `Aborted` and `Failed` are reachable
    /// from every non-terminal status.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            SessionStatus::Initiating => false,
            SessionStatus::Uploading => self == SessionStatus::Initiating,
            SessionStatus::Completing => self == SessionStatus::Uploading,
            SessionStatus::Done => self == SessionStatus::Completing,
            SessionStatus::Failed | SessionStatus::Aborted => true,
        }
    }
}

/// Mutable state of a session
#[derive(Debug, Clone)]
pub struct SessionState {
    /// Set once by the initiate call, never changed afterwards
    pub upload_id: Option<String>,
    pub parts: Vec<PartDescriptor>,
    pub status: SessionStatus,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            upload_id: None,
            parts: Vec::new(),
            status: SessionStatus::Initiating,
        }
    }
}

/// Cancellation handles of every part that has been started
#[derive(Default)]
struct PartHandles {
    handles: Vec<(u32, CancellationToken)>,
}

impl PartHandles {
    fn push(&mut self, number: u32, token: CancellationToken) {
        self.handles.push((number, token));
    }

    /// Cancel every part, returning how many were still live
    fn cancel_all(&self) -> usize {
        self.handles
            .iter()
            .filter(|(_, token)| !token.is_cancelled())
            .map(|(number, token)| {
                tracing::trace!(part_number = number, "Cancelling part");
                token.cancel();
            })
            .count()
    }
}

/// Aggregate per-part progress into a session percent in `[0, 100]`
///
/// `Mean` averages every part's last percent (0 for parts without a sample),
/// which under-weights large parts; `Weighted` weights by part length.
pub fn aggregate_percent(
    mode: ProgressAggregation,
    samples: &[Option<ProgressSample>],
    lengths: &[u64],
) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }

    let percent_of = |sample: &Option<ProgressSample>| sample.map_or(0.0, |s| s.percent());

    let value = match mode {
        ProgressAggregation::Mean => {
            samples.iter().map(percent_of).sum::<f64>() / samples.len() as f64
        }
        ProgressAggregation::Weighted => {
            let total: u64 = lengths.iter().sum();
            if total == 0 {
                0.0
            } else {
                samples
                    .iter()
                    .zip(lengths)
                    .map(|(sample, len)| percent_of(sample) * *len as f64)
                    .sum::<f64>()
                    / total as f64
            }
        }
    };

    value.clamp(0.0, 100.0)
}

/// Multipart upload session
pub struct MultipartSession {
    ctx: UploadContext,
    state: Mutex<SessionState>,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl MultipartSession {
    /// Create a new session; `cancel` aborts it from the outside
    pub fn new(ctx: UploadContext, cancel: CancellationToken) -> Self {
        Self {
            ctx,
            state: Mutex::new(SessionState::default()),
            cancel,
            started: AtomicBool::new(false),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.state.lock().status
    }

    pub fn upload_id(&self) -> Option<String> {
        self.state.lock().upload_id.clone()
    }

    /// Snapshot of the part descriptors
    pub fn parts(&self) -> Vec<PartDescriptor> {
        self.state.lock().parts.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().clone()
    }

    /// Abort the session
    ///
    /// Emits `abort` and cancels every in-flight request; `end()` then
    /// resolves with [`UploadError::Aborted`].
    pub fn abort(&self) {
        if self.status().is_terminal() {
            return;
        }
        self.ctx.events.abort();
        self.cancel.cancel();
    }

    /// Run the session to completion
    #[tracing::instrument(
        name = "upload.multipart",
        skip(self),
        fields(
            object.name = %self.ctx.job.name,
            upload.bytes = self.ctx.job.object_len(),
            s3.upload_id = tracing::field::Empty,
            parts_count = tracing::field::Empty
        )
    )]
    pub async fn end(&self) -> Result<UploadResult, UploadError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(UploadError::AlreadyStarted);
        }

        let start_time = Instant::now();
        let result = self.drive().await;
        let duration = start_time.elapsed();
        metrics::record_upload_duration("multipart", duration.as_secs_f64());

        match &result {
            Ok(upload) => {
                metrics::record_upload_success("multipart", upload.bytes_written);
                metrics::record_multipart_upload_success(upload.parts_count);
                tracing::info!(
                    upload_id = ?upload.upload_id,
                    etag = ?upload.etag,
                    parts = upload.parts_count,
                    duration_ms = duration.as_millis() as u64,
                    "Multipart upload completed"
                );
            }
            Err(UploadError::Aborted) => {
                metrics::record_multipart_upload_aborted();
                tracing::info!("Multipart upload aborted");
            }
            Err(e) => {
                metrics::record_upload_failure("multipart");
                metrics::record_multipart_upload_failure();
                metrics::record_error(e.kind());
                tracing::error!(
                    error = %e,
                    duration_ms = duration.as_millis() as u64,
                    "Multipart upload failed"
                );
            }
        }

        self.ctx.events.finish(&result);
        result
    }

    async fn drive(&self) -> Result<UploadResult, UploadError> {
        let job = self.ctx.job.clone();

        let parts = match planner::plan(job.object_len(), job.max_parts) {
            Ok(parts) => parts,
            Err(e) => return Err(self.fail(e)),
        };
        tracing::Span::current().record("parts_count", parts.len());
        self.state.lock().parts = parts.clone();

        let upload_id = match self.until_cancelled(self.initiate()).await {
            Ok(id) => id,
            Err(e) => return Err(self.fail(e)),
        };
        self.set_upload_id(&upload_id);
        self.transition(SessionStatus::Uploading);

        let completed = match self.upload_parts(&upload_id, parts).await {
            Ok(completed) => completed,
            Err(e) => {
                let e = self.fail(e);
                self.abandon(&upload_id).await;
                return Err(e);
            }
        };

        if let Err(e) = self.ensure_complete(&completed) {
            let e = self.fail(e);
            self.abandon(&upload_id).await;
            return Err(e);
        }
        self.transition(SessionStatus::Completing);

        // An abort that lands after the completion POST went out may race a
        // store that already assembled the object; the DELETE below then finds
        // no session and the object stays.
        let etag = match self.until_cancelled(self.complete(&upload_id, &completed)).await {
            Ok(etag) => etag,
            Err(e) => {
                let e = self.fail(e);
                self.abandon(&upload_id).await;
                return Err(e);
            }
        };
        self.transition(SessionStatus::Done);

        Ok(UploadResult {
            etag,
            version_id: None,
            bytes_written: job.object_len(),
            parts_count: completed.len(),
            upload_id: Some(upload_id),
        })
    }

    async fn until_cancelled<T, F>(&self, fut: F) -> Result<T, UploadError>
    where
        F: Future<Output = Result<T, UploadError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(UploadError::Aborted),
            result = fut => result,
        }
    }

    fn transition(&self, next: SessionStatus) -> bool {
        let mut state = self.state.lock();
        if !state.status.can_transition_to(next) {
            tracing::warn!(
                from = ?state.status,
                to = ?next,
                "Ignoring invalid session transition"
            );
            return false;
        }
        tracing::debug!(from = ?state.status, to = ?next, "Session transition");
        state.status = next;
        true
    }

    /// Move to the terminal status matching `error` and hand it back
    fn fail(&self, error: UploadError) -> UploadError {
        let next = match error {
            UploadError::Aborted => SessionStatus::Aborted,
            _ => SessionStatus::Failed,
        };
        self.transition(next);
        error
    }

    fn set_upload_id(&self, upload_id: &str) {
        let mut state = self.state.lock();
        if state.upload_id.is_none() {
            state.upload_id = Some(upload_id.to_string());
            tracing::Span::current().record("s3.upload_id", upload_id);
        }
    }

    fn store_part(&self, descriptor: PartDescriptor) {
        let mut state = self.state.lock();
        if let Some(slot) = state.parts.get_mut(descriptor.number as usize - 1) {
            *slot = descriptor;
        }
    }

    fn update_part<F: FnOnce(&mut PartDescriptor)>(&self, number: u32, update: F) {
        let mut state = self.state.lock();
        if let Some(part) = state.parts.get_mut(number as usize - 1) {
            update(part);
        }
    }

    /// Completion is only legal once every planned part succeeded
    fn ensure_complete(&self, completed: &[CompletedPart]) -> Result<(), UploadError> {
        let state = self.state.lock();
        if state.upload_id.is_none() {
            return Err(UploadError::SessionIdMissing);
        }
        let all_succeeded = state
            .parts
            .iter()
            .all(|part| part.status == PartStatus::Succeeded);
        if !all_succeeded || completed.len() != state.parts.len() {
            return Err(UploadError::Task(format!(
                "{} of {} parts completed",
                completed.len(),
                state.parts.len()
            )));
        }
        Ok(())
    }

    #[tracing::instrument(
        name = "upload.multipart.initiate",
        skip(self),
        fields(
            s3.upload_id = tracing::field::Empty,
            http.status_code = tracing::field::Empty
        ),
        err
    )]
    async fn initiate(&self) -> Result<String, UploadError> {
        let job = &self.ctx.job;
        let request = job.sign_request(SignRequest::create_multipart_upload(
            &job.name,
            &job.content_type,
        ));
        let url = self.ctx.signer.sign(&request).await?;

        let mut request = TransportRequest::post(url, Bytes::new())
            .header("Content-Type", job.content_type.as_str())
            .header("x-amz-acl", job.acl.as_str());
        for (name, value) in &job.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = self
            .ctx
            .transport
            .send(request, None, self.cancel.clone())
            .await?;

        let span = tracing::Span::current();
        span.record("http.status_code", response.status);

        if !response.is_success() {
            return Err(UploadError::Store {
                status: response.status,
                body: response.body,
            });
        }

        let upload_id = xml::parse_upload_id(&response.body)?;
        span.record("s3.upload_id", upload_id.as_str());

        tracing::info!(
            upload_id = %upload_id,
            name = %job.name,
            "Created multipart upload"
        );

        Ok(upload_id)
    }

    async fn upload_parts(
        &self,
        upload_id: &str,
        parts: Vec<PartDescriptor>,
    ) -> Result<Vec<CompletedPart>, UploadError> {
        let job = self.ctx.job.clone();
        let count = parts.len();
        let lengths: Vec<u64> = parts.iter().map(|part| part.length).collect();

        let (reports_tx, mut reports) = unbounded_channel::<PartReport>();
        let limiter = job
            .concurrent_parts
            .map(|limit| Arc::new(Semaphore::new(limit.get())));

        let mut handles = PartHandles::default();
        let mut tasks: JoinSet<PartOutcome> = JoinSet::new();

        // Cancelled by abort or by the first failing part. Queued parts watch
        // it while waiting for a permit, so none of them starts afterwards.
        let group = self.cancel.child_token();

        for descriptor in parts {
            let token = group.child_token();
            handles.push(descriptor.number, token.clone());

            let transfer =
                PartTransfer::new(self.ctx.clone(), upload_id, reports_tx.clone(), token.clone());
            let limiter = limiter.clone();
            let group = group.clone();

            tasks.spawn(async move {
                let _permit = match limiter {
                    Some(limiter) => tokio::select! {
                        biased;
                        _ = token.cancelled() => return PartOutcome::skipped(descriptor),
                        permit = limiter.acquire_owned() => permit.ok(),
                    },
                    None => None,
                };
                let outcome = transfer.run(descriptor).await;
                // Must happen while the permit is still held.
                if outcome.is_failure() {
                    group.cancel();
                }
                outcome
            });
        }
        drop(reports_tx);

        tracing::debug!(
            parts = count,
            limit = ?job.concurrent_parts,
            "Started part uploads"
        );

        let mut samples: Vec<Option<ProgressSample>> = vec![None; count];
        let mut completed = Vec::with_capacity(count);
        let mut failure: Option<UploadError> = None;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    let cancelled = handles.cancel_all();
                    self.settle(&mut tasks).await;
                    tracing::debug!(cancelled = cancelled, "Cancelled in-flight parts");
                    return Err(UploadError::Aborted);
                }
                Some(report) = reports.recv() => match report {
                    PartReport::Started { number } => self.update_part(number, |part| {
                        if part.status == PartStatus::Pending {
                            part.status = PartStatus::InFlight;
                        }
                    }),
                    PartReport::Progress { number, sample } => {
                        if let Some(slot) = samples.get_mut(number as usize - 1) {
                            *slot = Some(sample);
                        }
                        self.update_part(number, |part| part.progress = Some(sample));

                        let percent = aggregate_percent(job.progress, &samples, &lengths);
                        let loaded = samples
                            .iter()
                            .zip(&lengths)
                            .map(|(sample, len)| sample.map_or(0, |s| s.loaded.min(*len)))
                            .sum();
                        self.ctx.events.progress(loaded, job.object_len(), percent);
                    }
                },
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok(PartOutcome { descriptor, result })) => {
                        self.store_part(descriptor);
                        match result {
                            Ok(part) => completed.push(part),
                            // Stopped by a failing sibling
                            Err(UploadError::Aborted) => {}
                            Err(e) if failure.is_none() => {
                                let cancelled = handles.cancel_all();
                                tracing::warn!(
                                    error = %e,
                                    cancelled = cancelled,
                                    "Part failed, cancelled remaining parts"
                                );
                                failure = Some(e);
                            }
                            Err(e) => tracing::debug!(error = %e, "Further part failure"),
                        }
                    }
                    Some(Err(join_error)) => {
                        handles.cancel_all();
                        tasks.shutdown().await;
                        return Err(UploadError::Task(join_error.to_string()));
                    }
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }

        completed.sort_by_key(|part| part.part_number);
        Ok(completed)
    }

    /// Wait for cancelled parts to wind down, keeping their final descriptors
    async fn settle(&self, tasks: &mut JoinSet<PartOutcome>) {
        while let Some(joined) = tasks.join_next().await {
            if let Ok(outcome) = joined {
                self.store_part(outcome.descriptor);
            }
        }
    }

    #[tracing::instrument(
        name = "upload.multipart.complete",
        skip(self, parts),
        fields(
            s3.upload_id = %upload_id,
            parts_count = parts.len(),
            s3.etag = tracing::field::Empty,
            http.status_code = tracing::field::Empty
        ),
        err
    )]
    async fn complete(
        &self,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<Option<String>, UploadError> {
        let job = &self.ctx.job;
        let request = job.sign_request(SignRequest::complete_multipart_upload(&job.name, upload_id));
        let url = self.ctx.signer.sign(&request).await?;

        let body = xml::complete_body(parts)?;
        let request = TransportRequest::post(url, Bytes::from(body))
            .header("Content-Type", crate::signer::COMPLETE_CONTENT_TYPE);

        let response = self
            .ctx
            .transport
            .send(request, None, self.cancel.clone())
            .await?;

        let span = tracing::Span::current();
        span.record("http.status_code", response.status);

        if !response.is_success() {
            return Err(UploadError::Store {
                status: response.status,
                body: response.body,
            });
        }

        let etag = xml::parse_complete_response(response.status, &response.body)?;
        if let Some(etag) = &etag {
            span.record("s3.etag", etag.as_str());
        }

        Ok(etag)
    }

    /// Best-effort removal of the remote session after failure or abort
    ///
    /// Bounded by the job's abort timeout so a silent store cannot hold back
    /// the terminal event.
    #[tracing::instrument(name = "upload.multipart.abort", skip(self), fields(s3.upload_id = %upload_id))]
    async fn abandon(&self, upload_id: &str) {
        let job = &self.ctx.job;
        let request = job.sign_request(SignRequest::abort_multipart_upload(&job.name, upload_id));

        let delete = async {
            let url = self.ctx.signer.sign(&request).await?;
            // Runs after cancellation, so it gets a token of its own.
            let response = self
                .ctx
                .transport
                .send(TransportRequest::delete(url), None, CancellationToken::new())
                .await?;
            if !response.is_success() {
                return Err(UploadError::Store {
                    status: response.status,
                    body: response.body,
                });
            }
            Ok::<_, UploadError>(())
        };

        let result = match tokio::time::timeout(job.abort_timeout, delete).await {
            Ok(result) => result,
            Err(_) => Err(UploadError::Transport(TransportError::Timeout)),
        };

        match result {
            Ok(()) => tracing::info!(upload_id = %upload_id, "Aborted multipart upload"),
            Err(e) => tracing::warn!(
                upload_id = %upload_id,
                error = %e,
                "Failed to abort multipart upload, parts may remain on the store"
            ),
        }
    }
}
