//! Part transfer
//!
//! Uploads one byte range of a multipart upload: signs the part URL, PUTs the
//! range, streams progress back to the owning session and captures the ETag
//! the completion call needs.

use super::{ProgressSample, UploadContext, UploadError};
use crate::metrics;
use crate::signer::{SignRequest, PART_CONTENT_TYPE};
use crate::transport::{ProgressCallback, TransportRequest};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

/// Lifecycle of a single part
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartStatus {
    Pending,
    InFlight,
    Succeeded,
    Failed,
}

/// One contiguous byte range of the object
#[derive(Debug, Clone, PartialEq)]
pub struct PartDescriptor {
    /// 1-based part number
    pub number: u32,
    pub offset: u64,
    pub length: u64,
    /// Resolved on the first attempt and reused by retries
    pub signed_url: Option<String>,
    pub progress: Option<ProgressSample>,
    pub etag: Option<String>,
    pub status: PartStatus,
}

impl PartDescriptor {
    pub fn new(number: u32, offset: u64, length: u64) -> Self {
        Self {
            number,
            offset,
            length,
            signed_url: None,
            progress: None,
            etag: None,
            status: PartStatus::Pending,
        }
    }

    /// Last known percent, 0 before the first sample
    pub fn percent(&self) -> f64 {
        self.progress.map_or(0.0, |sample| sample.percent())
    }
}

/// Completed part info
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Message sent from a running part to its session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartReport {
    /// The part left the queue and is now transferring
    Started { number: u32 },
    Progress { number: u32, sample: ProgressSample },
}

impl PartReport {
    pub fn number(&self) -> u32 {
        match self {
            PartReport::Started { number } | PartReport::Progress { number, .. } => *number,
        }
    }
}

/// Final state of a part handed back to the session
#[derive(Debug)]
pub struct PartOutcome {
    pub descriptor: PartDescriptor,
    pub result: Result<CompletedPart, UploadError>,
}

impl PartOutcome {
    /// Outcome of a part cancelled before it left the queue; it stays `Pending`
    pub fn skipped(descriptor: PartDescriptor) -> Self {
        Self {
            descriptor,
            result: Err(UploadError::Aborted),
        }
    }

    /// Failed for a reason other than cancellation
    pub fn is_failure(&self) -> bool {
        matches!(&self.result, Err(e) if !matches!(e, UploadError::Aborted))
    }
}

/// Uploads a single part
///
/// The session id is a constructor argument, so a transfer cannot exist before
/// the multipart upload has been initiated.
pub struct PartTransfer {
    ctx: UploadContext,
    upload_id: String,
    reports: UnboundedSender<PartReport>,
    cancel: CancellationToken,
}

impl PartTransfer {
    /// Create a new part transfer
    pub fn new(
        ctx: UploadContext,
        upload_id: impl Into<String>,
        reports: UnboundedSender<PartReport>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            upload_id: upload_id.into(),
            reports,
            cancel,
        }
    }

    /// Upload the part, retrying per the job's retry policy
    #[tracing::instrument(
        name = "upload.multipart.part",
        skip(self, descriptor),
        fields(
            s3.upload_id = %self.upload_id,
            s3.part_number = descriptor.number,
            upload.bytes = descriptor.length,
            s3.etag = tracing::field::Empty,
            part.attempts = tracing::field::Empty
        )
    )]
    pub async fn run(&self, mut descriptor: PartDescriptor) -> PartOutcome {
        let retry = self.ctx.job.retry;
        descriptor.status = PartStatus::InFlight;
        let _ = self.reports.send(PartReport::Started {
            number: descriptor.number,
        });

        let mut attempt = 0u32;
        let result = loop {
            match self.attempt(&mut descriptor).await {
                Ok(part) => break Ok(part),
                Err(e)
                    if attempt < retry.max_retries
                        && e.is_retryable()
                        && !self.cancel.is_cancelled() =>
                {
                    let delay = retry.delay(attempt);
                    attempt += 1;
                    metrics::record_part_retry();
                    tracing::warn!(
                        part_number = descriptor.number,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying part upload"
                    );

                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break Err(UploadError::Aborted),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => break Err(e),
            }
        };

        let span = tracing::Span::current();
        span.record("part.attempts", attempt + 1);

        match &result {
            Ok(part) => {
                descriptor.status = PartStatus::Succeeded;
                descriptor.etag = Some(part.etag.clone());
                span.record("s3.etag", part.etag.as_str());
                tracing::debug!(
                    part_number = part.part_number,
                    etag = %part.etag,
                    "Uploaded part"
                );
            }
            Err(e) => {
                descriptor.status = PartStatus::Failed;
                if !matches!(e, UploadError::Aborted) {
                    tracing::error!(
                        part_number = descriptor.number,
                        error = %e,
                        "Part upload failed"
                    );
                }
            }
        }

        PartOutcome { descriptor, result }
    }

    async fn attempt(&self, descriptor: &mut PartDescriptor) -> Result<CompletedPart, UploadError> {
        let job = &self.ctx.job;

        let url = match &descriptor.signed_url {
            Some(url) => url.clone(),
            None => {
                let request = job.sign_request(SignRequest::upload_part(
                    &job.name,
                    descriptor.number,
                    &self.upload_id,
                ));
                let url = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(UploadError::Aborted),
                    signed = self.ctx.signer.sign(&request) => signed?,
                };
                descriptor.signed_url = Some(url.clone());
                url
            }
        };

        let body = job.object.slice(descriptor.offset, descriptor.length).await?;
        let request = TransportRequest::put(url, body).header("Content-Type", PART_CONTENT_TYPE);

        let last_sample = Arc::new(Mutex::new(None::<ProgressSample>));
        let progress: ProgressCallback = {
            let last_sample = last_sample.clone();
            let reports = self.reports.clone();
            let number = descriptor.number;
            Arc::new(move |sample| {
                *last_sample.lock() = Some(sample);
                // The session may already be gone after a sibling failed.
                let _ = reports.send(PartReport::Progress { number, sample });
            })
        };

        let response = self
            .ctx
            .transport
            .send(request, Some(progress), self.cancel.clone())
            .await;
        if let Some(sample) = *last_sample.lock() {
            descriptor.progress = Some(sample);
        }
        let response = response?;

        if !response.is_success() {
            return Err(UploadError::Store {
                status: response.status,
                body: response.body,
            });
        }

        let etag = response.etag().map(str::to_string).ok_or_else(|| {
            UploadError::MalformedResponse(format!(
                "part {} response carries no ETag",
                descriptor.number
            ))
        })?;

        let done = ProgressSample::complete(descriptor.length);
        if descriptor.progress != Some(done) {
            descriptor.progress = Some(done);
            let _ = self.reports.send(PartReport::Progress {
                number: descriptor.number,
                sample: done,
            });
        }

        Ok(CompletedPart {
            part_number: descriptor.number,
            etag,
        })
    }
}
