//! Direct upload
//!
//! Sends objects at or below the multipart threshold with a single signed PUT.
//!
//! # Example
//!
//! ```no_run
//! use presign_uploadr::upload::put_object::DirectPut;
//! use presign_uploadr::upload::UploadContext;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(ctx: UploadContext) -> Result<(), Box<dyn std::error::Error>> {
//! let put = DirectPut::new(ctx, CancellationToken::new());
//! let result = put.run().await?;
//! println!("Uploaded with ETag: {:?}", result.etag);
//! # Ok(())
//! # }
//! ```

use super::{ProgressSample, UploadContext, UploadError, UploadResult};
use crate::metrics;
use crate::signer::SignRequest;
use crate::transport::{ProgressCallback, TransportRequest};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Single-request upload
pub struct DirectPut {
    ctx: UploadContext,
    cancel: CancellationToken,
}

impl DirectPut {
    /// Create a new direct upload; `cancel` aborts the request in flight
    pub fn new(ctx: UploadContext, cancel: CancellationToken) -> Self {
        Self { ctx, cancel }
    }

    /// Upload the object and emit the terminal event
    #[tracing::instrument(
        name = "upload.put_object",
        skip(self),
        fields(
            object.name = %self.ctx.job.name,
            http.content_type = %self.ctx.job.content_type,
            upload.bytes = self.ctx.job.object_len(),
            s3.etag = tracing::field::Empty,
            http.status_code = tracing::field::Empty
        )
    )]
    pub async fn run(&self) -> Result<UploadResult, UploadError> {
        let start_time = Instant::now();
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(UploadError::Aborted),
            result = self.put() => result,
        };

        let duration = start_time.elapsed();
        metrics::record_upload_duration("put_object", duration.as_secs_f64());

        match &result {
            Ok(upload) => {
                metrics::record_upload_success("put_object", upload.bytes_written);

                let span = tracing::Span::current();
                if let Some(etag) = &upload.etag {
                    span.record("s3.etag", etag.as_str());
                }

                tracing::info!(
                    etag = ?upload.etag,
                    bytes_written = upload.bytes_written,
                    duration_ms = duration.as_millis() as u64,
                    "PutObject upload completed"
                );
            }
            Err(UploadError::Aborted) => {
                metrics::record_upload_failure("put_object");
                tracing::info!("PutObject upload aborted");
            }
            Err(e) => {
                metrics::record_upload_failure("put_object");
                metrics::record_error(e.kind());
                tracing::error!(
                    error = %e,
                    duration_ms = duration.as_millis() as u64,
                    "PutObject upload failed"
                );
            }
        }

        self.ctx.events.finish(&result);
        result
    }

    async fn put(&self) -> Result<UploadResult, UploadError> {
        let job = &self.ctx.job;
        let total = job.object_len();

        let request = job.sign_request(SignRequest::put_object(&job.name, &job.content_type));
        let url = self.ctx.signer.sign(&request).await?;

        let body = job.object.slice(0, total).await?;
        let mut request = TransportRequest::put(url, body)
            .header("x-amz-acl", job.acl.as_str())
            .header("Content-Type", job.content_type.as_str());
        for (name, value) in &job.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let progress: ProgressCallback = {
            let events = self.ctx.events.clone();
            Arc::new(move |sample: ProgressSample| {
                events.progress(sample.loaded, sample.total, sample.percent());
            })
        };

        let response = self
            .ctx
            .transport
            .send(request, Some(progress), self.cancel.clone())
            .await?;

        tracing::Span::current().record("http.status_code", response.status);

        if !response.is_success() {
            return Err(UploadError::Store {
                status: response.status,
                body: response.body,
            });
        }

        Ok(UploadResult {
            etag: response.etag().map(str::to_string),
            version_id: response.header("x-amz-version-id").map(str::to_string),
            bytes_written: total,
            parts_count: 1,
            upload_id: None,
        })
    }
}
