//! Metrics module
//!
//! Prometheus metrics for uploads, parts and signing calls. Everything is
//! registered in the default registry; [`render`] encodes it as text.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, register_histogram_vec, Counter,
    CounterVec, Encoder, Histogram, HistogramVec, TextEncoder,
};

lazy_static! {
    // Upload metrics
    pub static ref UPLOADS_TOTAL: CounterVec = register_counter_vec!(
        "presign_uploads_total",
        "Total number of uploads",
        &["method", "status"]
    ).unwrap();

    pub static ref UPLOAD_BYTES_TOTAL: Counter = register_counter!(
        "presign_upload_bytes_total",
        "Total bytes uploaded"
    ).unwrap();

    pub static ref UPLOAD_DURATION: HistogramVec = register_histogram_vec!(
        "presign_upload_duration_seconds",
        "Upload duration in seconds",
        &["method"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]
    ).unwrap();

    // Multipart metrics
    pub static ref MULTIPART_UPLOADS: CounterVec = register_counter_vec!(
        "presign_multipart_uploads_total",
        "Total multipart uploads",
        &["status"]
    ).unwrap();

    pub static ref MULTIPART_PARTS: Histogram = register_histogram!(
        "presign_multipart_parts",
        "Number of parts per multipart upload",
        vec![1.0, 2.0, 4.0, 8.0, 16.0, 64.0, 256.0, 1000.0, 10000.0]
    ).unwrap();

    pub static ref PART_RETRIES: Counter = register_counter!(
        "presign_part_retries_total",
        "Part uploads attempted again after a retryable failure"
    ).unwrap();

    // Signer metrics
    pub static ref SIGN_REQUESTS: CounterVec = register_counter_vec!(
        "presign_sign_requests_total",
        "Signed URL requests",
        &["operation", "status"]
    ).unwrap();

    // Error metrics
    pub static ref ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "presign_errors_total",
        "Total errors",
        &["type"]
    ).unwrap();
}

/// Record a successful upload
pub fn record_upload_success(method: &str, bytes: u64) {
    UPLOADS_TOTAL.with_label_values(&[method, "success"]).inc();
    UPLOAD_BYTES_TOTAL.inc_by(bytes as f64);
}

/// Record a failed upload
pub fn record_upload_failure(method: &str) {
    UPLOADS_TOTAL.with_label_values(&[method, "failure"]).inc();
}

/// Record upload duration
pub fn record_upload_duration(method: &str, duration_secs: f64) {
    UPLOAD_DURATION
        .with_label_values(&[method])
        .observe(duration_secs);
}

/// Record a successful multipart upload
pub fn record_multipart_upload_success(parts_count: usize) {
    MULTIPART_UPLOADS.with_label_values(&["success"]).inc();
    MULTIPART_PARTS.observe(parts_count as f64);
}

/// Record a failed multipart upload
pub fn record_multipart_upload_failure() {
    MULTIPART_UPLOADS.with_label_values(&["failure"]).inc();
}

/// Record a multipart upload cancelled by the caller
pub fn record_multipart_upload_aborted() {
    MULTIPART_UPLOADS.with_label_values(&["aborted"]).inc();
}

pub fn record_part_retry() {
    PART_RETRIES.inc();
}

/// Record a call to the signing endpoint
pub fn record_sign_request(operation: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    SIGN_REQUESTS.with_label_values(&[operation, status]).inc();
}

/// Record an error
pub fn record_error(error_type: &str) {
    ERRORS_TOTAL.with_label_values(&[error_type]).inc();
}

/// Encode every registered metric in the Prometheus text format
pub fn render() -> String {
    // Touch the lazy statics so an idle process still exposes its metric names.
    lazy_static::initialize(&UPLOADS_TOTAL);
    lazy_static::initialize(&MULTIPART_UPLOADS);
    lazy_static::initialize(&SIGN_REQUESTS);

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
