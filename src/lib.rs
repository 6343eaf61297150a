//! Presign Uploadr Library
//!
//! Uploads objects to S3-compatible storage through pre-signed URLs, without
//! ever holding store credentials.
//!
//! # Features
//!
//! - **Pre-signed only**: every request runs against a URL from an external signing route
//! - **Multipart**: objects above the threshold are split and sent in concurrent parts
//! - **Progress events**: aggregated across parts, with exactly one terminal event
//! - **Abort**: cancels every in-flight part and removes the remote session
//!
//! # Example
//!
//! ```no_run
//! use presign_uploadr::config::Config;
//! use presign_uploadr::upload::{FileSource, UploadCoordinator};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let object = Arc::new(FileSource::open("video.mp4").await?);
//!     let upload = UploadCoordinator::builder(object)
//!         .from_config(&config)?
//!         .build()?;
//!     let result = upload.end().await?;
//!     println!("ETag: {:?}", result.etag);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod metrics;
pub mod signer;
pub mod telemetry;
pub mod transport;
pub mod upload;

// Re-export commonly used types
pub use config::Config;
pub use upload::{UploadCoordinator, UploadError, UploadEvent, UploadResult};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
