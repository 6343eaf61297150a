//! End-to-End Tests for Presign Uploadr
//!
//! Exercises complete uploads against a `wiremock` server acting as both
//! the signing route and the object store, plus an in-process store for
//! cancellation.
//!
//! ## Test Categories
//!
//! - `upload_flow`: Happy path uploads (direct PUT, multipart, retry)
//! - `error_scenarios`: Error handling validation
//! - `abort_flow`: Cancellation of in-flight work
//! - `concurrency`: Part concurrency limit and fail-fast queueing

pub mod common;
pub mod concurrency;
pub mod error_scenarios;
pub mod upload_flow;
