//! Common E2E Test Infrastructure
//!
//! One `wiremock` server plays both roles:
//! - `GET /sign` answers with `<server>/bucket/<name><query>`
//! - everything under `/bucket/` is the object store

use bytes::Bytes;
use presign_uploadr::config::{Config, ConfigLoader};
use presign_uploadr::upload::{UploadCoordinator, UploadCoordinatorBuilder, UploadEvent};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub const MIB: usize = 1024 * 1024;

/// Deterministic test payload
pub fn payload(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
}

/// Signing route that points every operation at the mock store
pub struct SignRoute {
    store: String,
}

impl Respond for SignRoute {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let pairs: HashMap<String, String> = request.url.query_pairs().into_owned().collect();
        let name = pairs.get("name").cloned().unwrap_or_default();
        let query = pairs.get("query").cloned().unwrap_or_default();
        ResponseTemplate::new(200).set_body_string(format!("{}/bucket/{}{}", self.store, name, query))
    }
}

pub struct MockEnv {
    pub server: MockServer,
}

impl MockEnv {
    /// Mock server with the signing route mounted
    pub async fn start() -> Self {
        let env = Self::bare().await;
        Mock::given(method("GET"))
            .and(path("/sign"))
            .respond_with(SignRoute {
                store: env.server.uri(),
            })
            .mount(&env.server)
            .await;
        env
    }

    /// Mock server with nothing mounted
    pub async fn bare() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    pub fn config(&self) -> Config {
        ConfigLoader::from_str(&format!(
            "signer:\n  endpoint: \"{}/sign\"\n",
            self.server.uri()
        ))
        .unwrap()
    }

    /// Coordinator builder wired to this environment
    pub fn upload(&self, object: Bytes, name: &str) -> UploadCoordinatorBuilder {
        UploadCoordinator::builder(Arc::new(object))
            .from_config(&self.config())
            .unwrap()
            .name(name)
            .content_type("application/octet-stream")
    }

    pub fn object_path(name: &str) -> String {
        format!("/bucket/{}", name)
    }

    pub async fn mount_initiate(&self, name: &str, upload_id: &str) {
        Mock::given(method("POST"))
            .and(path(Self::object_path(name)))
            .and(query_param("uploads", ""))
            .and(header("x-amz-acl", "public-read"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                r#"<?xml version="1.0" encoding="UTF-8"?>
                <InitiateMultipartUploadResult>
                    <Bucket>bucket</Bucket>
                    <Key>{}</Key>
                    <UploadId>{}</UploadId>
                </InitiateMultipartUploadResult>"#,
                name, upload_id
            )))
            .expect(1)
            .mount(&self.server)
            .await;
    }

    pub async fn mount_part(&self, name: &str, upload_id: &str, number: u32, etag: &str) {
        Mock::given(method("PUT"))
            .and(path(Self::object_path(name)))
            .and(query_param("partNumber", number.to_string()))
            .and(query_param("uploadId", upload_id))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", etag))
            .mount(&self.server)
            .await;
    }

    pub async fn mount_complete(&self, name: &str, upload_id: &str, etag: &str, expect: u64) {
        Mock::given(method("POST"))
            .and(path(Self::object_path(name)))
            .and(query_param("uploadId", upload_id))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                r#"<?xml version="1.0" encoding="UTF-8"?>
                <CompleteMultipartUploadResult>
                    <Key>{}</Key>
                    <ETag>{}</ETag>
                </CompleteMultipartUploadResult>"#,
                name, etag
            )))
            .expect(expect)
            .mount(&self.server)
            .await;
    }

    pub async fn mount_abort(&self, name: &str, upload_id: &str, expect: u64) {
        Mock::given(method("DELETE"))
            .and(path(Self::object_path(name)))
            .and(query_param("uploadId", upload_id))
            .respond_with(ResponseTemplate::new(204))
            .expect(expect)
            .mount(&self.server)
            .await;
    }

    /// Requests received with the given HTTP method
    pub async fn requests(&self, http_method: &str) -> Vec<Request> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|request| request.method.as_str() == http_method)
            .collect()
    }

    /// Query pairs of every call made to the signing route
    pub async fn sign_calls(&self) -> Vec<HashMap<String, String>> {
        self.requests("GET")
            .await
            .into_iter()
            .filter(|request| request.url.path() == "/sign")
            .map(|request| request.url.query_pairs().into_owned().collect())
            .collect()
    }
}

/// Everything emitted so far; terminal events go out before `end()` returns
pub fn drain(events: &mut UnboundedReceiver<UploadEvent>) -> Vec<UploadEvent> {
    std::iter::from_fn(|| events.try_recv().ok()).collect()
}

pub fn progress_percents(events: &[UploadEvent]) -> Vec<f64> {
    events
        .iter()
        .filter_map(|event| match event {
            UploadEvent::Progress { percent, .. } => Some(*percent),
            _ => None,
        })
        .collect()
}

/// Exactly one terminal event, and it is the last one
pub fn assert_single_terminal(events: &[UploadEvent]) {
    let terminal: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, event)| event.is_terminal())
        .map(|(i, _)| i)
        .collect();
    assert_eq!(terminal.len(), 1, "events: {:?}", events);
    assert_eq!(terminal[0], events.len() - 1, "events: {:?}", events);
}
