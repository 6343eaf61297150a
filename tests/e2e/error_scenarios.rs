//! E2E Error Scenario Tests
//!
//! ## Test Coverage
//!
//! - Signing route failures
//! - Store rejecting the initiate call, or unreachable for it
//! - Initiate response without an UploadId
//! - Part failure (no completion, remote session aborted)
//! - Completion answered with a 200 `<Error>` document

use super::common::{assert_single_terminal, drain, payload, MockEnv, MIB};
use super::fakes::{multipart_upload, InitiateBehavior, ScriptedStore};
use presign_uploadr::transport::TransportError;
use presign_uploadr::upload::{SessionStatus, UploadError, UploadEvent};
use std::sync::Arc;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

/// Test: a failing signing route surfaces as a sign error with its status
#[tokio::test]
async fn test_sign_failure_on_direct_put() {
    let env = MockEnv::bare().await;
    Mock::given(method("GET"))
        .and(path("/sign"))
        .respond_with(ResponseTemplate::new(500).set_body_string("signer down"))
        .mount(&env.server)
        .await;

    let upload = env.upload(payload(1024), "a.txt").build().unwrap();
    let mut events = upload.subscribe();

    let err = upload.end().await.unwrap_err();
    assert!(matches!(err, UploadError::Sign(_)), "got {:?}", err);
    assert_eq!(err.status(), Some(500));
    assert!(env.requests("PUT").await.is_empty());

    let events = drain(&mut events);
    assert_single_terminal(&events);
    match events.last() {
        Some(UploadEvent::Error { status, .. }) => assert_eq!(*status, Some(500)),
        other => panic!("expected error event, got {:?}", other),
    }
}

/// Test: a rejected direct PUT carries the store's status and body
#[tokio::test]
async fn test_direct_put_store_error() {
    let env = MockEnv::start().await;
    Mock::given(method("PUT"))
        .and(path(MockEnv::object_path("denied.txt")))
        .respond_with(ResponseTemplate::new(403).set_body_string("AccessDenied"))
        .mount(&env.server)
        .await;

    let upload = env.upload(payload(1024), "denied.txt").build().unwrap();
    match upload.end().await {
        Err(UploadError::Store { status, body }) => {
            assert_eq!(status, 403);
            assert_eq!(body, "AccessDenied");
        }
        other => panic!("expected store error, got {:?}", other),
    }
}

/// Test: initiate rejected, so no part is ever started and nothing is aborted
#[tokio::test]
async fn test_initiate_failure_starts_no_parts() {
    let env = MockEnv::start().await;
    let name = "big.bin";

    Mock::given(method("POST"))
        .and(path(MockEnv::object_path(name)))
        .and(query_param("uploads", ""))
        .respond_with(ResponseTemplate::new(403).set_body_string("AccessDenied"))
        .expect(1)
        .mount(&env.server)
        .await;

    let upload = env
        .upload(payload(6 * MIB), name)
        .multipart_threshold(MIB as u64)
        .build()
        .unwrap();
    let mut events = upload.subscribe();

    let err = upload.end().await.unwrap_err();
    assert!(matches!(err, UploadError::Store { status: 403, .. }), "got {:?}", err);

    assert!(env.requests("PUT").await.is_empty());
    assert!(env.requests("DELETE").await.is_empty());

    let events = drain(&mut events);
    assert_single_terminal(&events);
    assert!(matches!(
        events.last(),
        Some(UploadEvent::Error {
            status: Some(403),
            ..
        })
    ));
}

/// Test: initiate fails at the network level: session failed, no part, one error
#[tokio::test]
async fn test_initiate_transport_failure() {
    let store = Arc::new(ScriptedStore {
        initiate: InitiateBehavior::Refuse,
        ..Default::default()
    });
    let upload = multipart_upload(store.clone(), 12 * MIB, 2).build().unwrap();
    let mut events = upload.subscribe();

    let err = upload.end().await.unwrap_err();
    assert!(
        matches!(err, UploadError::Transport(TransportError::Network(_))),
        "got {:?}",
        err
    );
    assert_eq!(err.status(), None);
    assert_eq!(upload.session_status(), Some(SessionStatus::Failed));

    assert_eq!(store.count("PUT"), 0);
    assert_eq!(store.count("DELETE"), 0);

    let events = drain(&mut events);
    assert_single_terminal(&events);
    let errors = events
        .iter()
        .filter(|e| matches!(e, UploadEvent::Error { .. }))
        .count();
    assert_eq!(errors, 1);
    assert!(!events.contains(&UploadEvent::Abort));
}

/// Test: an initiate body without UploadId fails before any part
#[tokio::test]
async fn test_initiate_without_upload_id() {
    let env = MockEnv::start().await;
    let name = "big.bin";

    Mock::given(method("POST"))
        .and(path(MockEnv::object_path(name)))
        .and(query_param("uploads", ""))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "<InitiateMultipartUploadResult><Bucket>bucket</Bucket></InitiateMultipartUploadResult>",
        ))
        .mount(&env.server)
        .await;

    let upload = env
        .upload(payload(6 * MIB), name)
        .multipart_threshold(MIB as u64)
        .build()
        .unwrap();

    let err = upload.end().await.unwrap_err();
    assert!(matches!(err, UploadError::SessionIdMissing), "got {:?}", err);
    assert!(env.requests("PUT").await.is_empty());
}

/// Test: one failing part means no completion call and a remote abort
#[tokio::test]
async fn test_part_failure_aborts_remote_session() {
    let env = MockEnv::start().await;
    let name = "big.bin";

    env.mount_initiate(name, "upload-2").await;
    env.mount_part(name, "upload-2", 1, "etag-1").await;
    Mock::given(method("PUT"))
        .and(path(MockEnv::object_path(name)))
        .and(query_param("partNumber", "2"))
        .respond_with(ResponseTemplate::new(500).set_body_string("InternalError"))
        .mount(&env.server)
        .await;
    env.mount_complete(name, "upload-2", "never", 0).await;
    env.mount_abort(name, "upload-2", 1).await;

    let upload = env
        .upload(payload(6 * MIB), name)
        .multipart_threshold(MIB as u64)
        .max_parts(2)
        .build()
        .unwrap();
    let mut events = upload.subscribe();

    let err = upload.end().await.unwrap_err();
    assert!(matches!(err, UploadError::Store { status: 500, .. }), "got {:?}", err);

    let sign_calls = env.sign_calls().await;
    assert!(sign_calls
        .iter()
        .any(|call| call.get("method").map(String::as_str) == Some("DELETE")
            && call.get("query").map(String::as_str) == Some("?uploadId=upload-2")));

    let events = drain(&mut events);
    assert_single_terminal(&events);
    assert!(!events.contains(&UploadEvent::End));
}

/// Test: a 200 completion carrying an `<Error>` document is a failure
#[tokio::test]
async fn test_completion_error_document() {
    let env = MockEnv::start().await;
    let name = "big.bin";

    env.mount_initiate(name, "upload-3").await;
    env.mount_part(name, "upload-3", 1, "etag-1").await;
    env.mount_part(name, "upload-3", 2, "etag-2").await;
    Mock::given(method("POST"))
        .and(path(MockEnv::object_path(name)))
        .and(query_param("uploadId", "upload-3"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<?xml version="1.0" encoding="UTF-8"?>
            <Error><Code>InternalError</Code><Message>Please try again.</Message></Error>"#,
        ))
        .expect(1)
        .mount(&env.server)
        .await;
    env.mount_abort(name, "upload-3", 1).await;

    let upload = env
        .upload(payload(6 * MIB), name)
        .multipart_threshold(MIB as u64)
        .max_parts(2)
        .build()
        .unwrap();

    match upload.end().await {
        Err(UploadError::Store { status, body }) => {
            assert_eq!(status, 200);
            assert_eq!(body, "InternalError: Please try again.");
        }
        other => panic!("expected store error, got {:?}", other),
    }
}

/// Test: a part response without ETag cannot be completed
#[tokio::test]
async fn test_part_without_etag() {
    let env = MockEnv::start().await;
    let name = "small-parts.bin";

    env.mount_initiate(name, "upload-4").await;
    Mock::given(method("PUT"))
        .and(path(MockEnv::object_path(name)))
        .respond_with(ResponseTemplate::new(200))
        .mount(&env.server)
        .await;
    env.mount_complete(name, "upload-4", "never", 0).await;
    env.mount_abort(name, "upload-4", 1).await;

    let upload = env
        .upload(payload(2 * MIB), name)
        .multipart_threshold(MIB as u64)
        .build()
        .unwrap();

    let err = upload.end().await.unwrap_err();
    assert!(matches!(err, UploadError::MalformedResponse(_)), "got {:?}", err);
}
