//! E2E Part Concurrency Tests
//!
//! `concurrent_parts` caps how many part PUTs run at once; queued parts wait
//! for a slot and never start once the upload has failed.

use super::common::{assert_single_terminal, drain, MIB};
use super::fakes::{multipart_upload, PartBehavior, ScriptedStore, UPLOAD_ID};
use presign_uploadr::upload::{SessionStatus, UploadError, UploadEvent};
use std::num::NonZeroUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn answering(delay_ms: u64, fail_first: bool) -> Arc<ScriptedStore> {
    Arc::new(ScriptedStore {
        parts: PartBehavior::Answer {
            delay: Duration::from_millis(delay_ms),
            fail_first,
        },
        ..Default::default()
    })
}

/// Test: with one slot the parts go out strictly one after another
#[tokio::test]
async fn test_single_slot_runs_one_part_at_a_time() {
    let store = answering(20, false);
    let upload = multipart_upload(store.clone(), 16 * MIB, 3)
        .concurrent_parts(NonZeroUsize::new(1))
        .build()
        .unwrap();
    let mut events = upload.subscribe();

    let result = upload.end().await.unwrap();
    assert_eq!(result.parts_count, 3);
    assert_eq!(result.etag.as_deref(), Some("\"final\""));

    assert_eq!(store.parts_started.load(Ordering::SeqCst), 3);
    assert_eq!(store.max_in_flight.load(Ordering::SeqCst), 1);
    assert!(store.saw("POST", &format!("?uploadId={}", UPLOAD_ID)));

    let events = drain(&mut events);
    assert_single_terminal(&events);
    assert_eq!(events.last(), Some(&UploadEvent::End));
}

/// Test: without a limit every part is in flight together
#[tokio::test]
async fn test_unbounded_parts_overlap() {
    let store = answering(200, false);
    let upload = multipart_upload(store.clone(), 16 * MIB, 3).build().unwrap();

    upload.end().await.unwrap();
    assert_eq!(store.max_in_flight.load(Ordering::SeqCst), 3);
}

/// Test: a failure with one slot stops the queue before any other PUT
#[tokio::test]
async fn test_failure_sends_no_queued_part() {
    let store = answering(10, true);
    let upload = multipart_upload(store.clone(), 16 * MIB, 3)
        .concurrent_parts(NonZeroUsize::new(1))
        .build()
        .unwrap();
    let mut events = upload.subscribe();

    let err = upload.end().await.unwrap_err();
    assert!(matches!(err, UploadError::Store { status: 500, .. }), "got {:?}", err);
    assert_eq!(upload.session_status(), Some(SessionStatus::Failed));

    assert_eq!(store.count("PUT"), 1);
    assert_eq!(store.parts_started.load(Ordering::SeqCst), 1);
    assert!(!store.saw("POST", &format!("?uploadId={}", UPLOAD_ID)));
    assert!(store.saw("DELETE", &format!("?uploadId={}", UPLOAD_ID)));

    let events = drain(&mut events);
    assert_single_terminal(&events);
    assert!(matches!(
        events.last(),
        Some(UploadEvent::Error {
            status: Some(500),
            ..
        })
    ));
}
