//! E2E Upload Flow Tests
//!
//! Happy paths through the real HTTP signer and transport:
//! - Direct PUT below the threshold
//! - Multipart upload with ordered completion body
//! - Part retry reusing the signed URL

use super::common::{
    assert_single_terminal, drain, payload, progress_percents, MockEnv, MIB,
};
use presign_uploadr::upload::{RetryPolicy, UploadEvent};
use std::time::Duration;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

/// Test: a 3 MiB object goes out as one PUT with ACL, type and custom headers
#[tokio::test]
async fn test_direct_put_below_threshold() {
    let env = MockEnv::start().await;

    Mock::given(method("PUT"))
        .and(path(MockEnv::object_path("notes.txt")))
        .and(header("x-amz-acl", "public-read"))
        .and(header("content-type", "text/plain"))
        .and(header("cache-control", "no-cache"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"direct-etag\"")
                .insert_header("x-amz-version-id", "v1"),
        )
        .expect(1)
        .mount(&env.server)
        .await;

    let mut upload = env
        .upload(payload(3 * MIB), "notes.txt")
        .content_type("text/plain")
        .build()
        .unwrap();
    upload.set("Cache-Control", "no-cache");
    assert!(!upload.is_multipart());

    let mut events = upload.subscribe();
    let result = upload.end().await.unwrap();

    assert_eq!(result.etag.as_deref(), Some("\"direct-etag\""));
    assert_eq!(result.version_id.as_deref(), Some("v1"));
    assert_eq!(result.bytes_written, (3 * MIB) as u64);
    assert_eq!(result.parts_count, 1);
    assert!(result.upload_id.is_none());

    // No multipart traffic at all
    assert!(env.requests("POST").await.is_empty());

    let sign_calls = env.sign_calls().await;
    assert_eq!(sign_calls.len(), 1);
    assert_eq!(sign_calls[0].get("method").map(String::as_str), Some("PUT"));
    assert_eq!(sign_calls[0].get("mime").map(String::as_str), Some("text/plain"));
    assert_eq!(sign_calls[0].get("name").map(String::as_str), Some("notes.txt"));
    assert!(!sign_calls[0].contains_key("query"));

    let events = drain(&mut events);
    assert_single_terminal(&events);
    assert_eq!(events.last(), Some(&UploadEvent::End));

    let percents = progress_percents(&events);
    assert!(!percents.is_empty());
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(percents.last().copied(), Some(100.0));
}

/// Test: a 6 MiB object over two parts completes with both ETags in order
#[tokio::test]
async fn test_multipart_upload_completes_with_ordered_etags() {
    let env = MockEnv::start().await;
    let name = "video.bin";

    env.mount_initiate(name, "upload-1").await;
    env.mount_part(name, "upload-1", 1, "etag-1").await;
    env.mount_part(name, "upload-1", 2, "etag-2").await;

    Mock::given(method("POST"))
        .and(path(MockEnv::object_path(name)))
        .and(query_param("uploadId", "upload-1"))
        .and(body_string_contains(
            "<Part><PartNumber>1</PartNumber><ETag>etag-1</ETag></Part>\
             <Part><PartNumber>2</PartNumber><ETag>etag-2</ETag></Part>",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<CompleteMultipartUploadResult><ETag>final-etag</ETag></CompleteMultipartUploadResult>"#,
        ))
        .expect(1)
        .mount(&env.server)
        .await;
    env.mount_abort(name, "upload-1", 0).await;

    let upload = env
        .upload(payload(6 * MIB), name)
        .multipart_threshold((5 * MIB) as u64)
        .max_parts(2)
        .build()
        .unwrap();
    assert!(upload.is_multipart());

    let mut events = upload.subscribe();
    let result = upload.end().await.unwrap();

    assert_eq!(result.etag.as_deref(), Some("final-etag"));
    assert_eq!(result.upload_id.as_deref(), Some("upload-1"));
    assert_eq!(result.parts_count, 2);
    assert_eq!(result.bytes_written, (6 * MIB) as u64);

    // 5 MiB + 1 MiB, each PUT carrying exactly its range
    let mut part_lengths: Vec<(String, usize)> = env
        .requests("PUT")
        .await
        .into_iter()
        .map(|request| {
            let number = request
                .url
                .query_pairs()
                .find(|(k, _)| k == "partNumber")
                .map(|(_, v)| v.into_owned())
                .unwrap_or_default();
            (number, request.body.len())
        })
        .collect();
    part_lengths.sort();
    assert_eq!(
        part_lengths,
        vec![("1".to_string(), 5 * MIB), ("2".to_string(), MIB)]
    );

    // initiate + 2 parts + complete
    let sign_calls = env.sign_calls().await;
    assert_eq!(sign_calls.len(), 4);
    let queries: Vec<&str> = sign_calls
        .iter()
        .filter_map(|call| call.get("query").map(String::as_str))
        .collect();
    assert!(queries.contains(&"?uploads"));
    assert!(queries.contains(&"?partNumber=1&uploadId=upload-1"));
    assert!(queries.contains(&"?partNumber=2&uploadId=upload-1"));
    assert!(queries.contains(&"?uploadId=upload-1"));

    let events = drain(&mut events);
    assert_single_terminal(&events);
    assert_eq!(events.last(), Some(&UploadEvent::End));

    let percents = progress_percents(&events);
    assert!(percents.iter().all(|p| (0.0..=100.0).contains(p)));
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(percents.last().copied(), Some(100.0));
}

/// Test: a 503 on one part is retried against the same signed URL
#[tokio::test]
async fn test_part_retry_reuses_signed_url() {
    let env = MockEnv::start().await;
    let name = "retry.bin";

    env.mount_initiate(name, "upload-r").await;
    env.mount_part(name, "upload-r", 1, "etag-1").await;

    Mock::given(method("PUT"))
        .and(path(MockEnv::object_path(name)))
        .and(query_param("partNumber", "2"))
        .respond_with(ResponseTemplate::new(503).set_body_string("SlowDown"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&env.server)
        .await;
    env.mount_part(name, "upload-r", 2, "etag-2").await;
    env.mount_complete(name, "upload-r", "final", 1).await;

    let upload = env
        .upload(payload(6 * MIB), name)
        .multipart_threshold(MIB as u64)
        .max_parts(2)
        .retry(RetryPolicy::new(2, Duration::from_millis(10)))
        .build()
        .unwrap();

    let result = upload.end().await.unwrap();
    assert_eq!(result.etag.as_deref(), Some("final"));

    let part_two_puts = env
        .requests("PUT")
        .await
        .into_iter()
        .filter(|request| request.url.query().unwrap_or_default().contains("partNumber=2"))
        .count();
    assert_eq!(part_two_puts, 2);

    let part_two_signs = env
        .sign_calls()
        .await
        .into_iter()
        .filter(|call| {
            call.get("query")
                .is_some_and(|query| query.starts_with("?partNumber=2"))
        })
        .count();
    assert_eq!(part_two_signs, 1);
}
