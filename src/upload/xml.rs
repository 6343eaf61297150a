//! S3 multipart XML documents
//!
//! Parses `InitiateMultipartUploadResult` / `CompleteMultipartUploadResult`
//! responses and renders the `CompleteMultipartUpload` request body.

use super::part::CompletedPart;
use super::UploadError;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
struct InitiateMultipartUploadResult {
    #[serde(rename = "UploadId", default)]
    upload_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompleteMultipartUploadResult {
    #[serde(rename = "ETag", default)]
    etag: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(rename = "Code", default)]
    code: Option<String>,
    #[serde(rename = "Message", default)]
    message: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename = "CompleteMultipartUpload")]
struct CompleteMultipartUpload<'a> {
    #[serde(rename = "Part")]
    parts: Vec<CompletedPartXml<'a>>,
}

#[derive(Debug, Serialize)]
struct CompletedPartXml<'a> {
    #[serde(rename = "PartNumber")]
    part_number: u32,
    #[serde(rename = "ETag")]
    etag: &'a str,
}

/// Name of the document's root element, if it has one
fn root_element(body: &str) -> Option<String> {
    let mut reader = Reader::from_str(body);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                return Some(String::from_utf8_lossy(e.local_name().as_ref()).into_owned())
            }
            Ok(Event::Eof) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

/// Turn an S3 `<Error>` document into a store error
fn store_error(status: u16, body: &str) -> UploadError {
    match quick_xml::de::from_str::<ErrorResponse>(body) {
        Ok(ErrorResponse {
            code: Some(code),
            message,
        }) => UploadError::Store {
            status,
            body: format!("{}: {}", code, message.unwrap_or_default()),
        },
        _ => UploadError::Store {
            status,
            body: body.to_string(),
        },
    }
}

/// Extract the session id from an `InitiateMultipartUploadResult`
pub fn parse_upload_id(body: &str) -> Result<String, UploadError> {
    if body.trim().is_empty() {
        return Err(UploadError::SessionIdMissing);
    }

    let result: InitiateMultipartUploadResult = quick_xml::de::from_str(body)
        .map_err(|e| UploadError::MalformedResponse(e.to_string()))?;

    result
        .upload_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or(UploadError::SessionIdMissing)
}

/// Render the completion body, parts in ascending part-number order
pub fn complete_body(parts: &[CompletedPart]) -> Result<String, UploadError> {
    let mut sorted: Vec<&CompletedPart> = parts.iter().collect();
    sorted.sort_by_key(|part| part.part_number);

    let document = CompleteMultipartUpload {
        parts: sorted
            .into_iter()
            .map(|part| CompletedPartXml {
                part_number: part.part_number,
                etag: &part.etag,
            })
            .collect(),
    };

    quick_xml::se::to_string(&document).map_err(|e| UploadError::MalformedResponse(e.to_string()))
}

/// Interpret a 2xx completion response
///
/// The store may accept the request and still fail the assembly, reporting it
/// as an `<Error>` document with a 200 status.
pub fn parse_complete_response(status: u16, body: &str) -> Result<Option<String>, UploadError> {
    match root_element(body).as_deref() {
        None => Ok(None),
        Some("Error") => Err(store_error(status, body)),
        Some(_) => {
            let result: CompleteMultipartUploadResult = quick_xml::de::from_str(body)
                .map_err(|e| UploadError::MalformedResponse(e.to_string()))?;
            Ok(result.etag.filter(|etag| !etag.is_empty()))
        }
    }
}
