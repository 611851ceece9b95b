use serde::Deserialize;
use std::borrow::Cow;

use super::error::OtaError;

/// Error code the OTA service returns when no job is pending for the node
pub const NO_UPDATE_ERROR_CODE: i64 = 105065;

/// One cloud-issued firmware update work item
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub job_id: String,
    pub url: String,
    pub file_size: u64,
    pub fw_version: Option<String>,
    /// Opaque to the engine, handed to the apply handler untouched
    pub metadata: Option<serde_json::Value>,
}

/// Why a payload describing a job was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    MissingJobId,
    MissingUrl,
    MissingFileSize,
}

impl Rejection {
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::MissingJobId => "Job id not found",
            Rejection::MissingUrl => "URL not found",
            Rejection::MissingFileSize => "File size not found",
        }
    }
}

/// Reason sent with the rejection of a body that is not a usable payload
pub const PAYLOAD_ERROR_REASON: &str = "Aborted. JSON Payload error";

/// Result of decoding an `otafetch` answer
#[derive(Debug, PartialEq)]
pub enum FetchPayload {
    Job(Job),
    NoUpdate,
    /// Valid JSON describing a job, but unusable. Carries whatever id was
    /// present so the rejection can be reported against it.
    Rejected {
        job_id: Option<String>,
        rejection: Rejection,
    },
}

/// String field that borrows from the body unless it had escapes
#[derive(Deserialize)]
struct Text<'a>(#[serde(borrow)] Cow<'a, str>);

impl Text<'_> {
    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Deserialize)]
struct RawFetch<'a> {
    #[serde(borrow, default)]
    ota_job_id: Option<Text<'a>>,
    #[serde(borrow, default)]
    url: Option<Text<'a>>,
    #[serde(default)]
    file_size: Option<u64>,
    #[serde(borrow, default)]
    fw_version: Option<Text<'a>>,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(borrow, default)]
    description: Option<Text<'a>>,
}

/// Copy a borrowed field into the job, reporting allocation failure instead
/// of aborting
fn owned(field: Text<'_>) -> Result<String, OtaError> {
    match field.0 {
        Cow::Owned(s) => Ok(s),
        Cow::Borrowed(s) => {
            let mut out = String::new();
            out.try_reserve_exact(s.len())
                .map_err(|_| OtaError::OutOfMemory)?;
            out.push_str(s);
            Ok(out)
        }
    }
}

/// Best-effort job id from a body that failed to decode as a payload, so the
/// rejection can still be reported against it
pub fn salvage_job_id(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    match value.get("ota_job_id")?.as_str()? {
        "" => None,
        id => Some(id.to_string()),
    }
}

/// Decode the body of an `otafetch` answer.
///
/// A "no update" error code is a normal empty result. Any other error code is
/// a cloud error. Fields already copied into the job are dropped if a later
/// one fails, so nothing leaks on the error paths.
pub fn parse_fetch_response(body: &[u8]) -> Result<FetchPayload, OtaError> {
    let raw: RawFetch<'_> =
        serde_json::from_slice(body).map_err(|e| OtaError::Parse(e.to_string()))?;

    if let Some(code) = raw.error_code {
        if code == NO_UPDATE_ERROR_CODE {
            return Ok(FetchPayload::NoUpdate);
        }
        let description = match raw.description {
            Some(d) => owned(d)?,
            None => String::from("unknown error"),
        };
        return Err(OtaError::Cloud { code, description });
    }

    let job_id = match raw.ota_job_id.filter(|id| !id.is_empty()) {
        Some(id) => owned(id)?,
        None => {
            return Ok(FetchPayload::Rejected {
                job_id: None,
                rejection: Rejection::MissingJobId,
            })
        }
    };
    let url = match raw.url.filter(|u| !u.is_empty()) {
        Some(u) => owned(u)?,
        None => {
            return Ok(FetchPayload::Rejected {
                job_id: Some(job_id),
                rejection: Rejection::MissingUrl,
            })
        }
    };
    let Some(file_size) = raw.file_size else {
        return Ok(FetchPayload::Rejected {
            job_id: Some(job_id),
            rejection: Rejection::MissingFileSize,
        });
    };
    let fw_version = raw.fw_version.map(owned).transpose()?;

    Ok(FetchPayload::Job(Job {
        job_id,
        url,
        file_size,
        fw_version,
        metadata: raw.metadata,
    }))
}
