use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use super::error::OtaError;
use super::job::Job;
use crate::platform::Transport;
use crate::system::{CancelToken, JobIdStore};

pub const REPORT_PATH: &str = "otastatus";

/// Longest `additional_info` sent to the service
pub const MAX_INFO_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Accepted,
    InProgress,
    Success,
    Rejected,
    Delayed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Accepted => "accepted",
            JobStatus::InProgress => "in_progress",
            JobStatus::Success => "success",
            JobStatus::Rejected => "rejected",
            JobStatus::Delayed => "delayed",
        }
    }
}

#[derive(Serialize)]
struct StatusReport<'a> {
    ota_job_id: &'a str,
    status: &'static str,
    additional_info: &'a str,
}

fn truncate_info(info: &str) -> &str {
    if info.len() <= MAX_INFO_LEN {
        return info;
    }
    let mut end = MAX_INFO_LEN;
    while !info.is_char_boundary(end) {
        end -= 1;
    }
    &info[..end]
}

/// Builds the `otastatus` body
pub fn report_body(job_id: &str, status: JobStatus, info: &str) -> Result<Vec<u8>, OtaError> {
    let report = StatusReport {
        ota_job_id: job_id,
        status: status.as_str(),
        additional_info: truncate_info(info),
    };
    serde_json::to_vec(&report).map_err(|e| OtaError::Parse(e.to_string()))
}

/// Tells the OTA service how a job is going
pub struct StatusReporter {
    transport: Arc<dyn Transport>,
    job_ids: JobIdStore,
}

impl StatusReporter {
    pub fn new(transport: Arc<dyn Transport>, job_ids: JobIdStore) -> Self {
        Self { transport, job_ids }
    }

    /// Report against the live job, or the persisted id when there is none
    /// (the post-reboot case)
    pub fn report(&self, job: Option<&Job>, status: JobStatus, info: &str) -> Result<(), OtaError> {
        match job {
            Some(job) => self.report_for_id(&job.job_id, status, info),
            None => {
                let id = self
                    .job_ids
                    .load()
                    .map_err(OtaError::Storage)?
                    .ok_or(OtaError::NotFound("no OTA job id to report against"))?;
                self.report_for_id(&id, status, info)
            }
        }
    }

    /// Single POST; a transport failure or non-200 answer is returned
    pub fn report_for_id(&self, job_id: &str, status: JobStatus, info: &str) -> Result<(), OtaError> {
        let body = report_body(job_id, status, info)?;
        let response = self
            .transport
            .post(REPORT_PATH, &body)
            .map_err(OtaError::Transport)?;
        if !response.is_ok() {
            return Err(OtaError::Http { status: response.status });
        }
        log::info!("Reported OTA job {} as {} ({})", job_id, status.as_str(), info);
        Ok(())
    }

    /// Fire-and-forget variant used on the rejection and progress paths:
    /// a failure is logged once and not retried
    pub fn report_logged(&self, job_id: &str, status: JobStatus, info: &str) {
        if let Err(e) = self.report_for_id(job_id, status, info) {
            log::warn!("Failed to report OTA job {} as {}: {}", job_id, status.as_str(), e);
        }
    }

    /// Report success for the persisted job until the service acknowledges
    /// it. Only `cancel` stops the loop; returns whether the report went out.
    pub fn confirm_success(&self, interval: Duration, cancel: &CancelToken) -> bool {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            attempt += 1;
            match self.report(None, JobStatus::Success, "Firmware booted and confirmed") {
                Ok(()) => {
                    log::info!("OTA success confirmed after {} attempt(s)", attempt);
                    return true;
                }
                Err(e) => {
                    log::warn!(
                        "OTA success report failed (attempt {}): {}. Retrying in {} ms",
                        attempt,
                        e,
                        interval.as_millis()
                    );
                }
            }
            if cancel.wait(interval) {
                return false;
            }
        }
    }
}
