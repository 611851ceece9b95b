//! Download and apply of one job, run on its own thread.
//!
//! Closing the HTTP client in the middle of a stream can block inside the
//! transport, so the whole download + flash sequence runs on a dedicated
//! `ota-apply` thread. The caller waits on a one-shot channel that carries
//! the outcome.

use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::sync::{mpsc, Arc};
use std::thread;

use super::error::OtaError;
use super::job::Job;
use super::reporter::{JobStatus, StatusReporter};
use crate::platform::{ImageWriter, PartitionManager, Transport};
use crate::system::JobIdStore;

// Host threads need far more stack than the device task for the same code
#[cfg(target_os = "espidf")]
const PLATFORM_MIN_STACK: usize = 4096;
#[cfg(not(target_os = "espidf"))]
const PLATFORM_MIN_STACK: usize = 256 * 1024;

/// What the application decided to do with a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Image written and set as boot slot; a reboot activates it
    Applied,
    /// Not now; the service is told the job is delayed
    Deferred(String),
    /// Not at all, or the apply failed; reported as rejected
    Rejected(String),
}

/// Summary of a streamed image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSummary {
    pub bytes: u64,
    pub sha256: String,
}

/// Capabilities handed to an [`OtaHandler`] while it applies a job
pub struct ApplyContext {
    pub transport: Arc<dyn Transport>,
    pub partitions: Arc<dyn PartitionManager>,
    pub reporter: Arc<StatusReporter>,
    pub chunk_size: usize,
}

impl ApplyContext {
    /// Report progress for the job; failures are only logged
    pub fn report_progress(&self, job: &Job, info: &str) {
        self.reporter.report_logged(&job.job_id, JobStatus::InProgress, info);
    }

    /// Stream the job's image into the inactive slot.
    ///
    /// Rejects an empty image and one whose length differs from the job's
    /// `file_size`; the partition manager aborts the update in both cases.
    /// An oversized image is cut off at the first chunk past `file_size`.
    pub fn download_and_flash(&self, job: &Job) -> anyhow::Result<ImageSummary> {
        let mut source = self.transport.open_image(&job.url)?;
        let mut buf = vec![0u8; self.chunk_size.max(1)];
        let mut hasher = Sha256::new();
        let mut written: u64 = 0;
        let mut last_decile: u64 = 0;

        self.partitions.flash_image(&mut |writer: &mut dyn ImageWriter| -> anyhow::Result<()> {
            loop {
                let n = source.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                written += n as u64;
                if written > job.file_size {
                    anyhow::bail!("image larger than expected {} bytes", job.file_size);
                }
                writer.write(&buf[..n])?;
                hasher.update(&buf[..n]);

                if job.file_size > 0 {
                    let decile = (written.saturating_mul(10) / job.file_size).min(10);
                    if decile > last_decile {
                        log::info!(
                            "OTA progress: {}% ({}/{})",
                            decile * 10,
                            written,
                            job.file_size
                        );
                        last_decile = decile;
                    }
                }
            }

            if written == 0 {
                anyhow::bail!("image download returned 0 bytes");
            }
            if written != job.file_size {
                anyhow::bail!("image size mismatch: expected {}, got {}", job.file_size, written);
            }
            Ok(())
        })?;

        let mut sha256 = String::with_capacity(64);
        for byte in hasher.finalize() {
            let _ = write!(&mut sha256, "{:02x}", byte);
        }
        Ok(ImageSummary { bytes: written, sha256 })
    }
}

/// Application hook deciding what happens to a fetched job
pub trait OtaHandler: Send + Sync {
    fn apply(&self, job: &Job, ctx: &ApplyContext) -> ApplyOutcome;
}

impl<F> OtaHandler for F
where
    F: Fn(&Job, &ApplyContext) -> ApplyOutcome + Send + Sync,
{
    fn apply(&self, job: &Job, ctx: &ApplyContext) -> ApplyOutcome {
        self(job, ctx)
    }
}

/// Default handler: download, flash, and leave the reboot to the engine
#[derive(Debug, Default, Clone, Copy)]
pub struct FlashingHandler;

impl OtaHandler for FlashingHandler {
    fn apply(&self, job: &Job, ctx: &ApplyContext) -> ApplyOutcome {
        log::info!(
            "Applying OTA job {} ({} bytes, version {})",
            job.job_id,
            job.file_size,
            job.fw_version.as_deref().unwrap_or("unknown")
        );
        ctx.report_progress(job, "Downloading firmware image");

        match ctx.download_and_flash(job) {
            Ok(summary) => {
                log::info!("OTA image written: {} bytes, sha256 {}", summary.bytes, summary.sha256);
                ctx.report_progress(job, "Firmware written, rebooting");
                ApplyOutcome::Applied
            }
            Err(e) => {
                log::error!("OTA apply failed for job {}: {:#}", job.job_id, e);
                ApplyOutcome::Rejected(format!("Firmware apply failed: {}", e))
            }
        }
    }
}

/// Run `handler` for `job` on the `ota-apply` thread and wait for it.
///
/// On `Applied` the job id is persisted before the outcome is sent back, so
/// it is on flash before anything can reboot the device. If it cannot be
/// persisted the job is rejected instead. Rejections and deferrals are
/// reported here, once.
pub fn run_apply(
    job: Job,
    handler: Arc<dyn OtaHandler>,
    ctx: ApplyContext,
    job_ids: JobIdStore,
    stack_size: usize,
) -> Result<ApplyOutcome, OtaError> {
    let (done_tx, done_rx) = mpsc::sync_channel::<ApplyOutcome>(1);

    let worker = thread::Builder::new()
        .name("ota-apply".into())
        .stack_size(stack_size.max(PLATFORM_MIN_STACK))
        .spawn(move || {
            let mut outcome = handler.apply(&job, &ctx);
            if outcome == ApplyOutcome::Applied {
                if let Err(e) = job_ids.save(&job.job_id) {
                    log::error!("Failed to persist OTA job id {}: {:#}", job.job_id, e);
                    outcome = ApplyOutcome::Rejected(format!("Failed to persist job id: {}", e));
                }
            }
            match &outcome {
                ApplyOutcome::Applied => {}
                ApplyOutcome::Deferred(reason) => {
                    ctx.reporter.report_logged(&job.job_id, JobStatus::Delayed, reason);
                }
                ApplyOutcome::Rejected(reason) => {
                    ctx.reporter.report_logged(&job.job_id, JobStatus::Rejected, reason);
                }
            }
            let _ = done_tx.send(outcome);
        })
        .map_err(|e| OtaError::Apply(format!("failed to spawn apply task: {}", e)))?;

    // No timeout: an apply cannot be cancelled once started
    let outcome = done_rx
        .recv()
        .map_err(|_| OtaError::Apply("apply task ended without an outcome".into()));
    let _ = worker.join();
    outcome
}
