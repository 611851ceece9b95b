//! The OTA engine handle and its public lifecycle API.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use super::apply::{run_apply, ApplyContext, ApplyOutcome, FlashingHandler, OtaHandler};
use super::autofetch::Autofetch;
use super::error::OtaError;
use super::job::{parse_fetch_response, salvage_job_id, FetchPayload, Job, PAYLOAD_ERROR_REASON};
use super::reporter::{JobStatus, StatusReporter};
use super::validation::{BootValidation, Diagnostics, ValidationController, ValidationState};
use crate::config::OtaConfig;
use crate::platform::Platform;
use crate::system::JobIdStore;
use crate::version::FIRMWARE_VERSION;

pub const FETCH_PATH: &str = "otafetch";

/// Application hooks installed by `enable()`
#[derive(Default, Clone)]
pub struct OtaCallbacks {
    /// Decides what to do with a job; `FlashingHandler` when unset
    pub handler: Option<Arc<dyn OtaHandler>>,
    /// Self-test run on the first boot of a new image
    pub diagnostics: Option<Arc<dyn Diagnostics>>,
}

/// Result of one `fetch()`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    NoUpdate,
    /// Job id of the image now waiting for a reboot
    Applied(String),
    Deferred(String),
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    pub enabled: bool,
    pub in_progress: bool,
    pub valid: bool,
    pub validation: ValidationState,
    pub job_id: Option<String>,
}

struct Enabled {
    config: OtaConfig,
    handler: Arc<dyn OtaHandler>,
    autofetch: Option<Autofetch>,
}

struct Inner {
    platform: Platform,
    firmware_version: String,
    job_ids: JobIdStore,
    reporter: Arc<StatusReporter>,
    boot: Arc<BootValidation>,
    in_progress: AtomicBool,
    job: Mutex<Option<Job>>,
    enabled: Mutex<Option<Enabled>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears the live job and the in-progress flag when the fetch that set
/// them ends, whichever way it ends
struct InProgress<'a> {
    inner: &'a Inner,
}

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        lock(&self.inner.job).take();
        self.inner.in_progress.store(false, Ordering::SeqCst);
    }
}

/// Cheap to clone; all clones drive the same engine
#[derive(Clone)]
pub struct OtaEngine {
    inner: Arc<Inner>,
}

impl OtaEngine {
    pub fn new(platform: Platform) -> Self {
        Self::with_firmware_version(platform, FIRMWARE_VERSION)
    }

    /// Engine reporting `version` as the running firmware to the service
    pub fn with_firmware_version(platform: Platform, version: &str) -> Self {
        let job_ids = JobIdStore::new(platform.store.clone());
        let reporter = Arc::new(StatusReporter::new(platform.transport.clone(), job_ids.clone()));
        let boot = Arc::new(BootValidation::new(platform.partitions.clone()));
        Self {
            inner: Arc::new(Inner {
                platform,
                firmware_version: version.to_string(),
                job_ids,
                reporter,
                boot,
                in_progress: AtomicBool::new(false),
                job: Mutex::new(None),
                enabled: Mutex::new(None),
            }),
        }
    }

    /// Install the callbacks and autofetch, then validate the running image.
    ///
    /// Validation runs once per engine; enabling again after `disable()`
    /// only restores fetching.
    pub fn enable(&self, config: OtaConfig, callbacks: OtaCallbacks) -> Result<(), OtaError> {
        let mut enabled = lock(&self.inner.enabled);
        if enabled.is_some() {
            return Err(OtaError::AlreadyEnabled);
        }
        config
            .validate()
            .map_err(|e| OtaError::InvalidConfig(e.to_string()))?;

        let autofetch = match config.autofetch_period() {
            Some(period) => {
                let weak = Arc::downgrade(&self.inner);
                Some(Autofetch::start(
                    self.inner.platform.timers.as_ref(),
                    period,
                    move || autofetch_tick(&weak),
                )?)
            }
            None => {
                log::info!("Autofetch disabled");
                None
            }
        };

        let handler = callbacks
            .handler
            .unwrap_or_else(|| Arc::new(FlashingHandler) as Arc<dyn OtaHandler>);
        let validation = ValidationController {
            boot: Arc::clone(&self.inner.boot),
            partitions: self.inner.platform.partitions.clone(),
            reporter: Arc::clone(&self.inner.reporter),
            job_ids: self.inner.job_ids.clone(),
            timers: self.inner.platform.timers.clone(),
            diagnostics: callbacks.diagnostics,
            rollback_timeout: config.rollback_timeout(),
            retry_interval: config.confirm_retry_interval(),
        };
        *enabled = Some(Enabled {
            config,
            handler,
            autofetch,
        });
        drop(enabled);
        log::info!("OTA engine enabled (firmware {})", self.inner.firmware_version);

        if self.inner.boot.state() == ValidationState::Init {
            match validation.run() {
                Ok(state) => log::info!("Boot validation: {:?}", state),
                Err(e) => log::error!("Boot validation failed: {}", e),
            }
        }
        Ok(())
    }

    /// Stop autofetch and refuse further fetches. The rollback timer and
    /// a pending success confirmation keep running.
    pub fn disable(&self) -> Result<(), OtaError> {
        let mut state = lock(&self.inner.enabled).take().ok_or(OtaError::NotEnabled)?;
        if let Some(autofetch) = state.autofetch.as_mut() {
            autofetch.stop();
        }
        log::info!("OTA engine disabled");
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        lock(&self.inner.enabled).is_some()
    }

    pub fn is_in_progress(&self) -> bool {
        self.inner.in_progress.load(Ordering::SeqCst)
    }

    /// Ask the service for a job and, if there is one, apply it.
    ///
    /// Blocks until the apply task has finished. Fails with `InvalidState`
    /// without any I/O while another job is in progress.
    pub fn fetch(&self) -> Result<FetchOutcome, OtaError> {
        let inner = &*self.inner;
        if inner.in_progress.load(Ordering::SeqCst) {
            return Err(OtaError::InvalidState("OTA already in progress"));
        }
        let (handler, config) = {
            let enabled = lock(&inner.enabled);
            let enabled = enabled.as_ref().ok_or(OtaError::NotEnabled)?;
            (Arc::clone(&enabled.handler), enabled.config.clone())
        };

        let path = format!("{}?fw_version={}", FETCH_PATH, inner.firmware_version);
        log::info!("Fetching OTA job");
        let response = inner.platform.transport.get(&path).map_err(OtaError::Transport)?;

        let payload = match parse_fetch_response(&response.body) {
            Ok(payload) => payload,
            Err(OtaError::Parse(_)) if !response.is_ok() => {
                return Err(OtaError::Http {
                    status: response.status,
                })
            }
            Err(e @ OtaError::Parse(_)) => {
                log::error!("Rejecting OTA payload: {}", e);
                let job_id = salvage_job_id(&response.body);
                inner.reporter.report_logged(
                    job_id.as_deref().unwrap_or(""),
                    JobStatus::Rejected,
                    PAYLOAD_ERROR_REASON,
                );
                return Err(e);
            }
            Err(e) => {
                log::error!("OTA fetch failed: {}", e);
                return Err(e);
            }
        };

        let job = match payload {
            FetchPayload::NoUpdate => {
                log::info!("No OTA update available");
                return Ok(FetchOutcome::NoUpdate);
            }
            FetchPayload::Rejected { job_id, rejection } => {
                let reason = rejection.reason();
                log::error!("Rejecting OTA job: {}", reason);
                inner
                    .reporter
                    .report_logged(job_id.as_deref().unwrap_or(""), JobStatus::Rejected, reason);
                return Err(OtaError::InvalidJob(reason));
            }
            FetchPayload::Job(job) => job,
        };

        if inner
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(OtaError::InvalidState("OTA already in progress"));
        }
        let guard = InProgress { inner };
        *lock(&inner.job) = Some(job.clone());
        log::info!(
            "OTA job {} accepted: {} ({} bytes)",
            job.job_id,
            job.url,
            job.file_size
        );

        inner
            .reporter
            .report_logged(&job.job_id, JobStatus::Accepted, "Job accepted");

        let job_id = job.job_id.clone();
        let ctx = ApplyContext {
            transport: inner.platform.transport.clone(),
            partitions: inner.platform.partitions.clone(),
            reporter: Arc::clone(&inner.reporter),
            chunk_size: config.download_chunk_size,
        };
        let outcome = run_apply(
            job,
            handler,
            ctx,
            inner.job_ids.clone(),
            config.apply_task_stack_size,
        )?;
        drop(guard);

        Ok(match outcome {
            ApplyOutcome::Applied => {
                log::info!("OTA job {} applied", job_id);
                if config.restart_after_apply {
                    log::warn!("Restarting into the new firmware");
                    inner.platform.partitions.restart();
                }
                FetchOutcome::Applied(job_id)
            }
            ApplyOutcome::Deferred(reason) => {
                log::info!("OTA job {} deferred: {}", job_id, reason);
                FetchOutcome::Deferred(reason)
            }
            ApplyOutcome::Rejected(reason) => {
                log::warn!("OTA job {} rejected: {}", job_id, reason);
                FetchOutcome::Rejected(reason)
            }
        })
    }

    /// Mark the running image valid and stop the rollback timer.
    /// Calling it twice is harmless.
    pub fn mark_valid(&self) -> Result<(), OtaError> {
        self.inner.boot.mark_valid()
    }

    /// Mark the running image invalid and roll back
    pub fn mark_invalid(&self) -> Result<(), OtaError> {
        self.inner.boot.mark_invalid()
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            enabled: self.is_enabled(),
            in_progress: self.is_in_progress(),
            valid: self.inner.boot.is_valid(),
            validation: self.inner.boot.state(),
            job_id: lock(&self.inner.job).as_ref().map(|job| job.job_id.clone()),
        }
    }

    /// Block until the post-OTA success report has gone out, or the image
    /// has been rolled back. Returns right away when nothing is pending.
    pub fn wait_for_confirmation(&self) -> ValidationState {
        self.inner.boot.wait_for_confirmation()
    }

    pub fn rollback_armed(&self) -> bool {
        self.inner.boot.rollback_armed()
    }
}

fn autofetch_tick(engine: &Weak<Inner>) {
    let Some(inner) = engine.upgrade() else {
        return;
    };
    match (OtaEngine { inner }).fetch() {
        Ok(FetchOutcome::NoUpdate) => {}
        Ok(outcome) => log::info!("Autofetch: {:?}", outcome),
        Err(e) => log::warn!("Autofetch failed: {}", e),
    }
}
