//! Post-OTA validation and rollback, run once per boot.
//!
//! On the first boot of a new image the bootloader reports the slot as
//! pending verification. The controller then:
//! 1. arms a one-shot rollback timer as the upper bound on how long an
//!    unconfirmed image may run,
//! 2. runs the application diagnostics, rolling back at once if they fail,
//! 3. reports success to the service on the `ota-confirm` thread, retrying
//!    until it goes through, then marks the image valid and forgets the job.
//!
//! The rollback timer, the confirmation thread and `mark_valid()` all decide
//! the terminal state under the same lock, so exactly one of them wins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::error::OtaError;
use super::reporter::{JobStatus, StatusReporter};
use crate::platform::{PartitionManager, SlotState, TimerHandle, TimerService};
use crate::system::{CancelToken, JobIdStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationState {
    Init,
    PendingVerify,
    Validating,
    Valid,
    Invalid,
    NotOtaBoot,
}

/// Application self-test run on the first boot of a new image
pub trait Diagnostics: Send + Sync {
    fn diagnose(&self) -> anyhow::Result<()>;
}

impl<F> Diagnostics for F
where
    F: Fn() -> anyhow::Result<()> + Send + Sync,
{
    fn diagnose(&self) -> anyhow::Result<()> {
        self()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Validation state of the running image, shared with the timer callback
/// and the confirmation thread
pub struct BootValidation {
    partitions: Arc<dyn PartitionManager>,
    state: Mutex<ValidationState>,
    valid: AtomicBool,
    rollback_timer: Mutex<Option<TimerHandle>>,
    confirm_cancel: Arc<CancelToken>,
    confirm_task: Mutex<Option<JoinHandle<()>>>,
}

impl BootValidation {
    pub fn new(partitions: Arc<dyn PartitionManager>) -> Self {
        Self {
            partitions,
            state: Mutex::new(ValidationState::Init),
            valid: AtomicBool::new(false),
            rollback_timer: Mutex::new(None),
            confirm_cancel: CancelToken::new(),
            confirm_task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ValidationState {
        *lock(&self.state)
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    pub fn rollback_armed(&self) -> bool {
        lock(&self.rollback_timer).is_some()
    }

    fn cancel_rollback_timer(&self) {
        if let Some(mut timer) = lock(&self.rollback_timer).take() {
            if timer.cancel() {
                log::info!("Rollback timer cancelled");
            }
        }
    }

    /// Mark the running image valid. Calling it again is harmless.
    pub fn mark_valid(&self) -> Result<(), OtaError> {
        let mut state = lock(&self.state);
        self.cancel_rollback_timer();
        self.partitions.mark_valid().map_err(OtaError::Partition)?;
        self.valid.store(true, Ordering::SeqCst);
        if *state != ValidationState::NotOtaBoot {
            *state = ValidationState::Valid;
        }
        log::info!("Running firmware marked valid");
        Ok(())
    }

    /// Mark the running image invalid and roll back without waiting
    pub fn mark_invalid(&self) -> Result<(), OtaError> {
        let mut state = lock(&self.state);
        self.confirm_cancel.cancel();
        self.cancel_rollback_timer();
        self.valid.store(false, Ordering::SeqCst);
        *state = ValidationState::Invalid;
        log::warn!("Running firmware marked invalid, rolling back");
        self.partitions
            .mark_invalid_and_rollback()
            .map_err(OtaError::Partition)
    }

    fn rollback_timer_fired(&self) {
        let mut state = lock(&self.state);
        if *state != ValidationState::Validating || self.is_valid() {
            return;
        }
        log::error!("Firmware not confirmed before the rollback timeout, rolling back");
        self.confirm_cancel.cancel();
        *state = ValidationState::Invalid;
        if let Err(e) = self.partitions.mark_invalid_and_rollback() {
            log::error!("Rollback failed: {:#}", e);
        }
    }

    fn confirmation_succeeded(&self, job_ids: &JobIdStore) {
        {
            let mut state = lock(&self.state);
            if *state == ValidationState::Invalid {
                log::warn!("Success reported but the image was already rolled back");
                return;
            }
            self.cancel_rollback_timer();
            if let Err(e) = self.partitions.mark_valid() {
                log::error!("Failed to mark firmware valid: {:#}", e);
            }
            self.valid.store(true, Ordering::SeqCst);
            *state = ValidationState::Valid;
        }
        if let Err(e) = job_ids.erase() {
            log::error!("Failed to erase persisted OTA job id: {:#}", e);
        }
        log::info!("New firmware validated");
    }

    /// Block until the confirmation thread, if any, has finished
    pub fn wait_for_confirmation(&self) -> ValidationState {
        let task = lock(&self.confirm_task).take();
        if let Some(task) = task {
            if task.join().is_err() {
                log::error!("OTA confirmation task panicked");
            }
        }
        self.state()
    }

    fn set_state(&self, next: ValidationState) {
        let mut state = lock(&self.state);
        log::debug!("OTA validation: {:?} -> {:?}", *state, next);
        *state = next;
    }
}

/// Everything the per-boot validation needs
pub struct ValidationController {
    pub boot: Arc<BootValidation>,
    pub partitions: Arc<dyn PartitionManager>,
    pub reporter: Arc<StatusReporter>,
    pub job_ids: JobIdStore,
    pub timers: Arc<dyn TimerService>,
    pub diagnostics: Option<Arc<dyn Diagnostics>>,
    pub rollback_timeout: Duration,
    pub retry_interval: Duration,
}

impl ValidationController {
    /// Inspect the running slot and start whatever this boot needs.
    ///
    /// Returns `Validating` while the success report is still in flight on
    /// the confirmation thread.
    pub fn run(&self) -> Result<ValidationState, OtaError> {
        let slot = self.partitions.running_state().map_err(OtaError::Partition)?;
        log::info!("Running firmware slot state: {:?}", slot);

        match slot {
            SlotState::PendingVerify => self.verify_new_image(),
            SlotState::Valid => {
                self.boot.valid.store(true, Ordering::SeqCst);
                self.boot.set_state(ValidationState::Valid);
                self.reconcile_rolled_back_job();
                Ok(ValidationState::Valid)
            }
            SlotState::Invalid | SlotState::Undefined => {
                self.boot.set_state(ValidationState::NotOtaBoot);
                Ok(ValidationState::NotOtaBoot)
            }
        }
    }

    /// A job id left over on a normal boot means the new image never got
    /// confirmed: the device is back on the previous firmware.
    fn reconcile_rolled_back_job(&self) {
        let job_id = match self.job_ids.load() {
            Ok(Some(id)) => id,
            Ok(None) => return,
            Err(e) => {
                log::error!("Failed to read persisted OTA job id: {:#}", e);
                return;
            }
        };
        log::warn!("OTA job {} did not take effect, firmware was rolled back", job_id);
        if let Err(e) = self.job_ids.erase() {
            log::error!("Failed to erase persisted OTA job id: {:#}", e);
        }
        self.reporter
            .report_logged(&job_id, JobStatus::Rejected, "Firmware rolled back");
    }

    fn verify_new_image(&self) -> Result<ValidationState, OtaError> {
        self.boot.set_state(ValidationState::PendingVerify);
        log::info!("First boot after OTA, validating new firmware");
        self.boot.set_state(ValidationState::Validating);

        let boot = Arc::clone(&self.boot);
        match self.timers.schedule_once(
            self.rollback_timeout,
            Box::new(move || boot.rollback_timer_fired()),
        ) {
            Ok(timer) => {
                *lock(&self.boot.rollback_timer) = Some(timer);
                log::info!("Rollback timer armed for {} s", self.rollback_timeout.as_secs());
            }
            Err(e) => log::error!("Failed to arm rollback timer: {:#}", e),
        }

        if let Some(diagnostics) = &self.diagnostics {
            if let Err(e) = diagnostics.diagnose() {
                log::error!("Post-OTA diagnostics failed: {:#}", e);
                self.boot.mark_invalid()?;
                return Ok(ValidationState::Invalid);
            }
            log::info!("Post-OTA diagnostics passed");
        }

        match self.job_ids.load() {
            // Image not installed through a cloud job: nothing to report
            Ok(None) => {
                log::warn!("No OTA job id persisted, marking new firmware valid without a report");
                self.boot.confirmation_succeeded(&self.job_ids);
                return Ok(self.boot.state());
            }
            // Every confirmation attempt reads the id again; the rollback
            // timer still bounds the wait
            Err(e) => log::error!("Failed to read persisted OTA job id: {:#}", e),
            Ok(Some(_)) => {}
        }

        self.spawn_confirmation();
        Ok(self.boot.state())
    }

    fn spawn_confirmation(&self) {
        let boot = Arc::clone(&self.boot);
        let reporter = Arc::clone(&self.reporter);
        let job_ids = self.job_ids.clone();
        let interval = self.retry_interval;

        let spawned = thread::Builder::new()
            .name("ota-confirm".into())
            .spawn(move || confirm(&boot, &reporter, &job_ids, interval));

        match spawned {
            Ok(task) => *lock(&self.boot.confirm_task) = Some(task),
            Err(e) => {
                log::error!("Failed to spawn confirmation task ({}), confirming inline", e);
                confirm(&self.boot, &self.reporter, &self.job_ids, interval);
            }
        }
    }
}

fn confirm(boot: &BootValidation, reporter: &StatusReporter, job_ids: &JobIdStore, interval: Duration) {
    if reporter.confirm_success(interval, &boot.confirm_cancel) {
        boot.confirmation_succeeded(job_ids);
    }
}
