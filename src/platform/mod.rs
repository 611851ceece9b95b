//! Capabilities the OTA engine consumes from the device.
//!
//! The engine never talks to ESP-IDF directly: the HTTP client, the OTA
//! partitions, NVS and the timer service are reached through the traits
//! below. `esp` wires them to ESP-IDF on the device, `sim` provides
//! in-memory versions used by the host simulator and the tests.

use anyhow::Result;
use std::sync::Arc;

pub use crate::system::timer::{TimerHandle, TimerService};

#[cfg(target_os = "espidf")]
pub mod esp;
pub mod sim;

/// Status code plus body of a finished request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

/// Streamed firmware image; `read` returns 0 at end of stream
pub trait ImageSource: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// Authenticated connection to the OTA service.
///
/// `path` is relative to the service base (e.g. `otafetch`), `url` in
/// `open_image` is the absolute image location taken from the job.
pub trait Transport: Send + Sync {
    fn get(&self, path: &str) -> Result<TransportResponse>;
    fn post(&self, path: &str, body: &[u8]) -> Result<TransportResponse>;
    fn open_image(&self, url: &str) -> Result<Box<dyn ImageSource>>;
}

/// Verification state of the running image as tracked by the bootloader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// First boot after an OTA apply, waiting for confirmation
    PendingVerify,
    Valid,
    Invalid,
    /// Factory image or no OTA data at all
    Undefined,
}

/// Sink for image bytes while an update is open
pub trait ImageWriter {
    fn write(&mut self, chunk: &[u8]) -> Result<()>;
}

pub trait PartitionManager: Send + Sync {
    fn running_state(&self) -> Result<SlotState>;

    fn mark_valid(&self) -> Result<()>;

    /// Mark the running image invalid and boot back into the previous one.
    /// On a real device this does not return on success.
    fn mark_invalid_and_rollback(&self) -> Result<()>;

    /// Open an update on the inactive slot and hand its writer to `fill`.
    /// The image is completed and set as boot slot if `fill` succeeds,
    /// aborted otherwise.
    fn flash_image(&self, fill: &mut dyn FnMut(&mut dyn ImageWriter) -> Result<()>) -> Result<()>;

    fn restart(&self);
}

/// Durable key/value storage grouped in namespaces (NVS on the device)
pub trait KeyValueStore: Send + Sync {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>>;
    fn set(&self, namespace: &str, key: &str, value: &[u8]) -> Result<()>;
    /// Erasing a missing key is not an error
    fn erase(&self, namespace: &str, key: &str) -> Result<()>;
}

/// Everything the engine needs from the device, shared between its tasks
#[derive(Clone)]
pub struct Platform {
    pub transport: Arc<dyn Transport>,
    pub partitions: Arc<dyn PartitionManager>,
    pub store: Arc<dyn KeyValueStore>,
    pub timers: Arc<dyn TimerService>,
}
