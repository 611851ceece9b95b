//! Cloud-driven OTA firmware updates with post-reboot validation and
//! automatic rollback.
//!
//! The engine lives in [`ota`]; it reaches the device only through the
//! capability traits in [`platform`], so the same code runs on ESP-IDF and
//! against the in-memory simulator on the host.

pub mod config;
pub mod logging;
pub mod ota;
pub mod platform;
pub mod system;
pub mod version;

pub use config::OtaConfig;
pub use ota::{OtaCallbacks, OtaEngine, OtaError};
pub use platform::Platform;
