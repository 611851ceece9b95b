use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::platform::KeyValueStore;
use crate::system::Storage;

const CONFIG_NAMESPACE: &str = "ota_cfg";
const CONFIG_KEY: &str = "config";

pub const MIN_APPLY_STACK_SIZE: usize = 4096;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OtaConfig {
    // Autofetch, 0 disables the periodic check
    pub autofetch_period_hours: u32,

    // Post-OTA validation
    pub rollback_timeout_secs: u32,
    pub confirm_retry_interval_ms: u64,

    // Apply task
    pub apply_task_stack_size: usize,
    pub download_chunk_size: usize,
    pub restart_after_apply: bool,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            autofetch_period_hours: 24,
            rollback_timeout_secs: 90,
            confirm_retry_interval_ms: 5000,
            apply_task_stack_size: 8192,
            download_chunk_size: 4096,
            restart_after_apply: true,
        }
    }
}

impl OtaConfig {
    pub fn autofetch_period(&self) -> Option<Duration> {
        match self.autofetch_period_hours {
            0 => None,
            hours => Some(Duration::from_secs(u64::from(hours) * 3600)),
        }
    }

    pub fn rollback_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.rollback_timeout_secs))
    }

    pub fn confirm_retry_interval(&self) -> Duration {
        Duration::from_millis(self.confirm_retry_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rollback_timeout_secs == 0 {
            bail!("rollback timeout must be at least one second");
        }
        if self.confirm_retry_interval_ms == 0 {
            bail!("confirmation retry interval cannot be zero");
        }
        if self.apply_task_stack_size < MIN_APPLY_STACK_SIZE {
            bail!(
                "apply task stack must be at least {} bytes (got {})",
                MIN_APPLY_STACK_SIZE,
                self.apply_task_stack_size
            );
        }
        if self.download_chunk_size == 0 {
            bail!("download chunk size cannot be zero");
        }
        Ok(())
    }

    pub fn save(&self, storage: &Storage) -> Result<()> {
        storage.write(CONFIG_KEY, self)?;
        log::info!("OTA configuration saved");
        Ok(())
    }
}

/// Namespace the configuration lives in
pub fn config_storage(backend: Arc<dyn KeyValueStore>) -> Storage {
    Storage::new(backend, CONFIG_NAMESPACE)
}

pub fn load_or_default(storage: &Storage) -> OtaConfig {
    match storage.read::<OtaConfig>(CONFIG_KEY) {
        Ok(Some(config)) => match config.validate() {
            Ok(()) => {
                log::info!("Loaded OTA configuration from storage");
                config
            }
            Err(e) => {
                log::warn!("Stored OTA configuration rejected: {}, using defaults", e);
                OtaConfig::default()
            }
        },
        Ok(None) => {
            log::info!("No stored OTA configuration, using defaults");
            OtaConfig::default()
        }
        Err(e) => {
            log::warn!("Failed to load OTA configuration: {:#}, using defaults", e);
            OtaConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::sim::MemoryStore;

    #[test]
    fn defaults_are_valid() {
        let config = OtaConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.autofetch_period(), Some(Duration::from_secs(24 * 3600)));
        assert_eq!(config.rollback_timeout(), Duration::from_secs(90));
    }

    #[test]
    fn zero_period_disables_autofetch() {
        let config = OtaConfig {
            autofetch_period_hours: 0,
            ..OtaConfig::default()
        };
        assert_eq!(config.autofetch_period(), None);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let base = OtaConfig::default();
        assert!(OtaConfig { rollback_timeout_secs: 0, ..base.clone() }.validate().is_err());
        assert!(OtaConfig { confirm_retry_interval_ms: 0, ..base.clone() }.validate().is_err());
        assert!(OtaConfig { apply_task_stack_size: 1024, ..base.clone() }.validate().is_err());
        assert!(OtaConfig { download_chunk_size: 0, ..base }.validate().is_err());
    }

    #[test]
    fn round_trips_through_storage() {
        let storage = config_storage(Arc::new(MemoryStore::new()));
        assert_eq!(load_or_default(&storage), OtaConfig::default());

        let custom = OtaConfig {
            autofetch_period_hours: 6,
            rollback_timeout_secs: 30,
            ..OtaConfig::default()
        };
        custom.save(&storage).unwrap();
        assert_eq!(load_or_default(&storage), custom);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let storage = config_storage(Arc::new(MemoryStore::new()));
        storage.write_raw(CONFIG_KEY, br#"{"autofetch_period_hours":0}"#).unwrap();
        let config = load_or_default(&storage);
        assert_eq!(config.autofetch_period_hours, 0);
        assert_eq!(config.rollback_timeout_secs, 90);
    }

    #[test]
    fn invalid_stored_config_falls_back() {
        let storage = config_storage(Arc::new(MemoryStore::new()));
        storage.write_raw(CONFIG_KEY, br#"{"rollback_timeout_secs":0}"#).unwrap();
        assert_eq!(load_or_default(&storage), OtaConfig::default());

        storage.write_raw(CONFIG_KEY, b"garbage").unwrap();
        assert_eq!(load_or_default(&storage), OtaConfig::default());
    }
}
