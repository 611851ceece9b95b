use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::platform::KeyValueStore;

/// Namespaced view over the device key/value store
#[derive(Clone)]
pub struct Storage {
    namespace: String,
    backend: Arc<dyn KeyValueStore>,
}

impl Storage {
    pub fn new(backend: Arc<dyn KeyValueStore>, namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            backend,
        }
    }

    pub fn read<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Result<Option<T>> {
        match self.read_raw(key)? {
            Some(data) => {
                let value: T = serde_json::from_slice(&data)
                    .map_err(|e| anyhow::anyhow!("{}/{} is not valid JSON: {}", self.namespace, key, e))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let data = serde_json::to_vec(value)
            .map_err(|e| anyhow::anyhow!("failed to encode {}/{}: {}", self.namespace, key, e))?;
        self.write_raw(key, &data)
    }

    pub fn read_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.backend
            .get(&self.namespace, key)
            .with_context(|| format!("read {}/{}", self.namespace, key))
    }

    pub fn write_raw(&self, key: &str, data: &[u8]) -> Result<()> {
        self.backend
            .set(&self.namespace, key, data)
            .with_context(|| format!("write {}/{}", self.namespace, key))
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        self.backend
            .erase(&self.namespace, key)
            .with_context(|| format!("erase {}/{}", self.namespace, key))
    }
}

const JOB_NAMESPACE: &str = "ota_job";
const JOB_ID_KEY: &str = "job_id";

/// The one piece of OTA state that survives a reboot: the id of a job whose
/// image was applied but whose outcome has not been confirmed to the cloud.
#[derive(Clone)]
pub struct JobIdStore {
    storage: Storage,
}

impl JobIdStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self {
            storage: Storage::new(backend, JOB_NAMESPACE),
        }
    }

    pub fn save(&self, job_id: &str) -> Result<()> {
        self.storage.write_raw(JOB_ID_KEY, job_id.as_bytes())?;
        log::debug!("Persisted OTA job id {}", job_id);
        Ok(())
    }

    pub fn load(&self) -> Result<Option<String>> {
        match self.storage.read_raw(JOB_ID_KEY)? {
            Some(bytes) if !bytes.is_empty() => {
                let id = String::from_utf8(bytes).context("persisted job id is not UTF-8")?;
                Ok(Some(id))
            }
            _ => Ok(None),
        }
    }

    pub fn erase(&self) -> Result<()> {
        self.storage.delete(JOB_ID_KEY)?;
        log::debug!("Erased persisted OTA job id");
        Ok(())
    }
}
