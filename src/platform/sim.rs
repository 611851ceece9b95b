//! In-memory platform used by the host simulator and the tests.
//!
//! `SimPartitions` models the bootloader closely enough to walk a full OTA
//! cycle: a flashed image becomes `PendingVerify` after `simulate_reboot()`,
//! and a rollback brings the previous image back as `Valid`.

use anyhow::{anyhow, bail, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{
    ImageSource, ImageWriter, KeyValueStore, PartitionManager, Platform, SlotState, Transport,
    TransportResponse,
};
use crate::system::timer::ThreadTimers;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<(String, String), Vec<u8>>>,
    erases: Mutex<Vec<(String, String)>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_raw(&self, namespace: &str, key: &str) -> Option<Vec<u8>> {
        lock(&self.entries)
            .get(&(namespace.to_string(), key.to_string()))
            .cloned()
    }

    /// Make every following `get` fail
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every following `set` fail
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// How many times `erase` was called for this key
    pub fn erase_count(&self, namespace: &str, key: &str) -> usize {
        lock(&self.erases)
            .iter()
            .filter(|(ns, k)| ns == namespace && k == key)
            .count()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            bail!("read of {}/{} failed", namespace, key);
        }
        Ok(self.get_raw(namespace, key))
    }

    fn set(&self, namespace: &str, key: &str, value: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("write of {}/{} failed", namespace, key);
        }
        lock(&self.entries).insert((namespace.to_string(), key.to_string()), value.to_vec());
        Ok(())
    }

    fn erase(&self, namespace: &str, key: &str) -> Result<()> {
        let id = (namespace.to_string(), key.to_string());
        lock(&self.entries).remove(&id);
        lock(&self.erases).push(id);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionStats {
    pub mark_valid_calls: usize,
    pub rollback_calls: usize,
    pub restart_calls: usize,
    pub images_flashed: usize,
}

struct SimSlots {
    running: SlotState,
    running_image: Vec<u8>,
    staged_image: Option<Vec<u8>>,
    rollback_requested: bool,
    fail_writes: bool,
    stats: PartitionStats,
}

pub struct SimPartitions {
    slots: Mutex<SimSlots>,
}

impl SimPartitions {
    pub fn new(running: SlotState) -> Self {
        Self {
            slots: Mutex::new(SimSlots {
                running,
                running_image: Vec::new(),
                staged_image: None,
                rollback_requested: false,
                fail_writes: false,
                stats: PartitionStats {
                    mark_valid_calls: 0,
                    rollback_calls: 0,
                    restart_calls: 0,
                    images_flashed: 0,
                },
            }),
        }
    }

    pub fn state(&self) -> SlotState {
        lock(&self.slots).running
    }

    pub fn stats(&self) -> PartitionStats {
        lock(&self.slots).stats.clone()
    }

    /// Image completed by the last successful `flash_image`, not booted yet
    pub fn staged_image(&self) -> Option<Vec<u8>> {
        lock(&self.slots).staged_image.clone()
    }

    pub fn running_image(&self) -> Vec<u8> {
        lock(&self.slots).running_image.clone()
    }

    /// Make every following flash write fail
    pub fn fail_writes(&self, fail: bool) {
        lock(&self.slots).fail_writes = fail;
    }

    /// Boot the device again the way the bootloader would
    pub fn simulate_reboot(&self) {
        let mut slots = lock(&self.slots);
        if slots.rollback_requested {
            slots.rollback_requested = false;
            slots.staged_image = None;
            slots.running = SlotState::Valid;
            log::info!("sim: rebooted into previous image");
        } else if let Some(image) = slots.staged_image.take() {
            slots.running_image = image;
            slots.running = SlotState::PendingVerify;
            log::info!("sim: rebooted into new image, pending verification");
        } else {
            log::info!("sim: rebooted into same image");
        }
    }
}

struct VecWriter<'a> {
    buf: Vec<u8>,
    fail: &'a bool,
}

impl ImageWriter for VecWriter<'_> {
    fn write(&mut self, chunk: &[u8]) -> Result<()> {
        if *self.fail {
            bail!("flash write failed at offset {}", self.buf.len());
        }
        self.buf.extend_from_slice(chunk);
        Ok(())
    }
}

impl PartitionManager for SimPartitions {
    fn running_state(&self) -> Result<SlotState> {
        Ok(self.state())
    }

    fn mark_valid(&self) -> Result<()> {
        let mut slots = lock(&self.slots);
        slots.stats.mark_valid_calls += 1;
        match slots.running {
            SlotState::Invalid => bail!("running image already marked invalid"),
            _ => {
                slots.running = SlotState::Valid;
                Ok(())
            }
        }
    }

    fn mark_invalid_and_rollback(&self) -> Result<()> {
        let mut slots = lock(&self.slots);
        slots.stats.rollback_calls += 1;
        slots.running = SlotState::Invalid;
        slots.rollback_requested = true;
        Ok(())
    }

    fn flash_image(&self, fill: &mut dyn FnMut(&mut dyn ImageWriter) -> Result<()>) -> Result<()> {
        let fail = lock(&self.slots).fail_writes;
        let mut writer = VecWriter {
            buf: Vec::new(),
            fail: &fail,
        };
        fill(&mut writer)?;

        let mut slots = lock(&self.slots);
        slots.staged_image = Some(writer.buf);
        slots.stats.images_flashed += 1;
        Ok(())
    }

    fn restart(&self) {
        lock(&self.slots).stats.restart_calls += 1;
        log::info!("sim: restart requested");
    }
}

pub struct VecImage {
    data: Vec<u8>,
    pos: usize,
}

impl VecImage {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }
}

impl ImageSource for VecImage {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

enum Reply {
    Response(TransportResponse),
    Fail(String),
}

impl Reply {
    fn into_result(self) -> Result<TransportResponse> {
        match self {
            Reply::Response(r) => Ok(r),
            Reply::Fail(msg) => Err(anyhow!(msg)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordedPost {
    pub path: String,
    pub body: Vec<u8>,
}

impl RecordedPost {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap_or(serde_json::Value::Null)
    }
}

/// Transport answering from queues filled by the test or simulator.
/// With an empty queue GETs fail and POSTs answer 200.
#[derive(Default)]
pub struct ScriptedTransport {
    gets: Mutex<VecDeque<Reply>>,
    post_replies: Mutex<VecDeque<Reply>>,
    images: Mutex<HashMap<String, Vec<u8>>>,
    get_paths: Mutex<Vec<String>>,
    posts: Mutex<Vec<RecordedPost>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_get(&self, status: u16, body: &str) {
        lock(&self.gets).push_back(Reply::Response(TransportResponse::new(status, body)));
    }

    pub fn push_get_error(&self, msg: &str) {
        lock(&self.gets).push_back(Reply::Fail(msg.to_string()));
    }

    pub fn push_post(&self, status: u16) {
        lock(&self.post_replies).push_back(Reply::Response(TransportResponse::new(status, "")));
    }

    pub fn push_post_error(&self, msg: &str) {
        lock(&self.post_replies).push_back(Reply::Fail(msg.to_string()));
    }

    pub fn serve_image(&self, url: &str, data: Vec<u8>) {
        lock(&self.images).insert(url.to_string(), data);
    }

    pub fn get_paths(&self) -> Vec<String> {
        lock(&self.get_paths).clone()
    }

    /// Every POST attempt, including the ones answered with an error
    pub fn posts(&self) -> Vec<RecordedPost> {
        lock(&self.posts).clone()
    }

    /// Parsed bodies of POSTs that carried the given status
    pub fn reports_with_status(&self, status: &str) -> Vec<serde_json::Value> {
        self.posts()
            .iter()
            .map(RecordedPost::json)
            .filter(|v| v["status"] == status)
            .collect()
    }
}

impl Transport for ScriptedTransport {
    fn get(&self, path: &str) -> Result<TransportResponse> {
        lock(&self.get_paths).push(path.to_string());
        match lock(&self.gets).pop_front() {
            Some(reply) => reply.into_result(),
            None => bail!("no scripted response for GET {}", path),
        }
    }

    fn post(&self, path: &str, body: &[u8]) -> Result<TransportResponse> {
        lock(&self.posts).push(RecordedPost {
            path: path.to_string(),
            body: body.to_vec(),
        });
        match lock(&self.post_replies).pop_front() {
            Some(reply) => reply.into_result(),
            None => Ok(TransportResponse::new(200, "")),
        }
    }

    fn open_image(&self, url: &str) -> Result<Box<dyn ImageSource>> {
        match lock(&self.images).get(url) {
            Some(data) => Ok(Box::new(VecImage::new(data.clone()))),
            None => bail!("HTTP 404 for {}", url),
        }
    }
}

/// A simulated device: its storage and partitions outlive engine instances,
/// which is how a reboot is modelled
pub struct SimDevice {
    pub transport: Arc<ScriptedTransport>,
    pub partitions: Arc<SimPartitions>,
    pub store: Arc<MemoryStore>,
}

impl SimDevice {
    pub fn new(running: SlotState) -> Self {
        Self {
            transport: Arc::new(ScriptedTransport::new()),
            partitions: Arc::new(SimPartitions::new(running)),
            store: Arc::new(MemoryStore::new()),
        }
    }

    pub fn platform(&self) -> Platform {
        Platform {
            transport: self.transport.clone(),
            partitions: self.partitions.clone(),
            store: self.store.clone(),
            timers: Arc::new(ThreadTimers::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flashed_image_boots_pending_then_rolls_back() {
        let parts = SimPartitions::new(SlotState::Valid);
        parts
            .flash_image(&mut |w: &mut dyn ImageWriter| w.write(b"new-fw"))
            .unwrap();
        assert_eq!(parts.staged_image().as_deref(), Some(&b"new-fw"[..]));

        parts.simulate_reboot();
        assert_eq!(parts.state(), SlotState::PendingVerify);
        assert_eq!(parts.running_image(), b"new-fw".to_vec());

        parts.mark_invalid_and_rollback().unwrap();
        parts.simulate_reboot();
        assert_eq!(parts.state(), SlotState::Valid);
    }

    #[test]
    fn failed_write_stages_nothing() {
        let parts = SimPartitions::new(SlotState::Valid);
        parts.fail_writes(true);
        let res = parts.flash_image(&mut |w: &mut dyn ImageWriter| w.write(b"abc"));
        assert!(res.is_err());
        assert!(parts.staged_image().is_none());
        assert_eq!(parts.stats().images_flashed, 0);
    }

    #[test]
    fn scripted_transport_replays_in_order() {
        let t = ScriptedTransport::new();
        t.push_get(200, "{}");
        t.push_get_error("offline");
        assert_eq!(t.get("otafetch").unwrap().status, 200);
        assert!(t.get("otafetch").is_err());
        assert!(t.get("otafetch").is_err());
        assert_eq!(t.get_paths().len(), 3);

        t.push_post(500);
        assert_eq!(t.post("otastatus", b"{}").unwrap().status, 500);
        assert_eq!(t.post("otastatus", b"{}").unwrap().status, 200);
        assert_eq!(t.posts().len(), 2);
    }

    #[test]
    fn image_source_reads_to_end() {
        let mut img = VecImage::new(vec![1, 2, 3, 4, 5]);
        let mut buf = [0u8; 2];
        let mut out = Vec::new();
        loop {
            let n = img.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, vec![1, 2, 3, 4, 5]);
    }
}
