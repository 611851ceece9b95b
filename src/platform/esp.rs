//! ESP-IDF adapters for the platform traits.

use anyhow::{anyhow, bail, Context, Result};
use embedded_svc::http::Method;
use embedded_svc::io::{Read, Write};
use esp_idf_hal::modem::Modem;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::http::client::{Configuration as HttpConfig, EspHttpConnection};
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use esp_idf_svc::ota::{self, EspOta};
use esp_idf_svc::timer::{EspTaskTimerService, EspTimer};
use esp_idf_svc::wifi::{AuthMethod, BlockingWifi, ClientConfiguration, Configuration, EspWifi};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{
    ImageSource, ImageWriter, KeyValueStore, PartitionManager, Platform, SlotState, Transport,
    TransportResponse,
};
use crate::system::timer::{Cancel, TimerHandle, TimerService};

const HTTP_BUFFER_SIZE: usize = 4096;
const MAX_RESPONSE_BODY: usize = 16 * 1024;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn http_config(timeout: Duration) -> HttpConfig {
    HttpConfig {
        buffer_size: Some(HTTP_BUFFER_SIZE),
        timeout: Some(timeout),
        crt_bundle_attach: Some(esp_idf_sys::esp_crt_bundle_attach),
        ..Default::default()
    }
}

/// HTTPS client for the OTA service, one connection per request
pub struct EspHttpTransport {
    base_url: String,
}

impl EspHttpTransport {
    pub fn new(base_url: &str) -> Result<Self> {
        if base_url.is_empty() {
            bail!("OTA service URL is empty, set OTA_BASE_URL at build time");
        }
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn request(&self, method: Method, path: &str, body: Option<&[u8]>) -> Result<TransportResponse> {
        let url = format!("{}/{}", self.base_url, path);
        let mut conn = EspHttpConnection::new(&http_config(Duration::from_secs(30)))?;

        let content_length = body.map(|b| b.len().to_string());
        let mut headers = vec![("Accept", "application/json")];
        if let Some(len) = content_length.as_deref() {
            headers.push(("Content-Type", "application/json"));
            headers.push(("Content-Length", len));
        }

        conn.initiate_request(method, &url, &headers)
            .with_context(|| format!("request to {} failed", url))?;
        if let Some(body) = body {
            conn.write_all(body).map_err(|e| anyhow!("write failed: {:?}", e))?;
        }
        conn.initiate_response()?;
        let status = conn.status();

        let mut out = Vec::new();
        let mut buf = [0u8; 512];
        loop {
            let n = conn.read(&mut buf).map_err(|e| anyhow!("read failed: {:?}", e))?;
            if n == 0 {
                break;
            }
            if out.len() + n > MAX_RESPONSE_BODY {
                bail!("response from {} exceeds {} bytes", url, MAX_RESPONSE_BODY);
            }
            out.extend_from_slice(&buf[..n]);
        }
        log::debug!("{} {} -> {} ({} bytes)", if body.is_some() { "POST" } else { "GET" }, url, status, out.len());
        Ok(TransportResponse::new(status, out))
    }
}

impl Transport for EspHttpTransport {
    fn get(&self, path: &str) -> Result<TransportResponse> {
        self.request(Method::Get, path, None)
    }

    fn post(&self, path: &str, body: &[u8]) -> Result<TransportResponse> {
        self.request(Method::Post, path, Some(body))
    }

    fn open_image(&self, url: &str) -> Result<Box<dyn ImageSource>> {
        let mut conn = EspHttpConnection::new(&http_config(Duration::from_secs(60)))?;
        conn.initiate_request(Method::Get, url, &[])
            .with_context(|| format!("image request to {} failed", url))?;
        conn.initiate_response()?;
        if conn.status() != 200 {
            bail!("image download failed: HTTP {}", conn.status());
        }
        Ok(Box::new(HttpImage { conn }))
    }
}

struct HttpImage {
    conn: EspHttpConnection,
}

impl ImageSource for HttpImage {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.conn
            .read(buf)
            .map_err(|e| anyhow!("image read failed: {:?}", e))
    }
}

/// OTA partitions through `EspOta`, which is taken per operation
#[derive(Default)]
pub struct EspPartitionManager {
    busy: Mutex<()>,
}

impl EspPartitionManager {
    pub fn new() -> Self {
        Self::default()
    }
}

struct OtaWriter<'a, 'b> {
    update: &'a mut ota::EspOtaUpdate<'b>,
}

impl ImageWriter for OtaWriter<'_, '_> {
    fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.update
            .write_all(chunk)
            .map_err(|e| anyhow!("flash write failed: {:?}", e))
    }
}

impl PartitionManager for EspPartitionManager {
    fn running_state(&self) -> Result<SlotState> {
        let _busy = lock(&self.busy);
        let ota = EspOta::new()?;
        let slot = ota.get_running_slot()?;
        log::info!("Running from partition {}", slot.label);
        Ok(match slot.state {
            ota::SlotState::Unverified => SlotState::PendingVerify,
            ota::SlotState::Valid => SlotState::Valid,
            ota::SlotState::Invalid => SlotState::Invalid,
            ota::SlotState::Factory | ota::SlotState::Unknown => SlotState::Undefined,
        })
    }

    fn mark_valid(&self) -> Result<()> {
        let _busy = lock(&self.busy);
        let mut ota = EspOta::new()?;
        ota.mark_running_slot_valid()?;
        Ok(())
    }

    fn mark_invalid_and_rollback(&self) -> Result<()> {
        let _busy = lock(&self.busy);
        let mut ota = EspOta::new()?;
        // Only comes back if there is nothing to roll back to
        let err = ota.mark_running_slot_invalid_and_reboot();
        Err(anyhow!("rollback failed: {:?}", err))
    }

    fn flash_image(&self, fill: &mut dyn FnMut(&mut dyn ImageWriter) -> Result<()>) -> Result<()> {
        let _busy = lock(&self.busy);
        let mut ota = EspOta::new()?;
        let mut update = ota.initiate_update()?;

        let filled = fill(&mut OtaWriter {
            update: &mut update,
        });
        match filled {
            Ok(()) => {
                update.complete()?;
                log::info!("OTA image completed and set as boot partition");
                Ok(())
            }
            Err(e) => {
                if let Err(abort_err) = update.abort() {
                    log::warn!("Failed to abort OTA update: {:?}", abort_err);
                }
                Err(e)
            }
        }
    }

    fn restart(&self) {
        unsafe {
            esp_idf_sys::esp_restart();
        }
    }
}

/// NVS blobs in the default partition
pub struct EspNvsStore {
    partition: EspDefaultNvsPartition,
}

impl EspNvsStore {
    pub fn new(partition: EspDefaultNvsPartition) -> Self {
        Self { partition }
    }

    fn open(&self, namespace: &str) -> Result<EspNvs<NvsDefault>> {
        EspNvs::new(self.partition.clone(), namespace, true)
            .with_context(|| format!("failed to open NVS namespace {}", namespace))
    }
}

impl KeyValueStore for EspNvsStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let nvs = self.open(namespace)?;
        let Some(len) = nvs.blob_len(key)? else {
            return Ok(None);
        };
        let mut buf = vec![0u8; len];
        Ok(nvs.get_blob(key, &mut buf)?.map(|data| data.to_vec()))
    }

    fn set(&self, namespace: &str, key: &str, value: &[u8]) -> Result<()> {
        let mut nvs = self.open(namespace)?;
        nvs.set_blob(key, value)?;
        Ok(())
    }

    fn erase(&self, namespace: &str, key: &str) -> Result<()> {
        let mut nvs = self.open(namespace)?;
        nvs.remove(key)?;
        Ok(())
    }
}

/// Timers on the ESP-IDF timer task
pub struct EspTimers {
    service: EspTaskTimerService,
}

impl EspTimers {
    pub fn new(service: EspTaskTimerService) -> Self {
        Self { service }
    }
}

impl Cancel for EspTimer<'static> {
    fn cancel_timer(&mut self) -> bool {
        EspTimer::cancel(self).unwrap_or(false)
    }
}

impl TimerService for EspTimers {
    fn schedule_once(&self, after: Duration, f: Box<dyn FnOnce() + Send>) -> Result<TimerHandle> {
        let mut f = Some(f);
        let timer = self.service.timer(move || {
            if let Some(f) = f.take() {
                f();
            }
        })?;
        timer.after(after)?;
        Ok(TimerHandle::new(timer))
    }

    fn schedule_periodic(&self, period: Duration, mut f: Box<dyn FnMut() + Send>) -> Result<TimerHandle> {
        let timer = self.service.timer(move || f())?;
        timer.every(period)?;
        Ok(TimerHandle::new(timer))
    }
}

/// Join the access point configured at build time and wait for an address
pub fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs: EspDefaultNvsPartition,
    ssid: &str,
    password: &str,
) -> Result<BlockingWifi<EspWifi<'static>>> {
    if ssid.is_empty() {
        bail!("WiFi SSID cannot be empty, set WIFI_SSID at build time");
    }
    let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs))?;
    let mut wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: ssid
            .try_into()
            .map_err(|_| anyhow!("Invalid SSID format: {}", ssid))?,
        password: password
            .try_into()
            .map_err(|_| anyhow!("Invalid password format"))?,
        auth_method: if password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        },
        ..Default::default()
    }))?;

    log::info!("Connecting to {}...", ssid);
    wifi.start()?;
    wifi.connect()?;
    wifi.wait_netif_up()?;
    log::info!("WiFi connected");
    Ok(wifi)
}

/// The real device
pub fn platform(base_url: &str, nvs: EspDefaultNvsPartition) -> Result<Platform> {
    Ok(Platform {
        transport: Arc::new(EspHttpTransport::new(base_url)?),
        partitions: Arc::new(EspPartitionManager::new()),
        store: Arc::new(EspNvsStore::new(nvs)),
        timers: Arc::new(EspTimers::new(EspTaskTimerService::new()?)),
    })
}
