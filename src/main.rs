use anyhow::Result;
use log::info;

use cloud_ota::{config, logging, version};

// Generate ESP-IDF app descriptor
#[cfg(target_os = "espidf")]
#[allow(unexpected_cfgs)]
mod app_desc {
    esp_idf_sys::esp_app_desc!();
}

#[cfg(target_os = "espidf")]
fn main() -> Result<()> {
    use cloud_ota::ota::{FetchOutcome, OtaCallbacks, OtaEngine};
    use cloud_ota::platform::esp;
    use esp_idf_hal::prelude::Peripherals;
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;
    use std::time::Duration;

    esp_idf_svc::sys::link_patches();
    logging::init_logger().map_err(|e| anyhow::anyhow!("failed to initialize logger: {}", e))?;
    info!("Cloud OTA agent {}", version::full_version());
    info!("Free heap: {} bytes", unsafe {
        esp_idf_sys::esp_get_free_heap_size()
    });

    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    let _wifi = esp::connect_wifi(
        peripherals.modem,
        sys_loop,
        nvs.clone(),
        env!("WIFI_SSID"),
        env!("WIFI_PASSWORD"),
    )?;

    let platform = esp::platform(env!("OTA_BASE_URL"), nvs)?;
    let ota_config = config::load_or_default(&config::config_storage(platform.store.clone()));
    let engine = OtaEngine::new(platform);
    engine.enable(ota_config, OtaCallbacks::default())?;

    // One check at boot, autofetch takes over from here
    match engine.fetch() {
        Ok(FetchOutcome::NoUpdate) => info!("Firmware is up to date"),
        Ok(outcome) => info!("Boot fetch: {:?}", outcome),
        Err(e) => log::warn!("Boot fetch failed: {}", e),
    }

    loop {
        std::thread::sleep(Duration::from_secs(60));
        log::debug!("OTA status: {:?}", engine.status());
    }
}

/// Runs one full update cycle against the simulated device: fetch and apply
/// a job, reboot into the new image, then validate and confirm it.
#[cfg(not(target_os = "espidf"))]
fn main() -> Result<()> {
    use anyhow::ensure;
    use cloud_ota::ota::{Diagnostics, OtaCallbacks, OtaEngine, ValidationState};
    use cloud_ota::platform::sim::SimDevice;
    use cloud_ota::platform::SlotState;
    use std::sync::Arc;

    const IMAGE_URL: &str = "https://ota.example.com/firmware/sim-fw.bin";

    logging::init_logger().map_err(|e| anyhow::anyhow!("failed to initialize logger: {}", e))?;
    if let Ok(level) = std::env::var("OTA_LOG") {
        if !logging::set_max_level_from_str(&level) {
            log::warn!("Ignoring unknown log level '{}'", level);
        }
    }
    info!("Cloud OTA agent {}", version::full_version());

    let device = SimDevice::new(SlotState::Valid);
    let image: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 251) as u8).collect();
    device.transport.push_get(
        200,
        &format!(
            r#"{{"ota_job_id":"sim-1","url":"{}","file_size":{},"fw_version":"{}-next"}}"#,
            IMAGE_URL,
            image.len(),
            version::FIRMWARE_VERSION
        ),
    );
    device.transport.serve_image(IMAGE_URL, image);

    let ota_config = config::OtaConfig {
        autofetch_period_hours: 0,
        rollback_timeout_secs: 10,
        confirm_retry_interval_ms: 250,
        ..config::OtaConfig::default()
    };
    ota_config.save(&config::config_storage(device.store.clone()))?;
    let ota_config = config::load_or_default(&config::config_storage(device.store.clone()));

    info!("=== Boot 1: running the old firmware ===");
    let engine = OtaEngine::new(device.platform());
    engine.enable(ota_config.clone(), OtaCallbacks::default())?;
    let outcome = engine.fetch()?;
    info!("Fetch result: {:?}", outcome);
    drop(engine);

    info!("=== Boot 2: first boot of the new firmware ===");
    device.partitions.simulate_reboot();
    // The network is not up for the first success report
    device.transport.push_post_error("network unreachable");

    let self_test: Arc<dyn Diagnostics> = Arc::new(|| -> anyhow::Result<()> {
        info!("Self-test passed");
        Ok(())
    });
    let engine = OtaEngine::new(device.platform());
    engine.enable(
        ota_config,
        OtaCallbacks {
            handler: None,
            diagnostics: Some(self_test),
        },
    )?;
    let state = engine.wait_for_confirmation();

    info!("Validation finished: {:?}, slot {:?}", state, device.partitions.state());
    for post in device.transport.posts() {
        info!("  {} {}", post.path, String::from_utf8_lossy(&post.body));
    }
    ensure!(state == ValidationState::Valid, "new firmware was not validated");
    Ok(())
}
