use std::env;

fn main() -> anyhow::Result<()> {
    // Necessary for ESP-IDF; host builds (simulator and tests) skip it
    if env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("espidf") {
        embuild::espidf::sysenv::output();

        // Add crash log helper for better panic diagnostics
        println!("cargo:rustc-link-arg=-Wl,--undefined=esp_backtrace_print_app_description");
    }

    // Cloud endpoint used by the device build
    match env::var("OTA_BASE_URL") {
        Ok(url) => println!("cargo:rustc-env=OTA_BASE_URL={}", url),
        Err(_) => {
            println!("cargo:rustc-env=OTA_BASE_URL=");
            if env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("espidf") {
                println!("cargo:warning=OTA_BASE_URL not set! The device will not be able to reach the OTA service.");
            }
        }
    }
    println!("cargo:rerun-if-env-changed=OTA_BASE_URL");

    // WiFi credentials are baked in the same way
    for var in ["WIFI_SSID", "WIFI_PASSWORD"] {
        println!("cargo:rustc-env={}={}", var, env::var(var).unwrap_or_default());
        println!("cargo:rerun-if-env-changed={}", var);
    }

    Ok(())
}
