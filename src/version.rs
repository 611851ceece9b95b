// Centralized version information

// Cargo package version from Cargo.toml, reported to the OTA service
pub const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

// Build flavor shown next to the version in the boot banner
pub const BUILD_FLAVOR: &str = if cfg!(target_os = "espidf") { "device" } else { "host-sim" };

// Full version string for logging
pub fn full_version() -> String {
    format!("v{} ({})", FIRMWARE_VERSION, BUILD_FLAVOR)
}
