use log::{Level, LevelFilter, Metadata, Record};
use std::sync::OnceLock;
use std::time::Instant;

static BOOT_TIME: OnceLock<Instant> = OnceLock::new();

mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BRIGHT_RED: &str = "\x1b[91m";
    pub const BRIGHT_YELLOW: &str = "\x1b[93m";
    pub const BRIGHT_GREEN: &str = "\x1b[92m";
    pub const BRIGHT_BLUE: &str = "\x1b[94m";
    pub const GRAY: &str = "\x1b[90m";
}

/// Console logger that prints colored lines stamped with the time since boot
struct ConsoleLogger;

impl log::Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let elapsed = BOOT_TIME.get_or_init(Instant::now).elapsed();
        let ts = format_uptime(elapsed.as_secs(), elapsed.subsec_millis());

        let (color, level_char) = match record.level() {
            Level::Error => (colors::BRIGHT_RED, 'E'),
            Level::Warn => (colors::BRIGHT_YELLOW, 'W'),
            Level::Info => (colors::BRIGHT_GREEN, 'I'),
            Level::Debug => (colors::BRIGHT_BLUE, 'D'),
            Level::Trace => (colors::GRAY, 'T'),
        };
        let module = short_module(record.module_path());

        // Serial console; ANSI colors are fine over UART and terminals
        println!(
            "{}{} [{}] {:>12} | {}{}",
            color,
            ts,
            level_char,
            module,
            record.args(),
            colors::RESET
        );
    }

    fn flush(&self) {}
}

fn format_uptime(seconds: u64, millis: u32) -> String {
    if seconds < 60 {
        format!("{:>3}.{:03}s", seconds, millis)
    } else if seconds < 3600 {
        format!("{:>2}m{:02}s", seconds / 60, seconds % 60)
    } else {
        format!("{:>2}h{:02}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

fn short_module(path: Option<&str>) -> &str {
    let module = path
        .and_then(|p| p.rsplit("::").next())
        .unwrap_or("unknown");
    // Module names are ASCII identifiers, slicing by byte is safe
    if module.len() > 12 {
        &module[..12]
    } else {
        module
    }
}

static LOGGER: ConsoleLogger = ConsoleLogger;

/// Initialize the console logger; the level starts at Info
pub fn init_logger() -> Result<(), log::SetLoggerError> {
    let _ = BOOT_TIME.set(Instant::now());
    log::set_logger(&LOGGER)?;
    log::set_max_level(LevelFilter::Info);
    Ok(())
}

fn parse_level(level: &str) -> Option<LevelFilter> {
    let lf = match level.to_ascii_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" | "warning" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => return None,
    };
    Some(lf)
}

/// Parse and set log level from a string; returns true if applied
pub fn set_max_level_from_str(level: &str) -> bool {
    match parse_level(level) {
        Some(lf) => {
            log::set_max_level(lf);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_levels() {
        assert_eq!(parse_level("DEBUG"), Some(LevelFilter::Debug));
        assert_eq!(parse_level("warning"), Some(LevelFilter::Warn));
        assert_eq!(parse_level("off"), Some(LevelFilter::Off));
        assert_eq!(parse_level("verbose"), None);
    }

    #[test]
    fn uptime_switches_units() {
        assert_eq!(format_uptime(5, 42), "  5.042s");
        assert_eq!(format_uptime(125, 0), " 2m05s");
        assert_eq!(format_uptime(7260, 0), " 2h01m");
    }

    #[test]
    fn module_name_is_shortened() {
        assert_eq!(short_module(Some("cloud_ota::ota::validation")), "validation");
        assert_eq!(short_module(Some("cloud_ota::ota::averyverylongname")), "averyverylon");
        assert_eq!(short_module(None), "unknown");
    }
}
