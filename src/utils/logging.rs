//! Logger setup plus conditional logging macros gated by a module-level
//! `ENABLE_LOGS` flag.
//!
//! Adapter modules that log from their worker threads define the flag and
//! import the macros from the crate root:
//! ```ignore
//! const ENABLE_LOGS: bool = true;
//! use crate::{log_error, log_info, log_warn};
//!
//! log_info!("recorder thread started");
//! ```

use log::LevelFilter;

const DEBUG_ENV: &str = "SLEEPALARM_DEBUG";

/// `SLEEPALARM_DEBUG=1` (or `true`) lowers the default level to debug.
pub fn debug_enabled() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Install the global logger. `RUST_LOG` directives still apply on top of
/// the default level. Safe to call more than once.
pub fn init() {
    let level = if debug_enabled() {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let _ = env_logger::Builder::from_default_env()
        .filter_level(level)
        .parse_default_env()
        .try_init();
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::info!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::warn!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::error!($($arg)*);
        }
    };
}
