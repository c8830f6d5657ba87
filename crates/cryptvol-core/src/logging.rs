//! Logger bootstrap shared by cryptvol binaries.

use env_logger::Builder;

/// Environment variable consulted for the log filter before `RUST_LOG`.
pub const LOG_ENV: &str = "CRYPTVOL_LOG";

/// Install `env_logger` with `default_level` unless a filter is set in the environment.
///
/// Calling this more than once is harmless; later calls are ignored.
pub fn init(default_level: &str) {
    let filter = std::env::var(LOG_ENV)
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| default_level.to_string());

    let _ = Builder::new()
        .parse_filters(&filter)
        .format_timestamp_secs()
        .try_init();
}
