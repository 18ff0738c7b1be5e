pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::{Config, LoggerConfig};

/// A root logger that discards everything. Components fall back to this
/// when the caller does not supply a logger.
#[inline]
pub fn null() -> Logger {
    Logger::root(Discard, o!())
}

/// Build a logger from a TOML logger configuration, e.g.
///
/// ```toml
/// type = "terminal"
/// level = "debug"
/// destination = "stderr"
/// ```
pub fn from_toml(config: &str) -> Result<Logger, Box<dyn std::error::Error>> {
    let config: LoggerConfig = serdeconv::from_toml_str(config)?;
    Ok(config.build_logger()?)
}
