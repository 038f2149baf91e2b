//! Tracing and logging setup shared by the binaries.

/// Initialize process-wide tracing from `RUST_LOG` and `LOG_FORMAT`.
///
/// An unset or blank `LOG_FORMAT` means JSON. Any other unrecognised value
/// is an error and nothing is installed, so the binary can refuse to start
/// the same way it does for other malformed configuration.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() -> Result<(), InvalidLogFormat> {
    let raw = std::env::var("LOG_FORMAT").ok();
    let format = LogFormat::from_env_value(raw.as_deref())?;
    tracing::init(format);
    Ok(())
}

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use self::tracing::{InvalidLogFormat, LogFormat};
