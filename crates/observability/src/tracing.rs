//! Tracing/logging initialization.

use std::str::FromStr;

use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// `LOG_FORMAT` held something other than `json` or `text`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid value for LOG_FORMAT: `{0}` (expected json or text)")]
pub struct InvalidLogFormat(pub String);

/// Output format of the log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line, for log shippers.
    #[default]
    Json,
    /// Human-readable lines for local development.
    Text,
}

impl LogFormat {
    /// Resolve the raw `LOG_FORMAT` value; unset or blank takes the default.
    pub fn from_env_value(raw: Option<&str>) -> Result<Self, InvalidLogFormat> {
        match raw.map(str::trim) {
            None | Some("") => Ok(Self::default()),
            Some(value) => value.parse(),
        }
    }
}

impl FromStr for LogFormat {
    type Err = InvalidLogFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" | "pretty" | "plain" => Ok(Self::Text),
            _ => Err(InvalidLogFormat(s.to_string())),
        }
    }
}

/// Initialize tracing for the process. Filtering comes from `RUST_LOG`,
/// defaulting to `info`.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime);

    let _ = match format {
        LogFormat::Json => builder.json().with_target(false).try_init(),
        LogFormat::Text => builder.with_target(true).try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_parses_case_insensitively() {
        assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!(" text ".parse::<LogFormat>(), Ok(LogFormat::Text));
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn unset_or_blank_env_value_defaults_but_garbage_is_rejected() {
        assert_eq!(LogFormat::from_env_value(None), Ok(LogFormat::Json));
        assert_eq!(LogFormat::from_env_value(Some("  ")), Ok(LogFormat::Json));
        assert_eq!(LogFormat::from_env_value(Some("pretty")), Ok(LogFormat::Text));
        assert_eq!(
            LogFormat::from_env_value(Some("jsn")),
            Err(InvalidLogFormat("jsn".to_string()))
        );
    }

    #[test]
    fn init_twice_is_harmless() {
        init(LogFormat::Text);
        init(LogFormat::Json);
    }
}
