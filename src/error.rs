use thiserror::Error;

/// Errors surfaced while loading and validating the circuit breaker configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// `max_error_rate` was outside `(0, 1.0]`.
    #[error("The value for max_error_rate has to be in the range (0, 1.0]")]
    InvalidErrorRate,

    /// `error_codes` was missing or empty.
    #[error("The array `error_codes` needs to be populated to enable circuitbreaker")]
    EmptyErrorCodes,

    /// `time_window_seconds` was zero.
    #[error("time_window_seconds must be a positive duration")]
    InvalidTimeWindow,

    /// The configuration file could not be read.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file could not be parsed as TOML.
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
}
