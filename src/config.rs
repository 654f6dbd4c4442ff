//! Configuration for the circuit breaker middleware, loaded from a
//! `[circuit_breaker]` TOML table.

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Which windowed-counter algorithm backs the error-rate accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    /// Single window that resets instantaneously at its boundary.
    #[default]
    Tumbling,
    /// Continuously advancing window with per-second buckets.
    Sliding,
}

/// Raw, deserializable shape of the `[circuit_breaker]` config section.
///
/// Mirrors the teacher's `RateLimitRefConfig`/`CircuitBreakerServerConfig`
/// pattern: plain fields with `#[serde(default = "...")]` helpers, validated
/// once at startup into a [`BreakerSettings`].
#[derive(Debug, Deserialize)]
pub struct BreakerConfig {
    /// Error-rate threshold, in `(0, 1]`, that opens the breaker.
    pub max_error_rate: f64,

    /// HTTP status codes classified as errors. Must be non-empty.
    pub error_codes: Vec<u16>,

    /// Open -> `HalfOpen` delay.
    #[serde(default = "default_time_to_halfopen_seconds")]
    pub time_to_halfopen_seconds: u64,

    /// `HalfOpen` -> Closed delay (if no errors observed).
    #[serde(default = "default_time_to_closed_seconds")]
    pub time_to_closed_seconds: u64,

    /// Width of the observation window.
    #[serde(default = "default_time_window_seconds")]
    pub time_window_seconds: u64,

    /// Status code returned while the breaker is open.
    #[serde(default = "default_code_when_open")]
    pub code_when_open: u16,

    /// Which windowed-counter algorithm to use.
    #[serde(default)]
    pub storage_kind: StorageKind,
}

fn default_time_to_halfopen_seconds() -> u64 {
    60
}

fn default_time_to_closed_seconds() -> u64 {
    60
}

fn default_time_window_seconds() -> u64 {
    300
}

fn default_code_when_open() -> u16 {
    503
}

impl BreakerConfig {
    /// Validate the raw config and convert it into [`BreakerSettings`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidErrorRate`] if `max_error_rate` is not
    /// in `(0, 1.0]`, [`ConfigError::EmptyErrorCodes`] if `error_codes` is
    /// empty, or [`ConfigError::InvalidTimeWindow`] if `time_window_seconds`
    /// is zero.
    pub fn validate(&self) -> Result<BreakerSettings, ConfigError> {
        if !(self.max_error_rate > 0.0 && self.max_error_rate <= 1.0) {
            return Err(ConfigError::InvalidErrorRate);
        }
        if self.error_codes.is_empty() {
            return Err(ConfigError::EmptyErrorCodes);
        }
        if self.time_window_seconds == 0 {
            return Err(ConfigError::InvalidTimeWindow);
        }

        Ok(BreakerSettings {
            max_error_rate: self.max_error_rate,
            error_codes: self.error_codes.clone(),
            time_to_halfopen: Duration::from_secs(self.time_to_halfopen_seconds.max(1)),
            time_to_closed: Duration::from_secs(self.time_to_closed_seconds.max(1)),
            time_window: Duration::from_secs(self.time_window_seconds),
            code_when_open: self.code_when_open,
            storage_kind: self.storage_kind,
        })
    }
}

/// Validated configuration, ready to build a [`crate::breaker::Breaker`] and
/// [`crate::middleware::CircuitBreakerLayer`].
#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub max_error_rate: f64,
    pub error_codes: Vec<u16>,
    pub time_to_halfopen: Duration,
    pub time_to_closed: Duration,
    pub time_window: Duration,
    pub code_when_open: u16,
    pub storage_kind: StorageKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> BreakerConfig {
        BreakerConfig {
            max_error_rate: 0.5,
            error_codes: vec![500, 502, 503],
            time_to_halfopen_seconds: default_time_to_halfopen_seconds(),
            time_to_closed_seconds: default_time_to_closed_seconds(),
            time_window_seconds: default_time_window_seconds(),
            code_when_open: default_code_when_open(),
            storage_kind: StorageKind::default(),
        }
    }

    #[test]
    fn validate_accepts_sane_config() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_error_rate() {
        let cfg = BreakerConfig {
            max_error_rate: 0.0,
            ..base()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidErrorRate)
        ));
    }

    #[test]
    fn validate_rejects_error_rate_above_one() {
        let cfg = BreakerConfig {
            max_error_rate: 1.5,
            ..base()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidErrorRate)
        ));
    }

    #[test]
    fn validate_accepts_error_rate_of_exactly_one() {
        let cfg = BreakerConfig {
            max_error_rate: 1.0,
            ..base()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_error_codes() {
        let cfg = BreakerConfig {
            error_codes: vec![],
            ..base()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::EmptyErrorCodes)
        ));
    }

    #[test]
    fn validate_rejects_zero_time_window() {
        let cfg = BreakerConfig {
            time_window_seconds: 0,
            ..base()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidTimeWindow)
        ));
    }

    #[test]
    fn defaults_match_spec_table() {
        assert_eq!(default_time_to_halfopen_seconds(), 60);
        assert_eq!(default_time_to_closed_seconds(), 60);
        assert_eq!(default_time_window_seconds(), 300);
        assert_eq!(default_code_when_open(), 503);
    }

    #[test]
    fn parses_from_toml() {
        let toml_src = r#"
            max_error_rate = 0.5
            error_codes = [500]
            time_window_seconds = 1
            time_to_halfopen_seconds = 1
            time_to_closed_seconds = 2
            code_when_open = 503
        "#;
        let cfg: BreakerConfig = toml::from_str(toml_src).unwrap();
        let settings = cfg.validate().unwrap();
        assert_eq!(settings.error_codes, vec![500]);
        assert_eq!(settings.storage_kind, StorageKind::Tumbling);
    }
}
