use crate::error::{QuadError, Result};
use crate::types::DEFAULT_PORT;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Longest accepted pause between two volume transition steps
pub const MAX_VOLUME_STEP_INTERVAL_MS: u64 = 1000;

/// Client tuning knobs
///
/// Every field has a default, so a partial document deserializes:
///
/// ```
/// use bravia_quad::ClientConfig;
///
/// let config: ClientConfig = serde_json::from_str(r#"{"response_timeout_ms": 2000}"#).unwrap();
/// assert_eq!(config.port, 33336);
/// assert_eq!(config.response_timeout().as_millis(), 2000);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// TCP port of the control protocol
    pub port: u16,
    /// Upper bound for opening the TCP connection
    pub connect_timeout_ms: u64,
    /// How long a command waits for its result before giving up
    pub response_timeout_ms: u64,
    /// Pause after the socket opens; the device drops commands sent too early
    pub stabilize_delay_ms: u64,
    /// Pause before the listener retries after a transient read error
    pub read_error_backoff_ms: u64,
    /// Pause between volume transition steps; 0 jumps straight to the target
    pub volume_step_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            connect_timeout_ms: 10_000,
            response_timeout_ms: 10_000,
            stabilize_delay_ms: 100,
            read_error_backoff_ms: 1_000,
            volume_step_interval_ms: 0,
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn stabilize_delay(&self) -> Duration {
        Duration::from_millis(self.stabilize_delay_ms)
    }

    pub fn read_error_backoff(&self) -> Duration {
        Duration::from_millis(self.read_error_backoff_ms)
    }

    pub fn volume_step_interval(&self) -> Duration {
        Duration::from_millis(self.volume_step_interval_ms)
    }

    /// Check the values that have a bounded range
    pub fn validate(&self) -> Result<()> {
        validate_step_interval(self.volume_step_interval_ms)
    }
}

pub(crate) fn validate_step_interval(interval_ms: u64) -> Result<()> {
    if interval_ms > MAX_VOLUME_STEP_INTERVAL_MS {
        return Err(QuadError::OutOfRange {
            feature: "volume_step_interval_ms",
            value: interval_ms as i64,
            min: 0,
            max: MAX_VOLUME_STEP_INTERVAL_MS as i64,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_device() {
        let config = ClientConfig::default();
        assert_eq!(config.port, 33336);
        assert_eq!(config.response_timeout(), Duration::from_secs(10));
        assert_eq!(config.stabilize_delay(), Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn step_interval_is_bounded() {
        let config = ClientConfig {
            volume_step_interval_ms: 5_000,
            ..ClientConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(QuadError::OutOfRange { max: 1000, .. })
        ));
    }
}
