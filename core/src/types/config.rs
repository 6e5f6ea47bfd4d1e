use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};


pub const DEFAULT_SOCKET_PATH: &str = "/tmp/ventlink.sock";


/// Runtime settings for the bridge. Every field has a default so a config
/// file only needs to name what it changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// Filesystem path of the Unix socket the controller connects to.
    pub socket_path: PathBuf,
    /// Fixed spacing between consecutive samples, in seconds.
    pub sample_period_s: f64,
    /// Points retained per waveform channel.
    pub max_points: usize,
    pub read_chunk_bytes: usize,
    /// Longest frame accepted before the pending bytes are discarded.
    pub max_frame_bytes: usize,
    /// Accept poll interval and read timeout; bounds shutdown latency.
    pub poll_ms: u64,
    /// Dispatcher sleep when the change queue is empty.
    pub dispatch_idle_ms: u64,
    /// When set, `reset_conf` clears every parameter and re-arms readiness.
    pub reset_clears_store: bool,
}


impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            sample_period_s: 0.01,
            max_points: 6000,
            read_chunk_bytes: 2048,
            max_frame_bytes: 64 * 1024,
            poll_ms: 50,
            dispatch_idle_ms: 100,
            reset_clears_store: false,
        }
    }
}


impl BridgeConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.sample_period_s.is_finite() && self.sample_period_s > 0.0) {
            return Err(BridgeError::Config(format!(
                "sample_period_s must be positive, got {}",
                self.sample_period_s
            )));
        }
        if self.max_points == 0 {
            return Err(BridgeError::Config("max_points must be at least 1".into()));
        }
        if self.read_chunk_bytes == 0 {
            return Err(BridgeError::Config("read_chunk_bytes must be at least 1".into()));
        }
        if self.max_frame_bytes < self.read_chunk_bytes {
            return Err(BridgeError::Config(format!(
                "max_frame_bytes ({}) is smaller than read_chunk_bytes ({})",
                self.max_frame_bytes, self.read_chunk_bytes
            )));
        }
        if self.socket_path.as_os_str().is_empty() {
            return Err(BridgeError::Config("socket_path is empty".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_ms.max(1))
    }

    pub fn dispatch_idle(&self) -> Duration {
        Duration::from_millis(self.dispatch_idle_ms.max(1))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sixty_seconds_at_100hz() {
        let config = BridgeConfig::default();
        assert_eq!(config.max_points, 6000);
        assert_eq!(config.sample_period_s, 0.01);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_period() {
        let config = BridgeConfig {
            sample_period_s: 0.0,
            ..BridgeConfig::default()
        };
        assert!(matches!(config.validate(), Err(BridgeError::Config(_))));
    }

    #[test]
    fn rejects_frame_limit_below_chunk() {
        let config = BridgeConfig {
            read_chunk_bytes: 4096,
            max_frame_bytes: 1024,
            ..BridgeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_round_trip() {
        let config = BridgeConfig {
            reset_clears_store: true,
            ..BridgeConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: BridgeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn zero_poll_is_clamped() {
        let config = BridgeConfig {
            poll_ms: 0,
            ..BridgeConfig::default()
        };
        assert_eq!(config.poll_interval(), Duration::from_millis(1));
    }
}
