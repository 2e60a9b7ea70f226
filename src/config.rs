use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::tick;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to
    pub bind_address: IpAddr,
    /// Port to listen on
    pub port: u16,
    /// Port for the Prometheus metrics endpoint
    pub metrics_port: u16,
    /// Tick rate in Hz. Administrative override only; steady-state operation
    /// uses the default of 20.
    pub tick_rate: u32,
    /// Interval between keepalive challenges
    pub keepalive_interval: Duration,
    /// Hard keepalive response limit before eviction
    pub keepalive_timeout: Duration,
    /// Reorder the live connection set every N ticks (0 = disabled)
    pub shuffle_interval_ticks: u32,
    /// Directory for fatal-failure diagnostic snapshots
    pub crash_report_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port: 4040,
            metrics_port: 9090,
            tick_rate: tick::TICK_RATE,
            keepalive_interval: crate::constants::keepalive::INTERVAL,
            keepalive_timeout: crate::constants::keepalive::TIMEOUT,
            shuffle_interval_ticks: 0,
            crash_report_dir: PathBuf::from("crash-reports"),
        }
    }
}

impl ServerConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("BIND_ADDRESS") {
            if let Ok(parsed) = addr.parse() {
                config.bind_address = parsed;
            } else {
                tracing::warn!("Invalid BIND_ADDRESS '{}', using default", addr);
            }
        }

        if let Ok(port) = std::env::var("PORT") {
            if let Ok(parsed) = port.parse::<u16>() {
                if parsed > 0 {
                    config.port = parsed;
                } else {
                    tracing::warn!("PORT must be > 0, using default");
                }
            } else {
                tracing::warn!("Invalid PORT '{}', using default", port);
            }
        }

        if let Ok(port) = std::env::var("METRICS_PORT") {
            if let Ok(parsed) = port.parse::<u16>() {
                config.metrics_port = parsed;
            } else {
                tracing::warn!("Invalid METRICS_PORT '{}', using default", port);
            }
        }

        if let Ok(rate) = std::env::var("TICK_RATE") {
            if let Ok(parsed) = rate.parse::<u32>() {
                if (1..=1000).contains(&parsed) {
                    config.tick_rate = parsed;
                } else {
                    tracing::warn!("TICK_RATE must be 1-1000, using default");
                }
            } else {
                tracing::warn!("Invalid TICK_RATE '{}', using default", rate);
            }
        }

        if let Ok(secs) = std::env::var("KEEPALIVE_INTERVAL_SECS") {
            if let Ok(parsed) = secs.parse::<u64>() {
                if parsed > 0 {
                    config.keepalive_interval = Duration::from_secs(parsed);
                } else {
                    tracing::warn!("KEEPALIVE_INTERVAL_SECS must be > 0, using default");
                }
            } else {
                tracing::warn!("Invalid KEEPALIVE_INTERVAL_SECS '{}', using default", secs);
            }
        }

        if let Ok(secs) = std::env::var("KEEPALIVE_TIMEOUT_SECS") {
            if let Ok(parsed) = secs.parse::<u64>() {
                if parsed > 0 {
                    config.keepalive_timeout = Duration::from_secs(parsed);
                } else {
                    tracing::warn!("KEEPALIVE_TIMEOUT_SECS must be > 0, using default");
                }
            } else {
                tracing::warn!("Invalid KEEPALIVE_TIMEOUT_SECS '{}', using default", secs);
            }
        }

        if let Ok(ticks) = std::env::var("SHUFFLE_INTERVAL_TICKS") {
            if let Ok(parsed) = ticks.parse::<u32>() {
                config.shuffle_interval_ticks = parsed;
            } else {
                tracing::warn!("Invalid SHUFFLE_INTERVAL_TICKS '{}', using default", ticks);
            }
        }

        if let Ok(dir) = std::env::var("CRASH_REPORT_DIR") {
            config.crash_report_dir = PathBuf::from(dir);
        }

        config
    }

    /// Nominal tick period derived from the configured rate
    pub fn tick_period(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / self.tick_rate as u64)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("Port cannot be 0".to_string());
        }
        if self.port == self.metrics_port {
            return Err("Game and metrics ports must differ".to_string());
        }
        if self.tick_rate == 0 {
            return Err("tick_rate must be at least 1".to_string());
        }
        if self.keepalive_timeout < self.keepalive_interval {
            return Err("keepalive_timeout cannot be shorter than keepalive_interval".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 4040);
        assert_eq!(config.tick_rate, 20);
        assert_eq!(config.tick_period(), Duration::from_millis(50));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_port_collision() {
        let config = ServerConfig {
            metrics_port: 4040,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_keepalive() {
        let config = ServerConfig {
            keepalive_interval: Duration::from_secs(60),
            keepalive_timeout: Duration::from_secs(30),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
