//! Plane Configuration
//!
//! Connection settings shared by the control, data and local planes.

use std::time::Duration;

use serde::Deserialize;

/// Default MQTT port when an address carries none
pub const DEFAULT_PORT: u16 = 1883;

/// Configuration for one plane connection
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlaneConfig {
    /// Plane name used in logs; filled in from the section name
    #[serde(skip)]
    pub name: String,

    /// Broker address (host:port or just host)
    pub address: String,

    /// Client ID; derived from the silo ID and plane name when empty
    pub client_id: String,

    /// Username for authentication
    pub username: Option<String>,

    /// Password for authentication
    pub password: Option<String>,

    /// Keep-alive interval (e.g., "60s")
    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,

    /// QoS used for publishes and subscriptions (0, 1 or 2)
    pub qos: u8,

    /// Capacity of the request and dispatch channels
    pub channel_capacity: usize,

    /// Maximum packet size in bytes
    pub max_packet_size: usize,
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(60)
}

fn default_channel_capacity() -> usize {
    256
}

fn default_max_packet_size() -> usize {
    1024 * 1024
}

impl Default for PlaneConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            address: String::new(),
            client_id: String::new(),
            username: None,
            password: None,
            keep_alive: default_keep_alive(),
            qos: 0,
            channel_capacity: default_channel_capacity(),
            max_packet_size: default_max_packet_size(),
        }
    }
}

impl PlaneConfig {
    /// Default configuration of the local broker connection
    pub fn local_default() -> Self {
        Self {
            address: "127.0.0.1:1883".to_string(),
            ..Default::default()
        }
    }

    /// Parse address into host and port
    pub fn parse_address(&self) -> (String, u16) {
        if let Some((host, port_str)) = self.address.rsplit_once(':') {
            if let Ok(port) = port_str.parse::<u16>() {
                return (host.to_string(), port);
            }
        }
        (self.address.clone(), DEFAULT_PORT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address_with_port() {
        let config = PlaneConfig {
            address: "broker.example.com:9883".to_string(),
            ..Default::default()
        };
        let (host, port) = config.parse_address();
        assert_eq!(host, "broker.example.com");
        assert_eq!(port, 9883);
    }

    #[test]
    fn test_parse_address_without_port() {
        let config = PlaneConfig {
            address: "10.0.0.7".to_string(),
            ..Default::default()
        };
        let (host, port) = config.parse_address();
        assert_eq!(host, "10.0.0.7");
        assert_eq!(port, DEFAULT_PORT);
    }

    #[test]
    fn test_local_default() {
        let config = PlaneConfig::local_default();
        assert_eq!(config.parse_address(), ("127.0.0.1".to_string(), 1883));
        assert_eq!(config.keep_alive, Duration::from_secs(60));
        assert_eq!(config.qos, 0);
    }
}
