use serde::{Deserialize, Serialize};

use crate::core::port_map::{PortMapping, PortMappingTable};
use crate::core::FloodDetectionConfig;

/// Listen and backend socket settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwarderConfig {
    /// Address the relays bind to
    pub listen_host: String,
    /// Backend host (IP address or resolvable name)
    pub backend_host: String,
    /// Pending-connection backlog of each TCP listener
    pub tcp_backlog: u32,
    /// Read size of each TCP byte pump
    pub tcp_chunk_size: usize,
    /// Largest UDP datagram relayed
    pub udp_buffer_size: usize,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            backend_host: "127.0.0.1".to_string(),
            tcp_backlog: 5,
            tcp_chunk_size: 4096,
            udp_buffer_size: 65_535,
        }
    }
}

/// Reporting backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportingConfig {
    /// Whether flood alerts are sent to the backend
    pub enabled: bool,
    /// Backend base URL
    pub base_url: String,
    /// Timeout of each notification (milliseconds)
    pub timeout_ms: u64,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "http://127.0.0.1:5000".to_string(),
            timeout_ms: 2000,
        }
    }
}

/// Status API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub enabled: bool,
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8081,
        }
    }
}

/// Prometheus exporter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Exporter listen address
    pub listen: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: "127.0.0.1:9100".to_string(),
        }
    }
}

/// Monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Monitoring interval in seconds
    pub interval_seconds: u64,
    /// Warn when more sources than this are blocked at once
    pub blocked_sources_warning: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 10,
            blocked_sources_warning: 100,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Also append log lines to this file
    pub file: Option<String>,
}

/// Application configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Socket configuration
    pub forwarder: ForwarderConfig,
    /// Flood detection configuration
    pub flood: FloodDetectionConfig,
    /// Reporting configuration
    pub reporting: ReportingConfig,
    /// Port mappings to relay
    #[serde(default = "PortMappingTable::default_mappings")]
    pub mappings: Vec<PortMapping>,
    /// Status API configuration
    pub api: ApiConfig,
    /// Metrics exporter configuration
    pub metrics: MetricsConfig,
    /// Monitoring configuration
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            forwarder: ForwarderConfig::default(),
            flood: FloodDetectionConfig::default(),
            reporting: ReportingConfig::default(),
            mappings: PortMappingTable::default_mappings(),
            api: ApiConfig::default(),
            metrics: MetricsConfig::default(),
            monitoring: MonitoringConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
