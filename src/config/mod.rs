//! Configuration management for the traffic forwarder.
//!
//! This module handles loading the application configuration from an
//! optional file and `FORWARDER__`-prefixed environment variables, and
//! validating it before anything is bound.

use std::env;

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use thiserror::Error;

use crate::core::port_map::{PortMapError, PortMappingTable};
use crate::models::Config;

/// Longest block a flood can earn: one year
pub const MAX_BLOCK_SECONDS: u64 = 365 * 24 * 60 * 60;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ConfigError),
    #[error("invalid port mappings: {0}")]
    PortMap(#[from] PortMapError),
    #[error("invalid setting {key}: {reason}")]
    Invalid {
        key: &'static str,
        reason: &'static str,
    },
}

/// Load configuration from the file named by `CONFIG_FILE` and the environment
pub fn load_config() -> Result<Config, SettingsError> {
    let config_file = env::var("CONFIG_FILE").unwrap_or_else(|_| "config/default.toml".to_string());
    load_config_from(&config_file)
}

/// Load configuration from `config_file` (if present) and the environment
pub fn load_config_from(config_file: &str) -> Result<Config, SettingsError> {
    let config: Config = ConfigBuilder::builder()
        .set_default("forwarder.listen_host", "0.0.0.0")?
        .set_default("forwarder.backend_host", "127.0.0.1")?
        .set_default("forwarder.tcp_backlog", 5)?
        .set_default("forwarder.tcp_chunk_size", 4096)?
        .set_default("forwarder.udp_buffer_size", 65535)?
        .set_default("flood.packets_per_second", 50)?
        .set_default("flood.block_seconds", 30)?
        .set_default("reporting.enabled", true)?
        .set_default("reporting.base_url", "http://127.0.0.1:5000")?
        .set_default("reporting.timeout_ms", 2000)?
        .set_default("api.enabled", true)?
        .set_default("api.host", "127.0.0.1")?
        .set_default("api.port", 8081)?
        .set_default("metrics.enabled", false)?
        .set_default("metrics.listen", "127.0.0.1:9100")?
        .set_default("monitoring.interval_seconds", 10)?
        .set_default("monitoring.blocked_sources_warning", 100)?
        .add_source(File::with_name(config_file).required(false))
        .add_source(
            Environment::with_prefix("FORWARDER")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;

    validate(&config)?;
    Ok(config)
}

/// Reject settings the forwarder cannot run with
pub fn validate(config: &Config) -> Result<(), SettingsError> {
    PortMappingTable::new(config.mappings.clone())?;

    if config.flood.packets_per_second == 0 {
        return Err(SettingsError::Invalid {
            key: "flood.packets_per_second",
            reason: "must be at least 1",
        });
    }
    if config.flood.block_seconds == 0 {
        return Err(SettingsError::Invalid {
            key: "flood.block_seconds",
            reason: "must be at least 1",
        });
    }
    if config.flood.block_seconds > MAX_BLOCK_SECONDS {
        return Err(SettingsError::Invalid {
            key: "flood.block_seconds",
            reason: "must be at most one year",
        });
    }
    if config.forwarder.tcp_chunk_size == 0 {
        return Err(SettingsError::Invalid {
            key: "forwarder.tcp_chunk_size",
            reason: "must be at least 1",
        });
    }
    if config.forwarder.udp_buffer_size == 0 {
        return Err(SettingsError::Invalid {
            key: "forwarder.udp_buffer_size",
            reason: "must be at least 1",
        });
    }

    Ok(())
}
