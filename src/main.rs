//! Traffic Forwarder
//!
//! This is the main entry point for the forwarder.
//! It loads configuration, wires the components and runs the relays
//! until interrupted.

use std::sync::Arc;

use anyhow::Context;
use dotenv::dotenv;
use log::{error, info};

use traffic_forwarder::api::{self, ApiState};
use traffic_forwarder::config;
use traffic_forwarder::core::{alert_dispatcher, monitoring};
use traffic_forwarder::core::{
    AlertSink, FloodDetector, LogOnlyAlertSink, Monitoring, PortMappingTable, ReportingClient,
    Supervisor,
};
use traffic_forwarder::logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    let config = config::load_config().context("Failed to load configuration")?;
    logging::init_logging(&config.logging).context("Failed to initialize logging")?;

    info!("--- Traffic Forwarder started ---");
    if let Some(file) = &config.logging.file {
        info!("Logging to: {}", file);
    }
    info!("Reporting bans to: {}", config.reporting.base_url);
    info!(
        "Flood limit: {} pps, block time: {}s",
        config.flood.packets_per_second, config.flood.block_seconds
    );

    let mappings = PortMappingTable::new(config.mappings.clone())?;

    monitoring::describe_metrics();
    if config.metrics.enabled {
        monitoring::install_exporter(&config.metrics)?;
    }

    let alerts: Arc<dyn AlertSink> = if config.reporting.enabled {
        let client = ReportingClient::new(&config.reporting)?;
        let (sink, dispatcher) = alert_dispatcher::channel(client);
        tokio::spawn(dispatcher.run());
        Arc::new(sink)
    } else {
        Arc::new(LogOnlyAlertSink)
    };

    let detector = Arc::new(FloodDetector::new(config.flood.clone(), alerts));

    let monitor = Monitoring::new(Arc::clone(&detector), config.monitoring.clone());
    tokio::spawn(async move { monitor.start_monitoring().await });

    if config.api.enabled {
        let state = ApiState {
            detector: Arc::clone(&detector),
            mappings: Arc::new(mappings.clone()),
        };
        let server = api::start_api_server(state, &config.api).context("Failed to start status API")?;
        tokio::spawn(async move {
            if let Err(e) = server.await {
                error!("Status API stopped: {}", e);
            }
        });
    }

    Supervisor::new(config.forwarder.clone(), mappings, detector)
        .run()
        .await?;

    info!("Stopping forwarder...");
    Ok(())
}
