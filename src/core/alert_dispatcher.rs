//! Flood alert reporting for the forwarder.
//!
//! The flood detector hands every block transition to an [`AlertSink`].
//! The production sink queues the alert for an [`AlertDispatcher`], which
//! reports it to the external backend without ever blocking admission.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use metrics::increment_counter;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::models::ReportingConfig;
use crate::utils::format_endpoint_url;

/// Errors that can occur while reporting to the backend
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {endpoint} failed: {source}")]
    Request {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} answered with status {status}")]
    Status { endpoint: String, status: StatusCode },
}

/// A single block transition, reported once
#[derive(Debug, Clone, Serialize)]
pub struct FloodAlert {
    /// Correlates the ban and event notifications in the logs
    pub id: Uuid,
    /// Offending source address
    pub ip: IpAddr,
    /// Packets observed in the window that triggered the block
    pub rate: u32,
    pub blocked_at: DateTime<Utc>,
    pub unblock_at: DateTime<Utc>,
}

impl FloodAlert {
    pub fn ban_reason(&self) -> String {
        format!("DoS Flood detected (Rate: {} pps)", self.rate)
    }

    pub fn event_description(&self) -> String {
        format!("High traffic flood detected: {} packets/sec", self.rate)
    }
}

/// Receiver of flood alerts.
///
/// Called by the detector right after it releases its lock; implementations
/// must return immediately.
#[cfg_attr(test, mockall::automock)]
pub trait AlertSink: Send + Sync {
    fn notify(&self, alert: FloodAlert);
}

/// Sink used when reporting is disabled
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnlyAlertSink;

impl AlertSink for LogOnlyAlertSink {
    fn notify(&self, alert: FloodAlert) {
        info!(
            "[API] Reporting disabled, not notifying backend about {} ({} pps)",
            alert.ip, alert.rate
        );
    }
}

/// Sink that queues alerts for an [`AlertDispatcher`]
#[derive(Debug, Clone)]
pub struct QueuedAlertSink {
    tx: mpsc::UnboundedSender<FloodAlert>,
}

impl AlertSink for QueuedAlertSink {
    fn notify(&self, alert: FloodAlert) {
        if let Err(rejected) = self.tx.send(alert) {
            warn!(
                "[API] Alert dispatcher has stopped, dropping alert for {}",
                rejected.0.ip
            );
        }
    }
}

/// HTTP client for the reporting backend
pub struct ReportingClient {
    /// HTTP client
    client: Client,
    /// Backend base URL
    base_url: String,
    /// Per-request timeout
    timeout: Duration,
}

impl ReportingClient {
    /// Create a new reporting client
    pub fn new(config: &ReportingConfig) -> Result<Self, ReportError> {
        let timeout = Duration::from_millis(config.timeout_ms);
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ReportError::Client)?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            timeout,
        })
    }

    /// Send the ban notification for an alert
    pub async fn send_ban(&self, alert: &FloodAlert) -> Result<(), ReportError> {
        let params = [("ip", alert.ip.to_string()), ("reason", alert.ban_reason())];
        self.post("ban", &params).await
    }

    /// Send the event notification for an alert
    pub async fn send_event(&self, alert: &FloodAlert) -> Result<(), ReportError> {
        let params = [
            ("ip", alert.ip.to_string()),
            ("action", "blocked".to_string()),
            ("description", alert.event_description()),
            ("is_attack", "true".to_string()),
        ];
        self.post("event", &params).await
    }

    /// Deliver both notifications for an alert.
    ///
    /// The two calls are independent: a failed ban call does not prevent
    /// the event call. Failures are logged and swallowed.
    pub async fn report(&self, alert: &FloodAlert) {
        let ban = self.send_ban(alert).await;
        record_outcome("ban", alert, &ban);

        let event = self.send_event(alert).await;
        record_outcome("event", alert, &event);

        if ban.is_ok() && event.is_ok() {
            info!("[API] Backend notified for IP {} (alert {})", alert.ip, alert.id);
        }
    }

    async fn post(&self, path: &str, params: &[(&str, String)]) -> Result<(), ReportError> {
        let endpoint = format_endpoint_url(&self.base_url, path);
        debug!("[API] Sending {} request to {}", path, endpoint);

        let response = self
            .client
            .post(&endpoint)
            .query(params)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|source| ReportError::Request {
                endpoint: endpoint.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ReportError::Status { endpoint, status });
        }

        Ok(())
    }
}

fn record_outcome(kind: &'static str, alert: &FloodAlert, outcome: &Result<(), ReportError>) {
    match outcome {
        Ok(()) => {
            increment_counter!("forwarder_alerts_total", "kind" => kind, "outcome" => "sent");
        }
        Err(e) => {
            increment_counter!("forwarder_alerts_total", "kind" => kind, "outcome" => "failed");
            error!("[API] Failed to send {} alert for {}: {}", kind, alert.ip, e);
        }
    }
}

/// Drains queued alerts and reports each one on its own task
pub struct AlertDispatcher {
    rx: mpsc::UnboundedReceiver<FloodAlert>,
    client: Arc<ReportingClient>,
}

/// Create a connected sink/dispatcher pair
pub fn channel(client: ReportingClient) -> (QueuedAlertSink, AlertDispatcher) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        QueuedAlertSink { tx },
        AlertDispatcher {
            rx,
            client: Arc::new(client),
        },
    )
}

impl AlertDispatcher {
    /// Run until every sink has been dropped
    pub async fn run(mut self) {
        while let Some(alert) = self.rx.recv().await {
            let client = Arc::clone(&self.client);
            tokio::spawn(async move {
                client.report(&alert).await;
            });
        }
        debug!("[API] Alert queue closed, dispatcher exiting");
    }
}
