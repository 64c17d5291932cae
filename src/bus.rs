use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::models::Alert;

/// Event source stamped on every published entry.
const SOURCE: &str = "marketplace-health.processor";

#[derive(Debug, Error)]
pub enum BusError {
    #[error("event bus request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("alert serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Pub/sub transport for alert events. All alerts raised by one incoming
/// event go out in a single batch publish.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish_alerts(&self, alerts: &[Alert]) -> Result<(), BusError>;
}

/// Publishes alert batches to an HTTP endpoint as
/// `{source, detail_type, detail, bus_name}` entries.
pub struct WebhookBus {
    client: reqwest::Client,
    url: String,
    bus_name: String,
}

impl WebhookBus {
    pub fn new(url: String, bus_name: String) -> Result<Self, BusError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url,
            bus_name,
        })
    }
}

#[async_trait]
impl EventBus for WebhookBus {
    async fn publish_alerts(&self, alerts: &[Alert]) -> Result<(), BusError> {
        if alerts.is_empty() {
            return Ok(());
        }

        let mut entries = Vec::with_capacity(alerts.len());
        for alert in alerts {
            entries.push(serde_json::json!({
                "source": SOURCE,
                "detail_type": alert.alert_type.as_str(),
                "detail": serde_json::to_string(alert)?,
                "bus_name": self.bus_name,
            }));
        }

        self.client
            .post(&self.url)
            .json(&serde_json::json!({ "entries": entries }))
            .send()
            .await?
            .error_for_status()?;

        info!(count = alerts.len(), "published alert batch");
        Ok(())
    }
}

/// Stand-in bus for deployments without an alert endpoint; alerts land in
/// the log stream instead.
pub struct LogBus;

#[async_trait]
impl EventBus for LogBus {
    async fn publish_alerts(&self, alerts: &[Alert]) -> Result<(), BusError> {
        for alert in alerts {
            info!(
                alert_type = %alert.alert_type,
                severity = ?alert.severity,
                entity_id = %alert.entity_id,
                "{}",
                alert.message
            );
        }
        Ok(())
    }
}
