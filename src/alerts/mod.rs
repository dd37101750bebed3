//! Alert Channel: fire-and-forget notifications to operators.

#[cfg(feature = "mqtt")]
pub mod mqtt;

use async_trait::async_trait;
use serde::Serialize;
use strum::{AsRefStr, Display};
use tokio::sync::broadcast;
use tracing::debug;

use crate::domain::AntiDustMode;

#[cfg(feature = "mqtt")]
pub use mqtt::MqttAlerts;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, AsRefStr)]
pub enum AlertTopic {
    #[serde(rename = "hvac")]
    #[strum(serialize = "hvac")]
    Hvac,
    #[serde(rename = "antiDust")]
    #[strum(serialize = "antiDust")]
    AntiDust,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub topic: AlertTopic,
    pub message: String,
}

impl Alert {
    /// The HVAC reported a fault.
    pub fn hvac_fault() -> Self {
        Self {
            topic: AlertTopic::Hvac,
            message: "alarm".into(),
        }
    }

    /// The cleaning cycle changed; subscribers receive the mode's wire code.
    pub fn anti_dust(mode: AntiDustMode) -> Self {
        Self {
            topic: AlertTopic::AntiDust,
            message: mode.code().to_string(),
        }
    }
}

#[async_trait]
pub trait AlertChannel: Send + Sync {
    /// Never fails from the caller's point of view; delivery problems are
    /// logged by the implementation.
    async fn publish(&self, alert: Alert);
}

/// In-process fan-out. Slow subscribers lag and lose the oldest alerts.
#[derive(Clone)]
pub struct BroadcastAlerts {
    tx: broadcast::Sender<Alert>,
}

impl BroadcastAlerts {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl AlertChannel for BroadcastAlerts {
    async fn publish(&self, alert: Alert) {
        match self.tx.send(alert) {
            Ok(receivers) => debug!(receivers, "alert published"),
            Err(broadcast::error::SendError(alert)) => {
                debug!(topic = %alert.topic, "alert published with no subscribers")
            }
        }
    }
}
