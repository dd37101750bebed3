#![cfg(feature = "mqtt")]
//! Publishes alerts to an MQTT broker on the `hvac` and `antiDust` topics.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{Alert, AlertChannel};
use crate::config::AlertsConfig;

pub struct MqttAlerts {
    client: AsyncClient,
}

impl MqttAlerts {
    /// Connects lazily; the returned task drives the connection and must
    /// stay alive for publishes to go out.
    pub fn connect(cfg: &AlertsConfig) -> (Self, JoinHandle<()>) {
        let mut options = MqttOptions::new(&cfg.mqtt_client_id, &cfg.mqtt_host, cfg.mqtt_port);
        options.set_keep_alive(Duration::from_secs(cfg.mqtt_keep_alive_secs.max(5)));

        let (client, mut eventloop) = AsyncClient::new(options, cfg.capacity.max(1));
        let driver = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => info!("mqtt alert channel connected"),
                    Ok(Event::Incoming(Packet::Disconnect)) => warn!("mqtt alert channel disconnected"),
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt connection error, retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
        (Self { client }, driver)
    }
}

#[async_trait]
impl AlertChannel for MqttAlerts {
    async fn publish(&self, alert: Alert) {
        // try_publish never waits on the event loop; a full queue drops the alert.
        if let Err(e) = self.client.try_publish(
            alert.topic.as_ref(),
            QoS::AtLeastOnce,
            false,
            alert.message.clone().into_bytes(),
        ) {
            warn!(topic = %alert.topic, error = %e, "alert not published");
        }
    }
}
