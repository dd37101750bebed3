//! Field gateway client. Each node sits behind an HTTP gateway exposing its
//! resources under the node's base URL.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use tracing::{debug, warn};

use super::{Ack, ActuatorTransport, FieldCommand, Node, Observation, Topic, TransportError};
use crate::config::TransportConfig;

#[derive(Clone)]
pub struct HttpFieldTransport {
    client: reqwest::Client,
    energy_node_url: Arc<str>,
    hvac_node_url: Arc<str>,
    poll_interval: Duration,
}

impl HttpFieldTransport {
    pub fn new(cfg: &TransportConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms.max(1)))
            .build()?;
        Ok(Self {
            client,
            energy_node_url: cfg.energy_node_url.trim_end_matches('/').into(),
            hvac_node_url: cfg.hvac_node_url.trim_end_matches('/').into(),
            poll_interval: Duration::from_millis(cfg.poll_interval_ms.max(10)),
        })
    }

    fn url(&self, topic: Topic) -> String {
        let base = match topic.node() {
            Node::Energy => &self.energy_node_url,
            Node::Hvac => &self.hvac_node_url,
        };
        format!("{}/{}", base, topic.path())
    }

    async fn fetch(client: &reqwest::Client, url: &str, topic: Topic) -> Result<Value, TransportError> {
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| request_error(topic, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Unreachable {
                topic,
                reason: format!("status {status}"),
            });
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| TransportError::InvalidPayload {
                topic,
                reason: e.to_string(),
            })
    }
}

fn request_error(topic: Topic, error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout { topic }
    } else {
        TransportError::Unreachable {
            topic,
            reason: error.to_string(),
        }
    }
}

#[async_trait]
impl ActuatorTransport for HttpFieldTransport {
    async fn send(&self, command: FieldCommand) -> Result<Ack, TransportError> {
        let topic = command.topic();
        let url = self.url(topic);
        let form = command.form_pairs();
        debug!(%url, ?form, "sending field command");

        let response = self
            .client
            .put(&url)
            .form(&form)
            .send()
            .await
            .map_err(|e| request_error(topic, e))?;

        let status = response.status();
        if status.is_success() {
            Ok(Ack::Changed)
        } else if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            Err(TransportError::Rejected {
                topic,
                reason: format!("status {status}: {body}"),
            })
        } else {
            Err(TransportError::Unreachable {
                topic,
                reason: format!("status {status}"),
            })
        }
    }

    async fn get(&self, topic: Topic) -> Result<Observation, TransportError> {
        let payload = Self::fetch(&self.client, &self.url(topic), topic).await?;
        Ok(Observation::new(topic, payload))
    }

    /// Polls the resource and yields a notification whenever its
    /// representation changes.
    fn observe(&self, topic: Topic) -> BoxStream<'static, Observation> {
        let client = self.client.clone();
        let url = self.url(topic);
        let interval = tokio::time::interval(self.poll_interval);
        let last: Option<Value> = None;

        stream::unfold(
            (client, url, interval, last),
            move |(client, url, mut interval, mut last)| async move {
                loop {
                    interval.tick().await;
                    match Self::fetch(&client, &url, topic).await {
                        Ok(payload) if last.as_ref() == Some(&payload) => continue,
                        Ok(payload) => {
                            last = Some(payload.clone());
                            let obs = Observation::new(topic, payload);
                            return Some((obs, (client, url, interval, last)));
                        }
                        Err(e) => warn!(%topic, error = %e, "poll failed"),
                    }
                }
            },
        )
        .boxed()
    }
}
