//! Observation ingest: field notifications in, readings and engine events out.
//!
//! The pump never waits on the engine and a bad report never stops it.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatch::{bounded, DispatchEvent, EngineHandle, SettingsSource};
use crate::domain::{FieldReport, FieldUpdate, ValidationError};
use crate::store::{StateStore, StoreError};
use crate::transport::{ActuatorTransport, Observation, Topic};

#[derive(Clone)]
pub struct Ingest {
    store: Arc<dyn StateStore>,
    engine: EngineHandle,
    io_timeout: Duration,
}

impl Ingest {
    pub fn new(store: Arc<dyn StateStore>, engine: EngineHandle, io_timeout: Duration) -> Self {
        Self {
            store,
            engine,
            io_timeout,
        }
    }

    /// Decodes, validates and records one notification, then hands the
    /// resulting events to the engine. Returns how many were submitted.
    pub async fn handle(&self, observation: &Observation) -> Result<usize, ValidationError> {
        let report = FieldReport::decode(&observation.payload)?;
        let events = match report.into_update()? {
            FieldUpdate::Readings(readings) => {
                let mut events = Vec::with_capacity(readings.len());
                for reading in readings {
                    match self.persist(self.store.insert_reading(&reading)).await {
                        Ok(()) => events.push(DispatchEvent::SensorUpdate(reading.sensor)),
                        Err(e) => warn!(
                            sensor = %reading.sensor,
                            error = %e,
                            "reading not stored, no re-arbitration"
                        ),
                    }
                }
                events
            }
            FieldUpdate::Relay(relay) => vec![DispatchEvent::RelayChange(relay)],
            FieldUpdate::Settings(hvac) => {
                vec![DispatchEvent::SettingsChange(SettingsSource::Field(hvac))]
            }
            FieldUpdate::AntiDust(mode) => vec![DispatchEvent::AntiDustChange {
                mode,
                from_operator: false,
            }],
        };

        let mut submitted = 0;
        for event in events {
            if self.engine.submit(event) {
                submitted += 1;
            }
        }
        Ok(submitted)
    }

    async fn persist(
        &self,
        fut: impl std::future::Future<Output = Result<(), StoreError>>,
    ) -> Result<(), StoreError> {
        bounded(self.io_timeout, StoreError::Timeout, fut).await
    }

    async fn pump(self, transport: Arc<dyn ActuatorTransport>, topic: Topic) {
        // Prime with the current representation before following changes.
        match transport.get(topic).await {
            Ok(current) => self.handle_logged(&current).await,
            Err(e) => debug!(%topic, error = %e, "initial read failed"),
        }

        let mut notifications = transport.observe(topic);
        while let Some(observation) = notifications.next().await {
            self.handle_logged(&observation).await;
        }
        warn!(%topic, "observation stream ended");
    }

    async fn handle_logged(&self, observation: &Observation) {
        match self.handle(observation).await {
            Ok(submitted) => debug!(topic = %observation.topic, submitted, "observation ingested"),
            Err(e) => warn!(
                topic = %observation.topic,
                payload = %observation.payload,
                error = %e,
                "malformed field report dropped"
            ),
        }
    }
}

/// One pump task per observable topic.
pub fn spawn_ingest(
    transport: Arc<dyn ActuatorTransport>,
    store: Arc<dyn StateStore>,
    engine: EngineHandle,
    io_timeout: Duration,
) -> Vec<JoinHandle<()>> {
    let ingest = Ingest::new(store, engine, io_timeout);
    info!(topics = Topic::ALL.len(), "starting observation ingest");
    Topic::ALL
        .into_iter()
        .map(|topic| tokio::spawn(ingest.clone().pump(transport.clone(), topic)))
        .collect()
}
