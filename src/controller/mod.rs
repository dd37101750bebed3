//! Application wiring: builds the store, transport, alert channel and
//! dispatch engine from configuration, and starts the background tasks.

use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

use crate::alerts::{AlertChannel, BroadcastAlerts};
use crate::config::{AlertsKind, Config, StoreKind, TransportKind};
use crate::dispatch::{ArbitrationRouter, CommandEmitter, DispatchEngine, EngineHandle};
use crate::ingest::spawn_ingest;
use crate::store::{MemoryStateStore, StateStore};
use crate::transport::{ActuatorTransport, HttpFieldTransport, SimulatedField};

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub store: Arc<dyn StateStore>,
    pub transport: Arc<dyn ActuatorTransport>,
    pub alerts: Arc<dyn AlertChannel>,
    pub engine: EngineHandle,
    /// Present when the field is simulated, so the drift task can run.
    pub simulated: Option<Arc<SimulatedField>>,
    /// Engine actor task, handed over to the background task set once.
    engine_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl AppState {
    pub async fn new(cfg: Config) -> Result<Self> {
        let store: Arc<dyn StateStore> = match cfg.store.kind {
            StoreKind::Memory => Arc::new(MemoryStateStore::new()),
            #[cfg(feature = "db")]
            StoreKind::Postgres => Arc::new(crate::store::PgStateStore::connect(&cfg.store).await?),
            #[cfg(not(feature = "db"))]
            StoreKind::Postgres => anyhow::bail!("store.kind = postgres needs the `db` feature"),
        };

        let (transport, simulated) = match cfg.transport.kind {
            #[cfg(feature = "sim")]
            TransportKind::Simulated => {
                let field = Arc::new(SimulatedField::new());
                (field.clone() as Arc<dyn ActuatorTransport>, Some(field))
            }
            #[cfg(not(feature = "sim"))]
            TransportKind::Simulated => {
                anyhow::bail!("transport.kind = simulated needs the `sim` feature")
            }
            TransportKind::Http => {
                let http = HttpFieldTransport::new(&cfg.transport)?;
                (Arc::new(http) as Arc<dyn ActuatorTransport>, None)
            }
        };

        let alerts: Arc<dyn AlertChannel> = match cfg.alerts.kind {
            AlertsKind::Broadcast => Arc::new(BroadcastAlerts::new(cfg.alerts.capacity)),
            #[cfg(feature = "mqtt")]
            AlertsKind::Mqtt => {
                // The driver task lives as long as the runtime.
                let (channel, _driver) = crate::alerts::MqttAlerts::connect(&cfg.alerts);
                Arc::new(channel)
            }
            #[cfg(not(feature = "mqtt"))]
            AlertsKind::Mqtt => anyhow::bail!("alerts.kind = mqtt needs the `mqtt` feature"),
        };

        info!(
            store = ?cfg.store.kind,
            transport = ?cfg.transport.kind,
            alerts = ?cfg.alerts.kind,
            "components configured"
        );
        Ok(Self::with_parts(cfg, store, transport, alerts, simulated))
    }

    /// Assembles the state from ready-made parts and starts the engine.
    pub fn with_parts(
        cfg: Config,
        store: Arc<dyn StateStore>,
        transport: Arc<dyn ActuatorTransport>,
        alerts: Arc<dyn AlertChannel>,
        simulated: Option<Arc<SimulatedField>>,
    ) -> Self {
        let io_timeout = cfg.engine.io_timeout();
        let emitter = CommandEmitter::new(store.clone(), transport.clone(), alerts.clone(), io_timeout);
        let router = Arc::new(ArbitrationRouter::new(
            store.clone(),
            emitter,
            cfg.dispatch.clone(),
            io_timeout,
        ));
        let (engine, engine_task) = DispatchEngine::spawn(router, &cfg.engine);

        Self {
            cfg: Arc::new(cfg),
            store,
            transport,
            alerts,
            engine,
            simulated,
            engine_task: Arc::new(Mutex::new(Some(engine_task))),
        }
    }
}

/// Observation ingest for every topic, plus sensor drift when simulated.
/// The engine actor is included so shutdown stops it with the rest.
pub fn spawn_controller_tasks(state: &AppState) -> Vec<JoinHandle<()>> {
    let mut tasks = spawn_ingest(
        state.transport.clone(),
        state.store.clone(),
        state.engine.clone(),
        state.cfg.engine.io_timeout(),
    );
    if let Some(engine) = state.engine_task.lock().take() {
        tasks.push(engine);
    }
    if let Some(field) = &state.simulated {
        let tick = Duration::from_secs(state.cfg.transport.sim_tick_secs.max(1));
        info!(tick_secs = tick.as_secs(), "starting simulated field drift");
        tasks.push(field.clone().spawn_drift(tick));
    }
    tasks
}
