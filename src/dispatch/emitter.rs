//! Applies a decision: persist intent, command the nodes, publish alerts.
//!
//! Steps run in that order and each may fail on its own. Nothing is rolled
//! back; the relay echo from the energy node reconciles intent and device.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::{bounded, ArbitrationDecision, CommandError, EmitStep, StepFailure};
use crate::alerts::{Alert, AlertChannel};
use crate::store::{StateStore, StoreError};
use crate::transport::{ActuatorTransport, FieldCommand, Topic, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmitAck {
    Applied,
    /// The store already holds this routing; nothing was sent.
    Unchanged,
}

#[derive(Clone)]
pub struct CommandEmitter {
    store: Arc<dyn StateStore>,
    transport: Arc<dyn ActuatorTransport>,
    alerts: Arc<dyn AlertChannel>,
    io_timeout: Duration,
}

impl CommandEmitter {
    pub fn new(
        store: Arc<dyn StateStore>,
        transport: Arc<dyn ActuatorTransport>,
        alerts: Arc<dyn AlertChannel>,
        io_timeout: Duration,
    ) -> Self {
        Self {
            store,
            transport,
            alerts,
            io_timeout,
        }
    }

    pub async fn emit(&self, decision: &ArbitrationDecision) -> Result<EmitAck, CommandError> {
        if !decision.force && self.matches_latest(decision).await {
            debug!(
                supply = %decision.supply_source(),
                house = %decision.house_source(),
                "routing unchanged, nothing to send"
            );
            self.publish_alerts(&decision.alerts).await;
            return Ok(EmitAck::Unchanged);
        }

        let mut failures = Vec::new();

        if let Err(e) = self.store_call(self.store.insert_relay(&decision.relay_state)).await {
            failures.push(failure(EmitStep::PersistRelay, e));
        }
        if let Some(hvac) = &decision.hvac_state {
            if let Err(e) = self.store_call(self.store.insert_hvac(hvac)).await {
                failures.push(failure(EmitStep::PersistHvac, e));
            }
        }

        if let Err(e) = self
            .send(FieldCommand::Relay(decision.command_relay))
            .await
        {
            failures.push(failure(EmitStep::SendRelay, e));
        }
        if let Some(cmd) = decision.command_hvac {
            if let Err(e) = self.send(FieldCommand::Hvac(cmd)).await {
                failures.push(failure(EmitStep::SendHvac, e));
            }
        }

        self.publish_alerts(&decision.alerts).await;

        if failures.is_empty() {
            info!(
                supply = %decision.supply_source(),
                house = %decision.house_source(),
                power_supply_w = decision.relay_state.power_supply_w,
                power_house_w = decision.relay_state.power_house_w,
                needed_power_w = decision.needed_power_w,
                "dispatch applied"
            );
            Ok(EmitAck::Applied)
        } else {
            for f in &failures {
                warn!(step = %f.step, reason = %f.reason, "emit step failed");
            }
            Err(CommandError::Partial { failures })
        }
    }

    pub async fn publish_alerts(&self, alerts: &[Alert]) {
        for alert in alerts {
            self.alerts.publish(alert.clone()).await;
        }
    }

    /// Sends one command with the configured timeout.
    pub async fn send(&self, command: FieldCommand) -> Result<(), TransportError> {
        let topic: Topic = command.topic();
        bounded(
            self.io_timeout,
            TransportError::Timeout { topic },
            self.transport.send(command),
        )
        .await
        .map(|_| ())
    }

    async fn store_call<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        bounded(self.io_timeout, StoreError::Timeout, fut).await
    }

    /// Relay legs and powers, and the HVAC settings when the decision has
    /// any, equal the latest persisted rows. A failed read counts as a
    /// mismatch so the decision still goes out.
    async fn matches_latest(&self, decision: &ArbitrationDecision) -> bool {
        let relay = match self.store_call(self.store.latest_relay()).await {
            Ok(Some(relay)) => relay,
            Ok(None) => return false,
            Err(e) => {
                warn!(error = %e, "could not read latest relay for idempotence check");
                return false;
            }
        };
        if !relay.same_routing(&decision.relay_state) {
            return false;
        }
        let Some(wanted) = &decision.hvac_state else {
            return true;
        };
        match self.store_call(self.store.latest_hvac()).await {
            Ok(Some(hvac)) => hvac.same_settings(wanted),
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "could not read latest HVAC state for idempotence check");
                false
            }
        }
    }
}

fn failure(step: EmitStep, error: impl std::fmt::Display) -> StepFailure {
    StepFailure {
        step,
        reason: error.to_string(),
    }
}
