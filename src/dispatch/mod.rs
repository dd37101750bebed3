//! Energy Dispatch Engine: turns a snapshot of sensors and device state into
//! a relay routing and an HVAC command.

pub mod degraded;
pub mod demand;
pub mod emitter;
pub mod engine;
pub mod error;
pub mod router;
pub mod selector;

use std::future::Future;
use std::time::Duration;

use serde::Serialize;

use crate::alerts::Alert;
use crate::domain::{HouseSource, HvacCommand, HvacState, RelayCommand, RelayState, SupplySource};

pub use demand::estimate_demand;
pub use emitter::{CommandEmitter, EmitAck};
pub use engine::{DispatchEngine, EngineHandle};
pub use error::{CommandError, DispatchError, EmitStep, StepFailure};
pub use router::{ArbitrationRouter, DispatchEvent, DispatchPath, Outcome, SettingsSource, SkipReason};
pub use selector::{battery_can_cover, leg_power, select_source, surplus_leg, SourceSelection};

/// Everything one evaluation decided, handed to the emitter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArbitrationDecision {
    pub needed_power_w: Option<f64>,
    pub relay_state: RelayState,
    pub command_relay: RelayCommand,
    pub hvac_state: Option<HvacState>,
    pub command_hvac: Option<HvacCommand>,
    pub alerts: Vec<Alert>,
    /// Skip the emitter's idempotence check.
    pub force: bool,
}

impl ArbitrationDecision {
    pub fn routing(relay_state: RelayState) -> Self {
        Self {
            needed_power_w: None,
            command_relay: RelayCommand::apply(&relay_state),
            relay_state,
            hvac_state: None,
            command_hvac: None,
            alerts: Vec::new(),
            force: false,
        }
    }

    pub fn with_hvac(mut self, state: HvacState, command: HvacCommand) -> Self {
        self.hvac_state = Some(state);
        self.command_hvac = Some(command);
        self
    }

    pub fn supply_source(&self) -> SupplySource {
        self.relay_state.supply_source
    }

    pub fn house_source(&self) -> HouseSource {
        self.relay_state.house_source
    }
}

/// Runs `fut`, failing with `on_timeout` if it takes longer than `limit`.
pub(crate) async fn bounded<T, E>(
    limit: Duration,
    on_timeout: E,
    fut: impl Future<Output = Result<T, E>>,
) -> Result<T, E> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout),
    }
}
