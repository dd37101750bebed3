use serde::Serialize;
use strum::Display;
use thiserror::Error;

use crate::domain::{HvacStatus, SensorKind, ValidationError};
use crate::store::StoreError;
use crate::transport::TransportError;

/// Why an evaluation produced no command. None of these are fatal.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("state store: {0}")]
    TransientStore(#[from] StoreError),
    #[error("field transport: {0}")]
    TransientTransport(#[from] TransportError),
    #[error("{0} reading missing or stale")]
    UnavailableInput(SensorKind),
    #[error("HVAC is {0}; no demand to estimate")]
    InactiveHvac(HvacStatus),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("dispatch engine is not running")]
    EngineClosed,
    #[error("dispatch engine did not answer in time")]
    Timeout,
}

/// Stages of the emit saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EmitStep {
    PersistRelay,
    PersistHvac,
    SendRelay,
    SendHvac,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepFailure {
    pub step: EmitStep,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    /// Some saga steps failed. Steps that succeeded are not rolled back.
    #[error("{} emit step(s) failed: {}", failures.len(), describe(failures))]
    Partial { failures: Vec<StepFailure> },
}

fn describe(failures: &[StepFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.step, f.reason))
        .collect::<Vec<_>>()
        .join(", ")
}
