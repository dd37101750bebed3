//! Actuator Transport: observe/send/get against the two field nodes.
//!
//! The energy node hosts the weather, battery, generated power, relay and
//! anti-dust resources. The HVAC node hosts room temperature and settings.

pub mod http;
pub mod simulated;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::Serialize;
use strum::{AsRefStr, Display, EnumString, IntoStaticStr};
use thiserror::Error;

use crate::domain::{AntiDustCommand, HvacCommand, RelayCommand, Setpoint};

pub use http::HttpFieldTransport;
pub use simulated::SimulatedField;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Node {
    Energy,
    Hvac,
}

/// Observable resource on a field node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr, IntoStaticStr)]
pub enum Topic {
    #[strum(serialize = "sensors/weather")]
    Weather,
    #[strum(serialize = "sensors/battery")]
    Battery,
    #[strum(serialize = "sensors/power")]
    GenPower,
    #[strum(serialize = "sensors/roomTemp")]
    RoomTemp,
    #[strum(serialize = "relay")]
    Relay,
    #[strum(serialize = "antiDust")]
    AntiDust,
    #[strum(serialize = "settings")]
    Settings,
}

impl Topic {
    pub const ALL: [Topic; 7] = [
        Topic::Weather,
        Topic::Battery,
        Topic::GenPower,
        Topic::RoomTemp,
        Topic::Relay,
        Topic::AntiDust,
        Topic::Settings,
    ];

    pub fn node(self) -> Node {
        match self {
            Topic::RoomTemp | Topic::Settings => Node::Hvac,
            _ => Node::Energy,
        }
    }

    /// Resource path relative to the node's base URL.
    pub fn path(self) -> &'static str {
        self.into()
    }
}

/// One JSON notification received from a node resource.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub topic: Topic,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl Observation {
    pub fn new(topic: Topic, payload: serde_json::Value) -> Self {
        Self {
            topic,
            payload,
            received_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldCommand {
    Relay(RelayCommand),
    Hvac(HvacCommand),
    AntiDust(AntiDustCommand),
}

impl FieldCommand {
    pub fn topic(&self) -> Topic {
        match self {
            FieldCommand::Relay(_) => Topic::Relay,
            FieldCommand::Hvac(_) => Topic::Settings,
            FieldCommand::AntiDust(_) => Topic::AntiDust,
        }
    }

    /// Form fields as the nodes read them.
    ///
    /// The relay keeps any field whose key is absent. The HVAC node reads
    /// `-1` as "unchanged" for power and target, `same` for status, and keeps
    /// its mode when the key is absent.
    pub fn form_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        match self {
            FieldCommand::Relay(cmd) => {
                if let Setpoint::Set(leg) = cmd.supply_source {
                    pairs.push(("relay_sp", leg.code().to_string()));
                }
                if let Setpoint::Set(leg) = cmd.house_source {
                    pairs.push(("relay_home", leg.code().to_string()));
                }
                if let Setpoint::Set(w) = cmd.power_supply_w {
                    pairs.push(("power_sp", format!("{w:.2}")));
                }
                if let Setpoint::Set(w) = cmd.power_house_w {
                    pairs.push(("power_home", format!("{w:.2}")));
                }
            }
            FieldCommand::Hvac(cmd) => {
                pairs.push(("pw", sentinel(cmd.power_w)));
                pairs.push((
                    "status",
                    cmd.status
                        .value()
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "same".into()),
                ));
                if let Setpoint::Set(mode) = cmd.mode {
                    pairs.push(("mode", mode.to_string()));
                }
                pairs.push(("targetTemp", sentinel(cmd.target_temp_c)));
            }
            FieldCommand::AntiDust(cmd) => pairs.push(("antiDust", cmd.mode.to_string())),
        }
        pairs
    }
}

fn sentinel(setpoint: Setpoint<f64>) -> String {
    match setpoint {
        Setpoint::Keep => "-1.0".into(),
        Setpoint::Set(v) => format!("{v:.2}"),
    }
}

/// Node acknowledgement of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Ack {
    Changed,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("{topic} unreachable: {reason}")]
    Unreachable { topic: Topic, reason: String },
    #[error("{topic} timed out")]
    Timeout { topic: Topic },
    #[error("{topic} rejected the command: {reason}")]
    Rejected { topic: Topic, reason: String },
    #[error("{topic} returned an unreadable payload: {reason}")]
    InvalidPayload { topic: Topic, reason: String },
}

#[async_trait]
pub trait ActuatorTransport: Send + Sync {
    async fn send(&self, command: FieldCommand) -> Result<Ack, TransportError>;

    /// Current representation of a resource.
    async fn get(&self, topic: Topic) -> Result<Observation, TransportError>;

    /// Stream of notifications from a resource. The stream ends when the
    /// transport shuts down.
    fn observe(&self, topic: Topic) -> BoxStream<'static, Observation>;
}
