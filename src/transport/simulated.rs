//! In-memory field network standing in for the energy and HVAC nodes.
//!
//! Commands are validated and applied the way the node firmware does it, and
//! every applied change is echoed to observers as a notification.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{Ack, ActuatorTransport, FieldCommand, Observation, Topic, TransportError};
use crate::domain::{
    AntiDustMode, HouseSource, HvacCommand, HvacMode, HvacState, HvacStatus, RelayCommand,
    RelayState, Setpoint, SupplySource, MAX_HVAC_POWER_W, MAX_RELAY_POWER_W, TARGET_TEMP_RANGE_C,
};

const DEFAULT_CHANNEL: usize = 256;

#[derive(Debug, Clone)]
struct FieldState {
    irradiance: f64,
    out_temp: f64,
    mod_temp: f64,
    gen_power: f64,
    battery_wh: f64,
    room_temp: f64,
    relay: RelayState,
    hvac: HvacState,
    anti_dust: AntiDustMode,
}

impl Default for FieldState {
    fn default() -> Self {
        Self {
            irradiance: 0.75,
            out_temp: 27.5,
            mod_temp: 40.0,
            gen_power: 600.0,
            battery_wh: 5_000.0,
            room_temp: 24.0,
            relay: RelayState::new(SupplySource::Battery, HouseSource::Grid, 0.0, 0.0),
            hvac: HvacState::default(),
            anti_dust: AntiDustMode::Off,
        }
    }
}

impl FieldState {
    fn payload(&self, topic: Topic) -> Value {
        match topic {
            Topic::Weather => json!({
                "n": "weather",
                "irr": self.irradiance,
                "outTemp": self.out_temp,
                "modTemp": self.mod_temp,
            }),
            Topic::Battery => json!({"n": "battery", "v": self.battery_wh}),
            Topic::GenPower => json!({"n": "gen_power", "v": format!("{:.2}", self.gen_power)}),
            Topic::RoomTemp => json!({"n": "roomTemp", "v": self.room_temp}),
            Topic::Relay => json!({
                "n": "relay",
                "r_sp": self.relay.supply_source.code(),
                "r_h": self.relay.house_source.code(),
                "p_sp": self.relay.power_supply_w,
                "p_h": self.relay.power_house_w,
            }),
            Topic::AntiDust => json!({"n": "antiDust", "v": self.anti_dust.code()}),
            Topic::Settings => json!({
                "n": "settings",
                "pw": self.hvac.power_w,
                "status": self.hvac.status.code(),
                "mode": self.hvac.mode.code(),
                "targetTemp": self.hvac.target_temp_c,
            }),
        }
    }
}

/// Simulated energy + HVAC nodes.
pub struct SimulatedField {
    state: Mutex<FieldState>,
    events: broadcast::Sender<Observation>,
    sent: Mutex<Vec<FieldCommand>>,
    unreachable: Mutex<HashSet<Topic>>,
}

impl Default for SimulatedField {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedField {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(DEFAULT_CHANNEL);
        Self {
            state: Mutex::new(FieldState::default()),
            events,
            sent: Mutex::new(Vec::new()),
            unreachable: Mutex::new(HashSet::new()),
        }
    }

    /// Every command received so far, accepted or not.
    pub fn sent_commands(&self) -> Vec<FieldCommand> {
        self.sent.lock().clone()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    /// Makes the resource behind `topic` fail every request.
    pub fn set_unreachable(&self, topic: Topic, unreachable: bool) {
        let mut topics = self.unreachable.lock();
        if unreachable {
            topics.insert(topic);
        } else {
            topics.remove(&topic);
        }
    }

    pub fn relay(&self) -> RelayState {
        self.state.lock().relay.clone()
    }

    pub fn hvac(&self) -> HvacState {
        self.state.lock().hvac.clone()
    }

    pub fn anti_dust(&self) -> AntiDustMode {
        self.state.lock().anti_dust
    }

    pub fn set_room_temp(&self, value: f64) {
        self.update(Topic::RoomTemp, |s| s.room_temp = value);
    }

    pub fn set_gen_power(&self, value: f64) {
        self.update(Topic::GenPower, |s| s.gen_power = value);
    }

    pub fn set_battery(&self, value: f64) {
        self.update(Topic::Battery, |s| s.battery_wh = value);
    }

    pub fn set_weather(&self, irradiance: f64, out_temp: f64, mod_temp: f64) {
        self.update(Topic::Weather, |s| {
            s.irradiance = irradiance;
            s.out_temp = out_temp;
            s.mod_temp = mod_temp;
        });
    }

    /// Changes made at the HVAC unit itself, e.g. from its remote.
    pub fn set_local_settings(&self, hvac: HvacState) {
        self.update(Topic::Settings, |s| s.hvac = hvac);
    }

    /// The dust sensor raising or clearing its alarm.
    pub fn set_local_anti_dust(&self, mode: AntiDustMode) {
        self.update(Topic::AntiDust, |s| s.anti_dust = mode);
    }

    fn update(&self, topic: Topic, change: impl FnOnce(&mut FieldState)) {
        let payload = {
            let mut state = self.state.lock();
            change(&mut state);
            state.payload(topic)
        };
        self.notify(topic, payload);
    }

    fn notify(&self, topic: Topic, payload: Value) {
        // No receivers is fine; nobody is observing yet.
        let _ = self.events.send(Observation::new(topic, payload));
    }

    fn check_reachable(&self, topic: Topic) -> Result<(), TransportError> {
        if self.unreachable.lock().contains(&topic) {
            return Err(TransportError::Unreachable {
                topic,
                reason: "simulated outage".into(),
            });
        }
        Ok(())
    }

    fn apply_relay(state: &mut FieldState, cmd: &RelayCommand) -> Result<(), TransportError> {
        let next = cmd.applied_to(&state.relay);
        for (field, value) in [
            ("power_sp", next.power_supply_w),
            ("power_home", next.power_house_w),
        ] {
            if !(0.0..=MAX_RELAY_POWER_W).contains(&value) {
                return Err(TransportError::Rejected {
                    topic: Topic::Relay,
                    reason: format!("{field}={value:.2} outside [0, {MAX_RELAY_POWER_W}]"),
                });
            }
        }
        state.relay = next;
        Ok(())
    }

    fn apply_hvac(state: &mut FieldState, cmd: &HvacCommand) -> Result<(), TransportError> {
        if let Setpoint::Set(power) = cmd.power_w {
            if !(0.0..=MAX_HVAC_POWER_W).contains(&power) {
                return Err(TransportError::Rejected {
                    topic: Topic::Settings,
                    reason: format!("pw={power:.2} outside [0, {MAX_HVAC_POWER_W}]"),
                });
            }
        }
        if let Setpoint::Set(target) = cmd.target_temp_c {
            let (min, max) = TARGET_TEMP_RANGE_C;
            if !(min..=max).contains(&target) {
                return Err(TransportError::Rejected {
                    topic: Topic::Settings,
                    reason: format!("targetTemp={target:.2} outside [{min}, {max}]"),
                });
            }
        }

        let current = &state.hvac;
        let status = cmd.status.resolve(current.status);
        let mode = cmd.mode.resolve(current.mode);
        // Green mode keeps whatever power the unit already settled on.
        let power_w = if !status.is_active() {
            0.0
        } else if mode == HvacMode::Green {
            current.power_w
        } else {
            cmd.power_w.resolve(current.power_w)
        };
        state.hvac = HvacState {
            power_w,
            status,
            mode,
            target_temp_c: cmd.target_temp_c.resolve(current.target_temp_c),
            timestamp: chrono::Utc::now(),
        };
        Ok(())
    }

    /// Periodically walks the sensors the way the node firmware does and
    /// moves battery energy according to the current relay routing.
    pub fn spawn_drift(self: Arc<Self>, tick: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.tick().await;
            loop {
                interval.tick().await;
                self.drift_step(tick.as_secs_f64());
            }
        })
    }

    fn drift_step(&self, dt_secs: f64) {
        {
            let mut rng = rand::thread_rng();
            let mut s = self.state.lock();

            s.irradiance = (s.irradiance + rng.gen_range(-0.05..=0.05)).clamp(0.0, 1.5);
            s.out_temp = (s.out_temp + rng.gen_range(-0.5..=0.5)).clamp(20.0, 35.0);
            s.mod_temp = (s.mod_temp + rng.gen_range(-0.5..=0.5)).clamp(15.0, 65.0);

            let expected = s.irradiance * 2_000.0;
            s.gen_power = (expected + rng.gen_range(-15.0..=15.0)).clamp(0.0, 3_000.0);

            // Room follows the outside temperature, pushed by the HVAC.
            let hvac_push = match s.hvac.status {
                HvacStatus::Cool => -s.hvac.power_w / MAX_HVAC_POWER_W,
                HvacStatus::Heat => s.hvac.power_w / MAX_HVAC_POWER_W,
                _ => 0.0,
            };
            let leak = (s.out_temp - s.room_temp) * 0.05;
            s.room_temp = (s.room_temp + leak + hvac_push + rng.gen_range(-0.2..=0.2))
                .clamp(15.0, 40.0);

            let hours = dt_secs / 3_600.0;
            let charge = if s.relay.supply_source == SupplySource::Battery {
                s.relay.power_supply_w
            } else {
                0.0
            };
            let discharge = if s.relay.house_source == HouseSource::Battery {
                s.relay.power_house_w
            } else {
                0.0
            };
            s.battery_wh = (s.battery_wh + (charge - discharge) * hours).clamp(0.0, 10_000.0);
        }

        for topic in [Topic::Weather, Topic::GenPower, Topic::RoomTemp, Topic::Battery] {
            let payload = self.state.lock().payload(topic);
            self.notify(topic, payload);
        }
    }
}

#[async_trait]
impl ActuatorTransport for SimulatedField {
    async fn send(&self, command: FieldCommand) -> Result<Ack, TransportError> {
        self.sent.lock().push(command);
        let topic = command.topic();
        self.check_reachable(topic)?;

        let payload = {
            let mut state = self.state.lock();
            match &command {
                FieldCommand::Relay(cmd) => Self::apply_relay(&mut state, cmd)?,
                FieldCommand::Hvac(cmd) => Self::apply_hvac(&mut state, cmd)?,
                FieldCommand::AntiDust(cmd) => state.anti_dust = cmd.mode,
            }
            state.payload(topic)
        };
        debug!(%topic, "simulated node applied command");
        self.notify(topic, payload);
        Ok(Ack::Changed)
    }

    async fn get(&self, topic: Topic) -> Result<Observation, TransportError> {
        self.check_reachable(topic)?;
        let payload = self.state.lock().payload(topic);
        Ok(Observation::new(topic, payload))
    }

    fn observe(&self, topic: Topic) -> BoxStream<'static, Observation> {
        let rx = self.events.subscribe();
        stream::unfold(rx, move |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(obs) if obs.topic == topic => return Some((obs, rx)),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(%topic, skipped, "observer lagged, notifications dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AntiDustCommand, HvacCommand};

    #[tokio::test]
    async fn relay_commands_are_applied_and_echoed() {
        let field = SimulatedField::new();
        let mut relay_events = field.observe(Topic::Relay);

        let target = RelayState::new(SupplySource::Hvac, HouseSource::SolarPanel, 260.0, 260.0);
        field
            .send(FieldCommand::Relay(RelayCommand::apply(&target)))
            .await
            .unwrap();

        assert!(field.relay().same_routing(&target));
        let echo = relay_events.next().await.unwrap();
        assert_eq!(echo.payload["r_sp"], 0);
        assert_eq!(echo.payload["p_h"], 260.0);
    }

    #[tokio::test]
    async fn out_of_range_relay_power_is_rejected() {
        let field = SimulatedField::new();
        let before = field.relay();
        let err = field
            .send(FieldCommand::Relay(RelayCommand {
                supply_source: Setpoint::Keep,
                house_source: Setpoint::Keep,
                power_supply_w: Setpoint::Set(2_000.0),
                power_house_w: Setpoint::Keep,
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Rejected { .. }));
        assert!(field.relay().same_routing(&before));
        assert_eq!(field.sent_commands().len(), 1);
    }

    #[tokio::test]
    async fn hvac_node_zeroes_power_when_off_and_keeps_it_in_green() {
        let field = SimulatedField::new();
        field.set_local_settings(HvacState {
            power_w: 300.0,
            status: HvacStatus::Cool,
            mode: HvacMode::Green,
            target_temp_c: 22.0,
            timestamp: chrono::Utc::now(),
        });

        field
            .send(FieldCommand::Hvac(HvacCommand::power(800.0)))
            .await
            .unwrap();
        assert_eq!(field.hvac().power_w, 300.0);

        field
            .send(FieldCommand::Hvac(HvacCommand {
                status: Setpoint::Set(HvacStatus::Off),
                ..Default::default()
            }))
            .await
            .unwrap();
        assert_eq!(field.hvac().power_w, 0.0);
        assert_eq!(field.hvac().status, HvacStatus::Off);
    }

    #[tokio::test]
    async fn unreachable_topics_fail_but_are_logged() {
        let field = SimulatedField::new();
        field.set_unreachable(Topic::AntiDust, true);
        let result = field
            .send(FieldCommand::AntiDust(AntiDustCommand {
                mode: AntiDustMode::On,
            }))
            .await;
        assert!(matches!(result, Err(TransportError::Unreachable { .. })));
        assert_eq!(field.anti_dust(), AntiDustMode::Off);
        assert!(field.get(Topic::AntiDust).await.is_err());
        assert!(field.get(Topic::Relay).await.is_ok());
    }

    #[tokio::test]
    async fn drift_keeps_values_in_physical_bounds() {
        let field = SimulatedField::new();
        for _ in 0..200 {
            field.drift_step(7.0);
        }
        let s = field.state.lock().clone();
        assert!((0.0..=1.5).contains(&s.irradiance));
        assert!((15.0..=40.0).contains(&s.room_temp));
        assert!((0.0..=10_000.0).contains(&s.battery_wh));
    }
}
