//! End-to-end arbitration through the engine handle against the in-memory
//! store, the simulated field and broadcast alerts.

use std::sync::Arc;

use energy_dispatch::alerts::{Alert, BroadcastAlerts};
use energy_dispatch::config::Config;
use energy_dispatch::controller::AppState;
use energy_dispatch::dispatch::{
    DispatchError, DispatchEvent, DispatchPath, EmitAck, Outcome, SettingsSource, SkipReason,
};
use energy_dispatch::domain::{
    AntiDustMode, HouseSource, HvacMode, HvacState, HvacStatus, Reading, SensorKind, SupplySource,
};
use energy_dispatch::store::{MemoryStateStore, StateStore};
use energy_dispatch::transport::{FieldCommand, SimulatedField};

struct Rig {
    state: AppState,
    store: Arc<MemoryStateStore>,
    field: Arc<SimulatedField>,
    alerts: BroadcastAlerts,
}

fn rig() -> Rig {
    let store = Arc::new(MemoryStateStore::new());
    let field = Arc::new(SimulatedField::new());
    let alerts = BroadcastAlerts::new(32);
    let state = AppState::with_parts(
        Config::default(),
        store.clone(),
        field.clone(),
        Arc::new(alerts.clone()),
        Some(field.clone()),
    );
    Rig {
        state,
        store,
        field,
        alerts,
    }
}

impl Rig {
    async fn seed(&self, readings: &[(SensorKind, f64)]) {
        for (sensor, value) in readings {
            self.store
                .insert_reading(&Reading::new(*sensor, *value))
                .await
                .unwrap();
        }
    }

    async fn hvac(&self, status: HvacStatus, mode: HvacMode) {
        self.store
            .insert_hvac(&HvacState {
                status,
                mode,
                target_temp_c: 22.0,
                ..HvacState::default()
            })
            .await
            .unwrap();
    }

    async fn dispatch(&self, event: DispatchEvent) -> Result<Outcome, DispatchError> {
        self.state.engine.dispatch(event).await
    }
}

fn emitted(outcome: Outcome) -> (DispatchPath, energy_dispatch::domain::RelayState, Option<f64>, EmitAck) {
    match outcome {
        Outcome::Emitted {
            path,
            relay,
            needed_power_w,
            ack,
        } => (path, relay, needed_power_w, ack),
        other => panic!("expected an emitted decision, got {other:?}"),
    }
}

#[tokio::test]
async fn solar_covers_a_cooling_demand() {
    let rig = rig();
    rig.hvac(HvacStatus::Cool, HvacMode::Normal).await;
    rig.seed(&[
        (SensorKind::RoomTemp, 25.0),
        (SensorKind::OutTemp, 30.0),
        (SensorKind::GenPower, 500.0),
        (SensorKind::Battery, 5_000.0),
    ])
    .await;

    let outcome = rig
        .dispatch(DispatchEvent::SensorUpdate(SensorKind::RoomTemp))
        .await
        .unwrap();
    let (path, relay, needed, ack) = emitted(outcome);
    assert_eq!(path, DispatchPath::Full);
    assert_eq!(ack, EmitAck::Applied);
    assert_eq!(needed, Some(260.0));
    assert_eq!(relay.supply_source, SupplySource::Hvac);
    assert_eq!(relay.house_source, HouseSource::SolarPanel);
    assert_eq!(relay.power_house_w, 260.0);

    assert!(rig.field.relay().same_routing(&relay));
    let stored = rig.store.latest_hvac().await.unwrap().unwrap();
    assert_eq!(stored.power_w, 260.0);
    assert_eq!(stored.status, HvacStatus::Cool);
}

#[tokio::test]
async fn drained_battery_falls_back_to_grid() {
    let rig = rig();
    rig.hvac(HvacStatus::Cool, HvacMode::Normal).await;
    rig.seed(&[
        (SensorKind::RoomTemp, 25.0),
        (SensorKind::OutTemp, 30.0),
        (SensorKind::GenPower, 0.0),
        (SensorKind::Battery, 50.0),
    ])
    .await;

    let (_, relay, needed, _) = emitted(
        rig.dispatch(DispatchEvent::SensorUpdate(SensorKind::Battery))
            .await
            .unwrap(),
    );
    assert_eq!(needed, Some(260.0));
    assert_eq!(relay.house_source, HouseSource::Grid);
    assert_eq!(relay.supply_source, SupplySource::Battery);
    assert_eq!(relay.power_supply_w, 0.0);
    assert_eq!(relay.power_house_w, 260.0);
}

#[tokio::test]
async fn hvac_off_only_routes_the_surplus() {
    let rig = rig();
    rig.hvac(HvacStatus::Off, HvacMode::Normal).await;
    rig.seed(&[(SensorKind::GenPower, 500.0), (SensorKind::Battery, 5_000.0)])
        .await;

    let (path, relay, needed, _) = emitted(
        rig.dispatch(DispatchEvent::SensorUpdate(SensorKind::RoomTemp))
            .await
            .unwrap(),
    );
    assert_eq!(path, DispatchPath::Degraded);
    assert_eq!(needed, None);
    assert_eq!(relay.power_house_w, 0.0);
    assert_eq!(relay.supply_source, SupplySource::Battery);
    assert!(!rig
        .field
        .sent_commands()
        .iter()
        .any(|c| matches!(c, FieldCommand::Hvac(_))));

    // Nothing new to route until generation is reported again.
    let outcome = rig
        .dispatch(DispatchEvent::SensorUpdate(SensorKind::Battery))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        Outcome::Skipped {
            reason: SkipReason::AlreadyRouted
        }
    );

    rig.seed(&[(SensorKind::GenPower, 650.0)]).await;
    let (_, relay, _, ack) = emitted(
        rig.dispatch(DispatchEvent::SensorUpdate(SensorKind::GenPower))
            .await
            .unwrap(),
    );
    assert_eq!(ack, EmitAck::Applied);
    assert_eq!(relay.power_supply_w, 650.0);
    assert_eq!(relay.power_house_w, 0.0);
}

#[tokio::test]
async fn repeated_generation_report_is_sent_once() {
    let rig = rig();
    rig.hvac(HvacStatus::Off, HvacMode::Normal).await;
    rig.seed(&[(SensorKind::GenPower, 500.0), (SensorKind::Battery, 5_000.0)])
        .await;

    let (_, _, _, ack) = emitted(
        rig.dispatch(DispatchEvent::SensorUpdate(SensorKind::GenPower))
            .await
            .unwrap(),
    );
    assert_eq!(ack, EmitAck::Applied);
    let sent = rig.field.sent_commands().len();

    rig.seed(&[(SensorKind::GenPower, 500.0)]).await;
    let (path, _, _, ack) = emitted(
        rig.dispatch(DispatchEvent::SensorUpdate(SensorKind::GenPower))
            .await
            .unwrap(),
    );
    assert_eq!(path, DispatchPath::Degraded);
    assert_eq!(ack, EmitAck::Unchanged);
    assert_eq!(rig.field.sent_commands().len(), sent);
    assert_eq!(rig.store.relay_rows(), 1);
}

#[tokio::test]
async fn generation_above_the_relay_rating_is_capped() {
    let rig = rig();
    rig.hvac(HvacStatus::Off, HvacMode::Normal).await;
    rig.seed(&[(SensorKind::GenPower, 2_000.0), (SensorKind::Battery, 5_000.0)])
        .await;

    let (_, relay, _, ack) = emitted(
        rig.dispatch(DispatchEvent::SensorUpdate(SensorKind::GenPower))
            .await
            .unwrap(),
    );
    assert_eq!(ack, EmitAck::Applied);
    assert_eq!(relay.power_supply_w, 1_500.0);
    assert!(rig.field.relay().same_routing(&relay));
    let stored = rig.store.latest_relay().await.unwrap().unwrap();
    assert!(stored.same_routing(&rig.field.relay()));
}

#[tokio::test]
async fn dust_alarm_with_hvac_off_only_raises_the_alert() {
    let rig = rig();
    let mut alerts = rig.alerts.subscribe();
    rig.seed(&[(SensorKind::GenPower, 500.0), (SensorKind::Battery, 5_000.0)])
        .await;

    let outcome = rig
        .dispatch(DispatchEvent::AntiDustChange {
            mode: AntiDustMode::Alarm,
            from_operator: false,
        })
        .await
        .unwrap();
    assert_eq!(
        outcome,
        Outcome::Skipped {
            reason: SkipReason::HvacInactive
        }
    );
    assert!(rig.field.sent_commands().is_empty());
    assert_eq!(alerts.try_recv().unwrap(), Alert::anti_dust(AntiDustMode::Alarm));
    assert_eq!(
        rig.store.latest_anti_dust().await.unwrap().unwrap().mode,
        AntiDustMode::Alarm
    );
}

#[tokio::test]
async fn repeated_evaluation_sends_nothing_new() {
    let rig = rig();
    rig.hvac(HvacStatus::Cool, HvacMode::Normal).await;
    rig.seed(&[
        (SensorKind::RoomTemp, 25.0),
        (SensorKind::OutTemp, 30.0),
        (SensorKind::GenPower, 500.0),
        (SensorKind::Battery, 5_000.0),
    ])
    .await;

    rig.dispatch(DispatchEvent::SensorUpdate(SensorKind::RoomTemp))
        .await
        .unwrap();
    let sent = rig.field.sent_commands().len();

    let (_, _, _, ack) = emitted(
        rig.dispatch(DispatchEvent::SensorUpdate(SensorKind::RoomTemp))
            .await
            .unwrap(),
    );
    assert_eq!(ack, EmitAck::Unchanged);
    assert_eq!(rig.field.sent_commands().len(), sent);
    assert_eq!(rig.store.relay_rows(), 1);
}

#[tokio::test]
async fn green_mode_suppresses_dispatch() {
    let rig = rig();
    rig.hvac(HvacStatus::Cool, HvacMode::Green).await;
    rig.seed(&[
        (SensorKind::RoomTemp, 25.0),
        (SensorKind::OutTemp, 30.0),
        (SensorKind::GenPower, 500.0),
        (SensorKind::Battery, 5_000.0),
    ])
    .await;

    let outcome = rig
        .dispatch(DispatchEvent::SensorUpdate(SensorKind::RoomTemp))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        Outcome::Skipped {
            reason: SkipReason::GreenMode
        }
    );
    assert!(rig.field.sent_commands().is_empty());
}

#[tokio::test]
async fn missing_battery_reading_fails_closed() {
    let rig = rig();
    rig.hvac(HvacStatus::Cool, HvacMode::Normal).await;
    rig.seed(&[
        (SensorKind::RoomTemp, 25.0),
        (SensorKind::OutTemp, 30.0),
        (SensorKind::GenPower, 500.0),
    ])
    .await;

    let err = rig
        .dispatch(DispatchEvent::SensorUpdate(SensorKind::RoomTemp))
        .await
        .unwrap_err();
    assert_eq!(err, DispatchError::UnavailableInput(SensorKind::Battery));
    assert!(rig.field.sent_commands().is_empty());
    assert_eq!(rig.store.relay_rows(), 0);
}

#[tokio::test]
async fn unchanged_field_settings_report_is_ignored() {
    let rig = rig();
    rig.hvac(HvacStatus::Off, HvacMode::Normal).await;
    let stored = rig.store.latest_hvac().await.unwrap().unwrap();

    let outcome = rig
        .dispatch(DispatchEvent::SettingsChange(SettingsSource::Field(stored)))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        Outcome::Skipped {
            reason: SkipReason::Unchanged
        }
    );
    assert_eq!(rig.store.hvac_rows(), 1);
}
