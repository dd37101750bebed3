//! Field notifications flowing through ingest into the store and back out as
//! commands, with the simulated field standing in for both nodes.

use std::sync::Arc;
use std::time::Duration;

use energy_dispatch::alerts::BroadcastAlerts;
use energy_dispatch::config::Config;
use energy_dispatch::controller::{spawn_controller_tasks, AppState};
use energy_dispatch::domain::{HvacMode, HvacState, HvacStatus, SensorKind};
use energy_dispatch::store::{MemoryStateStore, StateStore};
use energy_dispatch::transport::SimulatedField;
use tokio::task::JoinHandle;

/// Polls `check` until it holds or two seconds pass.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

fn start() -> (AppState, Arc<MemoryStateStore>, Arc<SimulatedField>) {
    let (state, store, field, _tasks) = start_with_tasks();
    (state, store, field)
}

fn start_with_tasks() -> (
    AppState,
    Arc<MemoryStateStore>,
    Arc<SimulatedField>,
    Vec<JoinHandle<()>>,
) {
    let store = Arc::new(MemoryStateStore::new());
    let field = Arc::new(SimulatedField::new());
    let mut cfg = Config::default();
    cfg.transport.sim_tick_secs = 3_600;
    let state = AppState::with_parts(
        cfg,
        store.clone(),
        field.clone(),
        Arc::new(BroadcastAlerts::new(16)),
        Some(field.clone()),
    );
    let tasks = spawn_controller_tasks(&state);
    (state, store, field, tasks)
}

#[tokio::test]
async fn initial_reads_prime_the_store() {
    let (_state, store, _field) = start();

    let primed = eventually(|| {
        let store = store.clone();
        async move {
            let mut all = true;
            for sensor in SensorKind::ALL {
                all &= !store.latest(sensor, 1).await.unwrap().is_empty();
            }
            all && store.latest_hvac().await.unwrap().is_some()
                && store.latest_relay().await.unwrap().is_some()
        }
    })
    .await;
    assert!(primed, "every sensor, the relay and the HVAC should be stored");
}

#[tokio::test]
async fn room_temperature_change_is_recorded() {
    let (_state, store, field) = start();
    assert!(eventually(|| {
        let store = store.clone();
        async move { !store.latest(SensorKind::RoomTemp, 1).await.unwrap().is_empty() }
    })
    .await);

    field.set_room_temp(27.5);
    let recorded = eventually(|| {
        let store = store.clone();
        async move {
            store
                .latest(SensorKind::RoomTemp, 1)
                .await
                .unwrap()
                .first()
                .is_some_and(|r| r.value == 27.5)
        }
    })
    .await;
    assert!(recorded);
}

#[tokio::test]
async fn settings_changed_at_the_unit_drive_a_dispatch() {
    let (_state, store, field) = start();
    assert!(eventually(|| {
        let store = store.clone();
        async move { store.latest(SensorKind::Battery, 1).await.unwrap().len() == 1 }
    })
    .await);

    // Someone switches the unit to cooling with its remote.
    field.set_room_temp(26.0);
    field.set_local_settings(HvacState {
        status: HvacStatus::Cool,
        mode: HvacMode::Normal,
        target_temp_c: 22.0,
        ..HvacState::default()
    });

    let dispatched = eventually(|| {
        let store = store.clone();
        async move {
            store
                .latest_hvac()
                .await
                .unwrap()
                .is_some_and(|h| h.status == HvacStatus::Cool && h.power_w > 0.0)
        }
    })
    .await;
    assert!(dispatched, "a cooling demand should have been estimated and persisted");
    assert!(field.hvac().power_w > 0.0);
}

#[tokio::test]
async fn aborting_background_tasks_stops_the_engine() {
    let (state, _store, _field, tasks) = start_with_tasks();
    assert!(state.engine.is_running());

    for task in &tasks {
        task.abort();
    }
    for task in tasks {
        let _ = task.await;
    }
    assert!(!state.engine.is_running());
    assert!(state.engine.dispatch(energy_dispatch::dispatch::DispatchEvent::SensorUpdate(
        SensorKind::Battery
    ))
    .await
    .is_err());
}
