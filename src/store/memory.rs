use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::RwLock;

use super::{integrate_steps, net_grid_power, StateStore, StoreError};
use crate::domain::{AntiDustState, HvacState, Reading, RelayState, SensorKind};

const DEFAULT_HISTORY: usize = 10_000;

/// In-process store. Each entity has its own lock so readers of one table
/// never wait on writers of another.
#[derive(Debug)]
pub struct MemoryStateStore {
    readings: RwLock<HashMap<SensorKind, VecDeque<Reading>>>,
    relays: RwLock<VecDeque<RelayState>>,
    hvac: RwLock<VecDeque<HvacState>>,
    anti_dust: RwLock<VecDeque<AntiDustState>>,
    history: usize,
    offline: AtomicBool,
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::with_history(DEFAULT_HISTORY)
    }
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps at most `history` rows per table.
    pub fn with_history(history: usize) -> Self {
        Self {
            readings: RwLock::new(HashMap::new()),
            relays: RwLock::new(VecDeque::new()),
            hvac: RwLock::new(VecDeque::new()),
            anti_dust: RwLock::new(VecDeque::new()),
            history: history.max(1),
            offline: AtomicBool::new(false),
        }
    }

    /// Makes every call fail with [`StoreError::Unavailable`], as a lost
    /// database connection would.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn relay_rows(&self) -> usize {
        self.relays.read().len()
    }

    pub fn hvac_rows(&self) -> usize {
        self.hvac.read().len()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store set offline".into()));
        }
        Ok(())
    }

    fn push<T>(history: usize, rows: &mut VecDeque<T>, row: T) {
        rows.push_back(row);
        while rows.len() > history {
            rows.pop_front();
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn insert_reading(&self, reading: &Reading) -> Result<(), StoreError> {
        self.check()?;
        let mut readings = self.readings.write();
        let rows = readings.entry(reading.sensor).or_default();
        Self::push(self.history, rows, *reading);
        Ok(())
    }

    async fn latest(&self, sensor: SensorKind, n: usize) -> Result<Vec<Reading>, StoreError> {
        self.check()?;
        Ok(self
            .readings
            .read()
            .get(&sensor)
            .map(|rows| rows.iter().rev().take(n).copied().collect())
            .unwrap_or_default())
    }

    async fn insert_relay(&self, relay: &RelayState) -> Result<(), StoreError> {
        self.check()?;
        Self::push(self.history, &mut self.relays.write(), relay.clone());
        Ok(())
    }

    async fn insert_hvac(&self, hvac: &HvacState) -> Result<(), StoreError> {
        self.check()?;
        Self::push(self.history, &mut self.hvac.write(), hvac.clone());
        Ok(())
    }

    async fn insert_anti_dust(&self, state: &AntiDustState) -> Result<(), StoreError> {
        self.check()?;
        Self::push(self.history, &mut self.anti_dust.write(), *state);
        Ok(())
    }

    async fn latest_relay(&self) -> Result<Option<RelayState>, StoreError> {
        self.check()?;
        Ok(self.relays.read().back().cloned())
    }

    async fn latest_hvac(&self) -> Result<Option<HvacState>, StoreError> {
        self.check()?;
        Ok(self.hvac.read().back().cloned())
    }

    async fn latest_anti_dust(&self) -> Result<Option<AntiDustState>, StoreError> {
        self.check()?;
        Ok(self.anti_dust.read().back().copied())
    }

    async fn aggregate_power_over_window(&self, window: Duration) -> Result<f64, StoreError> {
        self.check()?;
        let end = Utc::now();
        let samples: Vec<_> = self
            .hvac
            .read()
            .iter()
            .map(|h| (h.timestamp, h.power_w))
            .collect();
        Ok(integrate_steps(&samples, end - window, end))
    }

    async fn aggregate_net_grid_balance(&self, window: Duration) -> Result<f64, StoreError> {
        self.check()?;
        let end = Utc::now();
        let samples: Vec<_> = self
            .relays
            .read()
            .iter()
            .map(|r| (r.timestamp, net_grid_power(r)))
            .collect();
        Ok(integrate_steps(&samples, end - window, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{HouseSource, HvacMode, HvacStatus, SupplySource};

    #[tokio::test]
    async fn latest_returns_newest_first() {
        let store = MemoryStateStore::new();
        for v in [1.0, 2.0, 3.0] {
            store
                .insert_reading(&Reading::new(SensorKind::Battery, v))
                .await
                .unwrap();
        }
        let latest = store.latest(SensorKind::Battery, 2).await.unwrap();
        assert_eq!(latest.iter().map(|r| r.value).collect::<Vec<_>>(), vec![3.0, 2.0]);
        assert!(store.latest(SensorKind::RoomTemp, 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let store = MemoryStateStore::with_history(2);
        for p in [10.0, 20.0, 30.0] {
            store
                .insert_relay(&RelayState::new(SupplySource::Hvac, HouseSource::SolarPanel, p, p))
                .await
                .unwrap();
        }
        assert_eq!(store.relay_rows(), 2);
        assert_eq!(store.latest_relay().await.unwrap().unwrap().power_house_w, 30.0);
    }

    #[tokio::test]
    async fn offline_store_fails_every_call() {
        let store = MemoryStateStore::new();
        store.set_offline(true);
        assert!(matches!(
            store.latest_hvac().await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_offline(false);
        assert!(store.latest_hvac().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn hvac_energy_integrates_recent_rows() {
        let store = MemoryStateStore::new();
        let mut hvac = HvacState {
            power_w: 400.0,
            status: HvacStatus::Heat,
            mode: HvacMode::Normal,
            target_temp_c: 22.0,
            timestamp: Utc::now() - Duration::minutes(30),
        };
        store.insert_hvac(&hvac).await.unwrap();
        hvac.power_w = 0.0;
        hvac.timestamp = Utc::now();
        store.insert_hvac(&hvac).await.unwrap();

        let wh = store
            .aggregate_power_over_window(Duration::hours(1))
            .await
            .unwrap();
        assert!((wh - 200.0).abs() < 1.0, "got {wh}");
    }
}
