//! State Store Adapter: latest and historical values of sensors and devices.
//!
//! Every call may fail transiently. Callers treat a failure as "decision
//! deferred", never as fatal.

pub mod memory;
#[cfg(feature = "db")]
pub mod pg;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::domain::{
    AntiDustState, HouseSource, HvacState, Reading, RelayState, SensorKind, SensorSnapshot,
    SupplySource,
};

pub use memory::MemoryStateStore;
#[cfg(feature = "db")]
pub use pg::PgStateStore;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store call timed out")]
    Timeout,
    #[error("store backend error: {0}")]
    Backend(String),
}

#[cfg(feature = "db")]
impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut => StoreError::Timeout,
            sqlx::Error::Io(e) => StoreError::Unavailable(e.to_string()),
            sqlx::Error::PoolClosed => StoreError::Unavailable("pool closed".into()),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn insert_reading(&self, reading: &Reading) -> Result<(), StoreError>;
    /// Up to `n` most recent readings of `sensor`, newest first.
    async fn latest(&self, sensor: SensorKind, n: usize) -> Result<Vec<Reading>, StoreError>;
    async fn insert_relay(&self, relay: &RelayState) -> Result<(), StoreError>;
    async fn insert_hvac(&self, hvac: &HvacState) -> Result<(), StoreError>;
    async fn insert_anti_dust(&self, state: &AntiDustState) -> Result<(), StoreError>;
    async fn latest_relay(&self) -> Result<Option<RelayState>, StoreError>;
    async fn latest_hvac(&self) -> Result<Option<HvacState>, StoreError>;
    async fn latest_anti_dust(&self) -> Result<Option<AntiDustState>, StoreError>;
    /// Energy drawn by the HVAC over the trailing window (Wh).
    async fn aggregate_power_over_window(&self, window: Duration) -> Result<f64, StoreError>;
    /// Energy exported to the grid minus energy imported from it over the
    /// trailing window (Wh).
    async fn aggregate_net_grid_balance(&self, window: Duration) -> Result<f64, StoreError>;
}

/// Reads the latest value of every sensor.
pub async fn read_snapshot(store: &dyn StateStore) -> Result<SensorSnapshot, StoreError> {
    let mut snapshot = SensorSnapshot::default();
    for sensor in SensorKind::ALL {
        if let Some(reading) = store.latest(sensor, 1).await?.into_iter().next() {
            snapshot.set(reading);
        }
    }
    Ok(snapshot)
}

/// Net grid flow implied by a relay configuration (W, export positive).
pub fn net_grid_power(relay: &RelayState) -> f64 {
    let export = if relay.supply_source == SupplySource::Grid {
        relay.power_supply_w
    } else {
        0.0
    };
    let import = if relay.house_source == HouseSource::Grid {
        relay.power_house_w
    } else {
        0.0
    };
    export - import
}

/// Integrates a step series over `[start, end]`, each sample holding until
/// the next one. Samples must be sorted by time. Returns value·hours.
pub fn integrate_steps(samples: &[(DateTime<Utc>, f64)], start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let mut total = 0.0;
    for (i, (at, value)) in samples.iter().enumerate() {
        let next = samples.get(i + 1).map(|(t, _)| *t).unwrap_or(end);
        let from = (*at).max(start);
        let to = next.min(end);
        if to > from {
            total += value * (to - from).num_milliseconds() as f64 / 3_600_000.0;
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integration_clips_to_the_window() {
        let end = Utc::now();
        let start = end - Duration::hours(1);
        let samples = vec![
            (start - Duration::minutes(30), 100.0),
            (start + Duration::minutes(30), 200.0),
        ];
        // 100 W for the first half hour, 200 W for the second.
        let wh = integrate_steps(&samples, start, end);
        assert!((wh - 150.0).abs() < 1e-6);
    }

    #[test]
    fn empty_series_integrates_to_zero() {
        let end = Utc::now();
        assert_eq!(integrate_steps(&[], end - Duration::hours(1), end), 0.0);
    }

    #[test]
    fn net_grid_power_signs_export_and_import() {
        let exporting = RelayState::new(SupplySource::Grid, HouseSource::Battery, 300.0, 100.0);
        assert_eq!(net_grid_power(&exporting), 300.0);
        let importing = RelayState::new(SupplySource::Battery, HouseSource::Grid, 300.0, 100.0);
        assert_eq!(net_grid_power(&importing), -100.0);
        let both = RelayState::new(SupplySource::Grid, HouseSource::Grid, 300.0, 100.0);
        assert_eq!(net_grid_power(&both), 200.0);
    }
}
