use anyhow::Result;
use figment::{providers::{Env, Format, Serialized, Toml}, Figment};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub dispatch: DispatchConfig,
    pub engine: EngineConfig,
    pub store: StoreConfig,
    pub transport: TransportConfig,
    pub alerts: AlertsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            request_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

/// Physical constants of the installation used by the estimator and selector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Fixed draw while ventilating (W).
    pub vent_power_w: f64,
    /// Gain on the distance to the target temperature.
    pub k1: f64,
    /// Time constant of the room (s).
    pub time_constant_s: f64,
    /// Heat leak through the envelope per °C of indoor/outdoor difference.
    pub leak_coeff: f64,
    /// Thermal-flow units per watt.
    pub power_coeff: f64,
    /// Decimal places kept on the estimated demand.
    pub demand_precision: u32,
    /// DC to AC conversion loss multiplier used for battery feasibility.
    pub dc_ac_loss_factor: f64,
    /// Control interval the battery must be able to sustain (h).
    pub battery_interval_hours: f64,
    pub battery_capacity_wh: f64,
    /// Fraction of capacity above which surplus goes to the grid.
    pub charge_threshold: f64,
    /// Energy never drawn from the battery (Wh).
    pub reserve_margin_wh: f64,
    /// Readings older than this count as unavailable.
    pub max_reading_age_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            vent_power_w: 50.0,
            k1: 0.2,
            time_constant_s: 60.0,
            leak_coeff: 0.05,
            power_coeff: 1.0 / 1000.0,
            demand_precision: 2,
            dc_ac_loss_factor: 10.0,
            battery_interval_hours: 10.0,
            battery_capacity_wh: 10_000.0,
            charge_threshold: 0.9,
            reserve_margin_wh: 500.0,
            max_reading_age_secs: 900,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub queue_capacity: usize,
    /// Upper bound on every store and transport call made during an evaluation.
    pub io_timeout_ms: u64,
    /// How long an operator request waits for its evaluation.
    pub request_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            io_timeout_ms: 2_000,
            request_timeout_secs: 8,
        }
    }
}

impl EngineConfig {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    pub url: String,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Memory,
            url: "postgres://localhost/energy_dispatch".into(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Simulated,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub kind: TransportKind,
    /// Base URL of the gateway in front of the energy node.
    pub energy_node_url: String,
    /// Base URL of the gateway in front of the HVAC node.
    pub hvac_node_url: String,
    pub timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Simulated field only: period of the synthetic sensor drift.
    pub sim_tick_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Simulated,
            energy_node_url: "http://127.0.0.1:5683".into(),
            hvac_node_url: "http://127.0.0.1:5684".into(),
            timeout_ms: 1_500,
            poll_interval_ms: 5_000,
            sim_tick_secs: 7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertsKind {
    Broadcast,
    Mqtt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub kind: AlertsKind,
    pub capacity: usize,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_client_id: String,
    pub mqtt_keep_alive_secs: u64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            kind: AlertsKind::Broadcast,
            capacity: 128,
            mqtt_host: "127.0.0.1".into(),
            mqtt_port: 1883,
            mqtt_client_id: "energy-dispatch".into(),
            mqtt_keep_alive_secs: 60,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();
        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("config/default.toml"))
            .merge(Env::prefixed("EDE__").split("__"));
        Ok(figment.extract()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_deployed_installation() {
        let cfg = Config::default();
        assert_eq!(cfg.dispatch.vent_power_w, 50.0);
        assert_eq!(cfg.dispatch.battery_capacity_wh, 10_000.0);
        assert_eq!(cfg.dispatch.charge_threshold, 0.9);
        assert_eq!(cfg.store.kind, StoreKind::Memory);
        assert_eq!(cfg.transport.kind, TransportKind::Simulated);
        assert!(cfg.server.socket_addr().is_ok());
    }

    #[test]
    fn toml_overrides_merge_onto_defaults() {
        let cfg: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::string(
                r#"
                [dispatch]
                reserve_margin_wh = 1000.0

                [transport]
                kind = "http"
                "#,
            ))
            .extract()
            .unwrap();
        assert_eq!(cfg.dispatch.reserve_margin_wh, 1000.0);
        assert_eq!(cfg.dispatch.k1, 0.2);
        assert_eq!(cfg.transport.kind, TransportKind::Http);
    }
}
