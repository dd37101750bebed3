use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use super::ValidationError;

// ============================================================================
// Device enums
// ============================================================================

/// HVAC operating status. Wire codes follow the field node: 0=off .. 4=error.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum HvacStatus {
    Off,
    Vent,
    Cool,
    Heat,
    Error,
}

impl HvacStatus {
    /// Vent, cool and heat draw power; off and error never do.
    pub fn is_active(self) -> bool {
        matches!(self, HvacStatus::Vent | HvacStatus::Cool | HvacStatus::Heat)
    }

    pub fn code(self) -> u8 {
        match self {
            HvacStatus::Off => 0,
            HvacStatus::Vent => 1,
            HvacStatus::Cool => 2,
            HvacStatus::Heat => 3,
            HvacStatus::Error => 4,
        }
    }
}

impl TryFrom<u8> for HvacStatus {
    type Error = ValidationError;

    fn try_from(code: u8) -> Result<Self, ValidationError> {
        match code {
            0 => Ok(HvacStatus::Off),
            1 => Ok(HvacStatus::Vent),
            2 => Ok(HvacStatus::Cool),
            3 => Ok(HvacStatus::Heat),
            4 => Ok(HvacStatus::Error),
            other => Err(ValidationError::UnknownCode {
                field: "status",
                code: other,
            }),
        }
    }
}

/// HVAC dispatch mode. In green mode the node manages its own supply and the
/// engine stays out of the way.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum HvacMode {
    Normal,
    Green,
}

impl HvacMode {
    pub fn code(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Green => 1,
        }
    }
}

impl TryFrom<u8> for HvacMode {
    type Error = ValidationError;

    fn try_from(code: u8) -> Result<Self, ValidationError> {
        match code {
            0 => Ok(Self::Normal),
            1 => Ok(Self::Green),
            other => Err(ValidationError::UnknownCode {
                field: "mode",
                code: other,
            }),
        }
    }
}

/// Destination of the solar panel output.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum SupplySource {
    Hvac,
    Battery,
    Grid,
}

impl SupplySource {
    pub fn code(self) -> u8 {
        match self {
            Self::Hvac => 0,
            Self::Battery => 1,
            Self::Grid => 2,
        }
    }
}

impl TryFrom<u8> for SupplySource {
    type Error = ValidationError;

    fn try_from(code: u8) -> Result<Self, ValidationError> {
        match code {
            0 => Ok(Self::Hvac),
            1 => Ok(Self::Battery),
            2 => Ok(Self::Grid),
            other => Err(ValidationError::UnknownCode {
                field: "supply_source",
                code: other,
            }),
        }
    }
}

/// Origin of the power drawn by the HVAC.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum HouseSource {
    SolarPanel,
    Battery,
    Grid,
}

impl HouseSource {
    pub fn code(self) -> u8 {
        match self {
            Self::SolarPanel => 0,
            Self::Battery => 1,
            Self::Grid => 2,
        }
    }
}

impl TryFrom<u8> for HouseSource {
    type Error = ValidationError;

    fn try_from(code: u8) -> Result<Self, ValidationError> {
        match code {
            0 => Ok(Self::SolarPanel),
            1 => Ok(Self::Battery),
            2 => Ok(Self::Grid),
            other => Err(ValidationError::UnknownCode {
                field: "house_source",
                code: other,
            }),
        }
    }
}

/// Solar panel cleaning cycle state.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum AntiDustMode {
    #[default]
    Off,
    On,
    Alarm,
}

impl AntiDustMode {
    /// A cleaning cycle is running (manually or raised by the dust sensor).
    pub fn is_cleaning(self) -> bool {
        matches!(self, Self::On | Self::Alarm)
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::On => 1,
            Self::Alarm => 2,
        }
    }
}

impl TryFrom<u8> for AntiDustMode {
    type Error = ValidationError;

    fn try_from(code: u8) -> Result<Self, ValidationError> {
        match code {
            0 => Ok(Self::Off),
            1 => Ok(Self::On),
            2 => Ok(Self::Alarm),
            other => Err(ValidationError::UnknownCode {
                field: "antiDust",
                code: other,
            }),
        }
    }
}

// ============================================================================
// Sensors
// ============================================================================

/// Scalar sensors persisted as readings. The serialized names are the keys
/// used in the readings table.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
pub enum SensorKind {
    #[serde(rename = "roomTemp")]
    #[strum(serialize = "roomTemp")]
    RoomTemp,
    #[serde(rename = "outTemp")]
    #[strum(serialize = "outTemp")]
    OutTemp,
    #[serde(rename = "modTemp")]
    #[strum(serialize = "modTemp")]
    ModTemp,
    #[serde(rename = "irradiance")]
    #[strum(serialize = "irradiance")]
    Irradiance,
    #[serde(rename = "gen_power")]
    #[strum(serialize = "gen_power")]
    GenPower,
    #[serde(rename = "battery")]
    #[strum(serialize = "battery")]
    Battery,
}

impl SensorKind {
    pub const ALL: [SensorKind; 6] = [
        Self::RoomTemp,
        Self::OutTemp,
        Self::ModTemp,
        Self::Irradiance,
        Self::GenPower,
        Self::Battery,
    ];

    /// Only these sensors change the dispatch inputs enough to re-arbitrate.
    pub fn triggers_arbitration(self) -> bool {
        matches!(self, Self::RoomTemp | Self::GenPower | Self::Battery)
    }
}

/// A single timestamped sensor value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub sensor: SensorKind,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl Reading {
    pub fn new(sensor: SensorKind, value: f64) -> Self {
        Self {
            sensor,
            value,
            timestamp: Utc::now(),
        }
    }
}

/// Latest reading of every sensor, read once per evaluation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SensorSnapshot {
    pub room_temp: Option<Reading>,
    pub out_temp: Option<Reading>,
    pub mod_temp: Option<Reading>,
    pub irradiance: Option<Reading>,
    pub gen_power: Option<Reading>,
    pub battery_energy_wh: Option<Reading>,
}

impl SensorSnapshot {
    pub fn get(&self, sensor: SensorKind) -> Option<&Reading> {
        match sensor {
            SensorKind::RoomTemp => self.room_temp.as_ref(),
            SensorKind::OutTemp => self.out_temp.as_ref(),
            SensorKind::ModTemp => self.mod_temp.as_ref(),
            SensorKind::Irradiance => self.irradiance.as_ref(),
            SensorKind::GenPower => self.gen_power.as_ref(),
            SensorKind::Battery => self.battery_energy_wh.as_ref(),
        }
    }

    pub fn set(&mut self, reading: Reading) {
        let slot = match reading.sensor {
            SensorKind::RoomTemp => &mut self.room_temp,
            SensorKind::OutTemp => &mut self.out_temp,
            SensorKind::ModTemp => &mut self.mod_temp,
            SensorKind::Irradiance => &mut self.irradiance,
            SensorKind::GenPower => &mut self.gen_power,
            SensorKind::Battery => &mut self.battery_energy_wh,
        };
        *slot = Some(reading);
    }

    /// Value of `sensor` if it was read no earlier than `max_age` before `now`.
    pub fn fresh(&self, sensor: SensorKind, now: DateTime<Utc>, max_age: Duration) -> Option<f64> {
        self.get(sensor)
            .filter(|r| now.signed_duration_since(r.timestamp) <= max_age)
            .map(|r| r.value)
            .filter(|v| v.is_finite())
    }
}

// ============================================================================
// Device state
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HvacState {
    pub power_w: f64,
    pub status: HvacStatus,
    pub mode: HvacMode,
    pub target_temp_c: f64,
    pub timestamp: DateTime<Utc>,
}

impl Default for HvacState {
    fn default() -> Self {
        Self {
            power_w: 0.0,
            status: HvacStatus::Off,
            mode: HvacMode::Normal,
            target_temp_c: 22.0,
            timestamp: Utc::now(),
        }
    }
}

impl HvacState {
    /// Equal in every field but the timestamp.
    pub fn same_settings(&self, other: &HvacState) -> bool {
        self.power_w == other.power_w
            && self.status == other.status
            && self.mode == other.mode
            && self.target_temp_c == other.target_temp_c
    }

    /// Copy with a new power figure and a fresh timestamp.
    pub fn with_power(&self, power_w: f64) -> Self {
        Self {
            power_w,
            timestamp: Utc::now(),
            ..self.clone()
        }
    }
}

/// Relay configuration. `supply_source` is where solar output goes,
/// `house_source` is where the HVAC load is drawn from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayState {
    pub supply_source: SupplySource,
    pub house_source: HouseSource,
    pub power_supply_w: f64,
    pub power_house_w: f64,
    pub timestamp: DateTime<Utc>,
}

impl RelayState {
    pub fn new(
        supply_source: SupplySource,
        house_source: HouseSource,
        power_supply_w: f64,
        power_house_w: f64,
    ) -> Self {
        Self {
            supply_source,
            house_source,
            power_supply_w,
            power_house_w,
            timestamp: Utc::now(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, value) in [
            ("power_supply", self.power_supply_w),
            ("power_house", self.power_house_w),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ValidationError::OutOfRange {
                    field,
                    value,
                    min: 0.0,
                    max: f64::INFINITY,
                });
            }
        }
        Ok(())
    }

    /// Same legs and same power figures, timestamps ignored.
    pub fn same_routing(&self, other: &RelayState) -> bool {
        self.supply_source == other.supply_source
            && self.house_source == other.house_source
            && self.power_supply_w == other.power_supply_w
            && self.power_house_w == other.power_house_w
    }

    /// HVAC draws nothing through the relay.
    pub fn has_no_house_draw(&self) -> bool {
        self.power_house_w == 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AntiDustState {
    pub mode: AntiDustMode,
    pub timestamp: DateTime<Utc>,
}

impl AntiDustState {
    pub fn new(mode: AntiDustMode) -> Self {
        Self {
            mode,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_round_trip_through_try_from() {
        for status in [
            HvacStatus::Off,
            HvacStatus::Vent,
            HvacStatus::Cool,
            HvacStatus::Heat,
            HvacStatus::Error,
        ] {
            assert_eq!(HvacStatus::try_from(status.code()).unwrap(), status);
        }
        assert!(HvacStatus::try_from(5).is_err());
        assert!(SupplySource::try_from(3).is_err());
        assert_eq!(HouseSource::try_from(0).unwrap(), HouseSource::SolarPanel);
    }

    #[test]
    fn string_forms_match_the_field_vocabulary() {
        assert_eq!("cool".parse::<HvacStatus>().unwrap(), HvacStatus::Cool);
        assert_eq!("GREEN".parse::<HvacMode>().unwrap(), HvacMode::Green);
        assert_eq!("alarm".parse::<AntiDustMode>().unwrap(), AntiDustMode::Alarm);
        assert_eq!(SensorKind::GenPower.to_string(), "gen_power");
        assert_eq!("roomTemp".parse::<SensorKind>().unwrap(), SensorKind::RoomTemp);
        assert_eq!(HouseSource::SolarPanel.as_ref(), "solar_panel");
    }

    #[test]
    fn stale_readings_are_not_fresh() {
        let now = Utc::now();
        let mut snapshot = SensorSnapshot::default();
        snapshot.set(Reading {
            sensor: SensorKind::RoomTemp,
            value: 21.0,
            timestamp: now - Duration::seconds(600),
        });
        snapshot.set(Reading::new(SensorKind::OutTemp, 30.0));

        assert_eq!(snapshot.fresh(SensorKind::RoomTemp, now, Duration::seconds(300)), None);
        assert_eq!(
            snapshot.fresh(SensorKind::RoomTemp, now, Duration::seconds(900)),
            Some(21.0)
        );
        assert_eq!(snapshot.fresh(SensorKind::GenPower, now, Duration::seconds(900)), None);
    }

    #[test]
    fn relay_rejects_negative_power() {
        let relay = RelayState::new(SupplySource::Grid, HouseSource::Grid, -1.0, 0.0);
        assert!(relay.validate().is_err());
        let relay = RelayState::new(SupplySource::Grid, HouseSource::Grid, 10.0, 0.0);
        assert!(relay.validate().is_ok());
    }
}
