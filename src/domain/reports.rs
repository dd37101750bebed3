//! JSON reports pushed by the field nodes on their observable resources.

use serde::Deserialize;

use super::{
    AntiDustMode, HouseSource, HvacMode, HvacState, HvacStatus, Reading, RelayState, SensorKind,
    SupplySource, ValidationError,
};

/// One notification, discriminated by its `"n"` field.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "n")]
pub enum FieldReport {
    #[serde(rename = "weather")]
    Weather {
        irr: f64,
        #[serde(rename = "outTemp")]
        out_temp: f64,
        #[serde(rename = "modTemp")]
        mod_temp: f64,
    },
    #[serde(rename = "battery")]
    Battery { v: f64 },
    /// The energy node quotes this value, so strings are accepted too.
    #[serde(rename = "gen_power", alias = "power")]
    GenPower {
        #[serde(deserialize_with = "number_or_string")]
        v: f64,
    },
    #[serde(rename = "roomTemp")]
    RoomTemp { v: f64 },
    #[serde(rename = "relay")]
    Relay { r_sp: u8, r_h: u8, p_sp: f64, p_h: f64 },
    #[serde(rename = "settings")]
    Settings {
        pw: f64,
        status: u8,
        mode: u8,
        #[serde(rename = "targetTemp")]
        target_temp: f64,
    },
    #[serde(rename = "antiDust")]
    AntiDust { v: u8 },
}

/// Decoded and validated content of a report.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldUpdate {
    Readings(Vec<Reading>),
    Relay(RelayState),
    Settings(HvacState),
    AntiDust(AntiDustMode),
}

impl FieldReport {
    pub fn decode(payload: &serde_json::Value) -> Result<Self, ValidationError> {
        serde_json::from_value(payload.clone()).map_err(|e| ValidationError::Malformed(e.to_string()))
    }

    pub fn into_update(self) -> Result<FieldUpdate, ValidationError> {
        let update = match self {
            FieldReport::Weather {
                irr,
                out_temp,
                mod_temp,
            } => FieldUpdate::Readings(vec![
                finite_reading(SensorKind::Irradiance, irr)?,
                finite_reading(SensorKind::OutTemp, out_temp)?,
                finite_reading(SensorKind::ModTemp, mod_temp)?,
            ]),
            FieldReport::Battery { v } => {
                FieldUpdate::Readings(vec![finite_reading(SensorKind::Battery, v)?])
            }
            FieldReport::GenPower { v } => {
                FieldUpdate::Readings(vec![finite_reading(SensorKind::GenPower, v)?])
            }
            FieldReport::RoomTemp { v } => {
                FieldUpdate::Readings(vec![finite_reading(SensorKind::RoomTemp, v)?])
            }
            FieldReport::Relay { r_sp, r_h, p_sp, p_h } => {
                let relay = RelayState::new(
                    SupplySource::try_from(r_sp)?,
                    HouseSource::try_from(r_h)?,
                    p_sp,
                    p_h,
                );
                relay.validate()?;
                FieldUpdate::Relay(relay)
            }
            FieldReport::Settings {
                pw,
                status,
                mode,
                target_temp,
            } => {
                if !pw.is_finite() || pw < 0.0 || !target_temp.is_finite() {
                    return Err(ValidationError::Malformed(format!(
                        "settings report out of range: pw={pw} targetTemp={target_temp}"
                    )));
                }
                FieldUpdate::Settings(HvacState {
                    power_w: pw,
                    status: HvacStatus::try_from(status)?,
                    mode: HvacMode::try_from(mode)?,
                    target_temp_c: target_temp,
                    timestamp: chrono::Utc::now(),
                })
            }
            FieldReport::AntiDust { v } => FieldUpdate::AntiDust(AntiDustMode::try_from(v)?),
        };
        Ok(update)
    }
}

fn number_or_string<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(v) => Ok(v),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

fn finite_reading(sensor: SensorKind, value: f64) -> Result<Reading, ValidationError> {
    if !value.is_finite() {
        return Err(ValidationError::Malformed(format!(
            "{sensor} reading is not a number"
        )));
    }
    Ok(Reading::new(sensor, value))
}
