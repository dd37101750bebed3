//! Typed actuator commands and the operator/field settings payloads.
//!
//! Commands never carry string-formatted payloads; the transport decides how
//! a [`Setpoint::Keep`] is spelled on the wire.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::{
    AntiDustMode, HouseSource, HvacMode, HvacState, HvacStatus, RelayState, SupplySource,
    ValidationError,
};

/// Largest power the relay board accepts on either leg (W).
pub const MAX_RELAY_POWER_W: f64 = 1500.0;
/// Rated HVAC power (W).
pub const MAX_HVAC_POWER_W: f64 = 1000.0;
/// Allowed target temperature band (°C).
pub const TARGET_TEMP_RANGE_C: (f64, f64) = (16.0, 35.0);
/// Numeric "leave unchanged" marker used by operators and field nodes.
pub const UNCHANGED: f64 = -1.0;

/// A command field that either keeps the device's current value or sets a new one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op", content = "value")]
pub enum Setpoint<T> {
    Keep,
    Set(T),
}

impl<T> Default for Setpoint<T> {
    fn default() -> Self {
        Setpoint::Keep
    }
}

impl<T: Copy> Setpoint<T> {
    pub fn resolve(self, current: T) -> T {
        match self {
            Setpoint::Keep => current,
            Setpoint::Set(v) => v,
        }
    }

    pub fn value(self) -> Option<T> {
        match self {
            Setpoint::Keep => None,
            Setpoint::Set(v) => Some(v),
        }
    }
}

impl Setpoint<f64> {
    /// `-1` means unchanged; anything else must sit in `[min, max]`.
    pub fn from_sentinel(
        field: &'static str,
        raw: f64,
        min: f64,
        max: f64,
    ) -> Result<Self, ValidationError> {
        if raw == UNCHANGED {
            return Ok(Setpoint::Keep);
        }
        if !raw.is_finite() || raw < min || raw > max {
            return Err(ValidationError::OutOfRange {
                field,
                value: raw,
                min,
                max,
            });
        }
        Ok(Setpoint::Set(raw))
    }
}

impl<T: std::str::FromStr> Setpoint<T> {
    /// `same` keeps the current value; anything else must name a variant.
    pub fn from_keyword(field: &'static str, raw: &str) -> Result<Self, ValidationError> {
        if raw.eq_ignore_ascii_case("same") {
            return Ok(Setpoint::Keep);
        }
        raw.parse::<T>()
            .map(Setpoint::Set)
            .map_err(|_| ValidationError::UnknownValue {
                field,
                value: raw.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RelayCommand {
    pub supply_source: Setpoint<SupplySource>,
    pub house_source: Setpoint<HouseSource>,
    pub power_supply_w: Setpoint<f64>,
    pub power_house_w: Setpoint<f64>,
}

impl RelayCommand {
    /// Command that drives the relay to `state` exactly.
    pub fn apply(state: &RelayState) -> Self {
        Self {
            supply_source: Setpoint::Set(state.supply_source),
            house_source: Setpoint::Set(state.house_source),
            power_supply_w: Setpoint::Set(state.power_supply_w),
            power_house_w: Setpoint::Set(state.power_house_w),
        }
    }

    /// Parses the operator form where `-1` leaves a field unchanged.
    pub fn from_operator(
        supply_setpoint: i32,
        house_setpoint: i32,
        power_supply: f64,
        power_house: f64,
    ) -> Result<Self, ValidationError> {
        let supply_source = match supply_setpoint {
            -1 => Setpoint::Keep,
            code => Setpoint::Set(SupplySource::try_from(leg_code("supplySetpoint", code)?)?),
        };
        let house_source = match house_setpoint {
            -1 => Setpoint::Keep,
            code => Setpoint::Set(HouseSource::try_from(leg_code("houseSetpoint", code)?)?),
        };
        Ok(Self {
            supply_source,
            house_source,
            power_supply_w: Setpoint::from_sentinel(
                "powerSupply",
                power_supply,
                0.0,
                MAX_RELAY_POWER_W,
            )?,
            power_house_w: Setpoint::from_sentinel(
                "powerHouse",
                power_house,
                0.0,
                MAX_RELAY_POWER_W,
            )?,
        })
    }

    /// State the relay ends up in when it accepts this command.
    pub fn applied_to(&self, current: &RelayState) -> RelayState {
        RelayState {
            supply_source: self.supply_source.resolve(current.supply_source),
            house_source: self.house_source.resolve(current.house_source),
            power_supply_w: self.power_supply_w.resolve(current.power_supply_w),
            power_house_w: self.power_house_w.resolve(current.power_house_w),
            timestamp: Utc::now(),
        }
    }
}

fn leg_code(field: &'static str, code: i32) -> Result<u8, ValidationError> {
    u8::try_from(code).map_err(|_| ValidationError::OutOfRange {
        field,
        value: code as f64,
        min: -1.0,
        max: 2.0,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HvacCommand {
    pub power_w: Setpoint<f64>,
    pub status: Setpoint<HvacStatus>,
    pub mode: Setpoint<HvacMode>,
    pub target_temp_c: Setpoint<f64>,
}

impl HvacCommand {
    /// Power-only command; status, mode and target stay as they are.
    pub fn power(power_w: f64) -> Self {
        Self {
            power_w: Setpoint::Set(power_w),
            ..Default::default()
        }
    }

    /// Full settings push to the node.
    pub fn settings(state: &HvacState) -> Self {
        Self {
            power_w: Setpoint::Set(state.power_w),
            status: Setpoint::Set(state.status),
            mode: Setpoint::Set(state.mode),
            target_temp_c: Setpoint::Set(state.target_temp_c),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AntiDustCommand {
    pub mode: AntiDustMode,
}

/// A complete HVAC settings payload, from an operator or reported by the node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SettingsRequest {
    pub power_w: Setpoint<f64>,
    pub status: Setpoint<HvacStatus>,
    pub mode: Setpoint<HvacMode>,
    pub target_temp_c: Setpoint<f64>,
}

impl SettingsRequest {
    /// Builds a request from the raw operator fields, validating each one.
    pub fn parse(power: f64, status: &str, mode: &str, target_temp: f64) -> Result<Self, ValidationError> {
        Ok(Self {
            power_w: Setpoint::from_sentinel("power", power, 0.0, MAX_HVAC_POWER_W)?,
            status: Setpoint::from_keyword("status", status)?,
            mode: Setpoint::from_keyword("mode", mode)?,
            target_temp_c: Setpoint::from_sentinel(
                "targetTemp",
                target_temp,
                TARGET_TEMP_RANGE_C.0,
                TARGET_TEMP_RANGE_C.1,
            )?,
        })
    }

    /// Settings exactly as a node reported them.
    pub fn reported(state: &HvacState) -> Self {
        Self {
            power_w: Setpoint::Set(state.power_w),
            status: Setpoint::Set(state.status),
            mode: Setpoint::Set(state.mode),
            target_temp_c: Setpoint::Set(state.target_temp_c),
        }
    }

    /// Re-validates the request against the current state and returns the
    /// state the HVAC ends up in.
    ///
    /// Power drops to zero when the HVAC stops or faults, and a switch from
    /// normal to green is refused while the HVAC is not running.
    pub fn resolve(&self, current: &HvacState) -> Result<HvacState, ValidationError> {
        if let Setpoint::Set(power) = self.power_w {
            if !power.is_finite() || !(0.0..=MAX_HVAC_POWER_W).contains(&power) {
                return Err(ValidationError::OutOfRange {
                    field: "power",
                    value: power,
                    min: 0.0,
                    max: MAX_HVAC_POWER_W,
                });
            }
        }
        if let Setpoint::Set(target) = self.target_temp_c {
            let (min, max) = TARGET_TEMP_RANGE_C;
            if !target.is_finite() || !(min..=max).contains(&target) {
                return Err(ValidationError::OutOfRange {
                    field: "targetTemp",
                    value: target,
                    min,
                    max,
                });
            }
        }

        let status = self.status.resolve(current.status);
        let mut mode = self.mode.resolve(current.mode);
        if current.mode == HvacMode::Normal && mode == HvacMode::Green && !status.is_active() {
            mode = HvacMode::Normal;
        }
        let power_w = if status.is_active() {
            self.power_w.resolve(current.power_w)
        } else {
            0.0
        };

        Ok(HvacState {
            power_w,
            status,
            mode,
            target_temp_c: self.target_temp_c.resolve(current.target_temp_c),
            timestamp: Utc::now(),
        })
    }
}
