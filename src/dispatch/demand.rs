//! Instantaneous thermal power demand of the HVAC.

use super::DispatchError;
use crate::config::DispatchConfig;
use crate::domain::{HvacState, HvacStatus, SensorKind};

/// Power (W) the HVAC needs right now to move the room toward its target.
///
/// Ventilation draws a fixed amount. Cooling a room already at or below the
/// target, or heating one already at or above it, needs nothing. Otherwise
/// the demand is the distance to target over the room time constant minus
/// the heat leaking in from outside, converted to watts.
pub fn estimate_demand(
    hvac: &HvacState,
    room_temp: Option<f64>,
    out_temp: Option<f64>,
    params: &DispatchConfig,
) -> Result<f64, DispatchError> {
    match hvac.status {
        HvacStatus::Off | HvacStatus::Error => return Err(DispatchError::InactiveHvac(hvac.status)),
        HvacStatus::Vent => return Ok(params.vent_power_w),
        HvacStatus::Cool | HvacStatus::Heat => {}
    }

    let room = room_temp.ok_or(DispatchError::UnavailableInput(SensorKind::RoomTemp))?;
    let target = hvac.target_temp_c;
    let satisfied = match hvac.status {
        HvacStatus::Cool => room <= target,
        _ => room >= target,
    };
    if satisfied {
        return Ok(0.0);
    }

    let out = out_temp.ok_or(DispatchError::UnavailableInput(SensorKind::OutTemp))?;
    let mut raw = params.k1 * (target - room) / params.time_constant_s
        - (out - room) * params.leak_coeff;
    raw /= params.power_coeff;
    if hvac.status == HvacStatus::Cool {
        raw = -raw;
    }

    Ok(round_to(raw.max(0.0), params.demand_precision))
}

fn round_to(value: f64, decimals: u32) -> f64 {
    let scale = 10f64.powi(decimals as i32);
    (value * scale).round() / scale
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::HvacMode;
    use rstest::rstest;

    fn hvac(status: HvacStatus, target: f64) -> HvacState {
        HvacState {
            power_w: 0.0,
            status,
            mode: HvacMode::Normal,
            target_temp_c: target,
            timestamp: chrono::Utc::now(),
        }
    }

    #[rstest]
    #[case::cooling_hot_room(HvacStatus::Cool, 22.0, 25.0, 30.0, 260.0)]
    #[case::heating_cold_room(HvacStatus::Heat, 22.0, 18.0, 10.0, 413.33)]
    #[case::cool_room_already_cold(HvacStatus::Cool, 22.0, 21.0, 30.0, 0.0)]
    #[case::cool_room_at_target(HvacStatus::Cool, 22.0, 22.0, 30.0, 0.0)]
    #[case::heat_room_at_target(HvacStatus::Heat, 22.0, 22.0, 5.0, 0.0)]
    #[case::cooling_helped_by_cold_outside(HvacStatus::Cool, 22.0, 23.0, 5.0, 0.0)]
    #[case::vent_is_fixed(HvacStatus::Vent, 22.0, 30.0, 40.0, 50.0)]
    fn demand_cases(
        #[case] status: HvacStatus,
        #[case] target: f64,
        #[case] room: f64,
        #[case] out: f64,
        #[case] expected: f64,
    ) {
        let params = DispatchConfig::default();
        let got = estimate_demand(&hvac(status, target), Some(room), Some(out), &params).unwrap();
        assert!((got - expected).abs() < 1e-9, "expected {expected}, got {got}");
    }

    #[rstest]
    #[case(HvacStatus::Off)]
    #[case(HvacStatus::Error)]
    fn inactive_hvac_is_refused(#[case] status: HvacStatus) {
        let err = estimate_demand(&hvac(status, 22.0), Some(25.0), Some(30.0), &DispatchConfig::default())
            .unwrap_err();
        assert_eq!(err, DispatchError::InactiveHvac(status));
    }

    #[test]
    fn missing_readings_fail_closed() {
        let params = DispatchConfig::default();
        let cooling = hvac(HvacStatus::Cool, 22.0);
        assert_eq!(
            estimate_demand(&cooling, None, Some(30.0), &params).unwrap_err(),
            DispatchError::UnavailableInput(SensorKind::RoomTemp)
        );
        assert_eq!(
            estimate_demand(&cooling, Some(25.0), None, &params).unwrap_err(),
            DispatchError::UnavailableInput(SensorKind::OutTemp)
        );
        // Ventilation needs no temperature at all.
        assert_eq!(
            estimate_demand(&hvac(HvacStatus::Vent, 22.0), None, None, &params).unwrap(),
            50.0
        );
    }
}
