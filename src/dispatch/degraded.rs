//! Routing while the HVAC is off or faulted: no house draw, solar output to
//! the surplus leg.

use super::selector::{leg_power, surplus_leg};
use crate::config::DispatchConfig;
use crate::domain::{HouseSource, RelayState};

pub fn plan(gen_power_w: f64, battery_wh: f64, params: &DispatchConfig) -> RelayState {
    RelayState::new(
        surplus_leg(battery_wh, params),
        HouseSource::Grid,
        leg_power(gen_power_w),
        0.0,
    )
}

/// The relay already routes solar to the planned leg with nothing drawn by
/// the house. A fresh generated power reading always re-evaluates; the
/// emitter still drops it when nothing changed.
pub fn already_routed(latest: Option<&RelayState>, planned: &RelayState, forced: bool) -> bool {
    !forced
        && latest.is_some_and(|relay| {
            relay.supply_source == planned.supply_source && relay.has_no_house_draw()
        })
}
