//! Chooses where the HVAC draws from and where the solar output goes.

use serde::Serialize;

use crate::config::DispatchConfig;
use crate::domain::{HouseSource, RelayState, SupplySource, MAX_RELAY_POWER_W};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SourceSelection {
    pub supply_source: SupplySource,
    pub house_source: HouseSource,
    pub power_supply_w: f64,
    pub power_house_w: f64,
}

impl SourceSelection {
    pub fn relay_state(&self) -> RelayState {
        RelayState::new(
            self.supply_source,
            self.house_source,
            self.power_supply_w,
            self.power_house_w,
        )
    }
}

/// Power setpoint for one relay leg, within what the board accepts.
pub fn leg_power(power_w: f64) -> f64 {
    power_w.clamp(0.0, MAX_RELAY_POWER_W)
}

/// Surplus charges the battery until it passes the charge threshold, then
/// goes to the grid.
pub fn surplus_leg(battery_wh: f64, params: &DispatchConfig) -> SupplySource {
    if battery_wh < params.charge_threshold * params.battery_capacity_wh {
        SupplySource::Battery
    } else {
        SupplySource::Grid
    }
}

/// Whether the battery can carry `load_w` for a whole control interval
/// without dipping into the reserve, accounting for DC/AC losses.
pub fn battery_can_cover(load_w: f64, battery_wh: f64, params: &DispatchConfig) -> bool {
    let dc_needed = load_w * params.dc_ac_loss_factor;
    dc_needed * params.battery_interval_hours <= battery_wh - params.reserve_margin_wh
}

/// First match wins: solar alone, then battery, then grid. Negative sensor
/// noise on the generated power is treated as zero, and leg powers are
/// capped at the relay rating.
pub fn select_source(
    needed_w: f64,
    gen_power_w: f64,
    battery_wh: f64,
    params: &DispatchConfig,
) -> SourceSelection {
    let needed = needed_w.max(0.0);
    let gen_power = gen_power_w.max(0.0);

    if needed <= gen_power {
        return SourceSelection {
            supply_source: SupplySource::Hvac,
            house_source: HouseSource::SolarPanel,
            power_supply_w: leg_power(needed),
            power_house_w: leg_power(needed),
        };
    }

    let house_source = if needed == 0.0 || battery_can_cover(needed, battery_wh, params) {
        HouseSource::Battery
    } else {
        HouseSource::Grid
    };
    SourceSelection {
        supply_source: surplus_leg(battery_wh, params),
        house_source,
        power_supply_w: leg_power(gen_power),
        power_house_w: leg_power(needed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn params() -> DispatchConfig {
        DispatchConfig::default()
    }

    #[test]
    fn solar_covers_the_worked_example() {
        // 260 W needed, 400 W generated.
        let sel = select_source(260.0, 400.0, 3_000.0, &params());
        assert_eq!(sel.supply_source, SupplySource::Hvac);
        assert_eq!(sel.house_source, HouseSource::SolarPanel);
        assert_eq!(sel.power_supply_w, 260.0);
        assert_eq!(sel.power_house_w, 260.0);
    }

    #[test]
    fn battery_covers_when_solar_is_short() {
        // 200 W * 10 * 10 h = 20 kWh > 9.5 kWh usable: grid.
        let sel = select_source(200.0, 50.0, 10_000.0, &params());
        assert_eq!(sel.house_source, HouseSource::Grid);
        assert_eq!(sel.supply_source, SupplySource::Grid);

        // 40 W * 10 * 10 h = 4 kWh <= 5.5 kWh usable: battery.
        let sel = select_source(40.0, 10.0, 6_000.0, &params());
        assert_eq!(sel.house_source, HouseSource::Battery);
        assert_eq!(sel.supply_source, SupplySource::Battery);
        assert_eq!(sel.power_supply_w, 10.0);
        assert_eq!(sel.power_house_w, 40.0);
    }

    #[test]
    fn zero_demand_at_night_stays_on_solar_leg() {
        let sel = select_source(0.0, 0.0, 100.0, &params());
        assert_eq!(sel.supply_source, SupplySource::Hvac);
        assert_eq!(sel.house_source, HouseSource::SolarPanel);
    }

    #[test]
    fn strong_generation_is_capped_at_the_relay_rating() {
        let sel = select_source(800.0, 2_400.0, 2_000.0, &params());
        assert_eq!(sel.house_source, HouseSource::SolarPanel);
        assert_eq!(sel.power_supply_w, 800.0);

        let sel = select_source(1_200.0, 1_100.0, 9_800.0, &params());
        assert_eq!(sel.power_supply_w, 1_100.0);
        assert_eq!(leg_power(2_600.0), MAX_RELAY_POWER_W);
        assert_eq!(leg_power(-3.0), 0.0);
    }

    #[test]
    fn reserve_margin_is_never_spent() {
        let p = params();
        // Exactly at the reserve boundary the battery may still cover.
        let load = (5_000.0 - p.reserve_margin_wh) / (p.dc_ac_loss_factor * p.battery_interval_hours);
        assert!(battery_can_cover(load, 5_000.0, &p));
        assert!(!battery_can_cover(load + 0.01, 5_000.0, &p));
    }

    proptest! {
        #[test]
        fn solar_first_when_it_suffices(needed in 0.0f64..1_000.0, extra in 0.0f64..2_000.0, battery in 0.0f64..10_000.0) {
            let sel = select_source(needed, needed + extra, battery, &params());
            prop_assert_eq!(sel.supply_source, SupplySource::Hvac);
            prop_assert_eq!(sel.house_source, HouseSource::SolarPanel);
            prop_assert_eq!(sel.power_house_w, needed);
        }

        #[test]
        fn full_battery_exports_surplus(needed in 1.0f64..1_000.0, battery in 9_000.0f64..10_000.0) {
            let sel = select_source(needed, needed / 2.0, battery, &params());
            prop_assert_eq!(sel.supply_source, SupplySource::Grid);
        }

        #[test]
        fn battery_only_when_it_can_cover(needed in 1.0f64..1_000.0, battery in 0.0f64..10_000.0) {
            let p = params();
            let sel = select_source(needed, 0.0, battery, &p);
            let covers = battery_can_cover(needed, battery, &p);
            prop_assert_eq!(sel.house_source == HouseSource::Battery, covers);
            prop_assert!(sel.power_supply_w >= 0.0 && sel.power_house_w >= 0.0);
        }

        #[test]
        fn leg_powers_stay_within_the_relay_rating(needed in 0.0f64..1_000.0, gen in 0.0f64..3_000.0, battery in 0.0f64..10_000.0) {
            let sel = select_source(needed, gen, battery, &params());
            prop_assert!(sel.power_supply_w <= MAX_RELAY_POWER_W);
            prop_assert!(sel.power_house_w <= MAX_RELAY_POWER_W);
        }
    }
}
