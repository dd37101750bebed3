//! Per-event arbitration: picks the full dispatch path, the degraded path,
//! the anti-dust path, or nothing.
//!
//! Status is never cached. Every evaluation starts from a fresh read of the
//! store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{
    bounded, degraded, estimate_demand, leg_power, select_source, ArbitrationDecision, CommandEmitter,
    DispatchError, EmitAck,
};
use crate::alerts::Alert;
use crate::config::DispatchConfig;
use crate::domain::{
    AntiDustCommand, AntiDustMode, AntiDustState, HouseSource, HvacCommand, HvacMode, HvacState,
    HvacStatus, RelayState, SensorKind, SensorSnapshot, SettingsRequest, Setpoint, SupplySource,
};
use crate::store::{read_snapshot, StateStore, StoreError};
use crate::transport::FieldCommand;

/// Where a settings change came from.
#[derive(Debug, Clone, PartialEq)]
pub enum SettingsSource {
    /// Requested through the operator API. Validated against the current
    /// state and pushed to the HVAC node.
    Operator(SettingsRequest),
    /// Reported by the HVAC node. The node is authoritative.
    Field(HvacState),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    SensorUpdate(SensorKind),
    SettingsChange(SettingsSource),
    RelayChange(RelayState),
    AntiDustChange { mode: AntiDustMode, from_operator: bool },
}

impl DispatchEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchEvent::SensorUpdate(_) => "sensor_update",
            DispatchEvent::SettingsChange(_) => "settings_change",
            DispatchEvent::RelayChange(_) => "relay_change",
            DispatchEvent::AntiDustChange { .. } => "anti_dust_change",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPath {
    Full,
    Degraded,
    AntiDust,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    GreenMode,
    CleaningCycle,
    /// Degraded routing is already in place.
    AlreadyRouted,
    /// The report matches what is stored.
    Unchanged,
    /// Cleaning started while the HVAC draws nothing.
    HvacInactive,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// Recorded without re-arbitrating.
    Recorded,
    Emitted {
        path: DispatchPath,
        relay: RelayState,
        needed_power_w: Option<f64>,
        ack: EmitAck,
    },
    Skipped { reason: SkipReason },
}

impl Outcome {
    fn skipped(reason: SkipReason) -> Self {
        Outcome::Skipped { reason }
    }
}

/// What one evaluation sees.
#[derive(Debug, Clone)]
struct EvaluationContext {
    snapshot: SensorSnapshot,
    hvac: HvacState,
    anti_dust: AntiDustMode,
    relay: Option<RelayState>,
}

pub struct ArbitrationRouter {
    store: Arc<dyn StateStore>,
    emitter: CommandEmitter,
    params: DispatchConfig,
    io_timeout: Duration,
}

impl ArbitrationRouter {
    pub fn new(
        store: Arc<dyn StateStore>,
        emitter: CommandEmitter,
        params: DispatchConfig,
        io_timeout: Duration,
    ) -> Self {
        Self {
            store,
            emitter,
            params,
            io_timeout,
        }
    }

    pub async fn handle(&self, event: DispatchEvent) -> Result<Outcome, DispatchError> {
        match event {
            DispatchEvent::SensorUpdate(sensor) => self.on_sensor(sensor).await,
            DispatchEvent::SettingsChange(source) => self.on_settings(source).await,
            DispatchEvent::RelayChange(relay) => self.on_relay(relay).await,
            DispatchEvent::AntiDustChange {
                mode,
                from_operator,
            } => self.on_anti_dust(mode, from_operator).await,
        }
    }

    async fn on_sensor(&self, sensor: SensorKind) -> Result<Outcome, DispatchError> {
        if !sensor.triggers_arbitration() {
            return Ok(Outcome::Recorded);
        }
        let ctx = self.load_context().await?;
        self.arbitrate(&ctx, sensor == SensorKind::GenPower, Vec::new())
            .await
    }

    async fn on_settings(&self, source: SettingsSource) -> Result<Outcome, DispatchError> {
        let mut ctx = self.load_context().await?;
        let mut alerts = Vec::new();

        let next = match source {
            SettingsSource::Field(reported) => {
                if self.latest_hvac().await?.is_some_and(|h| h.same_settings(&reported)) {
                    return Ok(Outcome::skipped(SkipReason::Unchanged));
                }
                self.store_call(self.store.insert_hvac(&reported)).await?;
                reported
            }
            SettingsSource::Operator(request) => {
                let next = request.resolve(&ctx.hvac)?;
                self.store_call(self.store.insert_hvac(&next)).await?;
                if let Err(e) = self
                    .emitter
                    .send(FieldCommand::Hvac(HvacCommand::settings(&next)))
                    .await
                {
                    if next.status == HvacStatus::Error {
                        self.emitter.publish_alerts(&[Alert::hvac_fault()]).await;
                    }
                    return Err(e.into());
                }
                next
            }
        };

        info!(
            status = %next.status,
            mode = %next.mode,
            power_w = next.power_w,
            target_temp_c = next.target_temp_c,
            "HVAC settings changed"
        );
        if next.status == HvacStatus::Error {
            alerts.push(Alert::hvac_fault());
        }
        ctx.hvac = next;
        self.arbitrate(&ctx, false, alerts).await
    }

    async fn on_relay(&self, reported: RelayState) -> Result<Outcome, DispatchError> {
        let ctx = self.load_context().await?;
        if let Some(intent) = &ctx.relay {
            if !intent.same_routing(&reported) {
                warn!(
                    intended_supply = %intent.supply_source,
                    intended_house = %intent.house_source,
                    reported_supply = %reported.supply_source,
                    reported_house = %reported.house_source,
                    "relay drifted from the last persisted routing"
                );
            }
        }
        self.store_call(self.store.insert_relay(&reported)).await?;

        if ctx.hvac.status.is_active()
            && ctx.hvac.mode == HvacMode::Normal
            && !ctx.anti_dust.is_cleaning()
        {
            let ctx = EvaluationContext {
                relay: Some(reported),
                ..ctx
            };
            return self.arbitrate(&ctx, false, Vec::new()).await;
        }
        Ok(Outcome::Recorded)
    }

    async fn on_anti_dust(
        &self,
        mode: AntiDustMode,
        from_operator: bool,
    ) -> Result<Outcome, DispatchError> {
        let mut ctx = self.load_context().await?;
        let changed = ctx.anti_dust != mode;
        let mut alerts = Vec::new();

        if changed {
            self.store_call(self.store.insert_anti_dust(&AntiDustState::new(mode)))
                .await?;
            alerts.push(Alert::anti_dust(mode));
            info!(from = %ctx.anti_dust, to = %mode, "anti-dust mode changed");
        }
        if from_operator {
            if let Err(e) = self
                .emitter
                .send(FieldCommand::AntiDust(AntiDustCommand { mode }))
                .await
            {
                self.emitter.publish_alerts(&alerts).await;
                return Err(e.into());
            }
        }
        if !changed {
            return Ok(Outcome::skipped(SkipReason::Unchanged));
        }
        ctx.anti_dust = mode;

        if !mode.is_cleaning() {
            return self.arbitrate(&ctx, false, alerts).await;
        }
        if !ctx.hvac.status.is_active() {
            self.emitter.publish_alerts(&alerts).await;
            return Ok(Outcome::skipped(SkipReason::HvacInactive));
        }

        // The HVAC's current draw stands in for the load while the panels
        // are cleaned and produce nothing.
        let battery = match self.fresh(&ctx, SensorKind::Battery) {
            Ok(battery) => battery,
            Err(e) => {
                self.emitter.publish_alerts(&alerts).await;
                return Err(e);
            }
        };
        let load = leg_power(ctx.hvac.power_w);
        let house = if super::battery_can_cover(load, battery, &self.params) {
            HouseSource::Battery
        } else {
            HouseSource::Grid
        };
        let relay = RelayState::new(SupplySource::Hvac, house, 0.0, load);
        let hvac = HvacState {
            mode: HvacMode::Normal,
            timestamp: Utc::now(),
            ..ctx.hvac.clone()
        };
        let command = HvacCommand {
            mode: Setpoint::Set(HvacMode::Normal),
            ..HvacCommand::default()
        };
        let mut decision = ArbitrationDecision::routing(relay).with_hvac(hvac, command);
        decision.needed_power_w = Some(load);
        decision.alerts = alerts;
        decision.force = true;
        self.emit(DispatchPath::AntiDust, decision).await
    }

    /// Status, then cleaning cycle, then mode decide the path.
    async fn arbitrate(
        &self,
        ctx: &EvaluationContext,
        forced: bool,
        alerts: Vec<Alert>,
    ) -> Result<Outcome, DispatchError> {
        if !ctx.hvac.status.is_active() {
            return self.degraded(ctx, forced, alerts).await;
        }

        let skip = if ctx.anti_dust.is_cleaning() {
            Some(SkipReason::CleaningCycle)
        } else if ctx.hvac.mode == HvacMode::Green {
            Some(SkipReason::GreenMode)
        } else {
            None
        };
        if let Some(reason) = skip {
            debug!(?reason, "dispatch suppressed");
            self.emitter.publish_alerts(&alerts).await;
            return Ok(Outcome::skipped(reason));
        }

        let now = Utc::now();
        let max_age = self.max_age();
        let needed = estimate_demand(
            &ctx.hvac,
            ctx.snapshot.fresh(SensorKind::RoomTemp, now, max_age),
            ctx.snapshot.fresh(SensorKind::OutTemp, now, max_age),
            &self.params,
        );
        let needed = match needed {
            Ok(needed) => needed,
            Err(e) => {
                self.emitter.publish_alerts(&alerts).await;
                return Err(e);
            }
        };
        let (gen_power, battery) = match self.power_inputs(ctx) {
            Ok(inputs) => inputs,
            Err(e) => {
                self.emitter.publish_alerts(&alerts).await;
                return Err(e);
            }
        };

        let selection = select_source(needed, gen_power, battery, &self.params);
        debug!(needed_w = needed, gen_power_w = gen_power, battery_wh = battery, ?selection, "source selected");

        let mut decision = ArbitrationDecision::routing(selection.relay_state())
            .with_hvac(ctx.hvac.with_power(needed), HvacCommand::power(needed));
        decision.needed_power_w = Some(needed);
        decision.alerts = alerts;
        self.emit(DispatchPath::Full, decision).await
    }

    async fn degraded(
        &self,
        ctx: &EvaluationContext,
        forced: bool,
        alerts: Vec<Alert>,
    ) -> Result<Outcome, DispatchError> {
        let (gen_power, battery) = match self.power_inputs(ctx) {
            Ok(inputs) => inputs,
            Err(e) => {
                self.emitter.publish_alerts(&alerts).await;
                return Err(e);
            }
        };
        let planned = degraded::plan(gen_power, battery, &self.params);
        if degraded::already_routed(ctx.relay.as_ref(), &planned, forced) {
            self.emitter.publish_alerts(&alerts).await;
            return Ok(Outcome::skipped(SkipReason::AlreadyRouted));
        }

        let mut decision = ArbitrationDecision::routing(planned);
        decision.alerts = alerts;
        self.emit(DispatchPath::Degraded, decision).await
    }

    async fn emit(
        &self,
        path: DispatchPath,
        decision: ArbitrationDecision,
    ) -> Result<Outcome, DispatchError> {
        let ack = self.emitter.emit(&decision).await?;
        Ok(Outcome::Emitted {
            path,
            relay: decision.relay_state,
            needed_power_w: decision.needed_power_w,
            ack,
        })
    }

    async fn load_context(&self) -> Result<EvaluationContext, DispatchError> {
        let snapshot = self.store_call(read_snapshot(self.store.as_ref())).await?;
        let hvac = self.latest_hvac().await?.unwrap_or_default();
        let anti_dust = self
            .store_call(self.store.latest_anti_dust())
            .await?
            .map(|s| s.mode)
            .unwrap_or_default();
        let relay = self.store_call(self.store.latest_relay()).await?;
        Ok(EvaluationContext {
            snapshot,
            hvac,
            anti_dust,
            relay,
        })
    }

    async fn latest_hvac(&self) -> Result<Option<HvacState>, DispatchError> {
        Ok(self.store_call(self.store.latest_hvac()).await?)
    }

    fn power_inputs(&self, ctx: &EvaluationContext) -> Result<(f64, f64), DispatchError> {
        Ok((
            self.fresh(ctx, SensorKind::GenPower)?,
            self.fresh(ctx, SensorKind::Battery)?,
        ))
    }

    fn fresh(&self, ctx: &EvaluationContext, sensor: SensorKind) -> Result<f64, DispatchError> {
        ctx.snapshot
            .fresh(sensor, Utc::now(), self.max_age())
            .ok_or(DispatchError::UnavailableInput(sensor))
    }

    fn max_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.params.max_reading_age_secs.min(i64::MAX as u64) as i64)
    }

    async fn store_call<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        bounded(self.io_timeout, StoreError::Timeout, fut).await
    }
}
