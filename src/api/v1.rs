use axum::{
    extract::State,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use validator::Validate;

use super::{error::ApiError, health, response::ApiResponse};
use crate::{
    controller::AppState,
    dispatch::{bounded, DispatchError, DispatchEvent, Outcome, SettingsSource},
    domain::{
        AntiDustMode, AntiDustState, HvacState, RelayCommand, RelayState, SensorSnapshot,
        SettingsRequest, ValidationError,
    },
    store::{read_snapshot, StoreError},
    transport::{FieldCommand, TransportError},
};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/settings", post(update_settings))
        .route("/relay", post(update_relay))
        .route("/antiDust", post(update_anti_dust))
        .route("/all", get(get_all))
        .route("/healthz", get(health::health_check))
        .with_state(state)
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SettingsBody {
    #[validate(range(min = -1.0))]
    pub power: f64,
    #[validate(length(min = 1, max = 8))]
    pub status: String,
    #[validate(length(min = 1, max = 8))]
    pub mode: String,
    #[validate(range(min = -1.0))]
    pub target_temp: f64,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RelayBody {
    #[validate(range(min = -1, max = 2))]
    pub supply_setpoint: i32,
    #[validate(range(min = -1, max = 2))]
    pub house_setpoint: i32,
    #[validate(range(min = -1.0))]
    pub power_supply: f64,
    #[validate(range(min = -1.0))]
    pub power_house: f64,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AntiDustBody {
    #[validate(length(min = 1, max = 8))]
    pub value: String,
}

/// Result of a change that went through the dispatch engine. `outcome` is
/// absent when the change was applied but the re-arbitration it triggered
/// was deferred.
#[derive(Debug, Serialize)]
pub struct DispatchReply {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
}

/// POST /settings - operator HVAC settings, `-1` and `same` keep a field
pub async fn update_settings(
    State(st): State<AppState>,
    Json(body): Json<SettingsBody>,
) -> Result<ApiResponse<DispatchReply>, ApiError> {
    body.validate()?;
    let request = SettingsRequest::parse(body.power, &body.status, &body.mode, body.target_temp)?;
    info!(?request, "operator settings change");
    let result = st
        .engine
        .dispatch(DispatchEvent::SettingsChange(SettingsSource::Operator(request)))
        .await;
    dispatch_reply(result)
}

/// POST /antiDust - start or stop a cleaning cycle
pub async fn update_anti_dust(
    State(st): State<AppState>,
    Json(body): Json<AntiDustBody>,
) -> Result<ApiResponse<DispatchReply>, ApiError> {
    body.validate()?;
    let mode: AntiDustMode = body
        .value
        .parse()
        .map_err(|_| ValidationError::UnknownValue {
            field: "antiDust",
            value: body.value.clone(),
        })?;
    info!(%mode, "operator anti-dust change");
    let result = st
        .engine
        .dispatch(DispatchEvent::AntiDustChange {
            mode,
            from_operator: true,
        })
        .await;
    dispatch_reply(result)
}

/// Errors raised after the operator change was recorded and forwarded only
/// defer the follow-up dispatch.
fn dispatch_reply(
    result: Result<Outcome, DispatchError>,
) -> Result<ApiResponse<DispatchReply>, ApiError> {
    match result {
        Ok(outcome) => Ok(ApiResponse::success(DispatchReply {
            accepted: true,
            outcome: Some(outcome),
        })),
        Err(e @ (DispatchError::UnavailableInput(_)
        | DispatchError::InactiveHvac(_)
        | DispatchError::Command(_))) => Ok(ApiResponse::deferred(
            DispatchReply {
                accepted: true,
                outcome: None,
            },
            e.to_string(),
        )),
        Err(e) => Err(e.into()),
    }
}

/// POST /relay - manual relay override, forwarded to the energy node as is.
/// The relay echo that follows is persisted by ingest.
pub async fn update_relay(
    State(st): State<AppState>,
    Json(body): Json<RelayBody>,
) -> Result<ApiResponse<RelayCommand>, ApiError> {
    body.validate()?;
    let command = RelayCommand::from_operator(
        body.supply_setpoint,
        body.house_setpoint,
        body.power_supply,
        body.power_house,
    )?;
    let field_command = FieldCommand::Relay(command);
    let topic = field_command.topic();
    bounded(
        st.cfg.engine.io_timeout(),
        TransportError::Timeout { topic },
        st.transport.send(field_command),
    )
    .await?;
    info!(?command, "operator relay override forwarded");
    Ok(ApiResponse::success(command))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregates {
    pub window_secs: i64,
    /// HVAC energy drawn over the window (Wh).
    pub hvac_energy_wh: f64,
    /// Exported minus imported grid energy over the window (Wh).
    pub net_grid_wh: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemView {
    pub readings: SensorSnapshot,
    pub relay: Option<RelayState>,
    pub hvac: Option<HvacState>,
    pub anti_dust: Option<AntiDustState>,
    pub aggregates: Aggregates,
}

/// GET /all - latest state of everything plus one-hour aggregates
pub async fn get_all(State(st): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let timeout = st.cfg.engine.io_timeout();
    let store = st.store.as_ref();
    let window = chrono::Duration::hours(1);

    let readings = bounded(timeout, StoreError::Timeout, read_snapshot(store)).await?;
    let relay = bounded(timeout, StoreError::Timeout, store.latest_relay()).await?;
    let hvac = bounded(timeout, StoreError::Timeout, store.latest_hvac()).await?;
    let anti_dust = bounded(timeout, StoreError::Timeout, store.latest_anti_dust()).await?;
    let hvac_energy_wh = bounded(
        timeout,
        StoreError::Timeout,
        store.aggregate_power_over_window(window),
    )
    .await?;
    let net_grid_wh = bounded(
        timeout,
        StoreError::Timeout,
        store.aggregate_net_grid_balance(window),
    )
    .await?;

    Ok(ApiResponse::success(SystemView {
        readings,
        relay,
        hvac,
        anti_dust,
        aggregates: Aggregates {
            window_secs: window.num_seconds(),
            hvac_energy_wh,
            net_grid_wh,
        },
    }))
}
