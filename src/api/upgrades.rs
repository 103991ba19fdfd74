use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};

use super::{ApiError, AppState};
use crate::protocol::{ApplyReply, UpgradeCheckResponse, UpgradeState};
use crate::upgrade::UpgradeError;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/upgrades/status", get(status))
        .route("/api/upgrades/check", post(check))
        .route("/api/upgrades/apply", post(apply))
}

async fn status(State(state): State<AppState>) -> Json<UpgradeState> {
    Json(state.upgrades.state())
}

async fn check(State(state): State<AppState>) -> Result<Json<UpgradeCheckResponse>, ApiError> {
    match state.upgrades.check().await {
        Ok(response) => Ok(Json(response)),
        Err(err @ UpgradeError::NotConfigured) => Err(ApiError::Unavailable(err.to_string())),
        Err(err) => Err(ApiError::Unavailable(format!("Upgrade check failed: {err}"))),
    }
}

async fn apply(State(state): State<AppState>) -> Result<Json<ApplyReply>, ApiError> {
    let upgraded = state
        .upgrades
        .apply()
        .await
        .map_err(|err| ApiError::Internal(format!("Upgrade failed: {err}")))?;
    let reply = if upgraded {
        ApplyReply {
            status: "upgrading".to_string(),
            message: "Upgrade in progress, service will restart".to_string(),
        }
    } else {
        ApplyReply {
            status: "current".to_string(),
            message: "No upgrade available or not eligible".to_string(),
        }
    };
    Ok(Json(reply))
}
