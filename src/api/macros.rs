use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info};

use super::{ApiError, AppState};
use crate::macro_store::{ImportOutcome, Macro, MacroFileInfo};
use crate::protocol::{MacroExecuteRequest, MessageReply};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/macro", get(list).post(save))
        .route("/api/macro/info", get(info))
        .route("/api/macro/export", get(export))
        .route("/api/macro/reload", post(reload))
        .route("/api/macro/import", post(import))
        .route("/api/macro/execute", post(execute))
        .route("/api/macro/execute/{name}", get(execute_by_name))
        .route("/api/macro/{name}", get(fetch).delete(remove))
        .route("/api/macro/{name}/duplicate", post(duplicate))
}

async fn list(State(state): State<AppState>) -> Result<Json<Vec<Macro>>, ApiError> {
    Ok(Json(state.macros.list().await?))
}

async fn info(State(state): State<AppState>) -> Json<MacroFileInfo> {
    Json(state.macros.file_info().await)
}

async fn export(State(state): State<AppState>) -> Result<Response, ApiError> {
    let content = state.macros.export().await.map_err(|err| {
        error!(error = %err, "failed to export macros");
        ApiError::Internal("Failed to export macros".to_string())
    })?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CONTENT_DISPOSITION, "attachment; filename=macros.txt"),
        ],
        Body::from(content),
    )
        .into_response())
}

async fn fetch(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Macro>, ApiError> {
    state
        .macros
        .get(&name)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Macro '{name}' not found")))
}

async fn save(
    State(state): State<AppState>,
    Json(entry): Json<Macro>,
) -> Result<Json<Macro>, ApiError> {
    if entry.name.trim().is_empty() {
        return Err(ApiError::BadRequest("Macro name is required".to_string()));
    }
    if entry.definition.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "Macro definition is required".to_string(),
        ));
    }
    let saved = state.macros.save(entry).await?;
    state.dispatcher.reload_macros().await;
    Ok(Json(saved))
}

async fn remove(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<MessageReply>, ApiError> {
    if !state.macros.delete(&name).await? {
        return Err(ApiError::NotFound(format!("Macro '{name}' not found")));
    }
    state.dispatcher.reload_macros().await;
    Ok(Json(MessageReply::new(format!(
        "Macro '{name}' deleted successfully"
    ))))
}

async fn duplicate(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Macro>, ApiError> {
    let Some(copy) = state.macros.duplicate(&name).await? else {
        return Err(ApiError::NotFound(format!("Macro '{name}' not found")));
    };
    state.dispatcher.reload_macros().await;
    Ok(Json(copy))
}

async fn run_macro(
    state: &AppState,
    name: &str,
    arguments: &[String],
) -> Result<Json<Value>, ApiError> {
    if name.trim().is_empty() {
        return Err(ApiError::BadRequest("Macro name is required".to_string()));
    }
    state
        .dispatcher
        .execute_macro(name, arguments)
        .await
        .map(Json)
        .map_err(|err| ApiError::Internal(format!("Failed to execute macro: {err}")))
}

async fn execute_by_name(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    run_macro(&state, &name, &[]).await
}

async fn execute(
    State(state): State<AppState>,
    Json(request): Json<MacroExecuteRequest>,
) -> Result<Json<Value>, ApiError> {
    run_macro(&state, &request.macro_name, &request.arguments).await
}

async fn reload(State(state): State<AppState>) -> Result<Json<MessageReply>, ApiError> {
    if state.dispatcher.reload_macros().await {
        Ok(Json(MessageReply::new("Macros reloaded successfully")))
    } else {
        Err(ApiError::Internal("Failed to reload macros".to_string()))
    }
}

#[derive(Debug, Default, Deserialize)]
struct ImportParams {
    #[serde(default)]
    merge: bool,
}

async fn import(
    State(state): State<AppState>,
    Query(params): Query<ImportParams>,
    body: String,
) -> Result<Json<ImportOutcome>, ApiError> {
    info!(length = body.len(), merge = params.merge, "macro import requested");
    if body.is_empty() {
        return Err(ApiError::BadRequest(
            "No file uploaded or file is empty".to_string(),
        ));
    }
    let outcome = state.macros.import(&body, params.merge).await?;
    if outcome.success && outcome.imported_count > 0 {
        state.dispatcher.reload_macros().await;
    }
    Ok(Json(outcome))
}
