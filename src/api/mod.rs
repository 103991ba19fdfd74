use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::json;
use tracing::error;

use crate::macro_store::{MacroStore, MacroStoreError};
use crate::soco::{CommandDispatcher, ProcessSupervisor};
use crate::upgrade::UpgradeCoordinator;

mod macros;
mod sonos;
mod upgrades;

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<ProcessSupervisor>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub macros: Arc<MacroStore>,
    pub upgrades: Arc<UpgradeCoordinator>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(sonos::routes())
        .merge(macros::routes())
        .merge(upgrades::routes())
        .with_state(state)
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Internal(String),
    #[error("{0}")]
    Unavailable(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<MacroStoreError> for ApiError {
    fn from(err: MacroStoreError) -> Self {
        error!(error = %err, "macro store failure");
        ApiError::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::Router;

    use super::{AppState, router};
    use crate::macro_store::MacroStore;
    use crate::soco::test_support::serve;
    use crate::soco::{CommandDispatcher, ProcessSupervisor, StartupPolicy, SupervisorConfig};
    use crate::upgrade::{UpgradeConfig, UpgradeCoordinator};

    /// A full app whose soco-cli server is `backend` and whose executable does not exist,
    /// so every `ensure_running` fails fast and requests go straight to the backend.
    pub async fn app_with_backend(backend: Router, data_dir: &Path) -> (String, AppState) {
        let upgrades = UpgradeConfig {
            download_dir: data_dir.join("upgrades"),
            ..UpgradeConfig::default()
        };
        app_with_upgrades(backend, data_dir, upgrades).await
    }

    pub async fn app_with_upgrades(
        backend: Router,
        data_dir: &Path,
        upgrades: UpgradeConfig,
    ) -> (String, AppState) {
        let backend_addr = serve(backend).await;
        let supervisor = ProcessSupervisor::new(SupervisorConfig {
            executable_path: Some(data_dir.join("missing-sonos-http-api-server")),
            host: backend_addr.ip().to_string(),
            port: backend_addr.port(),
            macros_file: data_dir.join("macros.txt"),
            startup: StartupPolicy {
                attempts: 1,
                interval: Duration::from_millis(10),
                probe_timeout: Duration::from_millis(200),
            },
            home_dir: None,
            fallback_users: Vec::new(),
            system_locations: Vec::new(),
            search_path: Some(data_dir.as_os_str().to_os_string()),
            ..SupervisorConfig::default()
        })
        .unwrap();
        let supervisor = Arc::new(supervisor);
        let dispatcher =
            CommandDispatcher::new(supervisor.clone(), Duration::from_secs(5)).unwrap();
        let macros = MacroStore::new(
            data_dir.join("macros.txt"),
            data_dir.join("macros-metadata.json"),
        );
        macros.ensure_file_exists().await.unwrap();

        let state = AppState {
            supervisor,
            dispatcher: Arc::new(dispatcher),
            macros: Arc::new(macros),
            upgrades: Arc::new(UpgradeCoordinator::new(upgrades).unwrap()),
        };
        let addr = serve(router(state.clone())).await;
        (format!("http://{addr}"), state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn errors_render_as_detail_json() {
        let response = ApiError::NotFound("Macro 'x' not found".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body, json!({"detail": "Macro 'x' not found"}));
    }
}
