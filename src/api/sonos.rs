use axum::extract::{Path, State};
use axum::routing::{MethodFilter, MethodRouter, get, on, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::{ApiError, AppState};
use crate::listing::{parse_numbered_list, parse_queue_list};
use crate::protocol::{CommandRequest, CommandResult, MessageReply, ServerStatus, Speaker};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/sonos/status", get(status))
        .route("/api/sonos/start", post(start))
        .route("/api/sonos/stop", post(stop))
        .route("/api/sonos/speakers", get(speakers))
        .route("/api/sonos/rediscover", post(rediscover))
        .route("/api/sonos/speakers/{speaker}", get(speaker_info))
        .route("/api/sonos/command", post(command))
        // playback
        .route(
            "/api/sonos/speakers/{speaker}/playpause",
            forward(MethodFilter::POST, "pauseplay"),
        )
        .route("/api/sonos/speakers/{speaker}/next", forward(MethodFilter::POST, "next"))
        .route(
            "/api/sonos/speakers/{speaker}/previous",
            forward(MethodFilter::POST, "previous"),
        )
        .route("/api/sonos/speakers/{speaker}/volume", get(get_volume))
        .route("/api/sonos/speakers/{speaker}/volume/{volume}", post(set_volume))
        .route("/api/sonos/speakers/{speaker}/mute", post(toggle_mute))
        .route("/api/sonos/speakers/{speaker}/track", get(track))
        .route(
            "/api/sonos/speakers/{speaker}/seek/{position}",
            forward_arg(MethodFilter::POST, "seek"),
        )
        // grouping
        .route("/api/sonos/groups", get(groups))
        .route(
            "/api/sonos/speakers/{speaker}/group/{coordinator}",
            forward_arg(MethodFilter::POST, "group"),
        )
        .route(
            "/api/sonos/speakers/{speaker}/ungroup",
            forward(MethodFilter::POST, "ungroup"),
        )
        .route(
            "/api/sonos/speakers/{speaker}/party",
            forward(MethodFilter::POST, "party_mode"),
        )
        .route(
            "/api/sonos/speakers/{speaker}/ungroup-all",
            forward(MethodFilter::POST, "ungroup_all"),
        )
        .route(
            "/api/sonos/speakers/{speaker}/group-volume/{volume}",
            forward_arg(MethodFilter::POST, "group_volume"),
        )
        .route(
            "/api/sonos/speakers/{speaker}/transfer/{target}",
            forward_arg(MethodFilter::POST, "transfer_playback"),
        )
        // settings
        .route("/api/sonos/speakers/{speaker}/shuffle", get(shuffle))
        .route(
            "/api/sonos/speakers/{speaker}/shuffle/{state}",
            forward_arg(MethodFilter::POST, "shuffle"),
        )
        .route("/api/sonos/speakers/{speaker}/repeat", get(repeat))
        .route(
            "/api/sonos/speakers/{speaker}/repeat/{mode}",
            forward_arg(MethodFilter::POST, "repeat"),
        )
        .route("/api/sonos/speakers/{speaker}/crossfade", get(crossfade))
        .route(
            "/api/sonos/speakers/{speaker}/crossfade/{state}",
            forward_arg(MethodFilter::POST, "cross_fade"),
        )
        .route(
            "/api/sonos/speakers/{speaker}/sleep",
            get(sleep_remaining).delete(cancel_sleep),
        )
        .route(
            "/api/sonos/speakers/{speaker}/sleep/{duration}",
            forward_arg(MethodFilter::POST, "sleep_timer"),
        )
        // library
        .route("/api/sonos/favorites", get(favorites))
        .route(
            "/api/sonos/speakers/{speaker}/play-favorite/{favorite}",
            forward_arg(MethodFilter::POST, "play_favourite"),
        )
        .route(
            "/api/sonos/speakers/{speaker}/play-favorite-number/{number}",
            forward_arg(MethodFilter::POST, "play_favourite_number"),
        )
        .route("/api/sonos/playlists", get(playlists))
        .route("/api/sonos/playlists/{playlist}/tracks", get(playlist_tracks))
        .route("/api/sonos/radio-stations", get(radio_stations))
        .route(
            "/api/sonos/speakers/{speaker}/play-radio/{station}",
            forward_arg(MethodFilter::POST, "play_favourite_radio_station"),
        )
        // queue
        .route(
            "/api/sonos/speakers/{speaker}/queue",
            get(queue).merge(forward(MethodFilter::DELETE, "clear_queue")),
        )
        .route("/api/sonos/speakers/{speaker}/queue/length", get(queue_length))
        .route("/api/sonos/speakers/{speaker}/queue/position", get(queue_position))
        .route(
            "/api/sonos/speakers/{speaker}/queue/play",
            forward(MethodFilter::POST, "play_queue"),
        )
        .route(
            "/api/sonos/speakers/{speaker}/queue/play/{track}",
            forward_arg(MethodFilter::POST, "play_from_queue"),
        )
        .route(
            "/api/sonos/speakers/{speaker}/queue/{track}",
            forward_arg(MethodFilter::DELETE, "remove_from_queue"),
        )
        .route(
            "/api/sonos/speakers/{speaker}/queue/add-favorite/{favorite}",
            forward_arg(MethodFilter::POST, "add_favourite_to_queue"),
        )
        .route(
            "/api/sonos/speakers/{speaker}/queue/add-playlist/{playlist}",
            forward_arg(MethodFilter::POST, "add_playlist_to_queue"),
        )
        .route("/api/sonos/speakers/{speaker}/queue/add-sharelink", post(add_sharelink))
        .route(
            "/api/sonos/speakers/{speaker}/queue/save/{playlist}",
            forward_arg(MethodFilter::POST, "save_queue"),
        )
}

/// Runs `action` on the speaker named in the path.
fn forward(method: MethodFilter, action: &'static str) -> MethodRouter<AppState> {
    on(
        method,
        move |State(state): State<AppState>, Path(speaker): Path<String>| async move {
            Json(state.dispatcher.execute_command(&speaker, action, &[]).await)
        },
    )
}

/// Runs `action` with the second path segment as its only argument.
fn forward_arg(method: MethodFilter, action: &'static str) -> MethodRouter<AppState> {
    on(
        method,
        move |State(state): State<AppState>, Path((speaker, arg)): Path<(String, String)>| async move {
            Json(state.dispatcher.execute_command(&speaker, action, &[arg]).await)
        },
    )
}

async fn status(State(state): State<AppState>) -> Json<ServerStatus> {
    Json(state.supervisor.status())
}

async fn start(State(state): State<AppState>) -> Result<Json<MessageReply>, ApiError> {
    info!("starting command server on request");
    if state.supervisor.start().await {
        Ok(Json(MessageReply::new("Server started successfully")))
    } else {
        Err(ApiError::Internal("Failed to start server".to_string()))
    }
}

async fn stop(State(state): State<AppState>) -> Result<Json<MessageReply>, ApiError> {
    info!("stopping command server on request");
    if state.supervisor.stop().await {
        Ok(Json(MessageReply::new("Server stopped successfully")))
    } else {
        Err(ApiError::Internal("Failed to stop server".to_string()))
    }
}

async fn speakers(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.dispatcher.get_speakers().await)
}

async fn rediscover(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.dispatcher.rediscover_speakers().await)
}

async fn speaker_info(State(state): State<AppState>, Path(speaker): Path<String>) -> Json<Speaker> {
    Json(state.dispatcher.speaker_info(&speaker).await)
}

async fn command(
    State(state): State<AppState>,
    Json(request): Json<CommandRequest>,
) -> Json<CommandResult> {
    Json(
        state
            .dispatcher
            .execute_command(&request.speaker, &request.action, &request.args)
            .await,
    )
}

async fn get_volume(
    State(state): State<AppState>,
    Path(speaker): Path<String>,
) -> Result<Json<i32>, ApiError> {
    let result = state.dispatcher.execute_command(&speaker, "volume", &[]).await;
    if result.is_success() {
        if let Ok(volume) = result.result_text.trim().parse() {
            return Ok(Json(volume));
        }
    }
    Err(ApiError::Internal("Failed to get volume".to_string()))
}

async fn set_volume(
    State(state): State<AppState>,
    Path((speaker, volume)): Path<(String, i64)>,
) -> Result<Json<CommandResult>, ApiError> {
    if !(0..=100).contains(&volume) {
        return Err(ApiError::BadRequest(
            "Volume must be between 0 and 100".to_string(),
        ));
    }
    Ok(Json(
        state
            .dispatcher
            .execute_command(&speaker, "volume", &[volume.to_string()])
            .await,
    ))
}

async fn toggle_mute(
    State(state): State<AppState>,
    Path(speaker): Path<String>,
) -> Json<CommandResult> {
    let current = state.dispatcher.execute_command(&speaker, "mute", &[]).await;
    let next = if current.result_text.trim().eq_ignore_ascii_case("on") {
        "off"
    } else {
        "on"
    };
    Json(
        state
            .dispatcher
            .execute_command(&speaker, "mute", &[next.to_string()])
            .await,
    )
}

async fn track(State(state): State<AppState>, Path(speaker): Path<String>) -> Json<Value> {
    let result = state.dispatcher.execute_command(&speaker, "track", &[]).await;
    Json(json!({ "track": result.result_text }))
}

/// Runs a household-wide listing through whichever speaker was discovered first.
async fn on_first_speaker(
    state: &AppState,
    action: &str,
    args: &[String],
) -> Option<CommandResult> {
    let speakers = state.dispatcher.get_speakers().await;
    let first = speakers.first()?;
    Some(state.dispatcher.execute_command(first, action, args).await)
}

async fn groups(State(state): State<AppState>) -> Json<Value> {
    match on_first_speaker(&state, "groups", &[]).await {
        Some(result) => Json(json!({ "groups": result.result_text, "exitCode": result.exit_code })),
        None => Json(json!({ "groups": [] })),
    }
}

fn is_on(text: &str) -> bool {
    text.trim().eq_ignore_ascii_case("on")
}

async fn shuffle(State(state): State<AppState>, Path(speaker): Path<String>) -> Json<Value> {
    let result = state.dispatcher.execute_command(&speaker, "shuffle", &[]).await;
    Json(json!({ "shuffle": is_on(&result.result_text), "raw": result.result_text }))
}

async fn repeat(State(state): State<AppState>, Path(speaker): Path<String>) -> Json<Value> {
    let result = state.dispatcher.execute_command(&speaker, "repeat", &[]).await;
    Json(json!({ "repeat": result.result_text, "exitCode": result.exit_code }))
}

async fn crossfade(State(state): State<AppState>, Path(speaker): Path<String>) -> Json<Value> {
    let result = state.dispatcher.execute_command(&speaker, "cross_fade", &[]).await;
    Json(json!({ "crossfade": is_on(&result.result_text), "raw": result.result_text }))
}

async fn sleep_remaining(State(state): State<AppState>, Path(speaker): Path<String>) -> Json<Value> {
    let result = state.dispatcher.execute_command(&speaker, "sleep_timer", &[]).await;
    Json(json!({ "remaining": result.result_text, "exitCode": result.exit_code }))
}

async fn cancel_sleep(
    State(state): State<AppState>,
    Path(speaker): Path<String>,
) -> Json<CommandResult> {
    Json(
        state
            .dispatcher
            .execute_command(&speaker, "sleep_timer", &["off".to_string()])
            .await,
    )
}

async fn favorites(State(state): State<AppState>) -> Json<Value> {
    match on_first_speaker(&state, "list_favs", &[]).await {
        Some(result) => Json(json!({
            "favorites": parse_numbered_list(&result.result_text),
            "raw": result.result_text,
            "exitCode": result.exit_code,
        })),
        None => Json(json!({ "favorites": [] })),
    }
}

async fn playlists(State(state): State<AppState>) -> Json<Value> {
    match on_first_speaker(&state, "list_playlists", &[]).await {
        Some(result) => Json(json!({
            "playlists": parse_numbered_list(&result.result_text),
            "raw": result.result_text,
            "exitCode": result.exit_code,
        })),
        None => Json(json!({ "playlists": [] })),
    }
}

async fn playlist_tracks(
    State(state): State<AppState>,
    Path(playlist): Path<String>,
) -> Json<Value> {
    match on_first_speaker(&state, "list_playlist_tracks", &[playlist]).await {
        Some(result) => Json(json!({
            "tracks": parse_queue_list(&result.result_text),
            "raw": result.result_text,
            "exitCode": result.exit_code,
        })),
        None => Json(json!({ "tracks": [] })),
    }
}

async fn radio_stations(State(state): State<AppState>) -> Json<Value> {
    match on_first_speaker(&state, "favourite_radio_stations", &[]).await {
        Some(result) => Json(json!({
            "stations": parse_numbered_list(&result.result_text),
            "raw": result.result_text,
            "exitCode": result.exit_code,
        })),
        None => Json(json!({ "stations": [] })),
    }
}

async fn queue(State(state): State<AppState>, Path(speaker): Path<String>) -> Json<Value> {
    let mut result = state.dispatcher.execute_command(&speaker, "list_queue", &[]).await;
    // soco-cli sometimes answers list_queue with an empty success.
    if result.is_success() && result.result_text.trim().is_empty() {
        warn!(speaker = %speaker, "list_queue returned an empty result, retrying");
        result = state.dispatcher.execute_command(&speaker, "list_queue", &[]).await;
    }
    Json(json!({
        "tracks": parse_queue_list(&result.result_text),
        "raw": result.result_text,
        "exitCode": result.exit_code,
    }))
}

async fn queue_length(State(state): State<AppState>, Path(speaker): Path<String>) -> Json<Value> {
    let result = state.dispatcher.execute_command(&speaker, "queue_length", &[]).await;
    let length: u32 = result.result_text.trim().parse().unwrap_or(0);
    Json(json!({ "length": length, "exitCode": result.exit_code }))
}

async fn queue_position(State(state): State<AppState>, Path(speaker): Path<String>) -> Json<Value> {
    let result = state.dispatcher.execute_command(&speaker, "queue_position", &[]).await;
    let position: u32 = result.result_text.trim().parse().unwrap_or(0);
    Json(json!({ "position": position, "exitCode": result.exit_code }))
}

#[derive(Debug, Deserialize)]
struct ShareLinkRequest {
    url: String,
}

async fn add_sharelink(
    State(state): State<AppState>,
    Path(speaker): Path<String>,
    Json(request): Json<ShareLinkRequest>,
) -> Json<CommandResult> {
    Json(
        state
            .dispatcher
            .execute_command(&speaker, "add_sharelink_to_queue", &[request.url])
            .await,
    )
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::http::Uri;
    use axum::routing::any;
    use serde_json::{Value, json};

    use super::*;
    use crate::api::test_support::app_with_backend;

    /// Records every command path and answers from a fixed script.
    #[derive(Clone, Default)]
    struct Backend {
        seen: Arc<Mutex<Vec<String>>>,
        queue_replies: Arc<Mutex<Vec<&'static str>>>,
    }

    async fn backend_reply(State(backend): State<Backend>, uri: Uri) -> Json<Value> {
        let path = uri.path().to_string();
        backend.seen.lock().unwrap().push(path.clone());
        if path == "/speakers" {
            return Json(json!({"speakers": ["Kitchen", "Den"]}));
        }
        let result = if path.ends_with("/mute") {
            "on".to_string()
        } else if path.ends_with("/volume") {
            "42".to_string()
        } else if path.ends_with("/list_queue") {
            let mut replies = backend.queue_replies.lock().unwrap();
            if replies.is_empty() {
                String::new()
            } else {
                replies.remove(0).to_string()
            }
        } else if path.ends_with("/list_favs") {
            "1: Radio 4\n2: Jazz FM".to_string()
        } else {
            String::new()
        };
        Json(json!({"exit_code": 0, "result": result}))
    }

    async fn app(backend: Backend) -> (String, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let router = axum::Router::new()
            .route("/{*path}", any(backend_reply))
            .with_state(backend);
        let (base, _) = app_with_backend(router, dir.path()).await;
        (base, dir)
    }

    #[tokio::test]
    async fn volume_outside_range_is_rejected() {
        let backend = Backend::default();
        let (base, _dir) = app(backend.clone()).await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{base}/api/sonos/speakers/Kitchen/volume/101"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["detail"], "Volume must be between 0 and 100");
        assert!(backend.seen.lock().unwrap().is_empty());

        let ok: Value = client
            .post(format!("{base}/api/sonos/speakers/Kitchen/volume/30"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(ok["exitCode"], 0);
        assert_eq!(backend.seen.lock().unwrap().as_slice(), ["/Kitchen/volume/30"]);
    }

    #[tokio::test]
    async fn mute_toggles_from_current_state() {
        let backend = Backend::default();
        let (base, _dir) = app(backend.clone()).await;

        let response = reqwest::Client::new()
            .post(format!("{base}/api/sonos/speakers/Living%20Room/mute"))
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());
        assert_eq!(
            backend.seen.lock().unwrap().as_slice(),
            ["/Living%20Room/mute", "/Living%20Room/mute/off"]
        );
    }

    #[tokio::test]
    async fn empty_queue_is_retried_once() {
        let backend = Backend::default();
        backend
            .queue_replies
            .lock()
            .unwrap()
            .extend(["", "1: Artist: A | Album: B | Title: C"]);
        let (base, _dir) = app(backend.clone()).await;

        let body: Value = reqwest::get(format!("{base}/api/sonos/speakers/Den/queue"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["tracks"][0]["title"], "C");
        assert_eq!(body["tracks"][0]["isCurrent"], false);
        assert_eq!(backend.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn favorites_are_listed_through_the_first_speaker() {
        let backend = Backend::default();
        let (base, _dir) = app(backend.clone()).await;

        let body: Value = reqwest::get(format!("{base}/api/sonos/favorites"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["favorites"][1]["name"], "Jazz FM");
        assert_eq!(
            backend.seen.lock().unwrap().as_slice(),
            ["/speakers", "/Kitchen/list_favs"]
        );
    }

    #[tokio::test]
    async fn status_reports_stopped_server() {
        let (base, _dir) = app(Backend::default()).await;

        let body: Value = reqwest::get(format!("{base}/api/sonos/status"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["isRunning"], false);
        assert!(body["processId"].is_null());
        assert!(body["serverUrl"].is_null());
    }

    #[tokio::test]
    async fn start_failure_is_a_server_error() {
        let (base, _dir) = app(Backend::default()).await;

        let response = reqwest::Client::new()
            .post(format!("{base}/api/sonos/start"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 500);
    }
}
