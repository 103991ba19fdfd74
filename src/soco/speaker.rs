use tracing::warn;

use super::dispatcher::{CommandDispatcher, is_offline_error};
use crate::protocol::{CommandResult, Speaker};

const OFFLINE_MESSAGE: &str = "Speaker is offline or unreachable";

struct Probe {
    action: &'static str,
    /// An offline error on this probe ends the whole lookup.
    gates_offline: bool,
    apply: fn(&mut Speaker, &str),
}

// Volume goes first: it is the cheapest connectivity check soco-cli offers.
const PROBES: &[Probe] = &[
    Probe {
        action: "volume",
        gates_offline: true,
        apply: apply_volume,
    },
    Probe {
        action: "mute",
        gates_offline: true,
        apply: apply_mute,
    },
    Probe {
        action: "playback",
        gates_offline: true,
        apply: apply_playback,
    },
    Probe {
        action: "track",
        gates_offline: true,
        apply: apply_track,
    },
    Probe {
        action: "battery",
        gates_offline: false,
        apply: apply_battery,
    },
];

fn apply_volume(speaker: &mut Speaker, text: &str) {
    speaker.volume = text.trim().parse().ok();
}

fn apply_mute(speaker: &mut Speaker, text: &str) {
    speaker.is_muted = text.trim().eq_ignore_ascii_case("on");
}

fn apply_playback(speaker: &mut Speaker, text: &str) {
    speaker.playback_state = Some(text.to_string());
}

fn apply_track(speaker: &mut Speaker, text: &str) {
    speaker.current_track = Some(text.to_string());
}

fn apply_battery(speaker: &mut Speaker, text: &str) {
    if text.is_empty() {
        return;
    }
    if let Ok(level) = text.trim().replace('%', "").parse() {
        speaker.battery_level = Some(level);
    }
}

fn went_offline(result: &CommandResult) -> bool {
    !result.is_success() && is_offline_error(&result.error_message)
}

impl CommandDispatcher {
    /// Collects volume, mute, playback, track and battery for one speaker.
    pub async fn speaker_info(&self, name: &str) -> Speaker {
        let mut speaker = Speaker::named(name);
        for probe in PROBES {
            let result = self.execute_command(name, probe.action, &[]).await;
            if probe.gates_offline && went_offline(&result) {
                warn!(
                    speaker = name,
                    action = probe.action,
                    error = %result.error_message,
                    "speaker appears to be offline"
                );
                speaker.is_offline = true;
                speaker.error_message = Some(OFFLINE_MESSAGE.to_string());
                return speaker;
            }
            if result.is_success() {
                (probe.apply)(&mut speaker, &result.result_text);
            }
        }
        speaker
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use axum::extract::State;
    use axum::http::Uri;
    use axum::{Json, Router};
    use serde_json::{Value, json};

    use super::*;
    use crate::soco::test_support::{FixedServer, serve};

    #[derive(Clone)]
    struct Scripted {
        offline_on: Option<&'static str>,
        calls: Arc<AtomicUsize>,
    }

    async fn reply(State(script): State<Scripted>, uri: Uri) -> Json<Value> {
        script.calls.fetch_add(1, Ordering::SeqCst);
        let action = uri.path().rsplit('/').next().unwrap_or_default().to_string();
        if script.offline_on == Some(action.as_str()) {
            return Json(json!({"exit_code": 1, "error_msg": "Connection to 10.0.0.9 timed out"}));
        }
        let result = match action.as_str() {
            "volume" => "35",
            "mute" => "On",
            "playback" => "PLAYING",
            "track" => "Artist: Nina Simone | Title: Sinnerman",
            "battery" => "81%",
            _ => "",
        };
        Json(json!({"exit_code": 0, "result": result}))
    }

    async fn dispatcher_with(offline_on: Option<&'static str>) -> (CommandDispatcher, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let script = Scripted {
            offline_on,
            calls: calls.clone(),
        };
        let addr = serve(Router::new().fallback(reply).with_state(script)).await;
        let dispatcher =
            CommandDispatcher::new(Arc::new(FixedServer::new(addr)), Duration::from_secs(5))
                .unwrap();
        (dispatcher, calls)
    }

    #[tokio::test]
    async fn collects_every_field_for_an_online_speaker() {
        let (dispatcher, calls) = dispatcher_with(None).await;
        let speaker = dispatcher.speaker_info("Kitchen").await;

        assert_eq!(speaker.name, "Kitchen");
        assert_eq!(speaker.volume, Some(35));
        assert!(speaker.is_muted);
        assert_eq!(speaker.playback_state.as_deref(), Some("PLAYING"));
        assert_eq!(
            speaker.current_track.as_deref(),
            Some("Artist: Nina Simone | Title: Sinnerman")
        );
        assert_eq!(speaker.battery_level, Some(81));
        assert!(!speaker.is_offline);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn first_offline_probe_short_circuits() {
        let (dispatcher, calls) = dispatcher_with(Some("volume")).await;
        let speaker = dispatcher.speaker_info("Kitchen").await;

        assert!(speaker.is_offline);
        assert_eq!(speaker.error_message.as_deref(), Some(OFFLINE_MESSAGE));
        assert_eq!(speaker.volume, None);
        assert_eq!(speaker.playback_state, None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn offline_mid_way_keeps_earlier_fields_and_stops() {
        let (dispatcher, calls) = dispatcher_with(Some("playback")).await;
        let speaker = dispatcher.speaker_info("Kitchen").await;

        assert!(speaker.is_offline);
        assert_eq!(speaker.volume, Some(35));
        assert_eq!(speaker.current_track, None);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn battery_failure_does_not_mark_offline() {
        let (dispatcher, _) = dispatcher_with(Some("battery")).await;
        let speaker = dispatcher.speaker_info("Kitchen").await;

        assert!(!speaker.is_offline);
        assert_eq!(speaker.battery_level, None);
        assert_eq!(speaker.volume, Some(35));
    }

    #[test]
    fn battery_text_tolerates_percent_and_garbage() {
        let mut speaker = Speaker::named("Roam");
        apply_battery(&mut speaker, " 42% ");
        assert_eq!(speaker.battery_level, Some(42));
        apply_battery(&mut speaker, "n/a");
        assert_eq!(speaker.battery_level, Some(42));
    }
}
