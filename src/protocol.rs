use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of one command dispatched to the soco-cli server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub speaker: String,
    pub action: String,
    pub args: Vec<String>,
    pub exit_code: i32,
    #[serde(rename = "result")]
    pub result_text: String,
    #[serde(rename = "errorMsg")]
    pub error_message: String,
}

impl CommandResult {
    pub fn failure(
        speaker: &str,
        action: &str,
        args: &[String],
        exit_code: i32,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            speaker: speaker.to_string(),
            action: action.to_string(),
            args: args.to_vec(),
            exit_code,
            result_text: String::new(),
            error_message: error_message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Body returned by soco-cli for `/{speaker}/{action}/...`. Every field is optional.
#[derive(Debug, Default, Deserialize)]
pub struct CommandReply {
    pub speaker: Option<String>,
    pub action: Option<String>,
    pub args: Option<Vec<String>>,
    pub exit_code: Option<i32>,
    pub result: Option<String>,
    pub error_msg: Option<String>,
}

impl CommandReply {
    pub fn into_result(self, speaker: &str, action: &str, args: &[String]) -> CommandResult {
        CommandResult {
            speaker: self.speaker.unwrap_or_else(|| speaker.to_string()),
            action: self.action.unwrap_or_else(|| action.to_string()),
            args: self.args.unwrap_or_else(|| args.to_vec()),
            exit_code: self.exit_code.unwrap_or(0),
            result_text: self.result.unwrap_or_default(),
            error_message: self.error_msg.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SpeakersReply {
    #[serde(default)]
    pub speakers: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RediscoverReply {
    #[serde(default)]
    pub speakers_discovered: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub is_running: bool,
    pub process_id: Option<u32>,
    pub server_url: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Speaker {
    pub name: String,
    pub volume: Option<i32>,
    pub is_muted: bool,
    pub playback_state: Option<String>,
    pub current_track: Option<String>,
    pub battery_level: Option<i32>,
    pub is_offline: bool,
    pub error_message: Option<String>,
}

impl Speaker {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListItem {
    pub number: u32,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub number: u32,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub is_current: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub speaker: String,
    pub action: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MacroExecuteRequest {
    pub macro_name: String,
    #[serde(default)]
    pub arguments: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageReply {
    pub message: String,
}

impl MessageReply {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpgradeStatus {
    Idle,
    Checking,
    Downloading,
    Installing,
    Restarting,
    Complete,
    Failed,
}

/// A release offered by the update server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub version: String,
    pub release_date: DateTime<Utc>,
    pub download_url: String,
    /// Hex SHA-256 of the package.
    pub checksum: String,
    #[serde(default)]
    pub release_notes: Option<String>,
    /// Rings numbered below this do not get the release yet.
    #[serde(default)]
    pub min_ring: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeCheckRequest {
    pub device_id: String,
    pub current_version: String,
    pub ring: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeCheckResponse {
    pub update_available: bool,
    pub current_version: String,
    pub latest_version: Option<VersionInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeState {
    pub status: UpgradeStatus,
    pub current_version: String,
    pub ring: u8,
    pub upgrade_enabled: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub last_upgrade: Option<DateTime<Utc>>,
    pub pending_version: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyReply {
    pub status: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_fields_fall_back_to_request_values() {
        let reply: CommandReply = serde_json::from_str(r#"{"result": "35"}"#).unwrap();
        let args = vec!["x".to_string()];
        let result = reply.into_result("Kitchen", "volume", &args);
        assert_eq!(result.speaker, "Kitchen");
        assert_eq!(result.action, "volume");
        assert_eq!(result.args, args);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.result_text, "35");
        assert_eq!(result.error_message, "");
    }

    #[test]
    fn reply_fields_override_request_values() {
        let reply: CommandReply = serde_json::from_str(
            r#"{"speaker": "Den", "action": "mute", "args": [], "exit_code": 1, "error_msg": "boom"}"#,
        )
        .unwrap();
        let result = reply.into_result("Kitchen", "volume", &["10".to_string()]);
        assert_eq!(result.speaker, "Den");
        assert_eq!(result.action, "mute");
        assert!(result.args.is_empty());
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.error_message, "boom");
    }

    #[test]
    fn command_result_serializes_with_wire_names() {
        let result = CommandResult::failure("Kitchen", "volume", &[], 500, "HTTP 500");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["exitCode"], 500);
        assert_eq!(json["errorMsg"], "HTTP 500");
        assert_eq!(json["result"], "");
    }

    #[test]
    fn status_omits_nothing_but_uses_camel_case() {
        let status = ServerStatus {
            is_running: false,
            process_id: None,
            server_url: None,
            started_at: None,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["isRunning"], false);
        assert!(json["processId"].is_null());
        assert!(json["serverUrl"].is_null());
    }

    #[test]
    fn version_info_defaults_ring_and_notes() {
        let info: VersionInfo = serde_json::from_str(
            r#"{"version": "1.2.0", "releaseDate": "2026-03-01T12:00:00Z",
                "downloadUrl": "http://updates/sndctl_1.2.0.deb", "checksum": "ab"}"#,
        )
        .unwrap();
        assert_eq!(info.min_ring, 0);
        assert_eq!(info.release_notes, None);
    }

    #[test]
    fn upgrade_status_is_lowercase_on_the_wire() {
        assert_eq!(
            serde_json::to_value(UpgradeStatus::Restarting).unwrap(),
            "restarting"
        );
    }
}
