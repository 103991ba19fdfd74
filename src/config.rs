use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::soco::{StartupPolicy, SupervisorConfig};
use crate::upgrade::{MAX_RING, UpgradeConfig};

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    pub soco_cli_executable_path: Option<PathBuf>,
    pub soco_cli_host: String,
    pub soco_cli_port: u16,
    pub soco_cli_use_local_cache: bool,
    pub macros_file_path: PathBuf,
    pub macros_metadata_path: PathBuf,
    pub command_timeout: Duration,
    pub autostart: bool,
    pub update_server_url: Option<String>,
    pub device_id: Option<String>,
    pub device_secret: Option<String>,
    pub upgrade_ring: u8,
    pub upgrade_enabled: bool,
    pub upgrade_download_dir: PathBuf,
}

impl Settings {
    pub fn default_bind() -> String {
        "127.0.0.1:5050".to_string()
    }

    pub fn from_env() -> Self {
        let macros_file_path = PathBuf::from(env_string("MACROS_FILE_PATH", "data/macros.txt"));
        let macros_metadata_path = env_optional_string("MACROS_METADATA_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| metadata_path_for(&macros_file_path));
        Self {
            bind_addr: env_optional_string("SNDCTL_BIND").unwrap_or_else(Self::default_bind),
            soco_cli_executable_path: env_optional_string("SOCO_CLI_EXECUTABLE_PATH")
                .map(PathBuf::from),
            soco_cli_host: env_string("SOCO_CLI_HOST", "127.0.0.1"),
            soco_cli_port: env_optional_u16("SOCO_CLI_PORT").unwrap_or(8000),
            soco_cli_use_local_cache: env_bool("SOCO_CLI_USE_LOCAL_CACHE"),
            macros_file_path,
            macros_metadata_path,
            command_timeout: env_duration_seconds(
                "SOCO_CLI_COMMAND_TIMEOUT_SECONDS",
                DEFAULT_COMMAND_TIMEOUT.as_secs_f32(),
            ),
            autostart: true,
            update_server_url: env_optional_string("SNDCTL_SERVER_URL"),
            device_id: env_optional_string("SNDCTL_DEVICE_ID"),
            device_secret: env_optional_string("SNDCTL_DEVICE_SECRET"),
            upgrade_ring: ring(env_optional_string("UPGRADE_RING").as_deref()),
            upgrade_enabled: env_bool("UPGRADE_ENABLED"),
            upgrade_download_dir: PathBuf::from(env_string(
                "UPGRADE_DOWNLOAD_DIR",
                "/tmp/sndctl-upgrades",
            )),
        }
    }

    /// Points the macros file somewhere else, keeping the sidecar next to it.
    pub fn set_macros_file(&mut self, path: PathBuf) {
        self.macros_metadata_path = metadata_path_for(&path);
        self.macros_file_path = path;
    }

    pub fn soco_cli_url(&self) -> String {
        format!("http://{}:{}", self.soco_cli_host, self.soco_cli_port)
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            executable_path: self.soco_cli_executable_path.clone(),
            host: self.soco_cli_host.clone(),
            port: self.soco_cli_port,
            macros_file: self.macros_file_path.clone(),
            use_local_cache: self.soco_cli_use_local_cache,
            startup: StartupPolicy::default(),
            ..SupervisorConfig::default()
        }
    }

    pub fn upgrade_config(&self) -> UpgradeConfig {
        UpgradeConfig {
            server_url: self.update_server_url.clone(),
            device_id: self.device_id.clone(),
            device_secret: self.device_secret.clone(),
            ring: self.upgrade_ring,
            enabled: self.upgrade_enabled,
            download_dir: self.upgrade_download_dir.clone(),
            ..UpgradeConfig::default()
        }
    }
}

fn metadata_path_for(macros_file: &std::path::Path) -> PathBuf {
    macros_file.with_file_name("macros-metadata.json")
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_optional_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim().to_string();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    })
}

fn env_optional_u16(key: &str) -> Option<u16> {
    env::var(key).ok().and_then(|value| value.trim().parse::<u16>().ok())
}

/// Unset or unparseable rings mean the most conservative one.
fn ring(raw: Option<&str>) -> u8 {
    raw.and_then(|value| value.parse::<u8>().ok())
        .map_or(MAX_RING, |ring| ring.min(MAX_RING))
}

fn env_bool(key: &str) -> bool {
    env::var(key)
        .map(|value| parse_bool(&value))
        .unwrap_or(false)
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_duration_seconds(key: &str, default_secs: f32) -> Duration {
    duration_seconds(env::var(key).ok().as_deref(), default_secs)
}

/// Negative, non-finite or overflowing values fall back to the default.
fn duration_seconds(raw: Option<&str>, default_secs: f32) -> Duration {
    raw.and_then(|value| value.trim().parse::<f32>().ok())
        .and_then(|secs| Duration::try_from_secs_f32(secs).ok())
        .unwrap_or_else(|| Duration::try_from_secs_f32(default_secs).unwrap_or_default())
}
