use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time;
use tracing::{error, info, warn};

use crate::protocol::{
    UpgradeCheckRequest, UpgradeCheckResponse, UpgradeState, UpgradeStatus, VersionInfo,
};
use crate::soco::append_segments;

pub const CURRENT_VERSION: &str = env!("CARGO_PKG_VERSION");
/// Rings run 0 (canary) to 3 (conservative).
pub const MAX_RING: u8 = 3;

const CHECK_TIMEOUT: Duration = Duration::from_secs(30);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);
const FALLBACK_PACKAGE_NAME: &str = "sndctl-upgrade.deb";

#[derive(Debug, Clone)]
pub struct UpgradeConfig {
    pub server_url: Option<String>,
    pub device_id: Option<String>,
    pub device_secret: Option<String>,
    pub ring: u8,
    pub enabled: bool,
    pub download_dir: PathBuf,
    /// Program and leading arguments; the package path is appended.
    pub install_command: Vec<String>,
    pub restart_delay: Duration,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            device_id: None,
            device_secret: None,
            ring: MAX_RING,
            enabled: false,
            download_dir: PathBuf::from("/tmp/sndctl-upgrades"),
            install_command: vec!["sudo".to_string(), "dpkg".to_string(), "-i".to_string()],
            restart_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    #[error("Server URL not configured")]
    NotConfigured,
    #[error("invalid update server url: {0}")]
    InvalidUrl(String),
    #[error("update server request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("update server returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("install command is empty")]
    NoInstaller,
    #[error("install failed: {0}")]
    Install(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

fn io_error(context: impl Into<String>) -> impl FnOnce(io::Error) -> UpgradeError {
    let context = context.into();
    move |source| UpgradeError::Io { context, source }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckReply {
    #[serde(default)]
    update_available: bool,
    #[serde(default)]
    latest_version: Option<VersionInfo>,
}

/// Ring-gated check, download, verify and install against the update server.
///
/// One operation runs at a time. A successful install flips the restart channel so the
/// service can shut down cleanly and be restarted by its service manager.
pub struct UpgradeCoordinator {
    config: UpgradeConfig,
    client: reqwest::Client,
    state: Mutex<UpgradeState>,
    operation: tokio::sync::Mutex<()>,
    restart: Arc<watch::Sender<bool>>,
}

impl UpgradeCoordinator {
    pub fn new(config: UpgradeConfig) -> Result<Self, UpgradeError> {
        let client = reqwest::Client::builder().build()?;
        let state = UpgradeState {
            status: UpgradeStatus::Idle,
            current_version: CURRENT_VERSION.to_string(),
            ring: config.ring,
            upgrade_enabled: config.enabled,
            last_check: None,
            last_upgrade: None,
            pending_version: None,
            error_message: None,
        };
        let (restart, _) = watch::channel(false);
        Ok(Self {
            config,
            client,
            state: Mutex::new(state),
            operation: tokio::sync::Mutex::new(()),
            restart: Arc::new(restart),
        })
    }

    fn state_mut(&self) -> MutexGuard<'_, UpgradeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> UpgradeState {
        self.state_mut().clone()
    }

    fn set_status(&self, status: UpgradeStatus) {
        self.state_mut().status = status;
    }

    /// Resolves to `true` once an installed upgrade wants the service restarted.
    pub fn restart_requested(&self) -> watch::Receiver<bool> {
        self.restart.subscribe()
    }

    pub async fn check(&self) -> Result<UpgradeCheckResponse, UpgradeError> {
        let _guard = self.operation.lock().await;
        self.check_locked().await
    }

    /// `Ok(false)` means nothing was installed: upgrades are off, nothing is newer, or
    /// this device's ring is not eligible yet.
    pub async fn apply(&self) -> Result<bool, UpgradeError> {
        if !self.config.enabled {
            info!("auto-upgrades are disabled");
            return Ok(false);
        }

        let _guard = self.operation.lock().await;
        let check = self.check_locked().await?;
        let version = match check.latest_version {
            Some(version) if check.update_available => version,
            _ => {
                info!("no update available");
                return Ok(false);
            }
        };

        if self.config.ring < version.min_ring {
            info!(
                ring = self.config.ring,
                version = %version.version,
                min_ring = version.min_ring,
                "ring not eligible for release"
            );
            return Ok(false);
        }

        info!(version = %version.version, "starting upgrade");
        let package = self
            .download(&version)
            .await
            .map_err(|err| self.fail("download failed", err))?;
        self.install(&package)
            .await
            .map_err(|err| self.fail("installation failed", err))?;

        self.set_status(UpgradeStatus::Restarting);
        self.request_restart();
        Ok(true)
    }

    fn fail(&self, context: &str, err: UpgradeError) -> UpgradeError {
        error!(error = %err, "{}", context);
        let mut state = self.state_mut();
        state.status = UpgradeStatus::Failed;
        state.error_message = Some(err.to_string());
        err
    }

    async fn check_locked(&self) -> Result<UpgradeCheckResponse, UpgradeError> {
        let Some(server_url) = self.config.server_url.as_deref() else {
            warn!("no update server configured, cannot check for upgrades");
            return Err(UpgradeError::NotConfigured);
        };

        self.set_status(UpgradeStatus::Checking);
        let response = self
            .request_check(server_url)
            .await
            .map_err(|err| self.fail("upgrade check failed", err))?;

        {
            let mut state = self.state_mut();
            state.last_check = Some(Utc::now());
            state.status = UpgradeStatus::Idle;
        }
        info!(
            update_available = response.update_available,
            current = CURRENT_VERSION,
            latest = ?response.latest_version.as_ref().map(|version| version.version.as_str()),
            "upgrade check complete"
        );
        Ok(response)
    }

    async fn request_check(&self, server_url: &str) -> Result<UpgradeCheckResponse, UpgradeError> {
        let mut url =
            url::Url::parse(server_url).map_err(|err| UpgradeError::InvalidUrl(err.to_string()))?;
        append_segments(&mut url, ["api", "v1", "upgrades", "check"])
            .map_err(|err| UpgradeError::InvalidUrl(err.to_string()))?;

        let device_id = self.config.device_id.clone().unwrap_or_default();
        let request = UpgradeCheckRequest {
            device_id: if device_id.is_empty() {
                "unknown".to_string()
            } else {
                device_id.clone()
            },
            current_version: CURRENT_VERSION.to_string(),
            ring: self.config.ring,
        };
        let response = self
            .client
            .post(url)
            .timeout(CHECK_TIMEOUT)
            .header("X-Device-Id", device_id)
            .header(
                "X-Device-Secret",
                self.config.device_secret.clone().unwrap_or_default(),
            )
            .json(&request)
            .send()
            .await?;
        let reply: CheckReply = ensure_success(response).await?.json().await?;
        Ok(UpgradeCheckResponse {
            update_available: reply.update_available,
            current_version: CURRENT_VERSION.to_string(),
            latest_version: reply.latest_version,
        })
    }

    async fn download(&self, version: &VersionInfo) -> Result<PathBuf, UpgradeError> {
        {
            let mut state = self.state_mut();
            state.status = UpgradeStatus::Downloading;
            state.pending_version = Some(version.version.clone());
        }

        let dir = &self.config.download_dir;
        fs::create_dir_all(dir)
            .await
            .map_err(io_error(format!("create {}", dir.display())))?;
        let dest = dir.join(package_file_name(&version.download_url));
        info!(url = %version.download_url, dest = %dest.display(), "downloading upgrade package");

        let response = self
            .client
            .get(&version.download_url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let partial = dest.with_extension("part");
        if let Err(err) = write_verified(response, &partial, &version.checksum).await {
            let _ = fs::remove_file(&partial).await;
            return Err(err);
        }
        fs::rename(&partial, &dest)
            .await
            .map_err(io_error(format!("move {}", partial.display())))?;
        info!("download complete, checksum verified");
        Ok(dest)
    }

    async fn install(&self, package: &Path) -> Result<(), UpgradeError> {
        self.set_status(UpgradeStatus::Installing);
        let Some((program, args)) = self.config.install_command.split_first() else {
            return Err(UpgradeError::NoInstaller);
        };

        let output = Command::new(program)
            .args(args)
            .arg(package)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(io_error(format!("run {program}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(UpgradeError::Install(format!(
                "{}: {}",
                output.status,
                stderr.trim()
            )));
        }
        info!(package = %package.display(), "package installed");

        if let Err(err) = fs::remove_file(package).await {
            warn!(package = %package.display(), error = %err, "failed to remove installed package");
        }
        let mut state = self.state_mut();
        state.last_upgrade = Some(Utc::now());
        state.status = UpgradeStatus::Complete;
        Ok(())
    }

    fn request_restart(&self) {
        let delay = self.config.restart_delay;
        info!(delay_ms = delay.as_millis() as u64, "requesting service restart");
        let restart = self.restart.clone();
        tokio::spawn(async move {
            // Lets the apply response reach the caller first.
            time::sleep(delay).await;
            restart.send_replace(true);
        });
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, UpgradeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(UpgradeError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Streams the body to `path`, hashing as it goes.
async fn write_verified(
    response: reqwest::Response,
    path: &Path,
    expected: &str,
) -> Result<(), UpgradeError> {
    let mut file = fs::File::create(path)
        .await
        .map_err(io_error(format!("create {}", path.display())))?;
    let mut hasher = Sha256::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let bytes = chunk?;
        hasher.update(&bytes);
        file.write_all(&bytes)
            .await
            .map_err(io_error(format!("write {}", path.display())))?;
    }
    file.flush()
        .await
        .map_err(io_error(format!("write {}", path.display())))?;

    let actual = format!("{:x}", hasher.finalize());
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        return Err(UpgradeError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

/// Last path segment of the download URL, still percent-encoded.
fn package_file_name(download_url: &str) -> String {
    url::Url::parse(download_url)
        .ok()
        .and_then(|url| {
            url.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|name| !name.is_empty() && name != "." && name != "..")
        .unwrap_or_else(|| FALLBACK_PACKAGE_NAME.to_string())
}
