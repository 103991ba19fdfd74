use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time;
use tracing::{debug, error, info, warn};

use super::ServerControl;
use crate::protocol::ServerStatus;

pub const EXECUTABLE_NAME: &str = "sonos-http-api-server";

const FALLBACK_USERS: &[&str] = &["pi", "sonos", "sndctl"];
const SYSTEM_LOCATIONS: &[&str] = &["/usr/local/bin", "/opt/homebrew/bin"];
const PATH_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);
const SPAWN_ATTEMPTS: usize = 2;
const SPAWN_RETRY_DELAY: Duration = Duration::from_millis(250);

/// How long `start` waits for the freshly spawned server to answer.
#[derive(Debug, Clone)]
pub struct StartupPolicy {
    pub attempts: u32,
    pub interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for StartupPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub executable_path: Option<PathBuf>,
    pub host: String,
    pub port: u16,
    pub macros_file: PathBuf,
    pub use_local_cache: bool,
    pub startup: StartupPolicy,
    pub stop_grace: Duration,
    pub home_dir: Option<PathBuf>,
    pub fallback_users: Vec<String>,
    pub system_locations: Vec<PathBuf>,
    /// Directories for the `PATH` lookup step; `None` uses the process `PATH`.
    pub search_path: Option<OsString>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            executable_path: None,
            host: "127.0.0.1".to_string(),
            port: 8000,
            macros_file: PathBuf::from("data/macros.txt"),
            use_local_cache: false,
            startup: StartupPolicy::default(),
            stop_grace: Duration::from_secs(5),
            home_dir: dirs::home_dir(),
            fallback_users: FALLBACK_USERS.iter().map(|user| user.to_string()).collect(),
            system_locations: SYSTEM_LOCATIONS.iter().map(PathBuf::from).collect(),
            search_path: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("executable not found: {}", path.display())]
    NotFound { path: PathBuf },
    #[error("executable is not runnable: {}", path.display())]
    PermissionDenied { path: PathBuf },
    #[error("failed to spawn {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to stop command server: {0}")]
    Stop(#[source] io::Error),
    #[error("failed to build probe client: {0}")]
    Client(#[from] reqwest::Error),
}

impl SupervisorError {
    fn from_spawn(path: &Path, err: io::Error) -> Self {
        let path = path.to_path_buf();
        match err.kind() {
            io::ErrorKind::NotFound => SupervisorError::NotFound { path },
            io::ErrorKind::PermissionDenied => SupervisorError::PermissionDenied { path },
            _ => SupervisorError::Spawn { path, source: err },
        }
    }

    /// Missing or non-executable binaries are fatal; a busy or interrupted exec is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            SupervisorError::Spawn { source, .. } => is_transient(source),
            _ => false,
        }
    }
}

fn is_transient(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    ) {
        return true;
    }
    #[cfg(unix)]
    {
        if err.raw_os_error() == Some(nix::errno::Errno::ETXTBSY as i32) {
            return true;
        }
    }
    false
}

struct SupervisedProcess {
    child: Child,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    port: u16,
    executable_path: PathBuf,
}

impl SupervisedProcess {
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

enum StopOutcome {
    Exited,
    Killed,
}

/// Owns the single soco-cli HTTP API server child process.
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    process: Mutex<Option<SupervisedProcess>>,
    start_lock: tokio::sync::Mutex<()>,
    probe_client: reqwest::Client,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Result<Self, SupervisorError> {
        let probe_client = reqwest::Client::builder().build()?;
        Ok(Self {
            config,
            process: Mutex::new(None),
            start_lock: tokio::sync::Mutex::new(()),
            probe_client,
        })
    }

    pub fn server_url(&self) -> String {
        format!("http://{}:{}", self.config.host, self.config.port)
    }

    fn process(&self) -> MutexGuard<'_, Option<SupervisedProcess>> {
        self.process.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.process()
            .as_mut()
            .is_some_and(SupervisedProcess::is_alive)
    }

    pub fn status(&self) -> ServerStatus {
        let mut guard = self.process();
        let Some(process) = guard.as_mut() else {
            return ServerStatus {
                is_running: false,
                process_id: None,
                server_url: None,
                started_at: None,
            };
        };
        if process.is_alive() {
            ServerStatus {
                is_running: true,
                process_id: process.pid,
                server_url: Some(self.server_url()),
                started_at: Some(process.started_at),
            }
        } else {
            ServerStatus {
                is_running: false,
                process_id: None,
                server_url: None,
                started_at: Some(process.started_at),
            }
        }
    }

    pub fn server_args(&self) -> Vec<String> {
        let mut args = vec![
            "--port".to_string(),
            self.config.port.to_string(),
            "--macros".to_string(),
            self.config.macros_file.display().to_string(),
        ];
        if self.config.use_local_cache {
            args.push("--use-local-speaker-list".to_string());
        }
        args
    }

    /// Install locations searched after an explicit path, in order.
    pub fn candidate_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(home) = &self.config.home_dir {
            paths.extend(user_install_paths(home));
        }
        for user in &self.config.fallback_users {
            paths.extend(user_install_paths(&Path::new("/home").join(user)));
        }
        for dir in &self.config.system_locations {
            paths.push(dir.join(EXECUTABLE_NAME));
        }
        paths
    }

    /// Never fails: the bare command name is the last resort and spawn reports the error.
    pub async fn resolve_executable_path(&self) -> PathBuf {
        if let Some(path) = &self.config.executable_path {
            if path.exists() {
                info!(path = %path.display(), "using configured command server executable");
                return path.clone();
            }
            warn!(path = %path.display(), "configured command server executable does not exist");
        }

        let candidates = self.candidate_paths();
        if let Some(found) = candidates.iter().find(|path| path.exists()) {
            info!(path = %found.display(), "found command server executable");
            return found.clone();
        }

        let checked: Vec<String> = candidates
            .iter()
            .map(|path| path.display().to_string())
            .collect();
        warn!(checked = %checked.join(", "), "command server executable not found in known locations");

        if let Some(resolved) = resolve_from_path(EXECUTABLE_NAME, self.config.search_path.clone()).await {
            info!(path = %resolved.display(), "resolved command server executable from PATH");
            return resolved;
        }

        warn!("could not resolve command server from PATH, using command name directly");
        PathBuf::from(EXECUTABLE_NAME)
    }

    pub async fn start(&self) -> bool {
        if self.is_running() {
            return true;
        }

        // Holding the lock means no other start is in flight.
        let _guard = self.start_lock.lock().await;
        if self.is_running() {
            info!("command server was started while waiting");
            return true;
        }

        self.launch().await
    }

    pub async fn ensure_running(&self) {
        if !self.is_running() {
            self.start().await;
        }
    }

    async fn launch(&self) -> bool {
        let executable = self.resolve_executable_path().await;
        let args = self.server_args();
        info!(macros = %self.config.macros_file.display(), "using macros file");
        info!(
            executable = %executable.display(),
            args = %args.join(" "),
            "starting command server"
        );

        let child = match spawn_with_retry(&executable, &args).await {
            Ok(child) => child,
            Err(err) => {
                error!(error = %err, "failed to start command server");
                return false;
            }
        };

        let pid = child.id();
        *self.process() = Some(SupervisedProcess {
            child,
            pid,
            started_at: Utc::now(),
            port: self.config.port,
            executable_path: executable.clone(),
        });
        info!(
            pid = ?pid,
            port = self.config.port,
            executable = %executable.display(),
            "started command server"
        );

        self.wait_until_ready().await
    }

    async fn wait_until_ready(&self) -> bool {
        let policy = &self.config.startup;
        for attempt in 1..=policy.attempts {
            time::sleep(policy.interval).await;
            if !self.is_running() {
                let exit = self.reap();
                error!(exit = ?exit, "command server exited during startup");
                return false;
            }
            if self.probe().await {
                info!(attempt, "command server is responsive");
                return true;
            }
            debug!(attempt, max_attempts = policy.attempts, "waiting for command server");
        }

        warn!("command server started but is not responsive yet");
        true
    }

    fn reap(&self) -> Option<ExitStatus> {
        let mut process = self.process().take()?;
        process.child.try_wait().ok().flatten()
    }

    async fn probe(&self) -> bool {
        let url = format!("{}/speakers", self.server_url());
        match self
            .probe_client
            .get(&url)
            .timeout(self.config.startup.probe_timeout)
            .send()
            .await
        {
            Ok(response) => response.status() == StatusCode::OK,
            Err(err) => {
                debug!(error = %err, "readiness probe failed");
                false
            }
        }
    }

    /// Always leaves the supervisor without a process handle.
    pub async fn stop(&self) -> bool {
        let Some(mut process) = self.process().take() else {
            return true;
        };

        match terminate(&mut process.child, self.config.stop_grace).await {
            Ok(StopOutcome::Exited) => {
                info!(
                    pid = ?process.pid,
                    port = process.port,
                    executable = %process.executable_path.display(),
                    "stopped command server"
                );
                true
            }
            Ok(StopOutcome::Killed) => {
                warn!(pid = ?process.pid, "killed command server after timeout");
                true
            }
            Err(err) => {
                error!(pid = ?process.pid, error = %err, "failed to stop command server");
                false
            }
        }
    }
}

#[async_trait]
impl ServerControl for ProcessSupervisor {
    fn server_url(&self) -> String {
        ProcessSupervisor::server_url(self)
    }

    async fn ensure_running(&self) {
        ProcessSupervisor::ensure_running(self).await;
    }
}

fn user_install_paths(home: &Path) -> [PathBuf; 2] {
    [
        home.join(".local/bin").join(EXECUTABLE_NAME),
        home.join(".local/share/pipx/venvs/soco-cli/bin")
            .join(EXECUTABLE_NAME),
    ]
}

async fn resolve_from_path(command: &'static str, search_path: Option<OsString>) -> Option<PathBuf> {
    let lookup = tokio::task::spawn_blocking(move || match search_path {
        Some(paths) => which::which_in(command, Some(paths), Path::new(".")),
        None => which::which(command),
    });
    match time::timeout(PATH_LOOKUP_TIMEOUT, lookup).await {
        Ok(Ok(Ok(path))) if path.exists() => Some(path),
        Ok(Ok(Ok(_))) => None,
        Ok(Ok(Err(err))) => {
            debug!(command, error = %err, "PATH lookup failed");
            None
        }
        Ok(Err(err)) => {
            debug!(command, error = %err, "PATH lookup task failed");
            None
        }
        Err(_) => {
            debug!(command, "PATH lookup timed out");
            None
        }
    }
}

async fn spawn_with_retry(executable: &Path, args: &[String]) -> Result<Child, SupervisorError> {
    retry_transient(|| spawn_server(executable, args)).await
}

async fn retry_transient<T>(
    mut spawn: impl FnMut() -> Result<T, SupervisorError>,
) -> Result<T, SupervisorError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match spawn() {
            Ok(spawned) => return Ok(spawned),
            Err(err) if err.is_retryable() && attempt < SPAWN_ATTEMPTS => {
                warn!(attempt, error = %err, "transient spawn failure, retrying");
                time::sleep(SPAWN_RETRY_DELAY).await;
            }
            Err(err) => return Err(err),
        }
    }
}

fn spawn_server(executable: &Path, args: &[String]) -> Result<Child, SupervisorError> {
    let mut child = Command::new(executable)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| SupervisorError::from_spawn(executable, err))?;

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_output(stdout, false));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_output(stderr, true));
    }
    Ok(child)
}

async fn forward_output<R>(reader: R, is_stderr: bool)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if is_stderr {
            warn!(target: "sndctl::soco_cli", "{}", line);
        } else {
            debug!(target: "sndctl::soco_cli", "{}", line);
        }
    }
}

async fn terminate(child: &mut Child, grace: Duration) -> Result<StopOutcome, SupervisorError> {
    send_terminate(child).map_err(SupervisorError::Stop)?;
    match time::timeout(grace, child.wait()).await {
        Ok(Ok(_)) => Ok(StopOutcome::Exited),
        Ok(Err(err)) => Err(SupervisorError::Stop(err)),
        Err(_) => {
            child.kill().await.map_err(SupervisorError::Stop)?;
            Ok(StopOutcome::Killed)
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return Ok(());
    };
    #[allow(clippy::cast_possible_wrap)]
    let target = Pid::from_raw(pid as i32);
    match kill(target, Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(io::Error::from(errno)),
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) -> io::Result<()> {
    child.start_kill()
}
