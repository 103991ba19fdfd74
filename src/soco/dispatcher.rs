use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use url::Url;

use super::{PathError, ServerControl, append_segments, error_chain, log_outbound};
use crate::protocol::{CommandReply, CommandResult, RediscoverReply, SpeakersReply};

const OFFLINE_MARKERS: &[&str] = &[
    "timed out",
    "timeout",
    "connection refused",
    "unreachable",
    "no route to host",
    "network is unreachable",
    "connecttimeouterror",
    "max retries exceeded",
];

/// True when an error message says the speaker itself could not be reached.
pub fn is_offline_error(message: &str) -> bool {
    if message.is_empty() {
        return false;
    }
    let lower = message.to_lowercase();
    OFFLINE_MARKERS.iter().any(|marker| lower.contains(marker))
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("invalid server url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("invalid request path: {0}")]
    InvalidPath(#[from] PathError),
    #[error("{0}")]
    Transport(String),
    #[error("HTTP {status}")]
    Status { status: u16, body: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("failed to build http client: {0}")]
    Client(String),
}

impl DispatchError {
    fn transport(err: reqwest::Error) -> Self {
        DispatchError::Transport(error_chain(&err))
    }
}

/// Sends commands to the soco-cli server strictly one at a time.
///
/// soco-cli misbehaves under concurrent requests, so every outbound call, from
/// every caller, holds `request_lock` for its full round trip including the body.
pub struct CommandDispatcher {
    server: Arc<dyn ServerControl>,
    client: reqwest::Client,
    request_lock: Mutex<()>,
}

impl CommandDispatcher {
    pub fn new(server: Arc<dyn ServerControl>, timeout: Duration) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| DispatchError::Client(err.to_string()))?;
        Ok(Self {
            server,
            client,
            request_lock: Mutex::new(()),
        })
    }

    fn url_for<'a>(
        &self,
        segments: impl IntoIterator<Item = &'a str>,
    ) -> Result<Url, DispatchError> {
        let base = self.server.server_url();
        let mut url = Url::parse(&base).map_err(|err| DispatchError::InvalidUrl {
            url: base.clone(),
            reason: err.to_string(),
        })?;
        append_segments(&mut url, segments)?;
        Ok(url)
    }

    async fn round_trip(&self, url: &Url) -> Result<(StatusCode, String), DispatchError> {
        self.server.ensure_running().await;
        let _permit = self.request_lock.lock().await;
        log_outbound(url);
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(DispatchError::transport)?;
        let status = response.status();
        let body = response.text().await.map_err(DispatchError::transport)?;
        Ok((status, body))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &Url) -> Result<T, DispatchError> {
        let (status, body) = self.round_trip(url).await?;
        if status != StatusCode::OK {
            error!(
                method = "GET",
                url = %url,
                status = status.as_u16(),
                body = %body,
                "command server request failed"
            );
            return Err(DispatchError::Status {
                status: status.as_u16(),
                body,
            });
        }
        serde_json::from_str(&body).map_err(|err| DispatchError::InvalidResponse(err.to_string()))
    }

    /// Never fails: transport problems come back as `exit_code == -1`.
    pub async fn execute_command(
        &self,
        speaker: &str,
        action: &str,
        args: &[String],
    ) -> CommandResult {
        let segments = [speaker, action]
            .into_iter()
            .chain(args.iter().map(String::as_str));
        let url = match self.url_for(segments) {
            Ok(url) => url,
            Err(err) => return CommandResult::failure(speaker, action, args, -1, err.to_string()),
        };
        debug!(url = %url, "executing command");

        match self.get_json::<CommandReply>(&url).await {
            Ok(reply) => reply.into_result(speaker, action, args),
            Err(DispatchError::Status { status, .. }) => CommandResult::failure(
                speaker,
                action,
                args,
                i32::from(status),
                format!("HTTP {status}"),
            ),
            Err(err) => {
                error!(speaker, action, error = %err, "failed to execute command");
                CommandResult::failure(speaker, action, args, -1, err.to_string())
            }
        }
    }

    pub async fn get_speakers(&self) -> Vec<String> {
        let result = match self.url_for(["speakers"]) {
            Ok(url) => self.get_json::<SpeakersReply>(&url).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(reply) => non_empty(reply.speakers),
            Err(err) => {
                error!(error = %err, "failed to get speakers");
                Vec::new()
            }
        }
    }

    pub async fn rediscover_speakers(&self) -> Vec<String> {
        let result = match self.url_for(["rediscover"]) {
            Ok(url) => self.get_json::<RediscoverReply>(&url).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(reply) => non_empty(reply.speakers_discovered),
            Err(err) => {
                error!(error = %err, "failed to rediscover speakers");
                Vec::new()
            }
        }
    }

    pub async fn execute_macro(
        &self,
        name: &str,
        args: &[String],
    ) -> Result<serde_json::Value, DispatchError> {
        let segments = ["macro", name]
            .into_iter()
            .chain(args.iter().map(String::as_str));
        let url = self.url_for(segments)?;
        info!(url = %url, "executing macro");
        self.get_json(&url).await.inspect_err(|err| {
            error!(name, error = %err, "failed to execute macro");
        })
    }

    pub async fn reload_macros(&self) -> bool {
        let url = match self.url_for(["macros", "reload"]) {
            Ok(url) => url,
            Err(err) => {
                error!(error = %err, "failed to reload macros");
                return false;
            }
        };
        match self.round_trip(&url).await {
            Ok((StatusCode::OK, _)) => {
                info!("reloaded macros in command server");
                true
            }
            Ok((status, body)) => {
                error!(
                    method = "GET",
                    url = %url,
                    status = status.as_u16(),
                    body = %body,
                    "command server request failed"
                );
                false
            }
            Err(err) => {
                error!(error = %err, "failed to reload macros");
                false
            }
        }
    }
}

fn non_empty(names: Vec<String>) -> Vec<String> {
    names.into_iter().filter(|name| !name.is_empty()).collect()
}
