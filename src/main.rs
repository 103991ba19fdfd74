mod api;
mod cli;
mod config;
mod listing;
mod macro_store;
mod protocol;
mod server;
mod soco;
mod upgrade;

use clap::Parser;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing_subscriber::EnvFilter;
use url::Url;

use crate::cli::{ClientAction, Cli, Command, UpgradeAction};
use crate::protocol::{
    ApplyReply, CommandRequest, CommandResult, MacroExecuteRequest, ServerStatus, Speaker,
    UpgradeCheckResponse, UpgradeState,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("sndctl=info".parse()?))
        .init();

    let cli = Cli::parse();
    let settings = cli.command.settings();
    match cli.command {
        Command::Serve { .. } => server::run_server(settings).await.map_err(|err| err.into()),
        Command::Client { addr, action } => {
            let client = ApiClient::new(&addr)?;
            match action {
                ClientAction::Status => {
                    let status: ServerStatus = client.get(&["api", "sonos", "status"]).await?;
                    match (status.is_running, status.process_id) {
                        (true, Some(pid)) => println!(
                            "running: pid {}, {}",
                            pid,
                            status.server_url.unwrap_or_default()
                        ),
                        (true, None) => println!("running"),
                        (false, _) => println!("stopped"),
                    }
                }
                ClientAction::Speakers => {
                    let speakers: Vec<String> = client.get(&["api", "sonos", "speakers"]).await?;
                    for speaker in speakers {
                        println!("{}", speaker);
                    }
                }
                ClientAction::Speaker { name } => {
                    let speaker: Speaker = client
                        .get(&["api", "sonos", "speakers", name.as_str()])
                        .await?;
                    print_speaker(&speaker);
                }
                ClientAction::Exec {
                    speaker,
                    action,
                    args,
                } => {
                    let request = CommandRequest {
                        speaker,
                        action,
                        args,
                    };
                    let result: CommandResult = client
                        .post(&["api", "sonos", "command"], &request)
                        .await?;
                    if result.is_success() {
                        println!("{}", result.result_text);
                    } else {
                        println!("error ({}): {}", result.exit_code, result.error_message);
                    }
                }
                ClientAction::Macro { name, args } => {
                    let request = MacroExecuteRequest {
                        macro_name: name,
                        arguments: args,
                    };
                    let reply: Value = client.post(&["api", "macro", "execute"], &request).await?;
                    println!("{}", serde_json::to_string_pretty(&reply)?);
                }
                ClientAction::Upgrade { action } => match action {
                    UpgradeAction::Status => {
                        let state: UpgradeState =
                            client.get(&["api", "upgrades", "status"]).await?;
                        println!("{}", serde_json::to_string_pretty(&state)?);
                    }
                    UpgradeAction::Check => {
                        let check: UpgradeCheckResponse = client
                            .post(&["api", "upgrades", "check"], &Value::Null)
                            .await?;
                        match check.latest_version {
                            Some(latest) if check.update_available => println!(
                                "update available: {} -> {} (min ring {})",
                                check.current_version, latest.version, latest.min_ring
                            ),
                            _ => println!("up to date: {}", check.current_version),
                        }
                    }
                    UpgradeAction::Apply => {
                        let reply: ApplyReply = client
                            .post(&["api", "upgrades", "apply"], &Value::Null)
                            .await?;
                        println!("{}: {}", reply.status, reply.message);
                    }
                },
            }
            Ok(())
        }
    }
}

fn print_speaker(speaker: &Speaker) {
    if speaker.is_offline {
        println!(
            "{}: offline ({})",
            speaker.name,
            speaker.error_message.as_deref().unwrap_or("unreachable")
        );
        return;
    }
    println!("{}", speaker.name);
    if let Some(volume) = speaker.volume {
        println!("  volume: {}", volume);
    }
    println!("  muted: {}", speaker.is_muted);
    if let Some(state) = &speaker.playback_state {
        println!("  playback: {}", state);
    }
    if let Some(track) = &speaker.current_track {
        println!("  track: {}", track);
    }
    if let Some(level) = speaker.battery_level {
        println!("  battery: {}%", level);
    }
}

/// Thin reqwest wrapper for the client subcommands.
struct ApiClient {
    base: Url,
    http: reqwest::Client,
}

impl ApiClient {
    fn new(addr: &str) -> Result<Self, String> {
        let base = if addr.contains("://") {
            addr.to_string()
        } else {
            format!("http://{}", addr)
        };
        let base = Url::parse(&base).map_err(|err| format!("invalid address {}: {}", addr, err))?;
        Ok(Self {
            base,
            http: reqwest::Client::new(),
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, String> {
        let mut url = self.base.clone();
        soco::append_segments(&mut url, segments.iter().copied())
            .map_err(|err| format!("invalid request path: {}", err))?;
        Ok(url)
    }

    async fn get<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, String> {
        let response = self
            .http
            .get(self.url(segments)?)
            .send()
            .await
            .map_err(|err| format!("request failed: {}", err))?;
        decode(response).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        segments: &[&str],
        body: &B,
    ) -> Result<T, String> {
        let response = self
            .http
            .post(self.url(segments)?)
            .json(body)
            .send()
            .await
            .map_err(|err| format!("request failed: {}", err))?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, String> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|value| value["detail"].as_str().map(str::to_string))
            .unwrap_or(body);
        return Err(format!("HTTP {}: {}", status.as_u16(), detail));
    }
    response
        .json()
        .await
        .map_err(|err| format!("invalid response: {}", err))
}
