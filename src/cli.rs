use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Settings;

#[derive(Parser, Debug)]
#[command(name = "sndctl", version, about = "Speaker control plane over the soco-cli HTTP API server")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(about = "Supervise soco-cli and serve the REST API")]
    Serve {
        #[arg(long)]
        bind: Option<String>,
        #[arg(long, help = "Port for the soco-cli HTTP API server")]
        port: Option<u16>,
        #[arg(long, value_name = "PATH")]
        executable: Option<PathBuf>,
        #[arg(long, value_name = "PATH")]
        macros_file: Option<PathBuf>,
        #[arg(long, action = clap::ArgAction::SetTrue)]
        use_local_cache: bool,
        #[arg(long, action = clap::ArgAction::SetTrue)]
        no_autostart: bool,
    },
    Client {
        #[arg(long, default_value_t = Settings::default_bind())]
        addr: String,
        #[command(subcommand)]
        action: ClientAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ClientAction {
    #[command(about = "Show whether the soco-cli server is running")]
    Status,
    Speakers,
    #[command(about = "Volume, mute, playback and track for one speaker")]
    Speaker { name: String },
    #[command(about = "Run a soco-cli action on a speaker")]
    Exec {
        speaker: String,
        action: String,
        args: Vec<String>,
    },
    Macro {
        name: String,
        args: Vec<String>,
    },
    #[command(about = "Inspect or trigger ring-based upgrades")]
    Upgrade {
        #[command(subcommand)]
        action: UpgradeAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum UpgradeAction {
    Status,
    Check,
    Apply,
}

impl Command {
    /// Applies `serve` flags on top of the environment.
    pub fn settings(&self) -> Settings {
        let mut settings = Settings::from_env();
        if let Command::Serve {
            bind,
            port,
            executable,
            macros_file,
            use_local_cache,
            no_autostart,
        } = self
        {
            if let Some(bind) = bind {
                settings.bind_addr = bind.clone();
            }
            if let Some(port) = port {
                settings.soco_cli_port = *port;
            }
            if let Some(executable) = executable {
                settings.soco_cli_executable_path = Some(executable.clone());
            }
            if let Some(path) = macros_file {
                settings.set_macros_file(path.clone());
            }
            settings.soco_cli_use_local_cache |= *use_local_cache;
            settings.autostart = !*no_autostart;
        }
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_flags_override_environment() {
        let cli = Cli::parse_from([
            "sndctl",
            "serve",
            "--port",
            "8123",
            "--macros-file",
            "/tmp/m/macros.txt",
            "--no-autostart",
        ]);
        let settings = cli.command.settings();
        assert_eq!(settings.soco_cli_port, 8123);
        assert_eq!(settings.macros_file_path, PathBuf::from("/tmp/m/macros.txt"));
        assert_eq!(
            settings.macros_metadata_path,
            PathBuf::from("/tmp/m/macros-metadata.json")
        );
        assert!(!settings.autostart);
    }

    #[test]
    fn exec_collects_trailing_args() {
        let cli = Cli::parse_from([
            "sndctl",
            "client",
            "exec",
            "Living Room",
            "play_favourite",
            "Radio 4",
        ]);
        let Command::Client { action, .. } = cli.command else {
            panic!("expected client command");
        };
        let ClientAction::Exec {
            speaker,
            action,
            args,
        } = action
        else {
            panic!("expected exec");
        };
        assert_eq!(speaker, "Living Room");
        assert_eq!(action, "play_favourite");
        assert_eq!(args, vec!["Radio 4".to_string()]);
    }

    #[test]
    fn upgrade_actions_parse() {
        let cli = Cli::parse_from(["sndctl", "client", "upgrade", "apply"]);
        assert!(matches!(
            cli.command,
            Command::Client {
                action: ClientAction::Upgrade {
                    action: UpgradeAction::Apply
                },
                ..
            }
        ));
    }
}
