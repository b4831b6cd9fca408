//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments via clap (`relay`, `send`, `receive`)
//! - TOML configuration file (`rtcportal.toml` by default)
//! - Merging CLI with file config (CLI takes precedence)

use clap::{Parser, Subcommand};
use rtcportal::core::config::{DEFAULT_PORT, DEFAULT_STUN_SERVERS};
use rtcportal::core::session::SessionConfig;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "rtcportal.toml";
const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:3000/ws";

/// rtcportal - relay-assisted peer-to-peer file transfer.
#[derive(Parser, Clone, Debug)]
#[command(author, version, about)]
#[command(propagate_version = true)]
pub struct Args {
    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Also write logs to this file.
    #[clap(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Configuration file. Defaults to ./rtcportal.toml when present.
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Run the signaling relay and the stats endpoint.
    Relay(RelayArgs),
    /// Dial a peer and send files.
    Send(SendArgs),
    /// Wait for a peer and save what it sends.
    Receive(ReceiveArgs),
}

#[derive(clap::Args, Clone, Debug)]
pub struct RelayArgs {
    /// HTTP/WebSocket port.
    #[clap(short, long)]
    pub port: Option<u16>,

    /// Allowed CORS origin (repeatable). Any origin when none is given.
    #[clap(long = "allow-origin")]
    pub allowed_origins: Vec<String>,
}

#[derive(clap::Args, Clone, Debug, Default)]
pub struct ClientArgs {
    /// Relay WebSocket URL.
    #[clap(long)]
    pub relay: Option<String>,

    /// STUN/TURN server URL (repeatable).
    #[clap(long = "stun")]
    pub stun_servers: Vec<String>,

    /// Gather loopback candidates (both peers on one machine).
    #[clap(long)]
    pub loopback: bool,
}

#[derive(clap::Args, Clone, Debug)]
pub struct SendArgs {
    /// Id of the receiving peer.
    pub peer: String,

    /// Files to send, in order.
    #[clap(required = true)]
    pub files: Vec<PathBuf>,

    #[command(flatten)]
    pub client: ClientArgs,
}

#[derive(clap::Args, Clone, Debug)]
pub struct ReceiveArgs {
    /// Where received files are written.
    #[clap(short, long)]
    pub out_dir: Option<PathBuf>,

    /// Exit after the first batch.
    #[clap(long)]
    pub once: bool,

    #[command(flatten)]
    pub client: ClientArgs,
}

// ── File configuration ─────────────────────────────────────────────────────────

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct FileConfig {
    pub verbose: Option<u8>,
    pub log_file: Option<PathBuf>,
    pub relay: RelaySection,
    pub client: ClientSection,
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct RelaySection {
    pub port: Option<u16>,
    pub allowed_origins: Vec<String>,
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct ClientSection {
    pub relay_url: Option<String>,
    pub stun_servers: Vec<String>,
    pub out_dir: Option<PathBuf>,
    pub dial_timeout_secs: Option<u64>,
    pub recovery_grace_secs: Option<u64>,
    pub heartbeat_secs: Option<u64>,
    /// Files below this many bytes ignore pause; `0` disables the exemption.
    pub min_pause_size: Option<u64>,
}

impl Args {
    /// Load Args from CLI + TOML file (if it exists).
    /// CLI values override those from the file.
    pub fn load() -> anyhow::Result<(Self, FileConfig)> {
        let mut cli_args = Args::parse();
        cli_args.log_file = cli_args.log_file.map(Self::resolve_path);

        let explicit = cli_args.config.is_some();
        let path = cli_args
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        match Self::from_file(&path)? {
            Some(file) => Ok((Self::merge(file.clone(), cli_args), file)),
            None if explicit => anyhow::bail!("config file {} not found", path.display()),
            None => Ok((cli_args, FileConfig::default())),
        }
    }

    /// Resolve a potentially relative path to an absolute one.
    fn resolve_path(p: PathBuf) -> PathBuf {
        if p.is_absolute() {
            p
        } else {
            std::env::current_dir().unwrap_or_default().join(p)
        }
    }

    /// Load config from a TOML file. `Ok(None)` when it does not exist.
    fn from_file(path: &Path) -> anyhow::Result<Option<FileConfig>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        let config = toml::from_str::<FileConfig>(&content)
            .map_err(|e| anyhow::anyhow!("invalid {}: {e}", path.display()))?;
        Ok(Some(config))
    }

    /// Merge file config into CLI args (CLI takes precedence).
    fn merge(file: FileConfig, mut cli: Args) -> Args {
        if cli.verbose == 0 {
            cli.verbose = file.verbose.unwrap_or(0);
        }
        if cli.log_file.is_none() {
            cli.log_file = file.log_file;
        }
        match &mut cli.command {
            Command::Relay(relay) => {
                if relay.port.is_none() {
                    relay.port = file.relay.port;
                }
                if relay.allowed_origins.is_empty() {
                    relay.allowed_origins = file.relay.allowed_origins;
                }
            }
            Command::Send(send) => merge_client(&mut send.client, &file.client),
            Command::Receive(recv) => {
                merge_client(&mut recv.client, &file.client);
                if recv.out_dir.is_none() {
                    recv.out_dir = file.client.out_dir.clone();
                }
            }
        }
        cli
    }
}

fn merge_client(cli: &mut ClientArgs, file: &ClientSection) {
    if cli.relay.is_none() {
        cli.relay = file.relay_url.clone();
    }
    if cli.stun_servers.is_empty() {
        cli.stun_servers = file.stun_servers.clone();
    }
}

impl RelayArgs {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }
}

impl ClientArgs {
    pub fn relay_url(&self) -> &str {
        self.relay.as_deref().unwrap_or(DEFAULT_RELAY_URL)
    }

    pub fn ice_servers(&self) -> Vec<String> {
        if self.stun_servers.is_empty() {
            DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect()
        } else {
            self.stun_servers.clone()
        }
    }
}

impl ClientSection {
    /// Session tunables with the file's overrides applied.
    pub fn session_config(&self) -> SessionConfig {
        let mut config = SessionConfig::default();
        if let Some(s) = self.dial_timeout_secs {
            config.dial_timeout = Duration::from_secs(s);
        }
        if let Some(s) = self.recovery_grace_secs {
            config.recovery_grace = Duration::from_secs(s);
        }
        if let Some(s) = self.heartbeat_secs {
            config.heartbeat_interval = Duration::from_secs(s);
            config.heartbeat_stale_after = Duration::from_secs(s * 3);
        }
        if let Some(size) = self.min_pause_size {
            config.transfer.min_pause_size = size;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        verbose = 1

        [relay]
        port = 8080
        allowed_origins = ["https://example.org"]

        [client]
        relay_url = "ws://relay.example.org/ws"
        out_dir = "downloads"
        dial_timeout_secs = 10
        min_pause_size = 0
    "#;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn file_fills_what_cli_leaves_out() {
        let file: FileConfig = toml::from_str(SAMPLE).unwrap();
        let args = Args::merge(file, parse(&["rtcportal", "receive"]));
        assert_eq!(args.verbose, 1);
        match args.command {
            Command::Receive(r) => {
                assert_eq!(r.client.relay_url(), "ws://relay.example.org/ws");
                assert_eq!(r.out_dir, Some(PathBuf::from("downloads")));
                assert_eq!(r.client.ice_servers().len(), DEFAULT_STUN_SERVERS.len());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn cli_wins_over_file() {
        let file: FileConfig = toml::from_str(SAMPLE).unwrap();
        let args = Args::merge(file, parse(&["rtcportal", "-vv", "relay", "--port", "9000"]));
        assert_eq!(args.verbose, 2);
        match args.command {
            Command::Relay(r) => {
                assert_eq!(r.port(), 9000);
                assert_eq!(r.allowed_origins, vec!["https://example.org".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn send_requires_files() {
        assert!(Args::try_parse_from(["rtcportal", "send", "peer"]).is_err());
        let args = parse(&["rtcportal", "send", "peer", "a.txt", "b.txt"]);
        match args.command {
            Command::Send(s) => {
                assert_eq!(s.peer, "peer");
                assert_eq!(s.files.len(), 2);
                assert_eq!(s.client.relay_url(), DEFAULT_RELAY_URL);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn session_overrides_from_file() {
        let file: FileConfig = toml::from_str(SAMPLE).unwrap();
        let config = file.client.session_config();
        assert_eq!(config.dial_timeout, Duration::from_secs(10));
        assert_eq!(config.transfer.min_pause_size, 0);
        assert_eq!(config.recovery_grace, SessionConfig::default().recovery_grace);
    }
}
