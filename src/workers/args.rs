//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments via clap
//! - TOML configuration file
//! - Merging CLI with file config (CLI takes precedence)

use clap::Parser;
use peerlink::core::config::{IceConfig, TransferLimits, TurnServer, CONNECTION_REQUEST_TIMEOUT};
use peerlink::core::error::ConfigError;
use peerlink::core::node::NodeConfig;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// peerlink - relay-signaled peer connection and file transfer demo.
///
/// Starts two peers on an in-process relay, connects them, and sends one
/// file from the first to the second.
#[derive(Parser, Deserialize, Clone, Debug)]
#[command(author, version, about)]
#[command(propagate_version = true)]
#[serde(default)]
pub struct Args {
    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// TOML configuration file. Defaults to ./peerlink.toml when present.
    #[clap(long)]
    pub conf: Option<PathBuf>,

    /// File to send. Without it a generated payload is sent.
    #[clap(short, long)]
    pub file: Option<PathBuf>,

    /// Size in bytes of the generated payload.
    #[clap(long, default_value_t = 256 * 1024)]
    pub size: usize,

    /// Transport between the peers: `memory` or `webrtc`.
    #[clap(long, default_value_t = TransportKind::Memory)]
    pub transport: TransportKind,

    /// User id of the sending peer.
    #[clap(long, default_value = "alice")]
    pub from: String,

    /// User id of the receiving peer.
    #[clap(long, default_value = "bob")]
    pub to: String,

    /// Display name the sender announces with its request.
    #[clap(long)]
    pub display_name: Option<String>,

    /// Have the receiver decline the request instead of accepting it.
    #[clap(long)]
    pub reject: bool,

    /// STUN server URL (repeatable). Defaults to public servers.
    #[clap(long = "stun")]
    pub stun_urls: Vec<String>,

    /// TURN server URL.
    #[clap(long)]
    pub turn_url: Option<String>,

    #[clap(long)]
    pub turn_username: Option<String>,

    #[clap(long)]
    pub turn_credential: Option<String>,

    /// Gather loopback ICE candidates (both peers on one host).
    #[clap(long)]
    pub include_loopback: bool,

    /// Payload bytes per chunk.
    #[clap(long)]
    pub chunk_size: Option<usize>,

    /// Seconds an unanswered connection request stays pending.
    #[clap(long)]
    pub request_timeout: Option<u64>,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            verbose: 0,
            conf: None,
            file: None,
            size: 256 * 1024,
            transport: TransportKind::Memory,
            from: "alice".into(),
            to: "bob".into(),
            display_name: None,
            reject: false,
            stun_urls: Vec::new(),
            turn_url: None,
            turn_username: None,
            turn_credential: None,
            include_loopback: false,
            chunk_size: None,
            request_timeout: None,
        }
    }
}

impl Args {
    /// Load Args from CLI + TOML file (if it exists).
    /// CLI values override those from the file.
    pub fn load() -> Self {
        let mut cli_args = Args::parse();
        cli_args.file = cli_args.file.map(Self::resolve_path);

        let path = cli_args
            .conf
            .clone()
            .unwrap_or_else(|| PathBuf::from("peerlink.toml"));
        if let Some(file_args) = Self::from_file(&path) {
            return Self::merge(file_args, cli_args);
        }

        cli_args
    }

    /// Resolve a potentially relative path to an absolute one.
    fn resolve_path(p: PathBuf) -> PathBuf {
        if p.is_absolute() {
            p
        } else {
            std::env::current_dir().unwrap_or_default().join(p)
        }
    }

    /// Load args from a TOML file.
    fn from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        let content = fs::read_to_string(path).ok()?;
        match toml::from_str::<Args>(&content) {
            Ok(args) => Some(args),
            Err(e) => {
                eprintln!("Ignoring {}: {e}", path.display());
                None
            }
        }
    }

    /// Merge file args with CLI args (CLI takes precedence).
    fn merge(mut file: Args, cli: Args) -> Args {
        let defaults = Args::default();
        if cli.verbose > 0 {
            file.verbose = cli.verbose;
        }
        if cli.conf.is_some() {
            file.conf = cli.conf;
        }
        if cli.file.is_some() {
            file.file = cli.file;
        }
        if cli.size != defaults.size {
            file.size = cli.size;
        }
        if cli.transport != defaults.transport {
            file.transport = cli.transport;
        }
        if cli.from != defaults.from {
            file.from = cli.from;
        }
        if cli.to != defaults.to {
            file.to = cli.to;
        }
        if cli.display_name.is_some() {
            file.display_name = cli.display_name;
        }
        if cli.reject {
            file.reject = true;
        }
        if !cli.stun_urls.is_empty() {
            file.stun_urls = cli.stun_urls;
        }
        if cli.turn_url.is_some() {
            file.turn_url = cli.turn_url;
        }
        if cli.turn_username.is_some() {
            file.turn_username = cli.turn_username;
        }
        if cli.turn_credential.is_some() {
            file.turn_credential = cli.turn_credential;
        }
        if cli.include_loopback {
            file.include_loopback = true;
        }
        if cli.chunk_size.is_some() {
            file.chunk_size = cli.chunk_size;
        }
        if cli.request_timeout.is_some() {
            file.request_timeout = cli.request_timeout;
        }
        file
    }

    pub fn ice_config(&self) -> IceConfig {
        let mut ice = IceConfig::default();
        if !self.stun_urls.is_empty() {
            ice.stun_urls = self.stun_urls.clone();
        }
        ice.turn = self.turn_url.as_ref().map(|url| TurnServer {
            url: url.clone(),
            username: self.turn_username.clone().unwrap_or_default(),
            credential: self.turn_credential.clone().unwrap_or_default(),
        });
        ice.include_loopback = self.include_loopback;
        ice
    }

    /// Transfer limits with the chunk size override applied. A chunk that
    /// cannot fit between the flow-control marks is refused here rather
    /// than stalling the first transfer.
    pub fn limits(&self) -> Result<TransferLimits, ConfigError> {
        let mut limits = TransferLimits::default();
        if let Some(chunk) = self.chunk_size {
            limits.chunk_size = chunk;
        }
        limits.validate()?;
        Ok(limits)
    }

    pub fn node_config(
        &self,
        user_id: &str,
        display_name: Option<String>,
    ) -> Result<NodeConfig, ConfigError> {
        let mut config = NodeConfig::new(user_id);
        config.display_name = display_name;
        config.limits = self.limits()?;
        config.request_timeout = self
            .request_timeout
            .map_or(CONNECTION_REQUEST_TIMEOUT, Duration::from_secs);
        Ok(config)
    }
}

// ── Transport Option ─────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// In-process link; no network involved.
    Memory,
    /// Real WebRTC over loopback or the configured ICE servers.
    Webrtc,
}

impl FromStr for TransportKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(Self::Memory),
            "webrtc" => Ok(Self::Webrtc),
            other => Err(anyhow::anyhow!("unknown transport {other:?} (memory|webrtc)")),
        }
    }
}

impl Display for TransportKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => f.write_str("memory"),
            Self::Webrtc => f.write_str("webrtc"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_file() {
        let file: Args = toml::from_str(
            r#"
            transport = "webrtc"
            to = "carol"
            chunk_size = 4096
            stun_urls = ["stun:example.org:3478"]
            "#,
        )
        .unwrap();
        let cli = Args::parse_from(["peerlink", "--to", "dave", "-vv"]);

        let merged = Args::merge(file, cli);
        assert_eq!(merged.transport, TransportKind::Webrtc);
        assert_eq!(merged.to, "dave");
        assert_eq!(merged.from, "alice");
        assert_eq!(merged.verbose, 2);
        assert_eq!(merged.limits().unwrap().chunk_size, 4096);
        assert_eq!(merged.ice_config().stun_urls, vec!["stun:example.org:3478".to_string()]);
    }

    #[test]
    fn test_node_config_from_args() {
        let args = Args::parse_from(["peerlink", "--request-timeout", "5", "--turn-url", "turn:t.example"]);
        let config = args.node_config("alice", Some("Alice".into())).unwrap();
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.display_name.as_deref(), Some("Alice"));
        assert_eq!(args.ice_config().turn.unwrap().username, "");
        assert_eq!(args.transport, TransportKind::Memory);
    }

    #[test]
    fn test_chunk_wider_than_watermark_gap_refused() {
        let args = Args::parse_from(["peerlink", "--chunk-size", "8388608"]);
        assert!(matches!(args.limits(), Err(ConfigError::ChunkSize { .. })));
        assert!(args.node_config("alice", None).is_err());

        let zero = Args::parse_from(["peerlink", "--chunk-size", "0"]);
        assert!(zero.limits().is_err());
    }

    #[test]
    fn test_transport_kind_parse() {
        assert_eq!("webrtc".parse::<TransportKind>().unwrap(), TransportKind::Webrtc);
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }
}
