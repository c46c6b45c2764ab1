//! bitchat node CLI
//!
//! Offline tools for inspecting mesh traffic and managing configuration.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use bitchat_node::config::{default_config_path, Config};
use bitchat_protocol::{
    derive_channel_key_with, is_valid_channel_name, optimal_block_size, unpad, ChatMessage, Packet,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// bitchat - mesh chat node tools.
#[derive(Parser, Debug)]
#[command(name = "bitchat")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Decode a hex-encoded packet and print its fields
    Inspect {
        /// Packet bytes as hex
        hex: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Derive a channel key and print its public commitment
    DeriveKey {
        /// Channel name, including the leading '#'
        #[arg(long)]
        channel: String,

        /// Channel password
        #[arg(long)]
        password: String,
    },

    /// Print the padded block size for a payload length
    BlockSize {
        /// Payload length in bytes
        len: usize,
    },

    /// Show or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for configuration management.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

/// Decoded view of a packet for display.
#[derive(Debug, Serialize)]
struct PacketSummary {
    version: u8,
    packet_type: String,
    timestamp: f64,
    sender_id: String,
    recipient_id: String,
    broadcast: bool,
    ttl: u8,
    payload_len: usize,
    signature_valid: bool,
    message: Option<ChatMessage>,
}

impl PacketSummary {
    fn new(packet: &Packet, network_key: &[u8]) -> Self {
        let message = if packet.packet_type.carries_chat_message() {
            ChatMessage::decode(&unpad(&packet.payload))
                .or_else(|_| ChatMessage::decode(&packet.payload))
                .ok()
        } else {
            None
        };

        Self {
            version: packet.version,
            packet_type: packet.packet_type.name(),
            timestamp: packet.timestamp,
            sender_id: packet.sender_id.to_hex(),
            recipient_id: packet.recipient_id.to_hex(),
            broadcast: packet.is_broadcast(),
            ttl: packet.ttl,
            payload_len: packet.payload.len(),
            signature_valid: packet.verify(network_key),
            message,
        }
    }

    fn print_text(&self) {
        println!("version:      {}", self.version);
        println!("type:         {}", self.packet_type);
        println!("timestamp:    {}", self.timestamp);
        println!("sender:       {}", self.sender_id);
        if self.broadcast {
            println!("recipient:    broadcast");
        } else {
            println!("recipient:    {}", self.recipient_id);
        }
        println!("ttl:          {}", self.ttl);
        println!("payload:      {} bytes", self.payload_len);
        println!(
            "signature:    {}",
            if self.signature_valid { "valid" } else { "INVALID" }
        );

        if let Some(message) = &self.message {
            println!();
            println!("message id:   {}", message.id);
            println!("from:         {} ({})", message.sender, message.sender_peer_id);
            if let Some(channel) = &message.channel {
                println!("channel:      {}", channel);
            }
            if message.is_encrypted {
                println!("content:      <encrypted>");
            } else {
                println!("content:      {}", message.content);
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Initialize tracing; the guard flushes the log file on exit
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.node.log_level.to_lowercase()
    };
    let _log_guard = init_logging(&level, config.node.log_path().as_deref());

    tracing::debug!("Using config file: {:?}", config_path);

    // Validate configuration
    config.validate()?;

    match cli.command {
        Commands::Inspect { hex, json } => inspect(&config, &hex, json)?,
        Commands::DeriveKey { channel, password } => derive_key(&config, &channel, &password)?,
        Commands::BlockSize { len } => println!("{}", optimal_block_size(len)),
        Commands::Config(ConfigCommands::Show) => print!("{}", config.to_toml()?),
        Commands::Config(ConfigCommands::Init { force }) => init_config(&config_path, force)?,
    }

    Ok(())
}

/// Installs the stderr subscriber, plus a daily rolling file when
/// `log_dir` is set.
fn init_logging(level: &str, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "bitchat.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    guard
}

fn inspect(config: &Config, hex_input: &str, json: bool) -> anyhow::Result<()> {
    let bytes = decode_hex(hex_input)?;
    let Some(packet) = Packet::decode(&bytes) else {
        bail!("Not a valid bitchat packet ({} bytes)", bytes.len());
    };

    let network_key = Sha256::digest(config.mesh.network_key.as_bytes());
    let summary = PacketSummary::new(&packet, &network_key);

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        summary.print_text();
    }
    Ok(())
}

fn derive_key(config: &Config, channel: &str, password: &str) -> anyhow::Result<()> {
    if !is_valid_channel_name(channel) {
        bail!("Invalid channel name: {channel}");
    }
    let key = derive_channel_key_with(&config.crypto, password, channel)?;
    println!("{}", key.commitment().to_hex());
    Ok(())
}

fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        bail!(
            "Config file already exists: {} (use --force to overwrite)",
            path.display()
        );
    }
    Config::default().save(path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

/// Decodes hex, ignoring whitespace and an optional `0x` prefix.
fn decode_hex(input: &str) -> anyhow::Result<Vec<u8>> {
    let cleaned: String = input.split_whitespace().collect();
    let cleaned = cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
        .unwrap_or(&cleaned);
    hex::decode(cleaned).context("Invalid hex input")
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitchat_protocol::{pad_to_optimal, PacketType, PeerId};
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        // Verify the CLI structure is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_inspect_command() {
        let cli = Cli::try_parse_from(["bitchat", "inspect", "01ff"]).unwrap();
        match cli.command {
            Commands::Inspect { hex, json } => {
                assert_eq!(hex, "01ff");
                assert!(!json);
            }
            _ => panic!("Expected Inspect command"),
        }
    }

    #[test]
    fn test_inspect_json() {
        let cli = Cli::try_parse_from(["bitchat", "inspect", "--json", "01ff"]).unwrap();
        assert!(matches!(cli.command, Commands::Inspect { json: true, .. }));
    }

    #[test]
    fn test_derive_key_command() {
        let cli = Cli::try_parse_from([
            "bitchat",
            "derive-key",
            "--channel",
            "#secret",
            "--password",
            "hunter2",
        ])
        .unwrap();
        match cli.command {
            Commands::DeriveKey { channel, password } => {
                assert_eq!(channel, "#secret");
                assert_eq!(password, "hunter2");
            }
            _ => panic!("Expected DeriveKey command"),
        }
    }

    #[test]
    fn test_derive_key_requires_password() {
        assert!(Cli::try_parse_from(["bitchat", "derive-key", "--channel", "#x"]).is_err());
    }

    #[test]
    fn test_block_size_command() {
        let cli = Cli::try_parse_from(["bitchat", "block-size", "300"]).unwrap();
        assert!(matches!(cli.command, Commands::BlockSize { len: 300 }));
        assert!(Cli::try_parse_from(["bitchat", "block-size", "-1"]).is_err());
    }

    #[test]
    fn test_config_commands() {
        let cli = Cli::try_parse_from(["bitchat", "config", "show"]).unwrap();
        assert!(matches!(cli.command, Commands::Config(ConfigCommands::Show)));

        let cli = Cli::try_parse_from(["bitchat", "config", "init", "--force"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Config(ConfigCommands::Init { force: true })
        ));
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from([
            "bitchat",
            "block-size",
            "10",
            "-v",
            "--config",
            "/tmp/bitchat.toml",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/bitchat.toml")));
    }

    #[test]
    fn test_decode_hex() {
        assert_eq!(decode_hex("0x01ff").unwrap(), vec![0x01, 0xff]);
        assert_eq!(decode_hex("01 ff\n").unwrap(), vec![0x01, 0xff]);
        assert!(decode_hex("zz").is_err());
    }

    #[test]
    fn test_packet_summary() {
        let key = Sha256::digest(b"mesh");
        let message = ChatMessage::new("alice", "hi there", "peer1").with_channel("#general");
        let payload = pad_to_optimal(&message.encode().unwrap()).unwrap();
        let packet = Packet::new(
            PacketType::BroadcastMessage,
            PeerId::from_name("peer1"),
            PeerId::BROADCAST,
            7,
            payload,
        )
        .signed(&key);

        let summary = PacketSummary::new(&packet, &key);
        assert_eq!(summary.packet_type, "broadcast_message");
        assert!(summary.broadcast);
        assert!(summary.signature_valid);
        assert_eq!(summary.payload_len, 256);
        assert_eq!(summary.message.as_ref().map(|m| m.content.as_str()), Some("hi there"));

        let other_key = Sha256::digest(b"other");
        assert!(!PacketSummary::new(&packet, &other_key).signature_valid);

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["ttl"], 7);
        assert_eq!(json["message"]["sender"], "alice");
    }

    #[test]
    fn test_init_config_refuses_overwrite() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        init_config(&path, false).unwrap();
        assert!(init_config(&path, false).is_err());
        init_config(&path, true).unwrap();
        assert_eq!(Config::load(&path).unwrap(), Config::default());
    }
}
