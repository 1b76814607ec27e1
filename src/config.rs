use std::net::SocketAddr;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

use crate::error::RelayError;
use crate::model::envelope::Role;
use crate::registry::RegistryOptions;
use crate::relay::EngineOptions;

/// Upper bound for a single signaling message.
pub const MAX_MESSAGE_SIZE_LIMIT: usize = 16 * 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "rover-signal")]
#[command(about = "Signaling relay pairing one video sender with one receiver")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the signaling relay.
    Server(ServerArgs),
    /// Run a headless sender or receiver peer against a relay.
    Peer(PeerArgs),
}

/// CLI arguments for the relay server.
#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address to listen on.
    #[arg(long, default_value = "0.0.0.0:8080", env = "ROVER_SIGNAL_LISTEN")]
    pub listen: SocketAddr,
    /// Send PeerLeft to the remaining peer when its counterpart disconnects.
    #[arg(long, default_value_t = true, action = ArgAction::Set, env = "ROVER_SIGNAL_NOTIFY_PEER_LEFT")]
    pub notify_peer_left: bool,
    /// Keep the latest unpaired offer and replay it to the next receiver.
    #[arg(long, default_value_t = true, action = ArgAction::Set, env = "ROVER_SIGNAL_REPLAY_OFFER")]
    pub replay_offer: bool,
    /// Per-client outbound queue capacity.
    #[arg(long, default_value = "256", env = "ROVER_SIGNAL_OUTBOUND_CAPACITY")]
    pub outbound_capacity: usize,
    /// Maximum WebSocket message size in bytes.
    #[arg(long, default_value = "65536", env = "ROVER_SIGNAL_MAX_MESSAGE_SIZE")]
    pub max_message_size: usize,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Sender,
    Receiver,
}

impl From<PeerRole> for Role {
    fn from(role: PeerRole) -> Self {
        match role {
            PeerRole::Sender => Role::Sender,
            PeerRole::Receiver => Role::Receiver,
        }
    }
}

/// CLI arguments for the demo peer.
#[derive(Args, Debug, Clone)]
pub struct PeerArgs {
    /// Role to declare to the relay.
    #[arg(long, value_enum)]
    pub role: PeerRole,
    /// Relay WebSocket URL.
    #[arg(long, default_value = "ws://127.0.0.1:8080", env = "ROVER_SIGNAL_RELAY")]
    pub relay: String,
    /// Interval between data channel heartbeats, in milliseconds.
    #[arg(long, default_value = "1000")]
    pub heartbeat_ms: u64,
}

/// Runtime configuration of the relay, derived from [`ServerArgs`].
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    pub notify_peer_left: bool,
    pub replay_offer: bool,
    pub outbound_capacity: usize,
    pub max_message_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            notify_peer_left: true,
            replay_offer: true,
            outbound_capacity: 256,
            max_message_size: 64 * 1024,
        }
    }
}

impl RelayConfig {
    /// Checks that every value is within acceptable bounds.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.outbound_capacity == 0 {
            return Err(RelayError::Config(
                "outbound_capacity must be greater than 0".into(),
            ));
        }
        if self.max_message_size == 0 {
            return Err(RelayError::Config(
                "max_message_size must be greater than 0".into(),
            ));
        }
        if self.max_message_size > MAX_MESSAGE_SIZE_LIMIT {
            return Err(RelayError::Config(format!(
                "max_message_size exceeds {MAX_MESSAGE_SIZE_LIMIT} bytes"
            )));
        }
        Ok(())
    }

    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            replay_offer: self.replay_offer,
            notify_peer_left: self.notify_peer_left,
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            outbound_capacity: self.outbound_capacity,
        }
    }
}

impl From<ServerArgs> for RelayConfig {
    fn from(args: ServerArgs) -> Self {
        Self {
            listen: args.listen,
            notify_peer_left: args.notify_peer_left,
            replay_offer: args.replay_offer,
            outbound_capacity: args.outbound_capacity,
            max_message_size: args.max_message_size,
        }
    }
}
