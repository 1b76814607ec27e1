//! Signaling relay for a two-party WebRTC session.
//!
//! The relay pairs exactly one video sender with one video receiver and
//! forwards their offer, answer and ICE candidate envelopes verbatim. The
//! `peer` module is a headless str0m-based sender/receiver that talks to it.

pub mod config;
pub mod error;
pub mod model;
pub mod peer;
pub mod registry;
pub mod relay;
pub mod server;
pub mod util;

pub use config::RelayConfig;
pub use error::RelayError;
pub use server::{run, start_relay, RelayHandle};
