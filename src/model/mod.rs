//! Data models for the signaling relay
//!
//! This module contains the core data structures shared by the relay and the
//! demo peer: connected clients, the wire envelope, messages propagated back to
//! clients, and the heartbeat payload exchanged over the data channel.

pub mod client;
pub mod envelope;
pub mod payload;
pub mod propagated;
