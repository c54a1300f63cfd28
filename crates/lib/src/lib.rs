//! duet core library — WebSocket framing, room pairing, relay, and heartbeats
//! for a two-party signaling server. Used by the `duet` CLI.

pub mod config;
pub mod relay;
