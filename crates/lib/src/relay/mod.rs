//! Relay: hand-rolled WebSocket transport that pairs two peers into a room and relays their
//! messages.
//!
//! One HTTP port serves static assets and WebSocket upgrades. After the handshake the stream
//! is owned by a session task; the registry tracks clients and rooms; a heartbeat task evicts
//! peers that stop answering pings.

mod error;
mod frame;
mod handshake;
mod heartbeat;
mod pairing;
mod protocol;
mod registry;
mod server;
mod session;

pub use error::ConnectionError;
pub use frame::{encode_text, read_frame, write_frame, Frame, OpCode};
pub use handshake::{accept_key, is_upgrade_request, HandshakeError};
pub use heartbeat::{Sweep, DEFAULT_INTERVAL};
pub use pairing::{default_name, Admission, Placement};
pub use protocol::{ClientMessage, ServerMessage};
pub use registry::{
    ClientId, ClientInfo, ConnectionHandle, Registry, RoomTicket, SendError, OUTBOUND_CAPACITY,
};
pub use server::run_relay;
pub use session::serve;
