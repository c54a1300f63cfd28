//! Why a relay connection ended.

use std::io;

/// Terminal outcome of a connection's read loop. Every variant takes the same teardown path;
/// the tag only changes how the end is logged.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Peer sent a close frame (normal close).
    #[error("closed by peer (code {code}, reason {reason:?})")]
    Closed { code: u16, reason: String },

    /// Malformed or unsupported frame.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// Text frame that is not a valid client message.
    #[error("invalid client message: {0}")]
    InvalidMessage(#[from] serde_json::Error),

    /// Socket read/write failed, including truncated frames.
    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),

    /// Closed from the server side (heartbeat timeout, failed write, or shutdown).
    #[error("closed by server")]
    Evicted,
}

impl ConnectionError {
    /// True when the peer misbehaved, as opposed to going away.
    pub fn is_violation(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::InvalidMessage(_))
    }
}
