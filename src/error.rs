//! Error types for socket, channel, and wire operations.

use std::time::Duration;
use thiserror::Error;

/// Connection-level failures surfaced to `on_error` callbacks.
///
/// None of these are fatal: heartbeat and transport failures route into the
/// session's reconnect policy, join failures into the per-channel rejoin
/// policy, and push timeouts into the push's `"timeout"` status callbacks.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SocketError {
    /// A dial attempt did not complete within the configured deadline.
    #[error("connect attempt timed out")]
    ConnectTimeout,

    /// The previous heartbeat got no reply before the next interval.
    /// Treated as connection loss.
    #[error("heartbeat reply not received within interval")]
    HeartbeatTimeout,

    /// The remote rejected a channel join.
    #[error("join rejected: {reason}")]
    Join {
        /// Reason carried by the error reply payload.
        reason: String,
    },

    /// No reply arrived for a push within its deadline.
    #[error("no reply within {0:?}")]
    PushTimeout(Duration),

    /// The underlying connection failed.
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Usage errors from channel operations invoked through the socket.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// The channel id does not name a registered channel.
    #[error("unknown channel")]
    UnknownChannel,

    /// The push id does not name a live push on that channel.
    #[error("unknown push")]
    UnknownPush,

    /// `push` was called on a channel that never attempted a join.
    #[error("cannot push {event:?} to {topic:?} before joining")]
    NotJoined {
        /// The channel's topic.
        topic: String,
        /// The event that was pushed.
        event: String,
    },
}

/// Wire envelope decode errors.
#[derive(Debug, Error)]
pub enum WireError {
    /// The frame is not valid JSON.
    #[error("invalid frame: {0}")]
    Json(#[from] serde_json::Error),

    /// The frame is not a 5-element array.
    #[error("frame is not a 5-element envelope array")]
    BadShape,

    /// Topic or event is not a string.
    #[error("envelope topic and event must be strings")]
    BadFields,
}
