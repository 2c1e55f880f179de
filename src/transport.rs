//! The byte-transport seam between the state machine and real sockets.
//!
//! The core consumes [`TransportEvent`] values and never touches a socket;
//! the driver translates between a [`Transport`] implementation and those
//! events. Anything that can dial a URL and shuttle text frames can back a
//! session: the crate ships a WebSocket adapter, and tests script events by
//! hand.

use async_trait::async_trait;

/// Inbound connection lifecycle events fed to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The connection completed its handshake and is usable.
    Open,
    /// A complete text frame arrived.
    Message(String),
    /// The connection failed. An `Error` is always followed by a `Close`.
    Error(String),
    /// The connection is gone.
    Close(CloseEvent),
}

/// Why a connection closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    /// Close code (1000 is normal closure).
    pub code: u16,
    /// Human-readable reason, possibly empty.
    pub reason: String,
}

impl CloseEvent {
    /// A normal closure (code 1000).
    pub fn normal() -> Self {
        Self {
            code: 1000,
            reason: String::new(),
        }
    }

    /// An abnormal closure (code 1006) with a reason.
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            code: 1006,
            reason: reason.into(),
        }
    }

    /// Whether this closure should not trigger reconnection.
    pub fn is_normal(&self) -> bool {
        self.code == 1000
    }
}

/// An established byte transport carrying text frames.
///
/// `next` returning `None` means the connection is finished; implementations
/// must emit a final [`TransportEvent::Close`] before that.
#[async_trait(?Send)]
pub trait Transport {
    /// Wait for the next event from the connection.
    async fn next(&mut self) -> Option<TransportEvent>;

    /// Send one text frame.
    async fn send(&mut self, frame: String) -> Result<(), String>;

    /// Close the connection with a code and reason.
    async fn close(&mut self, code: u16, reason: String);
}

/// Dials new connections for a session.
///
/// Separate from [`Transport`] because reconnection needs a fresh connection
/// per attempt while the session object lives across all of them.
#[async_trait(?Send)]
pub trait Connector {
    /// The connection type produced on success.
    type Conn: Transport;

    /// Dial `url`. A failed dial reports its error as a string; the session
    /// treats it like an abnormal close and schedules a retry.
    async fn connect(&mut self, url: &str) -> Result<Self::Conn, String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_event_normal_vs_abnormal() {
        assert!(CloseEvent::normal().is_normal());
        assert!(!CloseEvent::abnormal("connection reset").is_normal());
        assert_eq!(CloseEvent::abnormal("x").code, 1006);
    }
}
