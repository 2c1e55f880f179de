//! # Tether - Multiplexed Real-Time Channel Client
//!
//! Tether is a client for multiplexed, reconnecting, real-time channel
//! transports. One connection carries many named topic subscriptions
//! ("channels"); each outbound request ("push") correlates with at most one
//! reply by a monotonically increasing ref.
//!
//! # Overview
//!
//! - **Socket**: connection lifecycle, heartbeats, the ref counter, the
//!   channel registry, and inbound demultiplexing
//! - **Channel**: per-topic join/leave state machines with join-epoch
//!   staleness filtering and a FIFO buffer for pushes made before join
//! - **Push**: timeout-bounded request/reply with per-status hooks and
//!   exactly-once resolution
//! - **Session**: reconnection with exponential backoff, jitter, and a
//!   reload guard that stops flapping connections
//! - **Presence**: diff-based reconciliation of the server's presence set
//!
//! The core is sans-IO: [`Socket`](socket::Socket) consumes
//! [`TransportEvent`](transport::TransportEvent)s and clock ticks, and emits
//! [`Effect`](socket::Effect)s plus user callbacks. [`driver::run`] pumps a
//! real connection; tests drive the same machine with scripted events and a
//! [`ManualClock`](timer::ManualClock).
//!
//! # Quick Start
//!
//! ```ignore
//! use serde_json::json;
//! use tether::session::{Session, SessionOptions};
//! use tether::socket::SocketOptions;
//! use tether::websocket::WebSocketConnector;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let mut session = Session::new(
//!         "ws://localhost:4000/socket/websocket",
//!         SocketOptions::default(),
//!         SessionOptions::default(),
//!     );
//!
//!     let room = session.socket_mut().channel("room:lobby", json!({}));
//!     session.socket_mut().on(room, "new_msg", Box::new(|payload| {
//!         println!("new_msg: {payload}");
//!     })).unwrap();
//!     session.socket_mut().join(room).unwrap();
//!     session.connect();
//!
//!     tether::driver::run(&mut session, &mut WebSocketConnector).await;
//! }
//! ```

#![deny(missing_docs)]

pub mod backoff;
pub mod channel;
pub mod driver;
pub mod error;
pub mod message;
pub mod presence;
pub mod push;
pub mod session;
pub mod socket;
pub mod timer;
pub mod transport;
pub mod websocket;

pub use channel::{BindingRef, Channel, ChannelId, ChannelState, PushId};
pub use error::{ChannelError, SocketError, WireError};
pub use message::{Message, Reply};
pub use presence::{Presence, PresenceDiff, PresenceEntry, PresenceState};
pub use session::{Session, SessionOptions, SessionStatus};
pub use socket::{ConnectionState, Effect, Params, Socket, SocketOptions};
pub use transport::{CloseEvent, Connector, Transport, TransportEvent};
