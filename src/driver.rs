//! The async pump between a session and a real transport.
//!
//! The state machine produces effects and deadlines; [`run`] is the only
//! place they meet actual IO. It drains effects into the connector and the
//! live connection, then waits on whichever comes first: the next transport
//! event or the earliest timer deadline.
//!
//! `run` returns when the session can no longer make progress on its own:
//! no live connection, no pending deadline, and no queued effects. That is
//! the state after a clean disconnect or after the reload guard gives up.

use crate::session::{Session, Storage};
use crate::socket::Effect;
use crate::timer::Clock;
use crate::transport::{CloseEvent, Connector, Transport, TransportEvent};

enum Step {
    Event(Option<TransportEvent>),
    Tick,
}

/// Pump `session` against connections dialed through `connector` until the
/// session goes quiescent.
pub async fn run<K, S, C>(session: &mut Session<K, S>, connector: &mut C)
where
    K: Clock + Clone,
    S: Storage,
    C: Connector,
{
    let mut transport: Option<C::Conn> = None;

    loop {
        // Drain effects until none remain; executing one can enqueue more.
        loop {
            let effects = session.take_effects();
            if effects.is_empty() {
                break;
            }
            for effect in effects {
                match effect {
                    Effect::Connect { url } => match connector.connect(&url).await {
                        Ok(conn) => transport = Some(conn),
                        Err(error) => {
                            tracing::warn!(%error, "dial failed");
                            session.handle_transport_event(TransportEvent::Error(error.clone()));
                            session.handle_transport_event(TransportEvent::Close(
                                CloseEvent::abnormal(error),
                            ));
                        }
                    },
                    Effect::Send(message) => {
                        let Some(conn) = transport.as_mut() else {
                            continue;
                        };
                        let frame = match message.encode() {
                            Ok(frame) => frame,
                            Err(error) => {
                                tracing::warn!(%error, "dropping unencodable envelope");
                                continue;
                            }
                        };
                        if let Err(error) = conn.send(frame).await {
                            session.handle_transport_event(TransportEvent::Error(error));
                        }
                    }
                    Effect::Close { code, reason } => {
                        if let Some(conn) = transport.as_mut() {
                            conn.close(code, reason).await;
                        }
                    }
                }
            }
        }

        let deadline = session.next_deadline();
        if transport.is_none() && deadline.is_none() {
            return;
        }

        let step = match (transport.as_mut(), deadline) {
            (Some(conn), None) => Step::Event(conn.next().await),
            (None, Some(at)) => {
                tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await;
                Step::Tick
            }
            (Some(conn), Some(at)) => {
                tokio::select! {
                    event = conn.next() => Step::Event(event),
                    _ = tokio::time::sleep_until(tokio::time::Instant::from_std(at)) => Step::Tick,
                }
            }
            (None, None) => return,
        };

        match step {
            Step::Event(Some(event)) => session.handle_transport_event(event),
            Step::Event(None) => transport = None,
            Step::Tick => session.tick(),
        }
    }
}
