//! WebSocket implementations of [`Transport`] and [`Connector`] backed by
//! tokio-tungstenite.

use crate::transport::{CloseEvent, Connector, Transport, TransportEvent};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Dials WebSocket connections with `connect_async`.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

#[async_trait(?Send)]
impl Connector for WebSocketConnector {
    type Conn = WebSocketTransport;

    async fn connect(&mut self, url: &str) -> Result<Self::Conn, String> {
        let (stream, _response) = connect_async(url).await.map_err(|e| e.to_string())?;
        Ok(WebSocketTransport {
            stream,
            opened: false,
            closed: false,
            pending_close: None,
        })
    }
}

/// One established WebSocket connection.
///
/// Binary and ping/pong frames are handled inside `next`; only text frames
/// and lifecycle events surface to the state machine.
pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    opened: bool,
    closed: bool,
    pending_close: Option<CloseEvent>,
}

#[async_trait(?Send)]
impl Transport for WebSocketTransport {
    async fn next(&mut self) -> Option<TransportEvent> {
        if !self.opened {
            // The tungstenite handshake already completed in connect, so the
            // first event is always Open.
            self.opened = true;
            return Some(TransportEvent::Open);
        }
        if let Some(event) = self.pending_close.take() {
            self.closed = true;
            return Some(TransportEvent::Close(event));
        }
        if self.closed {
            return None;
        }
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    return Some(TransportEvent::Message(text));
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    self.closed = true;
                    let event = match frame {
                        Some(frame) => CloseEvent {
                            code: frame.code.into(),
                            reason: frame.reason.into_owned(),
                        },
                        None => CloseEvent::abnormal("closed without a close frame"),
                    };
                    return Some(TransportEvent::Close(event));
                }
                Some(Ok(WsMessage::Ping(_))) => {
                    // tungstenite queues the pong itself; flush it out.
                    if self.stream.flush().await.is_err() {
                        self.closed = true;
                        return Some(TransportEvent::Close(CloseEvent::abnormal(
                            "flush failed",
                        )));
                    }
                }
                Some(Ok(_)) => {
                    // Binary / pong / raw frames are not part of the protocol.
                    continue;
                }
                Some(Err(error)) => {
                    tracing::warn!(%error, "websocket stream error");
                    self.pending_close = Some(CloseEvent::abnormal(error.to_string()));
                    return Some(TransportEvent::Error(error.to_string()));
                }
                None => {
                    self.closed = true;
                    return Some(TransportEvent::Close(CloseEvent::abnormal(
                        "stream ended",
                    )));
                }
            }
        }
    }

    async fn send(&mut self, frame: String) -> Result<(), String> {
        self.stream
            .send(WsMessage::Text(frame))
            .await
            .map_err(|e| e.to_string())
    }

    async fn close(&mut self, code: u16, reason: String) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        };
        let _ = self.stream.send(WsMessage::Close(Some(frame))).await;
        self.closed = true;
    }
}
