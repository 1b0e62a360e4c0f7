//! WebSocket transport backed by axum.
//!
//! Text frames carry submissions; replies go out as JSON text frames. Ping and
//! pong frames are answered by axum and skipped here.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use tracing::{debug, trace};

use super::{Connection, Reply, TransportError};

/// An accepted WebSocket connection.
pub struct WebSocketConnection {
    socket: WebSocket,
    open: bool,
}

impl WebSocketConnection {
    pub const fn new(socket: WebSocket) -> Self {
        Self { socket, open: true }
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn recv_code(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            match self.socket.recv().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.as_str().to_owned())),
                Some(Ok(Message::Binary(_))) => {
                    return Err(TransportError::UnexpectedMessage("binary"));
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => trace!("Skipping control frame"),
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Peer sent close");
                    // The close handshake is completed by the socket itself.
                    self.open = false;
                    return Ok(None);
                }
                Some(Err(e)) => return Err(TransportError::Socket(e)),
                None => {
                    self.open = false;
                    return Ok(None);
                }
            }
        }
    }

    async fn send_reply(&mut self, reply: &Reply) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        let json = serde_json::to_string(reply)?;
        if let Err(e) = self.socket.send(Message::Text(json.into())).await {
            self.open = false;
            return Err(TransportError::Socket(e));
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.socket.send(Message::Close(None)).await?;
        Ok(())
    }
}
