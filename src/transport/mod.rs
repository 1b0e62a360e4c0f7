//! Transport layer between the connection loop and a client.
//!
//! Provides the `Connection` trait the session loop is written against, the
//! wire message types, and the WebSocket implementation.

pub mod protocol;
pub mod websocket;

pub use protocol::Reply;
pub use websocket::WebSocketConnection;

use async_trait::async_trait;
use thiserror::Error;

/// Failures of the connection itself, never of the evaluated code.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection is closed")]
    Closed,

    #[error("expected a text message, got {0}")]
    UnexpectedMessage(&'static str),

    #[error("websocket error: {0}")]
    Socket(#[from] axum::Error),

    #[error("failed to encode reply: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One full-duplex, ordered, message-oriented client connection.
///
/// Implementations track liveness themselves: once the peer has closed, or a
/// close has been sent, `is_open` reports `false` and `close` is a no-op.
#[async_trait]
pub trait Connection: Send {
    /// Wait for the next submission. `Ok(None)` means the peer closed cleanly.
    async fn recv_code(&mut self) -> Result<Option<String>, TransportError>;

    /// Send one reply.
    async fn send_reply(&mut self, reply: &Reply) -> Result<(), TransportError>;

    /// Whether the connection still looks writable.
    fn is_open(&self) -> bool;

    /// Close the connection. Safe to call on an already-closed connection.
    async fn close(&mut self) -> Result<(), TransportError>;
}
