//! Byte-stream transport abstraction.
//!
//! Defines the `TransportPort` (listening side) and `Connection` (one
//! accepted peer) traits, allowing different implementations (std TCP,
//! mock, board-specific network stacks).

use std::net::SocketAddr;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to listen on port {port}: {message}")]
    ListenFailed { port: u16, message: String },

    #[error("Accept failed: {0}")]
    AcceptFailed(String),

    #[error("Not listening")]
    NotListening,

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Peer disconnected")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One accepted peer.
///
/// Reads never block: `read`/`peek` return `None` when nothing is buffered.
pub trait Connection {
    /// Number of bytes that can be read without waiting.
    fn available(&mut self) -> usize;

    /// Next byte without consuming it.
    fn peek(&mut self) -> Option<u8>;

    /// Consume the next byte.
    fn read(&mut self) -> Option<u8>;

    /// Read up to `buf.len()` immediately available bytes.
    fn read_chunk(&mut self, buf: &mut [u8]) -> usize {
        let mut n = 0;
        while n < buf.len() {
            match self.read() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    /// Write raw bytes to the peer.
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Push out anything buffered for the peer.
    fn flush(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Whether the peer is still attached.
    fn connected(&mut self) -> bool;

    fn remote_address(&self) -> Option<SocketAddr>;

    /// Drop the peer.
    fn close(&mut self);
}

/// Listening side. Services a single peer at a time.
pub trait TransportPort {
    type Connection: Connection;

    /// Start listening on `port`.
    fn listen(&mut self, port: u16) -> Result<(), TransportError>;

    /// Current peer, accepting a new one when none is held.
    ///
    /// Returns `None` when no peer is attached. A second inbound peer is not
    /// accepted while the current one is still connected.
    fn accept(&mut self) -> Result<Option<&mut Self::Connection>, TransportError>;

    /// Stop listening and drop the current peer.
    fn shutdown(&mut self);
}
