//! std TCP transport implementation.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::traits::{Connection, TransportError, TransportPort};

const READ_CHUNK: usize = 1460;
const WRITE_RETRY_LIMIT: u32 = 5000;

/// Non-blocking TCP peer with a small receive buffer so `available` and
/// `peek` can be answered without consuming.
pub struct TcpConnection {
    stream: TcpStream,
    rx: VecDeque<u8>,
    peer: Option<SocketAddr>,
    open: bool,
}

impl TcpConnection {
    fn new(stream: TcpStream) -> Result<Self, TransportError> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr().ok();
        Ok(Self {
            stream,
            rx: VecDeque::new(),
            peer,
            open: true,
        })
    }

    /// Pull whatever the socket has ready into the receive buffer.
    fn fill(&mut self) {
        if !self.open {
            return;
        }
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    debug!(peer = ?self.peer, "Peer closed connection");
                    self.open = false;
                    return;
                }
                Ok(n) => self.rx.extend(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(peer = ?self.peer, error = %e, "Read failed");
                    self.open = false;
                    return;
                }
            }
        }
    }
}

impl Connection for TcpConnection {
    fn available(&mut self) -> usize {
        self.fill();
        self.rx.len()
    }

    fn peek(&mut self) -> Option<u8> {
        if self.rx.is_empty() {
            self.fill();
        }
        self.rx.front().copied()
    }

    fn read(&mut self) -> Option<u8> {
        if self.rx.is_empty() {
            self.fill();
        }
        self.rx.pop_front()
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> usize {
        if self.rx.is_empty() {
            self.fill();
        }
        let n = buf.len().min(self.rx.len());
        for (slot, b) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *slot = b;
        }
        n
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        if !self.open {
            return Err(TransportError::Disconnected);
        }
        let mut sent = 0;
        let mut retries = 0;
        while sent < data.len() {
            match self.stream.write(&data[sent..]) {
                Ok(0) => {
                    self.open = false;
                    return Err(TransportError::Disconnected);
                }
                Ok(n) => sent += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    retries += 1;
                    if retries > WRITE_RETRY_LIMIT {
                        return Err(TransportError::WriteFailed("peer not reading".into()));
                    }
                    thread::sleep(Duration::from_millis(1));
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    self.open = false;
                    return Err(TransportError::WriteFailed(e.to_string()));
                }
            }
        }
        Ok(sent)
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        self.stream
            .flush()
            .map_err(|e| TransportError::WriteFailed(e.to_string()))
    }

    fn connected(&mut self) -> bool {
        self.fill();
        self.open
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        self.open = false;
    }
}

/// TCP listening port holding at most one peer.
#[derive(Default)]
pub struct TcpPort {
    listener: Option<TcpListener>,
    active: Option<TcpConnection>,
}

impl TcpPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address actually bound (useful when listening on port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }
}

impl TransportPort for TcpPort {
    type Connection = TcpConnection;

    #[instrument(skip(self))]
    fn listen(&mut self, port: u16) -> Result<(), TransportError> {
        let listener = TcpListener::bind(("0.0.0.0", port)).map_err(|e| {
            TransportError::ListenFailed {
                port,
                message: e.to_string(),
            }
        })?;
        listener.set_nonblocking(true)?;
        info!(addr = ?listener.local_addr().ok(), "Listening");
        self.listener = Some(listener);
        Ok(())
    }

    fn accept(&mut self) -> Result<Option<&mut TcpConnection>, TransportError> {
        let listener = self.listener.as_ref().ok_or(TransportError::NotListening)?;

        let keep = match self.active.as_mut() {
            Some(conn) => conn.connected() || conn.available() > 0,
            None => false,
        };
        if !keep {
            self.active = None;
            match listener.accept() {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "Accepted connection");
                    self.active = Some(TcpConnection::new(stream)?);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Err(TransportError::AcceptFailed(e.to_string())),
            }
        }
        Ok(self.active.as_mut())
    }

    fn shutdown(&mut self) {
        if let Some(mut conn) = self.active.take() {
            conn.close();
        }
        self.listener = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn accept_with_data(port: &mut TcpPort) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(2) {
            if let Ok(Some(conn)) = port.accept()
                && conn.available() > 0
            {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_tcp_roundtrip() {
        let mut port = TcpPort::new();
        port.listen(0).unwrap();
        let addr = port.local_addr().unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", addr.port())).unwrap();
        client.write_all(b"0 10 abc\n").unwrap();

        assert!(accept_with_data(&mut port));
        let conn = port.accept().unwrap().unwrap();
        assert_eq!(conn.peek(), Some(b'0'));
        assert_eq!(conn.read(), Some(b'0'));
        conn.write(b"OK").unwrap();

        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"OK");
    }

    #[test]
    fn test_accept_requires_listen() {
        let mut port = TcpPort::new();
        assert!(matches!(port.accept(), Err(TransportError::NotListening)));
    }
}
