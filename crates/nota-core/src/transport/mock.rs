//! Mock transport for testing.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use super::traits::{Connection, TransportError, TransportPort};

/// Bytes that become readable once the server has written `after_writes`
/// times. Lets a test script a peer that waits for acknowledgements.
struct Segment {
    data: VecDeque<u8>,
    after_writes: usize,
}

struct ConnectionState {
    segments: VecDeque<Segment>,
    write_log: Vec<Vec<u8>>,
    connected: bool,
    closed_by_server: bool,
    hangup_after: Option<usize>,
    flushes: usize,
    remote: SocketAddr,
}

impl ConnectionState {
    fn attached(&self) -> bool {
        self.connected
            && !self.closed_by_server
            && self.hangup_after.is_none_or(|n| self.write_log.len() < n)
    }

    fn visible(&self) -> usize {
        let writes = self.write_log.len();
        self.segments
            .iter()
            .take_while(|s| s.after_writes <= writes)
            .map(|s| s.data.len())
            .sum()
    }

    fn front_visible(&mut self) -> Option<&mut Segment> {
        let writes = self.write_log.len();
        while self.segments.front().is_some_and(|s| s.data.is_empty()) {
            self.segments.pop_front();
        }
        self.segments
            .front_mut()
            .filter(|s| s.after_writes <= writes)
    }
}

/// Mock peer connection. Clones share the same state, so a test can keep a
/// handle while the port owns another.
#[derive(Clone)]
pub struct MockConnection {
    state: Arc<Mutex<ConnectionState>>,
}

impl MockConnection {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ConnectionState {
                segments: VecDeque::new(),
                write_log: Vec::new(),
                connected: true,
                closed_by_server: false,
                hangup_after: None,
                flushes: 0,
                remote: SocketAddr::from((Ipv4Addr::new(192, 168, 1, 50), 51000)),
            })),
        }
    }

    /// Queue bytes that are readable immediately.
    pub fn push(&self, data: impl AsRef<[u8]>) {
        self.push_after_writes(data, 0);
    }

    /// Queue bytes that become readable after the server has written
    /// `writes` times in total.
    pub fn push_after_writes(&self, data: impl AsRef<[u8]>, writes: usize) {
        self.state.lock().unwrap().segments.push_back(Segment {
            data: data.as_ref().iter().copied().collect(),
            after_writes: writes,
        });
    }

    /// All captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().write_log.clone()
    }

    /// Captured writes decoded as text and concatenated.
    pub fn written_text(&self) -> String {
        self.get_writes()
            .iter()
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }

    /// Captured writes decoded as individual text replies.
    pub fn replies(&self) -> Vec<String> {
        self.get_writes()
            .iter()
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }

    /// Bytes still queued (visible or not).
    pub fn pending(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .segments
            .iter()
            .map(|s| s.data.len())
            .sum()
    }

    pub fn flush_count(&self) -> usize {
        self.state.lock().unwrap().flushes
    }

    /// Simulate the peer going away.
    pub fn disconnect(&self) {
        self.state.lock().unwrap().connected = false;
    }

    /// Simulate the peer going away once the server has written `writes`
    /// times in total.
    pub fn hangup_after_writes(&self, writes: usize) {
        self.state.lock().unwrap().hangup_after = Some(writes);
    }

    /// Whether the server side closed this connection.
    pub fn closed_by_server(&self) -> bool {
        self.state.lock().unwrap().closed_by_server
    }

    pub fn set_remote(&self, remote: SocketAddr) {
        self.state.lock().unwrap().remote = remote;
    }
}

impl Default for MockConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection for MockConnection {
    fn available(&mut self) -> usize {
        self.state.lock().unwrap().visible()
    }

    fn peek(&mut self) -> Option<u8> {
        let mut state = self.state.lock().unwrap();
        state.front_visible().and_then(|s| s.data.front().copied())
    }

    fn read(&mut self) -> Option<u8> {
        let mut state = self.state.lock().unwrap();
        state.front_visible().and_then(|s| s.data.pop_front())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let mut state = self.state.lock().unwrap();
        if !state.attached() {
            return Err(TransportError::Disconnected);
        }
        state.write_log.push(data.to_vec());
        Ok(data.len())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        self.state.lock().unwrap().flushes += 1;
        Ok(())
    }

    fn connected(&mut self) -> bool {
        self.state.lock().unwrap().attached()
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        Some(self.state.lock().unwrap().remote)
    }

    fn close(&mut self) {
        self.state.lock().unwrap().closed_by_server = true;
    }
}

/// Mock listening port. Clones share the queue of inbound connections.
#[derive(Clone, Default)]
pub struct MockPort {
    incoming: Arc<Mutex<VecDeque<MockConnection>>>,
    listening: Arc<Mutex<Option<u16>>>,
    active: Option<MockConnection>,
}

impl MockPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an inbound peer.
    pub fn connect(&self, conn: MockConnection) {
        self.incoming.lock().unwrap().push_back(conn);
    }

    /// Port passed to `listen`, if listening.
    pub fn listening_on(&self) -> Option<u16> {
        *self.listening.lock().unwrap()
    }
}

impl TransportPort for MockPort {
    type Connection = MockConnection;

    fn listen(&mut self, port: u16) -> Result<(), TransportError> {
        *self.listening.lock().unwrap() = Some(port);
        Ok(())
    }

    fn accept(&mut self) -> Result<Option<&mut MockConnection>, TransportError> {
        if self.listening.lock().unwrap().is_none() {
            return Err(TransportError::NotListening);
        }
        let keep = match self.active.as_mut() {
            Some(conn) => conn.connected() || conn.available() > 0,
            None => false,
        };
        if !keep {
            self.active = self.incoming.lock().unwrap().pop_front();
        }
        Ok(self.active.as_mut())
    }

    fn shutdown(&mut self) {
        *self.listening.lock().unwrap() = None;
        if let Some(mut conn) = self.active.take() {
            conn.close();
        }
    }
}
