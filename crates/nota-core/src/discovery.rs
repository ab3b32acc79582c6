//! LAN discovery: answer JSON probes on UDP so uploaders can find the
//! endpoint, and the matching probe for the uploader side.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::Settings;
use crate::digest::md5_of_micros;
use crate::protocol::constants::{
    DISCOVERY_MAGIC, DISCOVERY_MIN_INTERVAL_MS, DISCOVERY_PORT, DISCOVERY_REQUEST,
    DISCOVERY_RESPONSE, DISCOVERY_RESPONSE_PORT, MAX_DISCOVERY_PACKET, PROTOCOL_VERSION,
};

/// Multicast group joined next to plain broadcast.
pub const DISCOVERY_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 78, 79);

/// Packets drained after a reply, at most.
const MAX_DRAIN: usize = 32;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed packet: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Reply of {0} bytes exceeds the packet limit")]
    TooLarge(usize),
}

/// Probe sent by uploaders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    pub m: String,
    pub t: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

impl DiscoveryRequest {
    pub fn new(nonce: Option<String>) -> Self {
        Self {
            m: DISCOVERY_MAGIC.to_string(),
            t: DISCOVERY_REQUEST.to_string(),
            nonce,
        }
    }

    fn is_valid(&self) -> bool {
        self.m == DISCOVERY_MAGIC && self.t == DISCOVERY_REQUEST
    }
}

/// Endpoint description returned to a probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryReply {
    pub m: String,
    pub t: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Hostname.
    pub n: String,
    /// Platform.
    pub p: String,
    pub mac: String,
    pub ip: String,
    pub port: u16,
    /// Protocol version.
    pub nota: String,
    /// Firmware version.
    pub v: String,
    /// Board.
    pub b: String,
}

impl DiscoveryReply {
    fn is_valid(&self) -> bool {
        self.m == DISCOVERY_MAGIC && self.t == DISCOVERY_RESPONSE
    }
}

pub fn format_mac(mac: [u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Datagram endpoint used by the responder. Receives never block.
pub trait DatagramSocket {
    fn recv_from(&mut self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, DiscoveryError>;

    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> Result<usize, DiscoveryError>;

    /// Local address a reply to `peer` leaves from, if known.
    fn local_ip_for(&self, _peer: SocketAddr) -> Option<IpAddr> {
        None
    }
}

/// Broadcast-capable std UDP socket, also joined to the multicast group.
pub struct UdpDatagram {
    socket: UdpSocket,
}

impl UdpDatagram {
    #[instrument]
    pub fn bind(port: u16) -> Result<Self, DiscoveryError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
        socket.set_nonblocking(true)?;
        socket.set_broadcast(true)?;
        if let Err(e) = socket.join_multicast_v4(&DISCOVERY_MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)
        {
            warn!(error = %e, "Multicast unavailable, broadcast only");
        }
        info!(port, "Discovery listening");
        Ok(Self { socket })
    }
}

impl DatagramSocket for UdpDatagram {
    fn recv_from(&mut self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, DiscoveryError> {
        match self.socket.recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> Result<usize, DiscoveryError> {
        Ok(self.socket.send_to(data, addr)?)
    }

    fn local_ip_for(&self, peer: SocketAddr) -> Option<IpAddr> {
        // A connected UDP socket reveals the outbound interface without
        // sending anything.
        let probe = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
        probe.connect(peer).ok()?;
        probe.local_addr().ok().map(|a| a.ip())
    }
}

#[derive(Default)]
struct MockDatagramState {
    inbound: VecDeque<(Vec<u8>, SocketAddr)>,
    sent: Vec<(Vec<u8>, SocketAddr)>,
}

/// In-memory datagram socket for tests. Clones share state.
#[derive(Clone, Default)]
pub struct MockDatagram {
    state: Arc<Mutex<MockDatagramState>>,
}

impl MockDatagram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject(&self, data: impl AsRef<[u8]>, from: SocketAddr) {
        self.state
            .lock()
            .unwrap()
            .inbound
            .push_back((data.as_ref().to_vec(), from));
    }

    pub fn sent(&self) -> Vec<(Vec<u8>, SocketAddr)> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn queued(&self) -> usize {
        self.state.lock().unwrap().inbound.len()
    }
}

impl DatagramSocket for MockDatagram {
    fn recv_from(&mut self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, DiscoveryError> {
        let Some((data, from)) = self.state.lock().unwrap().inbound.pop_front() else {
            return Ok(None);
        };
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(Some((n, from)))
    }

    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> Result<usize, DiscoveryError> {
        self.state.lock().unwrap().sent.push((data.to_vec(), addr));
        Ok(data.len())
    }
}

/// Device-side responder, polled from the service loop.
pub struct DiscoveryResponder {
    socket: Box<dyn DatagramSocket>,
    response_port: u16,
    last_reply_ms: Option<u64>,
}

impl DiscoveryResponder {
    pub fn new(socket: Box<dyn DatagramSocket>) -> Self {
        Self {
            socket,
            response_port: DISCOVERY_RESPONSE_PORT,
            last_reply_ms: None,
        }
    }

    /// Bind the standard discovery port.
    pub fn bind() -> Result<Self, DiscoveryError> {
        Ok(Self::new(Box::new(UdpDatagram::bind(DISCOVERY_PORT)?)))
    }

    pub fn with_response_port(mut self, port: u16) -> Self {
        self.response_port = port;
        self
    }

    /// Handle at most one probe. Returns where a reply was sent.
    pub fn poll(&mut self, now_ms: u64, settings: &Settings, mac: [u8; 6]) -> Option<SocketAddr> {
        match self.try_poll(now_ms, settings, mac) {
            Ok(sent) => sent,
            Err(e) => {
                debug!(error = %e, "Discovery packet dropped");
                None
            }
        }
    }

    fn try_poll(
        &mut self,
        now_ms: u64,
        settings: &Settings,
        mac: [u8; 6],
    ) -> Result<Option<SocketAddr>, DiscoveryError> {
        let mut buf = [0u8; MAX_DISCOVERY_PACKET];
        let Some((n, from)) = self.socket.recv_from(&mut buf)? else {
            return Ok(None);
        };

        let request: DiscoveryRequest = serde_json::from_slice(trim_line(&buf[..n]))?;
        if !request.is_valid() {
            debug!(peer = %from, "Ignoring non-discovery datagram");
            return Ok(None);
        }
        if let Some(last) = self.last_reply_ms
            && now_ms.saturating_sub(last) < DISCOVERY_MIN_INTERVAL_MS
        {
            debug!(peer = %from, "Discovery rate limited");
            return Ok(None);
        }

        let ip = self
            .socket
            .local_ip_for(from)
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let reply = DiscoveryReply {
            m: DISCOVERY_MAGIC.to_string(),
            t: DISCOVERY_RESPONSE.to_string(),
            nonce: request.nonce,
            n: settings.hostname.clone(),
            p: settings.platform.clone(),
            mac: format_mac(mac),
            ip: ip.to_string(),
            port: settings.port,
            nota: PROTOCOL_VERSION.to_string(),
            v: settings.firmware_version.clone(),
            b: settings.board.clone(),
        };
        let body = serde_json::to_vec(&reply)?;
        if body.len() > MAX_DISCOVERY_PACKET {
            return Err(DiscoveryError::TooLarge(body.len()));
        }

        let target = SocketAddr::new(from.ip(), self.response_port);
        self.socket.send_to(&body, target)?;
        self.last_reply_ms = Some(now_ms);
        debug!(peer = %target, "Discovery reply sent");

        for _ in 0..MAX_DRAIN {
            if self.socket.recv_from(&mut buf)?.is_none() {
                break;
            }
        }
        Ok(Some(target))
    }
}

fn trim_line(data: &[u8]) -> &[u8] {
    let end = data
        .iter()
        .rposition(|b| !matches!(b, b'\n' | b'\r' | 0))
        .map_or(0, |i| i + 1);
    &data[..end]
}

/// Broadcast a probe to `target` and collect matching replies until
/// `timeout` elapses.
#[instrument]
pub fn probe(
    target: SocketAddr,
    timeout: Duration,
) -> Result<Vec<(SocketAddr, DiscoveryReply)>, DiscoveryError> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, DISCOVERY_RESPONSE_PORT))?;
    socket.set_broadcast(true)?;
    socket.set_read_timeout(Some(Duration::from_millis(100)))?;

    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_micros() as u64);
    let nonce = md5_of_micros(micros);
    let request = serde_json::to_vec(&DiscoveryRequest::new(Some(nonce.clone())))?;
    socket.send_to(&request, target)?;

    let deadline = Instant::now() + timeout;
    let mut found: Vec<(SocketAddr, DiscoveryReply)> = Vec::new();
    let mut buf = [0u8; MAX_DISCOVERY_PACKET];
    while Instant::now() < deadline {
        let (n, from) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<DiscoveryReply>(trim_line(&buf[..n])) {
            Ok(reply) if reply.is_valid() && reply.nonce.as_deref() == Some(&nonce) => {
                if !found.iter().any(|(addr, _)| *addr == from) {
                    info!(peer = %from, host = %reply.n, "Endpoint found");
                    found.push((from, reply));
                }
            }
            Ok(_) => debug!(peer = %from, "Unrelated discovery reply"),
            Err(e) => debug!(peer = %from, error = %e, "Malformed discovery reply"),
        }
    }
    Ok(found)
}
