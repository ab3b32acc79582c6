//! Uploader: pushes an image to an endpoint over TCP.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::digest::{challenge_response, md5_hex};
use crate::protocol::constants::{
    DEFAULT_PORT, META_SEPARATOR, REPLY_AUTH, REPLY_OK, UPLOAD_CHUNK,
};
use crate::protocol::{AuthCommand, UpdateKind};

const CONNECT_ATTEMPTS: u32 = 10;
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);
const REPLY_TIMEOUT: Duration = Duration::from_millis(1500);
const START_TIMEOUT: Duration = Duration::from_secs(5);
const VERIFY_TIMEOUT: Duration = Duration::from_secs(10);
const POLL: Duration = Duration::from_millis(1);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Could not reach {addr} after {attempts} attempts")]
    Connect { addr: String, attempts: u32 },

    #[error("No answer from device")]
    NoAnswer,

    #[error("Device requires a password")]
    AuthRequired,

    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    #[error("Bad invitation response: {0}")]
    BadInvitation(String),

    #[error("Device reported: {0}")]
    Rejected(String),

    #[error("Connection closed by device")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Summary of a finished upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub bytes: usize,
    pub digest: String,
    /// Invitation metadata (`<proto>|/<host>|/...`).
    pub metadata: String,
    pub elapsed: Duration,
}

/// Blocking stream with a receive buffer and short read timeouts.
struct Link {
    stream: TcpStream,
    rx: Vec<u8>,
    open: bool,
}

impl Link {
    fn new(stream: TcpStream) -> Result<Self, ClientError> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(POLL))?;
        Ok(Self {
            stream,
            rx: Vec::new(),
            open: true,
        })
    }

    fn send(&mut self, data: &[u8]) -> Result<(), ClientError> {
        self.stream.write_all(data)?;
        Ok(())
    }

    /// Pull whatever arrives within one poll interval.
    fn pump(&mut self) -> Result<(), ClientError> {
        if !self.open {
            return Ok(());
        }
        let mut buf = [0u8; 512];
        match self.stream.read(&mut buf) {
            Ok(0) => self.open = false,
            Ok(n) => self.rx.extend_from_slice(&buf[..n]),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(e) if e.kind() == ErrorKind::ConnectionReset => self.open = false,
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Wait until `done` accepts the buffered text.
    fn wait_until(
        &mut self,
        timeout: Duration,
        done: impl Fn(&str) -> bool,
    ) -> Result<bool, ClientError> {
        let deadline = Instant::now() + timeout;
        loop {
            if done(&String::from_utf8_lossy(&self.rx)) {
                return Ok(true);
            }
            if !self.open || Instant::now() >= deadline {
                return Ok(false);
            }
            self.pump()?;
        }
    }

    /// Wait for any reply at all.
    fn wait_any(&mut self, timeout: Duration) -> Result<bool, ClientError> {
        self.wait_until(timeout, |text| !text.is_empty())
    }

    fn take(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.rx).into_owned();
        self.rx.clear();
        text
    }
}

/// Upload client for one endpoint.
pub struct Uploader {
    host: String,
    port: u16,
    password: Option<String>,
    chunk_size: usize,
}

impl Uploader {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            password: None,
            chunk_size: UPLOAD_CHUNK,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Push `image` and wait for the device to confirm it.
    ///
    /// `name` only feeds the client nonce. `progress` receives
    /// `(bytes_sent, total)` after each acknowledged chunk.
    #[instrument(skip(self, image, progress), fields(host = %self.host, port = self.port))]
    pub fn upload(
        &self,
        name: &str,
        image: &[u8],
        kind: UpdateKind,
        mut progress: impl FnMut(u64, u64),
    ) -> Result<UploadReport, ClientError> {
        let started = Instant::now();
        let digest = md5_hex(image);
        let (mut link, invitation) = self.invite(kind, image.len(), &digest)?;

        let metadata = if let Some(rest) = invitation.strip_prefix(REPLY_AUTH) {
            let nonce = rest.split_whitespace().next().unwrap_or_default().to_string();
            self.authenticate(&mut link, AuthCommand::Auth, &nonce, name, image.len(), &digest)?;
            rest.split_whitespace().nth(1).unwrap_or_default().to_string()
        } else if let Some(rest) = invitation.strip_prefix(REPLY_OK) {
            let (metadata, ready) = split_ready(rest.trim_start());
            let metadata = metadata.to_string();
            if !ready {
                expect_ok(&mut link, START_TIMEOUT)?;
            }
            metadata
        } else {
            return Err(ClientError::BadInvitation(invitation));
        };
        info!(metadata = %metadata, size = image.len(), "Device ready, sending image");

        let total = image.len() as u64;
        let mut sent = 0u64;
        for chunk in image.chunks(self.chunk_size) {
            link.send(chunk)?;
            sent += chunk.len() as u64;
            if !link.wait_any(REPLY_TIMEOUT)? {
                if !link.open {
                    return Err(ClientError::Closed);
                }
                warn!(sent, "No acknowledgement, continuing");
            }
            let ack = link.take();
            debug!(ack = %ack.trim(), "Ack");
            if ack.contains("ERR") {
                return Err(ClientError::Rejected(ack.trim().to_string()));
            }
            progress(sent, total);
            if has_final_ok(&ack) {
                return Ok(self.report(image.len(), digest, metadata, started));
            }
        }

        info!("Waiting for verification");
        let done = link.wait_until(VERIFY_TIMEOUT, |text| {
            text.contains("ERR") || has_final_ok(text)
        })?;
        let reply = link.take();
        if !done {
            return Err(if link.open {
                ClientError::NoAnswer
            } else {
                ClientError::Closed
            });
        }
        if reply.contains("ERR") {
            return Err(ClientError::Rejected(
                reply.trim_start_matches(|c: char| c.is_ascii_digit()).trim().to_string(),
            ));
        }
        Ok(self.report(image.len(), digest, metadata, started))
    }

    /// Verify credentials with the test command, without uploading.
    ///
    /// Returns `false` when the device does not require a password; such a
    /// device has already opened storage and will time the attempt out.
    #[instrument(skip(self, image), fields(host = %self.host, port = self.port))]
    pub fn check_auth(&self, name: &str, image: &[u8], kind: UpdateKind) -> Result<bool, ClientError> {
        let digest = md5_hex(image);
        let (mut link, invitation) = self.invite(kind, image.len(), &digest)?;
        let Some(rest) = invitation.strip_prefix(REPLY_AUTH) else {
            if invitation.starts_with(REPLY_OK) {
                warn!("Device accepts uploads without a password");
                return Ok(false);
            }
            return Err(ClientError::BadInvitation(invitation));
        };
        let nonce = rest.split_whitespace().next().unwrap_or_default().to_string();
        self.authenticate(&mut link, AuthCommand::Test, &nonce, name, image.len(), &digest)?;
        info!("Credentials accepted");
        Ok(true)
    }

    fn report(&self, bytes: usize, digest: String, metadata: String, started: Instant) -> UploadReport {
        UploadReport {
            bytes,
            digest,
            metadata,
            elapsed: started.elapsed(),
        }
    }

    /// Connect and send the update invitation. Returns the link and the
    /// first reply.
    fn invite(&self, kind: UpdateKind, size: usize, digest: &str) -> Result<(Link, String), ClientError> {
        let message = format!("{} {} {}\n", kind.code(), size, digest);
        let addr = format!("{}:{}", self.host, self.port);

        for attempt in 1..=CONNECT_ATTEMPTS {
            match self.try_invite(&addr, &message) {
                Ok(Some(found)) => return Ok(found),
                Ok(None) => debug!(attempt, "No invitation reply"),
                Err(e) => debug!(attempt, error = %e, "Connect failed"),
            }
            thread::sleep(CONNECT_BACKOFF);
        }
        Err(ClientError::Connect {
            addr,
            attempts: CONNECT_ATTEMPTS,
        })
    }

    fn try_invite(&self, addr: &str, message: &str) -> Result<Option<(Link, String)>, ClientError> {
        let target = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| std::io::Error::new(ErrorKind::NotFound, "no address"))?;
        let stream = TcpStream::connect_timeout(&target, REPLY_TIMEOUT)?;
        let mut link = Link::new(stream)?;
        link.send(message.as_bytes())?;
        if !link.wait_any(REPLY_TIMEOUT)? {
            return Ok(None);
        }
        // Let the rest of the invitation arrive.
        thread::sleep(Duration::from_millis(10));
        link.pump()?;
        let invitation = link.take();
        debug!(reply = %invitation, "Invitation");
        Ok(Some((link, invitation)))
    }

    fn authenticate(
        &self,
        link: &mut Link,
        command: AuthCommand,
        nonce: &str,
        name: &str,
        size: usize,
        digest: &str,
    ) -> Result<(), ClientError> {
        let password = self.password.as_deref().ok_or(ClientError::AuthRequired)?;
        let cnonce = md5_hex(format!("{name}{size}{digest}{}", self.host));
        let response = challenge_response(&md5_hex(password), nonce, &cnonce);
        info!("Authenticating");
        link.send(format!("{} {} {}\n", command.code(), cnonce, response).as_bytes())?;

        if !link.wait_any(START_TIMEOUT)? {
            return Err(ClientError::NoAnswer);
        }
        let reply = link.take();
        if reply.trim().starts_with(REPLY_OK) {
            Ok(())
        } else {
            Err(ClientError::AuthRejected(reply.trim().to_string()))
        }
    }
}

/// Separate invitation metadata from a storage-ready `OK` that arrived in
/// the same read. The `OK` only counts as a suffix of the last field of a
/// complete extended (5 fields) or legacy (3 fields) block, so identity
/// strings that merely contain "OK" are left alone.
fn split_ready(body: &str) -> (&str, bool) {
    let body = body.trim_end();
    let fields = body.split(META_SEPARATOR).count();
    if matches!(fields, 3 | 5)
        && let Some(metadata) = body.strip_suffix(REPLY_OK)
    {
        return (metadata, true);
    }
    (body, false)
}

/// Wait for a bare OK, turning an `ERR` reply into a rejection.
fn expect_ok(link: &mut Link, timeout: Duration) -> Result<(), ClientError> {
    let arrived = link.wait_until(timeout, |text| {
        text.contains("ERR") || text.trim_start().len() >= REPLY_OK.len()
    })?;
    if !arrived {
        return Err(ClientError::NoAnswer);
    }
    let reply = link.take();
    if reply.trim().starts_with(REPLY_OK) {
        Ok(())
    } else {
        Err(ClientError::Rejected(reply.trim().to_string()))
    }
}

/// Whether a reply carries the terminal OK after any numeric acks.
fn has_final_ok(text: &str) -> bool {
    text.trim_start_matches(|c: char| c.is_ascii_digit())
        .contains(REPLY_OK)
}
