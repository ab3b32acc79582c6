//! OTA service - the session object an application owns and polls.

use tracing::{info, instrument, warn};

use crate::config::{OtaConfig, Settings};
use crate::digest::md5_hex;
use crate::discovery::DiscoveryResponder;
use crate::events::{OtaEvent, OtaObserver, SessionState, TracingObserver};
use crate::host::Host;
use crate::protocol::UpdateKind;
use crate::protocol::constants::DEFAULT_PORT;
use crate::protocol::parser::drain;
use crate::protocol::reply::ReplyFormat;
use crate::state::handlers::{HandlerContext, handle_auth, handle_idle, handle_update};
use crate::state::machine::{PendingUpdate, StateMachineContext};
use crate::storage::StorageSink;
use crate::transport::{Connection, TransportError, TransportPort};

/// Platform advertised when none was configured.
const UNKNOWN_PLATFORM: &str = "Unknown";

/// Name derived from the low half of the MAC address.
pub fn default_hostname(mac: [u8; 6]) -> String {
    format!("nota-{:02x}{:02x}{:02x}", mac[3], mac[4], mac[5])
}

/// One device's OTA endpoint.
///
/// Configure with the `set_*` methods, call `begin`, then call `tick` from
/// the main loop.
pub struct OtaService<P, S, H, O = TracingObserver>
where
    P: TransportPort,
    S: StorageSink,
    H: Host,
    O: OtaObserver,
{
    port: P,
    storage: S,
    host: H,
    observer: O,
    settings: Settings,
    machine: StateMachineContext,
    discovery_enabled: bool,
    discovery: Option<DiscoveryResponder>,
    initialized: bool,
}

impl<P: TransportPort, S: StorageSink, H: Host> OtaService<P, S, H, TracingObserver> {
    /// Service that reports events through tracing.
    pub fn new(port: P, storage: S, host: H) -> Self {
        Self::with_observer(port, storage, host, TracingObserver)
    }
}

impl<P, S, H, O> OtaService<P, S, H, O>
where
    P: TransportPort,
    S: StorageSink,
    H: Host,
    O: OtaObserver,
{
    pub fn with_observer(port: P, storage: S, host: H, observer: O) -> Self {
        Self {
            port,
            storage,
            host,
            observer,
            settings: Settings {
                reboot_on_success: true,
                ..Default::default()
            },
            machine: StateMachineContext::new(),
            discovery_enabled: false,
            discovery: None,
            initialized: false,
        }
    }

    /// Answer discovery probes through the given responder.
    pub fn with_discovery(mut self, responder: DiscoveryResponder) -> Self {
        self.discovery = Some(responder);
        self.discovery_enabled = true;
        self
    }

    /// Bind the standard discovery socket on `begin`.
    pub fn enable_discovery(&mut self) {
        if !self.initialized {
            self.discovery_enabled = true;
        }
    }

    fn configurable(&self, current: &str) -> bool {
        !self.initialized && current.is_empty()
    }

    pub fn set_port(&mut self, port: u16) {
        if !self.initialized && self.settings.port == 0 {
            self.settings.port = port;
        }
    }

    pub fn set_hostname(&mut self, hostname: &str) {
        if self.configurable(&self.settings.hostname) {
            self.settings.hostname = hostname.to_string();
        }
    }

    pub fn set_platform(&mut self, platform: &str) {
        if self.configurable(&self.settings.platform) {
            self.settings.platform = platform.to_string();
        }
    }

    pub fn set_board(&mut self, board: &str) {
        if self.configurable(&self.settings.board) {
            self.settings.board = board.to_string();
        }
    }

    pub fn set_firmware_version(&mut self, version: &str) {
        if self.configurable(&self.settings.firmware_version) {
            self.settings.firmware_version = version.to_string();
        }
    }

    /// Require authentication. Only the digest of `password` is kept.
    pub fn set_password(&mut self, password: &str) {
        if !self.initialized && self.settings.password_digest.is_none() && !password.is_empty() {
            self.settings.password_digest = Some(md5_hex(password));
        }
    }

    /// Require authentication with a precomputed password digest.
    pub fn set_password_hash(&mut self, digest: &str) {
        if !self.initialized && self.settings.password_digest.is_none() && !digest.is_empty() {
            self.settings.password_digest = Some(digest.to_ascii_lowercase());
        }
    }

    pub fn set_reply_format(&mut self, format: ReplyFormat) {
        if !self.initialized {
            self.settings.reply_format = format;
        }
    }

    /// May be changed at any time.
    pub fn set_reboot_on_success(&mut self, reboot: bool) {
        self.settings.reboot_on_success = reboot;
    }

    /// Apply a configuration file through the setters.
    pub fn apply_config(&mut self, config: &OtaConfig) {
        if config.port != 0 {
            self.set_port(config.port);
        }
        self.set_hostname(&config.hostname);
        self.set_platform(&config.platform);
        self.set_board(&config.board);
        self.set_firmware_version(&config.firmware_version);
        match (&config.password, &config.password_hash) {
            (Some(password), _) => self.set_password(password),
            (None, Some(hash)) => self.set_password_hash(hash),
            (None, None) => {}
        }
        self.set_reply_format(config.reply_format);
        self.set_reboot_on_success(config.reboot_on_success);
        if config.discovery {
            self.enable_discovery();
        }
    }

    /// Fill in defaults and start listening. Calling it again before
    /// `reconnect` does nothing.
    #[instrument(skip(self))]
    pub fn begin(&mut self) -> Result<(), TransportError> {
        if self.initialized {
            return Ok(());
        }
        if self.settings.port == 0 {
            self.settings.port = DEFAULT_PORT;
        }
        if self.settings.hostname.is_empty() {
            self.settings.hostname = default_hostname(self.host.mac_address());
        }
        if self.settings.platform.is_empty() {
            self.settings.platform = UNKNOWN_PLATFORM.to_string();
        }

        self.port.listen(self.settings.port)?;

        if self.discovery_enabled && self.discovery.is_none() {
            match DiscoveryResponder::bind() {
                Ok(responder) => self.discovery = Some(responder),
                Err(e) => warn!(error = %e, "Discovery disabled"),
            }
        }

        self.machine = StateMachineContext::new();
        self.initialized = true;
        info!(
            hostname = %self.settings.hostname,
            port = self.settings.port,
            auth = self.settings.password_digest.is_some(),
            "OTA server ready"
        );
        Ok(())
    }

    /// Drop the listener and any session in progress. `begin` may be called
    /// again afterwards.
    pub fn reconnect(&mut self) {
        if self.machine.state == SessionState::Receiving {
            self.storage.abort();
        }
        self.port.shutdown();
        self.machine.goto_state(SessionState::Idle, self.host.millis());
        self.initialized = false;
        info!("OTA server stopped");
    }

    /// Service the protocol once. Protocol failures are reported through the
    /// observer; only listener failures are returned.
    pub fn tick(&mut self) -> Result<(), TransportError> {
        if !self.initialized {
            return Ok(());
        }

        let now = self.host.millis();
        if let Some(expired) = self.machine.expire(now) {
            warn!(state = %expired, "Session timed out");
            self.observer.on_event(&OtaEvent::StateChanged {
                from: expired,
                to: SessionState::Idle,
            });
        }

        if let Some(discovery) = self.discovery.as_mut() {
            discovery.poll(now, &self.settings, self.host.mac_address());
        }

        let Some(conn) = self.port.accept()? else {
            return Ok(());
        };
        if conn.available() == 0 {
            return Ok(());
        }

        self.observer.on_event(&OtaEvent::ClientConnected {
            addr: conn.remote_address(),
        });

        let mut ctx = HandlerContext {
            conn,
            storage: &mut self.storage,
            host: &self.host,
            observer: &self.observer,
            machine: &mut self.machine,
            settings: &self.settings,
        };

        if ctx.machine.state == SessionState::Idle {
            handle_idle(&mut ctx);
        }
        if ctx.machine.state == SessionState::AwaitingAuth && ctx.conn.available() > 0 {
            handle_auth(&mut ctx);
        }
        if ctx.machine.state == SessionState::Receiving {
            handle_update(&mut ctx);
        }
        drain(ctx.conn);
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.machine.state
    }

    /// Kind of the most recently accepted request.
    pub fn command(&self) -> Option<UpdateKind> {
        self.machine.last_command
    }

    pub fn pending(&self) -> Option<&PendingUpdate> {
        self.machine.pending.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.initialized
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn hostname(&self) -> &str {
        &self.settings.hostname
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn port(&self) -> &P {
        &self.port
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::challenge_response;
    use crate::discovery::MockDatagram;
    use crate::error::{OtaError, ReceiveFailure};
    use crate::host::MockHost;
    use crate::storage::{StagedStorage, StorageError, VerifyingStorage};
    use crate::transport::{MockConnection, MockPort};
    use std::cell::RefCell;
    use std::rc::Rc;

    const EMPTY_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";

    #[derive(Default)]
    struct Recorder {
        events: RefCell<Vec<OtaEvent>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<OtaEvent> {
            self.events.borrow().clone()
        }

        fn errors(&self) -> Vec<OtaError> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    OtaEvent::Error(err) => Some(err),
                    _ => None,
                })
                .collect()
        }

        fn progress(&self) -> Vec<(u64, u64)> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    OtaEvent::Progress { written, total } => Some((written, total)),
                    _ => None,
                })
                .collect()
        }

        fn count(&self, wanted: &OtaEvent) -> usize {
            self.events().iter().filter(|e| *e == wanted).count()
        }
    }

    impl OtaObserver for Recorder {
        fn on_event(&self, event: &OtaEvent) {
            self.events.borrow_mut().push(event.clone());
        }
    }

    type TestService<S> = OtaService<MockPort, S, MockHost, Rc<Recorder>>;

    fn service<S: StorageSink>(storage: S) -> (TestService<S>, MockPort, MockHost, Rc<Recorder>) {
        let port = MockPort::new();
        let host = MockHost::new();
        let recorder = Rc::new(Recorder::default());
        let svc = OtaService::with_observer(port.clone(), storage, host.clone(), recorder.clone());
        (svc, port, host, recorder)
    }

    fn nonce_from(reply: &str) -> String {
        reply.split(' ').nth(1).unwrap().to_string()
    }

    /// Sink that accepts any declared size, so capacity is only enforced
    /// by the receiver.
    struct LenientSink {
        capacity: usize,
        data: Vec<u8>,
    }

    impl StorageSink for LenientSink {
        fn capacity(&self) -> usize {
            self.capacity
        }
        fn open(&mut self, _size: usize, _kind: UpdateKind) -> Result<(), StorageError> {
            self.data.clear();
            Ok(())
        }
        fn write(&mut self, chunk: &[u8]) -> Result<usize, StorageError> {
            self.data.extend_from_slice(chunk);
            Ok(chunk.len())
        }
        fn close(&mut self) -> Result<(), StorageError> {
            Ok(())
        }
        fn abort(&mut self) {
            self.data.clear();
        }
        fn last_error(&self) -> Option<String> {
            None
        }
    }

    #[test]
    fn test_unauthenticated_upload() {
        let (mut svc, port, host, rec) = service(StagedStorage::new(4096));
        svc.set_board("blackpill");
        svc.set_firmware_version("1.4.0");
        svc.begin().unwrap();

        let payload: Vec<u8> = (0..100u8).collect();
        let conn = MockConnection::new();
        conn.push(format!("0 100 {EMPTY_MD5}\n"));
        conn.push_after_writes(&payload[..60], 2);
        conn.push_after_writes(&payload[60..], 3);
        port.connect(conn.clone());

        svc.tick().unwrap();

        assert_eq!(
            conn.replies(),
            vec![
                "OK 0.0.2|/nota-a1b2c3|/Unknown|/blackpill|/1.4.0",
                "OK",
                "60",
                "40",
                "OK"
            ]
        );
        assert_eq!(svc.state(), SessionState::Idle);
        assert_eq!(svc.command(), Some(UpdateKind::Flash));
        assert_eq!(svc.storage().image(), &payload[..]);
        assert_eq!(rec.progress(), vec![(0, 100), (60, 100), (100, 100)]);
        assert_eq!(rec.count(&OtaEvent::Request), 1);
        assert_eq!(rec.count(&OtaEvent::End), 1);
        assert!(rec.errors().is_empty());
        assert!(conn.closed_by_server());
        assert!(conn.flush_count() >= 2);
        assert_eq!(host.reboot_count(), 1);
    }

    #[test]
    fn test_authenticated_upload() {
        let (mut svc, port, host, rec) = service(StagedStorage::new(4096));
        svc.set_password("admin");
        svc.begin().unwrap();

        let conn = MockConnection::new();
        conn.push(format!("0 100 {EMPTY_MD5}\n"));
        port.connect(conn.clone());
        svc.tick().unwrap();

        assert_eq!(svc.state(), SessionState::AwaitingAuth);
        let invitation = conn.replies()[0].clone();
        assert!(invitation.starts_with("AUTH "));
        let nonce = nonce_from(&invitation);
        assert_eq!(nonce.len(), 32);

        let cnonce = md5_hex("firmware.bin100");
        let response = challenge_response(&md5_hex("admin"), &nonce, &cnonce);
        conn.push(format!("200 {cnonce} {response}\n"));
        conn.push_after_writes(vec![0xA5u8; 100], 2);
        svc.tick().unwrap();

        assert_eq!(conn.replies()[1..], ["OK", "100", "OK"]);
        assert_eq!(svc.storage().image(), &[0xA5u8; 100][..]);
        assert_eq!(rec.progress().last(), Some(&(100, 100)));
        assert_eq!(host.reboot_count(), 1);
    }

    #[test]
    fn test_wrong_response_rejected() {
        let (mut svc, port, host, rec) = service(StagedStorage::new(4096));
        svc.set_password("admin");
        svc.begin().unwrap();

        let conn = MockConnection::new();
        conn.push(format!("0 100 {EMPTY_MD5}\n"));
        port.connect(conn.clone());
        svc.tick().unwrap();

        conn.push(format!("200 {} {}\n", md5_hex("c"), md5_hex("wrong")));
        svc.tick().unwrap();

        assert_eq!(conn.replies()[1], "ERR:AUTH");
        assert_eq!(rec.errors(), vec![OtaError::Auth]);
        assert_eq!(svc.state(), SessionState::Idle);
        assert!(svc.pending().is_none());
        assert_eq!(host.reboot_count(), 0);
    }

    #[test]
    fn test_auth_reply_errors() {
        let cases = [
            ("0 100 {md5}\n".to_string(), "ERR:CMD"),
            (format!("200 short {}\n", md5_hex("r")), "ERR:KEY"),
        ];
        for (line, expected) in cases {
            let (mut svc, port, _host, rec) = service(StagedStorage::new(4096));
            svc.set_password("admin");
            svc.begin().unwrap();
            let conn = MockConnection::new();
            conn.push(format!("0 100 {EMPTY_MD5}\n"));
            port.connect(conn.clone());
            svc.tick().unwrap();

            conn.push(line);
            svc.tick().unwrap();
            assert_eq!(conn.replies()[1], expected);
            assert_eq!(svc.state(), SessionState::Idle);
            assert!(rec.errors().is_empty());
        }
    }

    #[test]
    fn test_authenticated_empty_image_refused() {
        let (mut svc, port, _host, _rec) = service(StagedStorage::new(4096));
        svc.set_password("admin");
        svc.begin().unwrap();
        let conn = MockConnection::new();
        conn.push(format!("0 0 {EMPTY_MD5}\n"));
        port.connect(conn.clone());
        svc.tick().unwrap();
        assert_eq!(svc.state(), SessionState::AwaitingAuth);

        conn.push(format!("200 {} {}\n", md5_hex("c"), md5_hex("r")));
        svc.tick().unwrap();
        assert_eq!(conn.replies()[1], "ERR:SIZE");
        assert_eq!(svc.state(), SessionState::Idle);
    }

    #[test]
    fn test_credential_check() {
        let (mut svc, port, host, _rec) = service(StagedStorage::new(4096));
        svc.set_password("admin");
        svc.begin().unwrap();
        let conn = MockConnection::new();
        conn.push(format!("0 100 {EMPTY_MD5}\n"));
        port.connect(conn.clone());
        svc.tick().unwrap();

        let nonce = nonce_from(&conn.replies()[0]);
        let cnonce = md5_hex("probe");
        let response = challenge_response(&md5_hex("admin"), &nonce, &cnonce);
        conn.push(format!("201 {cnonce} {response}\n"));
        svc.tick().unwrap();

        assert_eq!(conn.replies()[1..], ["OK"]);
        assert_eq!(svc.state(), SessionState::Idle);
        assert!(svc.storage().staged().is_none());
        assert_eq!(host.reboot_count(), 0);
    }

    #[test]
    fn test_malformed_digest() {
        let (mut svc, port, _host, rec) = service(StagedStorage::new(4096));
        svc.set_reply_format(ReplyFormat::Legacy);
        svc.set_platform("STM32F4");
        svc.begin().unwrap();
        let conn = MockConnection::new();
        let peer: std::net::SocketAddr = "10.1.2.3:40001".parse().unwrap();
        conn.set_remote(peer);
        conn.push("0 100 nothex\n");
        port.connect(conn.clone());
        svc.tick().unwrap();

        assert_eq!(conn.replies(), vec!["ERR:HASH 0.0.2|/nota-a1b2c3|/STM32F4"]);
        assert_eq!(svc.state(), SessionState::Idle);
        assert_eq!(
            rec.events()[0],
            OtaEvent::ClientConnected { addr: Some(peer) }
        );
    }

    #[test]
    fn test_empty_image_without_password() {
        let (mut svc, port, _host, _rec) = service(StagedStorage::new(4096));
        svc.begin().unwrap();
        let conn = MockConnection::new();
        conn.push(format!("0 0 {EMPTY_MD5}\n"));
        port.connect(conn.clone());
        svc.tick().unwrap();

        assert_eq!(conn.replies(), vec!["ERR:SIZE"]);
        assert_eq!(svc.state(), SessionState::Idle);
    }

    #[test]
    fn test_unknown_command_dropped() {
        let (mut svc, port, _host, rec) = service(StagedStorage::new(4096));
        svc.begin().unwrap();
        let conn = MockConnection::new();
        conn.push(format!("7 100 {EMPTY_MD5}\n"));
        port.connect(conn.clone());
        svc.tick().unwrap();

        assert!(conn.replies().is_empty());
        assert_eq!(conn.pending(), 0);
        assert_eq!(svc.state(), SessionState::Idle);
        assert!(rec.errors().is_empty());
    }

    #[test]
    fn test_auth_deadline() {
        let (mut svc, port, host, rec) = service(StagedStorage::new(4096));
        svc.set_password("admin");
        svc.begin().unwrap();
        let conn = MockConnection::new();
        conn.push(format!("0 100 {EMPTY_MD5}\n"));
        port.connect(conn.clone());
        svc.tick().unwrap();
        assert_eq!(svc.state(), SessionState::AwaitingAuth);

        host.advance_ms(5001);
        svc.tick().unwrap();
        assert_eq!(svc.state(), SessionState::Idle);
        assert_eq!(conn.replies().len(), 1);
        assert!(rec.errors().is_empty());

        // A late response is parsed as a fresh, unknown request.
        conn.push(format!("200 {} {}\n", md5_hex("c"), md5_hex("r")));
        svc.tick().unwrap();
        assert_eq!(conn.replies().len(), 1);
        assert_eq!(svc.state(), SessionState::Idle);
    }

    #[test]
    fn test_begin_failure() {
        let (mut svc, port, _host, rec) = service(VerifyingStorage::new(1024));
        svc.begin().unwrap();
        let conn = MockConnection::new();
        conn.push(format!("0 5000 {EMPTY_MD5}\n"));
        port.connect(conn.clone());
        svc.tick().unwrap();

        let replies = conn.replies();
        assert_eq!(replies.len(), 2);
        assert_eq!(
            replies[1],
            "ERR: Not enough space: requested 5000 bytes, capacity 1024"
        );
        assert_eq!(rec.errors(), vec![OtaError::Begin]);
        assert_eq!(svc.state(), SessionState::Idle);
    }

    #[test]
    fn test_size_mismatch() {
        let (mut svc, port, host, rec) = service(StagedStorage::new(4096));
        svc.begin().unwrap();
        let conn = MockConnection::new();
        conn.push(format!("0 10 {EMPTY_MD5}\n"));
        conn.push_after_writes([1u8; 12], 2);
        port.connect(conn.clone());
        svc.tick().unwrap();

        assert_eq!(
            conn.replies().last().unwrap(),
            "ERR: Receive Failed: SIZE MISMATCH"
        );
        assert_eq!(
            rec.errors(),
            vec![
                OtaError::Receive(ReceiveFailure::SizeMismatch),
                OtaError::End
            ]
        );
        assert_eq!(svc.state(), SessionState::Idle);
        assert_eq!(host.reboot_count(), 0);
    }

    #[test]
    fn test_capacity_overflow() {
        let sink = LenientSink {
            capacity: 64,
            data: Vec::new(),
        };
        let (mut svc, port, _host, rec) = service(sink);
        svc.begin().unwrap();
        let conn = MockConnection::new();
        conn.push(format!("0 65 {EMPTY_MD5}\n"));
        conn.push_after_writes([0u8; 64], 2);
        conn.push_after_writes([0u8; 1], 3);
        port.connect(conn.clone());
        svc.tick().unwrap();

        assert_eq!(conn.replies()[2], "64");
        assert_eq!(
            conn.replies().last().unwrap(),
            "ERR: Receive Failed: SIZE OVERFLOW"
        );
        assert_eq!(
            rec.errors(),
            vec![OtaError::Receive(ReceiveFailure::Overflow), OtaError::End]
        );
        assert!(svc.storage().data.is_empty());
    }

    #[test]
    fn test_receive_timeout() {
        let (mut svc, port, host, rec) = service(StagedStorage::new(4096));
        svc.begin().unwrap();
        let conn = MockConnection::new();
        conn.push(format!("0 100 {EMPTY_MD5}\n"));
        conn.push_after_writes([7u8; 60], 2);
        port.connect(conn.clone());

        let before = host.millis();
        svc.tick().unwrap();

        assert_eq!(
            conn.replies()[2..],
            ["60", "ERR: Receive Failed: TIMEOUT"]
        );
        assert_eq!(
            rec.errors(),
            vec![OtaError::Receive(ReceiveFailure::Timeout), OtaError::End]
        );
        assert!(host.millis() - before >= 1000);
        // The receive timeout ends the session inside the same tick.
        assert_eq!(svc.state(), SessionState::Idle);
        assert!(svc.storage().staged().is_none());
        assert_eq!(host.reboot_count(), 0);
    }

    #[test]
    fn test_peer_leaves_mid_upload() {
        let (mut svc, port, host, rec) = service(StagedStorage::new(4096));
        svc.begin().unwrap();
        let conn = MockConnection::new();
        conn.push(format!("0 100 {EMPTY_MD5}\n"));
        conn.push_after_writes([7u8; 60], 2);
        conn.hangup_after_writes(3);
        port.connect(conn.clone());
        svc.tick().unwrap();

        assert_eq!(conn.replies()[2..], ["60"]);
        assert_eq!(rec.errors(), vec![OtaError::End]);
        assert_eq!(svc.state(), SessionState::Idle);
        assert_eq!(host.reboot_count(), 0);
    }

    #[test]
    fn test_verified_upload_in_paced_chunks() {
        let (mut svc, port, _host, rec) = service(VerifyingStorage::new(8192));
        svc.set_reboot_on_success(false);
        svc.begin().unwrap();

        let payload: Vec<u8> = (0..5000u32).map(|i| (i * 7 % 251) as u8).collect();
        let conn = MockConnection::new();
        conn.push(format!("0 5000 {}\n", md5_hex(&payload)));
        for (i, chunk) in payload.chunks(2048).enumerate() {
            conn.push_after_writes(chunk, 2 + i);
        }
        port.connect(conn.clone());
        svc.tick().unwrap();

        assert_eq!(conn.replies()[2..], ["2048", "2048", "904", "OK"]);
        let committed = svc.storage().committed().unwrap();
        assert_eq!(committed.data, payload);
        assert_eq!(committed.kind, UpdateKind::Flash);
        assert_eq!(rec.count(&OtaEvent::End), 1);
        assert_eq!(svc.host().reboot_count(), 0);
    }

    #[test]
    fn test_byte_at_a_time_matches_single_burst() {
        let payload: Vec<u8> = (0..100u8).map(|b| b.wrapping_mul(37)).collect();

        let (mut svc, port, _host, rec) = service(VerifyingStorage::new(1024));
        svc.set_reboot_on_success(false);
        svc.begin().unwrap();
        let conn = MockConnection::new();
        conn.push(format!("0 100 {}\n", md5_hex(&payload)));
        for (i, b) in payload.iter().enumerate() {
            conn.push_after_writes([*b], 2 + i);
        }
        port.connect(conn.clone());
        svc.tick().unwrap();

        let replies = conn.replies();
        assert_eq!(replies.len(), 2 + payload.len() + 1);
        assert!(replies[2..2 + payload.len()].iter().all(|ack| ack == "1"));
        assert_eq!(replies.last().map(String::as_str), Some("OK"));
        assert_eq!(svc.storage().committed().unwrap().data, payload);
        assert_eq!(rec.progress().len(), payload.len() + 1);

        let (mut svc, port, _host, _rec) = service(VerifyingStorage::new(1024));
        svc.set_reboot_on_success(false);
        svc.begin().unwrap();
        let conn = MockConnection::new();
        conn.push(format!("0 100 {}\n", md5_hex(&payload)));
        conn.push_after_writes(&payload, 2);
        port.connect(conn.clone());
        svc.tick().unwrap();

        assert_eq!(conn.replies()[2..], ["100", "OK"]);
        assert_eq!(svc.storage().committed().unwrap().data, payload);
    }

    #[test]
    fn test_payload_ahead_of_ready_reply_is_kept() {
        let (mut svc, port, _host, _rec) = service(VerifyingStorage::new(1024));
        svc.set_reboot_on_success(false);
        svc.begin().unwrap();

        let payload = vec![0x3Cu8; 64];
        let conn = MockConnection::new();
        conn.push(format!("0 64 {}\n", md5_hex(&payload)));
        // Streamed as soon as the invitation went out.
        conn.push_after_writes(&payload, 1);
        port.connect(conn.clone());
        svc.tick().unwrap();

        assert_eq!(conn.replies()[1..], ["OK", "64", "OK"]);
        assert_eq!(svc.storage().committed().unwrap().data, payload);
    }

    #[test]
    fn test_digest_mismatch() {
        let (mut svc, port, host, rec) = service(VerifyingStorage::new(1024));
        svc.begin().unwrap();
        let conn = MockConnection::new();
        conn.push(format!("100 4 {}\n", md5_hex("abcd")));
        conn.push_after_writes("abce", 2);
        port.connect(conn.clone());
        svc.tick().unwrap();

        assert_eq!(svc.command(), Some(UpdateKind::Filesystem));
        let last = conn.replies().last().unwrap().clone();
        assert!(last.starts_with("ERR: MD5 Check Failed"), "{last}");
        assert_eq!(rec.errors(), vec![OtaError::End]);
        assert_eq!(rec.count(&OtaEvent::End), 0);
        assert!(svc.storage().committed().is_none());
        assert_eq!(host.reboot_count(), 0);
    }

    #[test]
    fn test_begin_is_idempotent() {
        let (mut svc, port, _host, _rec) = service(StagedStorage::new(4096));
        svc.set_hostname("first");
        svc.set_hostname("second");
        svc.begin().unwrap();
        assert_eq!(port.listening_on(), Some(DEFAULT_PORT));

        svc.set_hostname("third");
        svc.set_port(9000);
        svc.begin().unwrap();
        assert_eq!(svc.hostname(), "first");
        assert_eq!(port.listening_on(), Some(DEFAULT_PORT));

        svc.reconnect();
        assert!(!svc.is_running());
        assert_eq!(port.listening_on(), None);
        svc.begin().unwrap();
        assert_eq!(port.listening_on(), Some(DEFAULT_PORT));
    }

    #[test]
    fn test_tick_before_begin_is_noop() {
        let (mut svc, port, _host, rec) = service(StagedStorage::new(4096));
        let conn = MockConnection::new();
        conn.push(format!("0 100 {EMPTY_MD5}\n"));
        port.connect(conn.clone());
        svc.tick().unwrap();
        assert!(conn.replies().is_empty());
        assert!(rec.events().is_empty());
    }

    #[test]
    fn test_apply_config() {
        let (mut svc, _port, _host, _rec) = service(StagedStorage::new(4096));
        let config = OtaConfig {
            port: 9100,
            hostname: "bench".into(),
            password_hash: Some(md5_hex("secret").to_uppercase()),
            reboot_on_success: false,
            ..Default::default()
        };
        svc.apply_config(&config);
        svc.begin().unwrap();
        assert_eq!(svc.settings().port, 9100);
        assert_eq!(svc.hostname(), "bench");
        assert_eq!(
            svc.settings().password_digest.as_deref(),
            Some(md5_hex("secret").as_str())
        );
        assert!(!svc.settings().reboot_on_success);
    }

    #[test]
    fn test_discovery_polled_from_tick() {
        let socket = MockDatagram::new();
        let port = MockPort::new();
        let mut svc = OtaService::with_observer(
            port,
            StagedStorage::new(4096),
            MockHost::new(),
            Rc::new(Recorder::default()),
        )
        .with_discovery(DiscoveryResponder::new(Box::new(socket.clone())));
        svc.begin().unwrap();

        socket.inject(
            br#"{"m":"NOTA_DISCOVERY","t":"disc_req","nonce":"n1"}"#,
            "10.0.0.9:5555".parse().unwrap(),
        );
        svc.tick().unwrap();

        let sent = socket.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "10.0.0.9:8268".parse().unwrap());
    }
}
