//! NOTA-Core: over-the-air firmware update endpoint and uploader.
//!
//! An endpoint accepts an image over a plain TCP byte stream, optionally
//! authenticates the uploader with an MD5 nonce challenge, streams the image
//! into storage with per-chunk acknowledgements and reboots into it.
//!
//! # Architecture
//!
//! - **Protocol**: Constants, command codes, lenient lexer, reply formatting
//! - **Transport**: Listening port / connection abstraction (std TCP, mock)
//! - **Storage**: Where the image lands (verifying buffer, staged region)
//! - **Host**: Clock, delays and reboot (std, mock)
//! - **State**: Session state machine and per-state handlers
//! - **Events**: Observer pattern for embedding code
//! - **Service**: The session object polled from the main loop
//! - **Discovery**: UDP responder and probe
//! - **Client**: Uploader speaking the same protocol
//!
//! # Example
//!
//! ```no_run
//! use nota_core::{OtaService, StdHost, TcpPort, VerifyingStorage};
//!
//! let mut ota = OtaService::new(TcpPort::new(), VerifyingStorage::new(1 << 20), StdHost::new());
//! ota.set_hostname("bench-node");
//! ota.set_password("admin");
//! ota.begin().expect("listen failed");
//! loop {
//!     ota.tick().expect("listener failed");
//!     std::thread::sleep(std::time::Duration::from_millis(5));
//! }
//! ```

pub mod client;
pub mod config;
pub mod digest;
pub mod discovery;
pub mod error;
pub mod events;
pub mod host;
pub mod protocol;
pub mod service;
pub mod state;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use client::{ClientError, UploadReport, Uploader};
pub use config::{OtaConfig, Settings, StorageBackend, StorageConfig};
pub use discovery::{DiscoveryError, DiscoveryReply, DiscoveryResponder, probe};
pub use error::{OtaError, ReceiveFailure};
pub use events::{Callbacks, NullObserver, OtaEvent, OtaObserver, SessionState, TracingObserver};
pub use host::{Host, MockHost, StdHost};
pub use protocol::{AuthCommand, ReplyFormat, UpdateKind};
pub use service::OtaService;
pub use storage::{StagedStorage, StorageError, StorageSink, VerifyingStorage};
pub use transport::{Connection, MockConnection, MockPort, TcpPort, TransportError, TransportPort};
