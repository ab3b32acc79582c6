//! Transport layer module.

pub mod mock;
pub mod tcp;
pub mod traits;

pub use mock::{MockConnection, MockPort};
pub use tcp::{TcpConnection, TcpPort};
pub use traits::{Connection, TransportError, TransportPort};
