//! Per-state request handlers.
//!
//! - `idle`: parses the update invitation
//! - `auth`: verifies the challenge response
//! - `update`: streams the image into storage and finalizes it

mod auth;
mod idle;
mod update;

pub use auth::handle_auth;
pub use idle::handle_idle;
pub use update::handle_update;

use tracing::{debug, warn};

use crate::config::Settings;
use crate::events::{OtaEvent, OtaObserver, SessionState};
use crate::host::Host;
use crate::state::machine::StateMachineContext;
use crate::storage::StorageSink;
use crate::transport::Connection;

/// Outcome of one handler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleResult {
    /// Input did not form a known command and was dropped.
    Ignored,
    /// Reply sent and the session moved on.
    Continue,
    /// Request refused with the given error reply.
    Rejected(String),
    /// Challenge response verified for a test command.
    Verified,
    /// Image received, verified and applied.
    Complete,
    /// Upload aborted.
    Failed(String),
}

/// Everything a handler may touch while serving one peer.
pub struct HandlerContext<'a, C, S, H, O>
where
    C: Connection + ?Sized,
    S: StorageSink + ?Sized,
    H: Host + ?Sized,
    O: OtaObserver + ?Sized,
{
    pub conn: &'a mut C,
    pub storage: &'a mut S,
    pub host: &'a H,
    pub observer: &'a O,
    pub machine: &'a mut StateMachineContext,
    pub settings: &'a Settings,
}

impl<C, S, H, O> HandlerContext<'_, C, S, H, O>
where
    C: Connection + ?Sized,
    S: StorageSink + ?Sized,
    H: Host + ?Sized,
    O: OtaObserver + ?Sized,
{
    pub(crate) fn emit(&self, event: OtaEvent) {
        self.observer.on_event(&event);
    }

    /// Transition and notify the observer when the state actually changes.
    pub(crate) fn goto(&mut self, to: SessionState) {
        let from = self.machine.state;
        self.machine.goto_state(to, self.host.millis());
        if from != to {
            self.emit(OtaEvent::StateChanged { from, to });
        }
    }

    /// Send a text reply. Replies are best effort: a failed write surfaces
    /// later as a disconnected peer.
    pub(crate) fn reply(&mut self, text: &str) {
        debug!(reply = text, "Reply");
        if let Err(e) = self.conn.write(text.as_bytes()) {
            warn!(error = %e, "Reply not delivered");
        }
    }

    pub(crate) fn flush(&mut self) {
        if let Err(e) = self.conn.flush() {
            warn!(error = %e, "Flush failed");
        }
    }
}
