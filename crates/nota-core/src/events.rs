//! Event system for embedding code.
//!
//! Exposes the request/start/progress/end/error hooks of the OTA session,
//! plus state and connection notifications, without coupling the session to
//! any particular reaction.

use std::fmt;
use std::net::SocketAddr;

use crate::error::OtaError;

/// Session protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Waiting for an update request.
    #[default]
    Idle,
    /// Challenge sent, waiting for the response.
    AwaitingAuth,
    /// Streaming the image into storage.
    Receiving,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "IDLE"),
            SessionState::AwaitingAuth => write!(f, "WAITAUTH"),
            SessionState::Receiving => write!(f, "RUNUPDATE"),
        }
    }
}

/// Events emitted by the OTA session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaEvent {
    /// A peer with pending data was picked up.
    ClientConnected { addr: Option<SocketAddr> },
    /// State changed.
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    /// Upload accepted and storage opened.
    Request,
    /// Payload intake is starting.
    Start,
    /// Bytes written so far out of the declared size.
    Progress { written: u64, total: u64 },
    /// Image written and committed.
    End,
    /// Failure.
    Error(OtaError),
}

/// Observer trait for receiving OTA events.
///
/// Runs inline on the service loop; implementations must return promptly
/// since protocol deadlines keep running while they execute.
pub trait OtaObserver {
    fn on_event(&self, event: &OtaEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl OtaObserver for NullObserver {
    fn on_event(&self, _event: &OtaEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl OtaObserver for TracingObserver {
    fn on_event(&self, event: &OtaEvent) {
        match event {
            OtaEvent::ClientConnected { addr } => {
                tracing::info!(peer = ?addr, "Client connected");
            }
            OtaEvent::StateChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "State changed");
            }
            OtaEvent::Request => tracing::info!("OTA request accepted"),
            OtaEvent::Start => tracing::info!("OTA update started"),
            OtaEvent::Progress { written, total } => {
                let pct = if *total > 0 {
                    (*written * 100) / *total
                } else {
                    0
                };
                tracing::debug!(written, total, progress = %format!("{}%", pct), "Progress");
            }
            OtaEvent::End => tracing::info!("OTA update finished"),
            OtaEvent::Error(err) => tracing::error!(error = %err, "OTA error"),
        }
    }
}

type Hook = Box<dyn Fn()>;

/// Closure registry mirroring the classic `onStart`/`onProgress`/... API.
#[derive(Default)]
pub struct Callbacks {
    request: Option<Hook>,
    start: Option<Hook>,
    end: Option<Hook>,
    error: Option<Box<dyn Fn(OtaError)>>,
    progress: Option<Box<dyn Fn(u64, u64)>>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_request(mut self, f: impl Fn() + 'static) -> Self {
        self.request = Some(Box::new(f));
        self
    }

    pub fn on_start(mut self, f: impl Fn() + 'static) -> Self {
        self.start = Some(Box::new(f));
        self
    }

    pub fn on_end(mut self, f: impl Fn() + 'static) -> Self {
        self.end = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(OtaError) + 'static) -> Self {
        self.error = Some(Box::new(f));
        self
    }

    pub fn on_progress(mut self, f: impl Fn(u64, u64) + 'static) -> Self {
        self.progress = Some(Box::new(f));
        self
    }
}

impl OtaObserver for Callbacks {
    fn on_event(&self, event: &OtaEvent) {
        match event {
            OtaEvent::Request => {
                if let Some(f) = &self.request {
                    f();
                }
            }
            OtaEvent::Start => {
                if let Some(f) = &self.start {
                    f();
                }
            }
            OtaEvent::End => {
                if let Some(f) = &self.end {
                    f();
                }
            }
            OtaEvent::Error(err) => {
                if let Some(f) = &self.error {
                    f(*err);
                }
            }
            OtaEvent::Progress { written, total } => {
                if let Some(f) = &self.progress {
                    f(*written, *total);
                }
            }
            OtaEvent::ClientConnected { .. } | OtaEvent::StateChanged { .. } => {}
        }
    }
}

impl<A: OtaObserver, B: OtaObserver> OtaObserver for (A, B) {
    fn on_event(&self, event: &OtaEvent) {
        self.0.on_event(event);
        self.1.on_event(event);
    }
}

impl<O: OtaObserver + ?Sized> OtaObserver for std::rc::Rc<O> {
    fn on_event(&self, event: &OtaEvent) {
        (**self).on_event(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[test]
    fn test_callbacks_dispatch() {
        let progress = Rc::new(RefCell::new(Vec::new()));
        let ended = Rc::new(Cell::new(false));
        let errors = Rc::new(RefCell::new(Vec::new()));

        let p = progress.clone();
        let e = ended.clone();
        let r = errors.clone();
        let callbacks = Callbacks::new()
            .on_progress(move |w, t| p.borrow_mut().push((w, t)))
            .on_end(move || e.set(true))
            .on_error(move |err| r.borrow_mut().push(err));

        callbacks.on_event(&OtaEvent::Progress {
            written: 10,
            total: 20,
        });
        callbacks.on_event(&OtaEvent::End);
        callbacks.on_event(&OtaEvent::Error(OtaError::Auth));
        callbacks.on_event(&OtaEvent::Request);

        assert_eq!(*progress.borrow(), vec![(10, 20)]);
        assert!(ended.get());
        assert_eq!(*errors.borrow(), vec![OtaError::Auth]);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::AwaitingAuth.to_string(), "WAITAUTH");
        assert_eq!(SessionState::default(), SessionState::Idle);
    }
}
