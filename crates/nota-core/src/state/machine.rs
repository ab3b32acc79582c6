//! Session state machine context.

use tracing::info;

use crate::events::SessionState;
use crate::protocol::UpdateKind;
use crate::protocol::constants::STATE_TIMEOUT_MS;

/// Metadata of the upload being negotiated or received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpdate {
    pub kind: UpdateKind,
    /// Declared image size in bytes.
    pub size: usize,
    /// Declared MD5 of the image.
    pub digest: String,
}

/// Runtime state of one OTA session.
#[derive(Debug, Default)]
pub struct StateMachineContext {
    /// Current protocol state.
    pub state: SessionState,
    /// Valid only while `state` is not Idle.
    pub pending: Option<PendingUpdate>,
    /// Present only while `state` is AwaitingAuth.
    pub nonce: Option<String>,
    /// Kind of the most recent accepted request.
    pub last_command: Option<UpdateKind>,
    auth_deadline_ms: u64,
    /// The service receives an image within the tick that enters
    /// Receiving, so only a session parked in Receiving by a direct
    /// caller of `goto_state` can reach this deadline.
    update_deadline_ms: u64,
}

impl StateMachineContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transition to a new state, arming or clearing the per-state data.
    pub fn goto_state(&mut self, new_state: SessionState, now_ms: u64) {
        if self.state != new_state {
            info!(from = %self.state, to = %new_state, "State transition");
        }
        if self.state == SessionState::AwaitingAuth && new_state != SessionState::AwaitingAuth {
            self.nonce = None;
        }
        match new_state {
            SessionState::Idle => {
                self.pending = None;
                self.nonce = None;
            }
            SessionState::AwaitingAuth => {
                self.auth_deadline_ms = now_ms + STATE_TIMEOUT_MS;
            }
            SessionState::Receiving => {
                self.update_deadline_ms = now_ms + STATE_TIMEOUT_MS;
            }
        }
        self.state = new_state;
    }

    /// Force Idle when the current waiting state outlived its deadline.
    /// Returns the state that expired.
    pub fn expire(&mut self, now_ms: u64) -> Option<SessionState> {
        let deadline = match self.state {
            SessionState::Idle => return None,
            SessionState::AwaitingAuth => self.auth_deadline_ms,
            SessionState::Receiving => self.update_deadline_ms,
        };
        if now_ms <= deadline {
            return None;
        }
        let expired = self.state;
        self.goto_state(SessionState::Idle, now_ms);
        Some(expired)
    }

    /// Declared size of the pending upload, 0 if none.
    pub fn declared_size(&self) -> usize {
        self.pending.as_ref().map_or(0, |p| p.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending() -> PendingUpdate {
        PendingUpdate {
            kind: UpdateKind::Flash,
            size: 10,
            digest: "d41d8cd98f00b204e9800998ecf8427e".into(),
        }
    }

    #[test]
    fn test_idle_clears_pending_and_nonce() {
        let mut ctx = StateMachineContext::new();
        ctx.pending = Some(pending());
        ctx.goto_state(SessionState::AwaitingAuth, 0);
        ctx.nonce = Some("n".into());
        ctx.goto_state(SessionState::Idle, 1);
        assert!(ctx.pending.is_none());
        assert!(ctx.nonce.is_none());
    }

    #[test]
    fn test_leaving_auth_invalidates_nonce() {
        let mut ctx = StateMachineContext::new();
        ctx.pending = Some(pending());
        ctx.goto_state(SessionState::AwaitingAuth, 0);
        ctx.nonce = Some("n".into());
        ctx.goto_state(SessionState::Receiving, 1);
        assert!(ctx.nonce.is_none());
        assert_eq!(ctx.declared_size(), 10);
    }

    #[test]
    fn test_deadline_expiry() {
        let mut ctx = StateMachineContext::new();
        assert_eq!(ctx.expire(1_000_000), None);

        ctx.goto_state(SessionState::AwaitingAuth, 1000);
        assert_eq!(ctx.expire(1000 + STATE_TIMEOUT_MS), None);
        assert_eq!(
            ctx.expire(1001 + STATE_TIMEOUT_MS),
            Some(SessionState::AwaitingAuth)
        );
        assert_eq!(ctx.state, SessionState::Idle);

        ctx.goto_state(SessionState::Receiving, 0);
        assert_eq!(ctx.expire(STATE_TIMEOUT_MS + 1), Some(SessionState::Receiving));
    }
}
