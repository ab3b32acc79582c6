//! State machine module.

pub mod handlers;
pub mod machine;

pub use handlers::{HandleResult, HandlerContext, handle_auth, handle_idle, handle_update};
pub use machine::{PendingUpdate, StateMachineContext};
