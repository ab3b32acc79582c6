//! Wire protocol: constants, command codes, lexer and replies.

pub mod command;
pub mod constants;
pub mod parser;
pub mod reply;

pub use command::{AuthCommand, UpdateKind};
pub use reply::{Metadata, ReplyFormat};
