//! Challenge response: `<200|201> <cnonce> <response>\n`.

use tracing::{info, warn};

use super::{HandleResult, HandlerContext};
use crate::digest::{DIGEST_HEX_LEN, challenge_response};
use crate::error::OtaError;
use crate::events::{OtaEvent, OtaObserver, SessionState};
use crate::host::Host;
use crate::protocol::AuthCommand;
use crate::protocol::constants::{
    REPLY_ERR_AUTH, REPLY_ERR_CMD, REPLY_ERR_KEY, REPLY_ERR_SIZE, REPLY_OK,
};
use crate::protocol::parser::{drain, read_int, read_string_until, skip_byte};
use crate::storage::StorageSink;
use crate::transport::Connection;

pub fn handle_auth<C, S, H, O>(ctx: &mut HandlerContext<'_, C, S, H, O>) -> HandleResult
where
    C: Connection + ?Sized,
    S: StorageSink + ?Sized,
    H: Host + ?Sized,
    O: OtaObserver + ?Sized,
{
    let Some(command) = read_int(ctx.conn).and_then(AuthCommand::from_code) else {
        warn!("Expected an authentication command");
        return reject(ctx, REPLY_ERR_CMD);
    };

    if command == AuthCommand::Auth && ctx.machine.declared_size() == 0 {
        warn!("Authenticated upload of an empty image refused");
        return reject(ctx, REPLY_ERR_SIZE);
    }

    skip_byte(ctx.conn);
    let cnonce = read_string_until(ctx.conn, b' ').unwrap_or_default();
    let response = read_string_until(ctx.conn, b'\n')
        .map(|s| s.trim_end_matches('\r').to_string())
        .unwrap_or_default();
    drain(ctx.conn);

    if cnonce.len() != DIGEST_HEX_LEN || response.len() != DIGEST_HEX_LEN {
        warn!(
            cnonce_len = cnonce.len(),
            response_len = response.len(),
            "Malformed challenge response"
        );
        return reject(ctx, REPLY_ERR_KEY);
    }

    let settings = ctx.settings;
    let expected = match (&settings.password_digest, &ctx.machine.nonce) {
        (Some(password), Some(nonce)) => Some(challenge_response(password, nonce, &cnonce)),
        _ => None,
    };

    if expected.as_deref() != Some(response.as_str()) {
        warn!("Authentication failed");
        ctx.reply(REPLY_ERR_AUTH);
        ctx.host.delay_ms(100);
        ctx.emit(OtaEvent::Error(OtaError::Auth));
        ctx.goto(SessionState::Idle);
        return HandleResult::Rejected(REPLY_ERR_AUTH.to_string());
    }

    info!(?command, "Authentication OK");
    match command {
        AuthCommand::Test => {
            ctx.goto(SessionState::Idle);
            ctx.host.delay_ms(100);
            ctx.reply(REPLY_OK);
            ctx.host.delay_ms(100);
            drain(ctx.conn);
            HandleResult::Verified
        }
        AuthCommand::Auth => {
            ctx.goto(SessionState::Receiving);
            HandleResult::Continue
        }
    }
}

fn reject<C, S, H, O>(ctx: &mut HandlerContext<'_, C, S, H, O>, reply: &str) -> HandleResult
where
    C: Connection + ?Sized,
    S: StorageSink + ?Sized,
    H: Host + ?Sized,
    O: OtaObserver + ?Sized,
{
    drain(ctx.conn);
    ctx.reply(reply);
    ctx.goto(SessionState::Idle);
    HandleResult::Rejected(reply.to_string())
}
