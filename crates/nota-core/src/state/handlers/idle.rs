//! Update invitation: `<cmd> <size> <md5>\n`.

use tracing::{info, warn};

use super::{HandleResult, HandlerContext};
use crate::digest::{is_digest, md5_of_micros};
use crate::events::{OtaObserver, SessionState};
use crate::host::Host;
use crate::protocol::constants::{REPLY_ERR_HASH, REPLY_ERR_SIZE};
use crate::protocol::parser::{drain, read_int, read_string_until, skip_byte};
use crate::protocol::{UpdateKind, reply};
use crate::state::machine::PendingUpdate;
use crate::storage::StorageSink;
use crate::transport::Connection;

pub fn handle_idle<C, S, H, O>(ctx: &mut HandlerContext<'_, C, S, H, O>) -> HandleResult
where
    C: Connection + ?Sized,
    S: StorageSink + ?Sized,
    H: Host + ?Sized,
    O: OtaObserver + ?Sized,
{
    ctx.host.delay_ms(10);

    let Some(kind) = read_int(ctx.conn).and_then(UpdateKind::from_code) else {
        let dropped = drain(ctx.conn);
        warn!(dropped, "Unknown command, input discarded");
        return HandleResult::Ignored;
    };
    skip_byte(ctx.conn);
    let size = read_int(ctx.conn).unwrap_or(0) as usize;
    skip_byte(ctx.conn);
    let digest = read_string_until(ctx.conn, b'\n')
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    drain(ctx.conn);

    info!(%kind, size, digest = %digest, "Update request");

    let settings = ctx.settings;
    let meta = settings.metadata();

    if !is_digest(&digest) {
        warn!("Malformed MD5 in request");
        ctx.reply(&reply::invitation_hash_error(&meta));
        ctx.goto(SessionState::Idle);
        return HandleResult::Rejected(REPLY_ERR_HASH.to_string());
    }

    if settings.password_digest.is_none() && size == 0 {
        warn!("Empty image refused");
        ctx.reply(REPLY_ERR_SIZE);
        ctx.goto(SessionState::Idle);
        return HandleResult::Rejected(REPLY_ERR_SIZE.to_string());
    }

    ctx.machine.pending = Some(PendingUpdate { kind, size, digest });
    ctx.machine.last_command = Some(kind);

    if settings.password_digest.is_some() {
        let nonce = md5_of_micros(ctx.host.micros());
        ctx.goto(SessionState::AwaitingAuth);
        ctx.machine.nonce = Some(nonce.clone());
        ctx.reply(&reply::invitation_auth(&nonce, &meta));
    } else {
        ctx.reply(&reply::invitation_ok(&meta));
        ctx.goto(SessionState::Receiving);
    }
    ctx.host.delay_ms(100);
    HandleResult::Continue
}
