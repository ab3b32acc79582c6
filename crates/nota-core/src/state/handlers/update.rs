//! Image intake: open storage, stream chunks with per-chunk acknowledgements,
//! then verify, apply and reboot.

use tracing::{error, info, warn};

use super::{HandleResult, HandlerContext};
use crate::error::{OtaError, ReceiveFailure};
use crate::events::{OtaEvent, OtaObserver, SessionState};
use crate::host::Host;
use crate::protocol::constants::{IDLE_WAIT_BUDGET, IDLE_WAIT_STEP_MS, RECEIVE_CHUNK, REPLY_OK};
use crate::protocol::parser::drain;
use crate::protocol::reply;
use crate::storage::StorageSink;
use crate::transport::Connection;

pub fn handle_update<C, S, H, O>(ctx: &mut HandlerContext<'_, C, S, H, O>) -> HandleResult
where
    C: Connection + ?Sized,
    S: StorageSink + ?Sized,
    H: Host + ?Sized,
    O: OtaObserver + ?Sized,
{
    let Some(pending) = ctx.machine.pending.clone() else {
        warn!("Receiving without a pending request");
        ctx.goto(SessionState::Idle);
        return HandleResult::Failed("no pending request".into());
    };

    if let Err(e) = ctx.storage.open(pending.size, pending.kind) {
        let reason = ctx.storage.last_error().unwrap_or_else(|| e.to_string());
        warn!(error = %reason, "Update begin failed");
        ctx.reply(&reply::failure(&reason));
        ctx.emit(OtaEvent::Error(OtaError::Begin));
        ctx.host.delay_ms(50);
        drain(ctx.conn);
        ctx.goto(SessionState::Idle);
        return HandleResult::Failed(reason);
    }

    // Payload sent ahead of the ready reply stays queued for `receive`.
    info!(kind = %pending.kind, size = pending.size, "Update started");
    ctx.emit(OtaEvent::Request);
    ctx.emit(OtaEvent::Start);
    ctx.reply(REPLY_OK);
    ctx.storage.set_expected_digest(&pending.digest);
    ctx.emit(OtaEvent::Progress {
        written: 0,
        total: pending.size as u64,
    });
    ctx.host.delay_ms(500);

    let received = receive(ctx, pending.size);
    finish(ctx, pending.size, received)
}

/// Pull payload until the declared size arrived, the peer left, or a
/// failure. Returns the byte count written to storage.
fn receive<C, S, H, O>(
    ctx: &mut HandlerContext<'_, C, S, H, O>,
    declared: usize,
) -> Result<usize, ReceiveFailure>
where
    C: Connection + ?Sized,
    S: StorageSink + ?Sized,
    H: Host + ?Sized,
    O: OtaObserver + ?Sized,
{
    let capacity = ctx.storage.capacity();
    let mut buf = [0u8; RECEIVE_CHUNK];
    let mut total = 0usize;
    let mut budget = IDLE_WAIT_BUDGET;

    while ctx.machine.state == SessionState::Receiving
        && (ctx.conn.connected() || ctx.conn.available() > 0)
    {
        if ctx.conn.available() == 0 {
            if budget == 0 {
                warn!(total, declared, "Receive timed out");
                return Err(ReceiveFailure::Timeout);
            }
            budget -= 1;
            ctx.host.delay_ms(IDLE_WAIT_STEP_MS);
            continue;
        }
        budget = IDLE_WAIT_BUDGET;

        let mut batch = 0usize;
        while ctx.conn.available() > 0 {
            let n = ctx.conn.read_chunk(&mut buf);
            if n == 0 {
                break;
            }
            let after = total + batch + n;
            if after > capacity {
                warn!(after, capacity, "Image exceeds storage capacity");
                return Err(ReceiveFailure::Overflow);
            }
            if after > declared {
                warn!(after, declared, "Image exceeds declared size");
                return Err(ReceiveFailure::SizeMismatch);
            }
            if let Err(e) = ctx.storage.write(&buf[..n]) {
                warn!(error = %e, "Storage write failed");
                return Err(ReceiveFailure::Write);
            }
            batch += n;
        }

        if batch > 0 {
            ctx.reply(&batch.to_string());
            total += batch;
            ctx.emit(OtaEvent::Progress {
                written: total as u64,
                total: declared as u64,
            });
            if total >= declared {
                break;
            }
        }
    }

    Ok(total)
}

fn finish<C, S, H, O>(
    ctx: &mut HandlerContext<'_, C, S, H, O>,
    declared: usize,
    received: Result<usize, ReceiveFailure>,
) -> HandleResult
where
    C: Connection + ?Sized,
    S: StorageSink + ?Sized,
    H: Host + ?Sized,
    O: OtaObserver + ?Sized,
{
    let outcome = match received {
        Err(failure) => {
            ctx.emit(OtaEvent::Error(OtaError::Receive(failure)));
            Err(OtaError::Receive(failure).to_string())
        }
        Ok(total) if total != declared => {
            warn!(total, declared, "Peer left before the image was complete");
            Err(format!("Incomplete image: {total} of {declared} bytes"))
        }
        Ok(_) => ctx.storage.close().map_err(|e| e.to_string()),
    };

    match outcome {
        Ok(()) => commit(ctx, declared),
        Err(reason) => {
            let reason = ctx.storage.last_error().unwrap_or(reason);
            error!(error = %reason, "Update failed");
            ctx.emit(OtaEvent::Error(OtaError::End));
            ctx.reply(&reply::failure(&reason));
            ctx.storage.abort();
            ctx.goto(SessionState::Idle);
            drain(ctx.conn);
            HandleResult::Failed(reason)
        }
    }
}

fn commit<C, S, H, O>(ctx: &mut HandlerContext<'_, C, S, H, O>, size: usize) -> HandleResult
where
    C: Connection + ?Sized,
    S: StorageSink + ?Sized,
    H: Host + ?Sized,
    O: OtaObserver + ?Sized,
{
    info!(size, "Update success");
    ctx.emit(OtaEvent::End);

    // The final OK must reach the uploader before the link drops.
    ctx.flush();
    ctx.host.delay_ms(2000);
    ctx.reply(REPLY_OK);
    ctx.flush();
    ctx.host.delay_ms(1000);
    ctx.conn.close();
    ctx.host.delay_ms(100);

    if let Err(e) = ctx.storage.apply() {
        error!(error = %e, "Applying the staged image failed");
        ctx.emit(OtaEvent::Error(OtaError::End));
        ctx.goto(SessionState::Idle);
        return HandleResult::Failed(e.to_string());
    }
    ctx.goto(SessionState::Idle);

    if ctx.settings.reboot_on_success {
        ctx.host.delay_ms(1000);
        info!("Rebooting");
        ctx.host.reboot();
    } else {
        info!("Reboot on success disabled");
    }
    HandleResult::Complete
}
