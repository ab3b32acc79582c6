//! Lenient lexer for the line-oriented command syntax.
//!
//! Reads straight off a `Connection` without buffering the whole line.
//! Malformed input never fails the connection: absent or garbled fields come
//! back as `None` and the caller validates.

use super::constants::MAX_INT_FIELD;
use crate::transport::Connection;

/// Read an unsigned decimal field.
///
/// Skips leading spaces, then consumes at most `MAX_INT_FIELD` characters up
/// to a space, CR or LF. A CR/LF terminator is consumed, a space is left for
/// the caller. Returns the leading digits, or `None` if there are none.
pub fn read_int<C: Connection + ?Sized>(conn: &mut C) -> Option<u64> {
    while conn.available() > 0 && conn.peek() == Some(b' ') {
        conn.read();
    }

    let mut scratch = [0u8; MAX_INT_FIELD];
    let mut len = 0;
    let mut consumed = 0;
    while consumed < MAX_INT_FIELD && conn.available() > 0 {
        let Some(next) = conn.peek() else { break };
        if next == 0 || next == b' ' {
            break;
        }
        conn.read();
        consumed += 1;
        if next == b'\n' || next == b'\r' {
            break;
        }
        scratch[len] = next;
        len += 1;
    }

    let digits = scratch[..len]
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .count();
    if digits == 0 {
        return None;
    }
    std::str::from_utf8(&scratch[..digits]).ok()?.parse().ok()
}

/// Read characters until `delimiter`, a NUL byte or the end of the
/// currently available data. The delimiter is consumed and not returned.
///
/// Returns `None` when nothing was read.
pub fn read_string_until<C: Connection + ?Sized>(conn: &mut C, delimiter: u8) -> Option<String> {
    let mut bytes = Vec::new();
    while let Some(b) = conn.read() {
        if b == 0 || b == delimiter {
            break;
        }
        bytes.push(b);
    }
    if bytes.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Consume one separator byte.
pub fn skip_byte<C: Connection + ?Sized>(conn: &mut C) {
    conn.read();
}

/// Discard everything currently available. Returns the number of bytes
/// dropped.
pub fn drain<C: Connection + ?Sized>(conn: &mut C) -> usize {
    let mut dropped = 0;
    while conn.available() > 0 {
        if conn.read().is_none() {
            break;
        }
        dropped += 1;
    }
    dropped
}
