//! Protocol timing constants shared between server components and tests.

/// Idle interval after which the server sends a PING.
///
/// Browser clients never ping on their own, and mobile clients on
/// power-savers send nothing either, so keep-alive is entirely
/// server-driven.
pub const PING_PERIOD_SECS: u64 = 60;

/// After a PING is written we expect *something* (pong or data) within
/// this window, or the connection is considered dead.
pub const PONG_WAIT_SECS: u64 = 20;

/// Granularity of the keep-alive scanner. Worst-case detection delay:
/// `PING_PERIOD_SECS + PONG_WAIT_SECS + KEEPALIVE_SCAN_SECS`.
pub const KEEPALIVE_SCAN_SECS: u64 = 2;

/// An admitted caller that has not produced a peer connection after this
/// many seconds is dropped from the hub. Devices coming out of deep sleep
/// can take 6-8 s to answer, so this must stay comfortably above that.
pub const NO_PEER_CON_SECS: u64 = 11;

/// Waiting callers older than this are pruned when the callee attaches.
pub const WAITING_CALLER_MAX_AGE_SECS: i64 = 10 * 60;

/// Pause before force-closing a signaling socket once media is up.
pub const POST_MEDIA_CLOSE_DELAY_MS: u64 = 20;

/// A hub whose callee slot stays empty this long is evicted.
pub const VACANT_HUB_GRACE_SECS: u64 = 10;

/// Two missed-call records within this window for the same caller address
/// are treated as duplicates.
pub const MISSED_CALL_DEDUPE_SECS: i64 = 1;

/// A command token may not be longer than this; the `|` separator must
/// appear within this prefix.
pub const MAX_CMD_LEN: usize = 32;
