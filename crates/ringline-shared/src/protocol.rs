//! The signaling wire protocol.
//!
//! Every frame is TEXT, shaped `cmd|payload`. The command token is ASCII
//! and at most 32 bytes; the first `|` inside that prefix is the one and
//! only separator -- the payload may itself contain `|` characters and is
//! never split further.

use crate::constants::MAX_CMD_LEN;
use crate::error::ProtocolError;
use crate::types::ConnMode;

/// A borrowed view of one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub cmd: &'a str,
    pub payload: &'a str,
}

/// Split a raw frame into command and payload.
///
/// Frames without a `|` in the first [`MAX_CMD_LEN`] bytes are rejected;
/// the caller drops them without closing the socket.
pub fn parse_frame(raw: &str) -> Result<Frame<'_>, ProtocolError> {
    let prefix_len = raw.len().min(MAX_CMD_LEN);
    // scan bytes: the prefix cut may fall inside a multi-byte character,
    // but '|' is ASCII, so the split index is always a char boundary
    let idx = raw.as_bytes()[..prefix_len]
        .iter()
        .position(|&b| b == b'|')
        .ok_or(ProtocolError::MissingSeparator(MAX_CMD_LEN))?;
    if idx == 0 {
        return Err(ProtocolError::EmptyCommand);
    }
    Ok(Frame {
        cmd: &raw[..idx],
        payload: &raw[idx + 1..],
    })
}

/// The reserved command set. Anything else with a non-empty payload is
/// forwarded verbatim to the opposite endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Init,
    CallerOffer,
    Pickup,
    Cancel,
    Msg,
    MissedCall,
    CalleeHidden,
    DialSoundsMuted,
    PickupWaitingCaller,
    DeleteMissedCall,
    Log,
    Check,
    Heartbeat,
    RtcConnect,
    Dummy,
    /// Reserved for server-to-client use; never forwarded when received.
    ServerSent,
    /// Not reserved: subject to generic forwarding.
    Other,
}

impl Command {
    pub fn classify(cmd: &str) -> Self {
        match cmd {
            "init" => Command::Init,
            "callerOffer" => Command::CallerOffer,
            "pickup" => Command::Pickup,
            "cancel" => Command::Cancel,
            "msg" => Command::Msg,
            "missedcall" => Command::MissedCall,
            "calleeHidden" => Command::CalleeHidden,
            "dialsoundsmuted" => Command::DialSoundsMuted,
            "pickupWaitingCaller" => Command::PickupWaitingCaller,
            "deleteMissedCall" => Command::DeleteMissedCall,
            "log" => Command::Log,
            "check" => Command::Check,
            "heartbeat" => Command::Heartbeat,
            "rtcConnect" => Command::RtcConnect,
            "dummy" => Command::Dummy,
            "ua" | "callerInfo" | "sessionId" | "sessionDuration" | "status" | "callerConnect"
            | "confirm" | "missedCalls" | "waitingCallers" => Command::ServerSent,
            _ => Command::Other,
        }
    }
}

/// Connection state reported by a client in a `log|...` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConState {
    /// Ring is being presented on the callee side.
    Incoming,
    /// ICE/DTLS is up.
    Connected,
    /// Test clients report this instead of a real media connect.
    ConForce,
}

/// Parsed `log|<side> <constate> <localMode>/<remoteMode>` report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerReport {
    pub from_callee: bool,
    pub constate: ConState,
    pub local_mode: ConnMode,
    pub remote_mode: ConnMode,
}

impl PeerReport {
    pub fn parse(payload: &str) -> Result<Self, ProtocolError> {
        let mut tok = payload.split_whitespace();
        let side = tok
            .next()
            .ok_or_else(|| ProtocolError::BadPeerReport("empty".into()))?;
        let constate = match tok.next() {
            Some("Incoming") => ConState::Incoming,
            Some("Connected") => ConState::Connected,
            Some("ConForce") => ConState::ConForce,
            other => {
                return Err(ProtocolError::BadPeerReport(format!(
                    "constate {:?}",
                    other
                )))
            }
        };
        let modes = tok
            .next()
            .ok_or_else(|| ProtocolError::BadPeerReport("missing modes".into()))?;
        let (local, remote) = modes
            .split_once('/')
            .ok_or_else(|| ProtocolError::BadPeerReport(format!("modes '{}' has no slash", modes)))?;
        Ok(Self {
            from_callee: side == "callee",
            constate,
            local_mode: ConnMode::from_token(local),
            remote_mode: ConnMode::from_token(remote),
        })
    }

    pub fn fully_p2p(&self) -> bool {
        self.local_mode.is_p2p() && self.remote_mode.is_p2p()
    }
}

/// Collapse a caller-supplied text message to a single trimmed line.
pub fn sanitize_text_msg(raw: &str) -> String {
    raw.replace(['\n', '\r'], " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frame_splits_on_first_pipe() {
        let f = parse_frame("callerOffer|{\"sdp\":\"a|b|c\"}").unwrap();
        assert_eq!(f.cmd, "callerOffer");
        assert_eq!(f.payload, "{\"sdp\":\"a|b|c\"}");
    }

    #[test]
    fn test_parse_frame_empty_payload() {
        let f = parse_frame("init|").unwrap();
        assert_eq!(f.cmd, "init");
        assert_eq!(f.payload, "");
    }

    #[test]
    fn test_parse_frame_rejects_missing_pipe() {
        assert!(parse_frame("noseparator").is_err());
        assert!(parse_frame("").is_err());
    }

    #[test]
    fn test_parse_frame_rejects_late_pipe() {
        // separator beyond the 32-byte command prefix
        let raw = format!("{}|payload", "x".repeat(40));
        assert!(parse_frame(&raw).is_err());
        // exactly at the boundary is still fine
        let raw = format!("{}|p", "y".repeat(31));
        assert!(parse_frame(&raw).is_ok());
    }

    #[test]
    fn test_parse_frame_rejects_empty_cmd() {
        assert_eq!(parse_frame("|x"), Err(ProtocolError::EmptyCommand));
    }

    #[test]
    fn test_parse_frame_survives_multibyte_prefix() {
        // 40 bytes of two-byte characters: the prefix cut lands inside a
        // character and must not panic
        assert!(parse_frame(&"é".repeat(20)).is_err());
    }

    #[test]
    fn test_classify() {
        assert_eq!(Command::classify("init"), Command::Init);
        assert_eq!(Command::classify("callerOffer"), Command::CallerOffer);
        assert_eq!(Command::classify("ua"), Command::ServerSent);
        assert_eq!(Command::classify("candidate"), Command::Other);
    }

    #[test]
    fn test_peer_report_callee_connected() {
        let r = PeerReport::parse("callee Connected p2p/p2p").unwrap();
        assert!(r.from_callee);
        assert_eq!(r.constate, ConState::Connected);
        assert!(r.fully_p2p());
    }

    #[test]
    fn test_peer_report_relay_side() {
        let r = PeerReport::parse("caller Incoming relay/p2p").unwrap();
        assert!(!r.from_callee);
        assert_eq!(r.constate, ConState::Incoming);
        assert_eq!(r.local_mode, ConnMode::Relay);
        assert!(!r.fully_p2p());
    }

    #[test]
    fn test_peer_report_rejects_garbage() {
        assert!(PeerReport::parse("").is_err());
        assert!(PeerReport::parse("callee Weird p2p/p2p").is_err());
        assert!(PeerReport::parse("callee Connected p2p").is_err());
    }

    #[test]
    fn test_sanitize_text_msg() {
        assert_eq!(sanitize_text_msg("  hi\nthere\r\n "), "hi there");
    }
}
