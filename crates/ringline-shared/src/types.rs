use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Account identifier of a callee. Opaque ASCII, always lowercased.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CalleeId(String);

impl CalleeId {
    pub fn new(raw: &str) -> Self {
        Self(raw.trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key under which the user record is stored: `<id>_<registrationStart>`.
    pub fn user_key(&self, registration_start_time: i64) -> String {
        format!("{}_{}", self.0, registration_start_time)
    }
}

impl fmt::Display for CalleeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hub key. Equal to the [`CalleeId`] for single-identity users; carries a
/// per-session suffix for multi-identity users so that each identity gets
/// its own hub.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct GlobalCalleeId(String);

impl GlobalCalleeId {
    pub fn single(callee: &CalleeId) -> Self {
        Self(callee.as_str().to_string())
    }

    pub fn multi(callee: &CalleeId, ticket: AttachTicket) -> Self {
        Self(format!("{}_{}", callee.as_str(), ticket.value()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GlobalCalleeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Single-use rendezvous handle issued at HTTP login and consumed by the
/// WebSocket attach (`wsid` query parameter). Always nonzero.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct AttachTicket(u64);

impl AttachTicket {
    pub fn generate() -> Self {
        loop {
            let v: u64 = rand::random();
            if v != 0 {
                return Self(v);
            }
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        match raw.trim().parse::<u64>() {
            Ok(v) if v > 0 => Ok(Self(v)),
            _ => Err(ProtocolError::BadTicket),
        }
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for AttachTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side of a hub a signaling connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Callee,
    Caller,
}

impl Role {
    pub fn is_callee(&self) -> bool {
        matches!(self, Role::Callee)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Callee => f.write_str("callee"),
            Role::Caller => f.write_str("caller"),
        }
    }
}

/// Whether a side's media path is direct or goes through the TURN relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnMode {
    P2p,
    Relay,
}

impl ConnMode {
    pub fn from_token(tok: &str) -> Self {
        if tok == "p2p" {
            ConnMode::P2p
        } else {
            ConnMode::Relay
        }
    }

    pub fn is_p2p(&self) -> bool {
        matches!(self, ConnMode::P2p)
    }
}

/// One entry of a callee's waiting-callers or missed-calls list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CallerInfo {
    /// Caller address as `ip:port`.
    pub addr_port: String,
    pub caller_name: String,
    /// Epoch seconds of the call attempt.
    pub call_time: i64,
    /// The caller's own callee id, usable for calling back.
    pub caller_id: String,
    /// Optional text left by the caller on hangup.
    #[serde(default)]
    pub text_msg: String,
}

impl CallerInfo {
    /// Identifier used by `deleteMissedCall|<addrPort>_<callTime>`.
    pub fn delete_key(&self) -> String {
        format!("{}_{}", self.addr_port, self.call_time)
    }
}
