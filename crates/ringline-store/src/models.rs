use serde::{Deserialize, Serialize};

/// Bucket names used across the service. Kept in one place so the boot
/// sequence and the signaling path cannot drift apart.
pub mod buckets {
    pub const REGISTERED_IDS: &str = "registeredIDs";
    pub const BLOCKED_IDS: &str = "blockedIDs";
    pub const USER_DATA: &str = "userData2";
    pub const WAITING_CALLERS: &str = "waitingCallers";
    pub const MISSED_CALLS: &str = "missedCalls";
    pub const SENT_NOTIF_TWEETS: &str = "sentNotifTweets";
    pub const HASHED_PW: &str = "hashedpwbucket";
    pub const CONTACTS: &str = "contacts";
}

const HIDDEN_BIT: u32 = 1 << 0;
const DIAL_SOUNDS_MUTED_BIT: u32 = 1 << 2;

/// Persisted per-account record, stored under `<calleeID>_<regStartTime>`
/// in the `userData2` bucket.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    #[serde(default)]
    pub name: String,
    /// Packed preference flags; use the accessors below.
    #[serde(default)]
    pub int2: u32,
    /// Lifetime seconds spent in peer-connected calls.
    #[serde(default)]
    pub connected_to_peer_secs: i64,
    #[serde(default)]
    pub store_missed_calls: bool,
}

impl UserRecord {
    pub fn is_hidden(&self) -> bool {
        self.int2 & HIDDEN_BIT != 0
    }

    pub fn set_hidden(&mut self, hidden: bool) {
        if hidden {
            self.int2 |= HIDDEN_BIT;
        } else {
            self.int2 &= !HIDDEN_BIT;
        }
    }

    pub fn dial_sounds_muted(&self) -> bool {
        self.int2 & DIAL_SOUNDS_MUTED_BIT != 0
    }

    pub fn set_dial_sounds_muted(&mut self, muted: bool) {
        if muted {
            self.int2 |= DIAL_SOUNDS_MUTED_BIT;
        } else {
            self.int2 &= !DIAL_SOUNDS_MUTED_BIT;
        }
    }
}
