use serde::{Deserialize, Serialize};
use std::fmt;

pub const MESSAGE_EVENT_KIND: u32 = 1060;
pub const INVITE_EVENT_KIND: u32 = 30078;
pub const INVITE_RESPONSE_KIND: u32 = 1059;
pub const CHAT_MESSAGE_KIND: u32 = 14;

/// `d` tag prefix of per-device invite events.
pub const INVITE_D_TAG_PREFIX: &str = "double-ratchet/invites/";
/// `l` tag value shared by all invite events.
pub const INVITE_LIST_LABEL: &str = "double-ratchet/invites";

/// Superseded sessions retained per device slot.
pub const MAX_INACTIVE_SESSIONS: usize = 1;

pub type Unsubscribe = Box<dyn FnOnce() + Send>;

/// Arena key of a ratchet session owned by a `SessionDirectory`.
///
/// Ids are allocated monotonically per directory instance and never reused,
/// so a stale id can only miss, never alias a newer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Acceptance progress for one `(inviter, device)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteStatus {
    Unseen,
    Pending,
    Established,
    Rejected,
}

pub(crate) mod serde_pubkey {
    use nostr::PublicKey;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(pk: &PublicKey, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(pk.to_bytes()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<PublicKey, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        PublicKey::from_slice(&bytes).map_err(serde::de::Error::custom)
    }
}
