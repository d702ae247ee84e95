use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Session directory not initialized")]
    NotInitialized,

    #[error("Session directory closed")]
    Closed,

    #[error("Peer removed")]
    PeerRemoved,

    #[error("Device revoked: {0}")]
    DeviceRevoked(String),

    #[error("Refusing to accept our own invite")]
    SelfInvite,

    #[error("Invite acceptance already in flight: {0}")]
    InviteInFlight(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Corrupt stored entry {key}: {reason}")]
    StorageCorruption { key: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Invite error: {0}")]
    Invite(String),

    #[error("Ratchet error: {0}")]
    Ratchet(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Hex(#[from] hex::FromHexError),

    #[error(transparent)]
    NostrKey(#[from] nostr::key::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
