pub mod config;
pub mod device_slot;
pub mod error;
pub mod event_router;
pub mod file_storage;
pub mod invite;
mod invite_lifecycle;
mod outbound_queue;
pub mod peer_registry;
pub mod pubsub;
pub mod ratchet;
pub mod session_directory;
mod session_table;
pub mod storage;
pub mod types;
pub mod utils;

pub use config::DirectoryConfig;
pub use device_slot::DeviceSlot;
pub use error::{Error, Result};
pub use event_router::{EventObserver, EventRouter};
pub use file_storage::FileStorageAdapter;
pub use invite::Invite;
pub use peer_registry::PeerRegistry;
pub use pubsub::{build_filter, EventHandler, FilterBuilder, SubscriptionFilter, Transport};
pub use ratchet::{Handshake, InviteAcceptance, RatchetEngine, RatchetSession, SentEnvelope};
pub use session_directory::{session_storage_key, SessionDirectory, StoredSession};
pub use storage::{load_or_create_device_id, InMemoryStorage, StorageAdapter};
pub use types::*;
