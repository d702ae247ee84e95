use crate::{RatchetSession, SessionId, SubscriptionFilter};
use nostr::PublicKey;
use std::collections::HashMap;

pub(crate) struct SessionEntry {
    pub owner: PublicKey,
    pub device_id: String,
    pub session: Box<dyn RatchetSession>,
    /// Filter the current transport subscription was opened with.
    pub filter: SubscriptionFilter,
}

/// Arena owning every live ratchet session of a directory.
#[derive(Default)]
pub(crate) struct SessionTable {
    next_id: u64,
    entries: HashMap<SessionId, SessionEntry>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        owner: PublicKey,
        device_id: &str,
        session: Box<dyn RatchetSession>,
    ) -> SessionId {
        self.next_id += 1;
        let id = SessionId(self.next_id);
        let filter = session.envelope_filter();
        self.entries.insert(
            id,
            SessionEntry {
                owner,
                device_id: device_id.to_string(),
                session,
                filter,
            },
        );
        id
    }

    pub fn get(&self, id: SessionId) -> Option<&SessionEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut SessionEntry> {
        self.entries.get_mut(&id)
    }

    pub fn is_ready(&self, id: SessionId) -> bool {
        self.entries
            .get(&id)
            .map(|entry| entry.session.ready())
            .unwrap_or(false)
    }

    /// Removes and closes the session. Returns false for unknown ids.
    pub fn close(&mut self, id: SessionId) -> bool {
        match self.entries.remove(&id) {
            Some(mut entry) => {
                entry.session.close();
                true
            }
            None => false,
        }
    }

    pub fn close_all(&mut self) {
        for (_, mut entry) in self.entries.drain() {
            entry.session.close();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
