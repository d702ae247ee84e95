use crate::{SessionId, MAX_INACTIVE_SESSIONS};
use std::collections::VecDeque;

/// Session bookkeeping for one device of one peer.
///
/// Holds arena ids only. At most one session is active; superseded sessions
/// are kept newest-first up to `MAX_INACTIVE_SESSIONS`, older ones are
/// returned to the caller for closing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSlot {
    pub device_id: String,
    active: Option<SessionId>,
    inactive: VecDeque<SessionId>,
    // Set by `delete_active`; superseded sessions stay parked until a new
    // session is upserted.
    cleared: bool,
    pub is_stale: bool,
    pub stale_timestamp: Option<u64>,
    pub last_activity: u64,
}

impl DeviceSlot {
    pub fn new(device_id: impl Into<String>, now: u64) -> Self {
        Self {
            device_id: device_id.into(),
            active: None,
            inactive: VecDeque::new(),
            cleared: false,
            is_stale: false,
            stale_timestamp: None,
            last_activity: now,
        }
    }

    pub fn active(&self) -> Option<SessionId> {
        self.active
    }

    pub fn inactive(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.inactive.iter().copied()
    }

    pub fn inactive_len(&self) -> usize {
        self.inactive.len()
    }

    /// True after the active session was deleted and before a new one arrived.
    pub fn is_cleared(&self) -> bool {
        self.cleared
    }

    /// Active first, then superseded sessions newest-first.
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.active.iter().copied().chain(self.inactive()).collect()
    }

    pub fn contains(&self, session_id: SessionId) -> bool {
        self.active == Some(session_id) || self.inactive.contains(&session_id)
    }

    /// Makes `session_id` active, superseding the current one.
    /// Returns sessions pushed out of the bounded history.
    pub fn upsert(&mut self, session_id: SessionId, now: u64) -> Vec<SessionId> {
        self.last_activity = now;
        self.cleared = false;
        if self.active == Some(session_id) {
            return Vec::new();
        }

        self.inactive.retain(|id| *id != session_id);
        match self.active.replace(session_id) {
            Some(previous) => self.push_inactive(previous),
            None => Vec::new(),
        }
    }

    /// Keeps the current active session and records `session_id` as the
    /// newest superseded one.
    pub fn park(&mut self, session_id: SessionId, now: u64) -> Vec<SessionId> {
        self.last_activity = now;
        if self.contains(session_id) {
            return Vec::new();
        }
        self.push_inactive(session_id)
    }

    /// Swaps an inactive session back to active. Returns false if the id is
    /// not held as inactive here or the slot was cleared.
    pub fn promote(&mut self, session_id: SessionId, now: u64) -> bool {
        if self.cleared {
            return false;
        }
        let Some(pos) = self.inactive.iter().position(|id| *id == session_id) else {
            return false;
        };
        self.inactive.remove(pos);
        if let Some(previous) = self.active.replace(session_id) {
            self.inactive.push_front(previous);
        }
        self.last_activity = now;
        true
    }

    /// Clears the active session. Superseded sessions stay inactive and are
    /// no longer promoted.
    pub fn delete_active(&mut self) -> Option<SessionId> {
        self.cleared = true;
        self.active.take()
    }

    pub fn touch(&mut self, now: u64) {
        self.last_activity = now;
    }

    pub fn mark_stale(&mut self, now: u64) {
        self.is_stale = true;
        self.stale_timestamp = Some(now);
    }

    pub fn is_expired(&self, max_latency: u64, now: u64) -> bool {
        self.is_stale
            && self
                .stale_timestamp
                .map(|ts| now.saturating_sub(ts) > max_latency)
                .unwrap_or(false)
    }

    fn push_inactive(&mut self, session_id: SessionId) -> Vec<SessionId> {
        self.inactive.push_front(session_id);
        let mut discarded = Vec::new();
        while self.inactive.len() > MAX_INACTIVE_SESSIONS {
            if let Some(old) = self.inactive.pop_back() {
                discarded.push(old);
            }
        }
        discarded
    }
}
