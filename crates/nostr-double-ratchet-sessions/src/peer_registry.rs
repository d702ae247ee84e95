use crate::{DeviceSlot, SessionId};
use nostr::PublicKey;
use std::collections::HashMap;

/// Device slots known for one remote identity.
pub struct PeerRegistry {
    pub identity: PublicKey,
    slots: HashMap<String, DeviceSlot>,
    is_stale: bool,
    stale_timestamp: Option<u64>,
}

impl PeerRegistry {
    pub fn new(identity: PublicKey) -> Self {
        Self {
            identity,
            slots: HashMap::new(),
            is_stale: false,
            stale_timestamp: None,
        }
    }

    pub fn upsert_device(&mut self, device_id: &str, now: u64) -> &mut DeviceSlot {
        self.slots
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceSlot::new(device_id, now))
    }

    pub fn get_device(&self, device_id: &str) -> Option<&DeviceSlot> {
        self.slots.get(device_id)
    }

    pub fn get_device_mut(&mut self, device_id: &str) -> Option<&mut DeviceSlot> {
        self.slots.get_mut(device_id)
    }

    pub fn get_all_devices(&self) -> Vec<&DeviceSlot> {
        self.slots.values().collect()
    }

    /// Non-stale slots; empty when the whole peer is stale.
    pub fn get_active_devices(&self) -> Vec<&DeviceSlot> {
        if self.is_stale {
            return Vec::new();
        }
        self.slots.values().filter(|slot| !slot.is_stale).collect()
    }

    pub fn remove_device(&mut self, device_id: &str) -> Option<DeviceSlot> {
        self.slots.remove(device_id)
    }

    pub fn device_count(&self) -> usize {
        self.slots.len()
    }

    /// Supersedes the device's active session with `session_id`.
    /// Returns ids discarded from the bounded history.
    pub fn upsert_session(&mut self, device_id: &str, session_id: SessionId, now: u64) -> Vec<SessionId> {
        self.upsert_device(device_id, now).upsert(session_id, now)
    }

    /// Stores `session_id` as superseded without touching the active one.
    pub fn park_session(&mut self, device_id: &str, session_id: SessionId, now: u64) -> Vec<SessionId> {
        self.upsert_device(device_id, now).park(session_id, now)
    }

    pub fn promote_session(&mut self, device_id: &str, session_id: SessionId, now: u64) -> bool {
        self.slots
            .get_mut(device_id)
            .map(|slot| slot.promote(session_id, now))
            .unwrap_or(false)
    }

    pub fn get_active_session_id(&self, device_id: &str) -> Option<SessionId> {
        if self.is_stale {
            return None;
        }
        self.slots
            .get(device_id)
            .filter(|slot| !slot.is_stale)
            .and_then(|slot| slot.active())
    }

    /// Active sessions of non-stale devices, paired with their device id.
    pub fn active_sessions(&self) -> Vec<(String, SessionId)> {
        self.get_active_devices()
            .into_iter()
            .filter_map(|slot| slot.active().map(|id| (slot.device_id.clone(), id)))
            .collect()
    }

    pub fn all_session_ids(&self) -> Vec<SessionId> {
        self.slots.values().flat_map(|slot| slot.session_ids()).collect()
    }

    /// Device holding `session_id` and whether it is that device's active one.
    pub fn find_session(&self, session_id: SessionId) -> Option<(&str, bool)> {
        self.slots.values().find_map(|slot| {
            slot.contains(session_id)
                .then(|| (slot.device_id.as_str(), slot.active() == Some(session_id)))
        })
    }

    /// Clears the device's active session without promoting an inactive one.
    pub fn delete_session(&mut self, device_id: &str) -> Option<SessionId> {
        self.slots.get_mut(device_id).and_then(|slot| slot.delete_active())
    }

    pub fn mark_device_stale(&mut self, device_id: &str, now: u64) {
        if let Some(slot) = self.slots.get_mut(device_id) {
            slot.mark_stale(now);
        }
    }

    pub fn mark_stale(&mut self, now: u64) {
        self.is_stale = true;
        self.stale_timestamp = Some(now);
    }

    pub fn is_stale(&self) -> bool {
        self.is_stale
    }

    /// Evicts stale devices (or every device of a stale peer) older than
    /// `max_latency`. Returns the sessions they held.
    pub fn prune_stale(&mut self, max_latency: u64, now: u64) -> Vec<SessionId> {
        let peer_expired = self.is_stale
            && self
                .stale_timestamp
                .map(|ts| now.saturating_sub(ts) > max_latency)
                .unwrap_or(false);

        let expired: Vec<String> = self
            .slots
            .values()
            .filter(|slot| peer_expired || slot.is_expired(max_latency, now))
            .map(|slot| slot.device_id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|device_id| self.slots.remove(&device_id))
            .flat_map(|slot| slot.session_ids())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
