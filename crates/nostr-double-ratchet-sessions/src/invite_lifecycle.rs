use crate::utils::{lock, pubkey_hex};
use crate::{Invite, InviteStatus, RatchetEngine, Result, StorageAdapter};
use nostr::PublicKey;
use std::collections::HashSet;
use std::sync::Mutex;

/// Acceptance bookkeeping keyed by `inviter_hex:device_id`.
#[derive(Default)]
pub(crate) struct InviteLifecycle {
    in_flight: Mutex<HashSet<String>>,
    rejected: Mutex<HashSet<String>>,
}

/// Releases an in-flight marker when dropped.
pub(crate) struct InFlightGuard<'a> {
    lifecycle: &'a InviteLifecycle,
    key: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        lock(&self.lifecycle.in_flight).remove(&self.key);
    }
}

pub(crate) fn acceptance_key(inviter: &PublicKey, device_id: &str) -> String {
    format!("{}:{}", pubkey_hex(inviter), device_id)
}

impl InviteLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `key` for one handshake. `None` if another task holds it.
    pub fn try_begin(&self, key: &str) -> Option<InFlightGuard<'_>> {
        if !lock(&self.in_flight).insert(key.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            lifecycle: self,
            key: key.to_string(),
        })
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        lock(&self.in_flight).contains(key)
    }

    pub fn mark_rejected(&self, key: &str) {
        lock(&self.rejected).insert(key.to_string());
    }

    pub fn clear_rejected(&self, key: &str) {
        lock(&self.rejected).remove(key);
    }

    pub fn status(&self, key: &str, has_active_session: bool) -> InviteStatus {
        if has_active_session {
            InviteStatus::Established
        } else if self.is_in_flight(key) {
            InviteStatus::Pending
        } else if lock(&self.rejected).contains(key) {
            InviteStatus::Rejected
        } else {
            InviteStatus::Unseen
        }
    }

    pub fn clear(&self) {
        lock(&self.rejected).clear();
    }
}

/// Loads this device's invite from storage, creating and persisting a new
/// one when it is missing or unusable.
pub(crate) async fn create_or_load(
    storage: &dyn StorageAdapter,
    engine: &dyn RatchetEngine,
    inviter: PublicKey,
    device_id: &str,
) -> Result<Invite> {
    let key = Invite::storage_key(device_id);

    match storage.get(&key).await {
        Ok(Some(data)) => match Invite::deserialize(&data) {
            Ok(invite)
                if invite.inviter == inviter
                    && invite.device_id == device_id
                    && invite.private_material.is_some() =>
            {
                return Ok(invite);
            }
            Ok(_) => tracing::warn!(%key, "stored invite does not belong to this device"),
            Err(e) => tracing::warn!(%key, error = %e, "stored invite is corrupt"),
        },
        Ok(None) => {}
        Err(e) => tracing::warn!(%key, error = %e, "failed to read stored invite"),
    }

    let invite = engine.create_invite(inviter, device_id)?;
    match invite.serialize() {
        Ok(data) => {
            if let Err(e) = storage.put(&key, data).await {
                tracing::warn!(%key, error = %e, "failed to persist invite");
            }
        }
        Err(e) => tracing::warn!(%key, error = %e, "failed to serialize invite"),
    }
    tracing::info!(device_id, "created new device invite");
    Ok(invite)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Handshake, InMemoryStorage, InviteAcceptance, RatchetSession, SubscriptionFilter,
    };
    use async_trait::async_trait;
    use nostr::Keys;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingEngine {
        created: AtomicUsize,
    }

    #[async_trait]
    impl RatchetEngine for CountingEngine {
        fn create_invite(&self, inviter: PublicKey, device_id: &str) -> Result<Invite> {
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            let mut public = BTreeMap::new();
            public.insert("token".to_string(), format!("t{}", n));
            let mut private = BTreeMap::new();
            private.insert("secret".to_string(), format!("s{}", n));
            Ok(Invite::new(inviter, device_id, public, Some(private)))
        }

        async fn accept_invite(&self, _: &Invite, _: &Keys, _: &str) -> Result<Handshake> {
            Err(crate::Error::Handshake("unused".to_string()))
        }

        fn acceptance_filter(&self, _: &Invite) -> SubscriptionFilter {
            SubscriptionFilter::default()
        }

        fn open_acceptance(
            &self,
            _: &Invite,
            _: &Keys,
            _: &nostr::Event,
        ) -> Result<Option<InviteAcceptance>> {
            Ok(None)
        }

        fn restore_session(&self, _: &str) -> Result<Box<dyn RatchetSession>> {
            Err(crate::Error::Ratchet("unused".to_string()))
        }
    }

    #[test]
    fn guard_releases_marker_on_drop() {
        let lifecycle = InviteLifecycle::new();
        let key = acceptance_key(&Keys::generate().public_key(), "dev");

        let guard = lifecycle.try_begin(&key).unwrap();
        assert!(lifecycle.try_begin(&key).is_none());
        assert_eq!(lifecycle.status(&key, false), InviteStatus::Pending);

        drop(guard);
        assert!(!lifecycle.is_in_flight(&key));
        assert_eq!(lifecycle.status(&key, false), InviteStatus::Unseen);
    }

    #[test]
    fn status_prefers_established_then_rejected() {
        let lifecycle = InviteLifecycle::new();
        lifecycle.mark_rejected("k");
        assert_eq!(lifecycle.status("k", false), InviteStatus::Rejected);
        assert_eq!(lifecycle.status("k", true), InviteStatus::Established);
        lifecycle.clear_rejected("k");
        assert_eq!(lifecycle.status("k", false), InviteStatus::Unseen);
    }

    #[tokio::test]
    async fn create_or_load_reuses_persisted_invite() {
        let storage = InMemoryStorage::new();
        let engine = CountingEngine::default();
        let inviter = Keys::generate().public_key();

        let first = create_or_load(&storage, &engine, inviter, "dev").await.unwrap();
        let second = create_or_load(&storage, &engine, inviter, "dev").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(engine.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn corrupt_invite_degrades_to_new_one() {
        let storage = InMemoryStorage::new();
        storage
            .put("invite/dev", "{broken".to_string())
            .await
            .unwrap();
        let engine = CountingEngine::default();
        let inviter = Keys::generate().public_key();

        let invite = create_or_load(&storage, &engine, inviter, "dev").await.unwrap();
        assert_eq!(invite.device_id, "dev");
        let stored = storage.get("invite/dev").await.unwrap().unwrap();
        assert_eq!(Invite::deserialize(&stored).unwrap(), invite);
    }
}
