use crate::event_router::{EventObserver, EventRouter};
use crate::invite_lifecycle::{acceptance_key, create_or_load, InviteLifecycle};
use crate::outbound_queue::{
    drain_in_order, fan_out_targets, has_ready_route, FlushScheduler, MessageHistory,
    OutboundQueue,
};
use crate::pubsub::EventHandler;
use crate::session_table::SessionTable;
use crate::utils::{lock, now_millis, pubkey_from_hex, pubkey_hex, spawn_detached};
use crate::{
    DeviceSlot, DirectoryConfig, Error, Handshake, Invite, InviteAcceptance, InviteStatus,
    PeerRegistry, RatchetEngine, RatchetSession, Result, SessionId, StorageAdapter,
    SubscriptionFilter, Transport, Unsubscribe, CHAT_MESSAGE_KIND,
};
use futures::future::join_all;
use nostr::{Keys, PublicKey, Tag, UnsignedEvent};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

const SESSION_KEY_PREFIX: &str = "session/";
const INVITE_ACCEPT_KEY_PREFIX: &str = "invite-accept/";

/// Persisted form of a device slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSession {
    pub device_id: String,
    /// Active session state; `None` after the active session was deleted.
    #[serde(default)]
    pub state: Option<String>,
    /// Superseded session states, newest first.
    #[serde(default)]
    pub inactive: Vec<String>,
    pub last_activity: u64,
}

pub fn session_storage_key(owner: &PublicKey, device_id: &str) -> String {
    format!("{}{}/{}", SESSION_KEY_PREFIX, pubkey_hex(owner), device_id)
}

fn parse_session_key(key: &str) -> Result<(PublicKey, String)> {
    let corrupt = |reason: &str| Error::StorageCorruption {
        key: key.to_string(),
        reason: reason.to_string(),
    };
    let rest = key
        .strip_prefix(SESSION_KEY_PREFIX)
        .ok_or_else(|| corrupt("unexpected prefix"))?;
    let (owner_hex, device_id) = rest
        .split_once('/')
        .ok_or_else(|| corrupt("missing device id"))?;
    if device_id.is_empty() {
        return Err(corrupt("empty device id"));
    }
    let owner = pubkey_from_hex(owner_hex).map_err(|e| corrupt(&e.to_string()))?;
    Ok((owner, device_id.to_string()))
}

struct DirectoryState {
    peers: HashMap<PublicKey, PeerRegistry>,
    table: SessionTable,
}

struct DirectoryInner {
    keys: Keys,
    device_id: String,
    transport: Arc<dyn Transport>,
    storage: Arc<dyn StorageAdapter>,
    engine: Arc<dyn RatchetEngine>,
    config: DirectoryConfig,
    state: Mutex<DirectoryState>,
    queue: Mutex<OutboundQueue>,
    flushes: FlushScheduler,
    flush_lock: tokio::sync::Mutex<()>,
    persist_lock: tokio::sync::Mutex<()>,
    lifecycle: InviteLifecycle,
    router: Arc<EventRouter>,
    invite: Mutex<Option<Invite>>,
    // `None` marks a subscription being opened.
    identity_listeners: Mutex<HashMap<PublicKey, Option<Unsubscribe>>>,
    session_subscriptions: Mutex<HashMap<SessionId, Unsubscribe>>,
    acceptance_subscription: Mutex<Option<Unsubscribe>>,
    processed_acceptances: Mutex<HashSet<String>>,
    history: Mutex<MessageHistory>,
    revoked: Mutex<HashSet<(PublicKey, String)>>,
    initialized: OnceCell<()>,
    closed: AtomicBool,
}

/// Per-identity, per-device session orchestrator.
///
/// Discovers peer devices through their published invites, establishes and
/// tracks one ratchet session per remote device, persists session state,
/// queues sends until a route exists and mirrors outgoing messages to our
/// own other devices. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SessionDirectory {
    inner: Arc<DirectoryInner>,
}

impl SessionDirectory {
    pub fn new(
        keys: Keys,
        device_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn StorageAdapter>,
        engine: Arc<dyn RatchetEngine>,
        config: DirectoryConfig,
    ) -> Self {
        let history_limit = config.message_history_limit;
        Self {
            inner: Arc::new(DirectoryInner {
                keys,
                device_id: device_id.into(),
                transport,
                storage,
                engine,
                config,
                state: Mutex::new(DirectoryState {
                    peers: HashMap::new(),
                    table: SessionTable::new(),
                }),
                queue: Mutex::new(OutboundQueue::new()),
                flushes: FlushScheduler::new(),
                flush_lock: tokio::sync::Mutex::new(()),
                persist_lock: tokio::sync::Mutex::new(()),
                lifecycle: InviteLifecycle::new(),
                router: Arc::new(EventRouter::new()),
                invite: Mutex::new(None),
                identity_listeners: Mutex::new(HashMap::new()),
                session_subscriptions: Mutex::new(HashMap::new()),
                acceptance_subscription: Mutex::new(None),
                processed_acceptances: Mutex::new(HashSet::new()),
                history: Mutex::new(MessageHistory::new(history_limit)),
                revoked: Mutex::new(HashSet::new()),
                initialized: OnceCell::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Restores persisted sessions, loads or creates this device's invite,
    /// publishes it and starts listening. Safe to call repeatedly and
    /// concurrently; later callers wait for the first to finish.
    pub async fn init(&self) -> Result<()> {
        self.inner.ensure_open()?;
        let inner = Arc::clone(&self.inner);
        self.inner
            .initialized
            .get_or_try_init(|| async move { inner.initialize().await })
            .await?;
        Ok(())
    }

    /// Encrypts `event` for every ready device of `recipient`, mirroring it
    /// to our own other devices. Without a ready route the event is queued
    /// and the returned future resolves once the queue is flushed.
    pub async fn send_event(&self, recipient: PublicKey, event: UnsignedEvent) -> Result<Vec<String>> {
        let inner = &self.inner;
        inner.ensure_initialized()?;

        // Serialized with queue flushes so a direct send never overtakes
        // entries a flush has already taken.
        let rx = {
            let _serial = inner.flush_lock.lock().await;
            let queued_ahead = lock(&inner.queue).has_pending(&recipient);
            if !queued_ahead {
                if let Some(ids) = inner.dispatch_ready(recipient, event.clone()).await? {
                    return Ok(ids);
                }
            }
            lock(&inner.queue).enqueue(recipient, event)
        };
        tracing::debug!(%recipient, "no ready session, message queued");
        inner.listen_to_identity(recipient);
        inner.schedule_flush_if_routable(recipient);

        rx.await.unwrap_or(Err(Error::Closed))
    }

    pub async fn send_text(&self, recipient: PublicKey, text: String) -> Result<Vec<String>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let event = self.build_message_event(recipient, CHAT_MESSAGE_KIND, text)?;
        self.send_event(recipient, event).await
    }

    fn build_message_event(
        &self,
        recipient: PublicKey,
        kind: u32,
        content: String,
    ) -> Result<UnsignedEvent> {
        let now_ms = now_millis();
        let tags = vec![
            Tag::parse(&["p".to_string(), pubkey_hex(&recipient)])
                .map_err(|e| Error::InvalidEvent(e.to_string()))?,
            Tag::parse(&["ms".to_string(), now_ms.to_string()])
                .map_err(|e| Error::InvalidEvent(e.to_string()))?,
        ];

        let mut event = nostr::EventBuilder::new(nostr::Kind::from(kind as u16), &content)
            .tags(tags)
            .custom_created_at(nostr::Timestamp::from(now_ms / 1000))
            .build(self.inner.keys.public_key());
        event.ensure_id();
        Ok(event)
    }

    /// Opens invite discovery for `identity`. Idempotent.
    pub fn listen_to_identity(&self, identity: PublicKey) {
        self.inner.listen_to_identity(identity);
    }

    pub fn stop_listening_to_identity(&self, identity: PublicKey) {
        self.inner.stop_listening_to_identity(identity);
    }

    pub fn is_listening_to(&self, identity: &PublicKey) -> bool {
        lock(&self.inner.identity_listeners).contains_key(identity)
    }

    /// Registers an observer for every decrypted inbound event, called with
    /// the originating identity.
    pub fn on_event<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(&UnsignedEvent, PublicKey) + Send + Sync + 'static,
    {
        let observer: EventObserver = Arc::new(callback);
        self.inner.router.subscribe(observer)
    }

    pub async fn accept_invite(&self, invite: Invite) -> Result<SessionId> {
        self.inner.accept_invite(invite).await
    }

    pub fn get_invite(&self) -> Option<Invite> {
        lock(&self.inner.invite).clone()
    }

    pub fn invite_status(&self, inviter: &PublicKey, device_id: &str) -> InviteStatus {
        let has_active = self.inner.active_session_id(inviter, device_id).is_some();
        self.inner
            .lifecycle
            .status(&acceptance_key(inviter, device_id), has_active)
    }

    pub fn get_device_id(&self) -> &str {
        &self.inner.device_id
    }

    pub fn get_our_pubkey(&self) -> PublicKey {
        self.inner.keys.public_key()
    }

    /// Known device ids of `identity`, sorted.
    pub fn get_peer_devices(&self, identity: &PublicKey) -> Vec<String> {
        let state = lock(&self.inner.state);
        let mut devices: Vec<String> = state
            .peers
            .get(identity)
            .map(|peer| {
                peer.get_all_devices()
                    .into_iter()
                    .map(|slot| slot.device_id.clone())
                    .collect()
            })
            .unwrap_or_default();
        devices.sort();
        devices
    }

    pub fn get_device_slot(&self, identity: &PublicKey, device_id: &str) -> Option<DeviceSlot> {
        lock(&self.inner.state)
            .peers
            .get(identity)
            .and_then(|peer| peer.get_device(device_id))
            .cloned()
    }

    pub fn ready_session_count(&self, identity: &PublicKey) -> usize {
        let state = lock(&self.inner.state);
        state
            .peers
            .get(identity)
            .map(|peer| {
                peer.active_sessions()
                    .into_iter()
                    .filter(|(_, id)| state.table.is_ready(*id))
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn queued_message_count(&self, identity: &PublicKey) -> usize {
        lock(&self.inner.queue).len(identity)
    }

    pub fn get_user_pubkeys(&self) -> Vec<PublicKey> {
        lock(&self.inner.state).peers.keys().copied().collect()
    }

    /// Number of active sessions across all peers.
    pub fn get_total_sessions(&self) -> usize {
        lock(&self.inner.state)
            .peers
            .values()
            .map(|peer| {
                peer.get_all_devices()
                    .into_iter()
                    .filter(|slot| slot.active().is_some())
                    .count()
            })
            .sum()
    }

    /// Closes the device's active session. Superseded sessions stay stored
    /// and keep decrypting, but none is promoted until a new session is
    /// established with the device.
    pub async fn delete_session(&self, identity: PublicKey, device_id: &str) -> Result<()> {
        let inner = &self.inner;
        let removed = {
            let mut state = lock(&inner.state);
            let DirectoryState { peers, table } = &mut *state;
            let removed = peers
                .get_mut(&identity)
                .and_then(|peer| peer.delete_session(device_id));
            if let Some(id) = removed {
                table.close(id);
            }
            removed
        };
        if let Some(id) = removed {
            inner.unsubscribe_sessions(&[id]);
            tracing::info!(peer = %identity, device_id, "deleted session");
        }
        inner.persist_session(identity, device_id).await;
        Ok(())
    }

    /// Forgets `identity` entirely: listeners, sessions, queued sends and
    /// stored state.
    pub async fn remove_peer(&self, identity: PublicKey) -> Result<()> {
        let inner = &self.inner;
        inner.stop_listening_to_identity(identity);
        inner.flushes.cancel(&identity);

        let closed_ids = {
            let mut state = lock(&inner.state);
            let DirectoryState { peers, table } = &mut *state;
            let ids = peers
                .remove(&identity)
                .map(|peer| peer.all_session_ids())
                .unwrap_or_default();
            for id in &ids {
                table.close(*id);
            }
            ids
        };
        inner.unsubscribe_sessions(&closed_ids);
        lock(&inner.queue).remove(&identity, || Error::PeerRemoved);
        lock(&inner.history).remove(&identity);

        let prefix = format!("{}{}/", SESSION_KEY_PREFIX, pubkey_hex(&identity));
        for key in inner.storage.list(&prefix).await? {
            inner.storage.del(&key).await?;
        }
        tracing::info!(peer = %identity, sessions = closed_ids.len(), "removed peer");
        Ok(())
    }

    /// Revokes one of our own devices. Publishes a tombstone in place of its
    /// invite so our other devices and our peers drop it, then forgets its
    /// sessions and stored invite locally.
    pub async fn revoke_device(&self, device_id: &str) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_initialized()?;
        let own = inner.keys.public_key();

        if device_id == inner.device_id {
            inner.retire_own_invite();
        } else {
            inner.cleanup_device(own, device_id);
        }

        match Invite::tombstone_event(own, device_id)?.sign_with_keys(&inner.keys) {
            Ok(tombstone) => {
                if let Err(e) = inner.transport.publish(tombstone).await {
                    tracing::warn!(device_id, error = %e, "failed to publish device tombstone");
                }
            }
            Err(e) => tracing::warn!(device_id, error = %e, "failed to sign device tombstone"),
        }

        inner.forget_device_storage(own, device_id).await;
        tracing::info!(device_id, "revoked own device");
        Ok(())
    }

    pub fn is_device_revoked(&self, identity: &PublicKey, device_id: &str) -> bool {
        self.inner.is_revoked(identity, device_id)
    }

    pub fn mark_device_stale(&self, identity: &PublicKey, device_id: &str) {
        if let Some(peer) = lock(&self.inner.state).peers.get_mut(identity) {
            peer.mark_device_stale(device_id, now_millis());
        }
    }

    pub fn mark_peer_stale(&self, identity: &PublicKey) {
        if let Some(peer) = lock(&self.inner.state).peers.get_mut(identity) {
            peer.mark_stale(now_millis());
        }
    }

    /// Evicts stale devices and peers older than the configured latency.
    /// Returns the number of sessions closed.
    pub async fn prune_stale(&self) -> Result<usize> {
        let inner = &self.inner;
        let now = now_millis();
        let max_latency = inner.config.max_stale_latency_ms;

        let (evicted, keys) = {
            let mut state = lock(&inner.state);
            let DirectoryState { peers, table } = &mut *state;
            let mut evicted = Vec::new();
            let mut keys = HashSet::new();
            for peer in peers.values_mut() {
                for id in peer.prune_stale(max_latency, now) {
                    if let Some(entry) = table.get(id) {
                        keys.insert(session_storage_key(&entry.owner, &entry.device_id));
                    }
                    table.close(id);
                    evicted.push(id);
                }
            }
            peers.retain(|_, peer| !(peer.is_stale() && peer.is_empty()));
            (evicted, keys)
        };

        inner.unsubscribe_sessions(&evicted);
        for key in keys {
            inner.storage.del(&key).await?;
        }
        if !evicted.is_empty() {
            tracing::info!(sessions = evicted.len(), "pruned stale sessions");
        }
        Ok(evicted.len())
    }

    /// Tears everything down. Pending sends fail with `Closed`; a second
    /// call does nothing.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl DirectoryInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn ensure_initialized(&self) -> Result<()> {
        self.ensure_open()?;
        if !self.initialized.initialized() {
            return Err(Error::NotInitialized);
        }
        Ok(())
    }

    fn is_own_device(&self, identity: &PublicKey, device_id: &str) -> bool {
        *identity == self.keys.public_key() && device_id == self.device_id
    }

    async fn initialize(self: &Arc<Self>) -> Result<()> {
        self.load_sessions().await;

        let invite = create_or_load(
            self.storage.as_ref(),
            self.engine.as_ref(),
            self.keys.public_key(),
            &self.device_id,
        )
        .await?;
        *lock(&self.invite) = Some(invite.clone());

        let weak = Arc::downgrade(self);
        let handler: EventHandler = Arc::new(move |event: nostr::Event| {
            if let Some(inner) = weak.upgrade() {
                spawn_detached(async move { inner.handle_acceptance(event).await });
            }
        });
        match self
            .transport
            .subscribe(self.engine.acceptance_filter(&invite), handler)
        {
            Ok(unsubscribe) => {
                let previous = lock(&self.acceptance_subscription).replace(unsubscribe);
                if let Some(previous) = previous {
                    previous();
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to subscribe to invite acceptances"),
        }

        match invite.get_event()?.sign_with_keys(&self.keys) {
            Ok(signed) => {
                if let Err(e) = self.transport.publish(signed).await {
                    tracing::warn!(error = %e, "failed to publish invite");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to sign invite"),
        }

        self.listen_to_identity(self.keys.public_key());
        self.ensure_open()?;
        tracing::info!(device_id = %self.device_id, "session directory initialized");
        Ok(())
    }

    async fn load_sessions(self: &Arc<Self>) {
        let keys = match self.storage.list(SESSION_KEY_PREFIX).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list stored sessions");
                return;
            }
        };

        let mut restored = 0;
        for key in keys {
            match self.restore_stored_session(&key).await {
                Ok(true) => restored += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(%key, error = %e, "skipping stored session"),
            }
        }
        tracing::debug!(restored, "loaded stored sessions");
    }

    async fn restore_stored_session(self: &Arc<Self>, key: &str) -> Result<bool> {
        let (owner, device_id) = parse_session_key(key)?;
        if self.is_own_device(&owner, &device_id) {
            return Err(Error::StorageCorruption {
                key: key.to_string(),
                reason: "session with our own device".to_string(),
            });
        }

        let Some(data) = self.storage.get(key).await? else {
            return Ok(false);
        };
        let corrupt = |reason: String| Error::StorageCorruption {
            key: key.to_string(),
            reason,
        };
        let stored: StoredSession =
            serde_json::from_str(&data).map_err(|e| corrupt(e.to_string()))?;
        let active = stored
            .state
            .as_deref()
            .map(|state| self.engine.restore_session(state))
            .transpose()
            .map_err(|e| corrupt(e.to_string()))?;
        let inactive = stored
            .inactive
            .iter()
            .map(|state| self.engine.restore_session(state))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| corrupt(e.to_string()))?;
        if active.is_none() && inactive.is_empty() {
            return Ok(false);
        }

        self.restore_slot(owner, &device_id, active, inactive, stored.last_activity);
        Ok(true)
    }

    /// Rebuilds a device slot from stored sessions. `inactive` is newest
    /// first. A slot restored without an active session stays cleared.
    fn restore_slot(
        self: &Arc<Self>,
        owner: PublicKey,
        device_id: &str,
        active: Option<Box<dyn RatchetSession>>,
        inactive: Vec<Box<dyn RatchetSession>>,
        last_activity: u64,
    ) {
        let (subscriptions, discarded) = {
            let mut state = lock(&self.state);
            let DirectoryState { peers, table } = &mut *state;
            let peer = peers.entry(owner).or_insert_with(|| PeerRegistry::new(owner));

            let mut discarded = Vec::new();
            for session in inactive.into_iter().rev() {
                let id = table.insert(owner, device_id, session);
                discarded.extend(peer.park_session(device_id, id, last_activity));
            }
            match active {
                Some(session) => {
                    let id = table.insert(owner, device_id, session);
                    discarded.extend(peer.upsert_session(device_id, id, last_activity));
                }
                None => {
                    peer.delete_session(device_id);
                }
            }
            for id in &discarded {
                table.close(*id);
            }

            let subscriptions: Vec<(SessionId, SubscriptionFilter)> = peer
                .get_device(device_id)
                .map(DeviceSlot::session_ids)
                .unwrap_or_default()
                .into_iter()
                .filter_map(|id| table.get(id).map(|entry| (id, entry.filter.clone())))
                .collect();
            (subscriptions, discarded)
        };

        for (id, filter) in subscriptions {
            self.subscribe_session(id, filter);
        }
        tracing::debug!(
            peer = %owner,
            device_id,
            dropped = discarded.len(),
            "restored device sessions"
        );
    }

    fn active_session_id(&self, identity: &PublicKey, device_id: &str) -> Option<SessionId> {
        lock(&self.state)
            .peers
            .get(identity)
            .and_then(|peer| peer.get_active_session_id(device_id))
    }

    /// Hands a new session to its device slot and starts receiving on it.
    /// For a device seen for the first time, also returns the messages
    /// already sent to its owner.
    async fn register_session(
        self: &Arc<Self>,
        owner: PublicKey,
        device_id: &str,
        mut session: Box<dyn RatchetSession>,
        now: u64,
    ) -> Result<(SessionId, Vec<UnsignedEvent>)> {
        if self.is_closed() {
            session.close();
            return Err(Error::Closed);
        }
        if self.is_revoked(&owner, device_id) {
            session.close();
            return Err(Error::DeviceRevoked(device_id.to_string()));
        }

        let ready = session.ready();
        let (id, discarded, filter, backlog) = {
            let mut state = lock(&self.state);
            let DirectoryState { peers, table } = &mut *state;
            let id = table.insert(owner, device_id, session);
            let peer = peers.entry(owner).or_insert_with(|| PeerRegistry::new(owner));
            let backlog = match peer.get_device(device_id) {
                Some(_) => Vec::new(),
                None => lock(&self.history).get(&owner),
            };

            let current_ready = peer
                .get_device(device_id)
                .and_then(DeviceSlot::active)
                .map(|active| table.is_ready(active))
                .unwrap_or(false);
            let discarded = if current_ready && !ready {
                peer.park_session(device_id, id, now)
            } else {
                peer.upsert_session(device_id, id, now)
            };
            for old in &discarded {
                table.close(*old);
            }
            let filter = table.get(id).map(|entry| entry.filter.clone()).unwrap_or_default();
            (id, discarded, filter, backlog)
        };

        self.unsubscribe_sessions(&discarded);
        self.subscribe_session(id, filter);
        tracing::debug!(peer = %owner, device_id, session = %id, ready, "registered session");

        self.persist_session(owner, device_id).await;
        Ok((id, backlog))
    }

    fn subscribe_session(self: &Arc<Self>, id: SessionId, filter: SubscriptionFilter) {
        let weak = Arc::downgrade(self);
        let handler: EventHandler = Arc::new(move |event: nostr::Event| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_envelope(id, event);
            }
        });

        let unsubscribe = match self.transport.subscribe(filter, handler) {
            Ok(unsubscribe) => unsubscribe,
            Err(e) => {
                tracing::warn!(session = %id, error = %e, "failed to subscribe to session envelopes");
                return;
            }
        };

        let leftover = {
            let mut subscriptions = lock(&self.session_subscriptions);
            if self.is_closed() {
                Some(unsubscribe)
            } else {
                subscriptions.insert(id, unsubscribe)
            }
        };
        if let Some(leftover) = leftover {
            leftover();
        }
    }

    fn unsubscribe_sessions(&self, ids: &[SessionId]) {
        let removed: Vec<Unsubscribe> = {
            let mut subscriptions = lock(&self.session_subscriptions);
            ids.iter().filter_map(|id| subscriptions.remove(id)).collect()
        };
        for unsubscribe in removed {
            unsubscribe();
        }
    }

    /// Decrypts an envelope delivered to one session's subscription.
    fn handle_envelope(self: &Arc<Self>, id: SessionId, envelope: nostr::Event) {
        if self.is_closed() {
            return;
        }

        let (owner, device_id, rumor, new_filter) = {
            let mut state = lock(&self.state);
            let DirectoryState { peers, table } = &mut *state;
            let Some(entry) = table.get_mut(id) else {
                return;
            };
            let rumor = match entry.session.receive(&envelope) {
                Ok(Some(rumor)) => rumor,
                Ok(None) => return,
                Err(e) => {
                    tracing::debug!(session = %id, error = %e, "failed to decrypt envelope");
                    return;
                }
            };

            let owner = entry.owner;
            let device_id = entry.device_id.clone();
            let filter = entry.session.envelope_filter();
            let new_filter = (filter != entry.filter).then(|| {
                entry.filter = filter.clone();
                filter
            });

            let now = now_millis();
            if let Some(peer) = peers.get_mut(&owner) {
                match peer.find_session(id) {
                    Some((_, false)) => {
                        if peer.promote_session(&device_id, id, now) {
                            tracing::debug!(peer = %owner, %device_id, session = %id, "promoted session");
                        }
                    }
                    Some((_, true)) => {
                        if let Some(slot) = peer.get_device_mut(&device_id) {
                            slot.touch(now);
                        }
                    }
                    None => {}
                }
            }
            (owner, device_id, rumor, new_filter)
        };

        self.router.dispatch(&rumor, owner);

        if let Some(filter) = new_filter {
            self.subscribe_session(id, filter);
        }

        let inner = Arc::clone(self);
        spawn_detached(async move { inner.persist_session(owner, &device_id).await });

        self.schedule_flush(owner);
    }

    /// Writes the slot's sessions, or drops the stored record once the
    /// slot holds none.
    async fn persist_session(&self, owner: PublicKey, device_id: &str) {
        let _serial = self.persist_lock.lock().await;
        if self.is_closed() {
            return;
        }

        let record = {
            let state = lock(&self.state);
            match state.peers.get(&owner).and_then(|p| p.get_device(device_id)) {
                None => None,
                Some(slot) => {
                    let encode = |id: SessionId| {
                        let entry = state.table.get(id)?;
                        match entry.session.serialize() {
                            Ok(serialized) => Some(serialized),
                            Err(e) => {
                                tracing::warn!(peer = %owner, device_id, session = %id, error = %e, "failed to serialize session");
                                None
                            }
                        }
                    };
                    let active = match slot.active() {
                        Some(id) => match encode(id) {
                            Some(serialized) => Some(serialized),
                            None => return,
                        },
                        None => None,
                    };
                    let inactive: Vec<String> = slot.inactive().filter_map(&encode).collect();
                    (active.is_some() || !inactive.is_empty()).then(|| StoredSession {
                        device_id: device_id.to_string(),
                        state: active,
                        inactive,
                        last_activity: slot.last_activity,
                    })
                }
            }
        };

        let key = session_storage_key(&owner, device_id);
        let Some(record) = record else {
            if let Err(e) = self.storage.del(&key).await {
                tracing::warn!(%key, error = %e, "failed to delete stored session");
            }
            return;
        };
        let json = match serde_json::to_string(&record) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(%key, error = %e, "failed to encode session");
                return;
            }
        };
        if let Err(e) = self.storage.put(&key, json).await {
            tracing::warn!(%key, error = %e, "failed to persist session");
        }
    }

    async fn accept_invite(self: &Arc<Self>, invite: Invite) -> Result<SessionId> {
        self.ensure_open()?;
        let inviter = invite.inviter;
        let device_id = invite.device_id.clone();
        if self.is_own_device(&inviter, &device_id) {
            return Err(Error::SelfInvite);
        }

        if let Some(id) = self.active_session_id(&inviter, &device_id) {
            return Ok(id);
        }

        let key = acceptance_key(&inviter, &device_id);
        let Some(_in_flight) = self.lifecycle.try_begin(&key) else {
            tokio::time::sleep(self.config.in_flight_recheck()).await;
            return self
                .active_session_id(&inviter, &device_id)
                .ok_or(Error::InviteInFlight(key));
        };

        // Another task may have finished between the check and the claim.
        if let Some(id) = self.active_session_id(&inviter, &device_id) {
            return Ok(id);
        }

        let Handshake {
            mut session,
            acceptance,
        } = match self
            .engine
            .accept_invite(&invite, &self.keys, &self.device_id)
            .await
        {
            Ok(handshake) => handshake,
            Err(e) => {
                tracing::warn!(peer = %inviter, %device_id, error = %e, "invite handshake failed");
                self.lifecycle.mark_rejected(&key);
                return Err(match e {
                    Error::Handshake(_) => e,
                    other => Error::Handshake(other.to_string()),
                });
            }
        };

        if self.is_closed() {
            session.close();
            return Err(Error::Closed);
        }

        let (id, backlog) = self
            .register_session(inviter, &device_id, session, now_millis())
            .await?;
        self.lifecycle.clear_rejected(&key);

        if let Err(e) = self.transport.publish(acceptance).await {
            tracing::warn!(peer = %inviter, %device_id, error = %e, "failed to publish invite acceptance");
        }
        tracing::info!(peer = %inviter, %device_id, session = %id, "accepted invite");

        self.replay_history(inviter, &device_id, id, backlog).await;
        self.schedule_flush(inviter);
        Ok(id)
    }

    async fn handle_invite_event(self: &Arc<Self>, event: nostr::Event) {
        if event.verify().is_err() {
            tracing::debug!(id = %event.id, "ignoring invite with bad signature");
            return;
        }
        let invite = match Invite::from_event(&event) {
            Ok(invite) => invite,
            Err(e) => {
                tracing::debug!(id = %event.id, error = %e, "ignoring invite event");
                return;
            }
        };
        if self.is_own_device(&invite.inviter, &invite.device_id) {
            return;
        }
        if self.is_revoked(&invite.inviter, &invite.device_id) {
            tracing::debug!(id = %event.id, device_id = %invite.device_id, "ignoring invite of revoked device");
            return;
        }

        match self.accept_invite(invite).await {
            Ok(_) | Err(Error::Closed) => {}
            Err(e) => tracing::debug!(id = %event.id, error = %e, "invite not accepted"),
        }
    }

    /// Turns an acceptance of our own invite into a session, at most once
    /// per acceptance event.
    async fn handle_acceptance(self: &Arc<Self>, event: nostr::Event) {
        if self.is_closed() {
            return;
        }

        let event_id = event.id.to_string();
        if !lock(&self.processed_acceptances).insert(event_id.clone()) {
            return;
        }
        let marker_key = format!("{}{}", INVITE_ACCEPT_KEY_PREFIX, event_id);
        match self.storage.get(&marker_key).await {
            Ok(Some(_)) => {
                tracing::debug!(id = %event_id, "acceptance already processed");
                return;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(key = %marker_key, error = %e, "failed to read acceptance marker"),
        }

        let Some(invite) = lock(&self.invite).clone() else {
            return;
        };
        let InviteAcceptance {
            mut session,
            invitee,
            device_id,
        } = match self.engine.open_acceptance(&invite, &self.keys, &event) {
            Ok(Some(acceptance)) => acceptance,
            Ok(None) => return,
            Err(e) => {
                tracing::debug!(id = %event_id, error = %e, "failed to open invite acceptance");
                return;
            }
        };

        if self.is_own_device(&invitee, &device_id) {
            tracing::debug!(id = %event_id, "ignoring acceptance from our own device");
            session.close();
            return;
        }

        match self
            .register_session(invitee, &device_id, session, now_millis())
            .await
        {
            Ok((id, backlog)) => {
                tracing::info!(peer = %invitee, %device_id, session = %id, "invite accepted by peer");
                self.lifecycle
                    .clear_rejected(&acceptance_key(&invitee, &device_id));
                if let Err(e) = self.storage.put(&marker_key, now_millis().to_string()).await {
                    tracing::warn!(key = %marker_key, error = %e, "failed to persist acceptance marker");
                }
                self.replay_history(invitee, &device_id, id, backlog).await;
                self.schedule_flush(invitee);
            }
            Err(e) => tracing::debug!(id = %event_id, error = %e, "acceptance not registered"),
        }
    }

    fn is_revoked(&self, identity: &PublicKey, device_id: &str) -> bool {
        lock(&self.revoked).contains(&(*identity, device_id.to_string()))
    }

    fn handle_tombstone(self: &Arc<Self>, event: &nostr::Event, device_id: &str) {
        if event.verify().is_err() {
            tracing::debug!(id = %event.id, "ignoring tombstone with bad signature");
            return;
        }
        let identity = event.pubkey;
        if self.is_own_device(&identity, device_id) {
            tracing::debug!(id = %event.id, "ignoring tombstone for this device");
            return;
        }
        if self.cleanup_device(identity, device_id) {
            let inner = Arc::clone(self);
            let device_id = device_id.to_string();
            spawn_detached(async move { inner.forget_device_storage(identity, &device_id).await });
        }
    }

    /// Marks the device revoked and closes its sessions. Returns false if it
    /// was already revoked.
    fn cleanup_device(&self, identity: PublicKey, device_id: &str) -> bool {
        if !lock(&self.revoked).insert((identity, device_id.to_string())) {
            return false;
        }
        let closed_ids = {
            let mut state = lock(&self.state);
            let DirectoryState { peers, table } = &mut *state;
            let ids = peers
                .get_mut(&identity)
                .and_then(|peer| peer.remove_device(device_id))
                .map(|slot| slot.session_ids())
                .unwrap_or_default();
            for id in &ids {
                table.close(*id);
            }
            ids
        };
        self.unsubscribe_sessions(&closed_ids);
        tracing::info!(peer = %identity, device_id, sessions = closed_ids.len(), "device revoked");
        true
    }

    /// Stops accepting new sessions on this device's invite.
    fn retire_own_invite(&self) {
        let unsubscribe = lock(&self.acceptance_subscription).take();
        if let Some(unsubscribe) = unsubscribe {
            unsubscribe();
        }
        *lock(&self.invite) = None;
    }

    async fn forget_device_storage(&self, identity: PublicKey, device_id: &str) {
        let mut keys = vec![session_storage_key(&identity, device_id)];
        if identity == self.keys.public_key() {
            keys.push(Invite::storage_key(device_id));
        }
        for key in keys {
            if let Err(e) = self.storage.del(&key).await {
                tracing::warn!(%key, error = %e, "failed to delete revoked device state");
            }
        }
    }

    /// Sends `history` through a session with one of `owner`'s newly
    /// discovered devices. Sessions that cannot send yet get nothing.
    async fn replay_history(
        self: &Arc<Self>,
        owner: PublicKey,
        device_id: &str,
        id: SessionId,
        history: Vec<UnsignedEvent>,
    ) {
        if history.is_empty() {
            return;
        }

        let _serial = self.flush_lock.lock().await;
        if self.is_closed() {
            return;
        }
        let (envelopes, resubscribe) = {
            let mut state = lock(&self.state);
            let Some(entry) = state.table.get_mut(id) else {
                return;
            };
            if !entry.session.ready() {
                return;
            }
            let mut envelopes = Vec::new();
            for event in &history {
                match entry.session.send(event) {
                    Ok(sent) => envelopes.push(sent.envelope),
                    Err(e) => {
                        tracing::warn!(peer = %owner, device_id, error = %e, "failed to encrypt history");
                        break;
                    }
                }
            }
            let filter = entry.session.envelope_filter();
            let resubscribe = (filter != entry.filter).then(|| {
                entry.filter = filter.clone();
                filter
            });
            (envelopes, resubscribe)
        };
        if envelopes.is_empty() {
            return;
        }

        if let Some(filter) = resubscribe {
            self.subscribe_session(id, filter);
        }
        self.persist_session(owner, device_id).await;
        tracing::debug!(peer = %owner, device_id, count = envelopes.len(), "replaying message history");
        for envelope in envelopes {
            if let Err(e) = self.transport.publish(envelope).await {
                tracing::warn!(peer = %owner, device_id, error = %e, "failed to publish history");
            }
        }
    }

    fn listen_to_identity(self: &Arc<Self>, identity: PublicKey) {
        if self.is_closed() {
            return;
        }
        {
            let mut listeners = lock(&self.identity_listeners);
            if listeners.contains_key(&identity) {
                return;
            }
            listeners.insert(identity, None);
        }

        let weak = Arc::downgrade(self);
        let handler: EventHandler = Arc::new(move |event: nostr::Event| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            // Tombstones apply before any invite task spawned after them.
            match Invite::tombstone_device_id(&event) {
                Some(device_id) => inner.handle_tombstone(&event, &device_id),
                None => {
                    spawn_detached(async move { inner.handle_invite_event(event).await });
                }
            }
        });

        match self.transport.subscribe(Invite::user_filter(identity), handler) {
            Ok(unsubscribe) => {
                let leftover = {
                    let mut listeners = lock(&self.identity_listeners);
                    match listeners.get_mut(&identity) {
                        Some(slot) if !self.is_closed() => {
                            *slot = Some(unsubscribe);
                            None
                        }
                        _ => Some(unsubscribe),
                    }
                };
                if let Some(leftover) = leftover {
                    leftover();
                }
                tracing::debug!(%identity, "listening for invites");
            }
            Err(e) => {
                tracing::warn!(%identity, error = %e, "failed to subscribe to invites");
                lock(&self.identity_listeners).remove(&identity);
            }
        }
    }

    fn stop_listening_to_identity(&self, identity: PublicKey) {
        let removed = lock(&self.identity_listeners).remove(&identity);
        if let Some(Some(unsubscribe)) = removed {
            unsubscribe();
        }
    }

    fn schedule_flush(self: &Arc<Self>, recipient: PublicKey) {
        if self.is_closed() {
            return;
        }
        let pending = lock(&self.queue).has_pending(&recipient);
        if !pending {
            return;
        }
        let weak = Arc::downgrade(self);
        let scheduled = self
            .flushes
            .schedule(recipient, self.config.flush_delay(), async move {
                if let Some(inner) = weak.upgrade() {
                    inner.flush_queue(recipient).await;
                }
            });
        if scheduled {
            tracing::debug!(%recipient, "queue flush scheduled");
        }
    }

    fn schedule_flush_if_routable(self: &Arc<Self>, recipient: PublicKey) {
        let routable = {
            let state = lock(&self.state);
            has_ready_route(&state.peers, &state.table, &recipient)
        };
        if routable {
            self.schedule_flush(recipient);
        }
    }

    async fn flush_queue(self: &Arc<Self>, recipient: PublicKey) {
        let _serial = self.flush_lock.lock().await;
        if self.is_closed() {
            return;
        }

        let entries = lock(&self.queue).take(&recipient);
        if entries.is_empty() {
            return;
        }
        tracing::debug!(%recipient, count = entries.len(), "flushing queued messages");

        let remaining = drain_in_order(entries, |event| {
            let inner = Arc::clone(self);
            async move { inner.dispatch_ready(recipient, event).await }
        })
        .await;

        if self.is_closed() {
            return;
        }
        if remaining.is_empty() {
            // Sends queued while draining.
            self.schedule_flush_if_routable(recipient);
        } else {
            lock(&self.queue).requeue_front(recipient, remaining);
        }
    }

    /// Encrypts and publishes through every ready route. `Ok(None)` when the
    /// recipient has no ready session or none of them could encrypt, leaving
    /// the event to the queue.
    async fn dispatch_ready(
        self: &Arc<Self>,
        recipient: PublicKey,
        event: UnsignedEvent,
    ) -> Result<Option<Vec<String>>> {
        self.ensure_open()?;
        let own = self.keys.public_key();

        let (envelopes, touched, resubscribe) = {
            let mut state = lock(&self.state);
            let DirectoryState { peers, table } = &mut *state;
            if !has_ready_route(peers, table, &recipient) {
                return Ok(None);
            }

            let now = now_millis();
            let mut envelopes = Vec::new();
            let mut touched = Vec::new();
            let mut resubscribe = Vec::new();
            for id in fan_out_targets(peers, table, recipient, own, &self.device_id) {
                let Some(entry) = table.get_mut(id) else {
                    continue;
                };
                match entry.session.send(&event) {
                    Ok(sent) => {
                        envelopes.push(sent.envelope);
                        touched.push((entry.owner, entry.device_id.clone()));
                        let filter = entry.session.envelope_filter();
                        if filter != entry.filter {
                            entry.filter = filter.clone();
                            resubscribe.push((id, filter));
                        }
                    }
                    Err(e) => {
                        tracing::warn!(peer = %entry.owner, device_id = %entry.device_id, error = %e, "failed to encrypt message")
                    }
                }
            }
            for (owner, device_id) in &touched {
                if let Some(slot) = peers.get_mut(owner).and_then(|p| p.get_device_mut(device_id)) {
                    slot.touch(now);
                }
            }
            // Under the state lock, where `register_session` snapshots it.
            if !envelopes.is_empty() {
                lock(&self.history).record(recipient, event);
            }
            (envelopes, touched, resubscribe)
        };

        if envelopes.is_empty() {
            tracing::warn!(%recipient, "no session could encrypt, leaving message queued");
            return Ok(None);
        }

        for (id, filter) in resubscribe {
            self.subscribe_session(id, filter);
        }
        for (owner, device_id) in &touched {
            self.persist_session(*owner, device_id).await;
        }

        let ids: Vec<String> = envelopes.iter().map(|e| e.id.to_string()).collect();
        let results = join_all(
            envelopes
                .into_iter()
                .map(|envelope| self.transport.publish(envelope)),
        )
        .await;
        for result in results {
            if let Err(e) = result {
                tracing::warn!(%recipient, error = %e, "failed to publish message");
            }
        }
        Ok(Some(ids))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.flushes.abort_all();

        let mut unsubscribes: Vec<Unsubscribe> = Vec::new();
        unsubscribes.extend(lock(&self.acceptance_subscription).take());
        unsubscribes.extend(
            lock(&self.identity_listeners)
                .drain()
                .filter_map(|(_, unsubscribe)| unsubscribe),
        );
        unsubscribes.extend(
            lock(&self.session_subscriptions)
                .drain()
                .map(|(_, unsubscribe)| unsubscribe),
        );
        for unsubscribe in unsubscribes {
            unsubscribe();
        }

        let sessions = {
            let mut state = lock(&self.state);
            let count = state.table.len();
            state.table.close_all();
            state.peers.clear();
            count
        };
        lock(&self.queue).clear();
        lock(&self.history).clear();
        lock(&self.revoked).clear();
        self.router.clear();
        self.lifecycle.clear();
        lock(&self.processed_acceptances).clear();
        tracing::info!(device_id = %self.device_id, sessions, "session directory closed");
    }
}
