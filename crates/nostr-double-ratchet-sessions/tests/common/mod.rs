#![allow(dead_code)]

use async_trait::async_trait;
use nostr::{EventBuilder, Keys, Kind, PublicKey, Tag, UnsignedEvent};
use nostr_double_ratchet_sessions::{
    build_filter, DirectoryConfig, Error, EventHandler, Handshake, InMemoryStorage, Invite,
    InviteAcceptance, RatchetEngine, RatchetSession, Result, SentEnvelope, SessionDirectory,
    StorageAdapter, SubscriptionFilter, Transport, Unsubscribe, INVITE_RESPONSE_KIND,
    MESSAGE_EVENT_KIND,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct RelayState {
    events: Vec<nostr::Event>,
    seen: HashSet<nostr::EventId>,
    subscriptions: BTreeMap<u64, (SubscriptionFilter, EventHandler)>,
    next_id: u64,
}

/// In-process relay: stores every event, replays matches on subscribe and
/// delivers publishes synchronously, never holding its lock while calling
/// handlers.
#[derive(Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
    fail_publish: AtomicBool,
}

impl MemoryRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn events_by(&self, author: &PublicKey, kind: u32) -> Vec<nostr::Event> {
        self.state
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|e| e.pubkey == *author && e.kind.as_u16() as u32 == kind)
            .cloned()
            .collect()
    }

    pub fn count_kind(&self, kind: u32) -> usize {
        self.state
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|e| e.kind.as_u16() as u32 == kind)
            .count()
    }

    pub fn subscription_count(&self) -> usize {
        self.state.lock().unwrap().subscriptions.len()
    }
}

#[async_trait]
impl Transport for MemoryRelay {
    fn subscribe(&self, filter: SubscriptionFilter, on_event: EventHandler) -> Result<Unsubscribe> {
        let (id, replay) = {
            let mut state = self.state.lock().unwrap();
            state.next_id += 1;
            let id = state.next_id;
            state
                .subscriptions
                .insert(id, (filter.clone(), on_event.clone()));
            let replay: Vec<nostr::Event> = state
                .events
                .iter()
                .filter(|e| filter.matches(e))
                .cloned()
                .collect();
            (id, replay)
        };

        for event in replay {
            on_event(event);
        }

        let state = Arc::downgrade(&self.state);
        Ok(Box::new(move || {
            if let Some(state) = state.upgrade() {
                state.lock().unwrap().subscriptions.remove(&id);
            }
        }))
    }

    async fn publish(&self, event: nostr::Event) -> Result<()> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(Error::Transport("relay unavailable".to_string()));
        }

        let handlers: Vec<EventHandler> = {
            let mut state = self.state.lock().unwrap();
            if !state.seen.insert(event.id) {
                return Ok(());
            }
            state.events.push(event.clone());
            state
                .subscriptions
                .values()
                .filter(|(filter, _)| filter.matches(&event))
                .map(|(_, handler)| handler.clone())
                .collect()
        };

        for handler in handlers {
            handler(event.clone());
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct MockState {
    nonce: String,
    acceptor: bool,
    ready: bool,
    seen: Vec<String>,
    sent: u64,
}

/// Plaintext stand-in for a ratchet session. Both sides share a nonce and
/// talk on two directional `c` tag channels derived from it.
pub struct MockSession {
    state: MockState,
    closed: Arc<AtomicUsize>,
    fail_sends: Arc<AtomicBool>,
    is_closed: bool,
}

impl MockSession {
    fn send_channel(&self) -> String {
        channel(&self.state.nonce, self.state.acceptor)
    }

    fn recv_channel(&self) -> String {
        channel(&self.state.nonce, !self.state.acceptor)
    }
}

fn channel(nonce: &str, from_acceptor: bool) -> String {
    if from_acceptor {
        format!("{}:a", nonce)
    } else {
        format!("{}:i", nonce)
    }
}

fn tag(name: &str, value: &str) -> Tag {
    Tag::parse(&[name.to_string(), value.to_string()]).unwrap()
}

impl RatchetSession for MockSession {
    fn ready(&self) -> bool {
        self.state.ready
    }

    fn send(&mut self, event: &UnsignedEvent) -> Result<SentEnvelope> {
        if !self.state.ready {
            return Err(Error::Ratchet("session cannot send yet".to_string()));
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::Ratchet("chain key unavailable".to_string()));
        }
        self.state.sent += 1;

        let ephemeral = Keys::generate();
        let envelope = EventBuilder::new(
            Kind::from(MESSAGE_EVENT_KIND as u16),
            serde_json::to_string(event)?,
        )
        .tags(vec![tag("c", &self.send_channel())])
        .build(ephemeral.public_key())
        .sign_with_keys(&ephemeral)
        .map_err(|e| Error::Ratchet(e.to_string()))?;

        Ok(SentEnvelope {
            envelope,
            echo: event.clone(),
        })
    }

    fn receive(&mut self, envelope: &nostr::Event) -> Result<Option<UnsignedEvent>> {
        if !self.envelope_filter().matches(envelope) {
            return Ok(None);
        }
        let id = envelope.id.to_string();
        if self.state.seen.contains(&id) {
            return Ok(None);
        }
        let rumor: UnsignedEvent = serde_json::from_str(&envelope.content)?;
        self.state.seen.push(id);
        self.state.ready = true;
        Ok(Some(rumor))
    }

    fn envelope_filter(&self) -> SubscriptionFilter {
        build_filter()
            .kinds(vec![MESSAGE_EVENT_KIND])
            .tag('c', self.recv_channel())
            .build()
    }

    fn serialize(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.state)?)
    }

    fn close(&mut self) {
        if !self.is_closed {
            self.is_closed = true;
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AcceptancePayload {
    invitee: String,
    device_id: String,
    nonce: String,
}

/// Engine producing `MockSession`s. The acceptor side is ready at once; the
/// inviter side becomes ready after its first received envelope.
#[derive(Default)]
pub struct MockEngine {
    pub created: AtomicUsize,
    pub handshakes: AtomicUsize,
    pub opened: AtomicUsize,
    pub fail_handshakes: AtomicBool,
    /// Makes every session's `send` fail while set.
    pub fail_sends: Arc<AtomicBool>,
    pub handshake_delay_ms: AtomicU64,
    closed: Arc<AtomicUsize>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn handshakes(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    fn session(&self, state: MockState) -> Box<dyn RatchetSession> {
        Box::new(MockSession {
            state,
            closed: self.closed.clone(),
            fail_sends: self.fail_sends.clone(),
            is_closed: false,
        })
    }
}

fn listen_key(invite: &Invite) -> Result<&String> {
    invite
        .public_material
        .get("listenKey")
        .ok_or_else(|| Error::Invite("missing listenKey".to_string()))
}

#[async_trait]
impl RatchetEngine for MockEngine {
    fn create_invite(&self, inviter: PublicKey, device_id: &str) -> Result<Invite> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let listen = Keys::generate();
        let mut public = BTreeMap::new();
        public.insert("listenKey".to_string(), listen.public_key().to_hex());
        let mut private = BTreeMap::new();
        private.insert("listenSecret".to_string(), listen.secret_key().to_secret_hex());
        Ok(Invite::new(inviter, device_id, public, Some(private)))
    }

    async fn accept_invite(
        &self,
        invite: &Invite,
        identity: &Keys,
        device_id: &str,
    ) -> Result<Handshake> {
        tokio::task::yield_now().await;
        self.handshakes.fetch_add(1, Ordering::SeqCst);
        let delay = self.handshake_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_handshakes.load(Ordering::SeqCst) {
            return Err(Error::Handshake("bad invite key material".to_string()));
        }

        let nonce = Keys::generate().public_key().to_hex();
        let payload = AcceptancePayload {
            invitee: identity.public_key().to_hex(),
            device_id: device_id.to_string(),
            nonce: nonce.clone(),
        };
        let ephemeral = Keys::generate();
        let acceptance = EventBuilder::new(
            Kind::from(INVITE_RESPONSE_KIND as u16),
            serde_json::to_string(&payload)?,
        )
        .tags(vec![tag("p", listen_key(invite)?)])
        .build(ephemeral.public_key())
        .sign_with_keys(&ephemeral)
        .map_err(|e| Error::Handshake(e.to_string()))?;

        Ok(Handshake {
            session: self.session(MockState {
                nonce,
                acceptor: true,
                ready: true,
                seen: Vec::new(),
                sent: 0,
            }),
            acceptance,
        })
    }

    fn acceptance_filter(&self, invite: &Invite) -> SubscriptionFilter {
        let mut builder = build_filter().kinds(vec![INVITE_RESPONSE_KIND]);
        if let Ok(key) = listen_key(invite) {
            builder = builder.tag('p', key.clone());
        }
        builder.build()
    }

    fn open_acceptance(
        &self,
        invite: &Invite,
        _identity: &Keys,
        event: &nostr::Event,
    ) -> Result<Option<InviteAcceptance>> {
        if !self.acceptance_filter(invite).matches(event) {
            return Ok(None);
        }
        if invite.private_material.is_none() {
            return Err(Error::Invite("cannot open acceptance without private material".to_string()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);

        let payload: AcceptancePayload = serde_json::from_str(&event.content)?;
        let invitee = PublicKey::from_hex(&payload.invitee)?;
        Ok(Some(InviteAcceptance {
            session: self.session(MockState {
                nonce: payload.nonce,
                acceptor: false,
                ready: false,
                seen: Vec::new(),
                sent: 0,
            }),
            invitee,
            device_id: payload.device_id,
        }))
    }

    fn restore_session(&self, state: &str) -> Result<Box<dyn RatchetSession>> {
        let state: MockState = serde_json::from_str(state)?;
        Ok(self.session(state))
    }
}

pub fn test_config() -> DirectoryConfig {
    DirectoryConfig {
        flush_delay_ms: 20,
        in_flight_recheck_ms: 100,
        max_stale_latency_ms: 50,
        ..DirectoryConfig::default()
    }
}

/// Storage whose writes take `delay_ms`, to stretch out persistence.
pub struct SlowStorage {
    inner: InMemoryStorage,
    delay_ms: u64,
}

impl SlowStorage {
    pub fn new(delay_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryStorage::new(),
            delay_ms,
        })
    }
}

#[async_trait]
impl StorageAdapter for SlowStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: String) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        self.inner.put(key, value).await
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.inner.del(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix).await
    }
}

/// A directory plus everything it decrypted, as `(content, from)`.
pub struct TestDevice {
    pub dir: SessionDirectory,
    pub keys: Keys,
    pub storage: Arc<dyn StorageAdapter>,
    pub engine: Arc<MockEngine>,
    pub received: Arc<Mutex<Vec<(String, PublicKey)>>>,
    _observer: Unsubscribe,
}

impl TestDevice {
    pub fn new(relay: &Arc<MemoryRelay>, keys: &Keys, device_id: &str) -> Self {
        Self::with_parts(
            relay,
            keys,
            device_id,
            Arc::new(InMemoryStorage::new()),
            MockEngine::new(),
            test_config(),
        )
    }

    pub fn with_parts(
        relay: &Arc<MemoryRelay>,
        keys: &Keys,
        device_id: &str,
        storage: Arc<dyn StorageAdapter>,
        engine: Arc<MockEngine>,
        config: DirectoryConfig,
    ) -> Self {
        let dir = SessionDirectory::new(
            keys.clone(),
            device_id,
            relay.clone(),
            storage.clone(),
            engine.clone(),
            config,
        );
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let observer = dir.on_event(move |event: &UnsignedEvent, from: PublicKey| {
            sink.lock().unwrap().push((event.content.clone(), from));
        });
        Self {
            dir,
            keys: keys.clone(),
            storage,
            engine,
            received,
            _observer: observer,
        }
    }

    pub fn pubkey(&self) -> PublicKey {
        self.keys.public_key()
    }

    pub fn contents(&self) -> Vec<String> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .map(|(content, _)| content.clone())
            .collect()
    }
}

/// Polls `condition` every 10ms until it holds or `timeout_ms` passes.
pub async fn wait_until<F>(timeout_ms: u64, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
