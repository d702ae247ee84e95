use crate::session_table::SessionTable;
use crate::utils::{lock, now_millis, spawn_detached};
use crate::{PeerRegistry, Result, SessionId};
use nostr::{PublicKey, UnsignedEvent};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub(crate) type SendReply = oneshot::Sender<Result<Vec<String>>>;

/// A send waiting for its recipient to have a ready session.
pub(crate) struct QueuedMessage {
    pub event: UnsignedEvent,
    pub enqueued_at: u64,
    reply: SendReply,
}

impl QueuedMessage {
    pub fn resolve(self, result: Result<Vec<String>>) {
        // The caller may have stopped waiting.
        let _ = self.reply.send(result);
    }
}

/// Per-recipient FIFO of pending sends.
#[derive(Default)]
pub(crate) struct OutboundQueue {
    queues: HashMap<PublicKey, VecDeque<QueuedMessage>>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(
        &mut self,
        recipient: PublicKey,
        event: UnsignedEvent,
    ) -> oneshot::Receiver<Result<Vec<String>>> {
        let (reply, rx) = oneshot::channel();
        self.queues.entry(recipient).or_default().push_back(QueuedMessage {
            event,
            enqueued_at: now_millis(),
            reply,
        });
        rx
    }

    /// Removes and returns every entry queued for `recipient`, oldest first.
    pub fn take(&mut self, recipient: &PublicKey) -> VecDeque<QueuedMessage> {
        self.queues.remove(recipient).unwrap_or_default()
    }

    /// Puts entries back ahead of anything enqueued since they were taken.
    pub fn requeue_front(&mut self, recipient: PublicKey, mut entries: VecDeque<QueuedMessage>) {
        if entries.is_empty() {
            return;
        }
        if let Some(newer) = self.queues.remove(&recipient) {
            entries.extend(newer);
        }
        self.queues.insert(recipient, entries);
    }

    pub fn len(&self, recipient: &PublicKey) -> usize {
        self.queues.get(recipient).map(VecDeque::len).unwrap_or(0)
    }

    pub fn has_pending(&self, recipient: &PublicKey) -> bool {
        self.len(recipient) > 0
    }

    /// Drops the recipient's queue, failing each pending send with `error`.
    pub fn remove(&mut self, recipient: &PublicKey, error: impl Fn() -> crate::Error) {
        for entry in self.take(recipient) {
            entry.resolve(Err(error()));
        }
    }

    /// Drops every queue. Waiting callers observe a closed channel.
    pub fn clear(&mut self) {
        self.queues.clear();
    }
}

/// Events already dispatched to a recipient, newest last, bounded per
/// recipient. Replayed to devices of that recipient discovered later.
pub(crate) struct MessageHistory {
    limit: usize,
    events: HashMap<PublicKey, VecDeque<UnsignedEvent>>,
}

impl MessageHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            events: HashMap::new(),
        }
    }

    pub fn record(&mut self, recipient: PublicKey, event: UnsignedEvent) {
        if self.limit == 0 {
            return;
        }
        let events = self.events.entry(recipient).or_default();
        events.push_back(event);
        while events.len() > self.limit {
            events.pop_front();
        }
    }

    pub fn get(&self, recipient: &PublicKey) -> Vec<UnsignedEvent> {
        self.events
            .get(recipient)
            .map(|events| events.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn remove(&mut self, recipient: &PublicKey) {
        self.events.remove(recipient);
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

/// Sends `entries` strictly in order.
///
/// `send` returns `Ok(None)` when no ready route exists; draining then stops
/// and the untouched entries (including the current one) are returned in
/// their original order. A failed send resolves that entry's caller with the
/// error and draining continues.
pub(crate) async fn drain_in_order<F, Fut>(
    mut entries: VecDeque<QueuedMessage>,
    mut send: F,
) -> VecDeque<QueuedMessage>
where
    F: FnMut(UnsignedEvent) -> Fut,
    Fut: Future<Output = Result<Option<Vec<String>>>>,
{
    while let Some(entry) = entries.pop_front() {
        match send(entry.event.clone()).await {
            Ok(Some(ids)) => entry.resolve(Ok(ids)),
            Ok(None) => {
                entries.push_front(entry);
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, enqueued_at = entry.enqueued_at, "queued send failed");
                entry.resolve(Err(e));
            }
        }
    }
    entries
}

/// Ready sessions an outgoing event is encrypted under: every ready session
/// of the recipient plus, as a mirrored copy, every ready session of our own
/// other devices.
pub(crate) fn fan_out_targets(
    peers: &HashMap<PublicKey, PeerRegistry>,
    table: &SessionTable,
    recipient: PublicKey,
    own_identity: PublicKey,
    own_device_id: &str,
) -> Vec<SessionId> {
    let mut seen = HashSet::new();
    let mut targets = Vec::new();

    for owner in [recipient, own_identity] {
        let Some(peer) = peers.get(&owner) else {
            continue;
        };
        for (device_id, session_id) in peer.active_sessions() {
            if owner == own_identity && device_id == own_device_id {
                continue;
            }
            if table.is_ready(session_id) && seen.insert(session_id) {
                targets.push(session_id);
            }
        }
    }
    targets
}

/// True if `recipient` has at least one ready session.
pub(crate) fn has_ready_route(
    peers: &HashMap<PublicKey, PeerRegistry>,
    table: &SessionTable,
    recipient: &PublicKey,
) -> bool {
    peers
        .get(recipient)
        .map(|peer| {
            peer.active_sessions()
                .into_iter()
                .any(|(_, id)| table.is_ready(id))
        })
        .unwrap_or(false)
}

/// Delayed, cancelable flush tasks; at most one pending per recipient.
#[derive(Default)]
pub(crate) struct FlushScheduler {
    pending: Arc<Mutex<HashMap<PublicKey, JoinHandle<()>>>>,
}

impl FlushScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `flush` after `delay` unless a flush for `recipient` is already
    /// waiting. The pending marker is cleared as soon as the timer fires so a
    /// send arriving mid-flush can schedule the next one.
    pub fn schedule<F>(&self, recipient: PublicKey, delay: Duration, flush: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut pending = lock(&self.pending);
        if pending.contains_key(&recipient) {
            return false;
        }

        let markers = Arc::clone(&self.pending);
        let handle = spawn_detached(async move {
            tokio::time::sleep(delay).await;
            lock(&markers).remove(&recipient);
            flush.await;
        });

        match handle {
            Some(handle) => {
                pending.insert(recipient, handle);
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn is_pending(&self, recipient: &PublicKey) -> bool {
        lock(&self.pending).contains_key(recipient)
    }

    pub fn cancel(&self, recipient: &PublicKey) {
        if let Some(handle) = lock(&self.pending).remove(recipient) {
            handle.abort();
        }
    }

    pub fn abort_all(&self) {
        for (_, handle) in lock(&self.pending).drain() {
            handle.abort();
        }
    }
}
