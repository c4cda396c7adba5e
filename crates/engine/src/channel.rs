// Presence channel: a named pub/sub topic plus the replicated presence
// table riding on it.
//
// Broadcast is unreliable by design: topics are bounded and a lagged
// receiver simply drops messages. That is acceptable because the data
// model is eventually consistent — a dropped doc-update is reconciled by
// the next sync-request cycle. Messages are never echoed back to their
// sender.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, watch};
use tracing::warn;

use noteroom_common::protocol::ChannelMessage;
use noteroom_common::types::{ConnectionId, PresenceEntry};

/// Bounded per-topic buffer; older messages are dropped for slow
/// receivers rather than applying backpressure.
const TOPIC_CAPACITY: usize = 256;

/// In-process broker for room topics. One hub is shared by every peer of
/// the process; the network boundary (if any) sits behind the wire
/// protocol in `noteroom-common`.
#[derive(Default)]
pub struct ChannelHub {
    topics: Mutex<HashMap<String, broadcast::Sender<ChannelMessage>>>,
}

impl ChannelHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn topic(&self, name: &str) -> broadcast::Sender<ChannelMessage> {
        let mut topics = self.topics.lock().expect("hub topics lock poisoned");
        // Topics whose last subscriber is gone are dead weight; sweep
        // them out before handing over a sender.
        topics.retain(|_, tx| tx.receiver_count() > 0);
        topics
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }

    /// Subscribe a connection to a topic. The subscription filters out
    /// the connection's own messages.
    pub fn subscribe(&self, topic: &str, local: ConnectionId) -> ChannelSubscription {
        let tx = self.topic(topic);
        let rx = tx.subscribe();
        ChannelSubscription { local, tx, rx }
    }

    /// Number of topics currently held by the hub.
    pub fn topic_count(&self) -> usize {
        self.topics.lock().expect("hub topics lock poisoned").len()
    }
}

/// A live topic subscription for one connection.
pub struct ChannelSubscription {
    local: ConnectionId,
    tx: broadcast::Sender<ChannelMessage>,
    rx: broadcast::Receiver<ChannelMessage>,
}

impl ChannelSubscription {
    /// A cloneable publishing handle for this topic.
    pub fn publisher(&self) -> ChannelPublisher {
        ChannelPublisher { tx: self.tx.clone() }
    }

    /// Receive the next message from another peer. Returns `None` only
    /// when the topic itself is gone (hub dropped). Lag is logged and
    /// skipped — lossy delivery is part of the contract.
    pub async fn recv(&mut self) -> Option<ChannelMessage> {
        loop {
            match self.rx.recv().await {
                Ok(message) if message.sender() == self.local => continue,
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "channel receiver lagged, dropping messages");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Fire-and-forget publisher. Sending to a topic with no subscribers is
/// a no-op, not an error.
#[derive(Clone)]
pub struct ChannelPublisher {
    tx: broadcast::Sender<ChannelMessage>,
}

impl ChannelPublisher {
    pub fn publish(&self, message: ChannelMessage) {
        let _ = self.tx.send(message);
    }
}

// ── Presence table ──────────────────────────────────────────────────

struct Seen {
    entry: PresenceEntry,
    last_seen: Instant,
}

/// Replicated table of per-connection presence entries. Last write wins
/// per connection id. Entries are removed by an explicit leave message
/// or inferred removal when not refreshed within the staleness window.
pub struct PresenceTable {
    entries: HashMap<ConnectionId, Seen>,
    snapshot_tx: watch::Sender<Vec<PresenceEntry>>,
}

impl PresenceTable {
    pub fn new() -> Self {
        let (snapshot_tx, _) = watch::channel(Vec::new());
        Self { entries: HashMap::new(), snapshot_tx }
    }

    /// Apply an awareness message: `Some(entry)` adds or updates,
    /// `None` removes. Returns true when the table changed.
    pub fn apply(
        &mut self,
        client: ConnectionId,
        entry: Option<PresenceEntry>,
        now: Instant,
    ) -> bool {
        let changed = match entry {
            Some(entry) => {
                let replaced =
                    self.entries.insert(client, Seen { entry: entry.clone(), last_seen: now });
                match replaced {
                    Some(previous) => previous.entry != entry,
                    None => true,
                }
            }
            None => self.entries.remove(&client).is_some(),
        };
        if changed {
            self.publish();
        }
        changed
    }

    /// Refresh a connection's liveness without changing its entry.
    pub fn touch(&mut self, client: ConnectionId, now: Instant) {
        if let Some(seen) = self.entries.get_mut(&client) {
            seen.last_seen = now;
        }
    }

    /// Remove entries not refreshed within `max_age`. Returns the ids
    /// that were inferred as departed.
    pub fn prune_stale(&mut self, max_age: Duration, now: Instant) -> Vec<ConnectionId> {
        let mut removed = Vec::new();
        self.entries.retain(|client, seen| {
            if now.duration_since(seen.last_seen) >= max_age {
                removed.push(*client);
                false
            } else {
                true
            }
        });
        if !removed.is_empty() {
            self.publish();
        }
        removed
    }

    /// Current entries, sorted by connection id.
    pub fn snapshot(&self) -> Vec<PresenceEntry> {
        let mut entries: Vec<PresenceEntry> =
            self.entries.values().map(|seen| seen.entry.clone()).collect();
        entries.sort_by_key(|entry| entry.connection_id);
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, client: ConnectionId) -> bool {
        self.entries.contains_key(&client)
    }

    /// Watch receiver yielding a fresh sorted snapshot on every change.
    pub fn watch(&self) -> watch::Receiver<Vec<PresenceEntry>> {
        self.snapshot_tx.subscribe()
    }

    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            self.entries.clear();
            self.publish();
        }
    }

    fn publish(&self) {
        let _ = self.snapshot_tx.send(self.snapshot());
    }
}

impl Default for PresenceTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use noteroom_common::types::UserInfo;

    fn entry(id: u64, name: &str) -> PresenceEntry {
        PresenceEntry::new(
            ConnectionId(id),
            UserInfo { name: name.into(), color: "#30bced".into() },
        )
    }

    #[tokio::test]
    async fn hub_delivers_to_other_peers_but_not_sender() {
        let hub = ChannelHub::new();
        let a = ConnectionId(1);
        let b = ConnectionId(2);
        let mut sub_a = hub.subscribe("room:demo", a);
        let mut sub_b = hub.subscribe("room:demo", b);

        sub_a.publisher().publish(ChannelMessage::doc_update(a, b"payload"));

        let received = sub_b.recv().await.expect("peer b should receive");
        assert_eq!(received.sender(), a);

        // Sender's own receiver must never yield its own message: publish
        // from b and confirm a only sees that one.
        sub_b.publisher().publish(ChannelMessage::doc_update(b, b"other"));
        let received = sub_a.recv().await.expect("peer a should receive");
        assert_eq!(received.sender(), b);
    }

    #[tokio::test]
    async fn lagged_receiver_drops_and_continues() {
        let hub = ChannelHub::new();
        let a = ConnectionId(1);
        let b = ConnectionId(2);
        let sub_a = hub.subscribe("room:lag", a);
        let mut sub_b = hub.subscribe("room:lag", b);

        let publisher = sub_a.publisher();
        for i in 0..(TOPIC_CAPACITY + 50) {
            publisher.publish(ChannelMessage::doc_update(a, &i.to_le_bytes()));
        }

        // The receiver lost the oldest messages but still makes progress.
        let received = sub_b.recv().await.expect("receiver should survive lag");
        assert_eq!(received.sender(), a);
    }

    #[test]
    fn abandoned_topics_are_swept() {
        let hub = ChannelHub::new();
        let sub = hub.subscribe("room:ephemeral", ConnectionId(1));
        let publisher = sub.publisher();
        assert_eq!(hub.topic_count(), 1);

        // The last subscriber leaves; a lingering publisher handle does
        // not keep the topic alive.
        drop(sub);
        let _live = hub.subscribe("room:other", ConnectionId(2));
        assert_eq!(hub.topic_count(), 1);

        // Publishing into the swept topic is a harmless no-op.
        publisher.publish(ChannelMessage::doc_update(ConnectionId(1), b"late"));

        // Re-subscribing recreates the topic from scratch.
        let _back = hub.subscribe("room:ephemeral", ConnectionId(3));
        assert_eq!(hub.topic_count(), 2);
    }

    #[test]
    fn presence_apply_and_snapshot_sorted() {
        let mut table = PresenceTable::new();
        let now = Instant::now();

        assert!(table.apply(ConnectionId(9), Some(entry(9, "Nine")), now));
        assert!(table.apply(ConnectionId(3), Some(entry(3, "Three")), now));

        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].connection_id, ConnectionId(3));
        assert_eq!(snapshot[1].connection_id, ConnectionId(9));
    }

    #[test]
    fn presence_removal_and_identical_update() {
        let mut table = PresenceTable::new();
        let now = Instant::now();

        table.apply(ConnectionId(1), Some(entry(1, "Ada")), now);
        // Re-applying the identical entry is not a change.
        assert!(!table.apply(ConnectionId(1), Some(entry(1, "Ada")), now));
        // Removal of a present entry is.
        assert!(table.apply(ConnectionId(1), None, now));
        assert!(!table.apply(ConnectionId(1), None, now));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn stale_entries_are_pruned_with_injected_clock() {
        let mut table = PresenceTable::new();
        let start = Instant::now();
        let max_age = Duration::from_secs(30);

        table.apply(ConnectionId(1), Some(entry(1, "Ada")), start);
        table.apply(ConnectionId(2), Some(entry(2, "Grace")), start);

        // Only connection 2 keeps refreshing.
        table.touch(ConnectionId(2), start + Duration::from_secs(20));

        let removed = table.prune_stale(max_age, start + Duration::from_secs(35));
        assert_eq!(removed, vec![ConnectionId(1)]);
        assert!(table.contains(ConnectionId(2)));
    }

    #[test]
    fn watch_observes_changes() {
        let mut table = PresenceTable::new();
        let rx = table.watch();
        table.apply(ConnectionId(4), Some(entry(4, "Joan")), Instant::now());
        assert_eq!(rx.borrow().len(), 1);
    }
}
