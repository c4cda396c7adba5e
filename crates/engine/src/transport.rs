// Sync transport: wires one room document to a broadcast topic.
//
// Fire-and-forget rebroadcast of local updates, plus a pull-based
// reconciliation pass on join: the newcomer broadcasts its state vector
// and every peer answers with exactly the missing changes. Dropped
// messages are therefore recovered the next time any peer runs the
// request/response cycle.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use noteroom_common::protocol::{decode_payload, ChannelMessage};
use noteroom_common::types::{ConnectionId, PresenceEntry, RoomId, UserInfo};

use crate::channel::{ChannelHub, ChannelPublisher, ChannelSubscription, PresenceTable};
use crate::doc::RoomDoc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// A live connection of one room document to its broadcast topic.
///
/// The presence table holds *other* peers only; the local entry never
/// loops back through the channel. Use [`own_presence`](Self::own_presence)
/// or [`roster`](Self::roster) when the local peer should be included.
pub struct SyncTransport {
    local: ConnectionId,
    room: RoomId,
    doc: Arc<RoomDoc>,
    publisher: ChannelPublisher,
    presence: Arc<Mutex<PresenceTable>>,
    own_entry: Arc<Mutex<PresenceEntry>>,
    status_tx: watch::Sender<ConnectionStatus>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncTransport {
    /// Topic name carrying all traffic for a room.
    pub fn topic(room: &RoomId) -> String {
        format!("room:{room}")
    }

    /// Subscribe to the room topic, start the receive and rebroadcast
    /// loops, and kick off reconciliation. Must run inside a Tokio
    /// runtime.
    pub fn connect(
        hub: &ChannelHub,
        room: RoomId,
        doc: Arc<RoomDoc>,
        user: UserInfo,
        presence_stale: Duration,
    ) -> Result<Self> {
        Self::connect_inner(hub, room, doc, user, presence_stale, true)
    }

    /// Join without requesting missed history: the local document is
    /// authoritative and must not absorb the room's prior state. Used
    /// when a session is rebuilt around a restored version.
    pub fn connect_authoritative(
        hub: &ChannelHub,
        room: RoomId,
        doc: Arc<RoomDoc>,
        user: UserInfo,
        presence_stale: Duration,
    ) -> Result<Self> {
        Self::connect_inner(hub, room, doc, user, presence_stale, false)
    }

    fn connect_inner(
        hub: &ChannelHub,
        room: RoomId,
        doc: Arc<RoomDoc>,
        user: UserInfo,
        presence_stale: Duration,
        request_sync: bool,
    ) -> Result<Self> {
        let local = ConnectionId::random();
        let (status_tx, _) = watch::channel(ConnectionStatus::Connecting);

        let subscription = hub.subscribe(&Self::topic(&room), local);
        let publisher = subscription.publisher();
        let presence = Arc::new(Mutex::new(PresenceTable::new()));
        let own_entry = Arc::new(Mutex::new(PresenceEntry::new(local, user)));

        let transport = Self {
            local,
            room: room.clone(),
            doc: Arc::clone(&doc),
            publisher: publisher.clone(),
            presence: Arc::clone(&presence),
            own_entry: Arc::clone(&own_entry),
            status_tx,
            tasks: Mutex::new(Vec::new()),
        };

        transport.spawn_recv_loop(subscription);
        transport.spawn_rebroadcast_loop()?;
        transport.spawn_presence_janitor(presence_stale);
        transport.spawn_heartbeat(presence_stale);

        // Reconciliation: ask the room for everything we are missing,
        // then introduce ourselves.
        if request_sync {
            publisher.publish(ChannelMessage::sync_request(local, &doc.state_vector()));
        }
        transport.announce();

        let _ = transport.status_tx.send(ConnectionStatus::Connected);
        info!(room = %room, connection = %local, "joined room topic");
        Ok(transport)
    }

    fn spawn_recv_loop(&self, mut subscription: ChannelSubscription) {
        let local = self.local;
        let doc = Arc::clone(&self.doc);
        let publisher = self.publisher.clone();
        let presence = Arc::clone(&self.presence);
        let own_entry = Arc::clone(&self.own_entry);
        let status_tx = self.status_tx.clone();
        let handle = tokio::spawn(async move {
            while let Some(message) = subscription.recv().await {
                handle_message(message, local, &doc, &publisher, &presence, &own_entry);
            }
            // The topic itself is gone; there is no recovering this
            // subscription. Reconnection is the caller's decision.
            warn!(connection = %local, "room topic closed under the transport");
            let _ = status_tx.send(ConnectionStatus::Disconnected);
        });
        self.tasks.lock().expect("transport tasks lock poisoned").push(handle);
    }

    fn spawn_rebroadcast_loop(&self) -> Result<()> {
        let (mut updates, doc_subscription) = self.doc.subscribe_local_updates()?;
        let local = self.local;
        let publisher = self.publisher.clone();
        let handle = tokio::spawn(async move {
            let _keepalive = doc_subscription;
            while let Some(update) = updates.recv().await {
                publisher.publish(ChannelMessage::doc_update(local, &update));
            }
        });
        self.tasks.lock().expect("transport tasks lock poisoned").push(handle);
        Ok(())
    }

    fn spawn_presence_janitor(&self, stale: Duration) {
        let presence = Arc::clone(&self.presence);
        let stale = stale.max(Duration::from_secs(1));
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(stale / 2);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = presence
                    .lock()
                    .expect("presence lock poisoned")
                    .prune_stale(stale, Instant::now());
                if !removed.is_empty() {
                    debug!(?removed, "inferred departure of silent peers");
                }
            }
        });
        self.tasks.lock().expect("transport tasks lock poisoned").push(handle);
    }

    /// Re-announce the local entry well inside the staleness window so
    /// an idle peer is never inferred as departed. Liveness comes from
    /// this heartbeat, not from edit traffic.
    fn spawn_heartbeat(&self, stale: Duration) {
        let local = self.local;
        let publisher = self.publisher.clone();
        let own_entry = Arc::clone(&self.own_entry);
        let period = (stale / 3).max(Duration::from_millis(100));
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let entry = own_entry.lock().expect("own entry lock poisoned").clone();
                publisher
                    .publish(ChannelMessage::Awareness { client: local, entry: Some(entry) });
            }
        });
        self.tasks.lock().expect("transport tasks lock poisoned").push(handle);
    }

    pub fn local(&self) -> ConnectionId {
        self.local
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub fn connected(&self) -> bool {
        *self.status_tx.borrow() == ConnectionStatus::Connected
    }

    /// Presence entries of the other peers, sorted by connection id.
    pub fn presence_snapshot(&self) -> Vec<PresenceEntry> {
        self.presence.lock().expect("presence lock poisoned").snapshot()
    }

    /// Number of other peers currently present.
    pub fn peer_count(&self) -> usize {
        self.presence.lock().expect("presence lock poisoned").len()
    }

    /// Watch receiver yielding the sorted peer snapshot on every change.
    pub fn presence_watch(&self) -> watch::Receiver<Vec<PresenceEntry>> {
        self.presence.lock().expect("presence lock poisoned").watch()
    }

    pub fn own_presence(&self) -> PresenceEntry {
        self.own_entry.lock().expect("own entry lock poisoned").clone()
    }

    /// Everyone in the room, local peer included, sorted by connection id.
    pub fn roster(&self) -> Vec<PresenceEntry> {
        let mut entries = self.presence_snapshot();
        entries.push(self.own_presence());
        entries.sort_by_key(|entry| entry.connection_id);
        entries
    }

    /// Mutate the local presence entry and broadcast the new version.
    pub fn update_presence(&self, mutate: impl FnOnce(&mut PresenceEntry)) {
        let entry = {
            let mut own = self.own_entry.lock().expect("own entry lock poisoned");
            mutate(&mut own);
            own.clone()
        };
        self.publisher.publish(ChannelMessage::Awareness { client: self.local, entry: Some(entry) });
    }

    /// Broadcast the current local presence entry.
    pub fn announce(&self) {
        let entry = self.own_presence();
        self.publisher.publish(ChannelMessage::Awareness { client: self.local, entry: Some(entry) });
    }

    /// Stop the loops without leaving the room: no removal is broadcast,
    /// so other peers keep showing this connection until it goes stale.
    /// Models an abrupt network loss.
    pub fn disconnect(&self) {
        self.stop_tasks();
        let _ = self.status_tx.send(ConnectionStatus::Disconnected);
        debug!(room = %self.room, connection = %self.local, "transport disconnected");
    }

    /// Graceful teardown: broadcast a presence removal first, then stop
    /// the loops.
    pub fn destroy(&self) {
        self.publisher.publish(ChannelMessage::Awareness { client: self.local, entry: None });
        self.stop_tasks();
        self.presence.lock().expect("presence lock poisoned").clear();
        let _ = self.status_tx.send(ConnectionStatus::Disconnected);
        info!(room = %self.room, connection = %self.local, "left room topic");
    }

    fn stop_tasks(&self) {
        for task in self.tasks.lock().expect("transport tasks lock poisoned").drain(..) {
            task.abort();
        }
    }
}

impl Drop for SyncTransport {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

/// Dispatch one incoming channel message. Malformed payloads are logged
/// and dropped; the periodic reconciliation cycle repairs any gap they
/// leave.
fn handle_message(
    message: ChannelMessage,
    local: ConnectionId,
    doc: &Arc<RoomDoc>,
    publisher: &ChannelPublisher,
    presence: &Arc<Mutex<PresenceTable>>,
    own_entry: &Arc<Mutex<PresenceEntry>>,
) {
    match message {
        ChannelMessage::DocUpdate { client, payload_b64 } => {
            presence.lock().expect("presence lock poisoned").touch(client, Instant::now());
            let payload = match decode_payload(&payload_b64) {
                Ok(payload) => payload,
                Err(error) => {
                    warn!(from = %client, %error, "dropping doc update with bad payload");
                    return;
                }
            };
            if let Err(error) = doc.merge_remote_update(&payload) {
                warn!(from = %client, %error, "dropping undecodable doc update");
            }
        }

        ChannelMessage::SyncRequest { client, state_vector_b64 } => {
            presence.lock().expect("presence lock poisoned").touch(client, Instant::now());
            // An unusable state vector degrades to a full-state reply.
            let update = match decode_payload(&state_vector_b64)
                .map_err(anyhow::Error::from)
                .and_then(|sv| doc.diff_since(&sv))
            {
                Ok(diff) => diff,
                Err(error) => {
                    warn!(from = %client, %error, "bad state vector, replying with full state");
                    doc.encode_state()
                }
            };
            publisher.publish(ChannelMessage::sync_response(local, client, &update));
            // The requester is new to the topic: re-introduce ourselves
            // so its presence table fills without waiting for the next
            // presence change.
            let entry = own_entry.lock().expect("own entry lock poisoned").clone();
            publisher.publish(ChannelMessage::Awareness { client: local, entry: Some(entry) });
        }

        ChannelMessage::SyncResponse { client, target, update_b64 } => {
            presence.lock().expect("presence lock poisoned").touch(client, Instant::now());
            if target != local {
                return;
            }
            match decode_payload(&update_b64) {
                Ok(update) => {
                    if let Err(error) = doc.merge_remote_update(&update) {
                        warn!(from = %client, %error, "dropping undecodable sync response");
                    }
                }
                Err(error) => {
                    warn!(from = %client, %error, "dropping sync response with bad payload");
                }
            }
        }

        ChannelMessage::Awareness { client, entry } => {
            presence.lock().expect("presence lock poisoned").apply(client, entry, Instant::now());
        }
    }
}
