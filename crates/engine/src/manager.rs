// Connection manager: the single owner of a room session.
//
// All connects funnel through one async mutex held for the entire
// attempt, so two surfaces racing to join produce one shared session
// instead of two transports. Disconnects are refcounted with a grace
// window: a quick navigate-away-and-back reuses the live session rather
// than tearing it down and rebuilding it.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use noteroom_common::error::EngineError;
use noteroom_common::types::{ConnectionId, PresenceEntry, RoomId, UserInfo, VersionInfo};

use crate::cache::LocalCache;
use crate::channel::ChannelHub;
use crate::config::EngineConfig;
use crate::doc::{RoomDoc, SharedStructure, StructureHandle};
use crate::election;
use crate::persist::{DocumentRpc, RemotePersistence, SaveStatus};
use crate::transport::SyncTransport;

/// Cursor colors, assigned on join avoiding those already in use.
const PALETTE: [&str; 8] = [
    "#30bced", "#6eeb83", "#ffbc42", "#ecd444", "#ee6352", "#9ac2c9", "#8acb88", "#1be7ff",
];

/// Shared view of the active session handed to each connect caller.
#[derive(Clone)]
pub struct RoomHandle {
    pub doc: Arc<RoomDoc>,
    pub transport: Arc<SyncTransport>,
    pub user: UserInfo,
}

impl fmt::Debug for RoomHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomHandle")
            .field("room", self.transport.room())
            .field("connection", &self.transport.local())
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

struct ActiveRoom<R: DocumentRpc> {
    room: RoomId,
    doc: Arc<RoomDoc>,
    transport: Arc<SyncTransport>,
    persistence: Arc<RemotePersistence<R>>,
    cache: Option<LocalCache>,
    user: UserInfo,
    refcount: usize,
    janitor: JoinHandle<()>,
}

struct ManagerInner<R: DocumentRpc> {
    active: Option<ActiveRoom<R>>,
    /// Bumped on every connect and last-disconnect; a pending grace
    /// teardown only proceeds if the generation it captured is still
    /// current.
    generation: u64,
}

/// Owns at most one active room session and hands out shared views of
/// its document, transport, and persistence.
pub struct ConnectionManager<R: DocumentRpc> {
    hub: Arc<ChannelHub>,
    rpc: Arc<R>,
    config: EngineConfig,
    inner: Mutex<ManagerInner<R>>,
    user_tx: watch::Sender<Option<UserInfo>>,
}

impl<R: DocumentRpc> ConnectionManager<R> {
    pub fn new(hub: Arc<ChannelHub>, rpc: Arc<R>, config: EngineConfig) -> Arc<Self> {
        let (user_tx, _) = watch::channel(None);
        Arc::new(Self {
            hub,
            rpc,
            config,
            inner: Mutex::new(ManagerInner { active: None, generation: 0 }),
            user_tx,
        })
    }

    /// Join a room. Concurrent callers are serialized: the first builds
    /// the session, the rest share it. Joining a different room tears
    /// the current session down first.
    pub async fn connect(
        &self,
        room: &RoomId,
        display_name: &str,
    ) -> Result<RoomHandle, EngineError> {
        let mut inner = self.inner.lock().await;
        inner.generation += 1;

        if let Some(active) = inner.active.as_mut() {
            if &active.room == room {
                active.refcount += 1;
                debug!(room = %room, refcount = active.refcount, "joined existing session");
                return Ok(handle_for(active));
            }
        }
        if let Some(previous) = inner.active.take() {
            info!(from = %previous.room, to = %room, "switching rooms");
            self.teardown_room(previous).await;
        }

        let active = self.build_room(room.clone(), display_name).await?;
        let _ = self.user_tx.send(Some(active.user.clone()));
        let handle = handle_for(&active);
        inner.active = Some(active);
        Ok(handle)
    }

    /// Release one reference to the session. When the last reference is
    /// gone, teardown runs after the grace window unless a reconnect
    /// lands in between.
    pub async fn disconnect(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        let Some(active) = inner.active.as_mut() else {
            return;
        };
        active.refcount = active.refcount.saturating_sub(1);
        if active.refcount > 0 {
            debug!(room = %active.room, refcount = active.refcount, "reference released");
            return;
        }

        inner.generation += 1;
        let generation = inner.generation;
        drop(inner);

        let this = Arc::clone(self);
        let grace = self.config.teardown_grace();
        tokio::spawn(async move {
            time::sleep(grace).await;
            let mut inner = this.inner.lock().await;
            if inner.generation != generation {
                debug!("teardown cancelled by a newer connect");
                return;
            }
            if let Some(active) = inner.active.take() {
                this.teardown_room(active).await;
                let _ = this.user_tx.send(None);
            }
        });
    }

    /// Replace the live document with a retained version snapshot. The
    /// snapshot overwrites the room record; it is never merged with the
    /// state it replaces.
    pub async fn restore_version(&self, version: i64) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        let active = inner.active.as_ref().ok_or(EngineError::NotConnected)?;

        let blob = active
            .persistence
            .fetch_version(version)
            .await?
            .ok_or_else(|| EngineError::VersionNotFound {
                room: active.room.to_string(),
                version,
            })?;
        let doc = Arc::new(RoomDoc::from_state(&blob)?);

        let Some(previous) = inner.active.take() else {
            return Err(EngineError::NotConnected);
        };
        let ActiveRoom {
            room,
            doc: _,
            transport: old_transport,
            persistence: old_persistence,
            cache,
            user,
            refcount,
            janitor: old_janitor,
        } = previous;
        info!(room = %room, version, "restoring version snapshot");

        old_persistence.disable_auto_save();
        old_janitor.abort();
        old_transport.destroy();

        // Overwrite the remote record before the rebuilt transport can
        // see any peer traffic. The transport then joins without a
        // reconciliation request: peers still holding the pre-restore
        // history must not feed it back into the restored document.
        let persistence = Arc::new(RemotePersistence::new(
            Arc::clone(&self.rpc),
            room.clone(),
            Arc::clone(&doc),
            &self.config,
        ));
        persistence.set_title(room.to_string());
        persistence.set_editor(&user.name);
        persistence.mark_loaded();
        persistence.save_now().await;

        let transport = Arc::new(SyncTransport::connect_authoritative(
            &self.hub,
            room.clone(),
            Arc::clone(&doc),
            user.clone(),
            self.config.presence_stale(),
        )?);
        persistence.enable_auto_save()?;
        let janitor = spawn_presence_janitor(Arc::clone(&doc), Arc::clone(&transport));

        if let Some(cache) = &cache {
            if let Err(error) = cache.store(&room, &doc.encode_state(), Utc::now()) {
                warn!(%error, "failed to cache restored state");
            }
        }

        let _ = self.user_tx.send(Some(user.clone()));
        inner.active =
            Some(ActiveRoom { room, doc, transport, persistence, cache, user, refcount, janitor });
        Ok(())
    }

    pub async fn list_versions(&self) -> Result<Vec<VersionInfo>, EngineError> {
        let inner = self.inner.lock().await;
        let active = inner.active.as_ref().ok_or(EngineError::NotConnected)?;
        Ok(active.persistence.list_versions().await?)
    }

    /// Push the current state to the backend immediately.
    pub async fn save_now(&self) -> Result<SaveStatus, EngineError> {
        let persistence = {
            let inner = self.inner.lock().await;
            let active = inner.active.as_ref().ok_or(EngineError::NotConnected)?;
            Arc::clone(&active.persistence)
        };
        Ok(persistence.save_now().await)
    }

    pub async fn connected(&self) -> bool {
        self.inner.lock().await.active.is_some()
    }

    pub async fn room_id(&self) -> Option<RoomId> {
        self.inner.lock().await.active.as_ref().map(|active| active.room.clone())
    }

    /// Shared handle to the live document, if connected.
    pub async fn doc(&self) -> Option<Arc<RoomDoc>> {
        self.inner.lock().await.active.as_ref().map(|active| Arc::clone(&active.doc))
    }

    /// Shared handle to the live transport, if connected.
    pub async fn transport(&self) -> Option<Arc<SyncTransport>> {
        self.inner.lock().await.active.as_ref().map(|active| Arc::clone(&active.transport))
    }

    /// Typed handle to a named substructure of the live document;
    /// `None` while no session is active.
    pub async fn structure(&self, structure: &SharedStructure) -> Option<StructureHandle> {
        self.inner.lock().await.active.as_ref().map(|active| active.doc.open(structure))
    }

    /// Everyone in the room including the local peer.
    pub async fn roster(&self) -> Vec<PresenceEntry> {
        match self.inner.lock().await.active.as_ref() {
            Some(active) => active.transport.roster(),
            None => Vec::new(),
        }
    }

    pub async fn save_status(&self) -> Option<watch::Receiver<SaveStatus>> {
        self.inner.lock().await.active.as_ref().map(|active| active.persistence.status_watch())
    }

    /// Watch the identity assigned to the local user; `None` while no
    /// session is active.
    pub fn user_watch(&self) -> watch::Receiver<Option<UserInfo>> {
        self.user_tx.subscribe()
    }

    async fn build_room(
        &self,
        room: RoomId,
        display_name: &str,
    ) -> Result<ActiveRoom<R>, EngineError> {
        let doc = Arc::new(RoomDoc::new());

        // Warm start from the local cache; every failure here degrades
        // to a cold start.
        let cache = match LocalCache::open(self.config.cache_dir.join("rooms.db")) {
            Ok(cache) => {
                if let Err(error) = cache.evict_stale(self.config.cache_staleness(), Utc::now()) {
                    warn!(%error, "local cache eviction failed");
                }
                match cache.load(&room) {
                    Ok(Some(state)) => {
                        if let Err(error) = doc.merge_update(&state) {
                            warn!(room = %room, %error, "cached state undecodable, ignoring");
                        }
                    }
                    Ok(None) => {}
                    Err(error) => warn!(room = %room, %error, "local cache read failed"),
                }
                Some(cache)
            }
            Err(error) => {
                warn!(%error, "local cache unavailable, continuing without it");
                None
            }
        };

        let user = UserInfo { name: display_name.to_string(), color: PALETTE[0].to_string() };
        let transport = Arc::new(SyncTransport::connect(
            &self.hub,
            room.clone(),
            Arc::clone(&doc),
            user,
            self.config.presence_stale(),
        )?);

        // Let presence from existing peers arrive before counting seats
        // or picking a color.
        time::sleep(self.config.presence_settle()).await;

        let peers = transport.presence_snapshot();
        if peers.len() >= self.config.room_capacity {
            transport.destroy();
            return Err(EngineError::RoomFull {
                room: room.to_string(),
                capacity: self.config.room_capacity,
            });
        }

        let color = pick_color(&peers, transport.local());
        transport.update_presence(|entry| entry.user.color = color.clone());
        let user = transport.own_presence().user;

        let persistence = Arc::new(RemotePersistence::new(
            Arc::clone(&self.rpc),
            room.clone(),
            Arc::clone(&doc),
            &self.config,
        ));
        persistence.set_title(room.to_string());
        persistence.set_editor(&user.name);
        persistence.load_from_database().await;
        persistence.enable_auto_save()?;

        let janitor = spawn_presence_janitor(Arc::clone(&doc), Arc::clone(&transport));

        Ok(ActiveRoom {
            room,
            doc,
            transport,
            persistence,
            cache,
            user,
            refcount: 1,
            janitor,
        })
    }

    async fn teardown_room(&self, active: ActiveRoom<R>) {
        info!(room = %active.room, "tearing down session");
        active.persistence.disable_auto_save();
        active.persistence.save_now().await;
        if let Some(cache) = &active.cache {
            if let Err(error) = cache.store(&active.room, &active.doc.encode_state(), Utc::now())
            {
                warn!(room = %active.room, %error, "failed to cache final state");
            }
        }
        active.janitor.abort();
        active.transport.destroy();
    }
}

fn handle_for<R: DocumentRpc>(active: &ActiveRoom<R>) -> RoomHandle {
    RoomHandle {
        doc: Arc::clone(&active.doc),
        transport: Arc::clone(&active.transport),
        user: active.user.clone(),
    }
}

/// Pick a palette color no present peer is using; when the palette is
/// exhausted, derive one from the connection id.
fn pick_color(peers: &[PresenceEntry], local: ConnectionId) -> String {
    let used: HashSet<&str> = peers.iter().map(|peer| peer.user.color.as_str()).collect();
    PALETTE
        .iter()
        .find(|color| !used.contains(**color))
        .copied()
        .unwrap_or(PALETTE[local.0 as usize % PALETTE.len()])
        .to_string()
}

/// Watch presence and, when peers depart and the local connection is the
/// leader, garbage-collect shared state they left behind.
fn spawn_presence_janitor(doc: Arc<RoomDoc>, transport: Arc<SyncTransport>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut presence = transport.presence_watch();
        let mut previous: HashSet<ConnectionId> =
            presence.borrow().iter().map(|entry| entry.connection_id).collect();
        while presence.changed().await.is_ok() {
            let snapshot = presence.borrow_and_update().clone();
            let current: HashSet<ConnectionId> =
                snapshot.iter().map(|entry| entry.connection_id).collect();
            let departed: Vec<ConnectionId> =
                previous.difference(&current).copied().collect();
            previous = current;
            if departed.is_empty() {
                continue;
            }
            if !election::is_leader(transport.local(), &snapshot) {
                continue;
            }
            debug!(?departed, "leader running cleanup for departed peers");
            election::run_presence_cleanup(&doc, &transport.roster());
        }
    })
}
