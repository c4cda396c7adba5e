// Remote persistence: debounced autosave, snapshot policy, and the RPC
// seam to the backend store.
//
// Two invariants keep concurrent editors from corrupting each other:
// remote state is merged into the local document exactly once per
// session (at load), and the save path only ever pushes the local state
// out. A save that first fetched and re-merged the remote copy would
// duplicate content every time two peers saved in turn.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use noteroom_common::error::RpcError;
use noteroom_common::types::{
    RemoteDocument, RoomId, SaveRequest, SnapshotDirective, VersionInfo,
};

use crate::config::EngineConfig;
use crate::doc::RoomDoc;

/// Characters of body text sent along with each save for listings.
const PREVIEW_CHARS: usize = 280;

/// Backend store RPC surface. Implementations talk to whatever the
/// deployment persists into; tests script one in memory.
pub trait DocumentRpc: Send + Sync + 'static {
    /// Fetch the persisted document for a room, `None` when the room has
    /// never been saved.
    fn load(
        &self,
        room: &RoomId,
    ) -> impl Future<Output = Result<Option<RemoteDocument>, RpcError>> + Send;

    /// Upsert the current document state.
    fn save(&self, request: SaveRequest) -> impl Future<Output = Result<(), RpcError>> + Send;

    /// List retained version snapshots, newest first.
    fn list_versions(
        &self,
        room: &RoomId,
    ) -> impl Future<Output = Result<Vec<VersionInfo>, RpcError>> + Send;

    /// Fetch the full state blob of one retained version.
    fn fetch_version(
        &self,
        room: &RoomId,
        version: i64,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, RpcError>> + Send;

    /// Ask the backend whether a save is currently allowed.
    fn check_rate_limit(
        &self,
        room: &RoomId,
    ) -> impl Future<Output = Result<bool, RpcError>> + Send;
}

/// Observable outcome of the most recent save attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveStatus {
    Idle,
    Saving,
    Saved { at: chrono::DateTime<Utc> },
    Error { message: String },
}

// ── Debounce scheduler ──────────────────────────────────────────────

/// Trailing-edge debounce over an injected clock: every edit pushes the
/// deadline out by the quiet period, and the save fires once the
/// deadline passes with no further edits.
#[derive(Debug)]
pub struct SaveScheduler {
    quiet: Duration,
    deadline: Option<Instant>,
}

impl SaveScheduler {
    pub fn new(quiet: Duration) -> Self {
        Self { quiet, deadline: None }
    }

    /// Record an edit at `now`, rescheduling the pending save.
    pub fn mark_dirty_at(&mut self, now: Instant) {
        self.deadline = Some(now + self.quiet);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_dirty(&self) -> bool {
        self.deadline.is_some()
    }

    /// Consume the pending save if its quiet period has elapsed.
    pub fn take_ready_at(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

// ── Snapshot policy ─────────────────────────────────────────────────

/// Decides which saves are also retained as append-only version
/// snapshots: every Nth save, or when the interval has elapsed since the
/// last snapshot, whichever comes first. The first save of a session is
/// always retained as a baseline.
#[derive(Debug)]
pub struct SnapshotPolicy {
    every_n_saves: u32,
    interval: Duration,
    saves_since_snapshot: u32,
    last_snapshot: Option<Instant>,
}

impl SnapshotPolicy {
    pub fn new(every_n_saves: u32, interval: Duration) -> Self {
        Self { every_n_saves, interval, saves_since_snapshot: 0, last_snapshot: None }
    }

    /// Whether a save performed at `now` should snapshot.
    pub fn due_at(&self, now: Instant) -> bool {
        let Some(last) = self.last_snapshot else {
            return true;
        };
        if self.every_n_saves > 0 && self.saves_since_snapshot + 1 >= self.every_n_saves {
            return true;
        }
        now.duration_since(last) >= self.interval
    }

    /// Record a completed save and whether it snapshotted.
    pub fn record_save_at(&mut self, now: Instant, snapshotted: bool) {
        if snapshotted {
            self.saves_since_snapshot = 0;
            self.last_snapshot = Some(now);
        } else {
            self.saves_since_snapshot += 1;
        }
    }
}

// ── Persistence engine ──────────────────────────────────────────────

struct AutosaveTask {
    handle: JoinHandle<()>,
}

/// Persistence for one room document over a [`DocumentRpc`] backend.
pub struct RemotePersistence<R: DocumentRpc> {
    rpc: Arc<R>,
    room: RoomId,
    doc: Arc<RoomDoc>,
    loaded: AtomicBool,
    status_tx: watch::Sender<SaveStatus>,
    policy: Mutex<SnapshotPolicy>,
    title: Mutex<String>,
    editor: Mutex<String>,
    snapshot_every_n_saves: u32,
    snapshot_every_seconds: u64,
    debounce: Duration,
    autosave: Mutex<Option<AutosaveTask>>,
}

impl<R: DocumentRpc> RemotePersistence<R> {
    pub fn new(rpc: Arc<R>, room: RoomId, doc: Arc<RoomDoc>, config: &EngineConfig) -> Self {
        let (status_tx, _) = watch::channel(SaveStatus::Idle);
        Self {
            rpc,
            room,
            doc,
            loaded: AtomicBool::new(false),
            status_tx,
            policy: Mutex::new(SnapshotPolicy::new(
                config.snapshot_every_n_saves,
                config.snapshot_interval(),
            )),
            title: Mutex::new(String::new()),
            editor: Mutex::new("anonymous".to_string()),
            snapshot_every_n_saves: config.snapshot_every_n_saves,
            snapshot_every_seconds: config.snapshot_every_seconds,
            debounce: config.save_debounce(),
            autosave: Mutex::new(None),
        }
    }

    pub fn set_title(&self, title: impl Into<String>) {
        *self.title.lock().expect("title lock poisoned") = title.into();
    }

    pub fn set_editor(&self, editor: impl Into<String>) {
        *self.editor.lock().expect("editor lock poisoned") = editor.into();
    }

    /// Watch receiver for save status transitions.
    pub fn status_watch(&self) -> watch::Receiver<SaveStatus> {
        self.status_tx.subscribe()
    }

    pub fn status(&self) -> SaveStatus {
        self.status_tx.borrow().clone()
    }

    fn set_status(&self, status: SaveStatus) {
        let _ = self.status_tx.send(status);
    }

    /// Merge the persisted remote state into the local document. Runs at
    /// most once per session; all later calls are no-ops. Returns true
    /// when remote content was actually merged. An absent, empty, or
    /// undecodable remote document leaves the local state untouched.
    pub async fn load_from_database(&self) -> bool {
        if self.loaded.swap(true, Ordering::SeqCst) {
            debug!(room = %self.room, "remote load already performed this session");
            return false;
        }
        match self.rpc.load(&self.room).await {
            Ok(Some(remote)) if !remote.state.is_empty() => {
                match self.doc.merge_update(&remote.state) {
                    Ok(()) => {
                        info!(room = %self.room, updated_at = %remote.updated_at,
                            "merged remote document state");
                        true
                    }
                    Err(error) => {
                        warn!(room = %self.room, %error,
                            "remote state undecodable, keeping local state");
                        false
                    }
                }
            }
            Ok(_) => {
                debug!(room = %self.room, "no remote document yet");
                false
            }
            Err(error) => {
                warn!(room = %self.room, %error,
                    "remote load failed, continuing with local state");
                false
            }
        }
    }

    /// Treat the remote load as already done. Used when the document was
    /// seeded from a fetched blob and must not be merged with the live
    /// remote copy on top.
    pub fn mark_loaded(&self) {
        self.loaded.store(true, Ordering::SeqCst);
    }

    /// Push the current local state to the backend. Never fetches or
    /// merges. Failures surface as a status transition, not an error.
    pub async fn save_now(&self) -> SaveStatus {
        match self.rpc.check_rate_limit(&self.room).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(room = %self.room, "save skipped, rate limited by backend");
                let status = SaveStatus::Error { message: "rate limited".to_string() };
                self.set_status(status.clone());
                return status;
            }
            // Fail open: an unreachable rate limiter must not block saves.
            Err(error) => {
                warn!(room = %self.room, %error, "rate-limit check failed, proceeding");
            }
        }

        self.set_status(SaveStatus::Saving);
        let now = Instant::now();
        let due = self.policy.lock().expect("snapshot policy lock poisoned").due_at(now);
        let request = SaveRequest {
            room: self.room.clone(),
            title: self.title.lock().expect("title lock poisoned").clone(),
            state: self.doc.encode_state(),
            text_preview: self.doc.text_preview(PREVIEW_CHARS),
            editor: self.editor.lock().expect("editor lock poisoned").clone(),
            snapshot: SnapshotDirective {
                every_n_saves: self.snapshot_every_n_saves,
                every_seconds: self.snapshot_every_seconds,
                due,
            },
        };

        let status = match self.rpc.save(request).await {
            Ok(()) => {
                self.policy
                    .lock()
                    .expect("snapshot policy lock poisoned")
                    .record_save_at(now, due);
                debug!(room = %self.room, snapshot = due, "document saved");
                SaveStatus::Saved { at: Utc::now() }
            }
            Err(error) => {
                warn!(room = %self.room, %error, "save failed");
                SaveStatus::Error { message: error.to_string() }
            }
        };
        self.set_status(status.clone());
        status
    }

    /// Start the debounced autosave loop: every document mutation pushes
    /// the deadline out, and a save fires after the quiet period.
    pub fn enable_auto_save(self: &Arc<Self>) -> Result<()> {
        let mut guard = self.autosave.lock().expect("autosave lock poisoned");
        if guard.is_some() {
            return Ok(());
        }
        let (mut updates, subscription) = self.doc.subscribe_updates()?;
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            // The update stream stops when the subscription drops.
            let _keepalive = subscription;
            let mut scheduler = SaveScheduler::new(this.debounce);
            loop {
                match scheduler.deadline() {
                    Some(deadline) => {
                        tokio::select! {
                            update = updates.recv() => match update {
                                Some(_) => scheduler.mark_dirty_at(Instant::now()),
                                None => break,
                            },
                            _ = time::sleep_until(time::Instant::from_std(deadline)) => {
                                if scheduler.take_ready_at(Instant::now()) {
                                    this.save_now().await;
                                }
                            }
                        }
                    }
                    None => match updates.recv().await {
                        Some(_) => scheduler.mark_dirty_at(Instant::now()),
                        None => break,
                    },
                }
            }
        });
        *guard = Some(AutosaveTask { handle });
        Ok(())
    }

    /// Stop the autosave loop. Pending unsaved edits are flushed by the
    /// caller's final explicit `save_now`.
    pub fn disable_auto_save(&self) {
        if let Some(task) = self.autosave.lock().expect("autosave lock poisoned").take() {
            task.handle.abort();
        }
    }

    pub async fn list_versions(&self) -> Result<Vec<VersionInfo>, RpcError> {
        self.rpc.list_versions(&self.room).await
    }

    pub async fn fetch_version(&self, version: i64) -> Result<Option<Vec<u8>>, RpcError> {
        self.rpc.fetch_version(&self.room, version).await
    }
}

impl<R: DocumentRpc> Drop for RemotePersistence<R> {
    fn drop(&mut self) {
        self.disable_auto_save();
    }
}

// ── In-memory backend ───────────────────────────────────────────────

struct StoredRoom {
    document: RemoteDocument,
    versions: Vec<(VersionInfo, Vec<u8>)>,
    next_version: i64,
}

/// Reference backend keeping everything in process memory, with version
/// retention driven by the snapshot directive on each save. Used by the
/// test suites and local demos; deployments implement [`DocumentRpc`]
/// against their own store.
#[derive(Default)]
pub struct InMemoryStore {
    rooms: Mutex<HashMap<RoomId, StoredRoom>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw persisted state for a room, if any.
    pub fn stored_state(&self, room: &RoomId) -> Option<Vec<u8>> {
        self.rooms
            .lock()
            .expect("store lock poisoned")
            .get(room)
            .map(|stored| stored.document.state.clone())
    }
}

impl DocumentRpc for InMemoryStore {
    async fn load(&self, room: &RoomId) -> Result<Option<RemoteDocument>, RpcError> {
        Ok(self
            .rooms
            .lock()
            .expect("store lock poisoned")
            .get(room)
            .map(|stored| stored.document.clone()))
    }

    async fn save(&self, request: SaveRequest) -> Result<(), RpcError> {
        let mut rooms = self.rooms.lock().expect("store lock poisoned");
        let stored = rooms.entry(request.room.clone()).or_insert_with(|| StoredRoom {
            document: RemoteDocument { state: Vec::new(), updated_at: Utc::now() },
            versions: Vec::new(),
            next_version: 1,
        });
        stored.document = RemoteDocument { state: request.state.clone(), updated_at: Utc::now() };
        if request.snapshot.due {
            let version = stored.next_version;
            stored.next_version += 1;
            stored.versions.push((
                VersionInfo { version, created_at: Utc::now(), edited_by: request.editor },
                request.state,
            ));
        }
        Ok(())
    }

    async fn list_versions(&self, room: &RoomId) -> Result<Vec<VersionInfo>, RpcError> {
        Ok(self
            .rooms
            .lock()
            .expect("store lock poisoned")
            .get(room)
            .map(|stored| stored.versions.iter().rev().map(|(info, _)| info.clone()).collect())
            .unwrap_or_default())
    }

    async fn fetch_version(
        &self,
        room: &RoomId,
        version: i64,
    ) -> Result<Option<Vec<u8>>, RpcError> {
        Ok(self.rooms.lock().expect("store lock poisoned").get(room).and_then(|stored| {
            stored
                .versions
                .iter()
                .find(|(info, _)| info.version == version)
                .map(|(_, state)| state.clone())
        }))
    }

    async fn check_rate_limit(&self, _room: &RoomId) -> Result<bool, RpcError> {
        Ok(true)
    }
}
