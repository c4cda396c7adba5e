// End-to-end room sessions: several peers over one in-process channel
// hub, with the in-memory backend standing in for the remote store.

use std::sync::Arc;
use std::time::Duration;

use noteroom_common::types::{AttachmentMeta, RoomId, UserInfo};
use noteroom_engine::channel::ChannelHub;
use noteroom_engine::config::EngineConfig;
use noteroom_engine::doc::RoomDoc;
use noteroom_engine::election;
use noteroom_engine::manager::ConnectionManager;
use noteroom_engine::persist::InMemoryStore;
use noteroom_engine::transport::SyncTransport;
use tempfile::TempDir;
use tokio::time;
use uuid::Uuid;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn test_config(cache_dir: std::path::PathBuf) -> EngineConfig {
    EngineConfig {
        cache_dir,
        presence_settle_ms: 30,
        save_debounce_ms: 50,
        teardown_grace_ms: 40,
        ..EngineConfig::default()
    }
}

/// A manager with its own cache directory, kept alive by the returned
/// tempdir.
fn new_manager(
    hub: &Arc<ChannelHub>,
    rpc: &Arc<InMemoryStore>,
) -> (Arc<ConnectionManager<InMemoryStore>>, TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = ConnectionManager::new(
        Arc::clone(hub),
        Arc::clone(rpc),
        test_config(dir.path().to_path_buf()),
    );
    (manager, dir)
}

async fn settle(mut condition: impl FnMut() -> bool) {
    time::timeout(Duration::from_secs(3), async {
        while !condition() {
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition should hold before the timeout");
}

fn raw_peer(hub: &Arc<ChannelHub>, room: &RoomId, name: &str) -> SyncTransport {
    SyncTransport::connect(
        hub,
        room.clone(),
        Arc::new(RoomDoc::new()),
        UserInfo { name: name.into(), color: "#ee6352".into() },
        Duration::from_secs(30),
    )
    .expect("transport connect")
}

#[tokio::test]
async fn three_peers_converge_on_shared_edits() {
    init_tracing();
    let hub = ChannelHub::new();
    let rpc = Arc::new(InMemoryStore::new());
    let room = RoomId::new("convergence");

    let (a, _dir_a) = new_manager(&hub, &rpc);
    let (b, _dir_b) = new_manager(&hub, &rpc);
    let (c, _dir_c) = new_manager(&hub, &rpc);
    a.connect(&room, "Ada").await.unwrap();
    b.connect(&room, "Grace").await.unwrap();
    c.connect(&room, "Joan").await.unwrap();

    let doc_a = a.doc().await.unwrap();
    let doc_b = b.doc().await.unwrap();
    let doc_c = c.doc().await.unwrap();

    doc_a.insert_body(0, "alpha ");
    doc_b.insert_body(0, "beta ");
    doc_c.insert_body(0, "gamma ");

    settle(|| {
        let body = doc_a.body_string();
        body == doc_b.body_string()
            && body == doc_c.body_string()
            && body.contains("alpha ")
            && body.contains("beta ")
            && body.contains("gamma ")
    })
    .await;
}

#[tokio::test]
async fn late_joiner_receives_full_history() {
    init_tracing();
    let hub = ChannelHub::new();
    let rpc = Arc::new(InMemoryStore::new());
    let room = RoomId::new("late-join");

    let (early, _dir_a) = new_manager(&hub, &rpc);
    early.connect(&room, "Ada").await.unwrap();
    let doc_early = early.doc().await.unwrap();
    doc_early.insert_body(0, "history written alone");

    let (late, _dir_b) = new_manager(&hub, &rpc);
    late.connect(&room, "Grace").await.unwrap();
    let doc_late = late.doc().await.unwrap();

    settle(|| doc_late.body_string() == "history written alone").await;
}

#[tokio::test]
async fn roster_tracks_joins_and_graceful_leaves() {
    init_tracing();
    let hub = ChannelHub::new();
    let rpc = Arc::new(InMemoryStore::new());
    let room = RoomId::new("roster");

    let (a, _dir_a) = new_manager(&hub, &rpc);
    let (b, _dir_b) = new_manager(&hub, &rpc);
    a.connect(&room, "Ada").await.unwrap();
    b.connect(&room, "Grace").await.unwrap();

    let transport_a = a.transport().await.unwrap();
    settle(|| transport_a.roster().len() == 2).await;

    b.disconnect().await;
    settle(|| transport_a.roster().len() == 1).await;
}

#[tokio::test]
async fn exactly_one_leader_with_handoff_on_departure() {
    init_tracing();
    let hub = ChannelHub::new();
    let room = RoomId::new("leaders");

    let peers = vec![
        raw_peer(&hub, &room, "Ada"),
        raw_peer(&hub, &room, "Grace"),
        raw_peer(&hub, &room, "Joan"),
    ];
    settle(|| peers.iter().all(|peer| peer.peer_count() == 2)).await;

    let leaders: Vec<usize> = peers
        .iter()
        .enumerate()
        .filter(|(_, peer)| election::is_leader(peer.local(), &peer.roster()))
        .map(|(idx, _)| idx)
        .collect();
    assert_eq!(leaders.len(), 1, "exactly one peer must consider itself leader");

    peers[leaders[0]].destroy();
    let survivors: Vec<&SyncTransport> =
        peers.iter().enumerate().filter(|(idx, _)| *idx != leaders[0]).map(|(_, p)| p).collect();
    settle(|| survivors.iter().all(|peer| peer.peer_count() == 1)).await;

    let successors = survivors
        .iter()
        .filter(|peer| election::is_leader(peer.local(), &peer.roster()))
        .count();
    assert_eq!(successors, 1, "leadership must hand off to exactly one survivor");
}

#[tokio::test]
async fn full_room_turns_newcomer_away() {
    init_tracing();
    let hub = ChannelHub::new();
    let rpc = Arc::new(InMemoryStore::new());
    let room = RoomId::new("packed");

    let _first = raw_peer(&hub, &room, "First");
    let _second = raw_peer(&hub, &room, "Second");

    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path().to_path_buf());
    config.room_capacity = 2;
    let manager = ConnectionManager::new(Arc::clone(&hub), Arc::clone(&rpc), config);

    let error = manager.connect(&room, "Ada").await.unwrap_err();
    assert!(error.is_room_full());
    assert!(!manager.connected().await);
}

#[tokio::test]
async fn departed_owner_attachments_are_pruned() {
    init_tracing();
    let hub = ChannelHub::new();
    let rpc = Arc::new(InMemoryStore::new());
    let room = RoomId::new("cleanup");

    let (a, _dir_a) = new_manager(&hub, &rpc);
    let (b, _dir_b) = new_manager(&hub, &rpc);
    a.connect(&room, "Ada").await.unwrap();
    b.connect(&room, "Grace").await.unwrap();

    let doc_a = a.doc().await.unwrap();
    let doc_b = b.doc().await.unwrap();
    let owner = b.transport().await.unwrap().local();

    doc_b
        .push_json(
            &doc_b.attachments(),
            &AttachmentMeta {
                id: Uuid::new_v4(),
                name: "deck.apkg".into(),
                size_bytes: 2_048,
                owner,
            },
        )
        .unwrap();
    settle(|| doc_a.read_json_list::<AttachmentMeta>(&doc_a.attachments()).len() == 1).await;

    // The owner leaves; whoever remains as leader prunes the orphan.
    b.disconnect().await;
    settle(|| doc_a.read_json_list::<AttachmentMeta>(&doc_a.attachments()).is_empty()).await;
}
