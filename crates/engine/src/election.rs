// Leader election and response deduplication.
//
// No election messages are exchanged: the leader is a pure function of
// the presence snapshot (lowest connection id wins), recomputed on every
// presence change, so all peers converge without consensus rounds. After
// a leader disconnects there is a short window where peers still assume
// the old leader; the dedup guard and idempotent claims absorb it.

use std::collections::HashSet;

use anyhow::Result;
use tracing::{debug, info};
use uuid::Uuid;

use noteroom_common::types::{AttachmentMeta, ConnectionId, PresenceEntry, SendRequest};

use crate::doc::RoomDoc;

/// Key of the single request slot inside the shared map.
const REQUEST_KEY: &str = "current";

/// The leader among the given peers, always including the local
/// connection even if its own presence entry has not propagated yet.
pub fn leader_id(local: ConnectionId, peers: &[PresenceEntry]) -> ConnectionId {
    peers.iter().map(|peer| peer.connection_id).fold(local, ConnectionId::min)
}

pub fn is_leader(local: ConnectionId, peers: &[PresenceEntry]) -> bool {
    leader_id(local, peers) == local
}

/// Per-connection guard against double-triggering a side effect for the
/// same event. Not replicated — every peer maintains its own.
#[derive(Debug, Default)]
pub struct RespondedSet {
    seen: HashSet<String>,
}

impl RespondedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check-then-mark in one step: returns true exactly once per event
    /// id. The id is recorded *before* the caller performs the action,
    /// so a second observer firing mid-action cannot re-enter.
    pub fn try_begin(&mut self, event_id: &str) -> bool {
        self.seen.insert(event_id.to_string())
    }

    pub fn has_responded(&self, event_id: &str) -> bool {
        self.seen.contains(event_id)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }
}

/// Combined gate for a shared side effect: only the leader acts, and
/// only once per event id on this connection.
#[derive(Debug)]
pub struct ResponseGuard {
    local: ConnectionId,
    responded: RespondedSet,
}

impl ResponseGuard {
    pub fn new(local: ConnectionId) -> Self {
        Self { local, responded: RespondedSet::new() }
    }

    /// True when this connection should perform the guarded action for
    /// `event_id` given the current presence snapshot. Non-leaders do
    /// not mark the event, so a later leadership change still lets them
    /// pick it up.
    pub fn should_respond(&mut self, event_id: &str, peers: &[PresenceEntry]) -> bool {
        if !is_leader(self.local, peers) {
            return false;
        }
        let first = self.responded.try_begin(event_id);
        if !first {
            debug!(event_id, "event already handled on this connection");
        }
        first
    }
}

// ── Send/response request slot ──────────────────────────────────────

/// Publish a request into the shared slot.
pub fn post_request(doc: &RoomDoc, request: &SendRequest) -> Result<()> {
    doc.put_json(&doc.send_request_slot(), REQUEST_KEY, request)
}

/// The currently pending request, if any.
pub fn pending_request(doc: &RoomDoc) -> Option<SendRequest> {
    doc.get_json(&doc.send_request_slot(), REQUEST_KEY)
}

/// Mark the pending request as handled by `by`. Returns false when no
/// unhandled request exists (someone else already claimed it).
pub fn claim_request(doc: &RoomDoc, by: ConnectionId) -> bool {
    let slot = doc.send_request_slot();
    match doc.get_json::<SendRequest>(&slot, REQUEST_KEY) {
        Some(mut request) if !request.is_handled() => {
            request.handled_by = Some(by);
            doc.put_json(&slot, REQUEST_KEY, &request).is_ok()
        }
        _ => false,
    }
}

/// Clear the request slot. Returns whether a request was present.
pub fn clear_request(doc: &RoomDoc) -> bool {
    doc.remove_key(&doc.send_request_slot(), REQUEST_KEY)
}

// ── Presence-removal garbage collection ─────────────────────────────

/// Clear a pending, unhandled request whose referenced attachments no
/// longer have a connected owner, so the requester is not left waiting
/// forever. Triggered by presence removal, not by a timeout.
pub fn clear_stale_request(doc: &RoomDoc, present: &[PresenceEntry]) -> bool {
    let Some(request) = pending_request(doc) else {
        return false;
    };
    if request.is_handled() || request.attachment_ids.is_empty() {
        return false;
    }

    let present_ids: HashSet<ConnectionId> =
        present.iter().map(|peer| peer.connection_id).collect();
    let attachments: Vec<AttachmentMeta> = doc.read_json_list(&doc.attachments());
    let referenced: HashSet<Uuid> = request.attachment_ids.iter().copied().collect();

    let handler_present = attachments
        .iter()
        .filter(|meta| referenced.contains(&meta.id))
        .any(|meta| present_ids.contains(&meta.owner));

    if handler_present {
        return false;
    }

    info!(request_id = %request.id, "clearing request with no eligible handler left");
    clear_request(doc)
}

/// Prune attachment entries whose owning connection is gone. Walks the
/// list in reverse index order so indices stay valid while deleting.
pub fn prune_orphaned_attachments(doc: &RoomDoc, present: &[PresenceEntry]) -> usize {
    let present_ids: HashSet<ConnectionId> =
        present.iter().map(|peer| peer.connection_id).collect();
    let list = doc.attachments();
    let raw = doc.raw_json_list(&list);

    let mut pruned = 0;
    for (index, raw_entry) in raw.iter().enumerate().rev() {
        let Ok(meta) = serde_json::from_str::<AttachmentMeta>(raw_entry) else {
            continue;
        };
        if !present_ids.contains(&meta.owner) {
            doc.remove_list_index(&list, index as u32);
            pruned += 1;
        }
    }
    if pruned > 0 {
        debug!(pruned, "pruned orphaned attachment entries");
    }
    pruned
}

/// Full cleanup pass run when presence entries are removed.
pub fn run_presence_cleanup(doc: &RoomDoc, present: &[PresenceEntry]) {
    clear_stale_request(doc, present);
    prune_orphaned_attachments(doc, present);
}

#[cfg(test)]
mod tests {
    use super::*;
    use noteroom_common::types::UserInfo;

    fn peer(id: u64) -> PresenceEntry {
        PresenceEntry::new(
            ConnectionId(id),
            UserInfo { name: format!("peer-{id}"), color: "#ffbc42".into() },
        )
    }

    fn attachment(id: Uuid, owner: u64) -> AttachmentMeta {
        AttachmentMeta {
            id,
            name: "deck.apkg".into(),
            size_bytes: 1_024,
            owner: ConnectionId(owner),
        }
    }

    // ── Leader determinism ──────────────────────────────────────────

    #[test]
    fn leader_is_minimum_connection_id() {
        let peers = vec![peer(30), peer(12), peer(99)];
        assert_eq!(leader_id(ConnectionId(50), &peers), ConnectionId(12));
        assert!(!is_leader(ConnectionId(50), &peers));
        assert!(is_leader(ConnectionId(5), &peers));
    }

    #[test]
    fn local_connection_counts_even_before_it_propagates() {
        // Own presence entry not yet in the table.
        assert_eq!(leader_id(ConnectionId(3), &[]), ConnectionId(3));
        assert!(is_leader(ConnectionId(3), &[]));
    }

    #[test]
    fn removing_the_leader_promotes_next_lowest() {
        let mut peers = vec![peer(10), peer(20), peer(30)];
        assert_eq!(leader_id(ConnectionId(40), &peers), ConnectionId(10));
        peers.remove(0);
        assert_eq!(leader_id(ConnectionId(40), &peers), ConnectionId(20));
    }

    // ── Dedup guard ─────────────────────────────────────────────────

    #[test]
    fn responded_set_fires_exactly_once() {
        let mut set = RespondedSet::new();
        assert!(set.try_begin("msg-1"));
        for _ in 0..10 {
            assert!(!set.try_begin("msg-1"));
        }
        assert!(set.has_responded("msg-1"));
        assert!(set.try_begin("msg-2"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn guard_requires_leadership_and_first_trigger() {
        let peers = vec![peer(10), peer(20)];

        let mut follower = ResponseGuard::new(ConnectionId(15));
        assert!(!follower.should_respond("msg-1", &peers));
        // A non-leader must not burn the event id: once the leader is
        // gone, the same event becomes actionable here.
        let remaining = vec![peer(20)];
        assert!(follower.should_respond("msg-1", &remaining));

        let mut leader = ResponseGuard::new(ConnectionId(5));
        assert!(leader.should_respond("msg-2", &peers));
        assert!(!leader.should_respond("msg-2", &peers));
    }

    // ── Request slot ────────────────────────────────────────────────

    fn sample_request(attachments: Vec<Uuid>) -> SendRequest {
        SendRequest {
            id: Uuid::new_v4(),
            prompt: "explain this deck".into(),
            requested_by: ConnectionId(40),
            attachment_ids: attachments,
            handled_by: None,
        }
    }

    #[test]
    fn claim_marks_handler_once() {
        let doc = RoomDoc::new();
        post_request(&doc, &sample_request(vec![])).unwrap();

        assert!(claim_request(&doc, ConnectionId(10)));
        let claimed = pending_request(&doc).unwrap();
        assert_eq!(claimed.handled_by, Some(ConnectionId(10)));

        // Already handled: second claim is refused.
        assert!(!claim_request(&doc, ConnectionId(20)));

        assert!(clear_request(&doc));
        assert!(pending_request(&doc).is_none());
        assert!(!clear_request(&doc));
    }

    // ── Stale-request GC ────────────────────────────────────────────

    #[test]
    fn request_is_cleared_when_every_owner_disconnects() {
        let doc = RoomDoc::new();
        let attachment_id = Uuid::new_v4();
        doc.push_json(&doc.attachments(), &attachment(attachment_id, 10)).unwrap();
        post_request(&doc, &sample_request(vec![attachment_id])).unwrap();

        // Owner (connection 10) still present: nothing to clear.
        assert!(!clear_stale_request(&doc, &[peer(10), peer(40)]));
        assert!(pending_request(&doc).is_some());

        // Owner gone, only the requester remains: request is cleared.
        assert!(clear_stale_request(&doc, &[peer(40)]));
        assert!(pending_request(&doc).is_none());
    }

    #[test]
    fn handled_request_is_not_garbage_collected() {
        let doc = RoomDoc::new();
        let attachment_id = Uuid::new_v4();
        doc.push_json(&doc.attachments(), &attachment(attachment_id, 10)).unwrap();
        let mut request = sample_request(vec![attachment_id]);
        request.handled_by = Some(ConnectionId(10));
        post_request(&doc, &request).unwrap();

        assert!(!clear_stale_request(&doc, &[peer(40)]));
        assert!(pending_request(&doc).is_some());
    }

    #[test]
    fn request_without_attachments_is_left_alone() {
        let doc = RoomDoc::new();
        post_request(&doc, &sample_request(vec![])).unwrap();
        assert!(!clear_stale_request(&doc, &[peer(40)]));
        assert!(pending_request(&doc).is_some());
    }

    // ── Attachment pruning ──────────────────────────────────────────

    #[test]
    fn orphaned_attachments_are_pruned_in_reverse_order() {
        let doc = RoomDoc::new();
        let keep_a = attachment(Uuid::new_v4(), 10);
        let drop_b = attachment(Uuid::new_v4(), 20);
        let keep_c = attachment(Uuid::new_v4(), 10);
        let drop_d = attachment(Uuid::new_v4(), 20);
        for meta in [&keep_a, &drop_b, &keep_c, &drop_d] {
            doc.push_json(&doc.attachments(), meta).unwrap();
        }

        let pruned = prune_orphaned_attachments(&doc, &[peer(10)]);
        assert_eq!(pruned, 2);

        let remaining: Vec<AttachmentMeta> = doc.read_json_list(&doc.attachments());
        assert_eq!(remaining, vec![keep_a, keep_c]);
    }

    #[test]
    fn cleanup_pass_clears_request_and_attachments_together() {
        let doc = RoomDoc::new();
        let attachment_id = Uuid::new_v4();
        doc.push_json(&doc.attachments(), &attachment(attachment_id, 20)).unwrap();
        post_request(&doc, &sample_request(vec![attachment_id])).unwrap();

        run_presence_cleanup(&doc, &[peer(40)]);

        assert!(pending_request(&doc).is_none());
        let remaining: Vec<AttachmentMeta> = doc.read_json_list(&doc.attachments());
        assert!(remaining.is_empty());
    }
}
