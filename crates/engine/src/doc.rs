// Shared room document, wrapping yrs.
//
// One `RoomDoc` per room, owned by the connection manager. UI surfaces
// receive handles to named substructures but never own the document.
// Merge is idempotent, commutative, and associative by construction,
// which is what lets the transport stay fire-and-forget.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Array, ArrayRef, Doc, GetString, Map, MapRef, Origin, ReadTxn, StateVector, Text, TextRef,
    Transact, Update,
};

/// Transaction origin tag for updates merged from remote peers.
const REMOTE_ORIGIN: &str = "remote";

/// Typed registry of the named substructures a room document carries.
/// Accessors validate the structure kind at call time instead of handing
/// out untyped lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SharedStructure {
    /// Main collaborative text buffer.
    Body,
    /// Room-wide chat transcript.
    Chat,
    /// Message list for one thread.
    ThreadMessages(Uuid),
    /// Attachment metadata entries.
    Attachments,
    /// Single-slot send/response request.
    SendRequest,
    /// Thread registry.
    Threads,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructureKind {
    Text,
    List,
    Map,
}

impl SharedStructure {
    /// Stable name inside the CRDT document.
    pub fn key(&self) -> String {
        match self {
            Self::Body => "body".to_string(),
            Self::Chat => "chat".to_string(),
            Self::ThreadMessages(thread) => format!("thread:{thread}"),
            Self::Attachments => "attachments".to_string(),
            Self::SendRequest => "send-request".to_string(),
            Self::Threads => "threads".to_string(),
        }
    }

    pub fn kind(&self) -> StructureKind {
        match self {
            Self::Body => StructureKind::Text,
            Self::Chat | Self::ThreadMessages(_) | Self::Attachments => StructureKind::List,
            Self::SendRequest | Self::Threads => StructureKind::Map,
        }
    }
}

/// A typed handle to a named substructure.
#[derive(Debug, Clone)]
pub enum StructureHandle {
    Text(TextRef),
    List(ArrayRef),
    Map(MapRef),
}

/// Wrapper around a yrs document for one room.
pub struct RoomDoc {
    doc: Doc,
}

impl RoomDoc {
    /// Create a new empty document.
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Create a document with a specific client ID (deterministic tests).
    pub fn with_client_id(client_id: u64) -> Self {
        let options = yrs::Options { client_id, ..Default::default() };
        Self { doc: Doc::with_options(options) }
    }

    /// Rebuild a document from a full binary state.
    pub fn from_state(data: &[u8]) -> Result<Self> {
        let doc = Self::new();
        doc.merge_update(data).context("failed to seed document from state")?;
        Ok(doc)
    }

    /// Merge a binary update (incremental or full state) into the
    /// document. Applying the same update any number of times, in any
    /// order relative to others, converges to the same content.
    pub fn merge_update(&self, data: &[u8]) -> Result<()> {
        let update = Update::decode_v1(data).context("failed to decode document update")?;
        self.doc.transact_mut().apply_update(update).context("failed to apply document update")?;
        Ok(())
    }

    /// Merge an update received from a remote peer. Same semantics as
    /// [`merge_update`](Self::merge_update), but the transaction is
    /// tagged so local-update observers can tell the two apart.
    pub fn merge_remote_update(&self, data: &[u8]) -> Result<()> {
        let update = Update::decode_v1(data).context("failed to decode document update")?;
        self.doc
            .transact_mut_with(REMOTE_ORIGIN)
            .apply_update(update)
            .context("failed to apply document update")?;
        Ok(())
    }

    /// Encode the full document state as a binary blob.
    pub fn encode_state(&self) -> Vec<u8> {
        self.doc.transact().encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode the state vector (version summary) for the sync protocol.
    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Compute an update containing everything the remote peer is
    /// missing, given its encoded state vector.
    pub fn diff_since(&self, remote_sv: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_sv).context("failed to decode state vector")?;
        Ok(self.doc.transact().encode_diff_v1(&sv))
    }

    /// Stream of binary updates produced by every local or merged
    /// mutation. The returned subscription must be kept alive for the
    /// stream to keep flowing.
    pub fn subscribe_updates(
        &self,
    ) -> Result<(mpsc::UnboundedReceiver<Vec<u8>>, yrs::Subscription)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self
            .doc
            .observe_update_v1(move |_txn, event| {
                let _ = tx.send(event.update.clone());
            })
            .context("failed to register document update observer")?;
        Ok((rx, subscription))
    }

    /// Like [`subscribe_updates`](Self::subscribe_updates), but skips
    /// updates that were merged from remote peers. This is what the
    /// transport rebroadcasts: forwarding remote-originated updates back
    /// to the channel would amplify every message across the room.
    pub fn subscribe_local_updates(
        &self,
    ) -> Result<(mpsc::UnboundedReceiver<Vec<u8>>, yrs::Subscription)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let remote = Origin::from(REMOTE_ORIGIN);
        let subscription = self
            .doc
            .observe_update_v1(move |txn, event| {
                if txn.origin() == Some(&remote) {
                    return;
                }
                let _ = tx.send(event.update.clone());
            })
            .context("failed to register document update observer")?;
        Ok((rx, subscription))
    }

    /// Open a named substructure with its concrete typed handle.
    pub fn open(&self, structure: &SharedStructure) -> StructureHandle {
        let key = structure.key();
        match structure.kind() {
            StructureKind::Text => StructureHandle::Text(self.doc.get_or_insert_text(&*key)),
            StructureKind::List => StructureHandle::List(self.doc.get_or_insert_array(&*key)),
            StructureKind::Map => StructureHandle::Map(self.doc.get_or_insert_map(&*key)),
        }
    }

    pub fn body(&self) -> TextRef {
        self.doc.get_or_insert_text("body")
    }

    pub fn chat(&self) -> ArrayRef {
        self.doc.get_or_insert_array("chat")
    }

    pub fn attachments(&self) -> ArrayRef {
        self.doc.get_or_insert_array("attachments")
    }

    pub fn send_request_slot(&self) -> MapRef {
        self.doc.get_or_insert_map("send-request")
    }

    pub fn threads(&self) -> MapRef {
        self.doc.get_or_insert_map("threads")
    }

    pub fn thread_messages(&self, thread: Uuid) -> ArrayRef {
        self.doc.get_or_insert_array(&*SharedStructure::ThreadMessages(thread).key())
    }

    /// Current content of the main text buffer.
    pub fn body_string(&self) -> String {
        let text = self.body();
        text.get_string(&self.doc.transact())
    }

    /// Insert into the main text buffer at a UTF-16 offset.
    pub fn insert_body(&self, index: u32, content: &str) {
        let text = self.body();
        let mut txn = self.doc.transact_mut();
        text.insert(&mut txn, index, content);
    }

    /// Remove a range from the main text buffer (UTF-16 offsets).
    pub fn remove_body(&self, index: u32, len: u32) {
        let text = self.body();
        let mut txn = self.doc.transact_mut();
        text.remove_range(&mut txn, index, len);
    }

    /// Length of the main text buffer in UTF-16 code units.
    pub fn body_len(&self) -> u32 {
        let text = self.body();
        text.len(&self.doc.transact())
    }

    /// Plain-text excerpt of the body for listings, capped at
    /// `max_chars` characters.
    pub fn text_preview(&self, max_chars: usize) -> String {
        self.body_string().chars().take(max_chars).collect()
    }

    /// Append a JSON-encoded record to a shared list.
    pub fn push_json<T: Serialize>(&self, list: &ArrayRef, record: &T) -> Result<()> {
        let encoded = serde_json::to_string(record).context("failed to encode list record")?;
        let mut txn = self.doc.transact_mut();
        list.push_back(&mut txn, encoded);
        Ok(())
    }

    /// Read every decodable JSON record from a shared list. Malformed
    /// entries are skipped rather than failing the whole read.
    pub fn read_json_list<T: DeserializeOwned>(&self, list: &ArrayRef) -> Vec<T> {
        let txn = self.doc.transact();
        list.iter(&txn)
            .filter_map(|value| {
                let raw = value.to_string(&txn);
                serde_json::from_str(&raw).ok()
            })
            .collect()
    }

    /// Write a JSON-encoded record under a map key.
    pub fn put_json<T: Serialize>(&self, map: &MapRef, key: &str, record: &T) -> Result<()> {
        let encoded = serde_json::to_string(record).context("failed to encode map record")?;
        let mut txn = self.doc.transact_mut();
        map.insert(&mut txn, key.to_string(), encoded);
        Ok(())
    }

    /// Read and decode a JSON record under a map key. Missing or
    /// malformed values read as `None`.
    pub fn get_json<T: DeserializeOwned>(&self, map: &MapRef, key: &str) -> Option<T> {
        let txn = self.doc.transact();
        let raw = map.get(&txn, key)?.to_string(&txn);
        serde_json::from_str(&raw).ok()
    }

    /// Remove a map key, returning whether it existed.
    pub fn remove_key(&self, map: &MapRef, key: &str) -> bool {
        let mut txn = self.doc.transact_mut();
        map.remove(&mut txn, key).is_some()
    }

    /// Remove a list element by index.
    pub fn remove_list_index(&self, list: &ArrayRef, index: u32) {
        let mut txn = self.doc.transact_mut();
        if index < list.len(&txn) {
            list.remove(&mut txn, index);
        }
    }

    /// Raw JSON strings of a shared list, in order. Used by cleanup
    /// passes that need indices alongside decoded records.
    pub fn raw_json_list(&self, list: &ArrayRef) -> Vec<String> {
        let txn = self.doc.transact();
        list.iter(&txn).map(|value| value.to_string(&txn)).collect()
    }

}

impl Default for RoomDoc {
    fn default() -> Self {
        Self::new()
    }
}
