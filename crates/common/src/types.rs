// Core domain types shared across all noteroom crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies a room (one shared document per room).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Random per-connection identifier. Assigned once when a transport
/// subscribes; also the basis of leader election (lowest id wins).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Draw a fresh random connection id.
    pub fn random() -> Self {
        Self(Uuid::new_v4().as_u128() as u64)
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Display identity published into the presence table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserInfo {
    pub name: String,
    /// Hex color, e.g. `#30bced`.
    pub color: String,
}

/// Cursor selection within the shared text buffer (UTF-16 offsets).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CursorPosition {
    pub anchor: u32,
    pub head: u32,
}

/// Ephemeral per-connection presence record. Never persisted; lives only
/// as long as the connection and is replicated via awareness messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceEntry {
    pub connection_id: ConnectionId,
    pub user: UserInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_thread: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typing_in: Option<Uuid>,
}

impl PresenceEntry {
    pub fn new(connection_id: ConnectionId, user: UserInfo) -> Self {
        Self { connection_id, user, cursor: None, active_thread: None, typing_in: None }
    }
}

/// A chat transcript entry, stored as JSON inside the shared document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: Uuid,
    pub author: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Metadata for an attachment whose bytes live only on the owning peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttachmentMeta {
    pub id: Uuid,
    pub name: String,
    pub size_bytes: u64,
    /// Connection that holds the attachment bytes locally.
    pub owner: ConnectionId,
}

/// A thread registry entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: Uuid,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

/// "A peer without the required local resources asks the peer who has
/// them to perform an action." Cleared by whichever peer sets
/// `handled_by` and completes the action, or garbage-collected when no
/// eligible handler remains connected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendRequest {
    pub id: Uuid,
    pub prompt: String,
    pub requested_by: ConnectionId,
    #[serde(default)]
    pub attachment_ids: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handled_by: Option<ConnectionId>,
}

impl SendRequest {
    pub fn is_handled(&self) -> bool {
        self.handled_by.is_some()
    }
}

// ── Remote persistence RPC surface ─────────────────────────────────

/// A persisted document as returned by the remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDocument {
    /// Full CRDT state, binary update encoding.
    pub state: Vec<u8>,
    pub updated_at: DateTime<Utc>,
}

/// One row of the version history listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionInfo {
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub edited_by: String,
}

/// Snapshot instruction attached to each save call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotDirective {
    pub every_n_saves: u32,
    pub every_seconds: u64,
    /// True when the persistence layer's policy says this save should
    /// also be retained as an append-only version snapshot.
    pub due: bool,
}

/// Upsert request for the remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveRequest {
    pub room: RoomId,
    pub title: String,
    pub state: Vec<u8>,
    /// Short plain-text excerpt for listings.
    pub text_preview: String,
    /// Display name of the editor performing the save.
    pub editor: String,
    pub snapshot: SnapshotDirective,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_ids_are_ordered_numerically() {
        let low = ConnectionId(3);
        let high = ConnectionId(250);
        assert!(low < high);
        assert_eq!([high, low].iter().min(), Some(&low));
    }

    #[test]
    fn presence_entry_omits_unset_fields() {
        let entry = PresenceEntry::new(
            ConnectionId(7),
            UserInfo { name: "Ada".into(), color: "#30bced".into() },
        );
        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains("cursor"));
        assert!(!json.contains("active_thread"));
        assert!(!json.contains("typing_in"));
    }

    #[test]
    fn send_request_roundtrips_without_handler() {
        let request = SendRequest {
            id: Uuid::new_v4(),
            prompt: "summarize the deck".into(),
            requested_by: ConnectionId(42),
            attachment_ids: vec![Uuid::new_v4()],
            handled_by: None,
        };
        let json = serde_json::to_string(&request).unwrap();
        let parsed: SendRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, request);
        assert!(!parsed.is_handled());
    }

    #[test]
    fn room_id_displays_raw_string() {
        let room = RoomId::new("study-hall");
        assert_eq!(room.to_string(), "study-hall");
        assert_eq!(room.as_str(), "study-hall");
    }
}
