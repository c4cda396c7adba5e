// Wire messages for the noteroom-sync.v1 broadcast protocol.
//
// All four logical message types ride a JSON envelope over the room's
// pub/sub topic. Binary CRDT payloads are base64 inside the envelope.
// Delivery is best-effort: no acknowledgment, no self-echo, no ordering.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ConnectionId, PresenceEntry};

/// All message types in the noteroom-sync.v1 broadcast protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelMessage {
    /// An incremental CRDT update, fire-and-forget.
    DocUpdate {
        client: ConnectionId,
        payload_b64: String,
    },

    /// "Here is my version summary — send me what I'm missing."
    /// Broadcast immediately after a peer's subscription goes live.
    SyncRequest {
        client: ConnectionId,
        state_vector_b64: String,
    },

    /// Reply to a sync request: an update computed relative to the
    /// requester's state vector (or full state if it was unusable).
    SyncResponse {
        client: ConnectionId,
        target: ConnectionId,
        update_b64: String,
    },

    /// Presence add/update (`entry` set) or removal (`entry` absent).
    Awareness {
        client: ConnectionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entry: Option<PresenceEntry>,
    },
}

impl ChannelMessage {
    /// Connection that produced this message.
    pub fn sender(&self) -> ConnectionId {
        match self {
            Self::DocUpdate { client, .. }
            | Self::SyncRequest { client, .. }
            | Self::SyncResponse { client, .. }
            | Self::Awareness { client, .. } => *client,
        }
    }

    pub fn doc_update(client: ConnectionId, payload: &[u8]) -> Self {
        Self::DocUpdate { client, payload_b64: encode_payload(payload) }
    }

    pub fn sync_request(client: ConnectionId, state_vector: &[u8]) -> Self {
        Self::SyncRequest { client, state_vector_b64: encode_payload(state_vector) }
    }

    pub fn sync_response(client: ConnectionId, target: ConnectionId, update: &[u8]) -> Self {
        Self::SyncResponse { client, target, update_b64: encode_payload(update) }
    }
}

/// Base64-encode a binary CRDT payload for the JSON envelope.
pub fn encode_payload(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Decode a base64 payload field.
pub fn decode_payload(encoded: &str) -> Result<Vec<u8>, PayloadError> {
    BASE64.decode(encoded).map_err(|source| PayloadError { source })
}

/// A payload field that was not valid base64.
#[derive(Debug, Error)]
#[error("invalid base64 payload: {source}")]
pub struct PayloadError {
    source: base64::DecodeError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_roundtrip() {
        let bytes = vec![0u8, 1, 2, 254, 255];
        let encoded = encode_payload(&bytes);
        assert_eq!(decode_payload(&encoded).unwrap(), bytes);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_payload("not base64 !!!").is_err());
    }

    #[test]
    fn sender_is_uniform_across_variants() {
        let client = ConnectionId(9);
        assert_eq!(ChannelMessage::doc_update(client, b"u").sender(), client);
        assert_eq!(ChannelMessage::sync_request(client, b"sv").sender(), client);
        assert_eq!(
            ChannelMessage::sync_response(client, ConnectionId(1), b"d").sender(),
            client
        );
        assert_eq!(ChannelMessage::Awareness { client, entry: None }.sender(), client);
    }
}
