// Error taxonomy for the noteroom engine.
//
// Transport and persistence failures are recovered locally and surfaced
// as status transitions, never as errors that could crash a caller. The
// variants here cover the few conditions that *are* returned: capacity
// overflow is terminal for a connection attempt, everything else is
// internal plumbing.

use thiserror::Error;

/// Errors from the remote persistence RPC (network or backend-side).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    /// Network unreachable / connection refused.
    #[error("rpc: connection failed")]
    ConnectionFailed,

    /// Backend returned an unexpected error.
    #[error("rpc: backend error: {message}")]
    Backend { message: String },
}

/// Errors surfaced by the connection manager.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The room is at capacity. The caller must discard every reference
    /// to the attempted connection.
    #[error("room `{room}` is full (capacity {capacity})")]
    RoomFull { room: String, capacity: usize },

    /// An operation that requires an active room was called without one.
    #[error("no active room connection")]
    NotConnected,

    /// A requested history version does not exist on the remote store.
    #[error("version {version} not found for room `{room}`")]
    VersionNotFound { room: String, version: i64 },

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    pub fn is_room_full(&self) -> bool {
        matches!(self, Self::RoomFull { .. })
    }
}
