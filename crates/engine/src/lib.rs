// noteroom-engine library entry point.
//
// The engine owns one room at a time: a shared CRDT document, the sync
// transport over a lossy broadcast channel, a local warm-start cache,
// debounced remote persistence, and leader election for at-most-once
// shared side effects.

pub mod cache;
pub mod channel;
pub mod config;
pub mod doc;
pub mod election;
pub mod manager;
pub mod persist;
pub mod transport;
