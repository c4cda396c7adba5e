// Shared domain types, wire protocol, and error taxonomy for noteroom.

pub mod error;
pub mod protocol;
pub mod types;
