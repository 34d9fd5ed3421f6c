//! Persistent storage contracts, adapters, and the persisted key layout.

pub mod key_value;
pub mod schema;
