//! # Broker Repository
//! This crate provides the relationship store used by the broker: the
//! `GroupStore` trait over groups, identifiers, memberships and group
//! relationships, together with a PostgreSQL implementation and an in-memory
//! implementation for tests and local runs.
pub mod errors;
pub mod interfaces;
pub mod memory;
pub mod postgres;

pub use errors::StoreError;
pub use interfaces::GroupStore;
pub use memory::MemoryGroupStore;
pub use postgres::PostgresGroupStore;
