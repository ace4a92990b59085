//! Error types for the relationship store.
mod store;

pub use store::StoreError;
