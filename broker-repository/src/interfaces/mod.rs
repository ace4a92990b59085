//! This module defines and re-exports the interfaces for the relationship store.
mod group_store;

pub use group_store::GroupStore;
