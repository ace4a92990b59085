//! # Broker Search Repository
//!
//! This crate provides traits and implementations for interacting with the
//! relationship search index. It includes definitions for errors, interfaces,
//! a concrete implementation for OpenSearch, and an in-memory implementation
//! for tests and local runs.

pub mod config;
pub mod errors;
pub mod interfaces;
pub mod memory;
pub mod opensearch;
pub mod service;
pub mod types;
pub mod utils;

pub use config::SearchIndexServiceConfig;
pub use errors::SearchIndexError;
pub use interfaces::SearchIndexProvider;
pub use memory::InMemorySearchProvider;
pub use opensearch::OpenSearchProvider;
pub use service::SearchIndexService;
pub use types::{BatchOperationResult, BatchOperationSummary};
pub use utils::parse_endpoint_ids;
