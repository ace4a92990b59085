//! # Broker
//!
//! Deduplicating relationship broker for scholarly identifiers. Observed facts
//! ("DOI a cites DOI b", "a is identical to b") are folded into a two-level
//! clustering of identifiers, and the resulting group relationships are
//! published to a search index.
//!
//! ## Architecture
//!
//! 1. **Group Model**: Identity and Version groups and their invariants
//! 2. **Merge Engine**: Unions same-kind groups under per-cluster locks
//! 3. **Index Sync**: Retracts and republishes documents of affected clusters
//! 4. **Document Builder**: Projects group relationships into search documents
//! 5. **Broker**: Ingestion facade tying the above together
//!
//! ## Modules
//!
//! - [`config`]: Configuration and dependency initialization
//! - [`model`]: Working sets, group invariants and metadata rendering
//! - [`merge`]: Merges and the store-backed merge engine
//! - [`locks`]: Ordered per-cluster locks
//! - [`sync`]: Index sync
//! - [`document`]: Document builder
//! - [`orchestrator`]: The `Broker` facade
//! - [`retry`]: Caller-side retry policy
//! - [`errors`]: Error types for the broker

pub mod config;
pub mod document;
pub mod errors;
pub mod locks;
pub mod merge;
pub mod model;
pub mod orchestrator;
pub mod retry;
pub mod sync;

pub use config::{BrokerConfig, Dependencies};
pub use errors::{BrokerError, StartupError};
pub use merge::{MergeEngine, MergeResult, VersionGroupShift};
pub use orchestrator::{Broker, ObserveOutcome};
pub use retry::RetryPolicy;
pub use sync::{IndexSync, ResyncReport};
