//! # Broker Shared
//!
//! This crate defines the data structures shared across the relationship broker:
//! scholarly identifiers, Identity and Version groups, group relationships with
//! their provenance history, the cluster snapshots and changesets exchanged with
//! the relationship store, and the relationship documents published to search.

pub mod types;

pub use types::{
    document_key, Changeset, ClusterSnapshot, Fact, FactKey, FactMetadata, Group, GroupId,
    GroupKind, GroupRelationship, HistoryEntry, Identifier, RawFact, Relation,
    RelationshipDocument, RelationshipId, RelationshipKey, RemovedRelationship, Retirement,
};
