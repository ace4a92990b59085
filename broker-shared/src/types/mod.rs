//! This module defines the core data structures used across the broker.

pub mod changeset;
pub mod cluster;
pub mod document;
pub mod fact;
pub mod group;
pub mod ids;
pub mod identifier;
pub mod relation;
pub mod relationship;

pub use changeset::{Changeset, RemovedRelationship, Retirement};
pub use cluster::ClusterSnapshot;
pub use document::{document_key, RelationshipDocument};
pub use fact::{Fact, FactMetadata, RawFact};
pub use group::{Group, GroupKind};
pub use ids::{GroupId, RelationshipId};
pub use identifier::Identifier;
pub use relation::Relation;
pub use relationship::{FactKey, GroupRelationship, HistoryEntry, RelationshipKey};
