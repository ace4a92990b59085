//! This module defines the `GroupStore` trait, the boundary between the broker
//! and the relational store holding identifiers, groups, memberships and group
//! relationships.
use std::collections::HashMap;

use broker_shared::{Changeset, ClusterSnapshot, Group, GroupId, Identifier};

use crate::errors::StoreError;

/// A trait that defines the interface for interacting with the relationship store.
///
/// Reads return consistent views; [`GroupStore::commit`] applies a whole
/// [`Changeset`] or nothing.
#[async_trait::async_trait]
pub trait GroupStore: Send + Sync {
    /// Looks up the Identity group owning each identifier.
    ///
    /// # Arguments
    ///
    /// * `identifiers` - Normalized identifiers to look up.
    ///
    /// # Returns
    ///
    /// A map containing only the identifiers that are already recorded.
    async fn find_groups_by_identifiers(
        &self,
        identifiers: &[Identifier],
    ) -> Result<HashMap<Identifier, GroupId>, StoreError>;

    /// Follows retirement redirects from `id` to the live group it was merged into.
    ///
    /// # Returns
    ///
    /// * `Ok(Some(id))` - The live group (`id` itself if it was never retired)
    /// * `Ok(None)` - No such group was ever recorded
    async fn resolve(&self, id: GroupId) -> Result<Option<GroupId>, StoreError>;

    /// Fetches live groups with their identifiers and memberships. Unknown ids
    /// are skipped.
    async fn get_groups(&self, ids: &[GroupId]) -> Result<Vec<Group>, StoreError>;

    /// Reads the clusters around `roots` in one consistent snapshot.
    ///
    /// The snapshot contains:
    ///
    /// - the roots, the Version groups among or containing them, and every
    ///   Identity member of those Version groups;
    /// - the Version relationships touching those Version groups and the
    ///   Identity relationships touching those Identity groups;
    /// - the parent relationships of all of the above;
    /// - the endpoints of all loaded relationships, with their containers and
    ///   members.
    async fn load_cluster(&self, roots: &[GroupId]) -> Result<ClusterSnapshot, StoreError>;

    /// Atomically applies a changeset.
    ///
    /// # Returns
    ///
    /// * `Ok(())` - Every change was applied
    /// * `Err(StoreError::Conflict)` - A row was modified concurrently; nothing was applied
    async fn commit(&self, changeset: &Changeset) -> Result<(), StoreError>;
}
