//! PostgreSQL implementation of the group store.
//!
//! Provides a PostgreSQL backend for the `GroupStore` trait with connection
//! pooling, transactional commits, and optimistic concurrency control.
//!
//! ## Database Tables
//!
//! - `groups`: Identity and Version groups with their metadata document and row version
//! - `identifiers`: identifier -> Identity group ownership
//! - `group_memberships`: Identity group -> Version group containment
//! - `group_relationships`: typed edges between same-kind groups, with history
//! - `group_relationship_memberships`: Identity relationship -> Version relationship support
//! - `group_redirects`: retired group -> survivor
use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use broker_shared::{
    Changeset, ClusterSnapshot, Group, GroupId, GroupKind, GroupRelationship, HistoryEntry,
    Identifier, RelationshipId,
};
use sqlx::postgres::{PgConnection, PgPool, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::{GroupStore, StoreError};

/// Upper bound on redirect hops followed by `resolve`.
const MAX_REDIRECT_HOPS: usize = 64;

const RELATIONSHIP_COLUMNS: &str = "id, kind, source_id, target_id, relation, history, version";

/// PostgreSQL implementation of the relationship store.
///
/// ## Features
///
/// - Every `commit` runs in a single transaction; any failure rolls it back
/// - Rewrites and deletes are guarded by the row `version` read in the snapshot
/// - Unique, foreign key and serialization failures surface as `StoreError::Conflict`
/// - `load_cluster` reads inside a `REPEATABLE READ` transaction
pub struct PostgresGroupStore {
    pool: PgPool,
}

impl PostgresGroupStore {
    /// Creates a new PostgreSQL store.
    ///
    /// # Arguments
    ///
    /// * `pool` - Configured PostgreSQL connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs the schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        super::MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::DatabaseError(sqlx::Error::Migrate(Box::new(e))))
    }

    async fn cluster_tx(
        conn: &mut PgConnection,
        roots: &[GroupId],
    ) -> Result<ClusterSnapshot, StoreError> {
        let root_groups = fetch_groups(conn, &to_uuids(roots.iter())).await?;

        let mut version_ids = BTreeSet::new();
        let mut identity_ids = BTreeSet::new();
        for group in &root_groups {
            match group.kind {
                GroupKind::Version => {
                    version_ids.insert(group.id);
                }
                GroupKind::Identity => {
                    identity_ids.insert(group.id);
                    version_ids.extend(group.container);
                }
            }
        }
        let version_groups = fetch_groups(conn, &to_uuids(version_ids.iter())).await?;
        for version in &version_groups {
            identity_ids.extend(version.members.iter().copied());
        }

        let mut relationships =
            fetch_relationships_touching(conn, GroupKind::Version, &to_uuids(version_ids.iter()))
                .await?;
        relationships.extend(
            fetch_relationships_touching(
                conn,
                GroupKind::Identity,
                &to_uuids(identity_ids.iter()),
            )
            .await?,
        );
        let loaded: Vec<Uuid> = relationships.iter().map(|r| r.id.0).collect();
        let parent_ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT DISTINCT relationship_id FROM group_relationship_memberships WHERE subrelationship_id = ANY($1)",
        )
        .bind(&loaded)
        .fetch_all(&mut *conn)
        .await?;
        let missing_parents: Vec<Uuid> = parent_ids
            .into_iter()
            .filter(|id| !loaded.contains(id))
            .collect();
        relationships.extend(fetch_relationships(conn, &missing_parents).await?);
        attach_subrelationships(conn, &mut relationships).await?;

        let mut group_ids: BTreeSet<GroupId> = version_ids.union(&identity_ids).copied().collect();
        for rel in &relationships {
            group_ids.insert(rel.source);
            group_ids.insert(rel.target);
        }
        let mut groups = fetch_groups(conn, &to_uuids(group_ids.iter())).await?;
        let mut extra = BTreeSet::new();
        for group in &groups {
            extra.extend(group.container);
            extra.extend(group.members.iter().copied());
        }
        let extra: Vec<Uuid> = extra
            .difference(&group_ids)
            .map(|id| id.0)
            .collect();
        groups.extend(fetch_groups(conn, &extra).await?);

        let mut snapshot = ClusterSnapshot::new();
        for group in groups {
            snapshot.insert_group(group);
        }
        for rel in relationships {
            snapshot.insert_relationship(rel);
        }
        Ok(snapshot)
    }

    /// Applies a changeset within an active transaction.
    ///
    /// Identifier and membership rows of every rewritten or retired group are
    /// deleted before any are re-inserted, so rows moving between groups never
    /// collide with their own previous position.
    async fn apply_tx(conn: &mut PgConnection, changeset: &Changeset) -> Result<(), StoreError> {
        for group in &changeset.created_groups {
            sqlx::query(
                "INSERT INTO groups (id, kind, created_at, data, version) VALUES ($1, $2, $3, $4, 0)",
            )
            .bind(group.id.0)
            .bind(group.kind.as_str())
            .bind(group.created_at)
            .bind(group.data.clone())
            .execute(&mut *conn)
            .await?;
        }

        for group in &changeset.updated_groups {
            let result = sqlx::query(
                "UPDATE groups SET data = $2, version = version + 1 WHERE id = $1 AND version = $3",
            )
            .bind(group.id.0)
            .bind(group.data.clone())
            .bind(group.version)
            .execute(&mut *conn)
            .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::conflict(format!(
                    "group {} changed since version {}",
                    group.id, group.version
                )));
            }
        }

        for retirement in &changeset.retired_groups {
            let version: Option<i64> =
                sqlx::query_scalar("SELECT version FROM groups WHERE id = $1 FOR UPDATE")
                    .bind(retirement.retired.0)
                    .fetch_optional(&mut *conn)
                    .await?;
            if version != Some(retirement.expected_version) {
                return Err(StoreError::conflict(format!(
                    "group {} changed since version {}",
                    retirement.retired, retirement.expected_version
                )));
            }
        }

        let retired: Vec<Uuid> = changeset.retired_groups.iter().map(|r| r.retired.0).collect();
        let rewritten: Vec<Uuid> = changeset
            .updated_groups
            .iter()
            .map(|g| g.id.0)
            .chain(retired.iter().copied())
            .collect();
        sqlx::query("DELETE FROM identifiers WHERE group_id = ANY($1)")
            .bind(&rewritten)
            .execute(&mut *conn)
            .await?;
        sqlx::query("DELETE FROM group_memberships WHERE group_id = ANY($1) OR subgroup_id = ANY($2)")
            .bind(&rewritten)
            .bind(&retired)
            .execute(&mut *conn)
            .await?;

        let written = changeset
            .created_groups
            .iter()
            .chain(changeset.updated_groups.iter());
        for group in written {
            for (position, identifier) in group.identifiers.iter().enumerate() {
                sqlx::query(
                    "INSERT INTO identifiers (scheme, value, group_id, position) VALUES ($1, $2, $3, $4)",
                )
                .bind(&identifier.scheme)
                .bind(&identifier.value)
                .bind(group.id.0)
                .bind(position as i32)
                .execute(&mut *conn)
                .await?;
            }
            for (position, member) in group.members.iter().enumerate() {
                sqlx::query(
                    "INSERT INTO group_memberships (group_id, subgroup_id, position) VALUES ($1, $2, $3)",
                )
                .bind(group.id.0)
                .bind(member.0)
                .bind(position as i32)
                .execute(&mut *conn)
                .await?;
            }
        }

        for removed in &changeset.removed_relationships {
            let result =
                sqlx::query("DELETE FROM group_relationships WHERE id = $1 AND version = $2")
                    .bind(removed.id.0)
                    .bind(removed.expected_version)
                    .execute(&mut *conn)
                    .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::conflict(format!(
                    "relationship {} changed since version {}",
                    removed.id, removed.expected_version
                )));
            }
        }

        for rel in &changeset.updated_relationships {
            let result = sqlx::query(
                r#"
                UPDATE group_relationships
                SET source_id = $2, target_id = $3, relation = $4, history = $5, version = version + 1
                WHERE id = $1 AND version = $6
                "#,
            )
            .bind(rel.id.0)
            .bind(rel.source.0)
            .bind(rel.target.0)
            .bind(rel.relation.as_str())
            .bind(Json(&rel.history))
            .bind(rel.version)
            .execute(&mut *conn)
            .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::conflict(format!(
                    "relationship {} changed since version {}",
                    rel.id, rel.version
                )));
            }
        }
        let updated: Vec<Uuid> = changeset
            .updated_relationships
            .iter()
            .map(|r| r.id.0)
            .collect();
        sqlx::query("DELETE FROM group_relationship_memberships WHERE relationship_id = ANY($1)")
            .bind(&updated)
            .execute(&mut *conn)
            .await?;

        for rel in &changeset.created_relationships {
            sqlx::query(
                r#"
                INSERT INTO group_relationships (id, kind, source_id, target_id, relation, history, version)
                VALUES ($1, $2, $3, $4, $5, $6, 0)
                "#,
            )
            .bind(rel.id.0)
            .bind(rel.kind.as_str())
            .bind(rel.source.0)
            .bind(rel.target.0)
            .bind(rel.relation.as_str())
            .bind(Json(&rel.history))
            .execute(&mut *conn)
            .await?;
        }

        let written = changeset
            .created_relationships
            .iter()
            .chain(changeset.updated_relationships.iter());
        for rel in written {
            for (position, sub) in rel.subrelationships.iter().enumerate() {
                sqlx::query(
                    "INSERT INTO group_relationship_memberships (relationship_id, subrelationship_id, position) VALUES ($1, $2, $3)",
                )
                .bind(rel.id.0)
                .bind(sub.0)
                .bind(position as i32)
                .execute(&mut *conn)
                .await?;
            }
        }

        for retirement in &changeset.retired_groups {
            sqlx::query("UPDATE group_redirects SET survivor_id = $2 WHERE survivor_id = $1")
                .bind(retirement.retired.0)
                .bind(retirement.survivor.0)
                .execute(&mut *conn)
                .await?;
            sqlx::query(
                r#"
                INSERT INTO group_redirects (retired_id, survivor_id) VALUES ($1, $2)
                ON CONFLICT (retired_id) DO UPDATE SET survivor_id = EXCLUDED.survivor_id
                "#,
            )
            .bind(retirement.retired.0)
            .bind(retirement.survivor.0)
            .execute(&mut *conn)
            .await?;
            // Fails with a foreign key violation if anything still references the group.
            sqlx::query("DELETE FROM groups WHERE id = $1")
                .bind(retirement.retired.0)
                .execute(&mut *conn)
                .await?;
        }

        Ok(())
    }
}

#[async_trait]
impl GroupStore for PostgresGroupStore {
    async fn find_groups_by_identifiers(
        &self,
        identifiers: &[Identifier],
    ) -> Result<HashMap<Identifier, GroupId>, StoreError> {
        if identifiers.is_empty() {
            return Ok(HashMap::new());
        }
        let schemes: Vec<String> = identifiers.iter().map(|i| i.scheme.clone()).collect();
        let values: Vec<String> = identifiers.iter().map(|i| i.value.clone()).collect();
        let rows = sqlx::query(
            r#"
            SELECT i.scheme, i.value, i.group_id
            FROM identifiers i
            JOIN UNNEST($1::text[], $2::text[]) AS q(scheme, value)
              ON i.scheme = q.scheme AND i.value = q.value
            "#,
        )
        .bind(&schemes)
        .bind(&values)
        .fetch_all(&self.pool)
        .await?;

        let mut found = HashMap::with_capacity(rows.len());
        for row in rows {
            let identifier = Identifier {
                scheme: row.try_get("scheme")?,
                value: row.try_get("value")?,
            };
            found.insert(identifier, GroupId(row.try_get("group_id")?));
        }
        Ok(found)
    }

    async fn resolve(&self, id: GroupId) -> Result<Option<GroupId>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let mut current = id.0;
        for _ in 0..MAX_REDIRECT_HOPS {
            let exists: Option<Uuid> = sqlx::query_scalar("SELECT id FROM groups WHERE id = $1")
                .bind(current)
                .fetch_optional(&mut *conn)
                .await?;
            if exists.is_some() {
                return Ok(Some(GroupId(current)));
            }
            let survivor: Option<Uuid> =
                sqlx::query_scalar("SELECT survivor_id FROM group_redirects WHERE retired_id = $1")
                    .bind(current)
                    .fetch_optional(&mut *conn)
                    .await?;
            match survivor {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Ok(None)
    }

    async fn get_groups(&self, ids: &[GroupId]) -> Result<Vec<Group>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        fetch_groups(&mut conn, &to_uuids(ids.iter())).await
    }

    #[instrument(skip(self, roots), fields(roots = roots.len()))]
    async fn load_cluster(&self, roots: &[GroupId]) -> Result<ClusterSnapshot, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;
        let snapshot = Self::cluster_tx(&mut tx, roots).await?;
        tx.commit().await?;
        Ok(snapshot)
    }

    #[instrument(skip(self, changeset))]
    async fn commit(&self, changeset: &Changeset) -> Result<(), StoreError> {
        if changeset.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        Self::apply_tx(&mut tx, changeset).await?;
        tx.commit().await?;
        debug!(
            created_groups = changeset.created_groups.len(),
            updated_groups = changeset.updated_groups.len(),
            retired_groups = changeset.retired_groups.len(),
            created_relationships = changeset.created_relationships.len(),
            updated_relationships = changeset.updated_relationships.len(),
            removed_relationships = changeset.removed_relationships.len(),
            "Committed changeset"
        );
        Ok(())
    }
}

fn to_uuids<'a>(ids: impl Iterator<Item = &'a GroupId>) -> Vec<Uuid> {
    ids.map(|id| id.0).collect()
}

async fn fetch_groups(conn: &mut PgConnection, ids: &[Uuid]) -> Result<Vec<Group>, StoreError> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let rows = sqlx::query("SELECT id, kind, created_at, data, version FROM groups WHERE id = ANY($1)")
        .bind(ids)
        .fetch_all(&mut *conn)
        .await?;

    let mut groups = Vec::with_capacity(rows.len());
    let mut index = HashMap::with_capacity(rows.len());
    for row in rows {
        let kind: String = row.try_get("kind")?;
        let group = Group {
            id: GroupId(row.try_get("id")?),
            kind: kind.parse().map_err(|e: String| StoreError::serialization(e))?,
            created_at: row.try_get("created_at")?,
            data: row.try_get("data")?,
            identifiers: Vec::new(),
            members: Vec::new(),
            container: None,
            version: row.try_get("version")?,
        };
        index.insert(group.id, groups.len());
        groups.push(group);
    }

    let identifier_rows = sqlx::query(
        "SELECT scheme, value, group_id FROM identifiers WHERE group_id = ANY($1) ORDER BY group_id, position",
    )
    .bind(ids)
    .fetch_all(&mut *conn)
    .await?;
    for row in identifier_rows {
        let owner = GroupId(row.try_get("group_id")?);
        if let Some(&i) = index.get(&owner) {
            groups[i].identifiers.push(Identifier {
                scheme: row.try_get("scheme")?,
                value: row.try_get("value")?,
            });
        }
    }

    let membership_rows = sqlx::query(
        r#"
        SELECT group_id, subgroup_id FROM group_memberships
        WHERE group_id = ANY($1) OR subgroup_id = ANY($1)
        ORDER BY group_id, position
        "#,
    )
    .bind(ids)
    .fetch_all(&mut *conn)
    .await?;
    for row in membership_rows {
        let parent = GroupId(row.try_get("group_id")?);
        let child = GroupId(row.try_get("subgroup_id")?);
        if let Some(&i) = index.get(&parent) {
            groups[i].members.push(child);
        }
        if let Some(&i) = index.get(&child) {
            groups[i].container = Some(parent);
        }
    }
    Ok(groups)
}

fn relationship_from_row(row: &PgRow) -> Result<GroupRelationship, StoreError> {
    let kind: String = row.try_get("kind")?;
    let relation: String = row.try_get("relation")?;
    let history: Json<Vec<HistoryEntry>> = row.try_get("history")?;
    Ok(GroupRelationship {
        id: RelationshipId(row.try_get("id")?),
        kind: kind.parse().map_err(|e: String| StoreError::serialization(e))?,
        source: GroupId(row.try_get("source_id")?),
        target: GroupId(row.try_get("target_id")?),
        relation: relation
            .parse()
            .map_err(|e: String| StoreError::serialization(e))?,
        history: history.0,
        subrelationships: Vec::new(),
        version: row.try_get("version")?,
    })
}

async fn fetch_relationships_touching(
    conn: &mut PgConnection,
    kind: GroupKind,
    ids: &[Uuid],
) -> Result<Vec<GroupRelationship>, StoreError> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT {} FROM group_relationships WHERE kind = $1 AND (source_id = ANY($2) OR target_id = ANY($2))",
        RELATIONSHIP_COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(kind.as_str())
        .bind(ids)
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(relationship_from_row).collect()
}

async fn fetch_relationships(
    conn: &mut PgConnection,
    ids: &[Uuid],
) -> Result<Vec<GroupRelationship>, StoreError> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT {} FROM group_relationships WHERE id = ANY($1)",
        RELATIONSHIP_COLUMNS
    );
    let rows = sqlx::query(&sql).bind(ids).fetch_all(&mut *conn).await?;
    rows.iter().map(relationship_from_row).collect()
}

async fn attach_subrelationships(
    conn: &mut PgConnection,
    relationships: &mut [GroupRelationship],
) -> Result<(), StoreError> {
    let ids: Vec<Uuid> = relationships.iter().map(|r| r.id.0).collect();
    if ids.is_empty() {
        return Ok(());
    }
    let rows = sqlx::query(
        r#"
        SELECT relationship_id, subrelationship_id FROM group_relationship_memberships
        WHERE relationship_id = ANY($1)
        ORDER BY relationship_id, position
        "#,
    )
    .bind(&ids)
    .fetch_all(&mut *conn)
    .await?;

    let index: HashMap<RelationshipId, usize> = relationships
        .iter()
        .enumerate()
        .map(|(i, r)| (r.id, i))
        .collect();
    for row in rows {
        let parent = RelationshipId(row.try_get("relationship_id")?);
        let sub = RelationshipId(row.try_get("subrelationship_id")?);
        if let Some(&i) = index.get(&parent) {
            relationships[i].subrelationships.push(sub);
        }
    }
    Ok(())
}
