//! Integration tests for the PostgreSQL group store.
//!
//! These tests require a real PostgreSQL database (`DATABASE_URL`) and use SQLx
//! test macros to ensure proper test isolation and cleanup.
//!
//! Run with: `cargo test --test postgres_integration -- --ignored`

use broker_repository::{GroupStore, PostgresGroupStore, StoreError};
use broker_shared::{
    Changeset, Group, GroupKind, GroupRelationship, Identifier, Relation, RemovedRelationship,
    Retirement,
};
use serde_json::json;
use sqlx::Row;

/// Creates an Identity group inside a fresh Version group.
fn make_cluster(doi: &str) -> (Group, Group) {
    let mut identity = Group::identity(vec![Identifier::doi(doi)]);
    let version = Group::version(vec![identity.id]);
    identity.container = Some(version.id);
    (identity, version)
}

async fn seed(store: &PostgresGroupStore, doi: &str) -> (Group, Group) {
    let (identity, version) = make_cluster(doi);
    store
        .commit(&Changeset {
            created_groups: vec![identity.clone(), version.clone()],
            ..Default::default()
        })
        .await
        .unwrap();
    (identity, version)
}

// ============================================================================
// Groups and identifiers
// ============================================================================

#[sqlx::test(migrations = "src/postgres/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_create_cluster_and_lookup(pool: sqlx::PgPool) {
    let store = PostgresGroupStore::new(pool.clone());
    let (identity, version) = seed(&store, "10.1/a").await;

    let found = store
        .find_groups_by_identifiers(&[Identifier::doi("10.1/a"), Identifier::doi("10.1/zzz")])
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[&Identifier::doi("10.1/a")], identity.id);

    let groups = store.get_groups(&[identity.id, version.id]).await.unwrap();
    let stored_identity = groups.iter().find(|g| g.id == identity.id).unwrap();
    let stored_version = groups.iter().find(|g| g.id == version.id).unwrap();
    assert_eq!(stored_identity.container, Some(version.id));
    assert_eq!(stored_version.members, vec![identity.id]);
    assert_eq!(stored_identity.created_at, identity.created_at);
}

#[sqlx::test(migrations = "src/postgres/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_identifier_owned_twice_is_a_conflict(pool: sqlx::PgPool) {
    let store = PostgresGroupStore::new(pool.clone());
    seed(&store, "10.1/a").await;

    let (identity, version) = make_cluster("10.1/a");
    let err = store
        .commit(&Changeset {
            created_groups: vec![identity, version],
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));

    let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM groups")
        .fetch_one(&pool)
        .await
        .unwrap()
        .get("n");
    assert_eq!(count, 2);
}

#[sqlx::test(migrations = "src/postgres/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_stale_update_is_rolled_back(pool: sqlx::PgPool) {
    let store = PostgresGroupStore::new(pool.clone());
    let (mut identity, _) = seed(&store, "10.1/a").await;

    identity.data = Some(json!({"Title": "first"}));
    store
        .commit(&Changeset {
            updated_groups: vec![identity.clone()],
            ..Default::default()
        })
        .await
        .unwrap();

    // Same expected version again: the row is now at version 1.
    let (other_identity, other_version) = make_cluster("10.1/b");
    identity.data = Some(json!({"Title": "second"}));
    let err = store
        .commit(&Changeset {
            created_groups: vec![other_identity, other_version],
            updated_groups: vec![identity.clone()],
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    let stored = store.get_groups(&[identity.id]).await.unwrap();
    assert_eq!(stored[0].data, Some(json!({"Title": "first"})));
    assert_eq!(stored[0].version, 1);
    assert!(store
        .find_groups_by_identifiers(&[Identifier::doi("10.1/b")])
        .await
        .unwrap()
        .is_empty());
}

// ============================================================================
// Relationships and retirement
// ============================================================================

#[sqlx::test(migrations = "src/postgres/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_load_cluster_with_relationships(pool: sqlx::PgPool) {
    let store = PostgresGroupStore::new(pool.clone());
    let (a, va) = seed(&store, "10.1/a").await;
    let (b, vb) = seed(&store, "10.1/b").await;

    let identity_rel = GroupRelationship::new(GroupKind::Identity, a.id, b.id, Relation::Cites);
    let mut version_rel = GroupRelationship::new(GroupKind::Version, va.id, vb.id, Relation::Cites);
    version_rel.add_subrelationship(identity_rel.id);
    store
        .commit(&Changeset {
            created_relationships: vec![identity_rel.clone(), version_rel.clone()],
            ..Default::default()
        })
        .await
        .unwrap();

    let snapshot = store.load_cluster(&[a.id]).await.unwrap();
    assert!(snapshot.relationship(identity_rel.id).is_some());
    assert_eq!(
        snapshot.relationship(version_rel.id).unwrap().subrelationships,
        vec![identity_rel.id]
    );
    assert_eq!(snapshot.group(vb.id).unwrap().members, vec![b.id]);
}

#[sqlx::test(migrations = "src/postgres/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_merge_changeset_retires_and_redirects(pool: sqlx::PgPool) {
    let store = PostgresGroupStore::new(pool.clone());
    let (a, va) = seed(&store, "10.1/a").await;
    let (b, vb) = seed(&store, "10.1/b").await;
    let (c, vc) = seed(&store, "10.1/c").await;

    let a_cites_c = GroupRelationship::new(GroupKind::Identity, a.id, c.id, Relation::Cites);
    let b_cites_c = GroupRelationship::new(GroupKind::Identity, b.id, c.id, Relation::Cites);
    store
        .commit(&Changeset {
            created_relationships: vec![a_cites_c.clone(), b_cites_c.clone()],
            ..Default::default()
        })
        .await
        .unwrap();

    // Merge identity b into a: a takes b's identifiers, b leaves vb, the duplicate
    // citation is folded into a's.
    let mut survivor = a.clone();
    survivor.identifiers.push(Identifier::doi("10.1/b"));
    let mut emptied = vb.clone();
    emptied.members.clear();
    let mut folded = a_cites_c.clone();
    folded.absorb_history(&b_cites_c.history);

    store
        .commit(&Changeset {
            updated_groups: vec![survivor, emptied],
            retired_groups: vec![Retirement {
                retired: b.id,
                survivor: a.id,
                expected_version: 0,
            }],
            updated_relationships: vec![folded],
            removed_relationships: vec![RemovedRelationship {
                id: b_cites_c.id,
                expected_version: 0,
            }],
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(store.resolve(b.id).await.unwrap(), Some(a.id));
    let found = store
        .find_groups_by_identifiers(&[Identifier::doi("10.1/b")])
        .await
        .unwrap();
    assert_eq!(found[&Identifier::doi("10.1/b")], a.id);

    let referencing: i64 = sqlx::query(
        "SELECT COUNT(*) AS n FROM group_relationships WHERE source_id = $1 OR target_id = $1",
    )
    .bind(b.id.0)
    .fetch_one(&pool)
    .await
    .unwrap()
    .get("n");
    assert_eq!(referencing, 0);

    let snapshot = store.load_cluster(&[c.id]).await.unwrap();
    assert_eq!(snapshot.relationships_touching(c.id).count(), 1);
    assert!(snapshot.group(va.id).is_some());
    assert!(snapshot.group(vc.id).is_some());
}

#[sqlx::test(migrations = "src/postgres/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_retiring_a_referenced_group_is_a_conflict(pool: sqlx::PgPool) {
    let store = PostgresGroupStore::new(pool.clone());
    let (_, va) = seed(&store, "10.1/a").await;
    let (_, vb) = seed(&store, "10.1/b").await;
    let rel = GroupRelationship::new(GroupKind::Version, va.id, vb.id, Relation::Cites);
    store
        .commit(&Changeset {
            created_relationships: vec![rel],
            ..Default::default()
        })
        .await
        .unwrap();

    let err = store
        .commit(&Changeset {
            retired_groups: vec![Retirement {
                retired: vb.id,
                survivor: va.id,
                expected_version: 0,
            }],
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(store.resolve(vb.id).await.unwrap(), Some(vb.id));
}
