//! PostgreSQL implementation of the relationship store.
mod group_store;

pub use group_store::PostgresGroupStore;

/// Migrations creating the relationship store schema.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("src/postgres/migrations");
