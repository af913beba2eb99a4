use anyhow::{Context, Result};
use sqlx::{migrate::Migrator, postgres::PgPool};

/// Embedded schema for the grant table and the rows it references.
pub static MIGRATOR: Migrator = sqlx::migrate!("./src/db/migrations");

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    MIGRATOR.run(pool).await.context("failed to apply collaboration schema migrations")
}
