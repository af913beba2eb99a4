#[path = "../src/db/migrations.rs"]
mod migrations;
#[path = "../src/db/pool.rs"]
mod pool;

use pool::{create_pg_pool, PoolConfig};

const EXPECTED_TABLES: &[&str] = &["user", "project", "user_project_access"];

#[tokio::test]
async fn relay_migrations_create_expected_tables() {
    let Some(database_url) = std::env::var("COLLAB_RELAY_TEST_DATABASE_URL").ok() else {
        eprintln!("skipping db migration integration test: set COLLAB_RELAY_TEST_DATABASE_URL");
        return;
    };

    let config = PoolConfig { min_connections: 1, max_connections: 2, ..PoolConfig::default() };

    let pool =
        create_pg_pool(&database_url, config).await.expect("pool should connect to test database");

    migrations::run_migrations(&pool).await.expect("migrations should apply");
    // A second run must be a no-op against an already migrated database.
    migrations::run_migrations(&pool).await.expect("migrations should be idempotent");

    let table_names: Vec<String> = sqlx::query_scalar::<_, String>(
        "SELECT table_name \
         FROM information_schema.tables \
         WHERE table_schema = 'public'",
    )
    .fetch_all(&pool)
    .await
    .expect("table lookup should succeed");

    for expected_table in EXPECTED_TABLES {
        assert!(
            table_names.iter().any(|name| name == expected_table),
            "expected table `{expected_table}` to exist after migrations"
        );
    }

    let primary_key: Vec<String> = sqlx::query_scalar::<_, String>(
        "SELECT kcu.column_name \
         FROM information_schema.table_constraints AS tc \
         JOIN information_schema.key_column_usage AS kcu \
           ON tc.constraint_name = kcu.constraint_name \
          AND tc.table_schema = kcu.table_schema \
         WHERE tc.table_name = 'user_project_access' \
           AND tc.constraint_type = 'PRIMARY KEY' \
         ORDER BY kcu.ordinal_position",
    )
    .fetch_all(&pool)
    .await
    .expect("primary key lookup should succeed");

    assert_eq!(primary_key, vec!["user_id".to_owned(), "project_id".to_owned()]);
}
