// Durable record of which users may collaborate on which projects.
//
// Grants are written lazily by the WebSocket handshake and read by the REST
// surface. The (user_id, project_id) primary key makes the write an
// idempotent upsert; losing an insert race is not an error.

use anyhow::Context;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessGrant {
    pub user_id: Uuid,
    pub project_id: Uuid,
    pub granted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantOutcome {
    Created,
    AlreadyGranted,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("project {project_id} or user {user_id} does not exist")]
    UnknownProject { user_id: Uuid, project_id: Uuid },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Clone)]
pub enum AccessLedger {
    Postgres(PgPool),
    Memory(Arc<RwLock<MemoryLedger>>),
}

#[derive(Debug, Default)]
pub struct MemoryLedger {
    grants: HashMap<(Uuid, Uuid), DateTime<Utc>>,
    /// When set, grants for projects outside this set fail like a
    /// foreign-key violation would.
    known_projects: Option<HashSet<Uuid>>,
    unavailable: bool,
}

impl AccessLedger {
    pub fn memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(MemoryLedger::default())))
    }

    pub async fn ensure_access(
        &self,
        user_id: Uuid,
        project_id: Uuid,
    ) -> Result<GrantOutcome, LedgerError> {
        match self {
            Self::Postgres(pool) => {
                let result = sqlx::query(
                    r#"
                    INSERT INTO user_project_access (user_id, project_id, granted_at)
                    VALUES ($1, $2, now() AT TIME ZONE 'utc')
                    ON CONFLICT (user_id, project_id) DO NOTHING
                    "#,
                )
                .bind(user_id)
                .bind(project_id)
                .execute(pool)
                .await;

                match result {
                    Ok(done) if done.rows_affected() > 0 => Ok(GrantOutcome::Created),
                    Ok(_) => Ok(GrantOutcome::AlreadyGranted),
                    Err(sqlx::Error::Database(db_error)) if db_error.is_unique_violation() => {
                        Ok(GrantOutcome::AlreadyGranted)
                    }
                    Err(sqlx::Error::Database(db_error))
                        if db_error.is_foreign_key_violation() =>
                    {
                        Err(LedgerError::UnknownProject { user_id, project_id })
                    }
                    Err(error) => Err(LedgerError::Storage(
                        anyhow::Error::new(error).context("failed to record project access"),
                    )),
                }
            }
            Self::Memory(ledger) => {
                let mut guard = ledger.write().await;
                if guard.unavailable {
                    return Err(LedgerError::Storage(anyhow::anyhow!("access ledger unavailable")));
                }
                if guard.known_projects.as_ref().is_some_and(|known| !known.contains(&project_id))
                {
                    return Err(LedgerError::UnknownProject { user_id, project_id });
                }

                match guard.grants.entry((user_id, project_id)) {
                    std::collections::hash_map::Entry::Occupied(_) => {
                        Ok(GrantOutcome::AlreadyGranted)
                    }
                    std::collections::hash_map::Entry::Vacant(slot) => {
                        slot.insert(Utc::now());
                        Ok(GrantOutcome::Created)
                    }
                }
            }
        }
    }

    pub async fn grant(
        &self,
        user_id: Uuid,
        project_id: Uuid,
    ) -> anyhow::Result<Option<AccessGrant>> {
        match self {
            Self::Postgres(pool) => {
                let granted_at = sqlx::query_scalar::<_, Option<NaiveDateTime>>(
                    r#"
                    SELECT granted_at
                    FROM user_project_access
                    WHERE user_id = $1
                      AND project_id = $2
                    "#,
                )
                .bind(user_id)
                .bind(project_id)
                .fetch_optional(pool)
                .await
                .context("failed to query project access grant")?;

                Ok(granted_at.map(|granted_at| AccessGrant {
                    user_id,
                    project_id,
                    granted_at: granted_at.map(|at| at.and_utc()).unwrap_or_default(),
                }))
            }
            Self::Memory(ledger) => {
                let guard = ledger.read().await;
                Ok(guard.grants.get(&(user_id, project_id)).map(|granted_at| AccessGrant {
                    user_id,
                    project_id,
                    granted_at: *granted_at,
                }))
            }
        }
    }

    pub async fn has_access(&self, user_id: Uuid, project_id: Uuid) -> anyhow::Result<bool> {
        Ok(self.grant(user_id, project_id).await?.is_some())
    }

    /// Projects the user collaborates on, oldest grant first.
    pub async fn projects_for_user(&self, user_id: Uuid) -> anyhow::Result<Vec<AccessGrant>> {
        match self {
            Self::Postgres(pool) => {
                let rows = sqlx::query_as::<_, (Uuid, Option<NaiveDateTime>)>(
                    r#"
                    SELECT project_id, granted_at
                    FROM user_project_access
                    WHERE user_id = $1
                    ORDER BY granted_at ASC, project_id ASC
                    "#,
                )
                .bind(user_id)
                .fetch_all(pool)
                .await
                .context("failed to list project access grants")?;

                Ok(rows
                    .into_iter()
                    .map(|(project_id, granted_at)| AccessGrant {
                        user_id,
                        project_id,
                        granted_at: granted_at.map(|at| at.and_utc()).unwrap_or_default(),
                    })
                    .collect())
            }
            Self::Memory(ledger) => {
                let guard = ledger.read().await;
                let mut grants: Vec<AccessGrant> = guard
                    .grants
                    .iter()
                    .filter(|((grant_user, _), _)| *grant_user == user_id)
                    .map(|((_, project_id), granted_at)| AccessGrant {
                        user_id,
                        project_id: *project_id,
                        granted_at: *granted_at,
                    })
                    .collect();
                grants.sort_by(|left, right| {
                    left.granted_at
                        .cmp(&right.granted_at)
                        .then_with(|| left.project_id.cmp(&right.project_id))
                });
                Ok(grants)
            }
        }
    }

    /// Restrict the in-memory ledger to a fixed project set.
    pub async fn restrict_projects(&self, projects: impl IntoIterator<Item = Uuid>) {
        if let Self::Memory(ledger) = self {
            ledger.write().await.known_projects = Some(projects.into_iter().collect());
        }
    }

    #[cfg(test)]
    pub(crate) async fn set_unavailable_for_tests(&self, unavailable: bool) {
        if let Self::Memory(ledger) = self {
            ledger.write().await.unavailable = unavailable;
        }
    }

    #[cfg(test)]
    pub(crate) async fn grant_count_for_tests(&self) -> usize {
        match self {
            Self::Memory(ledger) => ledger.read().await.grants.len(),
            Self::Postgres(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AccessLedger, GrantOutcome, LedgerError};
    use crate::db::{
        migrations::run_migrations,
        pool::{create_pg_pool, PoolConfig},
    };
    use uuid::Uuid;

    #[tokio::test]
    async fn ensure_access_is_idempotent() {
        let ledger = AccessLedger::memory();
        let user_id = Uuid::new_v4();
        let project_id = Uuid::new_v4();

        let first = ledger.ensure_access(user_id, project_id).await.expect("first grant");
        let second = ledger.ensure_access(user_id, project_id).await.expect("second grant");

        assert_eq!(first, GrantOutcome::Created);
        assert_eq!(second, GrantOutcome::AlreadyGranted);
        assert_eq!(ledger.grant_count_for_tests().await, 1);
    }

    // The unique-violation fallback only exists on the Postgres path; see
    // `postgres_concurrent_ensure_access_stores_one_grant`.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_ensure_access_stores_one_grant() {
        let ledger = AccessLedger::memory();
        let user_id = Uuid::new_v4();
        let project_id = Uuid::new_v4();

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.ensure_access(user_id, project_id).await })
            })
            .collect();

        let mut created = 0;
        for attempt in attempts {
            let outcome = attempt.await.expect("grant task should complete").expect("grant");
            if outcome == GrantOutcome::Created {
                created += 1;
            }
        }

        assert_eq!(created, 1);
        assert_eq!(ledger.grant_count_for_tests().await, 1);
    }

    #[tokio::test]
    async fn grants_are_visible_to_readers_immediately() {
        let ledger = AccessLedger::memory();
        let user_id = Uuid::new_v4();
        let project_id = Uuid::new_v4();

        assert!(!ledger.has_access(user_id, project_id).await.expect("read"));
        ledger.ensure_access(user_id, project_id).await.expect("grant");
        assert!(ledger.has_access(user_id, project_id).await.expect("read"));

        let grant = ledger.grant(user_id, project_id).await.expect("read").expect("grant exists");
        assert_eq!(grant.user_id, user_id);
        assert_eq!(grant.project_id, project_id);
    }

    #[tokio::test]
    async fn projects_for_user_lists_only_that_users_grants() {
        let ledger = AccessLedger::memory();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        ledger.ensure_access(alice, first).await.expect("grant");
        ledger.ensure_access(alice, second).await.expect("grant");
        ledger.ensure_access(bob, first).await.expect("grant");

        let grants = ledger.projects_for_user(alice).await.expect("list");
        let mut projects: Vec<Uuid> = grants.iter().map(|grant| grant.project_id).collect();
        projects.sort();
        let mut expected = vec![first, second];
        expected.sort();
        assert_eq!(projects, expected);
        assert!(grants.iter().all(|grant| grant.user_id == alice));
    }

    #[tokio::test]
    async fn unknown_projects_are_reported_distinctly() {
        let ledger = AccessLedger::memory();
        let known = Uuid::new_v4();
        ledger.restrict_projects([known]).await;

        let error = ledger
            .ensure_access(Uuid::new_v4(), Uuid::new_v4())
            .await
            .expect_err("unknown project should fail");
        assert!(matches!(error, LedgerError::UnknownProject { .. }));
        assert_eq!(ledger.grant_count_for_tests().await, 0);
    }

    #[tokio::test]
    async fn storage_failures_surface_as_errors() {
        let ledger = AccessLedger::memory();
        ledger.set_unavailable_for_tests(true).await;

        let error = ledger
            .ensure_access(Uuid::new_v4(), Uuid::new_v4())
            .await
            .expect_err("unavailable ledger should fail");
        assert!(matches!(error, LedgerError::Storage(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn postgres_concurrent_ensure_access_stores_one_grant() {
        let Some(database_url) = std::env::var("COLLAB_RELAY_TEST_DATABASE_URL").ok() else {
            eprintln!("skipping ledger integration test: set COLLAB_RELAY_TEST_DATABASE_URL");
            return;
        };

        let pool = create_pg_pool(
            &database_url,
            PoolConfig { min_connections: 1, max_connections: 4, ..PoolConfig::default() },
        )
        .await
        .expect("pool should connect to test database");
        run_migrations(&pool).await.expect("migrations should apply");

        let user_id = Uuid::new_v4();
        let project_id = Uuid::new_v4();
        sqlx::query(r#"INSERT INTO "user" (id, username, email, password) VALUES ($1, $2, $3, $4)"#)
            .bind(user_id)
            .bind("ledger-test")
            .bind(format!("ledger-{}@example.test", Uuid::new_v4().simple()))
            .bind("not-a-real-hash")
            .execute(&pool)
            .await
            .expect("user should insert");
        sqlx::query("INSERT INTO project (id, name, owner_id) VALUES ($1, $2, $3)")
            .bind(project_id)
            .bind("Ledger Test Project")
            .bind(user_id)
            .execute(&pool)
            .await
            .expect("project should insert");

        let ledger = AccessLedger::Postgres(pool.clone());
        let attempts: Vec<_> = (0..4)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.ensure_access(user_id, project_id).await })
            })
            .collect();
        for attempt in attempts {
            attempt.await.expect("grant task should complete").expect("grant should succeed");
        }

        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM user_project_access WHERE user_id = $1 AND project_id = $2",
        )
        .bind(user_id)
        .bind(project_id)
        .fetch_one(&pool)
        .await
        .expect("count should succeed");
        assert_eq!(count, 1);
        assert!(ledger.has_access(user_id, project_id).await.expect("read"));

        let missing = ledger
            .ensure_access(user_id, Uuid::new_v4())
            .await
            .expect_err("missing project should violate the foreign key");
        assert!(matches!(missing, LedgerError::UnknownProject { .. }));
    }
}
