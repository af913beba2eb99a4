// Maps the handle carried in an access token to the account record.
//
// Accounts are owned by the external user service; the relay only reads
// them. A missing account is an expected outcome (deleted after the token
// was issued), not an error.

use anyhow::Context;
use serde::Serialize;
use sqlx::PgPool;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserIdentity {
    pub id: Uuid,
    pub email: String,
    pub username: String,
    /// Cursor color chosen by the user, if any.
    pub color: Option<String>,
}

#[derive(Clone)]
pub enum UserDirectory {
    Postgres(PgPool),
    Memory(Arc<RwLock<HashMap<String, UserIdentity>>>),
}

impl UserDirectory {
    pub fn memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(HashMap::new())))
    }

    pub async fn find_by_handle(&self, handle: &str) -> anyhow::Result<Option<UserIdentity>> {
        match self {
            Self::Postgres(pool) => {
                let row = sqlx::query_as::<_, (Uuid, String, String, Option<String>)>(
                    r#"
                    SELECT id, email, username, color
                    FROM "user"
                    WHERE email = $1
                    "#,
                )
                .bind(handle)
                .fetch_optional(pool)
                .await
                .context("failed to look up user by email")?;

                Ok(row.map(|(id, email, username, color)| UserIdentity {
                    id,
                    email,
                    username,
                    color,
                }))
            }
            Self::Memory(users) => Ok(users.read().await.get(handle).cloned()),
        }
    }

    /// Seed an account into the in-memory directory. No-op for Postgres,
    /// where accounts are created by the user service.
    pub async fn insert(&self, identity: UserIdentity) {
        if let Self::Memory(users) = self {
            users.write().await.insert(identity.email.clone(), identity);
        }
    }

    #[cfg(test)]
    pub(crate) async fn remove(&self, handle: &str) {
        if let Self::Memory(users) = self {
            users.write().await.remove(handle);
        }
    }
}
