// Read-only REST views over project access grants and live presence.

use axum::{
    extract::{Extension, Path, State},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::{
    auth::middleware::{require_bearer_auth, AuthenticatedUser, BearerAuth},
    error::{ErrorCode, RelayError},
    ledger::{AccessGrant, AccessLedger},
    room::RoomRegistry,
};

#[derive(Clone)]
struct ApiState {
    ledger: AccessLedger,
    registry: RoomRegistry,
}

#[derive(Debug)]
enum ApiError {
    Forbidden { project_id: Uuid },
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        Self::Internal(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Forbidden { project_id } => {
                RelayError::new(ErrorCode::AuthForbidden, "caller has not joined this project")
                    .with_details(json!({ "project_id": project_id }))
                    .into_response()
            }
            Self::Internal(error) => {
                tracing::error!(error = ?error, "project api internal error");
                RelayError::internal().into_response()
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct ProjectAccessEnvelope {
    project_id: Uuid,
    user_id: Uuid,
    granted_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct SharedProject {
    project_id: Uuid,
    granted_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct SharedProjectsEnvelope {
    items: Vec<SharedProject>,
}

#[derive(Debug, Serialize)]
struct PresenceMember {
    user_id: Uuid,
    username: String,
    color: Option<String>,
    connected_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct PresenceEnvelope {
    project_id: Uuid,
    members: Vec<PresenceMember>,
}

pub fn router(auth: BearerAuth, ledger: AccessLedger, registry: RoomRegistry) -> Router {
    Router::new()
        .route("/v1/projects/shared", get(list_shared_projects))
        .route("/v1/projects/{project_id}/access", get(get_project_access))
        .route("/v1/projects/{project_id}/presence", get(get_project_presence))
        .with_state(ApiState { ledger, registry })
        .route_layer(middleware::from_fn_with_state(auth, require_bearer_auth))
}

async fn get_project_access(
    State(state): State<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(project_id): Path<Uuid>,
) -> Result<Json<ProjectAccessEnvelope>, ApiError> {
    let AccessGrant { user_id, project_id, granted_at } =
        require_grant(&state.ledger, user.user_id, project_id).await?;

    Ok(Json(ProjectAccessEnvelope { project_id, user_id, granted_at }))
}

async fn list_shared_projects(
    State(state): State<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<SharedProjectsEnvelope>, ApiError> {
    let items = state
        .ledger
        .projects_for_user(user.user_id)
        .await?
        .into_iter()
        .map(|grant| SharedProject { project_id: grant.project_id, granted_at: grant.granted_at })
        .collect();

    Ok(Json(SharedProjectsEnvelope { items }))
}

async fn get_project_presence(
    State(state): State<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(project_id): Path<Uuid>,
) -> Result<Json<PresenceEnvelope>, ApiError> {
    require_grant(&state.ledger, user.user_id, project_id).await?;

    let members = state
        .registry
        .members(project_id)
        .await
        .into_iter()
        .map(|member| PresenceMember {
            user_id: member.user_id,
            username: member.username,
            color: member.color,
            connected_at: member.connected_at,
        })
        .collect();

    Ok(Json(PresenceEnvelope { project_id, members }))
}

async fn require_grant(
    ledger: &AccessLedger,
    user_id: Uuid,
    project_id: Uuid,
) -> Result<AccessGrant, ApiError> {
    ledger
        .grant(user_id, project_id)
        .await?
        .ok_or(ApiError::Forbidden { project_id })
}

#[cfg(test)]
mod tests {
    use super::router;
    use crate::{
        auth::{jwt::JwtTokenVerifier, middleware::BearerAuth},
        identity::{UserDirectory, UserIdentity},
        ledger::AccessLedger,
        room::{ConnectionHandle, MemberSummary, RoomRegistry},
    };
    use axum::{
        body::{to_bytes, Body},
        http::{header::AUTHORIZATION, Request, StatusCode},
        Router,
    };
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;
    use uuid::Uuid;

    const TEST_SECRET: &str = "collab_test_secret_that_is_definitely_long_enough";

    struct Fixture {
        app: Router,
        ledger: AccessLedger,
        registry: RoomRegistry,
        alice: UserIdentity,
        token: String,
    }

    async fn fixture() -> Fixture {
        let verifier = Arc::new(JwtTokenVerifier::new(TEST_SECRET).expect("verifier"));
        let directory = UserDirectory::memory();
        let alice = UserIdentity {
            id: Uuid::new_v4(),
            email: "alice@example.com".to_owned(),
            username: "alice".to_owned(),
            color: Some("#3366ff".to_owned()),
        };
        directory.insert(alice.clone()).await;
        let token = verifier.issue_token(&alice.email).expect("token");

        let ledger = AccessLedger::memory();
        let registry = RoomRegistry::default();
        let app = router(BearerAuth { verifier, directory }, ledger.clone(), registry.clone());

        Fixture { app, ledger, registry, alice, token }
    }

    async fn get(app: &Router, uri: &str, token: Option<&str>) -> (StatusCode, Value) {
        let mut builder = Request::builder().uri(uri);
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let response = app
            .clone()
            .oneshot(builder.body(Body::empty()).expect("request should build"))
            .await
            .expect("request should return a response");
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        (status, serde_json::from_slice(&body).expect("json body"))
    }

    #[tokio::test]
    async fn access_requires_bearer_token() {
        let fx = fixture().await;

        let (status, body) = get(&fx.app, &format!("/v1/projects/{}/access", Uuid::new_v4()), None).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "AUTH_INVALID_TOKEN");
    }

    #[tokio::test]
    async fn access_without_grant_is_forbidden() {
        let fx = fixture().await;

        let project_id = Uuid::new_v4();

        let (status, body) =
            get(&fx.app, &format!("/v1/projects/{project_id}/access"), Some(&fx.token)).await;

        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["code"], "AUTH_FORBIDDEN");
        assert_eq!(body["error"]["details"]["project_id"], project_id.to_string());
    }

    #[tokio::test]
    async fn access_returns_existing_grant() {
        let fx = fixture().await;
        let project_id = Uuid::new_v4();
        fx.ledger.ensure_access(fx.alice.id, project_id).await.expect("grant");

        let (status, body) =
            get(&fx.app, &format!("/v1/projects/{project_id}/access"), Some(&fx.token)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["project_id"], project_id.to_string());
        assert_eq!(body["user_id"], fx.alice.id.to_string());
        assert!(body["granted_at"].is_string());
    }

    #[tokio::test]
    async fn shared_lists_only_the_callers_grants() {
        let fx = fixture().await;
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        fx.ledger.ensure_access(fx.alice.id, first).await.expect("grant");
        fx.ledger.ensure_access(fx.alice.id, second).await.expect("grant");
        fx.ledger.ensure_access(Uuid::new_v4(), Uuid::new_v4()).await.expect("grant");

        let (status, body) = get(&fx.app, "/v1/projects/shared", Some(&fx.token)).await;

        assert_eq!(status, StatusCode::OK);
        let items = body["items"].as_array().expect("items array");
        assert_eq!(items.len(), 2);
        let ids: Vec<&str> = items.iter().filter_map(|item| item["project_id"].as_str()).collect();
        assert!(ids.contains(&first.to_string().as_str()));
        assert!(ids.contains(&second.to_string().as_str()));
    }

    #[tokio::test]
    async fn presence_lists_live_members() {
        let fx = fixture().await;
        let project_id = Uuid::new_v4();
        fx.ledger.ensure_access(fx.alice.id, project_id).await.expect("grant");
        let (handle, _inbox) = ConnectionHandle::new(MemberSummary::for_user(&fx.alice), 4);
        fx.registry.join(project_id, handle).await;

        let (status, body) =
            get(&fx.app, &format!("/v1/projects/{project_id}/presence"), Some(&fx.token)).await;

        assert_eq!(status, StatusCode::OK);
        let members = body["members"].as_array().expect("members array");
        assert_eq!(members.len(), 1);
        assert_eq!(members[0]["username"], "alice");
        assert_eq!(members[0]["color"], "#3366ff");
    }

    #[tokio::test]
    async fn presence_requires_a_grant() {
        let fx = fixture().await;

        let (status, _) =
            get(&fx.app, &format!("/v1/projects/{}/presence", Uuid::new_v4()), Some(&fx.token))
                .await;

        assert_eq!(status, StatusCode::FORBIDDEN);
    }
}
