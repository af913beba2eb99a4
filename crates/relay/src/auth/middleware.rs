use crate::{
    auth::jwt::JwtTokenVerifier,
    error::{ErrorCode, RelayError},
    identity::UserDirectory,
};
use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: uuid::Uuid,
    pub email: String,
}

#[derive(Clone)]
pub struct BearerAuth {
    pub verifier: Arc<JwtTokenVerifier>,
    pub directory: UserDirectory,
}

pub async fn require_bearer_auth(
    State(auth): State<BearerAuth>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = match request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token)
    {
        Some(token) => token,
        None => return unauthorized_response("missing bearer token"),
    };

    let claims = match auth.verifier.verify(token) {
        Ok(claims) => claims,
        Err(_) => return unauthorized_response("invalid bearer token"),
    };

    let identity = match auth.directory.find_by_handle(&claims.subject).await {
        Ok(Some(identity)) => identity,
        Ok(None) => return unauthorized_response("unknown account"),
        Err(error) => {
            tracing::error!(error = ?error, "user directory lookup failed");
            return RelayError::internal().into_response();
        }
    };

    request
        .extensions_mut()
        .insert(AuthenticatedUser { user_id: identity.id, email: identity.email });

    next.run(request).await
}

fn extract_bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;

    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }

    let token = token.trim();
    if token.is_empty() {
        return None;
    }

    Some(token)
}

fn unauthorized_response(message: &'static str) -> Response {
    RelayError::new(ErrorCode::AuthInvalidToken, message).into_response()
}
