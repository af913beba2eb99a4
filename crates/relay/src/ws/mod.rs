pub mod handler;
pub mod protocol;

use crate::{
    auth::jwt::JwtTokenVerifier, identity::UserDirectory, ledger::AccessLedger,
    room::RoomRegistry,
};
use axum::{routing::get, Router};
use std::sync::Arc;

/// Everything a collaboration socket needs from the rest of the relay.
#[derive(Clone)]
pub struct CollabState {
    pub verifier: Arc<JwtTokenVerifier>,
    pub directory: UserDirectory,
    pub ledger: AccessLedger,
    pub registry: RoomRegistry,
    pub outbound_queue_capacity: usize,
    pub max_message_bytes: usize,
}

pub fn router(state: CollabState) -> Router {
    Router::new()
        .route("/collaboration/{project_id}/ws", get(handler::ws_upgrade))
        .with_state(state)
}
