use super::{
    protocol::{bearer_from_protocol, first_offered_protocol, HandshakeState, Rejection},
    CollabState,
};
use crate::error::{current_request_id, request_id_from_headers_or_generate, with_request_id_scope};
use crate::identity::UserIdentity;
use crate::ledger::{GrantOutcome, LedgerError};
use crate::metrics;
use crate::room::{CloseSignal, ConnectionHandle, ConnectionInbox, MemberSummary, RoomRegistry};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::HeaderMap,
    response::Response,
};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Every admission decision is made here, before the upgrade completes.
/// The upgrade itself is always accepted so the client receives the close
/// code of a rejection rather than a failed HTTP handshake.
pub async fn ws_upgrade(
    Path(project_id): Path<Uuid>,
    State(state): State<CollabState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let request_id =
        current_request_id().unwrap_or_else(|| request_id_from_headers_or_generate(&headers));
    let offered = first_offered_protocol(&headers);
    let outcome = authorize(&state, project_id, offered.as_deref()).await;

    let ws = match offered {
        Some(protocol) => ws.protocols([protocol]),
        None => ws,
    }
    .max_message_size(state.max_message_bytes);

    match outcome {
        Ok(identity) => ws.on_upgrade(move |socket| {
            with_request_id_scope(request_id, run_connection(state, project_id, identity, socket))
        }),
        Err(rejection) => {
            metrics::increment_connections_rejected(rejection.metric_reason());
            if let Rejection::Internal(cause) = &rejection {
                error!(
                    project_id = %project_id,
                    request_id = %request_id,
                    state = %rejection.state(),
                    close_code = rejection.close_code(),
                    error = ?cause,
                    "collaboration handshake failed"
                );
            } else {
                warn!(
                    project_id = %project_id,
                    request_id = %request_id,
                    state = %rejection.state(),
                    close_code = rejection.close_code(),
                    reason = %rejection,
                    "collaboration handshake rejected"
                );
            }
            ws.on_upgrade(move |socket| reject(socket, rejection))
        }
    }
}

async fn authorize(
    state: &CollabState,
    project_id: Uuid,
    offered: Option<&str>,
) -> Result<UserIdentity, Rejection> {
    let bearer = bearer_from_protocol(offered)?;
    let claims = state.verifier.verify(bearer)?;

    let identity = state
        .directory
        .find_by_handle(&claims.subject)
        .await
        .map_err(Rejection::Internal)?
        .ok_or(Rejection::UnknownUser)?;

    match state.ledger.ensure_access(identity.id, project_id).await {
        Ok(GrantOutcome::Created) => {
            info!(project_id = %project_id, user_id = %identity.id, "recorded project access");
        }
        Ok(GrantOutcome::AlreadyGranted) => {}
        Err(LedgerError::UnknownProject { .. }) => return Err(Rejection::UnknownProject),
        Err(LedgerError::Storage(cause)) => return Err(Rejection::Internal(cause)),
    }

    debug!(
        project_id = %project_id,
        user_id = %identity.id,
        state = %HandshakeState::Admitted,
        "collaboration handshake accepted"
    );
    Ok(identity)
}

async fn reject(mut socket: WebSocket, rejection: Rejection) {
    let frame = CloseFrame { code: rejection.close_code(), reason: rejection.reason().into() };
    if let Err(error) = socket.send(Message::Close(Some(frame))).await {
        debug!(error = %error, "client left before the rejection close frame was sent");
    }
}

async fn run_connection(
    state: CollabState,
    project_id: Uuid,
    identity: UserIdentity,
    socket: WebSocket,
) {
    let member = MemberSummary::for_user(&identity);
    let connection_id = member.connection_id;
    let (handle, inbox) = ConnectionHandle::new(member, state.outbound_queue_capacity);

    state.registry.join(project_id, handle).await;
    metrics::increment_connections_admitted();
    info!(
        project_id = %project_id,
        user_id = %identity.id,
        username = %identity.username,
        connection_id = %connection_id,
        state = %HandshakeState::Relaying,
        "connection joined room"
    );

    let signal = relay(&state.registry, project_id, connection_id, socket, inbox).await;

    let removed = state.registry.leave(project_id, connection_id).await;
    info!(
        project_id = %project_id,
        user_id = %identity.id,
        connection_id = %connection_id,
        state = %HandshakeState::Closed,
        close_code = signal.map(|signal| signal.code),
        removed,
        "connection left room"
    );
}

/// Pump frames until either side goes away. Returns the close signal that
/// ended the loop, if the registry asked for it.
async fn relay(
    registry: &RoomRegistry,
    project_id: Uuid,
    connection_id: Uuid,
    mut socket: WebSocket,
    inbox: ConnectionInbox,
) -> Option<CloseSignal> {
    let ConnectionInbox { mut outbound, mut close } = inbox;

    loop {
        tokio::select! {
            biased;

            changed = close.changed() => {
                let signal = *close.borrow_and_update();
                match (changed, signal) {
                    (_, Some(signal)) => {
                        let frame = CloseFrame { code: signal.code, reason: signal.reason.into() };
                        let _ = socket.send(Message::Close(Some(frame))).await;
                        return Some(signal);
                    }
                    (Err(_), None) => return None,
                    (Ok(()), None) => {}
                }
            }
            maybe_outbound = outbound.recv() => {
                let Some(message) = maybe_outbound else {
                    return None;
                };
                if socket.send(message).await.is_err() {
                    return None;
                }
            }
            maybe_inbound = socket.recv() => {
                match maybe_inbound {
                    Some(Ok(message @ (Message::Text(_) | Message::Binary(_)))) => {
                        let delivered = registry.broadcast(project_id, connection_id, message).await;
                        trace!(
                            project_id = %project_id,
                            connection_id = %connection_id,
                            delivered,
                            "relayed message"
                        );
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => return None,
                    Some(Err(error)) => {
                        debug!(
                            project_id = %project_id,
                            connection_id = %connection_id,
                            error = %error,
                            "websocket receive failed"
                        );
                        return None;
                    }
                }
            }
        }
    }
}
