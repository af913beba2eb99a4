// Live collaboration rooms: project id -> connected members.
//
// The table lock is only held to look up, create or drop a room handle.
// Membership changes and fan-out serialize on the room's own mutex, so
// traffic in one project never contends with another. Nothing awaits I/O
// while a room is locked: delivery is a non-blocking push into each peer's
// bounded outbound queue, and the peer's own task performs the socket write.

use axum::extract::ws::{close_code, Message};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    watch, Mutex, RwLock,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{identity::UserIdentity, metrics};

pub const EVICTED_REASON: &str = "superseded by a newer connection";
pub const STALLED_REASON: &str = "outbound queue overflow";

/// Close request delivered to a connection task out of band, so it is seen
/// even when the outbound queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseSignal {
    pub code: u16,
    pub reason: &'static str,
}

impl CloseSignal {
    pub const EVICTED: Self = Self { code: close_code::NORMAL, reason: EVICTED_REASON };
    pub const STALLED: Self = Self { code: close_code::AGAIN, reason: STALLED_REASON };
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberSummary {
    pub connection_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    pub color: Option<String>,
    pub connected_at: DateTime<Utc>,
}

impl MemberSummary {
    pub fn for_user(user: &UserIdentity) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            user_id: user.id,
            username: user.username.clone(),
            color: user.color.clone(),
            connected_at: Utc::now(),
        }
    }
}

/// Registry-side end of a connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    member: MemberSummary,
    outbound: mpsc::Sender<Message>,
    closer: watch::Sender<Option<CloseSignal>>,
}

/// Task-side end of a connection.
#[derive(Debug)]
pub struct ConnectionInbox {
    pub outbound: mpsc::Receiver<Message>,
    pub close: watch::Receiver<Option<CloseSignal>>,
}

impl ConnectionHandle {
    pub fn new(member: MemberSummary, queue_capacity: usize) -> (Self, ConnectionInbox) {
        let (outbound_tx, outbound_rx) = mpsc::channel(queue_capacity.max(1));
        let (close_tx, close_rx) = watch::channel(None);

        (
            Self { member, outbound: outbound_tx, closer: close_tx },
            ConnectionInbox { outbound: outbound_rx, close: close_rx },
        )
    }

    pub fn id(&self) -> Uuid {
        self.member.connection_id
    }

    pub fn user_id(&self) -> Uuid {
        self.member.user_id
    }

    /// Ask the owning task to close the socket. Only the first signal sticks;
    /// signalling an already-closed connection is a no-op.
    pub fn close(&self, signal: CloseSignal) {
        self.closer.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(signal);
            true
        });
    }
}

#[derive(Debug, Default)]
struct Room {
    members: HashMap<Uuid, ConnectionHandle>,
    by_user: HashMap<Uuid, Uuid>,
    /// Set once the room has been dropped from the table; a `join` that
    /// locked it afterwards must retry against a fresh room.
    retired: bool,
}

impl Room {
    fn remove(&mut self, connection_id: Uuid) -> Option<ConnectionHandle> {
        let handle = self.members.remove(&connection_id)?;
        if self.by_user.get(&handle.user_id()) == Some(&connection_id) {
            self.by_user.remove(&handle.user_id());
        }
        Some(handle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PruneCause {
    Disconnected,
    Stalled,
}

#[derive(Debug, Clone, Default)]
pub struct RoomRegistry {
    rooms: Arc<RwLock<HashMap<Uuid, Arc<Mutex<Room>>>>>,
}

impl RoomRegistry {
    /// Admit a connection, evicting any earlier connection of the same user
    /// in this room first. Returns the evicted connection id.
    pub async fn join(&self, project_id: Uuid, connection: ConnectionHandle) -> Option<Uuid> {
        let mut connection = Some(connection);

        loop {
            let room = {
                let mut rooms = self.rooms.write().await;
                Arc::clone(rooms.entry(project_id).or_default())
            };

            let mut guard = room.lock().await;
            if guard.retired {
                continue;
            }

            let Some(connection) = connection.take() else {
                return None;
            };
            let user_id = connection.user_id();
            let connection_id = connection.id();

            let evicted = guard
                .by_user
                .get(&user_id)
                .copied()
                .and_then(|previous_id| guard.remove(previous_id));
            if let Some(previous) = &evicted {
                previous.close(CloseSignal::EVICTED);
                metrics::increment_connections_evicted();
                info!(
                    project_id = %project_id,
                    user_id = %user_id,
                    connection_id = %previous.id(),
                    superseded_by = %connection_id,
                    "evicted superseded connection"
                );
            }

            guard.by_user.insert(user_id, connection_id);
            guard.members.insert(connection_id, connection);

            return evicted.map(|previous| previous.id());
        }
    }

    /// Deliver `payload` to every member except `sender`. Peers whose queue
    /// is closed or full are pruned after the delivery pass. Returns the
    /// number of peers that accepted the payload.
    pub async fn broadcast(&self, project_id: Uuid, sender: Uuid, payload: Message) -> usize {
        let Some(room) = self.room(project_id).await else {
            return 0;
        };

        let mut guard = room.lock().await;
        if guard.retired {
            return 0;
        }

        let mut delivered = 0;
        let mut prune = Vec::new();
        for (connection_id, member) in &guard.members {
            if *connection_id == sender {
                continue;
            }

            match member.outbound.try_send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => prune.push((*connection_id, PruneCause::Stalled)),
                Err(TrySendError::Closed(_)) => {
                    prune.push((*connection_id, PruneCause::Disconnected))
                }
            }
        }

        for (connection_id, cause) in prune {
            let Some(pruned) = guard.remove(connection_id) else {
                continue;
            };
            metrics::increment_peers_pruned();
            match cause {
                PruneCause::Stalled => {
                    pruned.close(CloseSignal::STALLED);
                    warn!(
                        project_id = %project_id,
                        user_id = %pruned.user_id(),
                        connection_id = %connection_id,
                        "pruned peer with full outbound queue"
                    );
                }
                PruneCause::Disconnected => {
                    debug!(
                        project_id = %project_id,
                        user_id = %pruned.user_id(),
                        connection_id = %connection_id,
                        "pruned disconnected peer"
                    );
                }
            }
        }

        if guard.members.is_empty() {
            self.retire(project_id, &room, &mut guard).await;
        }

        metrics::add_messages_relayed(delivered as u64);
        delivered
    }

    /// Remove a connection. Unknown rooms and connections are a no-op.
    pub async fn leave(&self, project_id: Uuid, connection_id: Uuid) -> bool {
        let Some(room) = self.room(project_id).await else {
            return false;
        };

        let mut guard = room.lock().await;
        let removed = guard.remove(connection_id).is_some();
        if guard.members.is_empty() && !guard.retired {
            self.retire(project_id, &room, &mut guard).await;
        }

        removed
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn connection_count(&self) -> usize {
        let rooms: Vec<_> = self.rooms.read().await.values().cloned().collect();
        let mut total = 0;
        for room in rooms {
            total += room.lock().await.members.len();
        }
        total
    }

    pub async fn member_count(&self, project_id: Uuid) -> usize {
        match self.room(project_id).await {
            Some(room) => room.lock().await.members.len(),
            None => 0,
        }
    }

    /// Members of a room, earliest connection first.
    pub async fn members(&self, project_id: Uuid) -> Vec<MemberSummary> {
        let Some(room) = self.room(project_id).await else {
            return Vec::new();
        };

        let guard = room.lock().await;
        let mut members: Vec<MemberSummary> =
            guard.members.values().map(|handle| handle.member.clone()).collect();
        members.sort_by(|left, right| {
            left.connected_at
                .cmp(&right.connected_at)
                .then_with(|| left.connection_id.cmp(&right.connection_id))
        });
        members
    }

    pub async fn contains(&self, project_id: Uuid, connection_id: Uuid) -> bool {
        match self.room(project_id).await {
            Some(room) => room.lock().await.members.contains_key(&connection_id),
            None => false,
        }
    }

    async fn room(&self, project_id: Uuid) -> Option<Arc<Mutex<Room>>> {
        self.rooms.read().await.get(&project_id).cloned()
    }

    async fn retire(&self, project_id: Uuid, room: &Arc<Mutex<Room>>, guard: &mut Room) {
        guard.retired = true;
        let mut rooms = self.rooms.write().await;
        if rooms.get(&project_id).is_some_and(|current| Arc::ptr_eq(current, room)) {
            rooms.remove(&project_id);
            debug!(project_id = %project_id, "room closed");
        }
    }
}
