//! Private rooms started by their admin

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::config::MATCH_CAPACITY;
use crate::game::{InstanceError, InstanceManager, MatchHandle, MatchMember};
use crate::ws::protocol::{GameMode, RoomMember, ServerMsg};
use crate::ws::session::SessionHub;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    #[error("Already in a room")]
    AlreadyInRoom,

    #[error("Room not found")]
    NotFound,

    #[error("Not in a room")]
    NotInRoom,

    #[error("Room is full")]
    Full,

    #[error("Only the room admin can start the match")]
    NotAdmin,

    #[error("Not every member is ready")]
    NotAllReady,

    #[error("Already in a match")]
    InMatch,

    #[error(transparent)]
    Instance(#[from] InstanceError),
}

#[derive(Debug, Clone)]
struct Room {
    id: Uuid,
    admin: Uuid,
    members: Vec<RoomMember>,
}

impl Room {
    fn update(&self) -> ServerMsg {
        ServerMsg::RoomUpdate {
            room_id: self.id,
            admin: self.admin,
            members: self.members.clone(),
        }
    }
}

#[derive(Default)]
struct Rooms {
    rooms: HashMap<Uuid, Room>,
    member_of: HashMap<Uuid, Uuid>,
}

pub struct RoomService {
    inner: Mutex<Rooms>,
    sessions: Arc<SessionHub>,
    instances: Arc<InstanceManager>,
}

impl RoomService {
    pub fn new(sessions: Arc<SessionHub>, instances: Arc<InstanceManager>) -> Self {
        Self {
            inner: Mutex::new(Rooms::default()),
            sessions,
            instances,
        }
    }

    /// Create a room with the caller as admin
    pub fn create(&self, user_id: Uuid, display_name: String) -> Result<Uuid, RoomError> {
        if self.instances.registry().match_of(user_id).is_some() {
            return Err(RoomError::InMatch);
        }
        let mut inner = self.inner.lock();
        if inner.member_of.contains_key(&user_id) {
            return Err(RoomError::AlreadyInRoom);
        }

        let room = Room {
            id: Uuid::new_v4(),
            admin: user_id,
            members: vec![RoomMember {
                user_id,
                display_name,
                ready: false,
            }],
        };
        let room_id = room.id;
        inner.member_of.insert(user_id, room_id);
        self.publish(&room);
        inner.rooms.insert(room_id, room);

        info!(room_id = %room_id, admin = %user_id, "Room created");
        Ok(room_id)
    }

    pub fn join(&self, user_id: Uuid, display_name: String, room_id: Uuid) -> Result<(), RoomError> {
        if self.instances.registry().match_of(user_id).is_some() {
            return Err(RoomError::InMatch);
        }
        let mut inner = self.inner.lock();
        if inner.member_of.contains_key(&user_id) {
            return Err(RoomError::AlreadyInRoom);
        }
        let room = inner.rooms.get_mut(&room_id).ok_or(RoomError::NotFound)?;
        if room.members.len() >= MATCH_CAPACITY {
            return Err(RoomError::Full);
        }
        room.members.push(RoomMember {
            user_id,
            display_name,
            ready: false,
        });
        let room = room.clone();
        inner.member_of.insert(user_id, room_id);
        self.publish(&room);

        info!(room_id = %room_id, identity = %user_id, "Joined room");
        Ok(())
    }

    /// Leave the current room. The admin role passes to the next member and
    /// an empty room is destroyed.
    pub fn leave(&self, user_id: Uuid) -> Result<(), RoomError> {
        let mut inner = self.inner.lock();
        let room_id = inner.member_of.remove(&user_id).ok_or(RoomError::NotInRoom)?;
        let Some(room) = inner.rooms.get_mut(&room_id) else {
            return Ok(());
        };

        room.members.retain(|m| m.user_id != user_id);
        if room.members.is_empty() {
            inner.rooms.remove(&room_id);
            info!(room_id = %room_id, "Room closed");
            return Ok(());
        }
        if room.admin == user_id {
            room.admin = room.members[0].user_id;
            info!(room_id = %room_id, admin = %room.admin, "Room admin migrated");
        }
        let room = room.clone();
        self.publish(&room);
        Ok(())
    }

    /// Flip the caller's ready flag, returning the new value
    pub fn toggle_ready(&self, user_id: Uuid) -> Result<bool, RoomError> {
        let mut inner = self.inner.lock();
        let room_id = *inner.member_of.get(&user_id).ok_or(RoomError::NotInRoom)?;
        let room = inner.rooms.get_mut(&room_id).ok_or(RoomError::NotFound)?;
        let member = room
            .members
            .iter_mut()
            .find(|m| m.user_id == user_id)
            .ok_or(RoomError::NotInRoom)?;
        member.ready = !member.ready;
        let ready = member.ready;
        let room = room.clone();
        self.publish(&room);
        Ok(ready)
    }

    /// Start a custom match from the room. Admin only, every member ready.
    pub fn start(&self, user_id: Uuid) -> Result<MatchHandle, RoomError> {
        let mut inner = self.inner.lock();
        let room_id = *inner.member_of.get(&user_id).ok_or(RoomError::NotInRoom)?;
        let room = inner.rooms.get(&room_id).ok_or(RoomError::NotFound)?;
        if room.admin != user_id {
            return Err(RoomError::NotAdmin);
        }
        if !room.members.iter().all(|m| m.ready) {
            return Err(RoomError::NotAllReady);
        }

        let members: Vec<MatchMember> = room
            .members
            .iter()
            .map(|m| MatchMember {
                identity: m.user_id,
                display_name: m.display_name.clone(),
            })
            .collect();
        let handle = self
            .instances
            .create(members, GameMode::Custom, Some(user_id), None)?;

        if let Some(room) = inner.rooms.remove(&room_id) {
            for member in &room.members {
                inner.member_of.remove(&member.user_id);
            }
        }
        info!(room_id = %room_id, match_id = %handle.id, "Room started");
        Ok(handle)
    }

    pub fn room_of(&self, user_id: Uuid) -> Option<Uuid> {
        self.inner.lock().member_of.get(&user_id).copied()
    }

    pub fn room_count(&self) -> usize {
        self.inner.lock().rooms.len()
    }

    fn publish(&self, room: &Room) {
        let update = room.update();
        for member in &room.members {
            self.sessions.send(member.user_id, update.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GameTuning;
    use crate::game::MatchRegistry;
    use crate::store::InMemoryProfileStore;
    use tokio::sync::mpsc;

    fn service() -> (RoomService, Arc<SessionHub>, Arc<MatchRegistry>) {
        let registry = Arc::new(MatchRegistry::new());
        let sessions = Arc::new(SessionHub::new());
        let instances = Arc::new(InstanceManager::new(
            registry.clone(),
            sessions.clone(),
            Arc::new(InMemoryProfileStore::new()),
            Arc::new(GameTuning::default()),
        ));
        (RoomService::new(sessions.clone(), instances), sessions, registry)
    }

    fn last_update(rx: &mut mpsc::Receiver<ServerMsg>) -> Option<(Uuid, usize)> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|m| match m {
                ServerMsg::RoomUpdate { admin, members, .. } => Some((admin, members.len())),
                _ => None,
            })
            .last()
    }

    #[test]
    fn admin_migrates_and_empty_room_closes() {
        let (rooms, sessions, _) = service();
        let (admin, guest) = (Uuid::new_v4(), Uuid::new_v4());
        let (tx, mut guest_rx) = mpsc::channel(64);
        sessions.register(guest, "Guest".into(), tx);

        let room_id = rooms.create(admin, "Admin".into()).unwrap();
        rooms.join(guest, "Guest".into(), room_id).unwrap();
        assert_eq!(rooms.join(guest, "Guest".into(), room_id), Err(RoomError::AlreadyInRoom));

        rooms.leave(admin).unwrap();
        assert_eq!(last_update(&mut guest_rx), Some((guest, 1)));

        rooms.leave(guest).unwrap();
        assert_eq!(rooms.room_count(), 0);
        assert_eq!(rooms.leave(guest), Err(RoomError::NotInRoom));
    }

    #[tokio::test]
    async fn start_requires_admin_and_everyone_ready() {
        let (rooms, sessions, registry) = service();
        let (admin, guest) = (Uuid::new_v4(), Uuid::new_v4());
        let (tx_a, _rx_a) = mpsc::channel(10_000);
        let (tx_g, _rx_g) = mpsc::channel(10_000);
        sessions.register(admin, "Admin".into(), tx_a);
        sessions.register(guest, "Guest".into(), tx_g);

        let room_id = rooms.create(admin, "Admin".into()).unwrap();
        rooms.join(guest, "Guest".into(), room_id).unwrap();

        assert_eq!(rooms.start(guest).err(), Some(RoomError::NotAdmin));
        assert!(rooms.toggle_ready(admin).unwrap());
        assert_eq!(rooms.start(admin).err(), Some(RoomError::NotAllReady));
        assert!(rooms.toggle_ready(guest).unwrap());

        let Ok(handle) = rooms.start(admin) else {
            panic!("room should start");
        };
        assert_eq!(handle.record.mode, GameMode::Custom);
        assert_eq!(handle.record.admin, Some(admin));
        assert_eq!(registry.match_of(guest).map(|h| h.id), Some(handle.id));
        assert_eq!(rooms.room_of(admin), None);
        assert_eq!(rooms.room_count(), 0);
    }

    #[test]
    fn full_room_rejects_joins() {
        let (rooms, _, _) = service();
        let room_id = rooms.create(Uuid::new_v4(), "Admin".into()).unwrap();
        for _ in 1..MATCH_CAPACITY {
            rooms.join(Uuid::new_v4(), "P".into(), room_id).unwrap();
        }
        assert_eq!(
            rooms.join(Uuid::new_v4(), "Late".into(), room_id),
            Err(RoomError::Full)
        );
    }
}
