//! Room membership for one namespace.
//!
//! Rooms are process-local, namespace-scoped broadcast groups. The forward
//! map answers "who is in this room", the reverse map makes socket
//! teardown proportional to the number of rooms the socket joined.

use std::{
    collections::{HashMap, HashSet},
    sync::RwLock,
};

use enginemux::Sid;

/// A room identifier.
pub type Room = String;

/// Types accepted wherever one or many rooms can be passed.
pub trait RoomParam: 'static {
    type IntoIter: Iterator<Item = Room>;
    fn into_room_iter(self) -> Self::IntoIter;
}

impl RoomParam for Room {
    type IntoIter = std::iter::Once<Room>;
    fn into_room_iter(self) -> Self::IntoIter {
        std::iter::once(self)
    }
}

impl RoomParam for &'static str {
    type IntoIter = std::iter::Once<Room>;
    fn into_room_iter(self) -> Self::IntoIter {
        std::iter::once(self.to_string())
    }
}

impl RoomParam for Vec<Room> {
    type IntoIter = std::vec::IntoIter<Room>;
    fn into_room_iter(self) -> Self::IntoIter {
        self.into_iter()
    }
}

impl<const N: usize> RoomParam for [&'static str; N] {
    type IntoIter = std::iter::Map<std::array::IntoIter<&'static str, N>, fn(&'static str) -> Room>;
    fn into_room_iter(self) -> Self::IntoIter {
        self.into_iter().map(str::to_string)
    }
}

#[derive(Debug, Default)]
struct RoomMaps {
    forward: HashMap<Room, HashSet<Sid>>,
    reverse: HashMap<Sid, HashSet<Room>>,
}

/// The room registry of a namespace.
#[derive(Debug, Default)]
pub(crate) struct Rooms {
    maps: RwLock<RoomMaps>,
}

impl Rooms {
    /// Join the socket to every given room, creating rooms on demand.
    pub(crate) fn join(&self, sid: Sid, rooms: impl RoomParam) {
        let mut maps = self.maps.write().unwrap();
        for room in rooms.into_room_iter() {
            maps.forward.entry(room.clone()).or_default().insert(sid);
            maps.reverse.entry(sid).or_default().insert(room);
        }
    }

    /// Remove the socket from the given rooms; absent memberships are
    /// ignored.
    pub(crate) fn leave(&self, sid: Sid, rooms: impl RoomParam) {
        let mut maps = self.maps.write().unwrap();
        for room in rooms.into_room_iter() {
            if let Some(members) = maps.forward.get_mut(&room) {
                members.remove(&sid);
                if members.is_empty() {
                    maps.forward.remove(&room);
                }
            }
            if let Some(rooms) = maps.reverse.get_mut(&sid) {
                rooms.remove(&room);
            }
        }
    }

    /// Drop every membership of the socket; runs in O(joined rooms).
    pub(crate) fn leave_all(&self, sid: Sid) {
        let mut maps = self.maps.write().unwrap();
        if let Some(rooms) = maps.reverse.remove(&sid) {
            for room in rooms {
                if let Some(members) = maps.forward.get_mut(&room) {
                    members.remove(&sid);
                    if members.is_empty() {
                        maps.forward.remove(&room);
                    }
                }
            }
        }
    }

    /// The rooms the socket has joined.
    pub(crate) fn rooms_of(&self, sid: Sid) -> Vec<Room> {
        self.maps
            .read()
            .unwrap()
            .reverse
            .get(&sid)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of the members of the union of `rooms`, taken at call
    /// time. Sockets joining afterwards are not included.
    pub(crate) fn members_of(&self, rooms: &[Room]) -> HashSet<Sid> {
        let maps = self.maps.read().unwrap();
        let mut members = HashSet::new();
        for room in rooms {
            if let Some(sids) = maps.forward.get(room) {
                members.extend(sids);
            }
        }
        members
    }
}
