use std::{collections::HashMap, sync::Arc};

use derivative::Derivative;

use crate::engine::EngineRouter;

/// A named meeting room. Every member shares the same router.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Room {
    pub name: String,
    #[derivative(Debug = "ignore")]
    pub router: Arc<dyn EngineRouter>,
    members: Vec<String>,
}

impl Room {
    pub fn new(name: String, router: Arc<dyn EngineRouter>) -> Self {
        Self {
            name,
            router,
            members: Vec::new(),
        }
    }

    /// Returns false when the connection was already a member.
    pub fn add_member(&mut self, connection_id: &str) -> bool {
        if self.members.iter().any(|id| id == connection_id) {
            return false;
        }
        self.members.push(connection_id.to_owned());
        true
    }

    pub fn remove_member(&mut self, connection_id: &str) -> usize {
        self.members.retain(|id| id != connection_id);
        self.members.len()
    }

    pub fn is_member(&self, connection_id: &str) -> bool {
        self.members.iter().any(|id| id == connection_id)
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    /// Members in join order, excluding `connection_id`.
    pub fn peers_of(&self, connection_id: &str) -> Vec<String> {
        self.members
            .iter()
            .filter(|id| *id != connection_id)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<String, Room>,
}

impl RoomRegistry {
    pub fn get(&self, name: &str) -> Option<&Room> {
        self.rooms.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Room> {
        self.rooms.get_mut(name)
    }

    pub fn insert(&mut self, room: Room) {
        self.rooms.insert(room.name.clone(), room);
    }

    pub fn remove(&mut self, name: &str) -> Option<Room> {
        self.rooms.remove(name)
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn drain(&mut self) -> Vec<Room> {
        self.rooms.drain().map(|(_, room)| room).collect()
    }
}
