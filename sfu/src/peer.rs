use std::collections::HashMap;

/// Display metadata shown to the other peers of a room.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerDetails {
    pub display_name: String,
    pub is_admin: bool,
}

/// Per-connection membership and resource ownership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSession {
    pub connection_id: String,
    pub room_name: String,
    pub transport_ids: Vec<String>,
    pub producer_ids: Vec<String>,
    pub consumer_ids: Vec<String>,
    pub details: PeerDetails,
}

impl PeerSession {
    pub fn new(connection_id: String, room_name: String) -> Self {
        Self {
            connection_id,
            room_name,
            transport_ids: Vec::new(),
            producer_ids: Vec::new(),
            consumer_ids: Vec::new(),
            details: PeerDetails::default(),
        }
    }

    pub fn forget_transport(&mut self, transport_id: &str) {
        self.transport_ids.retain(|id| id != transport_id);
    }

    pub fn forget_producer(&mut self, producer_id: &str) {
        self.producer_ids.retain(|id| id != producer_id);
    }

    pub fn forget_consumer(&mut self, consumer_id: &str) {
        self.consumer_ids.retain(|id| id != consumer_id);
    }

    pub fn owns_nothing(&self) -> bool {
        self.transport_ids.is_empty() && self.producer_ids.is_empty() && self.consumer_ids.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct PeerTable {
    sessions: HashMap<String, PeerSession>,
}

impl PeerTable {
    /// Replaces any previous session of the connection.
    pub fn insert(&mut self, session: PeerSession) -> Option<PeerSession> {
        self.sessions.insert(session.connection_id.clone(), session)
    }

    pub fn get(&self, connection_id: &str) -> Option<&PeerSession> {
        self.sessions.get(connection_id)
    }

    pub fn get_mut(&mut self, connection_id: &str) -> Option<&mut PeerSession> {
        self.sessions.get_mut(connection_id)
    }

    pub fn remove(&mut self, connection_id: &str) -> Option<PeerSession> {
        self.sessions.remove(connection_id)
    }

    pub fn contains(&self, connection_id: &str) -> bool {
        self.sessions.contains_key(connection_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
