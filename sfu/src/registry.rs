//! Id-keyed tables of the engine resources every connection owns.
use std::{collections::HashMap, sync::Arc};

use derivative::Derivative;
use strum_macros::Display;

use crate::engine::{EngineConsumer, EngineProducer, EngineTransport, MediaKind};

/// Implemented by every record so a [`Registry`] can answer ownership queries.
pub trait Owned {
    fn id(&self) -> &str;
    fn connection_id(&self) -> &str;
    fn room_name(&self) -> &str;
}

/// Records are kept in insertion order so that room-wide listings are stable.
#[derive(Debug)]
pub struct Registry<T> {
    entries: HashMap<String, T>,
    order: Vec<String>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }
}

impl<T: Owned> Registry<T> {
    pub fn insert(&mut self, record: T) {
        let id = record.id().to_owned();
        if self.entries.insert(id.clone(), record).is_none() {
            self.order.push(id);
        }
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut T> {
        self.entries.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<T> {
        let record = self.entries.remove(id)?;
        self.order.retain(|entry| entry != id);
        Some(record)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.order.iter().filter_map(|id| self.entries.get(id))
    }

    pub fn in_room<'a>(&'a self, room_name: &'a str) -> impl Iterator<Item = &'a T> + 'a {
        self.iter().filter(move |record| record.room_name() == room_name)
    }

    /// Removes and returns every record owned by `connection_id`, oldest first.
    pub fn drain_owned_by(&mut self, connection_id: &str) -> Vec<T> {
        let ids: Vec<String> = self
            .iter()
            .filter(|record| record.connection_id() == connection_id)
            .map(|record| record.id().to_owned())
            .collect();
        ids.iter().filter_map(|id| self.remove(id)).collect()
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

/// Negotiation progress of a transport. Records are registered once the engine has handed out
/// their parameters, so they start at `ParametersExchanged`. `Closed` is terminal and lasts until
/// the record is torn down.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    ParametersExchanged,
    Connected,
    Closed,
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct TransportRecord {
    pub id: String,
    pub connection_id: String,
    pub room_name: String,
    pub direction: Direction,
    pub state: TransportState,
    #[derivative(Debug = "ignore")]
    pub handle: Arc<dyn EngineTransport>,
}

impl Owned for TransportRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn room_name(&self) -> &str {
        &self.room_name
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct ProducerRecord {
    pub id: String,
    pub connection_id: String,
    pub room_name: String,
    pub kind: MediaKind,
    pub transport_id: String,
    pub app_data: serde_json::Value,
    #[derivative(Debug = "ignore")]
    pub handle: Arc<dyn EngineProducer>,
}

impl Owned for ProducerRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn room_name(&self) -> &str {
        &self.room_name
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct ConsumerRecord {
    pub id: String,
    pub connection_id: String,
    pub room_name: String,
    pub producer_id: String,
    pub transport_id: String,
    #[derivative(Debug = "ignore")]
    pub handle: Arc<dyn EngineConsumer>,
}

impl Owned for ConsumerRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn room_name(&self) -> &str {
        &self.room_name
    }
}
