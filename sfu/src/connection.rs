use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::signaling::message::ServerMessage;

/// Live outbound channels, resolved by connection id. Domain records never hold them.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    connections: HashMap<String, mpsc::UnboundedSender<ServerMessage>>,
}

impl ConnectionTable {
    pub fn register(
        &mut self,
        connection_id: String,
        sender: mpsc::UnboundedSender<ServerMessage>,
    ) {
        self.connections.insert(connection_id, sender);
    }

    pub fn unregister(&mut self, connection_id: &str) -> bool {
        self.connections.remove(connection_id).is_some()
    }

    pub fn contains(&self, connection_id: &str) -> bool {
        self.connections.contains_key(connection_id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Returns false when the connection is unknown or its receiver is gone.
    pub fn notify(&self, connection_id: &str, message: ServerMessage) -> bool {
        match self.connections.get(connection_id) {
            Some(sender) => match sender.send(message) {
                Ok(_) => true,
                Err(err) => {
                    tracing::warn!(
                        "Failed to notify connection_id={}: {}",
                        connection_id,
                        err
                    );
                    false
                }
            },
            None => {
                tracing::debug!("Connection {} is not registered", connection_id);
                false
            }
        }
    }
}
