use crate::coordinator::Coordinator;

impl Coordinator {
    /// Releases everything the connection owns and forgets its outbound channel.
    /// Unknown or already reclaimed connections are a no-op.
    pub async fn disconnect(&self, connection_id: &str) {
        self.reclaim(connection_id, true, None).await;
        tracing::info!("Connection {} is disconnected", connection_id);
    }

    /// `keep_room` is never garbage collected, so a re-join does not replace its router.
    pub(crate) async fn reclaim(
        &self,
        connection_id: &str,
        unregister: bool,
        keep_room: Option<&str>,
    ) {
        let (consumers, producers, transports, router) = {
            let mut state = self.state.lock().await;
            if unregister {
                state.connections.unregister(connection_id);
            }
            let peer = match state.peers.remove(connection_id) {
                Some(peer) => peer,
                None => return,
            };

            let consumers = state.consumers.drain_owned_by(connection_id);
            let producers = state.producers.drain_owned_by(connection_id);
            let transports = state.transports.drain_owned_by(connection_id);

            if let Some(room) = state.rooms.get_mut(&peer.room_name) {
                room.remove_member(connection_id);
            }
            let collect = self.config.close_empty_rooms && keep_room != Some(peer.room_name.as_str());
            let router = state.collect_room(&peer.room_name, collect);
            (consumers, producers, transports, router)
        };

        tracing::debug!(
            "Reclaiming connection_id={}: {} consumers, {} producers, {} transports",
            connection_id,
            consumers.len(),
            producers.len(),
            transports.len()
        );
        for consumer in consumers {
            consumer.handle.close();
        }
        for producer in producers {
            producer.handle.close();
        }
        for transport in transports {
            transport.handle.close();
        }
        if let Some(router) = router {
            router.close();
        }
    }
}
