use enclose::enc;
use serde::Serialize;

use crate::{
    coordinator::{not_joined, Coordinator, CoordinatorEvent, State},
    engine::{MediaKind, RtpParameters},
    error::{Error, NotFoundErrorKind, ProtocolOrderErrorKind},
    registry::{ProducerRecord, TransportState},
    signaling::message::ServerMessage,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceResponse {
    pub id: String,
    pub producers_exist: bool,
}

impl State {
    /// True when the room holds a producer that `connection_id` does not own.
    pub(crate) fn others_produce(&self, room_name: &str, connection_id: &str) -> bool {
        self.producers
            .in_room(room_name)
            .any(|producer| producer.connection_id != connection_id)
    }

    pub(crate) fn deregister_producer(&mut self, producer_id: &str) -> Option<ProducerRecord> {
        let record = self.producers.remove(producer_id)?;
        if let Some(peer) = self.peers.get_mut(&record.connection_id) {
            peer.forget_producer(producer_id);
        }
        Some(record)
    }
}

impl Coordinator {
    /// Publishes a track on the connected send transport and tells the rest of the room.
    pub async fn produce(
        &self,
        connection_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: serde_json::Value,
    ) -> Result<ProduceResponse, Error> {
        self.check_alive()?;

        let (transport_id, room_name, handle) = {
            let state = self.state.lock().await;
            let peer = state.peer(connection_id)?;
            let transport = state.send_transport(connection_id).ok_or_else(|| {
                Error::new_protocol_order(
                    format!("Connection {} has no send transport", connection_id),
                    ProtocolOrderErrorKind::SendTransportMissingError,
                )
            })?;
            if transport.state != TransportState::Connected {
                return Err(Error::new_protocol_order(
                    format!("Send transport {} is not connected", transport.id),
                    ProtocolOrderErrorKind::TransportNotConnectedError,
                ));
            }
            (
                transport.id.clone(),
                peer.room_name.clone(),
                transport.handle.clone(),
            )
        };

        let producer = handle.produce(kind, rtp_parameters).await?;
        let producer_id = producer.id();
        {
            let event_sender = self.event_sender.clone();
            producer.on_transport_close(Box::new(enc!((producer_id, event_sender) move || {
                Coordinator::emit(
                    &event_sender,
                    CoordinatorEvent::ProducerTransportClosed(producer_id.clone()),
                );
            })));
        }

        let mut state = self.state.lock().await;
        let still_valid = state
            .peers
            .get(connection_id)
            .map(|peer| peer.room_name == room_name)
            .unwrap_or(false)
            && state.transports.contains(&transport_id)
            && !producer.closed();
        if !still_valid {
            drop(state);
            producer.close();
            return Err(Error::new_not_found(
                format!(
                    "Transport {} went away while producing for connection {}",
                    transport_id, connection_id
                ),
                NotFoundErrorKind::TransportNotFoundError,
            ));
        }

        let producers_exist = state.others_produce(&room_name, connection_id);
        state.producers.insert(ProducerRecord {
            id: producer_id.clone(),
            connection_id: connection_id.to_owned(),
            room_name: room_name.clone(),
            kind,
            transport_id,
            app_data,
            handle: producer,
        });
        if let Some(peer) = state.peers.get_mut(connection_id) {
            peer.producer_ids.push(producer_id.clone());
        }
        tracing::info!(
            "Producer {} kind={} is created for connection_id={} in room {}",
            producer_id,
            kind,
            connection_id,
            room_name
        );

        let members = state
            .rooms
            .get(&room_name)
            .map(|room| room.peers_of(connection_id))
            .unwrap_or_default();
        for member in members {
            state.connections.notify(
                &member,
                ServerMessage::NewProducer {
                    producer_id: producer_id.clone(),
                },
            );
        }

        Ok(ProduceResponse {
            id: producer_id,
            producers_exist,
        })
    }

    /// Closes a producer the caller owns. Its consumers are closed through the engine events.
    pub async fn close_producer(&self, connection_id: &str, producer_id: &str) -> Result<(), Error> {
        self.check_alive()?;

        let record = {
            let mut state = self.state.lock().await;
            if !state.peers.contains(connection_id) {
                return Err(not_joined(connection_id));
            }
            let owned = state
                .producers
                .get(producer_id)
                .map(|producer| producer.connection_id == connection_id)
                .unwrap_or(false);
            if !owned {
                return Err(Error::new_not_found(
                    format!(
                        "Producer {} is not found for connection {}",
                        producer_id, connection_id
                    ),
                    NotFoundErrorKind::ProducerNotFoundError,
                ));
            }
            state.deregister_producer(producer_id)
        };

        if let Some(record) = record {
            record.handle.close();
            tracing::info!(
                "Producer {} is closed by connection_id={}",
                producer_id,
                connection_id
            );
        }
        Ok(())
    }

    pub(crate) async fn on_producer_transport_closed(&self, producer_id: &str) {
        let mut state = self.state.lock().await;
        if state.deregister_producer(producer_id).is_some() {
            tracing::debug!("Producer {} is closed with its transport", producer_id);
        }
    }
}
