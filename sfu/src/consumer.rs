use enclose::enc;
use serde::Serialize;

use crate::{
    coordinator::{Coordinator, CoordinatorEvent, State},
    engine::{ConsumeOptions, MediaKind, RtpCapabilities, RtpParameters},
    error::{Error, NotFoundErrorKind, ProtocolOrderErrorKind},
    registry::{ConsumerRecord, Direction, TransportState},
    signaling::message::ServerMessage,
};

/// Everything a client needs to receive a remote producer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerParameters {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub server_consumer_id: String,
}

impl State {
    pub(crate) fn deregister_consumer(&mut self, consumer_id: &str) -> Option<ConsumerRecord> {
        let record = self.consumers.remove(consumer_id)?;
        if let Some(peer) = self.peers.get_mut(&record.connection_id) {
            peer.forget_consumer(consumer_id);
        }
        Some(record)
    }
}

impl Coordinator {
    /// Creates a paused consumer of `producer_id` on the caller's receive transport.
    pub async fn consume(
        &self,
        connection_id: &str,
        rtp_capabilities: RtpCapabilities,
        producer_id: &str,
        transport_id: &str,
    ) -> Result<ConsumerParameters, Error> {
        self.check_alive()?;

        let (room_name, handle) = {
            let state = self.state.lock().await;
            let router = state.router_of(connection_id)?;
            let room_name = state.peer(connection_id)?.room_name.clone();

            let transport = state
                .transports
                .get(transport_id)
                .filter(|t| t.connection_id == connection_id && t.direction == Direction::Receive)
                .ok_or_else(|| {
                    Error::new_not_found(
                        format!(
                            "Receive transport {} is not found for connection {}",
                            transport_id, connection_id
                        ),
                        NotFoundErrorKind::TransportNotFoundError,
                    )
                })?;
            if transport.state == TransportState::Closed {
                return Err(Error::new_protocol_order(
                    format!("Transport {} is closed", transport_id),
                    ProtocolOrderErrorKind::TransportClosedError,
                ));
            }

            let in_room = state
                .producers
                .get(producer_id)
                .map(|producer| producer.room_name == room_name)
                .unwrap_or(false);
            if !in_room {
                return Err(Error::new_not_found(
                    format!("Producer {} is not found in room {}", producer_id, room_name),
                    NotFoundErrorKind::ProducerNotFoundError,
                ));
            }

            if !router.can_consume(producer_id, &rtp_capabilities) {
                return Err(Error::new_capability_mismatch(format!(
                    "Router {} can not consume producer {} with given capabilities",
                    router.id(),
                    producer_id
                )));
            }
            (room_name, transport.handle.clone())
        };

        let consumer = handle
            .consume(ConsumeOptions {
                producer_id: producer_id.to_owned(),
                rtp_capabilities,
                paused: true,
            })
            .await?;
        let consumer_id = consumer.id();
        {
            let event_sender = self.event_sender.clone();
            consumer.on_transport_close(Box::new(enc!((consumer_id, event_sender) move || {
                Coordinator::emit(
                    &event_sender,
                    CoordinatorEvent::ConsumerTransportClosed(consumer_id.clone()),
                );
            })));
            consumer.on_producer_close(Box::new(enc!((consumer_id, event_sender) move || {
                Coordinator::emit(
                    &event_sender,
                    CoordinatorEvent::ConsumerProducerClosed(consumer_id.clone()),
                );
            })));
        }

        let mut state = self.state.lock().await;
        let still_valid = state
            .peers
            .get(connection_id)
            .map(|peer| peer.room_name == room_name)
            .unwrap_or(false)
            && state.transports.contains(transport_id)
            && state.producers.contains(producer_id)
            && !consumer.closed();
        if !still_valid {
            drop(state);
            consumer.close();
            return Err(Error::new_not_found(
                format!(
                    "Resources of connection {} went away while consuming producer {}",
                    connection_id, producer_id
                ),
                NotFoundErrorKind::ConsumerNotFoundError,
            ));
        }

        let parameters = ConsumerParameters {
            id: consumer_id.clone(),
            producer_id: producer_id.to_owned(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
            server_consumer_id: consumer_id.clone(),
        };
        state.consumers.insert(ConsumerRecord {
            id: consumer_id.clone(),
            connection_id: connection_id.to_owned(),
            room_name,
            producer_id: producer_id.to_owned(),
            transport_id: transport_id.to_owned(),
            handle: consumer,
        });
        if let Some(peer) = state.peers.get_mut(connection_id) {
            peer.consumer_ids.push(consumer_id.clone());
        }
        tracing::info!(
            "Consumer {} of producer {} is created for connection_id={}",
            consumer_id,
            producer_id,
            connection_id
        );

        Ok(parameters)
    }

    pub async fn resume_consumer(&self, connection_id: &str, consumer_id: &str) -> Result<(), Error> {
        self.check_alive()?;

        let handle = {
            let state = self.state.lock().await;
            state
                .consumers
                .get(consumer_id)
                .filter(|consumer| consumer.connection_id == connection_id)
                .map(|consumer| consumer.handle.clone())
                .ok_or_else(|| {
                    Error::new_not_found(
                        format!(
                            "Consumer {} is not found for connection {}",
                            consumer_id, connection_id
                        ),
                        NotFoundErrorKind::ConsumerNotFoundError,
                    )
                })?
        };

        handle.resume().await?;
        tracing::debug!("Consumer {} is resumed", consumer_id);
        Ok(())
    }

    /// Producers of the caller's room owned by other connections, oldest first.
    pub async fn list_producers(&self, connection_id: &str) -> Result<Vec<String>, Error> {
        self.check_alive()?;

        let state = self.state.lock().await;
        let room_name = &state.peer(connection_id)?.room_name;
        Ok(state
            .producers
            .in_room(room_name)
            .filter(|producer| producer.connection_id != connection_id)
            .map(|producer| producer.id.clone())
            .collect())
    }

    pub(crate) async fn on_consumer_transport_closed(&self, consumer_id: &str) {
        let mut state = self.state.lock().await;
        if state.deregister_consumer(consumer_id).is_some() {
            tracing::debug!("Consumer {} is closed with its transport", consumer_id);
        }
    }

    /// The source producer is gone: tell the owner, then drop the consumer. Its receive transport
    /// goes too, once no other consumer is left on it.
    pub(crate) async fn on_consumer_producer_closed(&self, consumer_id: &str) {
        let (consumer, transport) = {
            let mut state = self.state.lock().await;
            let consumer = match state.deregister_consumer(consumer_id) {
                Some(consumer) => consumer,
                None => return,
            };
            state.connections.notify(
                &consumer.connection_id,
                ServerMessage::ProducerClosed {
                    remote_producer_id: consumer.producer_id.clone(),
                },
            );
            let shared = state
                .consumers
                .iter()
                .any(|other| other.transport_id == consumer.transport_id);
            let transport = if shared {
                None
            } else {
                state.deregister_transport(&consumer.transport_id)
            };
            (consumer, transport)
        };

        tracing::debug!(
            "Producer {} of consumer {} is closed, connection_id={} is notified",
            consumer.producer_id,
            consumer.id,
            consumer.connection_id
        );
        if let Some(transport) = transport {
            transport.handle.close();
        }
        consumer.handle.close();
    }
}
