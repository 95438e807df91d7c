use derivative::Derivative;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    consumer::ConsumerParameters,
    coordinator::Coordinator,
    engine::RtpCapabilities,
    error::Error,
    peer::PeerDetails,
    registry::Direction,
    transport::TransportParameters,
};

use super::message::{ClientEvent, Envelope, EventName, ServerMessage};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JoinRoomResponse {
    rtp_capabilities: RtpCapabilities,
}

#[derive(Serialize)]
struct TransportResponse {
    params: TransportParameters,
}

#[derive(Serialize)]
struct ConsumeResponse {
    params: ConsumerParameters,
}

/// One signaling connection. Frames must be handed to [`SignalingSession::handle_text`] one at a
/// time, in arrival order.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct SignalingSession {
    connection_id: String,
    #[derivative(Debug = "ignore")]
    coordinator: Coordinator,
    sender: mpsc::UnboundedSender<ServerMessage>,
}

impl SignalingSession {
    /// Registers a new connection and greets it with `connection-success`.
    pub async fn open(coordinator: Coordinator, sender: mpsc::UnboundedSender<ServerMessage>) -> Self {
        let connection_id = Uuid::new_v4().to_string();
        coordinator
            .register_connection(&connection_id, sender.clone())
            .await;
        let session = Self {
            connection_id,
            coordinator,
            sender,
        };
        session.send(ServerMessage::ConnectionSuccess {
            socket_id: session.connection_id.clone(),
        });
        tracing::info!("Signaling session {} is opened", session.connection_id);
        session
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub async fn handle_text(&self, text: &str) {
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!("connection_id={}: {}", self.connection_id, err);
                self.send(ServerMessage::Error {
                    event: String::new(),
                    message: err.to_string(),
                });
                return;
            }
        };
        let name = match envelope.event_name() {
            Ok(name) => name,
            Err(err) => {
                tracing::warn!("connection_id={}: {}", self.connection_id, err);
                self.reply_raw(&envelope.event, envelope.ack, Err(err), error_payload);
                return;
            }
        };
        let ack = envelope.ack;
        if ack.is_none() && name.expects_ack() {
            tracing::debug!(
                "connection_id={} sent {} without ack, the response is dropped",
                self.connection_id,
                name
            );
        }
        match ClientEvent::from_data(name, envelope.data) {
            Ok(event) => {
                tracing::debug!("connection_id={} received {:?}", self.connection_id, event);
                let result = self.dispatch(event).await;
                self.reply(name, ack, result);
            }
            Err(err) => {
                tracing::warn!(
                    "connection_id={} sent invalid {}: {}",
                    self.connection_id,
                    name,
                    err
                );
                self.reply(name, ack, Err(err));
            }
        }
    }

    async fn dispatch(&self, event: ClientEvent) -> Result<Value, Error> {
        let id = self.connection_id.as_str();
        let coordinator = &self.coordinator;
        match event {
            ClientEvent::JoinRoom(payload) => {
                let details = PeerDetails {
                    display_name: payload.display_name.unwrap_or_default(),
                    is_admin: false,
                };
                let rtp_capabilities = coordinator
                    .join_room_as(id, &payload.room_name, details)
                    .await?;
                Ok(serde_json::to_value(JoinRoomResponse { rtp_capabilities })?)
            }
            ClientEvent::CreateWebRtcTransport(payload) => {
                let direction = if payload.consumer {
                    Direction::Receive
                } else {
                    Direction::Send
                };
                let params = coordinator.create_transport(id, direction).await?;
                Ok(serde_json::to_value(TransportResponse { params })?)
            }
            ClientEvent::TransportConnect(payload) => {
                coordinator
                    .connect_send_transport(id, payload.dtls_parameters)
                    .await?;
                Ok(Value::Null)
            }
            ClientEvent::TransportProduce(payload) => {
                let response = coordinator
                    .produce(id, payload.kind, payload.rtp_parameters, payload.app_data)
                    .await?;
                Ok(serde_json::to_value(response)?)
            }
            ClientEvent::TransportRecvConnect(payload) => {
                coordinator
                    .connect_recv_transport(
                        id,
                        &payload.server_consumer_transport_id,
                        payload.dtls_parameters,
                    )
                    .await?;
                Ok(Value::Null)
            }
            ClientEvent::Consume(payload) => {
                let params = coordinator
                    .consume(
                        id,
                        payload.rtp_capabilities,
                        &payload.remote_producer_id,
                        &payload.server_consumer_transport_id,
                    )
                    .await?;
                Ok(serde_json::to_value(ConsumeResponse { params })?)
            }
            ClientEvent::ConsumerResume(payload) => {
                coordinator
                    .resume_consumer(id, &payload.server_consumer_id)
                    .await?;
                Ok(Value::Null)
            }
            ClientEvent::GetProducers => {
                let producer_ids = coordinator.list_producers(id).await?;
                Ok(serde_json::to_value(producer_ids)?)
            }
            ClientEvent::ProducerClose(payload) => {
                coordinator.close_producer(id, &payload.producer_id).await?;
                Ok(Value::Null)
            }
        }
    }

    fn reply(&self, name: EventName, ack: Option<u64>, result: Result<Value, Error>) {
        let shape: fn(&Error) -> Value = match name {
            EventName::Consume => consume_error_payload,
            _ => error_payload,
        };
        if let Err(err) = &result {
            if err.is_fatal() {
                tracing::error!("connection_id={} {} failed: {}", self.connection_id, name, err);
            } else {
                tracing::warn!("connection_id={} {} failed: {}", self.connection_id, name, err);
            }
        }
        self.reply_raw(&name.to_string(), ack, result, shape);
    }

    fn reply_raw(
        &self,
        event: &str,
        ack: Option<u64>,
        result: Result<Value, Error>,
        shape: fn(&Error) -> Value,
    ) {
        match (ack, result) {
            (Some(id), Ok(payload)) => self.send(ServerMessage::Ack { id, payload }),
            (Some(id), Err(err)) => self.send(ServerMessage::Ack {
                id,
                payload: shape(&err),
            }),
            (None, Ok(_)) => {}
            (None, Err(err)) => self.send(ServerMessage::Error {
                event: event.to_owned(),
                message: err.to_string(),
            }),
        }
    }

    fn send(&self, message: ServerMessage) {
        if let Err(err) = self.sender.send(message) {
            tracing::warn!(
                "connection_id={} is gone, dropping message: {}",
                self.connection_id,
                err
            );
        }
    }

    /// Reclaims everything the connection owns.
    pub async fn close(&self) {
        self.coordinator.disconnect(&self.connection_id).await;
        tracing::info!("Signaling session {} is closed", self.connection_id);
    }
}

fn error_payload(err: &Error) -> Value {
    let mut payload = serde_json::Map::new();
    payload.insert("error".to_owned(), Value::from(err.to_string()));
    Value::Object(payload)
}

fn consume_error_payload(err: &Error) -> Value {
    let mut payload = serde_json::Map::new();
    payload.insert("params".to_owned(), error_payload(err));
    Value::Object(payload)
}
