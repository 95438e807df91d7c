use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{Display, EnumIter, EnumString};

use crate::{
    engine::{DtlsParameters, MediaKind, RtpCapabilities, RtpParameters},
    error::{Error, SignalingErrorKind},
};

/// Outer shape of every client frame: `{"event": ..., "ack": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub ack: Option<u64>,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn parse(text: &str) -> Result<Self, Error> {
        serde_json::from_str(text).map_err(|err| {
            Error::new_signaling(
                format!("Failed to parse client frame: {}", err),
                SignalingErrorKind::MalformedMessageError,
            )
        })
    }

    pub fn event_name(&self) -> Result<EventName, Error> {
        self.event.parse().map_err(|_| {
            Error::new_signaling(
                format!("Unknown event {}", self.event),
                SignalingErrorKind::UnknownEventError,
            )
        })
    }
}

#[derive(Debug, Display, EnumString, EnumIter, Clone, Copy, PartialEq, Eq)]
pub enum EventName {
    #[strum(serialize = "joinRoom")]
    JoinRoom,
    #[strum(serialize = "createWebRtcTransport")]
    CreateWebRtcTransport,
    #[strum(serialize = "transport-connect")]
    TransportConnect,
    #[strum(serialize = "transport-produce")]
    TransportProduce,
    #[strum(serialize = "transport-recv-connect")]
    TransportRecvConnect,
    #[strum(serialize = "consume")]
    Consume,
    #[strum(serialize = "consumer-resume")]
    ConsumerResume,
    #[strum(serialize = "getProducers")]
    GetProducers,
    #[strum(serialize = "producer-close")]
    ProducerClose,
}

impl EventName {
    /// Events whose client passes a callback and expects an ack.
    pub fn expects_ack(&self) -> bool {
        matches!(
            self,
            EventName::JoinRoom
                | EventName::CreateWebRtcTransport
                | EventName::TransportProduce
                | EventName::Consume
                | EventName::GetProducers
        )
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoom {
    pub room_name: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreateWebRtcTransport {
    #[serde(default)]
    pub consumer: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConnect {
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportProduce {
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    #[serde(default)]
    pub app_data: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportRecvConnect {
    pub dtls_parameters: DtlsParameters,
    pub server_consumer_transport_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Consume {
    pub rtp_capabilities: RtpCapabilities,
    pub remote_producer_id: String,
    pub server_consumer_transport_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerResume {
    pub server_consumer_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerClose {
    pub producer_id: String,
}

/// A validated client event.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    JoinRoom(JoinRoom),
    CreateWebRtcTransport(CreateWebRtcTransport),
    TransportConnect(TransportConnect),
    TransportProduce(TransportProduce),
    TransportRecvConnect(TransportRecvConnect),
    Consume(Consume),
    ConsumerResume(ConsumerResume),
    GetProducers,
    ProducerClose(ProducerClose),
}

impl ClientEvent {
    pub fn from_data(name: EventName, data: Value) -> Result<Self, Error> {
        let event = match name {
            EventName::JoinRoom => ClientEvent::JoinRoom(payload(data)?),
            EventName::CreateWebRtcTransport => {
                // `emit('createWebRtcTransport', callback)` sends no payload at all.
                let data = if data.is_null() {
                    Value::Object(Default::default())
                } else {
                    data
                };
                ClientEvent::CreateWebRtcTransport(payload(data)?)
            }
            EventName::TransportConnect => ClientEvent::TransportConnect(payload(data)?),
            EventName::TransportProduce => ClientEvent::TransportProduce(payload(data)?),
            EventName::TransportRecvConnect => ClientEvent::TransportRecvConnect(payload(data)?),
            EventName::Consume => ClientEvent::Consume(payload(data)?),
            EventName::ConsumerResume => ClientEvent::ConsumerResume(payload(data)?),
            EventName::GetProducers => ClientEvent::GetProducers,
            EventName::ProducerClose => ClientEvent::ProducerClose(payload(data)?),
        };
        Ok(event)
    }
}

fn payload<T: DeserializeOwned>(data: Value) -> Result<T, Error> {
    Ok(serde_json::from_value(data)?)
}

/// Frames pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    ConnectionSuccess { socket_id: String },
    #[serde(rename_all = "camelCase")]
    NewProducer { producer_id: String },
    #[serde(rename_all = "camelCase")]
    ProducerClosed { remote_producer_id: String },
    /// Failure of an event that has no ack to carry it.
    Error { event: String, message: String },
    Ack { id: u64, payload: Value },
}

impl ServerMessage {
    pub fn to_text(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }
}
