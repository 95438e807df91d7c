//! Capability surface the coordinator needs from a media-routing engine.
//!
//! The coordinator never switches packets itself. It drives an engine through these traits and
//! listens to the events the engine raises on its handles.
use std::{collections::BTreeMap, fmt::Debug, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecParameters;

use crate::{
    config::{MediaConfig, WebRtcTransportConfig},
    error::Error,
};

/// In-process engine that keeps bookkeeping only.
pub mod loopback;

pub type OnDtlsStateChangeFn = Box<dyn Fn(DtlsState) + Send + Sync>;
pub type OnCloseFn = Box<dyn Fn() + Send + Sync>;
pub type OnDiedFn = Box<dyn Fn(String) + Send + Sync>;

#[async_trait]
pub trait MediaEngine: Debug + Send + Sync {
    async fn create_router(&self, media_config: &MediaConfig)
        -> Result<Arc<dyn EngineRouter>, Error>;
    /// Registers a callback fired once when the engine becomes unusable.
    fn on_died(&self, f: OnDiedFn);
}

#[async_trait]
pub trait EngineRouter: Debug + Send + Sync {
    fn id(&self) -> String;
    fn rtp_capabilities(&self) -> RtpCapabilities;
    fn can_consume(&self, producer_id: &str, rtp_capabilities: &RtpCapabilities) -> bool;
    async fn create_webrtc_transport(
        &self,
        config: &WebRtcTransportConfig,
    ) -> Result<Arc<dyn EngineTransport>, Error>;
    fn close(&self);
}

#[async_trait]
pub trait EngineTransport: Debug + Send + Sync {
    fn id(&self) -> String;
    fn ice_parameters(&self) -> IceParameters;
    fn ice_candidates(&self) -> Vec<IceCandidate>;
    fn dtls_parameters(&self) -> DtlsParameters;
    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), Error>;
    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn EngineProducer>, Error>;
    async fn consume(&self, options: ConsumeOptions) -> Result<Arc<dyn EngineConsumer>, Error>;
    fn on_dtls_state_change(&self, f: OnDtlsStateChangeFn);
    fn on_close(&self, f: OnCloseFn);
    /// Closing twice is a no-op.
    fn close(&self);
    fn closed(&self) -> bool;
}

pub trait EngineProducer: Debug + Send + Sync {
    fn id(&self) -> String;
    fn kind(&self) -> MediaKind;
    fn on_transport_close(&self, f: OnCloseFn);
    fn close(&self);
    fn closed(&self) -> bool;
}

#[async_trait]
pub trait EngineConsumer: Debug + Send + Sync {
    fn id(&self) -> String;
    fn producer_id(&self) -> String;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> RtpParameters;
    fn paused(&self) -> bool;
    async fn resume(&self) -> Result<(), Error>;
    fn on_transport_close(&self, f: OnCloseFn);
    fn on_producer_close(&self, f: OnCloseFn);
    fn close(&self);
    fn closed(&self) -> bool;
}

#[derive(
    Debug, Display, EnumString, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn from_mime_type(mime_type: &str) -> Option<Self> {
        let (kind, _) = mime_type.split_once('/')?;
        kind.to_ascii_lowercase().parse().ok()
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DtlsState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    #[serde(default)]
    pub ice_lite: bool,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Protocol {
    Udp,
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub ip: String,
    pub protocol: Protocol,
    pub port: u16,
    #[serde(rename = "type")]
    pub candidate_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_type: Option<String>,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DtlsRole {
    #[default]
    Auto,
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsParameters {
    #[serde(default)]
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcpFeedback {
    #[serde(rename = "type")]
    pub feedback_type: String,
    #[serde(default)]
    pub parameter: String,
}

pub type CodecParameters = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
    #[serde(default)]
    pub parameters: CodecParameters,
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

impl RtpCodecCapability {
    pub(crate) fn from_codec(kind: MediaKind, codec: &RTCRtpCodecParameters) -> Self {
        let capability = &codec.capability;
        Self {
            kind,
            mime_type: capability.mime_type.clone(),
            preferred_payload_type: Some(codec.payload_type),
            clock_rate: capability.clock_rate,
            channels: (capability.channels > 0).then_some(capability.channels),
            parameters: parse_fmtp_line(&capability.sdp_fmtp_line),
            rtcp_feedback: capability
                .rtcp_feedback
                .iter()
                .map(|fb| RtcpFeedback {
                    feedback_type: fb.typ.clone(),
                    parameter: fb.parameter.clone(),
                })
                .collect(),
        }
    }

    /// Two codecs are compatible when mime type (case-insensitive) and clock rate agree.
    pub fn matches(&self, mime_type: &str, clock_rate: u32) -> bool {
        self.mime_type.eq_ignore_ascii_case(mime_type) && self.clock_rate == clock_rate
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<serde_json::Value>,
}

impl RtpCapabilities {
    pub fn from_media_config(media_config: &MediaConfig) -> Self {
        let audio = media_config
            .audio_codecs
            .iter()
            .map(|codec| RtpCodecCapability::from_codec(MediaKind::Audio, codec));
        let video = media_config
            .video_codecs
            .iter()
            .map(|codec| RtpCodecCapability::from_codec(MediaKind::Video, codec));
        Self {
            codecs: audio.chain(video).collect(),
            header_extensions: vec![],
        }
    }

    pub fn supports(&self, mime_type: &str, clock_rate: u32) -> bool {
        self.codecs
            .iter()
            .any(|codec| codec.matches(mime_type, clock_rate))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
    #[serde(default)]
    pub parameters: CodecParameters,
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub header_extensions: Vec<serde_json::Value>,
    #[serde(default)]
    pub encodings: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtcp: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    pub producer_id: String,
    pub rtp_capabilities: RtpCapabilities,
    pub paused: bool,
}

/// Turns `a=1;b=foo` into `{"a": 1, "b": "foo"}`.
fn parse_fmtp_line(line: &str) -> CodecParameters {
    line.split(';')
        .filter_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            let value = match value.parse::<i64>() {
                Ok(number) => serde_json::Value::from(number),
                Err(_) => serde_json::Value::from(value),
            };
            Some((key.to_owned(), value))
        })
        .collect()
}
