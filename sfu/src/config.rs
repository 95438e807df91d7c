use std::{
    fmt::Display,
    net::{IpAddr, Ipv4Addr},
    str::FromStr,
    time::Duration,
};

use webrtc::{
    api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8},
    rtp_transceiver::{
        rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters},
        RTCPFeedback,
    },
};

use crate::error::{ConfigErrorKind, Error};

/// Codec set every router is seeded with.
#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub audio_codecs: Vec<RTCRtpCodecParameters>,
    pub video_codecs: Vec<RTCRtpCodecParameters>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        let video_rtcp_feedback = vec![
            RTCPFeedback {
                typ: "nack".to_owned(),
                parameter: "".to_owned(),
            },
            RTCPFeedback {
                typ: "nack".to_owned(),
                parameter: "pli".to_owned(),
            },
            RTCPFeedback {
                typ: "ccm".to_owned(),
                parameter: "fir".to_owned(),
            },
            RTCPFeedback {
                typ: "goog-remb".to_owned(),
                parameter: "".to_owned(),
            },
        ];

        Self {
            audio_codecs: vec![RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48000,
                    channels: 2,
                    sdp_fmtp_line: "".to_owned(),
                    rtcp_feedback: vec![],
                },
                payload_type: 100,
                ..Default::default()
            }],
            video_codecs: vec![RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90000,
                    channels: 0,
                    // Starting bitrate hint in kbps.
                    sdp_fmtp_line: "x-google-start-bitrate=1000".to_owned(),
                    rtcp_feedback: video_rtcp_feedback,
                },
                payload_type: 101,
                ..Default::default()
            }],
        }
    }
}

/// Network options passed to the engine for every WebRTC transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebRtcTransportConfig {
    pub listen_ip: IpAddr,
    /// Address advertised in ICE candidates. Falls back to `listen_ip` when unset.
    pub announced_ip: Option<IpAddr>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
}

impl Default for WebRtcTransportConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
        }
    }
}

impl WebRtcTransportConfig {
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let default = Self::default();
        let listen_ip = parse_var(&lookup, "LISTEN_IP", default.listen_ip)?;
        let announced_ip = match lookup("ANNOUNCED_IP") {
            Some(value) if value.is_empty() => None,
            Some(value) => Some(parse_value("ANNOUNCED_IP", &value)?),
            None => default.announced_ip,
        };
        Ok(Self {
            listen_ip,
            announced_ip,
            ..default
        })
    }

    pub(crate) fn advertised_ip(&self) -> IpAddr {
        self.announced_ip.unwrap_or(self.listen_ip)
    }
}

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            rtc_min_port: 2000,
            rtc_max_port: 2199,
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let default = Self::default();
        let config = Self {
            rtc_min_port: parse_var(&lookup, "RTC_MIN_PORT", default.rtc_min_port)?,
            rtc_max_port: parse_var(&lookup, "RTC_MAX_PORT", default.rtc_max_port)?,
        };
        if config.rtc_min_port > config.rtc_max_port {
            return Err(Error::new_config(
                format!(
                    "RTC port range {}-{} is empty",
                    config.rtc_min_port, config.rtc_max_port
                ),
                ConfigErrorKind::InvalidPortRangeError,
            ));
        }
        Ok(config)
    }
}

/// Configuration for [`crate::coordinator::Coordinator`].
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub media: MediaConfig,
    pub transport: WebRtcTransportConfig,
    /// Remove a room and close its router when its last member leaves.
    pub close_empty_rooms: bool,
    /// How long a supervisor should wait after an engine failure before exiting.
    pub engine_failure_grace: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            media: MediaConfig::default(),
            transport: WebRtcTransportConfig::default(),
            close_empty_rooms: false,
            engine_failure_grace: Duration::from_millis(2000),
        }
    }
}

impl CoordinatorConfig {
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let default = Self::default();
        let grace_ms = parse_var(
            &lookup,
            "ENGINE_FAILURE_GRACE_MS",
            default.engine_failure_grace.as_millis() as u64,
        )?;
        Ok(Self {
            media: default.media,
            transport: WebRtcTransportConfig::from_lookup(&lookup)?,
            close_empty_rooms: parse_var(&lookup, "CLOSE_EMPTY_ROOMS", default.close_empty_rooms)?,
            engine_failure_grace: Duration::from_millis(grace_ms),
        })
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T, Error>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(value) => parse_value(key, &value),
        None => Ok(default),
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T, Error>
where
    T: FromStr,
    T::Err: Display,
{
    value.trim().parse::<T>().map_err(|err| {
        Error::new_config(
            format!("Failed to parse {}={}: {}", key, value, err),
            ConfigErrorKind::InvalidValueError,
        )
    })
}
