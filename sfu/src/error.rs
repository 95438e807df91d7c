//! Error type shared by every coordinator operation.
use strum_macros::Display;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    ProtocolOrderError(ProtocolOrderErrorKind),
    CapabilityMismatchError,
    NotFoundError(NotFoundErrorKind),
    EngineError(EngineErrorKind),
    SignalingError(SignalingErrorKind),
    ConfigError(ConfigErrorKind),
}

/// An operation was issued before its prerequisite resource exists or is ready.
#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum ProtocolOrderErrorKind {
    NotJoinedError,
    SendTransportMissingError,
    TransportNotConnectedError,
    TransportAlreadyConnectedError,
    TransportClosedError,
}

#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum NotFoundErrorKind {
    RoomNotFoundError,
    PeerNotFoundError,
    TransportNotFoundError,
    ProducerNotFoundError,
    ConsumerNotFoundError,
}

#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum EngineErrorKind {
    /// The engine is gone. Registries can not be trusted afterwards.
    EngineDiedError,
    RouterClosedError,
    TransportClosedError,
    ProducerClosedError,
    ConsumerClosedError,
    InvalidStateError,
    InvalidParametersError,
}

#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum SignalingErrorKind {
    MalformedMessageError,
    UnknownEventError,
    InvalidPayloadError,
}

#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum ConfigErrorKind {
    InvalidValueError,
    InvalidPortRangeError,
}

impl Error {
    pub fn new_protocol_order(message: String, kind: ProtocolOrderErrorKind) -> Self {
        Self {
            kind: ErrorKind::ProtocolOrderError(kind),
            message,
        }
    }

    pub fn new_capability_mismatch(message: String) -> Self {
        Self {
            kind: ErrorKind::CapabilityMismatchError,
            message,
        }
    }

    pub fn new_not_found(message: String, kind: NotFoundErrorKind) -> Self {
        Self {
            kind: ErrorKind::NotFoundError(kind),
            message,
        }
    }

    pub fn new_engine(message: String, kind: EngineErrorKind) -> Self {
        Self {
            kind: ErrorKind::EngineError(kind),
            message,
        }
    }

    pub fn new_signaling(message: String, kind: SignalingErrorKind) -> Self {
        Self {
            kind: ErrorKind::SignalingError(kind),
            message,
        }
    }

    pub fn new_config(message: String, kind: ConfigErrorKind) -> Self {
        Self {
            kind: ErrorKind::ConfigError(kind),
            message,
        }
    }

    /// Only a dead engine is fatal at process scope. Everything else is reported to the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::EngineError(EngineErrorKind::EngineDiedError)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.kind, ErrorKind::NotFoundError(_))
    }

    pub fn is_protocol_order(&self) -> bool {
        matches!(self.kind, ErrorKind::ProtocolOrderError(_))
    }

    pub fn is_capability_mismatch(&self) -> bool {
        matches!(self.kind, ErrorKind::CapabilityMismatchError)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::new_signaling(err.to_string(), SignalingErrorKind::InvalidPayloadError)
    }
}
