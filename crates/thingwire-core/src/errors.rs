use std::time::Duration;

use crate::acks::{AckLabel, Acknowledgement};
use crate::frame::Frame;
use crate::ids::CorrelationId;

/// Connection lifecycle failures.
/// Classified as fatal (never retried) or transient (retried by the reconnect loop).
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    // Fatal
    #[error("host could not be resolved: {host}: {reason}")]
    HostUnresolvable { host: String, reason: String },
    #[error("authorization rejected with status {status}")]
    AuthorizationRejected { status: u16 },
    #[error("handshake rejected with status {status}")]
    HandshakeRejected { status: u16 },
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    // Transient
    #[error("upstream unavailable with status {status}")]
    UpstreamUnavailable { status: u16 },
    #[error("handshake reset: {0}")]
    HandshakeReset(String),
    #[error("connection dropped: {0}")]
    ConnectionDropped(String),

    // Operational
    #[error("connection closed")]
    Closed,
}

impl ConnectionError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::HostUnresolvable { .. }
                | Self::AuthorizationRejected { .. }
                | Self::HandshakeRejected { .. }
                | Self::InvalidEndpoint(_)
        )
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::UpstreamUnavailable { .. } | Self::HandshakeReset(_) | Self::ConnectionDropped(_)
        )
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::HostUnresolvable { .. } => "host_unresolvable",
            Self::AuthorizationRejected { .. } => "authorization_rejected",
            Self::HandshakeRejected { .. } => "handshake_rejected",
            Self::InvalidEndpoint(_) => "invalid_endpoint",
            Self::UpstreamUnavailable { .. } => "upstream_unavailable",
            Self::HandshakeReset(_) => "handshake_reset",
            Self::ConnectionDropped(_) => "connection_dropped",
            Self::Closed => "closed",
        }
    }

    /// Classify a non-101 upgrade response.
    pub fn from_handshake_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::AuthorizationRejected { status },
            500..=599 => Self::UpstreamUnavailable { status },
            _ => Self::HandshakeRejected { status },
        }
    }
}

/// Synchronous misconfiguration of a request, surfaced before anything is sent.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("requested acknowledgements must include the terminal label `{expected}`")]
    MissingTerminalLabel { expected: AckLabel },
    #[error("invalid acknowledgement label `{0}`")]
    InvalidLabel(String),
    #[error("no acknowledgement labels requested")]
    NoAcknowledgementsRequested,
    #[error("frame declares acknowledgements other than `{terminal}`; use send_with_acknowledgements")]
    AcknowledgementsRequireAggregation { terminal: AckLabel },
    #[error("frame topic `{0}` has no channel for acknowledgements")]
    MissingChannel(String),
}

/// Outcome failures of a correlated request.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("no response for {correlation_id} within {timeout:?}")]
    Timeout {
        correlation_id: CorrelationId,
        timeout: Duration,
    },
    #[error("connection lost while awaiting {0}")]
    ConnectionLost(CorrelationId),
    #[error("correlation id {0} is already in flight")]
    DuplicateCorrelationId(CorrelationId),
    #[error("error response with status {status}")]
    ErrorResponse { status: u16, frame: Box<Frame> },
    #[error("send failed: {0}")]
    Send(#[from] ConnectionError),
    #[error("frame could not be encoded: {0}")]
    Encode(#[from] FrameError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl RequestError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::ConnectionLost(_) => "connection_lost",
            Self::DuplicateCorrelationId(_) => "duplicate_correlation_id",
            Self::ErrorResponse { .. } => "error_response",
            Self::Send(_) => "send",
            Self::Encode(_) => "encode",
            Self::Config(_) => "config",
        }
    }
}

/// Failure of an acknowledgement aggregation.
#[derive(Debug, thiserror::Error)]
pub enum AcknowledgementError {
    /// At least one acknowledgement failed, or some never arrived before the deadline.
    #[error("dependency failed with status {status} ({} received, {} missing)", .received.len(), .missing.len())]
    DependencyFailed {
        status: u16,
        received: Vec<Acknowledgement>,
        missing: Vec<AckLabel>,
    },
    #[error("connection lost while awaiting acknowledgements for {0}")]
    ConnectionLost(CorrelationId),
}

impl AcknowledgementError {
    /// Look up one received acknowledgement by label.
    pub fn acknowledgement(&self, label: &str) -> Option<&Acknowledgement> {
        match self {
            Self::DependencyFailed { received, .. } => {
                received.iter().find(|ack| ack.label().as_str() == label)
            }
            Self::ConnectionLost(_) => None,
        }
    }
}

/// Inbound text that is not a well-formed frame.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("malformed json envelope: {0}")]
    MalformedJson(String),
    #[error("invalid topic `{topic}`: {reason}")]
    InvalidTopic { topic: String, reason: &'static str },
    #[error("invalid entity id `{0}`")]
    InvalidEntityId(String),
    #[error("invalid acknowledgement: {0}")]
    InvalidAcknowledgement(String),
    #[error("empty control frame")]
    EmptyControlFrame,
}
