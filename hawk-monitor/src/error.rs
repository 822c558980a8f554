//! Protocol and session error types

use hawk_transport::TransportError;
use thiserror::Error;

/// Errors from the wire codecs.
///
/// Parsers never escalate: a bad frame becomes one of these, the reading is
/// discarded, and the link is left alone. Upper layers classify. A
/// well-formed frame of an unknown type is not an error at all; it comes
/// back as [`crate::protocol::Frame::Ignored`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Bad length, markers, or checksum
    #[error("Framing error: {0}")]
    Framing(String),

    /// Frame decoded but is semantically invalid
    #[error("Parse error: {reason} (raw {raw})")]
    Parse {
        /// What failed validation
        reason: String,
        /// Offending frame, hex-encoded for diagnostics
        raw: String,
    },
}

impl ProtocolError {
    /// Build a parse error carrying the offending frame
    pub fn parse(reason: impl Into<String>, raw: &[u8]) -> Self {
        ProtocolError::Parse {
            reason: reason.into(),
            raw: hex::encode(raw),
        }
    }
}

/// Errors from device sessions
#[derive(Error, Debug)]
pub enum MonitorError {
    /// Wire codec error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport layer error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// No response within the per-command deadline
    #[error("Command {command} timed out")]
    CommandTimeout {
        /// Label of the command that timed out
        command: &'static str,
    },

    /// The peripheral answered with the wrong frame type
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Session was closed while the request was in flight
    #[error("Session is closed")]
    SessionClosed,
}
