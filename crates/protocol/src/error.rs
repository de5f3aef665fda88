//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering framing and payload failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Failed to serialize a message.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Payload bytes did not parse into a message.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// Header or buffer is shorter than required.
    #[error("insufficient data: need {need} bytes, have {have}")]
    Incomplete {
        /// Bytes required.
        need: usize,
        /// Bytes available.
        have: usize,
    },

    /// Declared payload length exceeds the maximum.
    #[error("packet too large: {size} bytes exceeds maximum of {max} bytes")]
    PacketTooLarge {
        /// Declared payload size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Header carries a version this build does not speak.
    #[error("unsupported packet version: expected {expected}, got {got}")]
    UnsupportedVersion {
        /// Version this build speaks.
        expected: u8,
        /// Version found in the header.
        got: u8,
    },

    /// Packet payload has not been fully received yet.
    #[error("packet incomplete: {received} of {length} payload bytes received")]
    PacketIncomplete {
        /// Bytes received so far.
        received: usize,
        /// Declared payload length.
        length: usize,
    },
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ProtocolError::MalformedPayload(err.to_string())
    }
}

impl ProtocolError {
    /// Whether the error leaves the byte stream unusable.
    ///
    /// Header-level failures lose packet boundaries, payload-level failures do not.
    pub fn is_stream_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::PacketTooLarge { .. } | ProtocolError::UnsupportedVersion { .. }
        )
    }
}
