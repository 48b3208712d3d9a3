//! Error types for the bridge

use crate::device::DeviceHandle;
use std::ops::Range;

/// Result type alias
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Bridge error types
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Every port in the configured server range refused the bind
    #[error("no free server port in {}..{}", .range.start, .range.end)]
    PortExhausted {
        /// Candidate range that was tried (end exclusive)
        range: Range<u16>,
    },

    /// Send or bind failure on an already-established session
    #[error("transport unavailable: {0}")]
    TransportUnavailable(#[from] std::io::Error),

    /// Inbound message missing or carrying a non-numeric positional field
    #[error("malformed message on {addr}: {reason}")]
    MalformedMessage {
        /// OSC address the message arrived on
        addr: String,
        /// What was wrong with it
        reason: String,
    },

    /// OSC packet could not be encoded
    #[error("OSC encode error: {0}")]
    Encode(String),

    /// Client endpoint could not be resolved
    #[error("invalid client address {0}")]
    InvalidAddress(String),

    /// Host has no device registered under this handle
    #[error("unknown device {0}")]
    UnknownDevice(DeviceHandle),

    /// Operation requires a connected session
    #[error("session not connected")]
    NotConnected,
}

impl From<rosc::OscError> for BridgeError {
    fn from(e: rosc::OscError) -> Self {
        BridgeError::Encode(format!("{e:?}"))
    }
}
