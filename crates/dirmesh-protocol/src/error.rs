//! Error types for the protocol layer.

use thiserror::Error;

/// Errors raised while encoding or decoding replication messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A message could not be encoded for the wire.
    #[error("message encoding failed: {0}")]
    Encode(String),

    /// Received bytes could not be decoded into a message.
    #[error("message decoding failed: {0}")]
    Decode(String),

    /// A frame announced a payload larger than the protocol allows.
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Announced payload size.
        size: usize,
        /// Maximum allowed payload size.
        max: usize,
    },
}
