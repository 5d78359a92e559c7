//! Crate-wide error type.

use thiserror::Error;

use crate::packet::{ErrorCode, PacketError};

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed control packet: {0}")]
    Packet(#[from] PacketError),

    /// The peer broke the control protocol (duplicate open, duplicate spawn).
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    #[error("socket is closed")]
    SocketClosed,

    /// The device answered an open request with an error code.
    #[error("socket open rejected ({code:?}): {message}")]
    OpenRejected { code: ErrorCode, message: String },

    #[error("control channel closed before a response arrived")]
    ChannelClosed,

    #[error("flow transport is closed")]
    TransportClosed,

    #[error("device error: {0}")]
    Device(String),
}
