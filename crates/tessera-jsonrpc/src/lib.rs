//! Tokio-based JSON-RPC 2.0 runtime for Tessera.
//!
//! This crate implements:
//! - `Content-Length` framing with a size check before allocation
//! - an opaque request id type that round-trips numbers and strings unchanged
//! - [`Connection`], a multiplexed client/server endpoint with atomic id allocation, batched
//!   requests and in-order delivery of peer requests and notifications
//!
//! Closing a connection fails every pending waiter; no caller is left waiting on a dead peer.

pub mod codec;
mod connection;
mod message;

pub use connection::{Connection, ConnectionOptions, Incoming, IncomingMessage};
pub use message::{
    codes, DecodeError, Message, Notification, Request, RequestId, Response, ResponseError,
};

/// Transport-level failures. Any of these closes the connection.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("I/O error: {message}")]
    Io { message: String },

    #[error("frame too large: {len} > {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("invalid frame header: {message}")]
    InvalidHeader { message: String },

    #[error("connection closed")]
    ConnectionClosed,
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io {
            message: err.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum RpcError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("remote error: {0}")]
    Remote(ResponseError),

    #[error("request cancelled")]
    Cancelled,

    #[error("failed to encode message: {message}")]
    Encode { message: String },
}

impl RpcError {
    /// Converts the failure into an error object suitable for relaying to another peer.
    pub fn to_response_error(&self) -> ResponseError {
        match self {
            RpcError::Remote(err) => err.clone(),
            RpcError::Cancelled => ResponseError::request_cancelled(),
            other => ResponseError::internal(other.to_string()),
        }
    }
}
