use std::{io, time::Duration};

use thiserror::Error;

use crate::protocol::ProtocolError;

/// Every failure a caller of the client can observe.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no endpoint configured")]
    NoEndpoint,

    #[error("invalid greeting: {0}")]
    InvalidGreeting(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("transport io error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("server error {code:#x} for request {request_id}: {message}")]
    Server {
        code: u32,
        request_id: u64,
        message: String,
    },

    #[error("request {request_id} timed out after {timeout:?}")]
    Timeout { request_id: u64, timeout: Duration },

    #[error("not connected")]
    NotConnected,

    #[error("connection attempt failed: {0}")]
    ConnectFailed(String),

    #[error("request id {0} is already pending")]
    DuplicateRequestId(u64),

    #[error("space '{0}' not found")]
    SpaceNotFound(String),

    #[error("space with id {0} not found")]
    SpaceIdNotFound(u32),

    #[error("index '{index}' not found in space '{space}'")]
    IndexNotFound { space: String, index: String },

    #[error("failed to convert value: {0}")]
    Conversion(String),
}

impl From<rmpv::ext::Error> for ClientError {
    fn from(value: rmpv::ext::Error) -> Self {
        ClientError::Conversion(value.to_string())
    }
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;
