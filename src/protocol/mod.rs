//! Client-server wire protocol.
//!
//! This module defines the binary protocol spoken between the client and the database
//! server: frame layout, header and payload keys, command codes, the connection greeting
//! and the authentication scramble. It provides the types and logic required to
//! serialize requests and interpret responses without touching any socket.
//!
//! # Overview
//!
//! Every message is a *frame*: a length prefix followed by a header map and a payload
//! map, all MessagePack encoded. Requests and responses are correlated by the request id
//! carried in the header, which lets many requests share one connection and complete out
//! of order.
//!
//! # Key Components
//!
//! - [`Request`]: The fixed command vocabulary the server understands.
//! - [`Response`]: A decoded payload body (`data`, SQL metadata and info).
//! - [`Frame`]: A received frame, header decoded and body kept as raw bytes.
//! - [`Greeting`]: The 128-byte banner the server sends on connect.
//!
//! # Binary Format
//!
//! - Each frame starts with a 5-byte length prefix: the `0xCE` MessagePack marker followed
//!   by a big-endian `u32` giving the size of the rest of the frame.
//! - The header is a map `{0x00: code, 0x01: request id}` on requests and
//!   `{0x00: code, 0x01: request id, 0x05: schema id}` on responses.
//! - The payload is a map keyed by the integer tags in [`Key`].
//! - A response code with [`ERROR_BIT`] set carries `{0x31: message}` instead of data.
//!
//! # See Also
//!
//! - [`connection`](crate::connection): Moves these frames over a live session.
mod codes;
mod frame;
mod greeting;
mod request;
mod response;

use thiserror::Error;

pub use codes::{CommandCode, ERROR_BIT, IteratorKind, Key};
pub use frame::{
    Frame, LENGTH_PREFIX_SIZE, RequestHeader, ResponseHeader, SENTINEL_REQUEST_ID,
    decode_error, decode_length_prefix, decode_request_header, decode_response_header,
    encode_request, encode_response, peek_request_id,
};
pub use greeting::{GREETING_SIZE, Greeting, scramble};
pub use request::{Request, SelectOptions, UpdateOperation};
pub use response::{FieldMetadata, Response, SqlInfo, SqlResponse};

/// Framing and codec failures. These are contained to the frame that caused them.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unexpected {what} length {actual}, expected {expected}")]
    UnexpectedLength {
        what: &'static str,
        expected: &'static str,
        actual: usize,
    },

    #[error("unexpected key {0:#x} in {1}")]
    UnexpectedKey(u64, &'static str),

    #[error("missing {0} in {1}")]
    MissingKey(&'static str, &'static str),

    #[error("unexpected value type for {0}")]
    UnexpectedType(&'static str),

    #[error("frame of {size} bytes exceeds receive buffer of {capacity} bytes")]
    OversizedFrame { size: usize, capacity: usize },

    #[error("invalid length prefix marker {0:#04x}")]
    InvalidLengthPrefix(u8),

    #[error("failed to decode frame: {0}")]
    Decode(#[from] rmpv::decode::Error),

    #[error("failed to encode frame: {0}")]
    Encode(#[from] rmpv::encode::Error),
}
