use bytes::Bytes;
use rmpv::Value;

use super::{CommandCode, ERROR_BIT, Key, ProtocolError, Request};

/// Size of the length prefix in front of every frame: marker byte plus a `u32`.
pub const LENGTH_PREFIX_SIZE: usize = 5;

/// Request id reported for frames whose own id could not be recovered.
pub const SENTINEL_REQUEST_ID: u64 = u64::MAX;

const U32_MARKER: u8 = 0xce;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub code: u32,
    pub request_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub code: u32,
    pub request_id: u64,
    pub schema_id: Option<u64>,
}

impl ResponseHeader {
    pub fn ok(request_id: u64) -> Self {
        Self {
            code: CommandCode::Ok.into(),
            request_id,
            schema_id: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.code & ERROR_BIT != 0
    }

    /// Server error code with the error bit stripped.
    pub fn error_code(&self) -> u32 {
        self.code & !ERROR_BIT
    }
}

/// A received frame. The body stays encoded until someone asks for it.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: ResponseHeader,
    pub body: Bytes,
}

impl Frame {
    /// Splits a complete frame (without length prefix) into header and body.
    pub fn parse(frame: Bytes) -> Result<Self, ProtocolError> {
        let mut cursor: &[u8] = &frame;
        let header = decode_response_header(&mut cursor)?;
        let consumed = frame.len() - cursor.len();

        Ok(Self {
            header,
            body: frame.slice(consumed..),
        })
    }
}

/// Serializes a request into one buffer, patching the length prefix in last.
pub fn encode_request(request: &Request, request_id: u64) -> Result<Vec<u8>, ProtocolError> {
    let header = Value::Map(vec![
        (Key::Code.into(), Value::from(u32::from(request.code()))),
        (Key::Sync.into(), Value::from(request_id)),
    ]);
    encode_frame(&header, &request.body())
}

/// Serializes a response frame; used by servers and test doubles.
pub fn encode_response(header: &ResponseHeader, body: &Value) -> Result<Vec<u8>, ProtocolError> {
    let mut entries = vec![
        (Key::Code.into(), Value::from(header.code)),
        (Key::Sync.into(), Value::from(header.request_id)),
    ];
    if let Some(schema_id) = header.schema_id {
        entries.push((Key::SchemaId.into(), Value::from(schema_id)));
    }
    encode_frame(&Value::Map(entries), body)
}

fn encode_frame(header: &Value, body: &Value) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(&[U32_MARKER, 0, 0, 0, 0]);
    rmpv::encode::write_value(&mut buf, header)?;
    rmpv::encode::write_value(&mut buf, body)?;

    let size = buf.len() - LENGTH_PREFIX_SIZE;
    let len = u32::try_from(size).map_err(|_| ProtocolError::OversizedFrame {
        size,
        capacity: u32::MAX as usize,
    })?;
    buf[1..LENGTH_PREFIX_SIZE].copy_from_slice(&len.to_be_bytes());
    Ok(buf)
}

/// Reads the declared size of the frame that follows the prefix.
pub fn decode_length_prefix(prefix: &[u8; LENGTH_PREFIX_SIZE]) -> Result<usize, ProtocolError> {
    if prefix[0] != U32_MARKER {
        return Err(ProtocolError::InvalidLengthPrefix(prefix[0]));
    }
    let len = u32::from_be_bytes([prefix[1], prefix[2], prefix[3], prefix[4]]);
    Ok(len as usize)
}

pub fn decode_request_header(rd: &mut &[u8]) -> Result<RequestHeader, ProtocolError> {
    const WHAT: &str = "request header";

    let entries = read_header_map(rd, WHAT, 2, 2, "2")?;
    let mut code = None;
    let mut request_id = None;
    for (key, value) in entries {
        match key {
            k if k == Key::Code as u64 => code = Some(as_u32(&value, "code")?),
            k if k == Key::Sync as u64 => request_id = Some(as_u64(&value, "request id")?),
            k => return Err(ProtocolError::UnexpectedKey(k, WHAT)),
        }
    }

    Ok(RequestHeader {
        code: code.ok_or(ProtocolError::MissingKey("code", WHAT))?,
        request_id: request_id.ok_or(ProtocolError::MissingKey("request id", WHAT))?,
    })
}

/// Decodes `{code, request id[, schema id]}`; anything outside 2..=3 entries is rejected.
pub fn decode_response_header(rd: &mut &[u8]) -> Result<ResponseHeader, ProtocolError> {
    const WHAT: &str = "response header";

    let entries = read_header_map(rd, WHAT, 2, 3, "2..=3")?;
    let mut code = None;
    let mut request_id = None;
    let mut schema_id = None;
    for (key, value) in entries {
        match key {
            k if k == Key::Code as u64 => code = Some(as_u32(&value, "code")?),
            k if k == Key::Sync as u64 => request_id = Some(as_u64(&value, "request id")?),
            k if k == Key::SchemaId as u64 => schema_id = Some(as_u64(&value, "schema id")?),
            k => return Err(ProtocolError::UnexpectedKey(k, WHAT)),
        }
    }

    Ok(ResponseHeader {
        code: code.ok_or(ProtocolError::MissingKey("code", WHAT))?,
        request_id: request_id.ok_or(ProtocolError::MissingKey("request id", WHAT))?,
        schema_id,
    })
}

/// Best-effort extraction of the request id from a possibly damaged frame.
pub fn peek_request_id(frame: &[u8]) -> Option<u64> {
    let mut cursor = frame;
    match rmpv::decode::read_value(&mut cursor).ok()? {
        Value::Map(entries) => entries
            .iter()
            .find(|(k, _)| k.as_u64() == Some(Key::Sync as u64))
            .and_then(|(_, v)| v.as_u64()),
        _ => None,
    }
}

/// Extracts the message from an error body.
pub fn decode_error(body: &[u8]) -> Result<String, ProtocolError> {
    if body.is_empty() {
        return Ok(String::from("unknown error"));
    }

    let mut cursor = body;
    let Value::Map(entries) = rmpv::decode::read_value(&mut cursor)? else {
        return Err(ProtocolError::UnexpectedType("error body"));
    };

    match entries
        .into_iter()
        .find(|(k, _)| k.as_u64() == Some(Key::Error as u64))
    {
        Some((_, Value::String(message))) => Ok(message.into_str().unwrap_or_default()),
        Some(_) => Err(ProtocolError::UnexpectedType("error message")),
        None => Ok(String::from("unknown error")),
    }
}

fn read_header_map(
    rd: &mut &[u8],
    what: &'static str,
    min: usize,
    max: usize,
    expected: &'static str,
) -> Result<Vec<(u64, Value)>, ProtocolError> {
    let Value::Map(entries) = rmpv::decode::read_value(rd)? else {
        return Err(ProtocolError::UnexpectedType(what));
    };
    if entries.len() < min || entries.len() > max {
        return Err(ProtocolError::UnexpectedLength {
            what,
            expected,
            actual: entries.len(),
        });
    }

    entries
        .into_iter()
        .map(|(k, v)| {
            k.as_u64()
                .map(|k| (k, v))
                .ok_or(ProtocolError::UnexpectedType("header key"))
        })
        .collect()
}

fn as_u64(value: &Value, field: &'static str) -> Result<u64, ProtocolError> {
    value.as_u64().ok_or(ProtocolError::UnexpectedType(field))
}

fn as_u32(value: &Value, field: &'static str) -> Result<u32, ProtocolError> {
    as_u64(value, field)?
        .try_into()
        .map_err(|_| ProtocolError::UnexpectedType(field))
}
