use log::trace;
use rmpv::Value;
use serde::de::DeserializeOwned;

use crate::error::ClientError;

use super::{Key, ProtocolError};

const METADATA_NAME: u64 = 0x00;
const METADATA_TYPE: u64 = 0x01;
const SQL_INFO_ROW_COUNT: u64 = 0x00;
const SQL_INFO_AUTOINCREMENT_IDS: u64 = 0x01;

/// Column description returned with SQL result sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMetadata {
    pub name: String,
    pub kind: Option<String>,
}

/// Side effects reported by a data-changing SQL statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlInfo {
    pub row_count: u64,
    pub autoincrement_ids: Vec<u64>,
}

/// A decoded success body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    pub data: Option<Value>,
    pub metadata: Option<Vec<FieldMetadata>>,
    pub sql_info: Option<SqlInfo>,
}

impl Response {
    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut response = Response::default();
        if body.is_empty() {
            return Ok(response);
        }

        let mut cursor = body;
        let Value::Map(entries) = rmpv::decode::read_value(&mut cursor)? else {
            return Err(ProtocolError::UnexpectedType("response body"));
        };

        for (key, value) in entries {
            match key.as_u64() {
                Some(k) if k == Key::Data as u64 => response.data = Some(value),
                Some(k) if k == Key::Metadata as u64 => {
                    response.metadata = Some(decode_metadata(value)?)
                }
                Some(k) if k == Key::SqlInfo as u64 || k == Key::SqlInfoLegacy as u64 => {
                    response.sql_info = Some(decode_sql_info(value)?)
                }
                // Newer servers attach extra diagnostics; they carry nothing we consume.
                _ => trace!("ignoring response body key {key}"),
            }
        }

        Ok(response)
    }

    /// Converts the `data` section into `T`, treating a missing section as an empty array.
    pub fn into_data<T: DeserializeOwned>(self) -> Result<T, ClientError> {
        let data = self.data.unwrap_or_else(|| Value::Array(vec![]));
        Ok(rmpv::ext::from_value(data)?)
    }
}

/// Result of an `execute` request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlResponse {
    pub metadata: Vec<FieldMetadata>,
    pub rows: Vec<Value>,
    pub info: Option<SqlInfo>,
}

impl SqlResponse {
    pub fn rows_as<T: DeserializeOwned>(&self) -> Result<Vec<T>, ClientError> {
        self.rows
            .iter()
            .cloned()
            .map(|row| Ok(rmpv::ext::from_value(row)?))
            .collect()
    }
}

impl TryFrom<Response> for SqlResponse {
    type Error = ProtocolError;

    fn try_from(value: Response) -> Result<Self, Self::Error> {
        let rows = match value.data {
            Some(Value::Array(rows)) => rows,
            Some(_) => return Err(ProtocolError::UnexpectedType("sql rows")),
            None => vec![],
        };

        Ok(Self {
            metadata: value.metadata.unwrap_or_default(),
            rows,
            info: value.sql_info,
        })
    }
}

fn decode_metadata(value: Value) -> Result<Vec<FieldMetadata>, ProtocolError> {
    let Value::Array(columns) = value else {
        return Err(ProtocolError::UnexpectedType("metadata"));
    };

    columns
        .into_iter()
        .map(|column| {
            let Value::Map(entries) = column else {
                return Err(ProtocolError::UnexpectedType("column metadata"));
            };
            let mut name = None;
            let mut kind = None;
            for (k, v) in entries {
                match k.as_u64() {
                    Some(METADATA_NAME) => name = v.as_str().map(str::to_string),
                    Some(METADATA_TYPE) => kind = v.as_str().map(str::to_string),
                    _ => {}
                }
            }
            Ok(FieldMetadata {
                name: name.ok_or(ProtocolError::MissingKey("name", "column metadata"))?,
                kind,
            })
        })
        .collect()
}

fn decode_sql_info(value: Value) -> Result<SqlInfo, ProtocolError> {
    let Value::Map(entries) = value else {
        return Err(ProtocolError::UnexpectedType("sql info"));
    };

    let mut info = SqlInfo::default();
    for (k, v) in entries {
        match k.as_u64() {
            Some(SQL_INFO_ROW_COUNT) => {
                info.row_count = v
                    .as_u64()
                    .ok_or(ProtocolError::UnexpectedType("row count"))?
            }
            Some(SQL_INFO_AUTOINCREMENT_IDS) => {
                let Value::Array(ids) = v else {
                    return Err(ProtocolError::UnexpectedType("autoincrement ids"));
                };
                info.autoincrement_ids = ids.iter().filter_map(Value::as_u64).collect();
            }
            _ => {}
        }
    }
    Ok(info)
}
