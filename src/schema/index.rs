use std::{fmt, sync::Weak};

use rmpv::Value;
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    connection::Supervisor,
    error::ClientError,
    protocol::{IteratorKind, Request, SelectOptions, UpdateOperation},
};

use super::{FieldKind, field_str, field_u32, into_tuple, upgrade};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexKind {
    Tree,
    Hash,
    Bitset,
    Rtree,
    Other(String),
}

impl From<&str> for IndexKind {
    fn from(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "tree" => IndexKind::Tree,
            "hash" => IndexKind::Hash,
            "bitset" => IndexKind::Bitset,
            "rtree" => IndexKind::Rtree,
            _ => IndexKind::Other(value.to_string()),
        }
    }
}

/// A key part: which tuple field (zero-based) and its declared type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPart {
    pub field: u32,
    pub kind: FieldKind,
}

pub struct Index {
    pub id: u32,
    pub space_id: u32,
    pub name: String,
    pub kind: IndexKind,
    pub unique: bool,
    pub parts: Vec<IndexPart>,
    supervisor: Weak<Supervisor>,
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Index")
            .field("id", &self.id)
            .field("space_id", &self.space_id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("unique", &self.unique)
            .field("parts", &self.parts)
            .finish()
    }
}

const INDEX_SPACE_ID: usize = 0;
const INDEX_ID: usize = 1;
const INDEX_NAME: usize = 2;
const INDEX_KIND: usize = 3;
const INDEX_OPTIONS: usize = 4;
const INDEX_PARTS: usize = 5;

impl Index {
    /// Builds an index from a `_vindex` tuple `[space_id, id, name, type, options, parts]`.
    ///
    /// Parts come either as `[field, type]` pairs or as `{field, type}` maps depending on
    /// the server version; both are accepted.
    pub(crate) fn from_tuple(
        tuple: &Value,
        supervisor: Weak<Supervisor>,
    ) -> Result<Self, ClientError> {
        let space_id = field_u32(tuple, INDEX_SPACE_ID, "index space id")?;
        let id = field_u32(tuple, INDEX_ID, "index id")?;
        let name = field_str(tuple, INDEX_NAME, "index name")?.to_string();
        let kind = IndexKind::from(field_str(tuple, INDEX_KIND, "index type")?);

        let fields = tuple.as_array().map(Vec::as_slice).unwrap_or_default();
        let unique = match fields.get(INDEX_OPTIONS) {
            Some(Value::Map(options)) => options
                .iter()
                .find(|(k, _)| k.as_str() == Some("unique"))
                .and_then(|(_, v)| v.as_bool())
                .unwrap_or(false),
            Some(Value::Integer(flag)) => flag.as_u64().is_some_and(|flag| flag != 0),
            _ => false,
        };
        let parts = match fields.get(INDEX_PARTS) {
            Some(Value::Array(parts)) => parts
                .iter()
                .map(parse_part)
                .collect::<Result<Vec<_>, _>>()?,
            _ => Vec::new(),
        };

        Ok(Self {
            id,
            space_id,
            name,
            kind,
            unique,
            parts,
            supervisor,
        })
    }

    pub fn select<K, R>(&self, key: &K, options: SelectOptions) -> Result<Vec<R>, ClientError>
    where
        K: Serialize,
        R: DeserializeOwned,
    {
        let request = Request::Select {
            space_id: self.space_id,
            index_id: self.id,
            key: into_tuple(key)?,
            options,
        };
        upgrade(&self.supervisor)?.send(&request, None)?.into_data()
    }

    pub fn get<K, R>(&self, key: &K) -> Result<Option<R>, ClientError>
    where
        K: Serialize,
        R: DeserializeOwned,
    {
        let mut found = self.select(key, SelectOptions::default().limit(1))?;
        Ok(found.pop())
    }

    /// Smallest tuple whose key is greater than or equal to `key`; unit selects the first overall.
    pub fn min<K, R>(&self, key: &K) -> Result<Option<R>, ClientError>
    where
        K: Serialize,
        R: DeserializeOwned,
    {
        let options = SelectOptions::default().iterator(IteratorKind::Ge).limit(1);
        let mut found = self.select(key, options)?;
        Ok(found.pop())
    }

    /// Largest tuple whose key is less than or equal to `key`; unit selects the last overall.
    pub fn max<K, R>(&self, key: &K) -> Result<Option<R>, ClientError>
    where
        K: Serialize,
        R: DeserializeOwned,
    {
        let options = SelectOptions::default().iterator(IteratorKind::Le).limit(1);
        let mut found = self.select(key, options)?;
        Ok(found.pop())
    }

    pub fn update<K, R>(&self, key: &K, ops: Vec<UpdateOperation>) -> Result<Vec<R>, ClientError>
    where
        K: Serialize,
        R: DeserializeOwned,
    {
        let request = Request::Update {
            space_id: self.space_id,
            index_id: self.id,
            key: into_tuple(key)?,
            ops,
        };
        upgrade(&self.supervisor)?.send(&request, None)?.into_data()
    }

    pub fn delete<K, R>(&self, key: &K) -> Result<Vec<R>, ClientError>
    where
        K: Serialize,
        R: DeserializeOwned,
    {
        let request = Request::Delete {
            space_id: self.space_id,
            index_id: self.id,
            key: into_tuple(key)?,
        };
        upgrade(&self.supervisor)?.send(&request, None)?.into_data()
    }
}

fn parse_part(part: &Value) -> Result<IndexPart, ClientError> {
    match part {
        Value::Array(pair) => {
            let field = pair
                .first()
                .and_then(Value::as_u64)
                .and_then(|f| u32::try_from(f).ok())
                .ok_or_else(|| ClientError::Conversion(format!("bad index part {part}")))?;
            let kind = pair
                .get(1)
                .and_then(Value::as_str)
                .map(FieldKind::from)
                .unwrap_or(FieldKind::Any);
            Ok(IndexPart { field, kind })
        }
        Value::Map(entries) => {
            let mut field = None;
            let mut kind = FieldKind::Any;
            for (k, v) in entries {
                match k.as_str() {
                    Some("field") => field = v.as_u64().and_then(|f| u32::try_from(f).ok()),
                    Some("type") => {
                        kind = v.as_str().map(FieldKind::from).unwrap_or(FieldKind::Any)
                    }
                    _ => {}
                }
            }
            let field =
                field.ok_or_else(|| ClientError::Conversion(format!("bad index part {part}")))?;
            Ok(IndexPart { field, kind })
        }
        other => Err(ClientError::Conversion(format!("bad index part {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vindex(options: Value, parts: Value) -> Value {
        Value::Array(vec![
            Value::from(512),
            Value::from(0),
            Value::from("primary"),
            Value::from("tree"),
            options,
            parts,
        ])
    }

    #[test]
    fn legacy_parts() {
        let tuple = vindex(
            Value::Map(vec![(Value::from("unique"), Value::from(true))]),
            Value::Array(vec![Value::Array(vec![Value::from(0), Value::from("unsigned")])]),
        );

        let index = Index::from_tuple(&tuple, Weak::new()).unwrap();
        assert_eq!(index.space_id, 512);
        assert_eq!(index.kind, IndexKind::Tree);
        assert!(index.unique);
        assert_eq!(
            index.parts,
            vec![IndexPart {
                field: 0,
                kind: FieldKind::Unsigned
            }]
        );
    }

    #[test]
    fn map_parts() {
        let part = Value::Map(vec![
            (Value::from("type"), Value::from("string")),
            (Value::from("field"), Value::from(2)),
            (Value::from("is_nullable"), Value::from(false)),
        ]);
        let tuple = vindex(Value::Map(vec![]), Value::Array(vec![part]));

        let index = Index::from_tuple(&tuple, Weak::new()).unwrap();
        assert!(!index.unique);
        assert_eq!(index.parts[0].field, 2);
        assert_eq!(index.parts[0].kind, FieldKind::String);
    }

    #[test]
    fn integer_unique_flag() {
        let tuple = vindex(Value::from(1), Value::Array(vec![]));
        assert!(Index::from_tuple(&tuple, Weak::new()).unwrap().unique);
    }

    #[test]
    fn malformed_part_is_rejected() {
        let tuple = vindex(Value::Map(vec![]), Value::Array(vec![Value::from("zero")]));
        assert!(matches!(
            Index::from_tuple(&tuple, Weak::new()),
            Err(ClientError::Conversion(_))
        ));
    }
}
