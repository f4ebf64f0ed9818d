use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Weak},
};

use rmpv::Value;
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    connection::Supervisor,
    error::ClientError,
    protocol::{IteratorKind, Request, SelectOptions, UpdateOperation},
};

use super::{Index, field_str, field_u32, into_tuple, upgrade};

/// Declared type of a tuple field or index part.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Any,
    Unsigned,
    String,
    Number,
    Integer,
    Boolean,
    Double,
    Decimal,
    Uuid,
    Datetime,
    Interval,
    Varbinary,
    Scalar,
    Array,
    Map,
    Other(String),
}

impl From<&str> for FieldKind {
    fn from(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "any" | "*" => FieldKind::Any,
            "unsigned" | "num" => FieldKind::Unsigned,
            "string" | "str" => FieldKind::String,
            "number" => FieldKind::Number,
            "integer" | "int" => FieldKind::Integer,
            "boolean" | "bool" => FieldKind::Boolean,
            "double" => FieldKind::Double,
            "decimal" => FieldKind::Decimal,
            "uuid" => FieldKind::Uuid,
            "datetime" => FieldKind::Datetime,
            "interval" => FieldKind::Interval,
            "varbinary" => FieldKind::Varbinary,
            "scalar" => FieldKind::Scalar,
            "array" => FieldKind::Array,
            "map" => FieldKind::Map,
            _ => FieldKind::Other(value.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StorageEngine {
    Memtx,
    Vinyl,
    Sysview,
    Blackhole,
    Service,
    Other(String),
}

impl From<&str> for StorageEngine {
    fn from(value: &str) -> Self {
        match value {
            "memtx" => StorageEngine::Memtx,
            "vinyl" => StorageEngine::Vinyl,
            "sysview" => StorageEngine::Sysview,
            "blackhole" => StorageEngine::Blackhole,
            "service" => StorageEngine::Service,
            other => StorageEngine::Other(other.to_string()),
        }
    }
}

/// One entry of a space's format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceField {
    pub name: String,
    pub kind: FieldKind,
    pub is_nullable: bool,
}

/// Cached metadata of a remote space plus the operations that target it.
///
/// Immutable once built; a schema reload replaces it wholesale.
pub struct Space {
    pub id: u32,
    pub name: String,
    pub engine: StorageEngine,
    pub field_count: u32,
    pub fields: Vec<SpaceField>,
    indexes_by_name: HashMap<String, Arc<Index>>,
    indexes_by_id: HashMap<u32, Arc<Index>>,
    supervisor: Weak<Supervisor>,
}

impl fmt::Debug for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Space")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("engine", &self.engine)
            .field("fields", &self.fields)
            .field("indexes", &self.indexes_by_id.len())
            .finish()
    }
}

const SPACE_ID: usize = 0;
const SPACE_NAME: usize = 2;
const SPACE_ENGINE: usize = 3;
const SPACE_FIELD_COUNT: usize = 4;
const SPACE_FORMAT: usize = 6;

impl Space {
    /// Builds a space from a `_vspace` tuple
    /// `[id, owner, name, engine, field_count, flags, format]`.
    ///
    /// `owner` and `flags` are not used by the client and are skipped.
    pub(crate) fn from_tuple(
        tuple: &Value,
        indexes: Vec<Index>,
        supervisor: Weak<Supervisor>,
    ) -> Result<Self, ClientError> {
        let id = field_u32(tuple, SPACE_ID, "space id")?;
        let name = field_str(tuple, SPACE_NAME, "space name")?.to_string();
        let engine = StorageEngine::from(field_str(tuple, SPACE_ENGINE, "space engine")?);
        let field_count = field_u32(tuple, SPACE_FIELD_COUNT, "space field count")?;
        let fields = match tuple.as_array().and_then(|t| t.get(SPACE_FORMAT)) {
            Some(Value::Array(format)) => format.iter().filter_map(parse_field).collect(),
            _ => Vec::new(),
        };

        let mut indexes_by_name = HashMap::new();
        let mut indexes_by_id = HashMap::new();
        for index in indexes {
            let index = Arc::new(index);
            indexes_by_name.insert(index.name.clone(), Arc::clone(&index));
            indexes_by_id.insert(index.id, index);
        }

        Ok(Self {
            id,
            name,
            engine,
            field_count,
            fields,
            indexes_by_name,
            indexes_by_id,
            supervisor,
        })
    }

    pub fn index(&self, name: &str) -> Result<Arc<Index>, ClientError> {
        self.indexes_by_name
            .get(name)
            .cloned()
            .ok_or_else(|| ClientError::IndexNotFound {
                space: self.name.clone(),
                index: name.to_string(),
            })
    }

    pub fn index_by_id(&self, id: u32) -> Result<Arc<Index>, ClientError> {
        self.indexes_by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| ClientError::IndexNotFound {
                space: self.name.clone(),
                index: id.to_string(),
            })
    }

    /// Indexes ordered by id; the primary index comes first.
    pub fn indexes(&self) -> Vec<Arc<Index>> {
        let mut indexes: Vec<_> = self.indexes_by_id.values().cloned().collect();
        indexes.sort_by_key(|index| index.id);
        indexes
    }

    pub fn insert<T, R>(&self, tuple: &T) -> Result<Vec<R>, ClientError>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let request = Request::Insert {
            space_id: self.id,
            tuple: into_tuple(tuple)?,
        };
        upgrade(&self.supervisor)?.send(&request, None)?.into_data()
    }

    pub fn replace<T, R>(&self, tuple: &T) -> Result<Vec<R>, ClientError>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let request = Request::Replace {
            space_id: self.id,
            tuple: into_tuple(tuple)?,
        };
        upgrade(&self.supervisor)?.send(&request, None)?.into_data()
    }

    /// Inserts `tuple` if its key is absent, otherwise applies `ops` to the existing tuple.
    pub fn upsert<T: Serialize>(
        &self,
        tuple: &T,
        ops: Vec<UpdateOperation>,
    ) -> Result<(), ClientError> {
        let request = Request::Upsert {
            space_id: self.id,
            tuple: into_tuple(tuple)?,
            ops,
        };
        upgrade(&self.supervisor)?.send_no_response(&request, None)
    }

    /// Selects through the primary index.
    pub fn select<K, R>(&self, key: &K, options: SelectOptions) -> Result<Vec<R>, ClientError>
    where
        K: Serialize,
        R: DeserializeOwned,
    {
        let request = Request::Select {
            space_id: self.id,
            index_id: 0,
            key: into_tuple(key)?,
            options,
        };
        upgrade(&self.supervisor)?.send(&request, None)?.into_data()
    }

    /// Every tuple of the space in primary key order.
    pub fn all<R: DeserializeOwned>(&self) -> Result<Vec<R>, ClientError> {
        self.select(&(), SelectOptions::default().iterator(IteratorKind::All))
    }

    pub fn get<K, R>(&self, key: &K) -> Result<Option<R>, ClientError>
    where
        K: Serialize,
        R: DeserializeOwned,
    {
        let mut found = self.select(key, SelectOptions::default().limit(1))?;
        Ok(found.pop())
    }

    pub fn update<K, R>(&self, key: &K, ops: Vec<UpdateOperation>) -> Result<Vec<R>, ClientError>
    where
        K: Serialize,
        R: DeserializeOwned,
    {
        let request = Request::Update {
            space_id: self.id,
            index_id: 0,
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
            space_id: self.id,
            index_id: 0,
            key: into_tuple(key)?,
        };
        upgrade(&self.supervisor)?.send(&request, None)?.into_data()
    }
}

fn parse_field(field: &Value) -> Option<SpaceField> {
    let Value::Map(entries) = field else {
        return None;
    };

    let mut name = None;
    let mut kind = FieldKind::Any;
    let mut is_nullable = false;
    for (k, v) in entries {
        match k.as_str() {
            Some("name") => name = v.as_str().map(str::to_string),
            Some("type") => kind = v.as_str().map(FieldKind::from).unwrap_or(FieldKind::Any),
            Some("is_nullable") => is_nullable = v.as_bool().unwrap_or(false),
            _ => {}
        }
    }
    Some(SpaceField {
        name: name?,
        kind,
        is_nullable,
    })
}
