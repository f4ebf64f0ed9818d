//! Client-side cache of the server's space and index catalog.
//!
//! The catalog is read from the `_vspace` and `_vindex` system views and cached until
//! [`Schema::reload`] is called again. Lookups by name or id hand out shared [`Space`]
//! handles whose operations encode tuples and keys through serde, so any `Serialize`
//! type shaped like a tuple (a Rust tuple, a `Vec`, a struct) can be stored and any
//! `DeserializeOwned` type of the same shape can be read back.
//!
//! ```no_run
//! use iproto::{Client, ClientConfig};
//!
//! let client = Client::connect("127.0.0.1:3301".parse::<ClientConfig>()?)?;
//! let performers = client.space("performer")?;
//! let inserted: Vec<(u64, String)> = performers.insert(&(1u64, "Bon Jovi"))?;
//! # Ok::<(), iproto::ClientError>(())
//! ```
mod index;
mod space;

use std::{
    collections::HashMap,
    sync::{Arc, RwLock, Weak},
};

use log::{debug, info};
use rmpv::Value;
use serde::{Serialize, Serializer};

use crate::{
    connection::Supervisor,
    error::ClientError,
    protocol::{IteratorKind, Request, SelectOptions},
};

pub use index::{Index, IndexKind, IndexPart};
pub use space::{FieldKind, Space, SpaceField, StorageEngine};

/// System view listing the spaces visible to the current user.
pub const VSPACE_ID: u32 = 281;
/// System view listing the indexes visible to the current user.
pub const VINDEX_ID: u32 = 289;

/// A primary key value that the server may generate itself.
///
/// `Auto` encodes as nil, which a sequence-backed primary key replaces with its next value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoKey {
    Explicit(u64),
    Auto,
}

impl Serialize for AutoKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            AutoKey::Explicit(id) => serializer.serialize_u64(*id),
            AutoKey::Auto => serializer.serialize_none(),
        }
    }
}

#[derive(Debug, Default)]
struct Catalog {
    by_name: HashMap<String, Arc<Space>>,
    by_id: HashMap<u32, Arc<Space>>,
}

pub struct Schema {
    supervisor: Weak<Supervisor>,
    catalog: RwLock<Option<Catalog>>,
}

impl Schema {
    pub fn new(supervisor: &Arc<Supervisor>) -> Self {
        Self {
            supervisor: Arc::downgrade(supervisor),
            catalog: RwLock::new(None),
        }
    }

    /// Re-reads every space and index definition, replacing the cached catalog.
    pub fn reload(&self) -> Result<(), ClientError> {
        let supervisor = upgrade(&self.supervisor)?;
        let everything = || SelectOptions::default().iterator(IteratorKind::All);

        let spaces: Vec<Value> = supervisor
            .send(
                &Request::Select {
                    space_id: VSPACE_ID,
                    index_id: 0,
                    key: Value::Array(vec![]),
                    options: everything(),
                },
                None,
            )?
            .into_data()?;
        let indexes: Vec<Value> = supervisor
            .send(
                &Request::Select {
                    space_id: VINDEX_ID,
                    index_id: 0,
                    key: Value::Array(vec![]),
                    options: everything(),
                },
                None,
            )?
            .into_data()?;

        let catalog = build_catalog(&spaces, &indexes, &self.supervisor)?;
        info!(
            "schema loaded: {} spaces, {} indexes",
            catalog.by_id.len(),
            indexes.len()
        );
        *self.catalog.write().unwrap_or_else(|e| e.into_inner()) = Some(catalog);
        Ok(())
    }

    fn loaded(&self) -> Result<(), ClientError> {
        let loaded = self
            .catalog
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some();
        if !loaded {
            self.reload()?;
        }
        Ok(())
    }

    /// Looks a space up by name, loading the catalog on first use.
    pub fn space(&self, name: &str) -> Result<Arc<Space>, ClientError> {
        self.loaded()?;
        let catalog = self.catalog.read().unwrap_or_else(|e| e.into_inner());
        catalog
            .as_ref()
            .and_then(|c| c.by_name.get(name))
            .cloned()
            .ok_or_else(|| ClientError::SpaceNotFound(name.to_string()))
    }

    pub fn space_by_id(&self, id: u32) -> Result<Arc<Space>, ClientError> {
        self.loaded()?;
        let catalog = self.catalog.read().unwrap_or_else(|e| e.into_inner());
        catalog
            .as_ref()
            .and_then(|c| c.by_id.get(&id))
            .cloned()
            .ok_or(ClientError::SpaceIdNotFound(id))
    }

    /// Cached spaces ordered by id. Empty until the first load.
    pub fn spaces(&self) -> Vec<Arc<Space>> {
        let catalog = self.catalog.read().unwrap_or_else(|e| e.into_inner());
        let mut spaces: Vec<_> = catalog
            .as_ref()
            .map(|c| c.by_id.values().cloned().collect())
            .unwrap_or_default();
        spaces.sort_by_key(|space| space.id);
        spaces
    }

    pub fn len(&self) -> usize {
        self.catalog
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(0, |c| c.by_id.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn build_catalog(
    spaces: &[Value],
    indexes: &[Value],
    supervisor: &Weak<Supervisor>,
) -> Result<Catalog, ClientError> {
    let mut grouped: HashMap<u32, Vec<Index>> = HashMap::new();
    for tuple in indexes {
        let index = Index::from_tuple(tuple, supervisor.clone())?;
        grouped.entry(index.space_id).or_default().push(index);
    }

    let mut catalog = Catalog::default();
    for tuple in spaces {
        let id = field_u32(tuple, 0, "space id")?;
        let space_indexes = grouped.remove(&id).unwrap_or_default();
        let space = Arc::new(Space::from_tuple(tuple, space_indexes, supervisor.clone())?);
        debug!("space {} '{}' ({:?})", space.id, space.name, space.engine);
        catalog.by_name.insert(space.name.clone(), Arc::clone(&space));
        catalog.by_id.insert(space.id, space);
    }
    Ok(catalog)
}

/// Serializes `value` as a request tuple.
///
/// Scalars are wrapped into a one-element tuple and unit becomes the empty tuple.
pub(crate) fn into_tuple<T: Serialize + ?Sized>(value: &T) -> Result<Value, ClientError> {
    Ok(match rmpv::ext::to_value(value)? {
        Value::Array(items) => Value::Array(items),
        Value::Nil => Value::Array(vec![]),
        scalar => Value::Array(vec![scalar]),
    })
}

pub(crate) fn upgrade(supervisor: &Weak<Supervisor>) -> Result<Arc<Supervisor>, ClientError> {
    supervisor.upgrade().ok_or(ClientError::NotConnected)
}

fn field<'a>(tuple: &'a Value, position: usize, what: &str) -> Result<&'a Value, ClientError> {
    tuple
        .as_array()
        .and_then(|fields| fields.get(position))
        .ok_or_else(|| ClientError::Conversion(format!("{what} missing at position {position}")))
}

pub(crate) fn field_u32(tuple: &Value, position: usize, what: &str) -> Result<u32, ClientError> {
    field(tuple, position, what)?
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| ClientError::Conversion(format!("{what} is not an unsigned integer")))
}

pub(crate) fn field_str<'a>(
    tuple: &'a Value,
    position: usize,
    what: &str,
) -> Result<&'a str, ClientError> {
    field(tuple, position, what)?
        .as_str()
        .ok_or_else(|| ClientError::Conversion(format!("{what} is not a string")))
}
