//! Record Database
//!
//! Typed rows over an ordered key/value [`Storage`], with unique constraints,
//! link rows for many-to-many relations, and a hash-chained write log. One
//! [`Connections`] value groups the default database with any attached ones.

mod events;
mod storage;
mod types;

pub use events::{EventLog, Hash32, LogEntry, Operation, WriteEvent};
pub use storage::{InMemoryStorage, Storage};
pub use types::{field_value, value_as_string, Link, Model, RowId, DEFAULT_DB};

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecDbError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("unique constraint violated on {registry}.{field} = {value}")]
    UniqueViolation {
        registry: &'static str,
        field: &'static str,
        value: String,
    },

    #[error("expected at most one {registry} row where {field} = {value}, found {found}")]
    MultipleRows {
        registry: &'static str,
        field: String,
        value: String,
        found: usize,
    },

    #[error("{registry} row {id} does not exist")]
    MissingRow { registry: &'static str, id: RowId },

    #[error("{registry} row has no id; insert it first")]
    NotPersisted { registry: &'static str },

    #[error("unknown database: {0}")]
    UnknownDatabase(String),

    #[error("database {0} is already attached")]
    AlreadyAttached(String),
}

pub type Result<T> = std::result::Result<T, RecDbError>;

fn row_prefix(registry: &str) -> Vec<u8> {
    format!("row/{registry}/").into_bytes()
}

fn row_key(registry: &str, id: RowId) -> Vec<u8> {
    format!("row/{registry}/{id:020}").into_bytes()
}

fn seq_key(registry: &str) -> Vec<u8> {
    format!("seq/{registry}").into_bytes()
}

fn link_prefix(relation: &str) -> Vec<u8> {
    format!("link/{relation}/").into_bytes()
}

fn link_key(link: &Link) -> Vec<u8> {
    let feature = link.feature.map(|f| format!("{f:020}")).unwrap_or_else(|| "-".into());
    let slot = link.slot.as_deref().unwrap_or("-");
    format!(
        "link/{}/{:020}/{:020}/{}/{}",
        link.relation, link.left, link.right, feature, slot
    )
    .into_bytes()
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| RecDbError::Serialization(e.to_string()))
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| RecDbError::Serialization(e.to_string()))
}

/// One relational schema: typed rows plus link rows.
pub struct Database<S: Storage> {
    name: String,
    storage: S,
    log: EventLog,
}

impl<S: Storage> Database<S> {
    pub fn new(name: impl Into<String>, storage: S) -> Self {
        Self {
            name: name.into(),
            storage,
            log: EventLog::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_DB
    }

    pub fn events(&self) -> &EventLog {
        &self.log
    }

    fn next_id(&mut self, registry: &str) -> Result<RowId> {
        let key = seq_key(registry);
        let current = match self.storage.get(&key)? {
            Some(bytes) => decode::<RowId>(&bytes)?,
            None => 0,
        };
        let next = current + 1;
        self.storage.put(&key, &encode(&next)?)?;
        Ok(next)
    }

    fn check_unique<M: Model>(&self, record: &M, own_id: Option<RowId>) -> Result<()> {
        for field in M::UNIQUE {
            let value = field_value(record, field)?;
            if value.is_null() {
                continue;
            }
            let clash = self
                .filter::<M>(field, &value)?
                .into_iter()
                .any(|other| other.id() != own_id);
            if clash {
                return Err(RecDbError::UniqueViolation {
                    registry: M::REGISTRY,
                    field,
                    value: value_as_string(&value).unwrap_or_default(),
                });
            }
        }
        Ok(())
    }

    /// Insert a new row, assigning its id.
    pub fn insert<M: Model>(&mut self, record: &mut M) -> Result<RowId> {
        self.check_unique(record, None)?;
        let id = self.next_id(M::REGISTRY)?;
        record.set_id(Some(id));
        self.storage.put(&row_key(M::REGISTRY, id), &encode(record)?)?;
        self.log.record(Operation::Insert, M::REGISTRY, id)?;
        Ok(id)
    }

    /// Overwrite an existing row.
    pub fn update<M: Model>(&mut self, record: &M) -> Result<()> {
        let id = record.id().ok_or(RecDbError::NotPersisted { registry: M::REGISTRY })?;
        let key = row_key(M::REGISTRY, id);
        if self.storage.get(&key)?.is_none() {
            return Err(RecDbError::MissingRow { registry: M::REGISTRY, id });
        }
        self.check_unique(record, Some(id))?;
        self.storage.put(&key, &encode(record)?)?;
        self.log.record(Operation::Update, M::REGISTRY, id)?;
        Ok(())
    }

    /// Insert when the row has no id yet, update otherwise.
    pub fn save<M: Model>(&mut self, record: &mut M) -> Result<RowId> {
        match record.id() {
            None => self.insert(record),
            Some(id) => {
                self.update(record)?;
                Ok(id)
            }
        }
    }

    pub fn get<M: Model>(&self, id: RowId) -> Result<Option<M>> {
        match self.storage.get(&row_key(M::REGISTRY, id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn all<M: Model>(&self) -> Result<Vec<M>> {
        self.storage
            .scan_prefix(&row_prefix(M::REGISTRY))?
            .iter()
            .map(|(_, v)| decode(v))
            .collect()
    }

    pub fn count<M: Model>(&self) -> Result<usize> {
        Ok(self.storage.scan_prefix(&row_prefix(M::REGISTRY))?.len())
    }

    /// Rows whose `field` equals `value`.
    pub fn filter<M: Model>(&self, field: &str, value: &Value) -> Result<Vec<M>> {
        self.filter_in(field, std::slice::from_ref(value))
    }

    /// Rows whose `field` equals any of `values`, in id order.
    pub fn filter_in<M: Model>(&self, field: &str, values: &[Value]) -> Result<Vec<M>> {
        let mut out = Vec::new();
        for record in self.all::<M>()? {
            let v = field_value(&record, field)?;
            if values.contains(&v) {
                out.push(record);
            }
        }
        Ok(out)
    }

    pub fn one_or_none<M: Model>(&self, field: &str, value: &Value) -> Result<Option<M>> {
        let mut rows = self.filter::<M>(field, value)?;
        match rows.len() {
            0 => Ok(None),
            1 => Ok(rows.pop()),
            found => Err(RecDbError::MultipleRows {
                registry: M::REGISTRY,
                field: field.to_string(),
                value: value_as_string(value).unwrap_or_default(),
                found,
            }),
        }
    }

    /// Add a link row. Returns `false` when the identical link already exists.
    pub fn link(&mut self, link: Link) -> Result<bool> {
        let key = link_key(&link);
        if self.storage.get(&key)?.is_some() {
            return Ok(false);
        }
        self.storage.put(&key, &encode(&link)?)?;
        self.log.record(Operation::Link, &link.relation, link.left)?;
        Ok(true)
    }

    pub fn unlink(&mut self, link: &Link) -> Result<()> {
        self.storage.delete(&link_key(link))?;
        self.log.record(Operation::Unlink, &link.relation, link.left)?;
        Ok(())
    }

    pub fn relation(&self, relation: &str) -> Result<Vec<Link>> {
        self.storage
            .scan_prefix(&link_prefix(relation))?
            .iter()
            .map(|(_, v)| decode(v))
            .collect()
    }

    /// Links of `relation` whose left side is `left`.
    pub fn links(&self, relation: &str, left: RowId) -> Result<Vec<Link>> {
        let prefix = format!("link/{relation}/{left:020}/").into_bytes();
        self.storage
            .scan_prefix(&prefix)?
            .iter()
            .map(|(_, v)| decode(v))
            .collect()
    }

    /// Links of `relation` whose right side is `right`.
    pub fn links_to(&self, relation: &str, right: RowId) -> Result<Vec<Link>> {
        Ok(self
            .relation(relation)?
            .into_iter()
            .filter(|l| l.right == right)
            .collect())
    }
}

/// The default database plus every attached schema.
pub struct Connections<S: Storage> {
    default: Database<S>,
    attached: BTreeMap<String, Database<S>>,
}

impl<S: Storage> Connections<S> {
    pub fn new(default_storage: S) -> Self {
        Self {
            default: Database::new(DEFAULT_DB, default_storage),
            attached: BTreeMap::new(),
        }
    }

    pub fn attach(&mut self, name: &str, storage: S) -> Result<()> {
        if name == DEFAULT_DB || self.attached.contains_key(name) {
            return Err(RecDbError::AlreadyAttached(name.to_string()));
        }
        self.attached.insert(name.to_string(), Database::new(name, storage));
        Ok(())
    }

    pub fn default_db(&self) -> &Database<S> {
        &self.default
    }

    pub fn default_db_mut(&mut self) -> &mut Database<S> {
        &mut self.default
    }

    pub fn using(&self, name: &str) -> Result<&Database<S>> {
        if name == DEFAULT_DB {
            return Ok(&self.default);
        }
        self.attached
            .get(name)
            .ok_or_else(|| RecDbError::UnknownDatabase(name.to_string()))
    }

    pub fn using_mut(&mut self, name: &str) -> Result<&mut Database<S>> {
        if name == DEFAULT_DB {
            return Ok(&mut self.default);
        }
        self.attached
            .get_mut(name)
            .ok_or_else(|| RecDbError::UnknownDatabase(name.to_string()))
    }

    pub fn attached_names(&self) -> Vec<&str> {
        self.attached.keys().map(|k| k.as_str()).collect()
    }
}
