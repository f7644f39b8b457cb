//! Core types for the record database

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{RecDbError, Result};

/// Primary key of a row inside one database.
pub type RowId = u64;

/// Name of the primary database every other schema transfers into.
pub const DEFAULT_DB: &str = "default";

/// A row type the database knows how to persist.
///
/// Rows are stored as JSON objects, so any serialized field can be used in a
/// filter. Fields marked `#[serde(skip)]` never reach the store.
pub trait Model: Serialize + DeserializeOwned + Clone + Send + Sync {
    /// Schema-qualified registry name, e.g. `core.Feature`.
    const REGISTRY: &'static str;
    /// Fields checked for uniqueness on insert. Null values are exempt.
    const UNIQUE: &'static [&'static str] = &["uid"];

    fn id(&self) -> Option<RowId>;
    fn set_id(&mut self, id: Option<RowId>);
    fn uid(&self) -> &str;

    /// `true` once the row has been inserted somewhere.
    fn is_persisted(&self) -> bool {
        self.id().is_some()
    }
}

/// A many-to-many link row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub relation: String,
    pub left: RowId,
    pub right: RowId,
    /// Feature under which the link was made (label links).
    pub feature: Option<RowId>,
    /// Slot name (host to feature-set links).
    pub slot: Option<String>,
}

impl Link {
    pub fn new(relation: impl Into<String>, left: RowId, right: RowId) -> Self {
        Self {
            relation: relation.into(),
            left,
            right,
            feature: None,
            slot: None,
        }
    }

    pub fn with_feature(mut self, feature: Option<RowId>) -> Self {
        self.feature = feature;
        self
    }

    pub fn with_slot(mut self, slot: impl Into<String>) -> Self {
        self.slot = Some(slot.into());
        self
    }
}

/// Read a serialized field of a row; absent fields read as `Null`.
pub fn field_value<M: Serialize>(record: &M, field: &str) -> Result<Value> {
    let value = serde_json::to_value(record).map_err(|e| RecDbError::Serialization(e.to_string()))?;
    Ok(match value {
        Value::Object(mut map) => map.remove(field).unwrap_or(Value::Null),
        _ => Value::Null,
    })
}

/// String form of a scalar field value, as used by validation and lookups.
pub fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct Row {
        id: Option<RowId>,
        uid: String,
        name: String,
        #[serde(skip)]
        scratch: Vec<u8>,
    }

    #[test]
    fn test_field_value() {
        let row = Row { id: Some(3), uid: "u1".into(), name: "a".into(), scratch: vec![1] };
        assert_eq!(field_value(&row, "name").unwrap(), Value::String("a".into()));
        assert_eq!(field_value(&row, "id").unwrap(), serde_json::json!(3));
        assert_eq!(field_value(&row, "missing").unwrap(), Value::Null);
        assert_eq!(field_value(&row, "scratch").unwrap(), Value::Null);
    }

    #[test]
    fn test_value_as_string() {
        assert_eq!(value_as_string(&Value::Null), None);
        assert_eq!(value_as_string(&serde_json::json!(7)), Some("7".into()));
        assert_eq!(value_as_string(&serde_json::json!("x")), Some("x".into()));
    }
}
