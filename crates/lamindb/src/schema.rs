//! Registry row types.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use recdb::{Model, RowId};
use serde::{Deserialize, Serialize};

use crate::hashing::{base62_20, uid_from_key};
use crate::ontology::PublicTerm;
use crate::record::{AnyRecord, Field, ForeignKey, HasParents, MemberRecord, Record, RegistryKind};
use crate::{Error, Result};

macro_rules! model_ids {
    ($registry:expr, $unique:expr) => {
        const REGISTRY: &'static str = $registry;
        const UNIQUE: &'static [&'static str] = $unique;

        fn id(&self) -> Option<RowId> {
            self.id
        }
        fn set_id(&mut self, id: Option<RowId>) {
            self.id = id;
        }
        fn uid(&self) -> &str {
            &self.uid
        }
    };
}

fn ontology_uid(ontology_id: Option<&str>) -> String {
    match ontology_id {
        Some(id) => uid_from_key(id, 12),
        None => base62_20(),
    }
}

/// Feature and feature-set types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureType {
    Number,
    Category,
    Bool,
}

impl FeatureType {
    pub fn as_str(self) -> &'static str {
        match self {
            FeatureType::Number => "number",
            FeatureType::Category => "category",
            FeatureType::Bool => "bool",
        }
    }
}

impl FromStr for FeatureType {
    type Err = Error;

    /// Accepts the canonical names plus the dtype aliases `int`, `float`,
    /// `str` and `object`.
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "number" | "int" | "float" => Ok(FeatureType::Number),
            "category" | "str" | "object" => Ok(FeatureType::Category),
            "bool" => Ok(FeatureType::Bool),
            other => Err(Error::Value(format!(
                "type has to be one of 'number', 'category', 'bool', got {other:?}"
            ))),
        }
    }
}

impl std::fmt::Display for FeatureType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformKind {
    Notebook,
    App,
    Pipeline,
}

impl TransformKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransformKind::Notebook => "notebook",
            TransformKind::App => "app",
            TransformKind::Pipeline => "pipeline",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Option<RowId>,
    pub uid: String,
    pub handle: String,
    pub name: Option<String>,
}

impl User {
    pub fn new(handle: &str) -> Self {
        Self { id: None, uid: base62_20(), handle: handle.to_string(), name: None }
    }
}

impl Model for User {
    model_ids!("core.User", &["uid", "handle"]);
}

impl Record for User {
    const KIND: RegistryKind = RegistryKind::User;
    const DEFAULT_STR_FIELD: &'static str = "handle";
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StorageLocation {
    pub id: Option<RowId>,
    pub uid: String,
    pub root: String,
    pub region: Option<String>,
    pub created_by_id: Option<RowId>,
}

impl StorageLocation {
    pub fn new(root: &str) -> Self {
        Self { id: None, uid: base62_20(), root: root.to_string(), region: None, created_by_id: None }
    }
}

impl Model for StorageLocation {
    model_ids!("core.Storage", &["uid", "root"]);
}

impl Record for StorageLocation {
    const KIND: RegistryKind = RegistryKind::Storage;
    const FOREIGN_KEYS: &'static [ForeignKey] =
        &[ForeignKey { name: "created_by", target: RegistryKind::User }];
    const UNIQUE_FIELD: &'static str = "root";
    const DEFAULT_STR_FIELD: &'static str = "root";

    fn foreign_key(&self, name: &str) -> Option<RowId> {
        match name {
            "created_by" => self.created_by_id,
            _ => None,
        }
    }

    fn set_foreign_key(&mut self, name: &str, id: Option<RowId>) {
        if name == "created_by" {
            self.created_by_id = id;
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub id: Option<RowId>,
    pub uid: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TransformKind,
    pub version: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub created_by_id: Option<RowId>,
}

impl Transform {
    pub fn new(name: &str, kind: TransformKind) -> Self {
        Self {
            id: None,
            uid: base62_20(),
            name: name.to_string(),
            kind,
            version: None,
            updated_at: Utc::now(),
            created_by_id: None,
        }
    }
}

impl Model for Transform {
    model_ids!("core.Transform", &["uid"]);
}

impl Record for Transform {
    const KIND: RegistryKind = RegistryKind::Transform;
    const FOREIGN_KEYS: &'static [ForeignKey] =
        &[ForeignKey { name: "created_by", target: RegistryKind::User }];

    fn foreign_key(&self, name: &str) -> Option<RowId> {
        match name {
            "created_by" => self.created_by_id,
            _ => None,
        }
    }

    fn set_foreign_key(&mut self, name: &str, id: Option<RowId>) {
        if name == "created_by" {
            self.created_by_id = id;
        }
    }
}

impl HasParents for Transform {
    const PARENTS_RELATION: &'static str = "core.Transform:parents";
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: Option<RowId>,
    pub uid: String,
    pub transform_id: RowId,
    pub run_at: DateTime<Utc>,
    pub created_by_id: Option<RowId>,
}

impl Run {
    pub const INPUT_FILES: &'static str = "core.Run:input_files";
    pub const INPUT_DATASETS: &'static str = "core.Run:input_datasets";

    pub fn new(transform_id: RowId, created_by_id: Option<RowId>) -> Self {
        Self { id: None, uid: base62_20(), transform_id, run_at: Utc::now(), created_by_id }
    }
}

impl Model for Run {
    model_ids!("core.Run", &["uid"]);
}

impl Record for Run {
    const KIND: RegistryKind = RegistryKind::Run;
    const FOREIGN_KEYS: &'static [ForeignKey] = &[
        ForeignKey { name: "transform", target: RegistryKind::Transform },
        ForeignKey { name: "created_by", target: RegistryKind::User },
    ];
    const REQUIRED_FOREIGN_KEYS: &'static [&'static str] = &["transform"];
    const DEFAULT_STR_FIELD: &'static str = "run_at";

    fn foreign_key(&self, name: &str) -> Option<RowId> {
        match name {
            "transform" => Some(self.transform_id),
            "created_by" => self.created_by_id,
            _ => None,
        }
    }

    fn set_foreign_key(&mut self, name: &str, id: Option<RowId>) {
        match name {
            "transform" => {
                if let Some(id) = id {
                    self.transform_id = id;
                }
            }
            "created_by" => self.created_by_id = id,
            _ => {}
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct File {
    pub id: Option<RowId>,
    pub uid: String,
    pub key: Option<String>,
    pub description: Option<String>,
    pub suffix: String,
    pub hash: Option<String>,
    pub size: Option<u64>,
    pub storage_id: Option<RowId>,
    pub run_id: Option<RowId>,
    pub transform_id: Option<RowId>,
    pub created_by_id: Option<RowId>,
    /// Feature sets to link on save, keyed by slot.
    #[serde(skip)]
    pub pending_feature_sets: Vec<(String, FeatureSet)>,
}

impl File {
    pub const FEATURE_SETS: &'static str = "core.File:feature_sets";
}

impl Model for File {
    model_ids!("core.File", &["uid"]);
}

impl Record for File {
    const KIND: RegistryKind = RegistryKind::File;
    const FOREIGN_KEYS: &'static [ForeignKey] = &[
        ForeignKey { name: "storage", target: RegistryKind::Storage },
        ForeignKey { name: "run", target: RegistryKind::Run },
        ForeignKey { name: "transform", target: RegistryKind::Transform },
        ForeignKey { name: "created_by", target: RegistryKind::User },
    ];
    const DEFAULT_STR_FIELD: &'static str = "key";

    fn foreign_key(&self, name: &str) -> Option<RowId> {
        match name {
            "storage" => self.storage_id,
            "run" => self.run_id,
            "transform" => self.transform_id,
            "created_by" => self.created_by_id,
            _ => None,
        }
    }

    fn set_foreign_key(&mut self, name: &str, id: Option<RowId>) {
        match name {
            "storage" => self.storage_id = id,
            "run" => self.run_id = id,
            "transform" => self.transform_id = id,
            "created_by" => self.created_by_id = id,
            _ => {}
        }
    }

    fn display(&self) -> String {
        self.key
            .clone()
            .or_else(|| self.description.clone())
            .unwrap_or_else(|| self.uid.clone())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: Option<RowId>,
    pub uid: String,
    pub name: String,
    pub description: Option<String>,
    pub version: Option<String>,
    pub hash: Option<String>,
    pub file_id: Option<RowId>,
    pub run_id: Option<RowId>,
    pub transform_id: Option<RowId>,
    pub created_by_id: Option<RowId>,
    /// Wrapped single file, saved before the dataset row.
    #[serde(skip)]
    pub pending_file: Option<File>,
    /// Member files of a multi-file dataset, linked on save.
    #[serde(skip)]
    pub pending_files: Vec<File>,
    #[serde(skip)]
    pub pending_feature_sets: Vec<(String, FeatureSet)>,
}

impl Dataset {
    pub const FILES: &'static str = "core.Dataset:files";
    pub const FEATURE_SETS: &'static str = "core.Dataset:feature_sets";
}

impl Model for Dataset {
    model_ids!("core.Dataset", &["uid", "hash"]);
}

impl Record for Dataset {
    const KIND: RegistryKind = RegistryKind::Dataset;
    const FOREIGN_KEYS: &'static [ForeignKey] = &[
        ForeignKey { name: "file", target: RegistryKind::File },
        ForeignKey { name: "run", target: RegistryKind::Run },
        ForeignKey { name: "transform", target: RegistryKind::Transform },
        ForeignKey { name: "created_by", target: RegistryKind::User },
    ];

    fn foreign_key(&self, name: &str) -> Option<RowId> {
        match name {
            "file" => self.file_id,
            "run" => self.run_id,
            "transform" => self.transform_id,
            "created_by" => self.created_by_id,
            _ => None,
        }
    }

    fn set_foreign_key(&mut self, name: &str, id: Option<RowId>) {
        match name {
            "file" => self.file_id = id,
            "run" => self.run_id = id,
            "transform" => self.transform_id = id,
            "created_by" => self.created_by_id = id,
            _ => {}
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: Option<RowId>,
    pub uid: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FeatureType,
    /// `|`-joined names of the label registries grouped under this feature.
    pub registries: Option<String>,
    pub created_by_id: Option<RowId>,
}

impl Feature {
    pub const NAME: Field = Field::new(RegistryKind::Feature, "name");
    pub const UID: Field = Field::new(RegistryKind::Feature, "uid");

    /// Unsaved feature without the name check; see `Feature::new`.
    pub fn draft(name: &str, kind: FeatureType) -> Self {
        Self {
            id: None,
            uid: base62_20(),
            name: name.to_string(),
            kind,
            registries: None,
            created_by_id: None,
        }
    }

    pub fn registry_list(&self) -> Vec<&str> {
        self.registries
            .as_deref()
            .map(|r| r.split('|').filter(|s| !s.is_empty()).collect())
            .unwrap_or_default()
    }
}

impl Model for Feature {
    model_ids!("core.Feature", &["uid"]);
}

impl Record for Feature {
    const KIND: RegistryKind = RegistryKind::Feature;
    const FOREIGN_KEYS: &'static [ForeignKey] =
        &[ForeignKey { name: "created_by", target: RegistryKind::User }];
    const UNIQUE_FIELD: &'static str = "name";

    fn foreign_key(&self, name: &str) -> Option<RowId> {
        match name {
            "created_by" => self.created_by_id,
            _ => None,
        }
    }

    fn set_foreign_key(&mut self, name: &str, id: Option<RowId>) {
        if name == "created_by" {
            self.created_by_id = id;
        }
    }
}

impl MemberRecord for Feature {
    fn from_value(field: &str, value: &str, _organism: Option<RowId>) -> Result<Self> {
        Err(Error::Value(format!(
            "cannot create feature from {field}={value:?} without a type; create it with Feature::new"
        )))
    }

    fn into_any(self) -> AnyRecord {
        AnyRecord::Feature(self)
    }

    fn from_any(any: AnyRecord) -> Option<Self> {
        match any {
            AnyRecord::Feature(r) => Some(r),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub id: Option<RowId>,
    pub uid: String,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<FeatureType>,
    pub n: usize,
    /// Schema-qualified name of the member registry.
    pub registry: String,
    pub hash: String,
    #[serde(skip)]
    pub pending_members: Vec<AnyRecord>,
}

impl FeatureSet {
    pub fn members_relation(registry: &str) -> String {
        format!("core.FeatureSet:{registry}")
    }

    pub fn member_kind(&self) -> Result<RegistryKind> {
        RegistryKind::from_name(&self.registry)
            .ok_or_else(|| Error::Value(format!("unknown registry {}", self.registry)))
    }
}

impl Model for FeatureSet {
    model_ids!("core.FeatureSet", &["uid", "hash"]);
}

impl Record for FeatureSet {
    const KIND: RegistryKind = RegistryKind::FeatureSet;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ULabel {
    pub id: Option<RowId>,
    pub uid: String,
    pub name: String,
    pub description: Option<String>,
    pub created_by_id: Option<RowId>,
}

impl ULabel {
    pub const NAME: Field = Field::new(RegistryKind::ULabel, "name");

    pub fn new(name: &str) -> Self {
        Self { id: None, uid: base62_20(), name: name.to_string(), description: None, created_by_id: None }
    }
}

impl Model for ULabel {
    model_ids!("core.ULabel", &["uid"]);
}

impl Record for ULabel {
    const KIND: RegistryKind = RegistryKind::ULabel;
    const FOREIGN_KEYS: &'static [ForeignKey] =
        &[ForeignKey { name: "created_by", target: RegistryKind::User }];
    const UNIQUE_FIELD: &'static str = "name";

    fn foreign_key(&self, name: &str) -> Option<RowId> {
        match name {
            "created_by" => self.created_by_id,
            _ => None,
        }
    }

    fn set_foreign_key(&mut self, name: &str, id: Option<RowId>) {
        if name == "created_by" {
            self.created_by_id = id;
        }
    }
}

impl MemberRecord for ULabel {
    const PARENTS: Option<&'static str> = Some("core.ULabel:parents");

    fn from_value(field: &str, value: &str, _organism: Option<RowId>) -> Result<Self> {
        let mut label = ULabel::new(value);
        match field {
            "name" => {}
            "uid" => label.uid = value.to_string(),
            other => return Err(Error::Value(format!("cannot create ULabel from field {other}"))),
        }
        Ok(label)
    }

    fn into_any(self) -> AnyRecord {
        AnyRecord::ULabel(self)
    }

    fn from_any(any: AnyRecord) -> Option<Self> {
        match any {
            AnyRecord::ULabel(r) => Some(r),
            _ => None,
        }
    }
}

impl HasParents for ULabel {
    const PARENTS_RELATION: &'static str = "core.ULabel:parents";
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Organism {
    pub id: Option<RowId>,
    pub uid: String,
    pub name: String,
    pub ontology_id: Option<String>,
    pub created_by_id: Option<RowId>,
}

impl Organism {
    pub const NAME: Field = Field::new(RegistryKind::Organism, "name");
    pub const ONTOLOGY_ID: Field = Field::new(RegistryKind::Organism, "ontology_id");

    /// Records with an ontology id get a uid derived from it.
    pub fn new(name: &str, ontology_id: Option<&str>) -> Self {
        Self {
            id: None,
            uid: ontology_uid(ontology_id),
            name: name.to_string(),
            ontology_id: ontology_id.map(str::to_string),
            created_by_id: None,
        }
    }
}

impl Model for Organism {
    model_ids!("bionty.Organism", &["uid"]);
}

impl Record for Organism {
    const KIND: RegistryKind = RegistryKind::Organism;
    const FOREIGN_KEYS: &'static [ForeignKey] =
        &[ForeignKey { name: "created_by", target: RegistryKind::User }];

    fn foreign_key(&self, name: &str) -> Option<RowId> {
        match name {
            "created_by" => self.created_by_id,
            _ => None,
        }
    }

    fn set_foreign_key(&mut self, name: &str, id: Option<RowId>) {
        if name == "created_by" {
            self.created_by_id = id;
        }
    }
}

impl MemberRecord for Organism {
    const ONTOLOGY_BACKED: bool = true;
    const ONTOLOGY_ROOT: bool = true;

    fn ontology_id(&self) -> Option<&str> {
        self.ontology_id.as_deref()
    }

    fn from_value(field: &str, value: &str, _organism: Option<RowId>) -> Result<Self> {
        match field {
            "name" => Ok(Organism::new(value, None)),
            "ontology_id" => Ok(Organism::new(value, Some(value))),
            other => Err(Error::Value(format!("cannot create Organism from field {other}"))),
        }
    }

    fn from_public(term: &PublicTerm, _organism: Option<RowId>) -> Option<Self> {
        Some(Organism::new(&term.name, Some(&term.ontology_id)))
    }

    fn into_any(self) -> AnyRecord {
        AnyRecord::Organism(self)
    }

    fn from_any(any: AnyRecord) -> Option<Self> {
        match any {
            AnyRecord::Organism(r) => Some(r),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CellType {
    pub id: Option<RowId>,
    pub uid: String,
    pub name: String,
    pub ontology_id: Option<String>,
    pub organism_id: Option<RowId>,
    pub created_by_id: Option<RowId>,
}

impl CellType {
    pub const NAME: Field = Field::new(RegistryKind::CellType, "name");
    pub const ONTOLOGY_ID: Field = Field::new(RegistryKind::CellType, "ontology_id");

    pub fn new(name: &str, ontology_id: Option<&str>, organism_id: Option<RowId>) -> Self {
        Self {
            id: None,
            uid: ontology_uid(ontology_id),
            name: name.to_string(),
            ontology_id: ontology_id.map(str::to_string),
            organism_id,
            created_by_id: None,
        }
    }
}

impl Model for CellType {
    model_ids!("bionty.CellType", &["uid"]);
}

impl Record for CellType {
    const KIND: RegistryKind = RegistryKind::CellType;
    const FOREIGN_KEYS: &'static [ForeignKey] = &[
        ForeignKey { name: "organism", target: RegistryKind::Organism },
        ForeignKey { name: "created_by", target: RegistryKind::User },
    ];

    fn foreign_key(&self, name: &str) -> Option<RowId> {
        match name {
            "organism" => self.organism_id,
            "created_by" => self.created_by_id,
            _ => None,
        }
    }

    fn set_foreign_key(&mut self, name: &str, id: Option<RowId>) {
        match name {
            "organism" => self.organism_id = id,
            "created_by" => self.created_by_id = id,
            _ => {}
        }
    }
}

impl MemberRecord for CellType {
    const PARENTS: Option<&'static str> = Some("bionty.CellType:parents");
    const ONTOLOGY_BACKED: bool = true;

    fn ontology_id(&self) -> Option<&str> {
        self.ontology_id.as_deref()
    }

    fn from_value(field: &str, value: &str, organism: Option<RowId>) -> Result<Self> {
        match field {
            "name" => Ok(CellType::new(value, None, organism)),
            "ontology_id" => Ok(CellType::new(value, Some(value), organism)),
            other => Err(Error::Value(format!("cannot create CellType from field {other}"))),
        }
    }

    fn from_public(term: &PublicTerm, organism: Option<RowId>) -> Option<Self> {
        Some(CellType::new(&term.name, Some(&term.ontology_id), organism))
    }

    fn into_any(self) -> AnyRecord {
        AnyRecord::CellType(self)
    }

    fn from_any(any: AnyRecord) -> Option<Self> {
        match any {
            AnyRecord::CellType(r) => Some(r),
            _ => None,
        }
    }
}

impl HasParents for CellType {
    const PARENTS_RELATION: &'static str = "bionty.CellType:parents";
}

#[cfg(test)]
mod tests {
    use super::*;
    use recdb::field_value;

    #[test]
    fn test_feature_type_casting() {
        assert_eq!("int".parse::<FeatureType>().unwrap(), FeatureType::Number);
        assert_eq!("float".parse::<FeatureType>().unwrap(), FeatureType::Number);
        assert_eq!("str".parse::<FeatureType>().unwrap(), FeatureType::Category);
        assert_eq!("object".parse::<FeatureType>().unwrap(), FeatureType::Category);
        assert!(matches!("datetime".parse::<FeatureType>(), Err(Error::Value(_))));
    }

    #[test]
    fn test_type_field_is_stored_as_type() {
        let f = Feature::draft("feat1", FeatureType::Number);
        assert_eq!(field_value(&f, "type").unwrap(), serde_json::json!("number"));
    }

    #[test]
    fn test_default_display_fields() {
        let user = User::new("testuser1");
        assert_eq!(user.display(), "testuser1");

        let mut file = File {
            id: None,
            uid: base62_20(),
            key: None,
            description: Some("my data".into()),
            suffix: ".parquet".into(),
            hash: None,
            size: None,
            storage_id: None,
            run_id: None,
            transform_id: None,
            created_by_id: None,
            pending_feature_sets: Vec::new(),
        };
        assert_eq!(file.display(), "my data");
        file.key = Some("a/b.parquet".into());
        assert_eq!(file.display(), "a/b.parquet");
    }

    #[test]
    fn test_foreign_keys_round_trip() {
        let mut ct = CellType::new("T cell", Some("CL:0000084"), Some(3));
        assert_eq!(ct.foreign_key("organism"), Some(3));
        ct.set_foreign_key("organism", Some(9));
        assert_eq!(ct.organism_id, Some(9));
        for fk in CellType::FOREIGN_KEYS {
            ct.set_foreign_key(fk.name, None);
            assert_eq!(ct.foreign_key(fk.name), None);
        }
    }

    #[test]
    fn test_registry_list() {
        let mut f = Feature::draft("tissue", FeatureType::Category);
        assert!(f.registry_list().is_empty());
        f.registries = Some("core.ULabel|bionty.CellType".into());
        assert_eq!(f.registry_list(), vec!["core.ULabel", "bionty.CellType"]);
    }
}
