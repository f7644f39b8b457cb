//! Registry kinds and the capability traits every persisted type implements.

use recdb::{field_value, value_as_string, Model, RowId};
use serde::{Deserialize, Serialize};

use crate::ontology::PublicTerm;
use crate::schema::{CellType, Feature, Organism, ULabel};
use crate::{Error, Result};

/// Every registry this crate knows about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RegistryKind {
    User,
    Storage,
    Transform,
    Run,
    File,
    Dataset,
    Feature,
    FeatureSet,
    ULabel,
    Organism,
    CellType,
}

impl RegistryKind {
    pub const ALL: [RegistryKind; 11] = [
        RegistryKind::User,
        RegistryKind::Storage,
        RegistryKind::Transform,
        RegistryKind::Run,
        RegistryKind::File,
        RegistryKind::Dataset,
        RegistryKind::Feature,
        RegistryKind::FeatureSet,
        RegistryKind::ULabel,
        RegistryKind::Organism,
        RegistryKind::CellType,
    ];

    /// Schema-qualified name, as stored in `FeatureSet.registry`.
    pub fn name(self) -> &'static str {
        match self {
            RegistryKind::User => "core.User",
            RegistryKind::Storage => "core.Storage",
            RegistryKind::Transform => "core.Transform",
            RegistryKind::Run => "core.Run",
            RegistryKind::File => "core.File",
            RegistryKind::Dataset => "core.Dataset",
            RegistryKind::Feature => "core.Feature",
            RegistryKind::FeatureSet => "core.FeatureSet",
            RegistryKind::ULabel => "core.ULabel",
            RegistryKind::Organism => "bionty.Organism",
            RegistryKind::CellType => "bionty.CellType",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    /// Registries that can be grouped into feature sets and linked as labels.
    pub fn is_member(self) -> bool {
        matches!(
            self,
            RegistryKind::Feature | RegistryKind::ULabel | RegistryKind::Organism | RegistryKind::CellType
        )
    }
}

impl std::fmt::Display for RegistryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A registry field, e.g. `Feature::NAME`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Field {
    pub registry: RegistryKind,
    pub name: &'static str,
}

impl Field {
    pub const fn new(registry: RegistryKind, name: &'static str) -> Self {
        Self { registry, name }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ForeignKey {
    pub name: &'static str,
    pub target: RegistryKind,
}

/// Foreign keys rewritten in bulk before label records are persisted.
pub const FK_BULK: &[&str] = &["organism", "file"];

/// Provenance foreign keys re-pointed at the active run context on transfer.
pub const FK_PROVENANCE: &[&str] = &["created_by", "run", "transform"];

pub trait Record: Model {
    const KIND: RegistryKind;
    const FOREIGN_KEYS: &'static [ForeignKey] = &[];
    /// Foreign keys that may never be cleared.
    const REQUIRED_FOREIGN_KEYS: &'static [&'static str] = &[];
    /// Field used to match rows across databases.
    const UNIQUE_FIELD: &'static str = "uid";
    /// First string field shown for the record.
    const DEFAULT_STR_FIELD: &'static str = "name";

    fn foreign_key(&self, _name: &str) -> Option<RowId> {
        None
    }

    fn set_foreign_key(&mut self, _name: &str, _id: Option<RowId>) {}

    fn display(&self) -> String {
        field_value(self, Self::DEFAULT_STR_FIELD)
            .ok()
            .and_then(|v| value_as_string(&v))
            .unwrap_or_else(|| self.uid().to_string())
    }
}

/// Records that can be members of a feature set or labels of a host.
pub trait MemberRecord: Record {
    /// Parent link relation for hierarchical registries.
    const PARENTS: Option<&'static str> = None;
    /// Backed by a public ontology; new records are filled from it.
    const ONTOLOGY_BACKED: bool = false;
    /// Root registries never carry their ontology parents along.
    const ONTOLOGY_ROOT: bool = false;

    fn ontology_id(&self) -> Option<&str> {
        None
    }

    /// Build an unsaved record from a raw value of `field`.
    fn from_value(field: &str, value: &str, organism: Option<RowId>) -> Result<Self>;

    /// Build an unsaved record from a public ontology term.
    fn from_public(_term: &PublicTerm, _organism: Option<RowId>) -> Option<Self> {
        None
    }

    fn into_any(self) -> AnyRecord;
    fn from_any(any: AnyRecord) -> Option<Self>;
}

/// Records with a parent/child hierarchy.
pub trait HasParents: Record {
    const PARENTS_RELATION: &'static str;
}

/// Tagged union over the member registries.
#[derive(Clone, Debug, PartialEq)]
pub enum AnyRecord {
    Feature(Feature),
    ULabel(ULabel),
    Organism(Organism),
    CellType(CellType),
}

macro_rules! any_dispatch {
    ($self:expr, $r:ident => $body:expr) => {
        match $self {
            AnyRecord::Feature($r) => $body,
            AnyRecord::ULabel($r) => $body,
            AnyRecord::Organism($r) => $body,
            AnyRecord::CellType($r) => $body,
        }
    };
}

impl AnyRecord {
    pub fn kind(&self) -> RegistryKind {
        match self {
            AnyRecord::Feature(_) => RegistryKind::Feature,
            AnyRecord::ULabel(_) => RegistryKind::ULabel,
            AnyRecord::Organism(_) => RegistryKind::Organism,
            AnyRecord::CellType(_) => RegistryKind::CellType,
        }
    }

    pub fn id(&self) -> Option<RowId> {
        any_dispatch!(self, r => r.id())
    }

    pub fn uid(&self) -> &str {
        any_dispatch!(self, r => r.uid())
    }

    pub fn display(&self) -> String {
        any_dispatch!(self, r => r.display())
    }

    pub fn is_persisted(&self) -> bool {
        self.id().is_some()
    }
}

impl From<Feature> for AnyRecord {
    fn from(r: Feature) -> Self {
        AnyRecord::Feature(r)
    }
}

impl From<ULabel> for AnyRecord {
    fn from(r: ULabel) -> Self {
        AnyRecord::ULabel(r)
    }
}

impl From<Organism> for AnyRecord {
    fn from(r: Organism) -> Self {
        AnyRecord::Organism(r)
    }
}

impl From<CellType> for AnyRecord {
    fn from(r: CellType) -> Self {
        AnyRecord::CellType(r)
    }
}

/// Run `$body` with `$T` bound to the concrete member type behind `$kind`.
macro_rules! with_member_kind {
    ($kind:expr, $T:ident => $body:expr) => {
        match $kind {
            $crate::record::RegistryKind::Feature => {
                type $T = $crate::schema::Feature;
                $body
            }
            $crate::record::RegistryKind::ULabel => {
                type $T = $crate::schema::ULabel;
                $body
            }
            $crate::record::RegistryKind::Organism => {
                type $T = $crate::schema::Organism;
                $body
            }
            $crate::record::RegistryKind::CellType => {
                type $T = $crate::schema::CellType;
                $body
            }
            other => Err($crate::Error::Type(format!(
                "{other} records cannot be grouped into feature sets or used as labels"
            ))),
        }
    };
}
pub(crate) use with_member_kind;

/// Split a homogeneous list of `AnyRecord` back into typed records.
pub fn downcast_all<R: MemberRecord>(records: Vec<AnyRecord>) -> Result<Vec<R>> {
    records
        .into_iter()
        .map(|r| {
            let kind = r.kind();
            R::from_any(r).ok_or_else(|| {
                Error::Type(format!("expected {} records, got {kind}", R::KIND))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_names_round_trip() {
        for kind in RegistryKind::ALL {
            assert_eq!(RegistryKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(RegistryKind::from_name("core.Nope"), None);
    }

    #[test]
    fn test_downcast_rejects_mixed() {
        let mixed = vec![
            AnyRecord::from(ULabel::new("a")),
            AnyRecord::from(Organism::new("human", None)),
        ];
        assert!(matches!(downcast_all::<ULabel>(mixed), Err(Error::Type(_))));
    }
}
