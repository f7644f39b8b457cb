//! Records that own feature sets and labels.

use recdb::RowId;

use crate::record::{Record, RegistryKind};
use crate::schema::{Dataset, File};
use crate::{Error, Result};

/// Slot for the columns of a DataFrame.
pub const SLOT_COLUMNS: &str = "columns";
/// Slot for the variables of an annotated matrix.
pub const SLOT_VAR: &str = "var";
/// Slot for the observation metadata of an annotated matrix.
pub const SLOT_OBS: &str = "obs";
/// Slot for features attached through labels.
pub const SLOT_EXTERNAL: &str = "external";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HostKind {
    File,
    Dataset,
}

impl HostKind {
    pub fn registry(self) -> RegistryKind {
        match self {
            HostKind::File => RegistryKind::File,
            HostKind::Dataset => RegistryKind::Dataset,
        }
    }

    pub fn feature_sets_relation(self) -> &'static str {
        match self {
            HostKind::File => File::FEATURE_SETS,
            HostKind::Dataset => Dataset::FEATURE_SETS,
        }
    }

    /// Link relation between this host and labels of `label`.
    pub fn labels_relation(self, label: RegistryKind) -> String {
        format!("{}:{}", self.registry().name(), label.name())
    }

    pub fn input_relation(self) -> &'static str {
        match self {
            HostKind::File => crate::schema::Run::INPUT_FILES,
            HostKind::Dataset => crate::schema::Run::INPUT_DATASETS,
        }
    }
}

/// A persisted host row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostRef {
    pub kind: HostKind,
    pub id: RowId,
}

pub trait Host: Record {
    const HOST: HostKind;

    fn run_id(&self) -> Option<RowId> {
        self.foreign_key("run")
    }

    fn host_ref(&self) -> Result<HostRef> {
        let id = self
            .id()
            .ok_or_else(|| Error::Value(format!("save the {} before linking to it", Self::KIND)))?;
        Ok(HostRef { kind: Self::HOST, id })
    }
}

impl Host for File {
    const HOST: HostKind = HostKind::File;
}

impl Host for Dataset {
    const HOST: HostKind = HostKind::Dataset;
}
