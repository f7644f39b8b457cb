//! Feature and label registry
//!
//! Content-addressed feature sets, validated labels on files and datasets,
//! transfer of records from attached databases into the default one, and
//! lineage graphs over parents and runs. Persistence is delegated to
//! [`recdb`]; every operation runs inside a [`Session`] that holds the
//! connections for its whole duration.

mod error;
pub mod hashing;
pub mod settings;
pub mod record;
pub mod schema;
pub mod ontology;
pub mod instance;
pub mod run_context;
mod index;
pub mod registry;
pub mod dataframe;
mod feature;
mod feature_set;
pub mod host;
pub mod file;
mod dataset;
pub mod transfer;
pub mod labels;
pub mod features;
pub mod parents;

pub use error::{Error, Result};
pub use dataframe::{AnnDataLike, ColumnData, DataFrame, DataObject};
pub use dataset::DatasetInit;
pub use features::FeatureManager;
pub use file::{FileInit, InMemoryObjects, StorageAccessor};
pub use host::{Host, HostKind, HostRef, SLOT_COLUMNS, SLOT_EXTERNAL, SLOT_OBS, SLOT_VAR};
pub use instance::{Instance, Session};
pub use labels::LabelManager;
pub use ontology::{InMemoryOntology, PublicSource, PublicTerm};
pub use parents::{view_flow, view_parents, LineageGraph, LineageNode};
pub use record::{AnyRecord, Field, MemberRecord, Record, RegistryKind};
pub use run_context::{track_input, RunContext};
pub use schema::{
    CellType, Dataset, Feature, FeatureSet, FeatureType, File, Organism, Run, StorageLocation, Transform,
    TransformKind, ULabel, User,
};
pub use settings::{Settings, Verbosity};
pub use transfer::{save_from, transfer_to_default_db, FkCache};
