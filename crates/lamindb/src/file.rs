use std::collections::BTreeMap;
use std::sync::RwLock;

use recdb::{Link, RowId, Storage};
use serde_json::json;
use tracing::warn;

use crate::dataframe::{AnnDataLike, DataFrame, DataObject};
use crate::hashing::{base62_20, hash_object};
use crate::host::{Host, SLOT_COLUMNS, SLOT_OBS, SLOT_VAR};
use crate::instance::Session;
use crate::record::Field;
use crate::run_context::track_input;
use crate::schema::{Feature, FeatureSet, File, ULabel};
use crate::settings::Verbosity;
use crate::{Error, Result};

/// Reads serialized data objects back from storage. Staging and streaming
/// live outside this crate.
pub trait StorageAccessor {
    /// Lazily opened annotated matrix.
    type Backed;

    fn load(&self, file: &File) -> Result<DataObject>;
    fn backed(&self, file: &File) -> Result<Self::Backed>;
}

/// Accessor over objects held in memory, keyed by file uid.
#[derive(Default)]
pub struct InMemoryObjects {
    objects: RwLock<BTreeMap<String, DataObject>>,
}

impl InMemoryObjects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, file: &File, object: DataObject) -> Result<()> {
        let mut guard = self
            .objects
            .write()
            .map_err(|_| Error::Runtime("object store lock poisoned".into()))?;
        guard.insert(file.uid.clone(), object);
        Ok(())
    }
}

impl StorageAccessor for InMemoryObjects {
    type Backed = AnnDataLike;

    fn load(&self, file: &File) -> Result<DataObject> {
        let guard = self
            .objects
            .read()
            .map_err(|_| Error::Runtime("object store lock poisoned".into()))?;
        guard
            .get(&file.uid)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no stored object for file {}", file.uid)))
    }

    fn backed(&self, file: &File) -> Result<AnnDataLike> {
        match self.load(file)? {
            DataObject::AnnData(adata) => Ok(adata),
            DataObject::DataFrame(_) => Err(Error::Value("stored object is not an AnnData object".into())),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct FileInit {
    pub key: Option<String>,
    pub description: Option<String>,
    pub storage: Option<RowId>,
    /// Supplied feature sets: at most one for a DataFrame, exactly two
    /// (var, obs) for an AnnData object. Derived when empty.
    pub feature_sets: Vec<FeatureSet>,
    /// Field the AnnData variables are validated against when deriving.
    pub var_field: Option<Field>,
}

impl File {
    /// New file from an in-memory object, or the stored one with the same hash.
    pub fn from_data<S: Storage>(session: &mut Session<'_, S>, data: &DataObject, init: FileInit) -> Result<File> {
        let (hash, size) = hash_object(data)?;
        let existing: Vec<File> = session.default_db().filter("hash", &json!(hash))?;
        if let Some(file) = existing.into_iter().next() {
            if session.logs(Verbosity::Warning) {
                warn!(uid = %file.uid, "returning existing file with same hash");
            }
            return Ok(file);
        }

        let pending_feature_sets = match data {
            DataObject::DataFrame(df) => dataframe_feature_sets(session, df, init.feature_sets)?,
            DataObject::AnnData(adata) => {
                let var_field = init.var_field.unwrap_or(ULabel::NAME);
                anndata_feature_sets(session, adata, init.feature_sets, var_field)?
            }
        };

        let mut file = File {
            id: None,
            uid: base62_20(),
            key: init.key,
            description: init.description,
            suffix: data.suffix().to_string(),
            hash: Some(hash),
            size: Some(size),
            storage_id: init.storage,
            run_id: None,
            transform_id: None,
            created_by_id: None,
            pending_feature_sets,
        };
        session.run_context.stamp(&mut file);
        Ok(file)
    }

    /// Save pending feature sets, the row, then the slot links.
    pub fn save<S: Storage>(&mut self, session: &mut Session<'_, S>) -> Result<()> {
        for (_, fs) in self.pending_feature_sets.iter_mut() {
            fs.save(session)?;
        }
        if self.id.is_none() {
            session.default_db_mut().insert(self)?;
        } else {
            session.default_db_mut().update(self)?;
        }
        let file_id = self.host_ref()?.id;
        for (slot, fs) in self.pending_feature_sets.drain(..) {
            let fs_id = fs.id.ok_or_else(|| Error::Runtime("feature set has no id after save".into()))?;
            session
                .default_db_mut()
                .link(Link::new(File::FEATURE_SETS, file_id, fs_id).with_slot(slot))?;
        }
        Ok(())
    }

    pub fn load<S: Storage, A: StorageAccessor>(
        &self,
        session: &mut Session<'_, S>,
        accessor: &A,
        is_run_input: bool,
    ) -> Result<DataObject> {
        self.track_run_input(session, is_run_input)?;
        accessor.load(self)
    }

    /// Lazily opened AnnData object for streaming.
    pub fn backed<A: StorageAccessor>(&self, accessor: &A) -> Result<A::Backed> {
        if !matches!(self.suffix.as_str(), ".h5ad" | ".zrad" | ".zarr") {
            return Err(Error::Value("file should have an AnnData object as the underlying data".into()));
        }
        accessor.backed(self)
    }

    fn track_run_input<S: Storage>(&self, session: &mut Session<'_, S>, is_run_input: bool) -> Result<()> {
        if !is_run_input {
            return Ok(());
        }
        let run = session.run_context.run.ok_or_else(|| {
            Error::Value("no run context set; call RunContext::track or link the input to a run".into())
        })?;
        track_input(session, run, self)?;
        Ok(())
    }
}

fn dataframe_feature_sets<S: Storage>(
    session: &mut Session<'_, S>,
    df: &DataFrame,
    supplied: Vec<FeatureSet>,
) -> Result<Vec<(String, FeatureSet)>> {
    if supplied.len() > 1 {
        return Err(Error::Value("a DataFrame takes at most one feature set".into()));
    }
    if let Some(fs) = supplied.into_iter().next() {
        return Ok(vec![(SLOT_COLUMNS.to_string(), fs)]);
    }
    Ok(FeatureSet::from_df(session, df, Feature::NAME, None, true, None)?
        .map(|fs| vec![(SLOT_COLUMNS.to_string(), fs)])
        .unwrap_or_default())
}

fn anndata_feature_sets<S: Storage>(
    session: &mut Session<'_, S>,
    adata: &AnnDataLike,
    supplied: Vec<FeatureSet>,
    var_field: Field,
) -> Result<Vec<(String, FeatureSet)>> {
    match supplied.len() {
        0 => {
            let mut out = Vec::new();
            if let Some(var) = FeatureSet::from_values(session, adata.var_names.as_slice(), var_field, None, None, true, None)? {
                out.push((SLOT_VAR.to_string(), var));
            }
            if let Some(obs) = FeatureSet::from_df(session, &adata.obs, Feature::NAME, None, true, None)? {
                out.push((SLOT_OBS.to_string(), obs));
            }
            Ok(out)
        }
        2 => {
            let mut it = supplied.into_iter();
            let (Some(var), Some(obs)) = (it.next(), it.next()) else {
                return Err(Error::Value("expected two feature sets".into()));
            };
            Ok(vec![(SLOT_VAR.to_string(), var), (SLOT_OBS.to_string(), obs)])
        }
        _ => Err(Error::Value(
            "please provide a feature set describing each `.var.index` & `.obs.columns`".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataframe::ColumnData;
    use crate::instance::Instance;
    use crate::schema::FeatureType;
    use crate::settings::Settings;
    use recdb::{InMemoryStorage, Model};

    fn df() -> DataFrame {
        DataFrame::new()
            .with_column("feat1", ColumnData::Int64(vec![1, 2]))
            .with_column("feat2", ColumnData::Object(vec!["a".into(), "b".into()]))
    }

    #[test]
    fn test_same_content_returns_existing() {
        let inst = Instance::new(InMemoryStorage::new(), Settings::default());
        let mut session = inst.session().unwrap();
        let data = DataObject::from(df());

        let mut file = File::from_data(&mut session, &data, FileInit::default()).unwrap();
        assert_eq!(file.suffix, ".parquet");
        assert!(file.pending_feature_sets.is_empty());
        file.save(&mut session).unwrap();

        let again = File::from_data(&mut session, &data, FileInit::default()).unwrap();
        assert_eq!(again.id, file.id);
    }

    #[test]
    fn test_dataframe_rejects_two_feature_sets() {
        let inst = Instance::new(InMemoryStorage::new(), Settings::default());
        let mut session = inst.session().unwrap();
        let mut f = Feature::draft("feat1", FeatureType::Number);
        session.default_db_mut().insert(&mut f).unwrap();
        let fs = FeatureSet::new(&session, vec![f.into()], None, None).unwrap();

        let init = FileInit { feature_sets: vec![fs.clone(), fs], ..FileInit::default() };
        assert!(matches!(
            File::from_data(&mut session, &DataObject::from(df()), init),
            Err(Error::Value(_))
        ));
    }

    #[test]
    fn test_anndata_requires_two_feature_sets() {
        let inst = Instance::new(InMemoryStorage::new(), Settings::default());
        let mut session = inst.session().unwrap();
        let mut f = Feature::draft("feat1", FeatureType::Number);
        session.default_db_mut().insert(&mut f).unwrap();
        let fs = FeatureSet::new(&session, vec![f.into()], None, None).unwrap();

        let adata = AnnDataLike { var_names: vec!["g1".into()], obs: df(), x: vec![vec![1.0], vec![2.0]] };
        let init = FileInit { feature_sets: vec![fs], ..FileInit::default() };
        assert!(matches!(
            File::from_data(&mut session, &DataObject::from(adata), init),
            Err(Error::Value(_))
        ));
    }

    #[test]
    fn test_load_tracks_run_input() {
        let inst = Instance::new(InMemoryStorage::new(), Settings::default());
        let mut session = inst.session().unwrap();
        let data = DataObject::from(df());
        let mut file = File::from_data(&mut session, &data, FileInit::default()).unwrap();
        file.save(&mut session).unwrap();

        let store = InMemoryObjects::new();
        store.put(&file, data.clone()).unwrap();
        assert_eq!(file.load(&mut session, &store, false).unwrap(), data);
        assert!(matches!(file.load(&mut session, &store, true), Err(Error::Value(_))));
        assert!(matches!(file.backed(&store), Err(Error::Value(_))));

        session.run_context.run = Some(7);
        file.load(&mut session, &store, true).unwrap();
        let links = session.default_db().links(crate::schema::Run::INPUT_FILES, 7).unwrap();
        assert_eq!(links[0].right, file.id().unwrap());
    }
}
