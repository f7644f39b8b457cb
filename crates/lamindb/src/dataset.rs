use std::collections::BTreeSet;

use recdb::{Link, Model, RowId, Storage};
use serde_json::json;
use tracing::info;

use crate::dataframe::{AnnDataLike, DataFrame, DataObject};
use crate::file::{FileInit, StorageAccessor};
use crate::hashing::{base62_20, hash_set};
use crate::host::Host;
use crate::instance::Session;
use crate::run_context::track_input;
use crate::schema::{Dataset, FeatureSet, File};
use crate::settings::Verbosity;
use crate::{Error, Result};

#[derive(Clone, Debug, Default)]
pub struct DatasetInit {
    /// In-memory object wrapped into a new single file.
    pub data: Option<DataObject>,
    pub name: String,
    pub description: Option<String>,
    pub version: Option<String>,
    /// Existing single file.
    pub file: Option<File>,
    /// Member files of a multi-file dataset.
    pub files: Vec<File>,
    pub hash: Option<String>,
    /// Supplied feature sets with their slots. An AnnData object needs
    /// exactly two: `var` and `obs`.
    pub feature_sets: Vec<(String, FeatureSet)>,
}

impl Dataset {
    /// New dataset, or the stored one with the same hash.
    pub fn new<S: Storage>(session: &mut Session<'_, S>, init: DatasetInit) -> Result<Dataset> {
        let DatasetInit { data, name, description, version, mut file, files, mut hash, mut feature_sets } = init;

        if file.is_some() && !files.is_empty() {
            return Err(Error::Value("pass either a file or files, not both".into()));
        }
        if data.is_some() && (file.is_some() || !files.is_empty()) {
            return Err(Error::Value("pass either data or files, not both".into()));
        }

        let mut uid = base62_20();
        if let Some(data) = data {
            if matches!(data, DataObject::AnnData(_)) && feature_sets.len() != 2 {
                return Err(Error::Value(
                    "please provide a feature set describing each `.var.index` & `.obs.columns`".into(),
                ));
            }
            let file_init = FileInit {
                feature_sets: feature_sets.iter().map(|(_, fs)| fs.clone()).collect(),
                ..FileInit::default()
            };
            let new_file = File::from_data(session, &data, file_init)?;
            feature_sets = new_file.pending_feature_sets.clone();
            hash = new_file.hash.clone();
            uid = new_file.uid.clone();
            file = Some(new_file);
        } else if let Some(f) = &file {
            hash = hash.or_else(|| f.hash.clone());
        }

        if let Some(h) = &hash {
            if let Some(existing) = session.default_db().one_or_none::<Dataset>("hash", &json!(h))? {
                if session.logs(Verbosity::Success) {
                    info!(uid = %existing.uid, name = %existing.name, "loaded dataset with same hash");
                }
                return Ok(existing);
            }
        }

        let file_id = file.as_ref().and_then(|f| f.id);
        let mut dataset = Dataset {
            id: None,
            uid,
            name,
            description,
            version,
            hash,
            file_id,
            run_id: None,
            transform_id: None,
            created_by_id: None,
            pending_file: file,
            pending_files: files,
            pending_feature_sets: feature_sets,
        };
        session.run_context.stamp(&mut dataset);
        Ok(dataset)
    }

    /// Multi-file dataset over persisted files that share their feature sets.
    pub fn from_files<S: Storage>(session: &mut Session<'_, S>, name: &str, files: Vec<File>) -> Result<Dataset> {
        if files.is_empty() {
            return Err(Error::Value("provide at least one file".into()));
        }
        let mut file_ids = Vec::with_capacity(files.len());
        for f in &files {
            file_ids.push(f.host_ref()?.id);
        }

        let mut feature_sets: Vec<(String, FeatureSet)> = Vec::new();
        {
            let db = session.default_db();
            for link in db.relation(File::FEATURE_SETS)? {
                if !file_ids.contains(&link.left) || feature_sets.iter().any(|(_, fs)| fs.id == Some(link.right)) {
                    continue;
                }
                let fs: FeatureSet = db.get(link.right)?.ok_or(recdb::RecDbError::MissingRow {
                    registry: FeatureSet::REGISTRY,
                    id: link.right,
                })?;
                feature_sets.push((link.slot.unwrap_or_default(), fs));
            }
        }
        let ids_types: BTreeSet<(Option<RowId>, Option<&str>)> = feature_sets
            .iter()
            .map(|(_, fs)| (fs.id, fs.kind.map(|k| k.as_str())))
            .collect();
        let types: BTreeSet<Option<&str>> = ids_types.iter().map(|(_, t)| *t).collect();
        if ids_types.len() != types.len() {
            return Err(Error::Value(
                "Currently only supporting datasets from files with same feature sets".into(),
            ));
        }

        let hashes: Vec<String> = files
            .iter()
            .map(|f| f.hash.clone().ok_or_else(|| Error::Value(format!("file {} has no hash", f.uid))))
            .collect::<Result<_>>()?;
        let distinct: BTreeSet<&String> = hashes.iter().collect();
        assert_eq!(hashes.len(), distinct.len(), "duplicate file hashes");
        let hash = hash_set(&hashes);

        Dataset::new(
            session,
            DatasetInit { name: name.to_string(), files, hash: Some(hash), feature_sets, ..DatasetInit::default() },
        )
    }

    /// Save the wrapped file, feature sets, the row, then its links.
    pub fn save<S: Storage>(&mut self, session: &mut Session<'_, S>) -> Result<()> {
        if let Some(file) = self.pending_file.as_mut() {
            file.save(session)?;
            self.file_id = file.id;
        }
        for (_, fs) in self.pending_feature_sets.iter_mut() {
            fs.save(session)?;
        }
        if self.id.is_none() {
            session.default_db_mut().insert(self)?;
        } else {
            session.default_db_mut().update(self)?;
        }
        let dataset_id = self.host_ref()?.id;

        for file in self.pending_files.drain(..) {
            let file_id = file.host_ref()?.id;
            session.default_db_mut().link(Link::new(Dataset::FILES, dataset_id, file_id))?;
        }
        for (slot, fs) in self.pending_feature_sets.drain(..) {
            let fs_id = fs.id.ok_or_else(|| Error::Runtime("feature set has no id after save".into()))?;
            session
                .default_db_mut()
                .link(Link::new(Dataset::FEATURE_SETS, dataset_id, fs_id).with_slot(slot))?;
        }
        self.pending_file = None;
        Ok(())
    }

    /// Member files of a multi-file dataset stored in `db`.
    pub fn files<S: Storage>(&self, session: &Session<'_, S>, db: &str) -> Result<Vec<File>> {
        let Some(id) = self.id else {
            return Ok(self.pending_files.clone());
        };
        let database = session.using(db)?;
        let mut out = Vec::new();
        for link in database.links(Dataset::FILES, id)? {
            let file: File = database.get(link.right)?.ok_or(recdb::RecDbError::MissingRow {
                registry: File::REGISTRY,
                id: link.right,
            })?;
            out.push(file);
        }
        Ok(out)
    }

    fn single_file<S: Storage>(&self, session: &Session<'_, S>) -> Result<Option<File>> {
        if let Some(file) = &self.pending_file {
            return Ok(Some(file.clone()));
        }
        match self.file_id {
            Some(id) => Ok(session.default_db().get(id)?),
            None => Ok(None),
        }
    }

    pub fn backed<S: Storage, A: StorageAccessor>(&self, session: &Session<'_, S>, accessor: &A) -> Result<A::Backed> {
        let file = self
            .single_file(session)?
            .ok_or_else(|| Error::Runtime("can only call backed() for datasets with a single file".into()))?;
        file.backed(accessor)
    }

    /// Load the combined data object.
    pub fn load<S: Storage, A: StorageAccessor>(
        &self,
        session: &mut Session<'_, S>,
        accessor: &A,
        is_run_input: bool,
    ) -> Result<DataObject> {
        if is_run_input {
            let run = session
                .run_context
                .run
                .ok_or_else(|| Error::Value("no run context set; call RunContext::track first".into()))?;
            track_input(session, run, self)?;
        }

        if let Some(file) = self.single_file(session)? {
            return accessor.load(&file);
        }

        let files = self.files(session, recdb::DEFAULT_DB)?;
        let suffixes: BTreeSet<&str> = files.iter().map(|f| f.suffix.as_str()).collect();
        if suffixes.len() != 1 {
            return Err(Error::Runtime(
                "can only load datasets where all files have the same suffix".into(),
            ));
        }
        let objects = files.iter().map(|f| accessor.load(f)).collect::<Result<Vec<_>>>()?;
        match objects.first() {
            Some(DataObject::DataFrame(_)) => {
                let frames = objects
                    .into_iter()
                    .map(|o| match o {
                        DataObject::DataFrame(df) => Ok(df),
                        DataObject::AnnData(_) => Err(Error::Runtime("mixed data objects".into())),
                    })
                    .collect::<Result<Vec<DataFrame>>>()?;
                Ok(DataObject::DataFrame(DataFrame::concat(&frames)?))
            }
            Some(DataObject::AnnData(_)) => {
                let adatas = objects
                    .into_iter()
                    .map(|o| match o {
                        DataObject::AnnData(a) => Ok(a),
                        DataObject::DataFrame(_) => Err(Error::Runtime("mixed data objects".into())),
                    })
                    .collect::<Result<Vec<AnnDataLike>>>()?;
                Ok(DataObject::AnnData(AnnDataLike::concat(&adatas)?))
            }
            None => Err(Error::Runtime("dataset has no files".into())),
        }
    }
}
