//! Labels linked to a host, grouped by the feature they were added under.

use std::collections::{BTreeMap, BTreeSet};

use recdb::{Database, Link, Model, RecDbError, RowId, Storage, DEFAULT_DB};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::features::FeatureManager;
use crate::host::{Host, HostRef, SLOT_EXTERNAL};
use crate::instance::Session;
use crate::record::{downcast_all, with_member_kind, AnyRecord, MemberRecord, Record, RegistryKind};
use crate::registry::{field_string, from_values, save_any, save_records, validate};
use crate::schema::{Feature, FeatureSet, FeatureType};
use crate::settings::Verbosity;
use crate::transfer::{transfer_fk_to_default_db_bulk, transfer_to_default_db, FkCache};
use crate::{Error, Result};

/// Registries whose records can be linked to a host as labels.
pub const LABEL_KINDS: [RegistryKind; 3] = [RegistryKind::ULabel, RegistryKind::Organism, RegistryKind::CellType];

fn related_name(kind: RegistryKind) -> &'static str {
    match kind {
        RegistryKind::Organism => "organism",
        RegistryKind::CellType => "cell_types",
        _ => "ulabels",
    }
}

/// Quoted values, at most `n` of them, with a trailing ellipsis when cut.
fn print_values(values: &[String], n: usize) -> String {
    let mut out = values
        .iter()
        .take(n)
        .map(|v| format!("'{v}'"))
        .collect::<Vec<_>>()
        .join(", ");
    if values.len() > n {
        out.push_str(", ...");
    }
    out
}

fn load_records<S: Storage>(database: &Database<S>, kind: RegistryKind, ids: &[RowId]) -> Result<Vec<AnyRecord>> {
    with_member_kind!(kind, R => {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let record: R = database.get(*id)?.ok_or(RecDbError::MissingRow { registry: R::REGISTRY, id: *id })?;
            out.push(record.into_any());
        }
        Ok(out)
    })
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelManager {
    host: HostRef,
    db: String,
}

impl LabelManager {
    /// Manager for a host on the default database.
    pub fn new<H: Host>(host: &H) -> Result<Self> {
        Self::on(host, DEFAULT_DB)
    }

    /// Manager for a host read from `db`.
    pub fn on<H: Host>(host: &H, db: &str) -> Result<Self> {
        Ok(Self { host: host.host_ref()?, db: db.to_string() })
    }

    pub fn host(&self) -> HostRef {
        self.host
    }

    /// Link `records` to the host, under `feature` when given.
    ///
    /// Unsaved records are saved first. A feature must be saved and of type
    /// category; the label registries are recorded on it and it joins the
    /// host's `external` feature set.
    pub fn add<S: Storage>(
        &self,
        session: &mut Session<'_, S>,
        records: Vec<AnyRecord>,
        feature: Option<&mut Feature>,
    ) -> Result<()> {
        if records.is_empty() {
            return Err(Error::Value("please pass a record or a non-empty list of records".into()));
        }
        if self.db != DEFAULT_DB {
            return Err(Error::Value("can only add labels to a host on the default database".into()));
        }
        if let Some(bad) = records.iter().find(|r| r.kind() == RegistryKind::Feature) {
            return Err(Error::Type(format!("{} records cannot be used as labels", bad.kind())));
        }
        if let Some(f) = feature.as_deref() {
            if !f.is_persisted() {
                return Err(Error::Value(format!("save feature {} before adding labels under it", f.name)));
            }
            if f.kind != FeatureType::Category {
                return Err(Error::Value(format!(
                    "feature {} has type {}, labels need a feature of type category",
                    f.name, f.kind
                )));
            }
        }

        let feature_id = feature.as_deref().and_then(|f| f.id);
        let mut kinds = BTreeSet::new();
        for mut record in records {
            if !record.is_persisted() {
                save_any(session, &mut record, false)?;
            }
            let id = record
                .id()
                .ok_or_else(|| Error::Runtime(format!("{} record has no id after save", record.kind())))?;
            kinds.insert(record.kind());
            session.default_db_mut().link(
                Link::new(self.host.kind.labels_relation(record.kind()), self.host.id, id).with_feature(feature_id),
            )?;
        }

        if let Some(feature) = feature {
            let mut changed = false;
            for kind in kinds {
                changed |= feature.add_registry(kind);
            }
            if changed {
                session.default_db_mut().update(&*feature)?;
            }
            self.append_external(session, feature)?;
        }
        Ok(())
    }

    fn append_external<S: Storage>(&self, session: &mut Session<'_, S>, feature: &Feature) -> Result<()> {
        let features = FeatureManager::from_ref(self.host, &self.db);
        let mut members = match features.feature_sets_by_slot(session)?.get(SLOT_EXTERNAL) {
            Some(fs) => fs.members(session, &self.db)?,
            None => Vec::new(),
        };
        if members.iter().any(|m| m.id() == feature.id) {
            return Ok(());
        }
        members.push(AnyRecord::Feature(feature.clone()));
        let mut fs = FeatureSet::new(session, members, None, None)?;
        fs.save(session)?;
        features.add_feature_set(session, &mut fs, SLOT_EXTERNAL)
    }

    /// Labels linked under `feature`, grouped by registry.
    pub fn get<S: Storage>(
        &self,
        session: &Session<'_, S>,
        feature: &Feature,
    ) -> Result<BTreeMap<RegistryKind, Vec<AnyRecord>>> {
        let feature_id = feature
            .id
            .ok_or_else(|| Error::Value(format!("feature {} is not saved", feature.name)))?;
        let registries = feature.registry_list();
        if registries.is_empty() {
            return Err(Error::Value(format!("feature {} is not linked to any label registry", feature.name)));
        }

        let database = session.using(&self.db)?;
        let mut out = BTreeMap::new();
        for name in registries {
            let kind = RegistryKind::from_name(name)
                .ok_or_else(|| Error::Value(format!("unknown registry {name}")))?;
            let ids: Vec<RowId> = database
                .links(&self.host.kind.labels_relation(kind), self.host.id)?
                .into_iter()
                .filter(|l| l.feature == Some(feature_id))
                .map(|l| l.right)
                .collect();
            out.insert(kind, load_records(database, kind, &ids)?);
        }
        Ok(out)
    }

    /// Display names of the labels under `feature`, flattened across registries.
    pub fn get_names<S: Storage>(&self, session: &Session<'_, S>, feature: &Feature) -> Result<Vec<String>> {
        Ok(self
            .get(session, feature)?
            .into_values()
            .flatten()
            .map(|r| r.display())
            .collect())
    }

    /// Distinct labels of `kind`, whatever feature they are linked under.
    fn all_of<S: Storage>(&self, session: &Session<'_, S>, kind: RegistryKind) -> Result<Vec<AnyRecord>> {
        let database = session.using(&self.db)?;
        let ids: BTreeSet<RowId> = database
            .links(&self.host.kind.labels_relation(kind), self.host.id)?
            .into_iter()
            .map(|l| l.right)
            .collect();
        load_records(database, kind, &ids.into_iter().collect::<Vec<_>>())
    }

    /// Printable summary of the linked labels.
    pub fn describe<S: Storage>(&self, session: &Session<'_, S>) -> Result<String> {
        let mut lines = String::new();
        for kind in LABEL_KINDS {
            let labels = self.all_of(session, kind)?;
            if labels.is_empty() {
                continue;
            }
            let names: Vec<String> = labels.iter().map(AnyRecord::display).collect();
            lines.push_str(&format!(
                "  📎 {} ({}, {}): {}\n",
                related_name(kind),
                labels.len(),
                kind,
                print_values(&names, 10)
            ));
        }
        if lines.is_empty() {
            return Ok("no linked labels".into());
        }
        Ok(format!("Labels:\n{lines}"))
    }

    /// Transfer every label of `source`, which may live on another database.
    ///
    /// Labels are grouped by the category features of the source's feature
    /// sets; labels linked without a feature follow in a second pass. Per
    /// registry: validate on the default database, fix foreign keys of the
    /// new labels, save them, then link.
    pub fn add_from<S: Storage>(&self, session: &mut Session<'_, S>, source: &LabelManager, parents: bool) -> Result<()> {
        let mut cache = FkCache::new();
        let source_features = FeatureManager::from_ref(source.host, &source.db);

        for (_, fs) in source_features.feature_sets_by_slot(session)? {
            if fs.registry != RegistryKind::Feature.name() {
                continue;
            }
            let features = downcast_all::<Feature>(fs.members(session, &source.db)?)?;
            for source_feature in features {
                if source_feature.kind != FeatureType::Category || source_feature.registries.is_none() {
                    continue;
                }
                if session.logs(Verbosity::Info) {
                    info!(feature = %source_feature.name, "transferring labels");
                }
                let grouped = source.get(session, &source_feature)?;
                let mut feature = feature_on_default(session, &source_feature, &source.db, &mut cache)?;
                for (kind, labels) in grouped {
                    if labels.is_empty() {
                        continue;
                    }
                    let records = with_member_kind!(kind, R => {
                        transfer_labels::<R, S>(session, labels, &source.db, parents, &mut cache)
                    })?;
                    self.add(session, records, Some(&mut feature))?;
                }
            }
        }

        let origin = session.using(&source.db)?;
        let mut unfeatured = Vec::new();
        for kind in LABEL_KINDS {
            let ids: Vec<RowId> = origin
                .links(&source.host.kind.labels_relation(kind), source.host.id)?
                .into_iter()
                .filter(|l| l.feature.is_none())
                .map(|l| l.right)
                .collect();
            if !ids.is_empty() {
                unfeatured.push((kind, load_records(origin, kind, &ids)?));
            }
        }
        for (kind, labels) in unfeatured {
            let records = with_member_kind!(kind, R => {
                transfer_labels::<R, S>(session, labels, &source.db, parents, &mut cache)
            })?;
            self.add(session, records, None)?;
        }
        Ok(())
    }
}

/// The default-db feature named like `feature`, copied over when missing.
fn feature_on_default<S: Storage>(
    session: &mut Session<'_, S>,
    feature: &Feature,
    origin: &str,
    cache: &mut FkCache,
) -> Result<Feature> {
    if let Some(existing) = session.default_db().one_or_none::<Feature>("name", &json!(feature.name))? {
        return Ok(existing);
    }
    let mut copy = feature.clone();
    match transfer_to_default_db(session, &mut copy, origin, true, true, true, cache)? {
        Some(existing) => Ok(existing),
        None => {
            if !copy.is_persisted() {
                session.default_db_mut().insert(&mut copy)?;
            }
            Ok(copy)
        }
    }
}

/// Default-db labels for `labels`: validated ones as they are, new ones
/// with foreign keys rewritten and saved.
fn transfer_labels<R: MemberRecord, S: Storage>(
    session: &mut Session<'_, S>,
    labels: Vec<AnyRecord>,
    origin: &str,
    parents: bool,
    cache: &mut FkCache,
) -> Result<Vec<AnyRecord>> {
    let (validated, mut new) = validate_labels::<R, S>(session, downcast_all(labels)?, parents)?;
    let mut out: Vec<AnyRecord> = validated.into_iter().map(MemberRecord::into_any).collect();
    if new.is_empty() {
        return Ok(out);
    }

    transfer_fk_to_default_db_bulk(session, &mut new, origin, cache)?;
    let mut pending = Vec::with_capacity(new.len());
    for mut label in new {
        match transfer_to_default_db(session, &mut label, origin, false, true, false, cache)? {
            Some(existing) => out.push(existing.into_any()),
            None => pending.push(label),
        }
    }
    if session.logs(Verbosity::Info) {
        info!(registry = R::REGISTRY, n = pending.len(), "saving new records");
    }
    // root registries never pull in parents
    save_records(session, &mut pending, parents && !R::ONTOLOGY_ROOT)?;
    out.extend(pending.into_iter().map(MemberRecord::into_any));
    Ok(out)
}

/// Split `labels` into those already on the default database and new ones.
///
/// Labels are matched on the registry's unique field. With `parents`,
/// ontology-backed labels are first created from their ontology ids so that
/// their ancestors are saved too, and then matched on uid.
pub fn validate_labels<R: MemberRecord, S: Storage>(
    session: &mut Session<'_, S>,
    labels: Vec<R>,
    parents: bool,
) -> Result<(Vec<R>, Vec<R>)> {
    if labels.is_empty() {
        return Ok((Vec::new(), Vec::new()));
    }
    let mut field = R::UNIQUE_FIELD;
    let ontology_path = R::ONTOLOGY_BACKED && parents;
    let parents = parents && !R::ONTOLOGY_ROOT;

    let mut guard = session.override_settings(|s| s.verbosity = s.verbosity.min(Verbosity::Warning));
    let session: &mut Session<'_, S> = &mut guard;

    if ontology_path && session.public_source().is_some() {
        let ontology_ids: Vec<&str> = labels.iter().filter_map(|l| l.ontology_id()).collect();
        if !ontology_ids.is_empty() {
            let created = from_values::<R, S, _>(session, ontology_ids.as_slice(), "ontology_id", None)
                .and_then(|mut records| save_records(session, &mut records, parents));
            if let Err(e) = created {
                debug!(registry = R::REGISTRY, error = %e, "could not create records from ontology ids");
            }
        }
        field = "uid";
    }

    let keys: Vec<Option<String>> = labels
        .iter()
        .map(|l| field_string(l, field))
        .collect::<Result<_>>()?;
    let present: Vec<&str> = keys.iter().flatten().map(String::as_str).collect();
    let mask = validate::<R, S, _>(session, present.as_slice(), field, None)?;
    let valid_keys: BTreeSet<&str> = present
        .iter()
        .zip(&mask)
        .filter(|(_, ok)| **ok)
        .map(|(k, _)| *k)
        .collect();

    let values: Vec<Value> = valid_keys.iter().map(|k| json!(k)).collect();
    let validated = if values.is_empty() {
        Vec::new()
    } else {
        session.default_db().filter_in::<R>(field, &values)?
    };
    let new = labels
        .into_iter()
        .zip(&keys)
        .filter(|(_, key)| !key.as_deref().is_some_and(|k| valid_keys.contains(k)))
        .map(|(label, _)| label)
        .collect();
    Ok((validated, new))
}
