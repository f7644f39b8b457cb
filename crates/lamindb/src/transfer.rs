//! Copying records from attached databases into the default one.
//!
//! A record read from an attached database keeps its origin database's row
//! ids in its foreign keys. Transfer rewrites those ids to the matching rows
//! on the default database, copying the referenced rows first when they are
//! missing, then inserts the record under a fresh id.

use std::collections::BTreeMap;

use recdb::{field_value, Link, RowId, Storage, DEFAULT_DB};
use tracing::{debug, info, warn};

use crate::features::FeatureManager;
use crate::host::{Host, HostKind};
use crate::instance::Session;
use crate::labels::LabelManager;
use crate::record::{Record, RegistryKind, FK_BULK, FK_PROVENANCE};
use crate::schema::{
    CellType, Dataset, Feature, FeatureSet, File, Organism, Run, StorageLocation, Transform, ULabel, User,
};
use crate::settings::Verbosity;
use crate::{Error, Result};

/// Origin row to default-db row, per registry. Lives for one transfer call.
pub type FkCache = BTreeMap<(RegistryKind, RowId), RowId>;

/// Copy `record`, read from `origin`, into the default database.
///
/// Returns the default-db row with the same uid when one exists. Otherwise
/// rewrites the foreign keys of `record` in place, clears its id, inserts it
/// when `save` is set and returns `None`. Also `None` when no transfer
/// applies: `origin` is the default database or a `using_key` is set.
pub fn transfer_to_default_db<R: Record, S: Storage>(
    session: &mut Session<'_, S>,
    record: &mut R,
    origin: &str,
    save: bool,
    mute: bool,
    transfer_fk: bool,
    cache: &mut FkCache,
) -> Result<Option<R>> {
    if origin == DEFAULT_DB || session.settings.using_key.is_some() {
        return Ok(None);
    }

    if let Some(existing) = existing_on_default(session, record)? {
        if !mute && session.logs(Verbosity::Warning) {
            warn!(registry = R::REGISTRY, uid = record.uid(), "record already exists on the default database");
        }
        return Ok(Some(existing));
    }
    if !mute && session.logs(Verbosity::Hint) {
        info!(registry = R::REGISTRY, uid = record.uid(), origin, "saving from instance to default instance");
    }

    let ctx = session.run_context.clone();
    for fk in R::FOREIGN_KEYS {
        match fk.name {
            "created_by" => record.set_foreign_key("created_by", ctx.user),
            "run" => {
                if ctx.run.is_none() && !mute && session.logs(Verbosity::Warning) {
                    warn!(
                        registry = R::REGISTRY,
                        "no run & transform get linked, consider calling RunContext::track"
                    );
                }
                record.set_foreign_key("run", ctx.run);
            }
            // a run keeps its own transform
            "transform" if R::KIND != RegistryKind::Run => record.set_foreign_key("transform", ctx.transform),
            _ => {}
        }
    }

    for fk in R::FOREIGN_KEYS {
        let provenance = FK_PROVENANCE.contains(&fk.name) && !(R::KIND == RegistryKind::Run && fk.name == "transform");
        if provenance || (!transfer_fk && FK_BULK.contains(&fk.name)) {
            continue;
        }
        update_fk_to_default_db(session, record, fk.name, origin, cache)?;
    }

    record.set_id(None);
    if save {
        session.default_db_mut().insert(record)?;
    }
    Ok(None)
}

/// The default-db row sharing a unique column with `record`, checked in
/// declaration order (`uid` first, then e.g. `hash` or `handle`).
fn existing_on_default<R: Record, S: Storage>(session: &Session<'_, S>, record: &R) -> Result<Option<R>> {
    let db = session.default_db();
    for field in R::UNIQUE {
        let value = field_value(record, field)?;
        if value.is_null() {
            continue;
        }
        if let Some(existing) = db.filter::<R>(field, &value)?.into_iter().next() {
            return Ok(Some(existing));
        }
    }
    Ok(None)
}

/// Point foreign key `fk` of `record` at the default-db row matching the
/// referenced `origin` row on its unique field, copying that row if needed.
pub fn update_fk_to_default_db<R: Record, S: Storage>(
    session: &mut Session<'_, S>,
    record: &mut R,
    fk: &str,
    origin: &str,
    cache: &mut FkCache,
) -> Result<()> {
    let target = R::FOREIGN_KEYS
        .iter()
        .find(|k| k.name == fk)
        .map(|k| k.target)
        .ok_or_else(|| Error::Value(format!("{} has no foreign key {fk}", R::KIND)))?;
    let Some(origin_id) = record.foreign_key(fk) else {
        return Ok(());
    };
    let resolved = resolve_fk(session, target, origin_id, origin, cache)?;
    if resolved.is_none() && R::REQUIRED_FOREIGN_KEYS.contains(&fk) {
        return Err(Error::Value(format!(
            "{} {} needs {fk} row {origin_id}, which does not exist on {origin}",
            R::KIND,
            record.uid()
        )));
    }
    record.set_foreign_key(fk, resolved);
    Ok(())
}

/// Rewrite the bulk foreign keys (`organism`, `file`) of many records at once.
/// Each distinct referenced row is resolved a single time.
pub fn transfer_fk_to_default_db_bulk<R: Record, S: Storage>(
    session: &mut Session<'_, S>,
    records: &mut [R],
    origin: &str,
    cache: &mut FkCache,
) -> Result<()> {
    if origin == DEFAULT_DB || session.settings.using_key.is_some() {
        return Ok(());
    }
    for fk in R::FOREIGN_KEYS.iter().filter(|k| FK_BULK.contains(&k.name)) {
        for record in records.iter_mut() {
            update_fk_to_default_db(session, record, fk.name, origin, cache)?;
        }
    }
    Ok(())
}

fn resolve_fk<S: Storage>(
    session: &mut Session<'_, S>,
    target: RegistryKind,
    origin_id: RowId,
    origin: &str,
    cache: &mut FkCache,
) -> Result<Option<RowId>> {
    if let Some(hit) = cache.get(&(target, origin_id)) {
        return Ok(Some(*hit));
    }
    let resolved = match target {
        RegistryKind::User => resolve_typed::<User, S>(session, origin_id, origin, cache),
        RegistryKind::Storage => resolve_typed::<StorageLocation, S>(session, origin_id, origin, cache),
        RegistryKind::Transform => resolve_typed::<Transform, S>(session, origin_id, origin, cache),
        RegistryKind::Run => resolve_typed::<Run, S>(session, origin_id, origin, cache),
        RegistryKind::File => resolve_typed::<File, S>(session, origin_id, origin, cache),
        RegistryKind::Dataset => resolve_typed::<Dataset, S>(session, origin_id, origin, cache),
        RegistryKind::Feature => resolve_typed::<Feature, S>(session, origin_id, origin, cache),
        RegistryKind::FeatureSet => resolve_typed::<FeatureSet, S>(session, origin_id, origin, cache),
        RegistryKind::ULabel => resolve_typed::<ULabel, S>(session, origin_id, origin, cache),
        RegistryKind::Organism => resolve_typed::<Organism, S>(session, origin_id, origin, cache),
        RegistryKind::CellType => resolve_typed::<CellType, S>(session, origin_id, origin, cache),
    }?;
    if let Some(id) = resolved {
        cache.insert((target, origin_id), id);
    }
    Ok(resolved)
}

fn resolve_typed<T: Record, S: Storage>(
    session: &mut Session<'_, S>,
    origin_id: RowId,
    origin: &str,
    cache: &mut FkCache,
) -> Result<Option<RowId>> {
    let Some(mut dependency) = session.using(origin)?.get::<T>(origin_id)? else {
        if session.logs(Verbosity::Warning) {
            warn!(registry = T::REGISTRY, id = origin_id, origin, "dangling foreign key, clearing it");
        }
        return Ok(None);
    };

    let value = field_value(&dependency, T::UNIQUE_FIELD)?;
    let on_default: Option<T> = session
        .default_db()
        .filter::<T>(T::UNIQUE_FIELD, &value)?
        .into_iter()
        .next();
    if let Some(existing) = on_default {
        return Ok(existing.id());
    }

    debug!(registry = T::REGISTRY, id = origin_id, "copying dependency to default database");
    match transfer_to_default_db(session, &mut dependency, origin, true, true, true, cache)? {
        Some(existing) => Ok(existing.id()),
        None => Ok(dependency.id()),
    }
}

/// Save a host read from `origin` on the default database: the row, then for
/// a dataset its member files, then its feature sets and labels.
pub fn save_from<H: Host, S: Storage>(
    session: &mut Session<'_, S>,
    host: &mut H,
    origin: &str,
    parents: bool,
) -> Result<()> {
    if origin == DEFAULT_DB || session.settings.using_key.is_some() {
        session.default_db_mut().save(host)?;
        return Ok(());
    }

    let source = host.clone();
    let source_ref = source.host_ref()?;
    let mut cache = FkCache::new();
    if let Some(existing) = transfer_to_default_db(session, host, origin, true, false, true, &mut cache)? {
        *host = existing;
    }
    let target_ref = host.host_ref()?;

    if H::HOST == HostKind::Dataset {
        let links = session.using(origin)?.links(Dataset::FILES, source_ref.id)?;
        for link in links {
            let Some(mut file) = session.using(origin)?.get::<File>(link.right)? else {
                continue;
            };
            save_from(session, &mut file, origin, parents)?;
            let file_id = file.host_ref()?.id;
            session
                .default_db_mut()
                .link(Link::new(Dataset::FILES, target_ref.id, file_id))?;
        }
    }

    FeatureManager::new(host)?.add_from(session, &FeatureManager::on(&source, origin)?)?;
    LabelManager::new(host)?.add_from(session, &LabelManager::on(&source, origin)?, parents)?;
    Ok(())
}
