//! Validation, record creation from raw values, search and lookup.

use std::collections::{BTreeMap, BTreeSet};

use recdb::{field_value, value_as_string, Link, RowId, Storage};
use serde_json::json;
use tracing::{info, warn};

use crate::index;
use crate::instance::Session;
use crate::record::{AnyRecord, MemberRecord, Record};
use crate::settings::Verbosity;
use crate::{Error, Result};

/// String value of `field` on `record`, if set.
pub fn field_string<R: Record>(record: &R, field: &str) -> Result<Option<String>> {
    Ok(value_as_string(&field_value(record, field)?))
}

pub fn get_default_str_field<R: Record>() -> &'static str {
    R::DEFAULT_STR_FIELD
}

fn has_organism<R: Record>() -> bool {
    R::FOREIGN_KEYS.iter().any(|fk| fk.name == "organism")
}

/// Records on the default database, restricted to `organism` when given.
fn candidates<R: Record, S: Storage>(session: &Session<'_, S>, organism: Option<RowId>) -> Result<Vec<R>> {
    let all: Vec<R> = session.default_db().all()?;
    Ok(match organism {
        Some(org) if has_organism::<R>() => all
            .into_iter()
            .filter(|r| r.foreign_key("organism") == Some(org))
            .collect(),
        _ => all,
    })
}

fn dedup_values<T: AsRef<str>>(values: &[T]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    values
        .iter()
        .map(|v| v.as_ref().to_string())
        .filter(|v| seen.insert(v.clone()))
        .collect()
}

/// Mask aligned with `values`: `true` where a default-db record has `field == value`.
pub fn validate<R: Record, S: Storage, T: AsRef<str>>(
    session: &Session<'_, S>,
    values: &[T],
    field: &str,
    organism: Option<RowId>,
) -> Result<Vec<bool>> {
    let mut known = BTreeSet::new();
    for record in candidates::<R, S>(session, organism)? {
        if let Some(v) = field_string(&record, field)? {
            known.insert(v);
        }
    }
    let mask: Vec<bool> = values.iter().map(|v| known.contains(v.as_ref())).collect();

    if session.logs(Verbosity::Info) {
        let n_valid = mask.iter().filter(|m| **m).count();
        info!(
            registry = R::REGISTRY,
            field,
            validated = n_valid,
            not_validated = mask.len() - n_valid,
            "validated values"
        );
    }
    Ok(mask)
}

/// Validated records first, then new unsaved ones, each in input order.
pub fn from_values<R: MemberRecord, S: Storage, T: AsRef<str>>(
    session: &Session<'_, S>,
    values: &[T],
    field: &str,
    organism: Option<RowId>,
) -> Result<Vec<R>> {
    let values = dedup_values(values);

    let mut by_value: BTreeMap<String, R> = BTreeMap::new();
    for record in candidates::<R, S>(session, organism)? {
        if let Some(v) = field_string(&record, field)? {
            by_value.entry(v).or_insert(record);
        }
    }

    let mut validated = Vec::new();
    let mut missing = Vec::new();
    for v in values {
        match by_value.get(&v) {
            Some(r) => validated.push(r.clone()),
            None => missing.push(v),
        }
    }
    if !validated.is_empty() && session.logs(Verbosity::Success) {
        info!(registry = R::REGISTRY, n = validated.len(), "loaded records with exact matches");
    }

    let mut created = Vec::new();
    let mut unmapped = Vec::new();
    for v in missing {
        if R::ONTOLOGY_BACKED {
            if let Some(source) = session.public_source() {
                match source
                    .lookup(R::KIND, field, &v)
                    .and_then(|term| R::from_public(&term, organism))
                {
                    Some(record) => created.push(record),
                    None => unmapped.push(v),
                }
                continue;
            }
        }
        created.push(R::from_value(field, &v, organism)?);
    }

    if !created.is_empty() && session.logs(Verbosity::Info) {
        info!(registry = R::REGISTRY, n = created.len(), "created records from values");
    }
    if !unmapped.is_empty() && session.logs(Verbosity::Warning) {
        warn!(registry = R::REGISTRY, values = ?unmapped, "did not create records, no public term found");
    }

    validated.extend(created);
    Ok(validated)
}

/// Fuzzy search over the default display field, best match first.
pub fn search<R: Record, S: Storage>(
    session: &Session<'_, S>,
    query: &str,
    limit: Option<usize>,
    case_sensitive: bool,
) -> Result<Vec<(R, u8)>> {
    let mut hits = Vec::new();
    for record in session.default_db().all::<R>()? {
        let Some(value) = field_string(&record, R::DEFAULT_STR_FIELD)? else {
            continue;
        };
        let score = index::score(&value, query, case_sensitive);
        if score > 0 {
            hits.push((record, score));
        }
    }
    hits.sort_by(|a, b| b.1.cmp(&a.1));
    if let Some(limit) = limit {
        hits.truncate(limit);
    }
    Ok(hits)
}

/// Map of `field` value (default display field when `None`) to record.
pub fn lookup<R: Record, S: Storage>(session: &Session<'_, S>, field: Option<&str>) -> Result<BTreeMap<String, R>> {
    let field = field.unwrap_or(R::DEFAULT_STR_FIELD);
    let mut out = BTreeMap::new();
    for record in session.default_db().all::<R>()? {
        if let Some(key) = field_string(&record, field)? {
            out.entry(key).or_insert(record);
        }
    }
    Ok(out)
}

/// Name check run before creating a named record.
///
/// Returns the existing record with exactly this name, if any. Near matches
/// are reported, not returned.
pub fn check_name<R: Record, S: Storage>(session: &Session<'_, S>, name: &str) -> Result<Option<R>> {
    if !session.settings.upon_create_search_names {
        return Ok(None);
    }

    let existing: Vec<R> = session.default_db().filter("name", &json!(name))?;
    if let Some(record) = existing.into_iter().next() {
        if session.logs(Verbosity::Warning) {
            warn!(registry = R::REGISTRY, name, uid = record.uid(), "loaded record with exact same name");
        }
        return Ok(Some(record));
    }

    let similar: Vec<String> = search::<R, S>(session, name, Some(20), false)?
        .into_iter()
        .filter(|(_, score)| *score >= 90)
        .map(|(r, _)| r.display())
        .collect();
    if !similar.is_empty() && session.logs(Verbosity::Warning) {
        warn!(registry = R::REGISTRY, name, similar = ?similar, "records with similar names exist");
    }
    Ok(None)
}

/// Persist unsaved records on the default database.
///
/// With `parents`, ontology-backed records also get their ancestor terms
/// created from the public source and linked child to parent.
pub fn save_records<R: MemberRecord, S: Storage>(
    session: &mut Session<'_, S>,
    records: &mut [R],
    parents: bool,
) -> Result<()> {
    let n_new = records.iter().filter(|r| !r.is_persisted()).count();
    if n_new > 0 && session.logs(Verbosity::Info) {
        info!(registry = R::REGISTRY, n = n_new, "saving new records");
    }

    for record in records.iter_mut() {
        if record.is_persisted() {
            continue;
        }
        if record.foreign_key("created_by").is_none() {
            record.set_foreign_key("created_by", session.run_context.user);
        }
        session.default_db_mut().insert(record)?;
    }

    if parents && !R::ONTOLOGY_ROOT {
        if let Some(relation) = R::PARENTS {
            let mut visited = BTreeSet::new();
            for record in records.iter() {
                save_parents(session, record, relation, &mut visited)?;
            }
        }
    }
    Ok(())
}

fn save_parents<R: MemberRecord, S: Storage>(
    session: &mut Session<'_, S>,
    record: &R,
    relation: &str,
    visited: &mut BTreeSet<String>,
) -> Result<()> {
    let (Some(source), Some(ontology_id), Some(child_id)) = (session.public_source(), record.ontology_id(), record.id())
    else {
        return Ok(());
    };
    if !visited.insert(ontology_id.to_string()) {
        return Ok(());
    }
    let Some(term) = source.lookup(R::KIND, "ontology_id", ontology_id) else {
        return Ok(());
    };

    let organism = record.foreign_key("organism");
    for parent_id in &term.parents {
        let existing: Option<R> = session
            .default_db()
            .filter::<R>("ontology_id", &json!(parent_id))?
            .into_iter()
            .next();
        let parent = match existing {
            Some(p) => p,
            None => {
                let Some(mut p) = source
                    .lookup(R::KIND, "ontology_id", parent_id)
                    .and_then(|t| R::from_public(&t, organism))
                else {
                    continue;
                };
                p.set_foreign_key("created_by", session.run_context.user);
                session.default_db_mut().insert(&mut p)?;
                p
            }
        };
        let parent_row = parent.id().ok_or_else(|| Error::Runtime("parent record has no id".into()))?;
        session.default_db_mut().link(Link::new(relation, child_id, parent_row))?;
        save_parents(session, &parent, relation, visited)?;
    }
    Ok(())
}

/// Persist an `AnyRecord` if it has no id yet.
pub fn save_any<S: Storage>(session: &mut Session<'_, S>, record: &mut AnyRecord, parents: bool) -> Result<()> {
    match record {
        AnyRecord::Feature(r) => save_records(session, std::slice::from_mut(r), parents),
        AnyRecord::ULabel(r) => save_records(session, std::slice::from_mut(r), parents),
        AnyRecord::Organism(r) => save_records(session, std::slice::from_mut(r), parents),
        AnyRecord::CellType(r) => save_records(session, std::slice::from_mut(r), parents),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::Instance;
    use crate::ontology::{InMemoryOntology, PublicTerm};
    use crate::record::RegistryKind;
    use crate::schema::{CellType, Organism, ULabel};
    use crate::settings::Settings;
    use recdb::{InMemoryStorage, Model};
    use std::sync::Arc;

    fn instance() -> Instance<InMemoryStorage> {
        let ontology = InMemoryOntology::new()
            .with_term(RegistryKind::CellType, PublicTerm::new("CL:0000084", "T cell", &["CL:0000542"]))
            .with_term(RegistryKind::CellType, PublicTerm::new("CL:0000542", "lymphocyte", &["CL:0000000"]))
            .with_term(RegistryKind::CellType, PublicTerm::new("CL:0000000", "cell", &[]))
            .with_term(RegistryKind::Organism, PublicTerm::new("NCBITaxon:9606", "human", &[]));
        Instance::new(InMemoryStorage::new(), Settings::default()).with_public_source(Arc::new(ontology))
    }

    #[test]
    fn test_validate_mask_is_aligned() {
        let inst = instance();
        let mut session = inst.session().unwrap();
        session.default_db_mut().insert(&mut ULabel::new("a")).unwrap();

        let mask = validate::<ULabel, _, _>(&session, &["b", "a", "a"], "name", None).unwrap();
        assert_eq!(mask, vec![false, true, true]);
    }

    #[test]
    fn test_from_values_validated_first_then_new() {
        let inst = instance();
        let mut session = inst.session().unwrap();
        session.default_db_mut().insert(&mut ULabel::new("known")).unwrap();

        let records = from_values::<ULabel, _, _>(&session, &["new1", "known", "new1", "new2"], "name", None).unwrap();
        let names: Vec<_> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["known", "new1", "new2"]);
        assert!(records[0].is_persisted());
        assert!(!records[1].is_persisted());
    }

    #[test]
    fn test_from_values_uses_public_source() {
        let inst = instance();
        let session = inst.session().unwrap();
        let records = from_values::<CellType, _, _>(&session, &["T cell", "not a cell"], "name", None).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].ontology_id.as_deref(), Some("CL:0000084"));
    }

    #[test]
    fn test_validate_scoped_by_organism() {
        let inst = instance();
        let mut session = inst.session().unwrap();
        let human = session.default_db_mut().insert(&mut Organism::new("human", None)).unwrap();
        session
            .default_db_mut()
            .insert(&mut CellType::new("T cell", None, Some(human)))
            .unwrap();

        assert_eq!(validate::<CellType, _, _>(&session, &["T cell"], "name", Some(human)).unwrap(), vec![true]);
        assert_eq!(validate::<CellType, _, _>(&session, &["T cell"], "name", Some(human + 1)).unwrap(), vec![false]);
    }

    #[test]
    fn test_save_records_with_parents() {
        let inst = instance();
        let mut session = inst.session().unwrap();
        let mut records = from_values::<CellType, _, _>(&session, &["T cell"], "name", None).unwrap();
        save_records(&mut session, &mut records, true).unwrap();

        let db = session.default_db();
        assert_eq!(db.count::<CellType>().unwrap(), 3);
        let child = records[0].id.unwrap();
        let links = db.links("bionty.CellType:parents", child).unwrap();
        assert_eq!(links.len(), 1);
        let parent: CellType = db.get(links[0].right).unwrap().unwrap();
        assert_eq!(parent.name, "lymphocyte");
    }

    #[test]
    fn test_save_records_without_parents() {
        let inst = instance();
        let mut session = inst.session().unwrap();
        let mut records = from_values::<CellType, _, _>(&session, &["T cell"], "name", None).unwrap();
        save_records(&mut session, &mut records, false).unwrap();
        assert_eq!(session.default_db().count::<CellType>().unwrap(), 1);
    }

    #[test]
    fn test_search_and_lookup() {
        let inst = instance();
        let mut session = inst.session().unwrap();
        for name in ["T cell", "B cell", "tissue"] {
            session.default_db_mut().insert(&mut ULabel::new(name)).unwrap();
        }

        let hits = search::<ULabel, _>(&session, "T cell", Some(2), false).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0.name, "T cell");
        assert_eq!(hits[0].1, 100);

        let table = lookup::<ULabel, _>(&session, None).unwrap();
        assert_eq!(table.len(), 3);
        assert!(table.contains_key("tissue"));
        assert_eq!(get_default_str_field::<ULabel>(), "name");
    }

    #[test]
    fn test_check_name_loads_exact_match() {
        let inst = instance();
        let mut session = inst.session().unwrap();
        session.default_db_mut().insert(&mut ULabel::new("tissue")).unwrap();

        let found: Option<ULabel> = check_name(&session, "tissue").unwrap();
        assert!(found.is_some());

        session.settings.upon_create_search_names = false;
        let skipped: Option<ULabel> = check_name(&session, "tissue").unwrap();
        assert!(skipped.is_none());
    }
}
