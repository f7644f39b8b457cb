use std::collections::BTreeSet;

use recdb::{Link, Model, RowId, Storage};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::dataframe::{convert_dtype_to_feature_type, DataFrame};
use crate::hashing::{base62_20, hash_set};
use crate::instance::Session;
use crate::record::{with_member_kind, AnyRecord, Field, MemberRecord, RegistryKind};
use crate::registry::{from_values, save_any, validate};
use crate::schema::{Feature, FeatureSet, FeatureType};
use crate::settings::Verbosity;
use crate::{Error, Result};

const NUMBER_TYPE: &str = "number";

/// Registry shared by all `members`.
fn validate_members(members: &[AnyRecord]) -> Result<RegistryKind> {
    let first = members
        .first()
        .ok_or_else(|| Error::Value("provide a list of features with at least one element".into()))?;
    let kinds: BTreeSet<RegistryKind> = members.iter().map(AnyRecord::kind).collect();
    if kinds.len() > 1 {
        return Err(Error::Type("feature set can only contain a single type".into()));
    }
    if members.iter().any(|m| !m.is_persisted()) {
        return Err(Error::Value("can only construct feature sets from validated features".into()));
    }
    Ok(first.kind())
}

impl FeatureSet {
    /// Feature set over `members`, or the stored one with the same membership.
    pub fn new<S: Storage>(
        session: &Session<'_, S>,
        members: Vec<AnyRecord>,
        kind: Option<&str>,
        name: Option<&str>,
    ) -> Result<FeatureSet> {
        let registry = validate_members(&members)?;
        let kind: Option<FeatureType> = match kind {
            Some(k) => Some(k.parse()?),
            None if registry == RegistryKind::Feature => None,
            None => Some(FeatureType::Number),
        };

        let hash = hash_set(members.iter().map(AnyRecord::uid));
        if let Some(existing) = session.default_db().one_or_none::<FeatureSet>("hash", &json!(hash))? {
            if session.logs(Verbosity::Success) {
                info!(uid = %existing.uid, n = existing.n, "loaded feature set");
            }
            return Ok(existing);
        }

        Ok(FeatureSet {
            id: None,
            uid: base62_20(),
            name: name.map(str::to_string),
            kind,
            n: members.len(),
            registry: registry.name().to_string(),
            hash,
            pending_members: members,
        })
    }

    /// Feature set over the validated subset of `values`; `None` when
    /// nothing validates.
    pub fn from_values<S: Storage, T: AsRef<str>>(
        session: &mut Session<'_, S>,
        values: &[T],
        field: Field,
        kind: Option<&str>,
        name: Option<&str>,
        mute: bool,
        organism: Option<RowId>,
    ) -> Result<Option<FeatureSet>> {
        if values.is_empty() {
            return Err(Error::Value("provide a list of at least one value".into()));
        }
        let kind = match kind {
            None if field.registry != RegistryKind::Feature => {
                debug!("setting feature set to 'number'");
                Some(NUMBER_TYPE)
            }
            other => other,
        };

        let mut guard = session.override_settings(|s| {
            if mute {
                s.verbosity = s.verbosity.min(Verbosity::Warning);
            }
        });
        let session: &mut Session<'_, S> = &mut guard;
        let members = validated_members(session, values, field, organism)?;
        if members.is_empty() {
            if session.logs(Verbosity::Warning) {
                warn!(registry = %field.registry, "no validated features, skip creating feature set");
            }
            return Ok(None);
        }
        FeatureSet::new(session, members, kind, name).map(Some)
    }

    /// Feature set over the validated columns of `df`.
    pub fn from_df<S: Storage>(
        session: &mut Session<'_, S>,
        df: &DataFrame,
        field: Field,
        name: Option<&str>,
        mute: bool,
        organism: Option<RowId>,
    ) -> Result<Option<FeatureSet>> {
        let mut guard = session.override_settings(|s| {
            if mute {
                s.verbosity = s.verbosity.min(Verbosity::Warning);
            }
        });
        let session: &mut Session<'_, S> = &mut guard;

        let columns = df.column_names();
        let mask: Vec<bool> = with_member_kind!(field.registry, R => {
            validate::<R, S, _>(session, columns.as_slice(), field.name, organism)
        })?;
        let validated: Vec<&str> = columns
            .iter()
            .zip(&mask)
            .filter(|(_, ok)| **ok)
            .map(|(c, _)| *c)
            .collect();
        if validated.is_empty() {
            if session.logs(Verbosity::Warning) {
                warn!(registry = %field.registry, "no validated features, skip creating feature set");
            }
            return Ok(None);
        }

        let subset = df.select(validated.as_slice())?;
        if field.registry == RegistryKind::Feature {
            let features = Feature::from_df(session, &subset)?;
            let members = features.into_iter().map(AnyRecord::Feature).collect();
            return FeatureSet::new(session, members, None, name).map(Some);
        }

        let dtypes: BTreeSet<&str> = subset.dtypes().into_iter().collect();
        if dtypes.len() != 1 {
            return Err(Error::Value(format!("data types are heterogeneous: {dtypes:?}")));
        }
        let kind = dtypes
            .iter()
            .next()
            .map(|d| convert_dtype_to_feature_type(d))
            .transpose()?;
        let members = validated_members(session, validated.as_slice(), field, organism)?;
        FeatureSet::new(session, members, kind.map(|k| k.as_str()), name).map(Some)
    }

    /// Insert the row unless one with the same hash exists, then link
    /// pending members.
    pub fn save<S: Storage>(&mut self, session: &mut Session<'_, S>) -> Result<()> {
        if self.id.is_none() {
            match session.default_db().one_or_none::<FeatureSet>("hash", &json!(self.hash))? {
                Some(existing) => self.id = existing.id,
                None => {
                    session.default_db_mut().insert(self)?;
                }
            }
        }
        let fs_id = self.id.ok_or_else(|| Error::Runtime("feature set has no id after save".into()))?;
        let relation = FeatureSet::members_relation(&self.registry);

        for member in self.pending_members.iter_mut() {
            save_any(session, member, false)?;
            let member_id = member
                .id()
                .ok_or_else(|| Error::Runtime(format!("{} member has no id", member.kind())))?;
            session.default_db_mut().link(Link::new(relation.clone(), fs_id, member_id))?;
        }
        self.pending_members.clear();
        Ok(())
    }

    /// Pending members before save, linked members from `db` after.
    pub fn members<S: Storage>(&self, session: &Session<'_, S>, db: &str) -> Result<Vec<AnyRecord>> {
        let Some(fs_id) = self.id else {
            return Ok(self.pending_members.clone());
        };
        let relation = FeatureSet::members_relation(&self.registry);
        let database = session.using(db)?;
        let links = database.links(&relation, fs_id)?;

        with_member_kind!(self.member_kind()?, R => {
            let mut out = Vec::with_capacity(links.len());
            for link in &links {
                let record: R = database.get(link.right)?.ok_or(recdb::RecDbError::MissingRow {
                    registry: R::REGISTRY,
                    id: link.right,
                })?;
                out.push(record.into_any());
            }
            Ok(out)
        })
    }
}

fn validated_members<S: Storage, T: AsRef<str>>(
    session: &Session<'_, S>,
    values: &[T],
    field: Field,
    organism: Option<RowId>,
) -> Result<Vec<AnyRecord>> {
    with_member_kind!(field.registry, R => {
        let mask = validate::<R, S, T>(session, values, field.name, organism)?;
        let validated: Vec<&str> = values
            .iter()
            .zip(&mask)
            .filter(|(_, ok)| **ok)
            .map(|(v, _)| v.as_ref())
            .collect();
        if validated.is_empty() {
            return Ok(Vec::new());
        }
        let records = from_values::<R, S, _>(session, validated.as_slice(), field.name, organism)?;
        Ok(records.into_iter().map(MemberRecord::into_any).collect())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataframe::ColumnData;
    use crate::instance::Instance;
    use crate::schema::ULabel;
    use crate::settings::Settings;
    use recdb::{InMemoryStorage, Model};

    fn saved_features(session: &mut Session<'_, InMemoryStorage>, names: &[&str]) -> Vec<AnyRecord> {
        names
            .iter()
            .map(|n| {
                let mut f = Feature::draft(n, FeatureType::Number);
                session.default_db_mut().insert(&mut f).unwrap();
                AnyRecord::Feature(f)
            })
            .collect()
    }

    #[test]
    fn test_same_members_same_feature_set() {
        let inst = Instance::new(InMemoryStorage::new(), Settings::default());
        let mut session = inst.session().unwrap();
        let members = saved_features(&mut session, &["feat1", "feat2"]);

        let mut fs = FeatureSet::new(&session, members.clone(), None, None).unwrap();
        assert_eq!(fs.kind, None);
        assert_eq!(fs.n, 2);
        assert_eq!(fs.registry, "core.Feature");
        fs.save(&mut session).unwrap();

        let mut reversed = members;
        reversed.reverse();
        let again = FeatureSet::new(&session, reversed, None, None).unwrap();
        assert_eq!(again.id, fs.id);
        assert_eq!(session.default_db().count::<FeatureSet>().unwrap(), 1);
        assert_eq!(again.members(&session, recdb::DEFAULT_DB).unwrap().len(), 2);
    }

    #[test]
    fn test_rejects_bad_member_lists() {
        let inst = Instance::new(InMemoryStorage::new(), Settings::default());
        let mut session = inst.session().unwrap();

        assert!(matches!(FeatureSet::new(&session, vec![], None, None), Err(Error::Value(_))));

        let mut members = saved_features(&mut session, &["feat1"]);
        let mut label = ULabel::new("x");
        session.default_db_mut().insert(&mut label).unwrap();
        members.push(AnyRecord::ULabel(label));
        assert!(matches!(FeatureSet::new(&session, members, None, None), Err(Error::Type(_))));

        let unsaved = vec![AnyRecord::Feature(Feature::draft("feat9", FeatureType::Bool))];
        assert!(matches!(FeatureSet::new(&session, unsaved, None, None), Err(Error::Value(_))));

        let members = saved_features(&mut session, &["feat2"]);
        assert!(matches!(FeatureSet::new(&session, members, Some("text"), None), Err(Error::Value(_))));
    }

    #[test]
    fn test_non_feature_members_default_to_number() {
        let inst = Instance::new(InMemoryStorage::new(), Settings::default());
        let mut session = inst.session().unwrap();
        let mut label = ULabel::new("gene1");
        session.default_db_mut().insert(&mut label).unwrap();

        let fs = FeatureSet::new(&session, vec![AnyRecord::ULabel(label)], None, None).unwrap();
        assert_eq!(fs.kind, Some(FeatureType::Number));
        assert_eq!(fs.registry, "core.ULabel");
    }

    #[test]
    fn test_from_values() {
        let inst = Instance::new(InMemoryStorage::new(), Settings::default());
        let mut session = inst.session().unwrap();
        saved_features(&mut session, &["feat1", "feat2"]);

        assert!(matches!(
            FeatureSet::from_values::<_, &str>(&mut session, &[], Feature::NAME, None, None, false, None),
            Err(Error::Value(_))
        ));
        let none = FeatureSet::from_values(&mut session, &["nope"], Feature::NAME, None, None, true, None).unwrap();
        assert!(none.is_none());

        let fs = FeatureSet::from_values(&mut session, &["feat1", "feat2", "nope"], Feature::NAME, None, None, false, None)
            .unwrap()
            .unwrap();
        assert_eq!(fs.n, 2);
        assert!(!fs.is_persisted());
        assert_eq!(fs.members(&session, recdb::DEFAULT_DB).unwrap().len(), 2);
    }

    #[test]
    fn test_from_df_non_feature_registry() {
        let inst = Instance::new(InMemoryStorage::new(), Settings::default());
        let mut session = inst.session().unwrap();
        for gene in ["g1", "g2", "g3"] {
            session.default_db_mut().insert(&mut ULabel::new(gene)).unwrap();
        }

        let df = DataFrame::new()
            .with_column("g1", ColumnData::Float32(vec![1.0]))
            .with_column("g2", ColumnData::Float32(vec![2.0]))
            .with_column("other", ColumnData::Bool(vec![true]));
        let fs = FeatureSet::from_df(&mut session, &df, ULabel::NAME, None, false, None)
            .unwrap()
            .unwrap();
        assert_eq!(fs.n, 2);
        assert_eq!(fs.kind, Some(FeatureType::Number));

        let mixed = DataFrame::new()
            .with_column("g1", ColumnData::Float32(vec![1.0]))
            .with_column("g3", ColumnData::Int64(vec![2]));
        assert!(matches!(
            FeatureSet::from_df(&mut session, &mixed, ULabel::NAME, None, false, None),
            Err(Error::Value(_))
        ));
    }
}
