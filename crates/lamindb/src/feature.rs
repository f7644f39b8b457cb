use recdb::Storage;
use tracing::info;

use crate::dataframe::{categoricals_from_df, infer_feature_types, DataFrame};
use crate::instance::Session;
use crate::record::RegistryKind;
use crate::registry::check_name;
use crate::schema::{Feature, FeatureType};
use crate::settings::Verbosity;
use crate::{Error, Result};

impl Feature {
    /// New feature, or the existing one with the same name.
    ///
    /// `kind` accepts `number`, `category`, `bool` and the dtype aliases
    /// `int`, `float`, `str`, `object`.
    pub fn new<S: Storage>(
        session: &Session<'_, S>,
        name: &str,
        kind: Option<&str>,
        registries: &[RegistryKind],
    ) -> Result<Feature> {
        let kind: FeatureType = kind.ok_or_else(|| Error::Value("please pass a type".into()))?.parse()?;

        if let Some(bad) = registries.iter().find(|r| !r.is_member() || **r == RegistryKind::Feature) {
            return Err(Error::Type(format!("{bad} cannot be a label registry of a feature")));
        }

        if let Some(existing) = check_name::<Feature, S>(session, name)? {
            return Ok(existing);
        }

        let mut feature = Feature::draft(name, kind);
        if !registries.is_empty() {
            let mut names: Vec<&str> = registries.iter().map(|r| r.name()).collect();
            names.sort();
            names.dedup();
            feature.registries = Some(names.join("|"));
        }
        feature.created_by_id = session.run_context.user;
        Ok(feature)
    }

    /// One feature per column, typed from the column dtype.
    pub fn from_df<S: Storage>(session: &mut Session<'_, S>, df: &DataFrame) -> Result<Vec<Feature>> {
        let types = infer_feature_types(df)?;

        let features = {
            // exact-name loads are expected here
            let quiet = session.override_settings(|s| s.verbosity = Verbosity::Error);
            types
                .iter()
                .map(|(name, kind)| Feature::new::<S>(&quiet, name, Some(kind.as_str()), &[]))
                .collect::<Result<Vec<_>>>()?
        };

        let categoricals = categoricals_from_df(df);
        if !categoricals.is_empty() && session.logs(Verbosity::Hint) {
            info!(columns = ?categoricals, "categorical columns can be validated against label registries");
        }
        Ok(features)
    }

    /// Add `registry` to the label registries of this feature.
    pub fn add_registry(&mut self, registry: RegistryKind) -> bool {
        let mut names: Vec<String> = self.registry_list().into_iter().map(str::to_string).collect();
        if names.iter().any(|n| n == registry.name()) {
            return false;
        }
        names.push(registry.name().to_string());
        names.sort();
        self.registries = Some(names.join("|"));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataframe::ColumnData;
    use crate::instance::Instance;
    use crate::settings::Settings;
    use recdb::InMemoryStorage;

    #[test]
    fn test_new_casts_and_rejects() {
        let inst = Instance::new(InMemoryStorage::new(), Settings::default());
        let session = inst.session().unwrap();

        let f = Feature::new(&session, "n", Some("int"), &[]).unwrap();
        assert_eq!(f.kind, FeatureType::Number);
        assert!(matches!(Feature::new(&session, "n", None, &[]), Err(Error::Value(_))));
        assert!(matches!(Feature::new(&session, "n", Some("timestamp"), &[]), Err(Error::Value(_))));
        assert!(matches!(
            Feature::new(&session, "n", Some("category"), &[RegistryKind::Run]),
            Err(Error::Type(_))
        ));

        let f = Feature::new(&session, "tissue", Some("category"), &[RegistryKind::ULabel, RegistryKind::CellType])
            .unwrap();
        assert_eq!(f.registries.as_deref(), Some("bionty.CellType|core.ULabel"));
    }

    #[test]
    fn test_new_loads_existing_name() {
        let inst = Instance::new(InMemoryStorage::new(), Settings::default());
        let mut session = inst.session().unwrap();
        let mut f = Feature::new(&session, "feat1", Some("number"), &[]).unwrap();
        session.default_db_mut().insert(&mut f).unwrap();

        let again = Feature::new(&session, "feat1", Some("number"), &[]).unwrap();
        assert_eq!(again.id, f.id);
    }

    #[test]
    fn test_from_df_restores_verbosity() {
        let inst = Instance::new(InMemoryStorage::new(), Settings::default());
        let mut session = inst.session().unwrap();
        let df = DataFrame::new()
            .with_column("feat1", ColumnData::Int64(vec![1, 2]))
            .with_column("feat2", ColumnData::Object(vec!["a".into(), "a".into()]));

        let features = Feature::from_df(&mut session, &df).unwrap();
        assert_eq!(features.len(), 2);
        assert_eq!(features[0].kind, FeatureType::Number);
        assert_eq!(features[1].kind, FeatureType::Category);
        assert_eq!(session.settings.verbosity, Verbosity::Warning);
    }

    #[test]
    fn test_add_registry() {
        let mut f = Feature::draft("tissue", FeatureType::Category);
        assert!(f.add_registry(RegistryKind::ULabel));
        assert!(!f.add_registry(RegistryKind::ULabel));
        assert!(f.add_registry(RegistryKind::CellType));
        assert_eq!(f.registries.as_deref(), Some("bionty.CellType|core.ULabel"));
    }
}
