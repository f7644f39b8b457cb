use std::sync::Arc;

use lamindb::hashing::hash_set;
use lamindb::registry::from_values;
use lamindb::transfer::transfer_to_default_db;
use lamindb::{
    save_from, view_flow, AnyRecord, CellType, ColumnData, DataFrame, DataObject, Dataset, DatasetInit, Error,
    Feature, FeatureManager, FeatureSet, FeatureType, File, FileInit, FkCache, InMemoryObjects, InMemoryOntology,
    Instance, LabelManager, Organism, PublicTerm, RegistryKind, RunContext, Session, Settings, Transform,
    TransformKind, ULabel, User, SLOT_COLUMNS, SLOT_EXTERNAL,
};
use recdb::{InMemoryStorage, Link, Model, Operation};
use serde_json::json;

const REMOTE: &str = "remote";

fn instance() -> Instance<InMemoryStorage> {
    let ontology = InMemoryOntology::new()
        .with_term(RegistryKind::CellType, PublicTerm::new("CL:0000084", "T cell", &["CL:0000542"]))
        .with_term(RegistryKind::CellType, PublicTerm::new("CL:0000542", "lymphocyte", &["CL:0000000"]))
        .with_term(RegistryKind::CellType, PublicTerm::new("CL:0000000", "cell", &[]))
        .with_term(RegistryKind::Organism, PublicTerm::new("NCBITaxon:9606", "human", &[]));
    let inst = Instance::new(InMemoryStorage::new(), Settings::default()).with_public_source(Arc::new(ontology));
    inst.attach(REMOTE, InMemoryStorage::new()).unwrap();
    inst
}

fn feat_df(a: i64) -> DataFrame {
    DataFrame::new()
        .with_column("feat1", ColumnData::Int64(vec![a, a + 1]))
        .with_column("feat2", ColumnData::Object(vec!["x".into(), "y".into()]))
}

fn save_features(session: &mut Session<'_, InMemoryStorage>, df: &DataFrame) -> Vec<Feature> {
    let mut features = Feature::from_df(session, df).unwrap();
    for f in features.iter_mut() {
        if !f.is_persisted() {
            session.default_db_mut().insert(f).unwrap();
        }
    }
    features
}

fn track(session: &mut Session<'_, InMemoryStorage>, transform: &str) {
    let ctx = RunContext::track(
        session,
        &mut User::new("testuser1"),
        &mut Transform::new(transform, TransformKind::Pipeline),
    )
    .unwrap();
    session.run_context = ctx;
}

#[test]
fn test_hash_is_order_independent() {
    let ids = ["uid3", "uid1", "uid2"];
    let expected = hash_set(ids);
    for perm in [["uid1", "uid2", "uid3"], ["uid2", "uid3", "uid1"], ["uid3", "uid2", "uid1"]] {
        assert_eq!(hash_set(perm), expected);
    }
}

#[test]
fn test_feature_set_dedup_and_homogeneity() {
    let inst = instance();
    let mut session = inst.session().unwrap();
    let features = save_features(&mut session, &feat_df(1));
    let members: Vec<AnyRecord> = features.iter().cloned().map(AnyRecord::from).collect();

    let mut first = FeatureSet::new(&session, members.clone(), None, None).unwrap();
    first.save(&mut session).unwrap();
    let second = FeatureSet::new(&session, members.clone(), None, None).unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(session.default_db().count::<FeatureSet>().unwrap(), 1);

    let mut label = ULabel::new("lung");
    session.default_db_mut().insert(&mut label).unwrap();
    let mut mixed = members;
    mixed.push(label.into());
    assert!(matches!(FeatureSet::new(&session, mixed, None, None), Err(Error::Type(_))));
}

#[test]
fn test_column_type_inference() {
    let df = DataFrame::new()
        .with_column("cat", ColumnData::Object(vec!["a".into(), "b".into(), "a".into(), "b".into()]))
        .with_column("num", ColumnData::Float64(vec![0.1, 0.2, 0.3, 0.4]));
    let inst = instance();
    let mut session = inst.session().unwrap();
    let features = Feature::from_df(&mut session, &df).unwrap();
    assert_eq!(features[0].kind, FeatureType::Category);
    assert_eq!(features[1].kind, FeatureType::Number);
}

#[test]
fn test_end_to_end_single_feature_set() {
    let inst = instance();
    let mut session = inst.session().unwrap();
    let df = feat_df(1);
    save_features(&mut session, &df);

    let columns = df.column_names();
    let fs = FeatureSet::from_values(&mut session, columns.as_slice(), Feature::NAME, None, None, false, None)
        .unwrap()
        .unwrap();
    let init = FileInit { feature_sets: vec![fs], ..FileInit::default() };
    let mut file = File::from_data(&mut session, &DataObject::from(df), init).unwrap();
    file.save(&mut session).unwrap();

    // a second file with the same columns reuses the set
    let mut other = File::from_data(&mut session, &DataObject::from(feat_df(10)), FileInit::default()).unwrap();
    other.save(&mut session).unwrap();

    let all: Vec<FeatureSet> = session.default_db().all().unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].n, 2);
    assert_eq!(all[0].registry, "core.Feature");
    assert_eq!(all[0].kind, None);

    let slots = FeatureManager::new(&other).unwrap().feature_sets_by_slot(&session).unwrap();
    assert_eq!(slots[SLOT_COLUMNS].id, all[0].id);
}

#[test]
fn test_dataset_file_and_files_are_exclusive() {
    let inst = instance();
    let mut session = inst.session().unwrap();
    save_features(&mut session, &feat_df(1));
    let mut a = File::from_data(&mut session, &DataObject::from(feat_df(1)), FileInit::default()).unwrap();
    a.save(&mut session).unwrap();
    let mut b = File::from_data(&mut session, &DataObject::from(feat_df(5)), FileInit::default()).unwrap();
    b.save(&mut session).unwrap();

    let init = DatasetInit {
        name: "both".into(),
        file: Some(a.clone()),
        files: vec![b.clone()],
        ..DatasetInit::default()
    };
    assert!(matches!(Dataset::new(&mut session, init), Err(Error::Value(_))));

    let mut dataset = Dataset::from_files(&mut session, "ab", vec![a.clone(), b.clone()]).unwrap();
    dataset.save(&mut session).unwrap();
    assert_eq!(dataset.files(&session, recdb::DEFAULT_DB).unwrap().len(), 2);

    // same files, same dataset
    let again = Dataset::from_files(&mut session, "ab again", vec![b.clone(), a.clone()]).unwrap();
    assert_eq!(again.id, dataset.id);

    let mut flag = Feature::draft("flag", FeatureType::Bool);
    session.default_db_mut().insert(&mut flag).unwrap();
    let odd_df = DataFrame::new().with_column("flag", ColumnData::Bool(vec![true]));
    let mut odd = File::from_data(&mut session, &DataObject::from(odd_df), FileInit::default()).unwrap();
    odd.save(&mut session).unwrap();
    let err = Dataset::from_files(&mut session, "mixed", vec![a, odd]).unwrap_err();
    assert!(err.to_string().contains("same feature sets"));
}

#[test]
fn test_dataset_load_concatenates_files() {
    let inst = instance();
    let mut session = inst.session().unwrap();
    let store = InMemoryObjects::new();
    let mut files = Vec::new();
    for start in [1, 3] {
        let data = DataObject::from(feat_df(start));
        let mut f = File::from_data(&mut session, &data, FileInit::default()).unwrap();
        f.save(&mut session).unwrap();
        store.put(&f, data).unwrap();
        files.push(f);
    }
    let mut dataset = Dataset::from_files(&mut session, "pair", files).unwrap();
    dataset.save(&mut session).unwrap();

    match dataset.load(&mut session, &store, false).unwrap() {
        DataObject::DataFrame(df) => assert_eq!(df.n_rows(), 4),
        other => panic!("expected a DataFrame, got {other:?}"),
    }
    assert!(matches!(dataset.backed(&session, &store), Err(Error::Runtime(_))));
}

#[test]
fn test_transfer_twice_returns_existing() {
    let inst = instance();
    let mut session = inst.session().unwrap();
    let mut remote_label = ULabel::new("tissue");
    remote_label.uid = "abc123".into();
    session.using_mut(REMOTE).unwrap().insert(&mut remote_label).unwrap();

    let mut cache = FkCache::new();
    let mut first = remote_label.clone();
    assert!(transfer_to_default_db(&mut session, &mut first, REMOTE, true, false, true, &mut cache)
        .unwrap()
        .is_none());
    let inserts = session.default_db().events().count(Operation::Insert, ULabel::REGISTRY);

    let mut second = remote_label.clone();
    let existing = transfer_to_default_db(&mut session, &mut second, REMOTE, true, false, true, &mut cache)
        .unwrap()
        .unwrap();
    assert_eq!(existing.uid, "abc123");
    assert_eq!(session.default_db().events().count(Operation::Insert, ULabel::REGISTRY), inserts);
}

/// A file on the remote database with a category feature, one label under
/// it, one cell type under another, and one label without a feature.
fn remote_file(session: &mut Session<'_, InMemoryStorage>) -> File {
    let df = DataFrame::new().with_column("x", ColumnData::Int64(vec![1, 2, 3]));
    let mut file = File::from_data(session, &DataObject::from(df), FileInit::default()).unwrap();

    let remote = session.using_mut(REMOTE).unwrap();
    remote.insert(&mut file).unwrap();
    let file_id = file.id.unwrap();

    let mut tissue = Feature::draft("tissue", FeatureType::Category);
    tissue.registries = Some("core.ULabel".into());
    remote.insert(&mut tissue).unwrap();
    let mut cell_type = Feature::draft("cell_type", FeatureType::Category);
    cell_type.registries = Some("bionty.CellType".into());
    remote.insert(&mut cell_type).unwrap();

    let mut external = FeatureSet {
        id: None,
        uid: "externalremote01".into(),
        name: None,
        kind: None,
        n: 2,
        registry: "core.Feature".into(),
        hash: hash_set([tissue.uid.as_str(), cell_type.uid.as_str()]),
        pending_members: Vec::new(),
    };
    let fs_id = remote.insert(&mut external).unwrap();
    for f in [&tissue, &cell_type] {
        remote
            .link(Link::new(FeatureSet::members_relation("core.Feature"), fs_id, f.id.unwrap()))
            .unwrap();
    }
    remote
        .link(Link::new(File::FEATURE_SETS, file_id, fs_id).with_slot(SLOT_EXTERNAL))
        .unwrap();

    let mut human = Organism::new("human", Some("NCBITaxon:9606"));
    remote.insert(&mut human).unwrap();
    let mut lung = ULabel::new("lung");
    let mut batch = ULabel::new("batch1");
    let mut t_cell = CellType::new("T cell", Some("CL:0000084"), human.id);
    remote.insert(&mut lung).unwrap();
    remote.insert(&mut batch).unwrap();
    remote.insert(&mut t_cell).unwrap();

    let ulabels = "core.File:core.ULabel";
    remote
        .link(Link::new(ulabels, file_id, lung.id.unwrap()).with_feature(tissue.id))
        .unwrap();
    remote.link(Link::new(ulabels, file_id, batch.id.unwrap())).unwrap();
    remote
        .link(Link::new("core.File:bionty.CellType", file_id, t_cell.id.unwrap()).with_feature(cell_type.id))
        .unwrap();
    file
}

#[test]
fn test_save_from_carries_features_and_labels() {
    let inst = instance();
    let mut session = inst.session().unwrap();
    let source = remote_file(&mut session);
    track(&mut session, "transfer");

    let mut file = source.clone();
    save_from(&mut session, &mut file, REMOTE, true).unwrap();
    assert_ne!(file.id, None);
    assert_eq!(file.uid, source.uid);
    assert_eq!(file.run_id, session.run_context.run);

    let db = session.default_db();
    let tissue: Feature = db.one_or_none("name", &json!("tissue")).unwrap().unwrap();
    let cell_type: Feature = db.one_or_none("name", &json!("cell_type")).unwrap().unwrap();

    let labels = LabelManager::new(&file).unwrap();
    assert_eq!(labels.get_names(&session, &tissue).unwrap(), vec!["lung"]);
    assert_eq!(labels.get_names(&session, &cell_type).unwrap(), vec!["T cell"]);
    let summary = labels.describe(&session).unwrap();
    assert!(summary.contains("(2, core.ULabel)"));
    assert!(summary.contains("'batch1'"));

    // ontology parents came along with the cell type
    assert_eq!(session.default_db().count::<CellType>().unwrap(), 3);

    let slots = FeatureManager::new(&file).unwrap().feature_sets_by_slot(&session).unwrap();
    assert_eq!(slots[SLOT_EXTERNAL].n, 2);

    // a second transfer changes nothing
    let counts = |s: &Session<'_, InMemoryStorage>| {
        (
            s.default_db().count::<File>().unwrap(),
            s.default_db().count::<ULabel>().unwrap(),
            s.default_db().count::<FeatureSet>().unwrap(),
            s.default_db().relation("core.File:core.ULabel").unwrap().len(),
        )
    };
    let before = counts(&session);
    let mut again = source.clone();
    save_from(&mut session, &mut again, REMOTE, true).unwrap();
    assert_eq!(again.id, file.id);
    assert_eq!(counts(&session), before);
}

#[test]
fn test_save_from_without_parents() {
    let inst = instance();
    let mut session = inst.session().unwrap();
    let mut file = remote_file(&mut session);
    save_from(&mut session, &mut file, REMOTE, false).unwrap();

    let cells: Vec<CellType> = session.default_db().all().unwrap();
    assert_eq!(cells.len(), 1);
    // the organism foreign key points at the copied organism
    let human: Organism = session.default_db().one_or_none("name", &json!("human")).unwrap().unwrap();
    assert_eq!(cells[0].organism_id, human.id);
}

#[test]
fn test_label_values_from_public_source() {
    let inst = instance();
    let session = inst.session().unwrap();
    let cells = from_values::<CellType, _, _>(&session, &["T cell", "lymphocyte"], "name", None).unwrap();
    assert_eq!(cells.len(), 2);
    assert!(cells.iter().all(|c| !c.is_persisted() && c.ontology_id.is_some()));
}

#[test]
fn test_flow_lineage_to_dot() {
    let inst = instance();
    let mut session = inst.session().unwrap();
    let store = InMemoryObjects::new();

    track(&mut session, "ingest");
    let raw_data = DataObject::from(feat_df(1));
    let mut raw = File::from_data(
        &mut session,
        &raw_data,
        FileInit { description: Some("raw".into()), ..FileInit::default() },
    )
    .unwrap();
    raw.save(&mut session).unwrap();
    store.put(&raw, raw_data).unwrap();

    track(&mut session, "process");
    raw.load(&mut session, &store, true).unwrap();
    let mut processed = File::from_data(
        &mut session,
        &DataObject::from(feat_df(100)),
        FileInit { key: Some("processed.parquet".into()), ..FileInit::default() },
    )
    .unwrap();
    processed.save(&mut session).unwrap();

    let graph = view_flow(&session, &processed, true).unwrap();
    let dot = graph.to_dot();
    assert!(dot.contains("📄 raw"));
    assert!(dot.contains("📄 processed.parquet"));
    assert!(dot.contains("🧩 process"));
    assert_eq!(graph.edges().len(), 3);
}
