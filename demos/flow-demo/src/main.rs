use std::sync::Arc;

use anyhow::{Context, Result};
use lamindb::registry::{from_values, save_records};
use lamindb::{
    save_from, view_flow, view_parents, AnyRecord, CellType, ColumnData, DataFrame, DataObject, Feature,
    FeatureManager, File, FileInit, InMemoryObjects, InMemoryOntology, Instance, LabelManager, PublicTerm,
    RegistryKind, RunContext, Session, Settings, Transform, TransformKind, ULabel, User,
};
use recdb::{InMemoryStorage, Link};
use serde_json::json;
use tracing::info;

const COLLABORATOR: &str = "collaborator";

fn ontology() -> InMemoryOntology {
    InMemoryOntology::new()
        .with_term(RegistryKind::CellType, PublicTerm::new("CL:0000084", "T cell", &["CL:0000542"]))
        .with_term(RegistryKind::CellType, PublicTerm::new("CL:0000236", "B cell", &["CL:0000542"]))
        .with_term(RegistryKind::CellType, PublicTerm::new("CL:0000542", "lymphocyte", &["CL:0000000"]))
        .with_term(RegistryKind::CellType, PublicTerm::new("CL:0000000", "cell", &[]))
}

fn track(session: &mut Session<'_, InMemoryStorage>, name: &str, kind: TransformKind) -> Result<()> {
    let ctx = RunContext::track(session, &mut User::new("demo"), &mut Transform::new(name, kind))?;
    session.run_context = ctx;
    Ok(())
}

/// A file on the collaborator's database with one free-standing label.
fn seed_collaborator(session: &mut Session<'_, InMemoryStorage>) -> Result<File> {
    let df = DataFrame::new().with_column("donor", ColumnData::Object(vec!["d1".into(), "d2".into()]));
    let mut file = File::from_data(
        session,
        &DataObject::from(df),
        FileInit { description: Some("collaborator donors".into()), ..FileInit::default() },
    )?;

    let db = session.using_mut(COLLABORATOR)?;
    let file_id = db.insert(&mut file)?;
    let mut lung = ULabel::new("lung");
    let lung_id = db.insert(&mut lung)?;
    db.link(Link::new("core.File:core.ULabel", file_id, lung_id).with_feature(None))?;
    Ok(file)
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = Settings::from_env().context("failed to read settings")?;
    let inst = Instance::new(InMemoryStorage::new(), settings).with_public_source(Arc::new(ontology()));
    inst.attach(COLLABORATOR, InMemoryStorage::new())?;
    let mut session = inst.session()?;

    let remote_file = seed_collaborator(&mut session)?;

    // --- ingest ---
    track(&mut session, "ingest", TransformKind::Pipeline)?;
    let store = InMemoryObjects::new();
    let df = DataFrame::new()
        .with_column("cell_type", ColumnData::Object(vec!["T cell".into(), "B cell".into(), "T cell".into()]))
        .with_column("n_genes", ColumnData::Int64(vec![1200, 980, 1430]));
    for mut feature in Feature::from_df(&mut session, &df)? {
        if feature.id.is_none() {
            session.default_db_mut().insert(&mut feature)?;
        }
    }
    let data = DataObject::from(df);
    let mut raw = File::from_data(
        &mut session,
        &data,
        FileInit { description: Some("raw counts".into()), ..FileInit::default() },
    )?;
    raw.save(&mut session)?;
    store.put(&raw, data)?;

    let mut cell_types: Vec<CellType> = from_values(&session, &["T cell", "B cell"], "name", None)?;
    save_records(&mut session, &mut cell_types, true)?;
    let mut cell_type = session
        .default_db()
        .one_or_none::<Feature>("name", &json!("cell_type"))?
        .context("cell_type feature missing")?;
    LabelManager::new(&raw)?.add(
        &mut session,
        cell_types.iter().cloned().map(AnyRecord::from).collect(),
        Some(&mut cell_type),
    )?;

    // --- bring in the collaborator's file ---
    let mut imported = remote_file.clone();
    save_from(&mut session, &mut imported, COLLABORATOR, true)?;
    info!(uid = %imported.uid, "imported collaborator file");

    // --- process ---
    track(&mut session, "process", TransformKind::Notebook)?;
    raw.load(&mut session, &store, true)?;
    let filtered = DataFrame::new()
        .with_column("cell_type", ColumnData::Object(vec!["T cell".into(), "T cell".into()]))
        .with_column("n_genes", ColumnData::Int64(vec![1200, 1430]));
    let mut processed = File::from_data(
        &mut session,
        &DataObject::from(filtered),
        FileInit { key: Some("filtered.parquet".into()), ..FileInit::default() },
    )?;
    processed.save(&mut session)?;

    println!("{}", LabelManager::new(&raw)?.describe(&session)?);
    println!("{}", LabelManager::new(&imported)?.describe(&session)?);
    for (slot, fs) in FeatureManager::new(&processed)?.feature_sets_by_slot(&session)? {
        println!("feature set {slot}: {} features of {}", fs.n, fs.registry);
    }

    println!("{}", view_flow(&session, &processed, true)?.to_dot());
    let t_cell = cell_types.first().context("no cell types created")?;
    println!("{}", view_parents(&session, t_cell, false, 5)?.to_dot());
    Ok(())
}
