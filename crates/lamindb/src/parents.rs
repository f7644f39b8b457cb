//! Lineage graphs: parent hierarchies and run data flow.
//!
//! Both views build a [`LineageGraph`] of labelled nodes and deduplicated
//! directed edges. [`LineageGraph::to_dot`] renders it as Graphviz DOT text.

use std::collections::{BTreeMap, BTreeSet};

use recdb::{Database, RecDbError, RowId, Storage};
use serde_json::json;

use crate::host::{Host, HostKind, HostRef};
use crate::instance::Session;
use crate::record::{HasParents, Record};
use crate::schema::{CellType, Dataset, File, Run, Transform, TransformKind, ULabel, User};
use crate::{Error, Result};

const LAMIN_GREEN_LIGHTER: &str = "#10b981";
const LAMIN_GREEN_DARKER: &str = "#065f46";
const GREEN_FILL: &str = "honeydew";
const RUN_FILL: &str = "gainsboro";

pub fn transform_emoji(kind: Option<TransformKind>) -> &'static str {
    match kind {
        Some(TransformKind::Notebook) => "📔",
        Some(TransformKind::App) => "🖥️",
        // no transform at all reads as a pipeline
        Some(TransformKind::Pipeline) | None => "🧩",
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LineageNode {
    pub id: String,
    pub title: String,
    /// Small print under the title, one entry per line.
    pub details: Vec<String>,
    pub fill: &'static str,
}

impl LineageNode {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self { id: id.into(), title: title.into(), details: Vec::new(), fill: GREEN_FILL }
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.details.push(detail.into());
        self
    }

    fn label(&self) -> String {
        if self.details.is_empty() {
            return format!("<{}>", escape(&self.title));
        }
        let details: Vec<String> = self.details.iter().map(|d| escape(d)).collect();
        format!(
            "<{}<BR/><FONT COLOR=\"GREY\" POINT-SIZE=\"10\" FACE=\"Monospace\">{}</FONT>>",
            escape(&self.title),
            details.join("<BR/>")
        )
    }
}

#[derive(Clone, Debug, Default)]
pub struct LineageGraph {
    name: String,
    nodes: Vec<LineageNode>,
    edges: Vec<(String, String)>,
    edge_set: BTreeSet<(String, String)>,
}

impl LineageGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add `node` unless a node with the same id exists.
    pub fn add_node(&mut self, node: LineageNode) {
        if self.node(&node.id).is_none() {
            self.nodes.push(node);
        }
    }

    /// Returns `false` for an edge already present.
    pub fn add_edge(&mut self, source: &str, target: &str) -> bool {
        let edge = (source.to_string(), target.to_string());
        if !self.edge_set.insert(edge.clone()) {
            return false;
        }
        self.edges.push(edge);
        true
    }

    pub fn nodes(&self) -> &[LineageNode] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&LineageNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn edges(&self) -> &[(String, String)] {
        &self.edges
    }

    pub fn has_edge(&self, source: &str, target: &str) -> bool {
        self.edge_set.contains(&(source.to_string(), target.to_string()))
    }

    pub fn to_dot(&self) -> String {
        let mut out = format!("digraph \"{}\" {{\n", self.name);
        out.push_str(&format!(
            "  node [color=\"{LAMIN_GREEN_DARKER}\", fillcolor=\"{GREEN_FILL}\", shape=\"box\", \
             style=\"rounded,filled\", fontname=\"Helvetica\", fontsize=\"10\"];\n"
        ));
        out.push_str("  edge [arrowsize=\"0.5\"];\n");
        for node in &self.nodes {
            out.push_str(&format!("  \"{}\" [label={}, fillcolor=\"{}\"];\n", node.id, node.label(), node.fill));
        }
        for (source, target) in &self.edges {
            out.push_str(&format!("  \"{source}\" -> \"{target}\" [color=\"dimgrey\"];\n"));
        }
        out.push_str("}\n");
        out
    }
}

/// How a record of a parent hierarchy is shown in a lineage graph.
pub trait LineageLabel: HasParents {
    fn lineage_node<S: Storage>(&self, _db: &Database<S>) -> Result<LineageNode> {
        Ok(LineageNode::new(self.uid(), self.display()))
    }
}

impl LineageLabel for ULabel {}

impl LineageLabel for CellType {}

impl LineageLabel for Transform {
    fn lineage_node<S: Storage>(&self, db: &Database<S>) -> Result<LineageNode> {
        Ok(LineageNode::new(self.uid.clone(), format!("{} {}", transform_emoji(Some(self.kind)), self.name))
            .with_detail(format!("id={}", self.uid))
            .with_detail(format!("type={}, user={}", self.kind.as_str(), user_name(db, self.created_by_id)?))
            .with_detail(format!("updated_at={}", self.updated_at.format("%Y-%m-%d %H:%M:%S"))))
    }
}

fn user_name<S: Storage>(db: &Database<S>, id: Option<RowId>) -> Result<String> {
    let Some(id) = id else {
        return Ok("None".into());
    };
    Ok(db
        .get::<User>(id)?
        .map(|u| u.name.unwrap_or(u.handle))
        .unwrap_or_else(|| "None".into()))
}

fn load<R: Record, S: Storage>(db: &Database<S>, id: RowId) -> Result<R> {
    Ok(db.get::<R>(id)?.ok_or(RecDbError::MissingRow { registry: R::REGISTRY, id })?)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Parents,
    Children,
}

fn neighbours<S: Storage>(db: &Database<S>, relation: &str, id: RowId, direction: Direction) -> Result<Vec<RowId>> {
    Ok(match direction {
        Direction::Parents => db.links(relation, id)?.into_iter().map(|l| l.right).collect(),
        Direction::Children => db.links_to(relation, id)?.into_iter().map(|l| l.left).collect(),
    })
}

/// Ids reachable from `start` in at most `depth` steps, `start` included.
fn within<S: Storage>(
    db: &Database<S>,
    relation: &str,
    start: RowId,
    depth: usize,
    direction: Direction,
) -> Result<BTreeSet<RowId>> {
    let mut seen = BTreeSet::from([start]);
    let mut frontier = vec![start];
    for _ in 0..depth {
        let mut next = Vec::new();
        for id in frontier {
            for n in neighbours(db, relation, id, direction)? {
                if seen.insert(n) {
                    next.push(n);
                }
            }
        }
        if next.is_empty() {
            break;
        }
        frontier = next;
    }
    Ok(seen)
}

/// Parents of `record` within `distance`, and with `with_children` its
/// descendants too. Edges always point from parent to child.
pub fn view_parents<R: LineageLabel, S: Storage>(
    session: &Session<'_, S>,
    record: &R,
    with_children: bool,
    distance: usize,
) -> Result<LineageGraph> {
    let root = record
        .id()
        .ok_or_else(|| Error::Value(format!("save the {} record before viewing its parents", R::KIND)))?;
    let db = session.default_db();
    let relation = R::PARENTS_RELATION;
    let depth = if distance < 2 { 1 } else { distance - 1 };

    let mut graph = LineageGraph::new(record.uid());
    let mut focus = record.lineage_node(db)?;
    focus.fill = LAMIN_GREEN_LIGHTER;
    graph.add_node(focus);

    let mut cache: BTreeMap<RowId, LineageNode> = BTreeMap::new();
    let mut node = |id: RowId| -> Result<LineageNode> {
        if let Some(n) = cache.get(&id) {
            return Ok(n.clone());
        }
        let n = load::<R, S>(db, id)?.lineage_node(db)?;
        cache.insert(id, n.clone());
        Ok(n)
    };

    let mut directions = vec![Direction::Parents];
    if with_children {
        directions.push(Direction::Children);
    }
    for direction in directions {
        for id in within(db, relation, root, depth, direction)? {
            let here = node(id)?;
            for other in neighbours(db, relation, id, direction)? {
                let there = node(other)?;
                let (parent, child) = match direction {
                    Direction::Parents => (&there, &here),
                    Direction::Children => (&here, &there),
                };
                graph.add_node(parent.clone());
                graph.add_node(child.clone());
                graph.add_edge(&parent.id, &child.id);
            }
        }
    }
    Ok(graph)
}

/// Data flow around `host`: inputs, the run, its outputs, recursively up
/// through the runs that produced the inputs. With `with_children`, also
/// down through the runs that consumed the outputs.
pub fn view_flow<H: Host, S: Storage>(session: &Session<'_, S>, host: &H, with_children: bool) -> Result<LineageGraph> {
    let host_ref = host.host_ref()?;
    let mut flow = Flow { db: session.default_db(), graph: LineageGraph::new(host.uid()) };

    let mut focus = flow.data_node(host_ref)?;
    focus.fill = LAMIN_GREEN_LIGHTER;
    flow.graph.add_node(focus);

    let mut seen = BTreeSet::new();
    let mut runs: Vec<RowId> = host.run_id().into_iter().collect();
    while !runs.is_empty() {
        let mut next = Vec::new();
        for run in runs {
            if !seen.insert(run) {
                continue;
            }
            let inputs = flow.connect_inputs(run)?;
            flow.connect_outputs(run)?;
            for input in inputs {
                next.extend(flow.run_of(input)?);
            }
        }
        runs = next;
    }

    if with_children {
        let origin = host.run_id();
        let mut seen = BTreeSet::new();
        let mut runs = match origin {
            Some(run) => vec![run],
            None => flow.consumers(&[host_ref])?,
        };
        while !runs.is_empty() {
            let mut next = Vec::new();
            for run in runs {
                if !seen.insert(run) {
                    continue;
                }
                if Some(run) != origin {
                    flow.connect_inputs(run)?;
                }
                let outputs = flow.connect_outputs(run)?;
                next.extend(flow.consumers(&outputs)?);
            }
            runs = next;
        }
    }
    Ok(flow.graph)
}

struct Flow<'d, S: Storage> {
    db: &'d Database<S>,
    graph: LineageGraph,
}

impl<'d, S: Storage> Flow<'d, S> {
    fn data_id(data: HostRef) -> String {
        match data.kind {
            HostKind::File => format!("file_{}", data.id),
            HostKind::Dataset => format!("dataset_{}", data.id),
        }
    }

    fn run_id(run: RowId) -> String {
        format!("run_{run}")
    }

    fn data_node(&self, data: HostRef) -> Result<LineageNode> {
        let id = Self::data_id(data);
        Ok(match data.kind {
            HostKind::File => {
                let file: File = load(self.db, data.id)?;
                let name = file.description.clone().or(file.key.clone()).unwrap_or(file.uid.clone());
                LineageNode::new(id, format!("📄 {name}"))
                    .with_detail(format!("id={}", file.uid))
                    .with_detail(format!("suffix={}", file.suffix))
            }
            HostKind::Dataset => {
                let dataset: Dataset = load(self.db, data.id)?;
                LineageNode::new(id, format!("🍱 {}", dataset.name))
                    .with_detail(format!("id={}", dataset.uid))
                    .with_detail(format!("version={}", dataset.version.as_deref().unwrap_or("None")))
            }
        })
    }

    fn run_node(&self, run: RowId) -> Result<LineageNode> {
        let run: Run = load(self.db, run)?;
        let transform = self.db.get::<Transform>(run.transform_id)?;
        let kind = transform.as_ref().map(|t| t.kind);
        let name = transform.as_ref().map(|t| t.name.as_str()).unwrap_or("unknown transform");
        let mut node = LineageNode::new(Self::run_id(run.id.unwrap_or_default()), format!("{} {name}", transform_emoji(kind)))
            .with_detail(format!("id={}", run.uid))
            .with_detail(format!(
                "type={}, user={}",
                kind.map(TransformKind::as_str).unwrap_or("None"),
                user_name(self.db, run.created_by_id)?
            ))
            .with_detail(format!("run_at={}", run.run_at.format("%Y-%m-%d %H:%M:%S")));
        node.fill = RUN_FILL;
        Ok(node)
    }

    fn run_of(&self, data: HostRef) -> Result<Option<RowId>> {
        Ok(match data.kind {
            HostKind::File => load::<File, S>(self.db, data.id)?.run_id,
            HostKind::Dataset => load::<Dataset, S>(self.db, data.id)?.run_id,
        })
    }

    /// Add `input -> run` edges; returns the inputs.
    fn connect_inputs(&mut self, run: RowId) -> Result<Vec<HostRef>> {
        let mut inputs = Vec::new();
        for kind in [HostKind::File, HostKind::Dataset] {
            for link in self.db.links(kind.input_relation(), run)? {
                inputs.push(HostRef { kind, id: link.right });
            }
        }
        if inputs.is_empty() {
            return Ok(inputs);
        }
        self.graph.add_node(self.run_node(run)?);
        for input in &inputs {
            self.graph.add_node(self.data_node(*input)?);
            self.graph.add_edge(&Self::data_id(*input), &Self::run_id(run));
        }
        Ok(inputs)
    }

    /// Add `run -> output` edges; returns the outputs.
    fn connect_outputs(&mut self, run: RowId) -> Result<Vec<HostRef>> {
        let mut outputs = Vec::new();
        for file in self.db.filter::<File>("run_id", &json!(run))? {
            outputs.extend(file.id.map(|id| HostRef { kind: HostKind::File, id }));
        }
        for dataset in self.db.filter::<Dataset>("run_id", &json!(run))? {
            outputs.extend(dataset.id.map(|id| HostRef { kind: HostKind::Dataset, id }));
        }
        if outputs.is_empty() {
            return Ok(outputs);
        }
        self.graph.add_node(self.run_node(run)?);
        for output in &outputs {
            self.graph.add_node(self.data_node(*output)?);
            self.graph.add_edge(&Self::run_id(run), &Self::data_id(*output));
        }
        Ok(outputs)
    }

    /// Runs that took any of `data` as input.
    fn consumers(&self, data: &[HostRef]) -> Result<Vec<RowId>> {
        let mut runs = Vec::new();
        for d in data {
            for link in self.db.links_to(d.kind.input_relation(), d.id)? {
                runs.push(link.left);
            }
        }
        Ok(runs)
    }
}
