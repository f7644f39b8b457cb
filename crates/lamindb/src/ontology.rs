//! Public reference ontologies, consumed as an external service.

use std::collections::BTreeMap;

use crate::record::RegistryKind;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicTerm {
    pub ontology_id: String,
    pub name: String,
    /// Ontology ids of the direct parents.
    pub parents: Vec<String>,
}

impl PublicTerm {
    pub fn new(ontology_id: &str, name: &str, parents: &[&str]) -> Self {
        Self {
            ontology_id: ontology_id.to_string(),
            name: name.to_string(),
            parents: parents.iter().map(|p| p.to_string()).collect(),
        }
    }
}

pub trait PublicSource: Send + Sync {
    /// Term of `registry` whose `field` (`name` or `ontology_id`) equals `value`.
    fn lookup(&self, registry: RegistryKind, field: &str, value: &str) -> Option<PublicTerm>;
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryOntology {
    terms: BTreeMap<RegistryKind, Vec<PublicTerm>>,
}

impl InMemoryOntology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_term(mut self, registry: RegistryKind, term: PublicTerm) -> Self {
        self.terms.entry(registry).or_default().push(term);
        self
    }
}

impl PublicSource for InMemoryOntology {
    fn lookup(&self, registry: RegistryKind, field: &str, value: &str) -> Option<PublicTerm> {
        self.terms.get(&registry)?.iter().find(|t| match field {
            "name" => t.name == value,
            "ontology_id" => t.ontology_id == value,
            _ => false,
        })
        .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_name_and_id() {
        let source = InMemoryOntology::new()
            .with_term(RegistryKind::CellType, PublicTerm::new("CL:0000084", "T cell", &["CL:0000542"]));

        let by_name = source.lookup(RegistryKind::CellType, "name", "T cell").unwrap();
        assert_eq!(by_name.ontology_id, "CL:0000084");
        assert!(source.lookup(RegistryKind::CellType, "ontology_id", "CL:0000084").is_some());
        assert!(source.lookup(RegistryKind::Organism, "name", "T cell").is_none());
        assert!(source.lookup(RegistryKind::CellType, "description", "T cell").is_none());
    }
}
