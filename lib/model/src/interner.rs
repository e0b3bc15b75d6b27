use oxrdf::{GraphName, NamedNode, Quad, Subject, Term};
use rustc_hash::FxHashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Canonicalizes equal RDF terms to a single shared instance.
///
/// oxrdf terms are heap-backed values compared structurally, so a model that holds millions of
/// quads easily stores the same IRI string thousands of times. A `ValueNormalizer` maps every
/// term to one canonical clone drawn from a shared table. Long-lived structures (models,
/// matchers, templates) normalize their terms once so that equal terms share backing storage
/// and subsequent comparisons stay cheap.
///
/// Cloning a normalizer yields a handle onto the same table.
#[derive(Debug, Default, Clone)]
pub struct ValueNormalizer {
    terms: Arc<Mutex<FxHashSet<Term>>>,
}

impl ValueNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, FxHashSet<Term>> {
        // A poisoned interning table is still a valid set of canonical terms.
        self.terms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn normalize_term(&self, term: &Term) -> Term {
        let mut table = self.table();
        if let Some(canonical) = table.get(term) {
            canonical.clone()
        } else {
            table.insert(term.clone());
            term.clone()
        }
    }

    pub fn normalize_named_node(&self, node: &NamedNode) -> NamedNode {
        match self.normalize_term(&node.clone().into()) {
            Term::NamedNode(n) => n,
            _ => node.clone(),
        }
    }

    pub fn normalize_subject(&self, subject: &Subject) -> Subject {
        match subject {
            Subject::NamedNode(n) => self.normalize_named_node(n).into(),
            Subject::BlankNode(b) => match self.normalize_term(&b.clone().into()) {
                Term::BlankNode(b) => b.into(),
                _ => subject.clone(),
            },
        }
    }

    pub fn normalize_graph_name(&self, graph_name: &GraphName) -> GraphName {
        match graph_name {
            GraphName::NamedNode(n) => self.normalize_named_node(n).into(),
            GraphName::BlankNode(b) => match self.normalize_term(&b.clone().into()) {
                Term::BlankNode(b) => b.into(),
                _ => graph_name.clone(),
            },
            GraphName::DefaultGraph => GraphName::DefaultGraph,
        }
    }

    pub fn normalize_quad(&self, quad: &Quad) -> Quad {
        Quad {
            subject: self.normalize_subject(&quad.subject),
            predicate: self.normalize_named_node(&quad.predicate),
            object: self.normalize_term(&quad.object),
            graph_name: self.normalize_graph_name(&quad.graph_name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_preserves_equality() {
        let normalizer = ValueNormalizer::new();
        let a = Term::from(NamedNode::new("http://example.com/a").unwrap());
        let b = Term::from(NamedNode::new("http://example.com/a").unwrap());
        assert_eq!(normalizer.normalize_term(&a), normalizer.normalize_term(&b));
        assert_eq!(normalizer.normalize_term(&a), a);
    }

    #[test]
    fn handles_share_the_table() {
        let normalizer = ValueNormalizer::new();
        let other = normalizer.clone();
        let term = Term::from(NamedNode::new("http://example.com/a").unwrap());
        normalizer.normalize_term(&term);
        assert_eq!(other.table().len(), 1);
    }
}
