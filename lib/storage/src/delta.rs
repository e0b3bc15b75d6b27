use crate::MemoryQuadModel;
use quadflow_common::QuadCollection;
use quadflow_model::{
    GraphNamePattern, NamedNodePattern, Quad, QuadPattern, TermPattern, ValueNormalizer,
};

/// The quads derived during one semi-naive evaluation round.
///
/// A delta is a small indexed model plus a constant-presence pre-check: a rule whose WHERE part
/// must match the delta through at least one pattern can be skipped entirely when none of the
/// pattern's constants occurs in the delta at the corresponding position.
#[derive(Debug)]
pub struct DeltaModel {
    model: MemoryQuadModel,
}

impl DeltaModel {
    /// Builds a delta over `quads`, interning into the shared `normalizer` table.
    pub fn new(quads: impl IntoIterator<Item = Quad>, normalizer: ValueNormalizer) -> Self {
        let mut model = MemoryQuadModel::with_normalizer(normalizer);
        model.extend(quads);
        Self { model }
    }

    pub fn len(&self) -> usize {
        self.model.len()
    }

    pub fn is_empty(&self) -> bool {
        self.model.is_empty()
    }

    pub fn model(&self) -> &MemoryQuadModel {
        &self.model
    }

    /// Returns false only if `pattern` cannot match any quad of this delta.
    ///
    /// Probes the index key sets for every constant position of the pattern; no quads are
    /// scanned.
    pub fn may_match(&self, pattern: &QuadPattern) -> bool {
        match &pattern.subject {
            TermPattern::NamedNode(n) => {
                if !self.model.has_subject(&n.clone().into()) {
                    return false;
                }
            }
            TermPattern::Literal(_) => return false,
            TermPattern::BlankNode(_) | TermPattern::Variable(_) => {}
        }
        if let NamedNodePattern::NamedNode(n) = &pattern.predicate {
            if !self.model.has_predicate(n) {
                return false;
            }
        }
        match &pattern.object {
            TermPattern::NamedNode(n) => {
                if !self.model.has_object(&n.clone().into()) {
                    return false;
                }
            }
            TermPattern::Literal(l) => {
                if !self.model.has_object(&l.clone().into()) {
                    return false;
                }
            }
            TermPattern::BlankNode(_) | TermPattern::Variable(_) => {}
        }
        match &pattern.graph_name {
            GraphNamePattern::NamedNode(n) => {
                if !self.model.has_graph_name(&n.clone().into()) {
                    return false;
                }
            }
            GraphNamePattern::DefaultGraph => {
                if !self
                    .model
                    .has_graph_name(&quadflow_model::GraphName::DefaultGraph)
                {
                    return false;
                }
            }
            GraphNamePattern::Variable(_) => {}
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quadflow_model::{GraphName, NamedNode, Variable};

    fn quad(s: &str, p: &str, o: &str) -> Quad {
        Quad {
            subject: NamedNode::new(s).unwrap().into(),
            predicate: NamedNode::new(p).unwrap(),
            object: NamedNode::new(o).unwrap().into(),
            graph_name: GraphName::DefaultGraph,
        }
    }

    #[test]
    fn may_match_rejects_unseen_constants() {
        let delta = DeltaModel::new(
            [quad("http://e.com/a", "http://e.com/p", "http://e.com/b")],
            ValueNormalizer::new(),
        );
        let var = |n: &str| Variable::new(n).unwrap();
        let pattern = QuadPattern {
            subject: TermPattern::Variable(var("x")),
            predicate: NamedNodePattern::NamedNode(NamedNode::new("http://e.com/p").unwrap()),
            object: TermPattern::Variable(var("y")),
            graph_name: GraphNamePattern::Variable(var("g")),
        };
        assert!(delta.may_match(&pattern));
        let other = QuadPattern {
            predicate: NamedNodePattern::NamedNode(NamedNode::new("http://e.com/q").unwrap()),
            ..pattern
        };
        assert!(!delta.may_match(&other));
    }
}
