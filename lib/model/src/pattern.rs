use oxrdf::{
    BlankNode, GraphName, Literal, NamedNode, Quad, QuadRef, Subject, SubjectRef, Term, TermRef,
    Variable,
};
use rustc_hash::FxHashSet;
use spargebra::term::{GraphNamePattern, NamedNodePattern, QuadPattern, TermPattern};
use std::fmt;
use thiserror::Error;

/// Bit marking a constant subject in a [pattern mask](pattern_mask).
pub const COMPONENT_SUBJECT: u8 = 1;
/// Bit marking a constant predicate in a [pattern mask](pattern_mask).
pub const COMPONENT_PREDICATE: u8 = 2;
/// Bit marking a constant object in a [pattern mask](pattern_mask).
pub const COMPONENT_OBJECT: u8 = 4;
/// Bit marking a constant graph name in a [pattern mask](pattern_mask).
pub const COMPONENT_GRAPH: u8 = 8;

/// Number of distinct [pattern masks](pattern_mask).
pub const COMPONENT_MASKS: usize = 16;

/// One of the four positions of a quad.
///
/// Components identify quad positions independently of the terms they hold, which is how rule
/// heads refer to positions of a rule body pattern ("copy the object of the matched quad into
/// the subject of the derived quad").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementComponent {
    Subject,
    Predicate,
    Object,
    Graph,
}

impl StatementComponent {
    /// Resolves the canonical single-letter variable names `s`, `p`, `o` and `c` used by rules
    /// whose head is not anchored to a body pattern.
    pub fn from_variable_name(name: &str) -> Option<Self> {
        match name {
            "s" => Some(Self::Subject),
            "p" => Some(Self::Predicate),
            "o" => Some(Self::Object),
            "c" => Some(Self::Graph),
            _ => None,
        }
    }

    pub fn letter(self) -> char {
        match self {
            Self::Subject => 's',
            Self::Predicate => 'p',
            Self::Object => 'o',
            Self::Graph => 'c',
        }
    }
}

impl fmt::Display for StatementComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// An error raised when a quad pattern cannot be used in a rule.
#[derive(Debug, Error)]
pub enum PatternError {
    /// Blank nodes in rule patterns would denote fresh existentials, which forward chaining
    /// cannot produce deterministically.
    #[error("blank node {0} is not allowed in a rule pattern")]
    BlankNode(BlankNode),
    /// A literal can never occupy the subject position of an RDF quad, so a pattern with one
    /// could not match or produce anything.
    #[error("literal {0} cannot be the subject of a rule pattern")]
    LiteralSubject(Literal),
    /// A head variable that is neither bound by the rule body nor one of `?s` / `?p` / `?o` /
    /// `?c`.
    #[error("variable {0} cannot be resolved to a component of the matched quad")]
    UnresolvedVariable(Variable),
}

/// Computes the constant-presence bitmask of `pattern`.
///
/// Bit 0 is set for a constant subject, bit 1 for a constant predicate, bit 2 for a constant
/// object and bit 3 for a constant graph name. The default graph counts as a constant: a
/// pattern can only be wildcard on the graph position through a variable.
pub fn pattern_mask(pattern: &QuadPattern) -> u8 {
    let mut mask = 0;
    if !matches!(pattern.subject, TermPattern::Variable(_)) {
        mask |= COMPONENT_SUBJECT;
    }
    if !matches!(pattern.predicate, NamedNodePattern::Variable(_)) {
        mask |= COMPONENT_PREDICATE;
    }
    if !matches!(pattern.object, TermPattern::Variable(_)) {
        mask |= COMPONENT_OBJECT;
    }
    if !matches!(pattern.graph_name, GraphNamePattern::Variable(_)) {
        mask |= COMPONENT_GRAPH;
    }
    mask
}

/// Collects the variables of `pattern` into `out`.
pub fn pattern_variables<'a>(pattern: &'a QuadPattern, out: &mut FxHashSet<&'a Variable>) {
    if let TermPattern::Variable(v) = &pattern.subject {
        out.insert(v);
    }
    if let NamedNodePattern::Variable(v) = &pattern.predicate {
        out.insert(v);
    }
    if let TermPattern::Variable(v) = &pattern.object {
        out.insert(v);
    }
    if let GraphNamePattern::Variable(v) = &pattern.graph_name {
        out.insert(v);
    }
}

/// Checks that `pattern` can occur in a rule: no blank nodes, and no literal in the subject
/// position.
pub fn validate_pattern(pattern: &QuadPattern) -> Result<(), PatternError> {
    if let TermPattern::Literal(l) = &pattern.subject {
        return Err(PatternError::LiteralSubject(l.clone()));
    }
    for position in [&pattern.subject, &pattern.object] {
        if let TermPattern::BlankNode(b) = position {
            return Err(PatternError::BlankNode(b.clone()));
        }
    }
    Ok(())
}

/// Extracts the ground quad denoted by an all-constant `pattern`.
///
/// Returns `None` if any position holds a variable or a term of a kind that cannot occupy it
/// (a literal subject, for example). Blank nodes never survive rule validation, so they yield
/// `None` as well.
pub fn ground_quad(pattern: &QuadPattern) -> Option<Quad> {
    let subject: Subject = match &pattern.subject {
        TermPattern::NamedNode(n) => n.clone().into(),
        TermPattern::BlankNode(_) | TermPattern::Literal(_) | TermPattern::Variable(_) => {
            return None;
        }
    };
    let predicate = match &pattern.predicate {
        NamedNodePattern::NamedNode(n) => n.clone(),
        NamedNodePattern::Variable(_) => return None,
    };
    let object: Term = match &pattern.object {
        TermPattern::NamedNode(n) => n.clone().into(),
        TermPattern::Literal(l) => l.clone().into(),
        TermPattern::BlankNode(_) | TermPattern::Variable(_) => return None,
    };
    let graph_name = match &pattern.graph_name {
        GraphNamePattern::NamedNode(n) => GraphName::NamedNode(n.clone()),
        GraphNamePattern::DefaultGraph => GraphName::DefaultGraph,
        GraphNamePattern::Variable(_) => return None,
    };
    Some(Quad {
        subject,
        predicate,
        object,
        graph_name,
    })
}

/// Reads the term at position `component` of `quad`.
///
/// The default graph has no term representation, so reading the graph position of a
/// default-graph quad yields `None`.
pub fn quad_component(quad: QuadRef<'_>, component: StatementComponent) -> Option<TermRef<'_>> {
    match component {
        StatementComponent::Subject => Some(match quad.subject {
            SubjectRef::NamedNode(n) => n.into(),
            SubjectRef::BlankNode(b) => b.into(),
        }),
        StatementComponent::Predicate => Some(quad.predicate.into()),
        StatementComponent::Object => Some(quad.object),
        StatementComponent::Graph => match quad.graph_name {
            oxrdf::GraphNameRef::NamedNode(n) => Some(n.into()),
            oxrdf::GraphNameRef::BlankNode(b) => Some(b.into()),
            oxrdf::GraphNameRef::DefaultGraph => None,
        },
    }
}

/// Converts a term into a subject, rejecting literals.
pub fn term_as_subject(term: &Term) -> Option<Subject> {
    match term {
        Term::NamedNode(n) => Some(n.clone().into()),
        Term::BlankNode(b) => Some(b.clone().into()),
        Term::Literal(_) => None,
    }
}

/// Converts a term into a predicate, rejecting everything but IRIs.
pub fn term_as_predicate(term: &Term) -> Option<NamedNode> {
    match term {
        Term::NamedNode(n) => Some(n.clone()),
        Term::BlankNode(_) | Term::Literal(_) => None,
    }
}

/// Converts a term into a graph name, rejecting literals.
pub fn term_as_graph_name(term: &Term) -> Option<GraphName> {
    match term {
        Term::NamedNode(n) => Some(n.clone().into()),
        Term::BlankNode(b) => Some(b.clone().into()),
        Term::Literal(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxrdf::{Literal, NamedNode};

    fn iri(s: &str) -> NamedNode {
        NamedNode::new(s).unwrap()
    }

    fn var(s: &str) -> Variable {
        Variable::new(s).unwrap()
    }

    #[test]
    fn mask_counts_constants() {
        let pattern = QuadPattern {
            subject: TermPattern::Variable(var("s")),
            predicate: NamedNodePattern::NamedNode(iri("http://example.com/p")),
            object: TermPattern::Literal(Literal::from("x")),
            graph_name: GraphNamePattern::DefaultGraph,
        };
        assert_eq!(
            pattern_mask(&pattern),
            COMPONENT_PREDICATE | COMPONENT_OBJECT | COMPONENT_GRAPH
        );
    }

    #[test]
    fn ground_quad_requires_all_constants() {
        let pattern = QuadPattern {
            subject: TermPattern::NamedNode(iri("http://example.com/s")),
            predicate: NamedNodePattern::NamedNode(iri("http://example.com/p")),
            object: TermPattern::Literal(Literal::from("x")),
            graph_name: GraphNamePattern::DefaultGraph,
        };
        let quad = ground_quad(&pattern).unwrap();
        assert_eq!(quad.predicate, iri("http://example.com/p"));
        assert_eq!(quad.graph_name, GraphName::DefaultGraph);

        let open = QuadPattern {
            subject: TermPattern::Variable(var("s")),
            ..pattern
        };
        assert!(ground_quad(&open).is_none());
    }

    #[test]
    fn validation_rejects_literal_subjects() {
        let pattern = QuadPattern {
            subject: TermPattern::Literal(Literal::from("42")),
            predicate: NamedNodePattern::NamedNode(iri("http://example.com/p")),
            object: TermPattern::Variable(var("o")),
            graph_name: GraphNamePattern::DefaultGraph,
        };
        assert!(matches!(
            validate_pattern(&pattern),
            Err(PatternError::LiteralSubject(_))
        ));
    }

    #[test]
    fn component_resolution() {
        assert_eq!(
            StatementComponent::from_variable_name("o"),
            Some(StatementComponent::Object)
        );
        assert_eq!(StatementComponent::from_variable_name("x"), None);
    }
}
