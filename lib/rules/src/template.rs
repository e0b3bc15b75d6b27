use crate::matcher::NormalizeValue;
use crate::RuleError;
use quadflow_model::{
    quad_component, term_as_graph_name, term_as_predicate, term_as_subject, GraphName,
    GraphNamePattern, NamedNodePattern, PatternError, Quad, QuadPattern, QuadRef,
    StatementComponent, Term, TermPattern, TermRef, ValueNormalizer, Variable,
};

/// One position of a derived quad: either a constant or a component copied from the matched
/// quad.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    Constant(Term),
    ConstantGraph(GraphName),
    Component(StatementComponent),
}

impl Slot {
    fn normalize(&self, normalizer: &ValueNormalizer) -> Self {
        match self {
            Self::Constant(t) => Self::Constant(normalizer.normalize_term(t)),
            Self::ConstantGraph(g) => Self::ConstantGraph(normalizer.normalize_graph_name(g)),
            Self::Component(c) => Self::Component(*c),
        }
    }
}

/// Derives quads from matched quads, for rules whose WHERE part is a single pattern.
///
/// A template is compiled from an INSERT pattern by resolving each head variable against the
/// rule's body pattern: a variable occurring in the body denotes the body component it is
/// bound to, and in rules without a body the canonical names `?s` `?p` `?o` `?c` denote the
/// components of the processed quad directly.
///
/// [`apply`](Self::apply) checks term kinds on every instantiation: a derivation that would
/// place a literal in a subject position (or anything but an IRI in a predicate position) is
/// silently discarded rather than reported, since other bindings of the same rule may still be
/// valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementTemplate {
    subject: Slot,
    predicate: Slot,
    object: Slot,
    graph: Slot,
}

/// Resolves a head variable to the component of `body` binding it, or to its canonical
/// positional name when no body is given.
fn resolve_variable(
    variable: &Variable,
    body: Option<&QuadPattern>,
) -> Result<StatementComponent, PatternError> {
    if let Some(body) = body {
        if matches!(&body.subject, TermPattern::Variable(v) if v == variable) {
            return Ok(StatementComponent::Subject);
        }
        if matches!(&body.predicate, NamedNodePattern::Variable(v) if v == variable) {
            return Ok(StatementComponent::Predicate);
        }
        if matches!(&body.object, TermPattern::Variable(v) if v == variable) {
            return Ok(StatementComponent::Object);
        }
        if matches!(&body.graph_name, GraphNamePattern::Variable(v) if v == variable) {
            return Ok(StatementComponent::Graph);
        }
    }
    StatementComponent::from_variable_name(variable.as_str())
        .ok_or_else(|| PatternError::UnresolvedVariable(variable.clone()))
}

impl StatementTemplate {
    /// Compiles the INSERT pattern `head` against the optional single body pattern.
    pub fn new(head: &QuadPattern, body: Option<&QuadPattern>) -> Result<Self, RuleError> {
        let slot_for = |variable: &Variable| -> Result<Slot, PatternError> {
            Ok(Slot::Component(resolve_variable(variable, body)?))
        };
        Ok(Self {
            subject: match &head.subject {
                TermPattern::NamedNode(n) => Slot::Constant(n.clone().into()),
                TermPattern::BlankNode(b) => Slot::Constant(Term::BlankNode(b.clone())),
                TermPattern::Literal(l) => Slot::Constant(l.clone().into()),
                TermPattern::Variable(v) => slot_for(v)?,
            },
            predicate: match &head.predicate {
                NamedNodePattern::NamedNode(n) => Slot::Constant(n.clone().into()),
                NamedNodePattern::Variable(v) => slot_for(v)?,
            },
            object: match &head.object {
                TermPattern::NamedNode(n) => Slot::Constant(n.clone().into()),
                TermPattern::BlankNode(b) => Slot::Constant(Term::BlankNode(b.clone())),
                TermPattern::Literal(l) => Slot::Constant(l.clone().into()),
                TermPattern::Variable(v) => slot_for(v)?,
            },
            graph: match &head.graph_name {
                GraphNamePattern::NamedNode(n) => {
                    Slot::ConstantGraph(GraphName::NamedNode(n.clone()))
                }
                GraphNamePattern::DefaultGraph => Slot::ConstantGraph(GraphName::DefaultGraph),
                GraphNamePattern::Variable(v) => slot_for(v)?,
            },
        })
    }

    /// Instantiates the template against `quad`, or `None` if the derivation is not a
    /// well-formed quad.
    pub fn apply(&self, quad: QuadRef<'_>) -> Option<Quad> {
        let term_at = |slot: &Slot| -> Option<Term> {
            match slot {
                Slot::Constant(t) => Some(t.clone()),
                Slot::ConstantGraph(_) => None,
                Slot::Component(c) => quad_component(quad, *c).map(TermRef::into_owned),
            }
        };
        let subject = term_at(&self.subject).and_then(|t| term_as_subject(&t))?;
        let predicate = term_at(&self.predicate).and_then(|t| term_as_predicate(&t))?;
        let object = term_at(&self.object)?;
        let graph_name = match &self.graph {
            Slot::ConstantGraph(g) => g.clone(),
            Slot::Constant(t) => term_as_graph_name(t)?,
            Slot::Component(StatementComponent::Graph) => quad.graph_name.into_owned(),
            Slot::Component(c) => {
                term_as_graph_name(&quad_component(quad, *c)?.into_owned())?
            }
        };
        Some(Quad {
            subject,
            predicate,
            object,
            graph_name,
        })
    }
}

impl NormalizeValue for StatementTemplate {
    fn normalize_value(&self, normalizer: &ValueNormalizer) -> Self {
        Self {
            subject: self.subject.normalize(normalizer),
            predicate: self.predicate.normalize(normalizer),
            object: self.object.normalize(normalizer),
            graph: self.graph.normalize(normalizer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quadflow_model::{GraphName, Literal, NamedNode};

    fn iri(s: &str) -> NamedNode {
        NamedNode::new(format!("http://example.com/{s}")).unwrap()
    }

    fn var(s: &str) -> Variable {
        Variable::new(s).unwrap()
    }

    fn quad(s: &str, p: &str, o: &str) -> Quad {
        Quad {
            subject: iri(s).into(),
            predicate: iri(p),
            object: iri(o).into(),
            graph_name: GraphName::DefaultGraph,
        }
    }

    fn body() -> QuadPattern {
        QuadPattern {
            subject: TermPattern::Variable(var("x")),
            predicate: NamedNodePattern::Variable(var("q")),
            object: TermPattern::Variable(var("y")),
            graph_name: GraphNamePattern::Variable(var("g")),
        }
    }

    #[test]
    fn copies_components_from_the_body_pattern() {
        // (?y p ?x) <- (?x ?q ?y)
        let head = QuadPattern {
            subject: TermPattern::Variable(var("y")),
            predicate: NamedNodePattern::NamedNode(iri("p")),
            object: TermPattern::Variable(var("x")),
            graph_name: GraphNamePattern::Variable(var("g")),
        };
        let template = StatementTemplate::new(&head, Some(&body())).unwrap();
        let derived = template.apply(quad("a", "q", "b").as_ref()).unwrap();
        assert_eq!(derived, quad("b", "p", "a"));
    }

    #[test]
    fn canonical_names_address_the_processed_quad() {
        let head = QuadPattern {
            subject: TermPattern::Variable(var("o")),
            predicate: NamedNodePattern::Variable(var("p")),
            object: TermPattern::Variable(var("s")),
            graph_name: GraphNamePattern::Variable(var("c")),
        };
        let template = StatementTemplate::new(&head, None).unwrap();
        let derived = template.apply(quad("a", "p1", "b").as_ref()).unwrap();
        assert_eq!(derived, quad("b", "p1", "a"));
    }

    #[test]
    fn unresolved_head_variable_is_an_error() {
        let head = QuadPattern {
            subject: TermPattern::Variable(var("nowhere")),
            predicate: NamedNodePattern::NamedNode(iri("p")),
            object: TermPattern::Variable(var("x")),
            graph_name: GraphNamePattern::DefaultGraph,
        };
        assert!(StatementTemplate::new(&head, Some(&body())).is_err());
    }

    #[test]
    fn malformed_derivations_are_discarded() {
        // Copying a literal object into the subject position cannot produce a quad.
        let head = QuadPattern {
            subject: TermPattern::Variable(var("y")),
            predicate: NamedNodePattern::NamedNode(iri("p")),
            object: TermPattern::Variable(var("x")),
            graph_name: GraphNamePattern::DefaultGraph,
        };
        let template = StatementTemplate::new(&head, Some(&body())).unwrap();
        let input = Quad {
            object: Literal::from("text").into(),
            ..quad("a", "q", "b")
        };
        assert!(template.apply(input.as_ref()).is_none());
    }

    #[test]
    fn graph_position_round_trips() {
        let head = QuadPattern {
            subject: TermPattern::Variable(var("x")),
            predicate: NamedNodePattern::NamedNode(iri("p")),
            object: TermPattern::Variable(var("y")),
            graph_name: GraphNamePattern::Variable(var("g")),
        };
        let template = StatementTemplate::new(&head, Some(&body())).unwrap();
        let mut input = quad("a", "q", "b");
        input.graph_name = iri("g1").into();
        let derived = template.apply(input.as_ref()).unwrap();
        assert_eq!(derived.graph_name, GraphName::from(iri("g1")));

        // The default graph is copied through as the default graph.
        let derived = template.apply(quad("a", "q", "b").as_ref()).unwrap();
        assert_eq!(derived.graph_name, GraphName::DefaultGraph);
    }
}
