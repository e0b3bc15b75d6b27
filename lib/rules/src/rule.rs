use quadflow_common::{QuadCollection, QuadHandler, StorageError};
use quadflow_model::{
    pattern_mask, pattern_variables, term_as_graph_name, term_as_predicate, term_as_subject,
    validate_pattern, GraphName, GraphNameRef, GraphNamePattern, NamedNode, NamedNodePattern,
    PatternError, Quad, QuadPattern, QuadRef, Subject, SubjectRef, Term, TermPattern, TermRef,
    Variable,
};
use quadflow_storage::DeltaModel;
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use std::cmp::Ordering;
use std::fmt;
use std::time::Instant;

use crate::RuleError;

/// A value a WHERE variable can be bound to. The default graph is a bindable value of the
/// graph position without a term representation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BindingValue {
    Term(Term),
    DefaultGraph,
}

pub(crate) type Bindings = FxHashMap<Variable, BindingValue>;

/// An operand of a [`BodyFilter`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FilterOperand {
    Variable(Variable),
    Constant(Term),
}

/// A condition restricting the bindings produced by a rule body.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BodyFilter {
    Equal(FilterOperand, FilterOperand),
    NotEqual(FilterOperand, FilterOperand),
}

enum OperandView<'a> {
    Term(&'a Term),
    DefaultGraph,
}

impl PartialEq for OperandView<'_> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Term(a), Self::Term(b)) => a == b,
            (Self::DefaultGraph, Self::DefaultGraph) => true,
            _ => false,
        }
    }
}

impl FilterOperand {
    fn resolve<'a>(&'a self, bindings: &'a Bindings) -> Option<OperandView<'a>> {
        match self {
            Self::Constant(t) => Some(OperandView::Term(t)),
            Self::Variable(v) => bindings.get(v).map(|b| match b {
                BindingValue::Term(t) => OperandView::Term(t),
                BindingValue::DefaultGraph => OperandView::DefaultGraph,
            }),
        }
    }

    fn variable(&self) -> Option<&Variable> {
        match self {
            Self::Variable(v) => Some(v),
            Self::Constant(_) => None,
        }
    }
}

impl BodyFilter {
    fn operands(&self) -> (&FilterOperand, &FilterOperand) {
        match self {
            Self::Equal(a, b) | Self::NotEqual(a, b) => (a, b),
        }
    }

    /// True if every variable operand is bound.
    fn is_ready(&self, bindings: &Bindings) -> bool {
        let (a, b) = self.operands();
        [a, b].into_iter().all(|op| {
            op.variable().is_none_or(|v| bindings.contains_key(v))
        })
    }

    fn test(&self, bindings: &Bindings) -> bool {
        let (a, b) = self.operands();
        let (Some(a), Some(b)) = (a.resolve(bindings), b.resolve(bindings)) else {
            return false;
        };
        match self {
            Self::Equal(..) => a == b,
            Self::NotEqual(..) => a != b,
        }
    }

    pub(crate) fn variables(&self) -> impl Iterator<Item = &Variable> {
        let (a, b) = self.operands();
        a.variable().into_iter().chain(b.variable())
    }
}

/// The WHERE part of a rule: a conjunction of quad patterns plus filters over their variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleBody {
    pub patterns: Vec<QuadPattern>,
    pub filters: Vec<BodyFilter>,
}

impl RuleBody {
    pub fn new(patterns: Vec<QuadPattern>) -> Self {
        Self {
            patterns,
            filters: Vec::new(),
        }
    }

    pub fn with_filters(patterns: Vec<QuadPattern>, filters: Vec<BodyFilter>) -> Self {
        Self { patterns, filters }
    }

    fn variables(&self) -> FxHashSet<&Variable> {
        let mut vars = FxHashSet::default();
        for pattern in &self.patterns {
            pattern_variables(pattern, &mut vars);
        }
        vars
    }
}

/// A DELETE/INSERT/WHERE rule.
///
/// Rules are immutable; their classification (safety, streamability, specificity) is computed
/// at construction. Rules order by `(phase, fixpoint, id)`, which is the evaluation order a
/// ruleset imposes.
#[derive(Debug, Clone)]
pub struct Rule {
    id: NamedNode,
    fixpoint: bool,
    phase: i32,
    delete: Vec<QuadPattern>,
    insert: Vec<QuadPattern>,
    body: Option<RuleBody>,
    unbound_head_variable: Option<Variable>,
    streamable: bool,
    specific: bool,
}

impl Rule {
    /// Creates a rule, validating that its patterns are usable (no blank nodes, no literal
    /// subjects) and that every filter variable is bound by a WHERE pattern.
    ///
    /// Unsafe rules can be created and inspected; they are rejected when a
    /// [`Ruleset`](crate::Ruleset) is assembled.
    pub fn new(
        id: NamedNode,
        phase: i32,
        fixpoint: bool,
        delete: Vec<QuadPattern>,
        insert: Vec<QuadPattern>,
        body: Option<RuleBody>,
    ) -> Result<Self, RuleError> {
        let body = body.filter(|b| !(b.patterns.is_empty() && b.filters.is_empty()));
        for pattern in delete
            .iter()
            .chain(insert.iter())
            .chain(body.iter().flat_map(|b| b.patterns.iter()))
        {
            validate_pattern(pattern).map_err(|source| RuleError::MalformedRule {
                rule: id.clone(),
                source,
            })?;
        }

        let body_vars = body.as_ref().map(RuleBody::variables).unwrap_or_default();
        // A filter over a variable no pattern binds could never become ready and would be
        // skipped silently during the join.
        if let Some(variable) = body
            .iter()
            .flat_map(|b| b.filters.iter())
            .flat_map(BodyFilter::variables)
            .find(|v| !body_vars.contains(v))
        {
            return Err(RuleError::MalformedRule {
                rule: id,
                source: PatternError::UnresolvedVariable(variable.clone()),
            });
        }

        let mut head_vars = FxHashSet::default();
        for pattern in delete.iter().chain(insert.iter()) {
            pattern_variables(pattern, &mut head_vars);
        }
        let unbound_head_variable = head_vars
            .iter()
            .find(|v| !body_vars.contains(*v))
            .map(|v| (*v).clone());

        let streamable = unbound_head_variable.is_none()
            && match &body {
                None => delete.is_empty(),
                Some(b) if b.patterns.len() == 1 => {
                    let mut pattern_vars = FxHashSet::default();
                    pattern_variables(&b.patterns[0], &mut pattern_vars);
                    (delete.is_empty() || delete.iter().all(|p| *p == b.patterns[0]))
                        && b.filters
                            .iter()
                            .flat_map(BodyFilter::variables)
                            .all(|v| pattern_vars.contains(v))
                }
                Some(_) => false,
            };
        let specific = body
            .iter()
            .flat_map(|b| b.patterns.iter())
            .all(|p| pattern_mask(p) != 0);

        Ok(Self {
            id,
            fixpoint,
            phase,
            delete,
            insert,
            body,
            unbound_head_variable,
            streamable,
            specific,
        })
    }

    pub fn id(&self) -> &NamedNode {
        &self.id
    }

    pub fn phase(&self) -> i32 {
        self.phase
    }

    pub fn fixpoint(&self) -> bool {
        self.fixpoint
    }

    pub fn delete(&self) -> &[QuadPattern] {
        &self.delete
    }

    pub fn insert(&self) -> &[QuadPattern] {
        &self.insert
    }

    pub fn body(&self) -> Option<&RuleBody> {
        self.body.as_ref()
    }

    /// True if every head variable is bound by the WHERE part, so evaluation can ground every
    /// derivation.
    pub fn is_safe(&self) -> bool {
        self.unbound_head_variable.is_none()
    }

    pub(crate) fn unbound_head_variable(&self) -> Option<&Variable> {
        self.unbound_head_variable.as_ref()
    }

    /// True if the rule can be applied to one quad at a time: its WHERE part is at most a
    /// single pattern whose variables cover all filter operands, and its DELETE part, if any,
    /// retracts exactly the matched quad.
    pub fn is_streamable(&self) -> bool {
        self.streamable
    }

    /// True if no WHERE pattern is an unconstrained wildcard, meaning the rule only reacts to
    /// specific quads.
    pub fn is_specific(&self) -> bool {
        self.specific
    }
}

impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Rule {}

impl PartialOrd for Rule {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Rule {
    fn cmp(&self, other: &Self) -> Ordering {
        self.phase
            .cmp(&other.phase)
            .then_with(|| self.fixpoint.cmp(&other.fixpoint))
            .then_with(|| self.id.as_str().cmp(other.id.as_str()))
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (phase {}", self.id, self.phase)?;
        if self.fixpoint {
            write!(f, ", fixpoint")?;
        }
        write!(f, ")")?;
        if !self.delete.is_empty() {
            write!(f, " DELETE")?;
            for p in &self.delete {
                write!(f, " {{{p}}}")?;
            }
        }
        if !self.insert.is_empty() {
            write!(f, " INSERT")?;
            for p in &self.insert {
                write!(f, " {{{p}}}")?;
            }
        }
        if let Some(body) = &self.body {
            write!(f, " WHERE")?;
            for p in &body.patterns {
                write!(f, " {{{p}}}")?;
            }
        }
        Ok(())
    }
}

/// Grounds `pattern` under `bindings`, or `None` if a bound value cannot occupy its position.
pub(crate) fn instantiate(pattern: &QuadPattern, bindings: &Bindings) -> Option<Quad> {
    let term_binding = |v: &Variable| -> Option<Term> {
        match bindings.get(v)? {
            BindingValue::Term(t) => Some(t.clone()),
            BindingValue::DefaultGraph => None,
        }
    };
    let subject = match &pattern.subject {
        TermPattern::NamedNode(n) => Subject::from(n.clone()),
        TermPattern::Variable(v) => term_as_subject(&term_binding(v)?)?,
        TermPattern::BlankNode(_) | TermPattern::Literal(_) => return None,
    };
    let predicate = match &pattern.predicate {
        NamedNodePattern::NamedNode(n) => n.clone(),
        NamedNodePattern::Variable(v) => term_as_predicate(&term_binding(v)?)?,
    };
    let object = match &pattern.object {
        TermPattern::NamedNode(n) => Term::from(n.clone()),
        TermPattern::Literal(l) => Term::from(l.clone()),
        TermPattern::Variable(v) => term_binding(v)?,
        TermPattern::BlankNode(_) => return None,
    };
    let graph_name = match &pattern.graph_name {
        GraphNamePattern::NamedNode(n) => GraphName::from(n.clone()),
        GraphNamePattern::DefaultGraph => GraphName::DefaultGraph,
        GraphNamePattern::Variable(v) => match bindings.get(v)? {
            BindingValue::Term(t) => term_as_graph_name(t)?,
            BindingValue::DefaultGraph => GraphName::DefaultGraph,
        },
    };
    Some(Quad {
        subject,
        predicate,
        object,
        graph_name,
    })
}

/// The constant components a pattern exposes under the current bindings, ready to be passed to
/// [`QuadCollection::matching`]. `None` for the whole tuple means a bound value cannot occupy
/// its position, so the pattern matches nothing.
struct ResolvedParts {
    subject: Option<Subject>,
    predicate: Option<NamedNode>,
    object: Option<Term>,
    graph: Option<GraphName>,
}

impl ResolvedParts {
    fn subject_ref(&self) -> Option<SubjectRef<'_>> {
        self.subject.as_ref().map(Subject::as_ref)
    }

    fn predicate_ref(&self) -> Option<quadflow_model::NamedNodeRef<'_>> {
        self.predicate.as_ref().map(NamedNode::as_ref)
    }

    fn object_ref(&self) -> Option<TermRef<'_>> {
        self.object.as_ref().map(Term::as_ref)
    }

    fn graph_ref(&self) -> Option<GraphNameRef<'_>> {
        self.graph.as_ref().map(GraphName::as_ref)
    }
}

fn resolve_parts(pattern: &QuadPattern, bindings: &Bindings) -> Option<ResolvedParts> {
    let subject = match &pattern.subject {
        TermPattern::NamedNode(n) => Some(Subject::from(n.clone())),
        TermPattern::BlankNode(b) => Some(Subject::from(b.clone())),
        TermPattern::Literal(_) => return None,
        TermPattern::Variable(v) => match bindings.get(v) {
            Some(BindingValue::Term(t)) => Some(term_as_subject(t)?),
            Some(BindingValue::DefaultGraph) => return None,
            None => None,
        },
    };
    let predicate = match &pattern.predicate {
        NamedNodePattern::NamedNode(n) => Some(n.clone()),
        NamedNodePattern::Variable(v) => match bindings.get(v) {
            Some(BindingValue::Term(t)) => Some(term_as_predicate(t)?),
            Some(BindingValue::DefaultGraph) => return None,
            None => None,
        },
    };
    let object = match &pattern.object {
        TermPattern::NamedNode(n) => Some(Term::from(n.clone())),
        TermPattern::BlankNode(b) => Some(Term::BlankNode(b.clone())),
        TermPattern::Literal(l) => Some(Term::from(l.clone())),
        TermPattern::Variable(v) => match bindings.get(v) {
            Some(BindingValue::Term(t)) => Some(t.clone()),
            Some(BindingValue::DefaultGraph) => return None,
            None => None,
        },
    };
    let graph = match &pattern.graph_name {
        GraphNamePattern::NamedNode(n) => Some(GraphName::from(n.clone())),
        GraphNamePattern::DefaultGraph => Some(GraphName::DefaultGraph),
        GraphNamePattern::Variable(v) => match bindings.get(v) {
            Some(BindingValue::Term(t)) => Some(term_as_graph_name(t)?),
            Some(BindingValue::DefaultGraph) => Some(GraphName::DefaultGraph),
            None => None,
        },
    };
    Some(ResolvedParts {
        subject,
        predicate,
        object,
        graph,
    })
}

fn pattern_estimate(
    source: &dyn QuadCollection,
    pattern: &QuadPattern,
    bindings: &Bindings,
) -> usize {
    match resolve_parts(pattern, bindings) {
        None => 0,
        Some(parts) => source.estimate(
            parts.subject_ref(),
            parts.predicate_ref(),
            parts.object_ref(),
            parts.graph_ref(),
        ),
    }
}

/// Extends `bindings` so that `pattern` matches `quad`, returning the newly bound variables.
/// `None` (with `bindings` unchanged) if the quad is inconsistent with the pattern, which only
/// happens through repeated or already bound variables since constants were pushed into the
/// scan.
fn unify(pattern: &QuadPattern, quad: QuadRef<'_>, bindings: &mut Bindings) -> Option<Vec<Variable>> {
    let mut fresh: Vec<(Variable, BindingValue)> = Vec::new();
    {
        let mut bind = |variable: &Variable, value: BindingValue| -> bool {
            if let Some(existing) = bindings.get(variable) {
                return *existing == value;
            }
            if let Some((_, existing)) = fresh.iter().find(|(v, _)| v == variable) {
                return *existing == value;
            }
            fresh.push((variable.clone(), value));
            true
        };
        if let TermPattern::Variable(v) = &pattern.subject {
            let value = BindingValue::Term(match quad.subject {
                SubjectRef::NamedNode(n) => n.into_owned().into(),
                SubjectRef::BlankNode(b) => Term::BlankNode(b.into_owned()),
            });
            if !bind(v, value) {
                return None;
            }
        }
        if let NamedNodePattern::Variable(v) = &pattern.predicate {
            if !bind(v, BindingValue::Term(quad.predicate.into_owned().into())) {
                return None;
            }
        }
        if let TermPattern::Variable(v) = &pattern.object {
            if !bind(v, BindingValue::Term(quad.object.into_owned())) {
                return None;
            }
        }
        if let GraphNamePattern::Variable(v) = &pattern.graph_name {
            let value = match quad.graph_name {
                GraphNameRef::NamedNode(n) => BindingValue::Term(n.into_owned().into()),
                GraphNameRef::BlankNode(b) => BindingValue::Term(Term::BlankNode(b.into_owned())),
                GraphNameRef::DefaultGraph => BindingValue::DefaultGraph,
            };
            if !bind(v, value) {
                return None;
            }
        }
    }
    let mut vars = Vec::with_capacity(fresh.len());
    for (variable, value) in fresh {
        bindings.insert(variable.clone(), value);
        vars.push(variable);
    }
    Some(vars)
}

/// Evaluates the conjunction of `body` patterns by a greedy cardinality-ordered nested-loop
/// join, invoking `on_binding` for every solution. When `delta` is given, the pattern at the
/// given index scans the delta instead of the model, which yields exactly the solutions that
/// use at least that delta quad.
pub(crate) fn evaluate_body(
    body: &RuleBody,
    model: &dyn QuadCollection,
    delta: Option<(&DeltaModel, usize)>,
    on_binding: &mut dyn FnMut(&Bindings) -> Result<(), StorageError>,
) -> Result<(), StorageError> {
    let mut bindings = Bindings::default();
    let mut used = vec![false; body.patterns.len()];
    join_step(body, model, delta, &mut used, &mut bindings, on_binding)
}

fn source_for<'a>(
    model: &'a dyn QuadCollection,
    delta: Option<(&'a DeltaModel, usize)>,
    index: usize,
) -> &'a dyn QuadCollection {
    match delta {
        Some((delta, delta_index)) if delta_index == index => delta.model(),
        _ => model,
    }
}

fn join_step(
    body: &RuleBody,
    model: &dyn QuadCollection,
    delta: Option<(&DeltaModel, usize)>,
    used: &mut [bool],
    bindings: &mut Bindings,
    on_binding: &mut dyn FnMut(&Bindings) -> Result<(), StorageError>,
) -> Result<(), StorageError> {
    // Filters whose variables are all bound must hold before descending further.
    for filter in &body.filters {
        if filter.is_ready(bindings) && !filter.test(bindings) {
            return Ok(());
        }
    }

    // Greedily pick the cheapest remaining pattern under the current bindings.
    let mut next: Option<(usize, usize)> = None;
    for (index, pattern) in body.patterns.iter().enumerate() {
        if used[index] {
            continue;
        }
        let estimate = pattern_estimate(source_for(model, delta, index), pattern, bindings);
        if next.is_none_or(|(_, best)| estimate < best) {
            next = Some((index, estimate));
        }
    }
    let Some((index, _)) = next else {
        return on_binding(bindings);
    };

    let pattern = &body.patterns[index];
    let source = source_for(model, delta, index);
    let Some(parts) = resolve_parts(pattern, bindings) else {
        return Ok(());
    };
    // The scan borrows from `parts` and `source`; collect candidate quads before recursing so
    // the mutable traversal state is free again.
    let candidates: Vec<Quad> = source
        .matching(
            parts.subject_ref(),
            parts.predicate_ref(),
            parts.object_ref(),
            parts.graph_ref(),
        )
        .map(QuadRef::into_owned)
        .collect();
    used[index] = true;
    for quad in candidates {
        if let Some(fresh) = unify(pattern, quad.as_ref(), bindings) {
            join_step(body, model, delta, used, bindings, on_binding)?;
            for variable in fresh {
                bindings.remove(&variable);
            }
        }
    }
    used[index] = false;
    Ok(())
}

/// One unit of parallel rule evaluation: a rule, optionally restricted to solutions matching
/// the delta through one specific WHERE pattern.
struct Evaluation<'a> {
    rule: &'a Rule,
    delta_index: Option<usize>,
    cardinality: usize,
}

impl Evaluation<'_> {
    fn run(
        &self,
        model: &dyn QuadCollection,
        delta: Option<&DeltaModel>,
        delete_sink: Option<&SinkFactory<'_>>,
        insert_sink: Option<&SinkFactory<'_>>,
    ) -> Result<(), StorageError> {
        let rule = self.rule;
        let mut delete_handler = match delete_sink {
            Some(factory) if !rule.delete().is_empty() => Some(factory()),
            _ => None,
        };
        let mut insert_handler = match insert_sink {
            Some(factory) if !rule.insert().is_empty() => Some(factory()),
            _ => None,
        };
        if delete_handler.is_none() && insert_handler.is_none() {
            return Ok(());
        }

        let mut emit = |bindings: &Bindings| -> Result<(), StorageError> {
            if let Some(handler) = delete_handler.as_mut() {
                for pattern in rule.delete() {
                    if let Some(quad) = instantiate(pattern, bindings) {
                        handler.handle(quad)?;
                    }
                }
            }
            if let Some(handler) = insert_handler.as_mut() {
                for pattern in rule.insert() {
                    if let Some(quad) = instantiate(pattern, bindings) {
                        handler.handle(quad)?;
                    }
                }
            }
            Ok(())
        };

        match rule.body() {
            None => emit(&Bindings::default())?,
            Some(body) => {
                let delta = delta.and_then(|d| self.delta_index.map(|i| (d, i)));
                evaluate_body(body, model, delta, &mut emit)?;
            }
        }

        if let Some(mut handler) = delete_handler {
            handler.finish()?;
        }
        if let Some(mut handler) = insert_handler {
            handler.finish()?;
        }
        Ok(())
    }
}

pub(crate) type SinkFactory<'a> = dyn Fn() -> Box<dyn QuadHandler + 'a> + Sync + 'a;

/// Evaluates `rules` against `model` in parallel, one task per rule, or one task per rule and
/// WHERE pattern when a `delta` restricts the evaluation to new solutions. Tasks run on the
/// rayon pool, largest estimated cardinality first; sink factories are invoked once per task
/// needing them, so sinks only need to be thread-safe at their shared backing store.
pub(crate) fn evaluate_rules<'a>(
    rules: &[Rule],
    model: &dyn QuadCollection,
    delta: Option<&DeltaModel>,
    delete_sink: Option<&SinkFactory<'a>>,
    insert_sink: Option<&SinkFactory<'a>>,
) -> Result<(), RuleError> {
    let started = Instant::now();
    let mut tasks = Vec::new();
    for rule in rules {
        match (delta, rule.body()) {
            (None, None) => tasks.push(Evaluation {
                rule,
                delta_index: None,
                cardinality: 1,
            }),
            (None, Some(body)) => {
                if let Some(cardinality) = join_cardinality(body, model, None) {
                    tasks.push(Evaluation {
                        rule,
                        delta_index: None,
                        cardinality,
                    });
                }
            }
            // A rule without a WHERE part cannot produce new solutions from a delta.
            (Some(_), None) => {}
            (Some(delta), Some(body)) => {
                for index in 0..body.patterns.len() {
                    if !delta.may_match(&body.patterns[index]) {
                        continue;
                    }
                    if let Some(cardinality) = join_cardinality(body, model, Some((delta, index)))
                    {
                        tasks.push(Evaluation {
                            rule,
                            delta_index: Some(index),
                            cardinality,
                        });
                    }
                }
            }
        }
    }
    tasks.sort_by(|a, b| b.cardinality.cmp(&a.cardinality));

    let total = tasks.len();
    tasks
        .par_iter()
        .try_for_each(|task| task.run(model, delta, delete_sink, insert_sink))?;
    tracing::debug!(
        rules = rules.len(),
        tasks = total,
        elapsed = ?started.elapsed(),
        "rule evaluation round done"
    );
    Ok(())
}

/// Estimated number of scanned tuples for the join, or `None` if some pattern is guaranteed
/// not to match so the whole task can be skipped.
fn join_cardinality(
    body: &RuleBody,
    model: &dyn QuadCollection,
    delta: Option<(&DeltaModel, usize)>,
) -> Option<usize> {
    let bindings = Bindings::default();
    let mut cardinality: usize = 1;
    for (index, pattern) in body.patterns.iter().enumerate() {
        let estimate = pattern_estimate(source_for(model, delta, index), pattern, &bindings);
        if estimate == 0 {
            return None;
        }
        cardinality = cardinality.saturating_mul(estimate);
    }
    Some(cardinality)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quadflow_storage::MemoryQuadModel;
    use quadflow_model::ValueNormalizer;

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

    fn pattern(s: &str, p: &str, o: &str) -> QuadPattern {
        let term = |t: &str| -> TermPattern {
            if let Some(name) = t.strip_prefix('?') {
                TermPattern::Variable(var(name))
            } else {
                TermPattern::NamedNode(iri(t))
            }
        };
        QuadPattern {
            subject: term(s),
            predicate: if let Some(name) = p.strip_prefix('?') {
                NamedNodePattern::Variable(var(name))
            } else {
                NamedNodePattern::NamedNode(iri(p))
            },
            object: term(o),
            graph_name: GraphNamePattern::Variable(var("g")),
        }
    }

    fn rule(id: &str, phase: i32, fixpoint: bool) -> Rule {
        Rule::new(
            iri(id),
            phase,
            fixpoint,
            vec![],
            vec![pattern("?x", "p", "?y")],
            Some(RuleBody::new(vec![pattern("?x", "q", "?y")])),
        )
        .unwrap()
    }

    #[test]
    fn classification() {
        let streamable = rule("r1", 0, true);
        assert!(streamable.is_safe());
        assert!(streamable.is_streamable());
        assert!(streamable.is_specific());

        let join = Rule::new(
            iri("r2"),
            0,
            true,
            vec![],
            vec![pattern("?x", "p", "?z")],
            Some(RuleBody::new(vec![
                pattern("?x", "p", "?y"),
                pattern("?y", "p", "?z"),
            ])),
        )
        .unwrap();
        assert!(join.is_safe());
        assert!(!join.is_streamable());

        let unsafe_rule = Rule::new(
            iri("r3"),
            0,
            true,
            vec![],
            vec![pattern("?x", "p", "?nowhere")],
            Some(RuleBody::new(vec![pattern("?x", "q", "?y")])),
        )
        .unwrap();
        assert!(!unsafe_rule.is_safe());

        let wildcard_body = Rule::new(
            iri("r4"),
            0,
            true,
            vec![],
            vec![pattern("?x", "p", "?y")],
            Some(RuleBody::new(vec![pattern("?x", "?v", "?y")])),
        )
        .unwrap();
        assert!(!wildcard_body.is_specific());

        let delete_matched = Rule::new(
            iri("r5"),
            0,
            false,
            vec![pattern("?x", "q", "?y")],
            vec![pattern("?x", "p", "?y")],
            Some(RuleBody::new(vec![pattern("?x", "q", "?y")])),
        )
        .unwrap();
        assert!(delete_matched.is_streamable());

        let delete_other = Rule::new(
            iri("r6"),
            0,
            false,
            vec![pattern("?y", "q", "?x")],
            vec![],
            Some(RuleBody::new(vec![pattern("?x", "q", "?y")])),
        )
        .unwrap();
        assert!(!delete_other.is_streamable());
    }

    #[test]
    fn rules_order_by_phase_fixpoint_id() {
        let mut rules = vec![rule("b", 1, true), rule("a", 0, true), rule("c", 0, false)];
        rules.sort();
        let ids: Vec<_> = rules.iter().map(|r| r.id().as_str().to_owned()).collect();
        assert_eq!(
            ids,
            vec![
                "http://example.com/c",
                "http://example.com/a",
                "http://example.com/b"
            ]
        );
    }

    #[test]
    fn blank_nodes_are_rejected() {
        let pattern = QuadPattern {
            subject: TermPattern::BlankNode(quadflow_model::BlankNode::default()),
            predicate: NamedNodePattern::NamedNode(iri("p")),
            object: TermPattern::Variable(var("o")),
            graph_name: GraphNamePattern::DefaultGraph,
        };
        let result = Rule::new(iri("r"), 0, true, vec![], vec![pattern], None);
        assert!(matches!(result, Err(RuleError::MalformedRule { .. })));
    }

    #[test]
    fn literal_subjects_are_rejected() {
        // WHERE ("42" p ?o) can never match a quad; accepting it would turn the subject into
        // a wildcard on the streaming path.
        let body = QuadPattern {
            subject: TermPattern::Literal(quadflow_model::Literal::from("42")),
            predicate: NamedNodePattern::NamedNode(iri("p")),
            object: TermPattern::Variable(var("o")),
            graph_name: GraphNamePattern::Variable(var("g")),
        };
        let result = Rule::new(
            iri("r"),
            0,
            true,
            vec![],
            vec![pattern("?o", "q", "?o")],
            Some(RuleBody::new(vec![body])),
        );
        assert!(matches!(result, Err(RuleError::MalformedRule { .. })));
    }

    #[test]
    fn filters_over_unbound_variables_are_rejected() {
        let body = RuleBody::with_filters(
            vec![pattern("?x", "p", "?y")],
            vec![BodyFilter::NotEqual(
                FilterOperand::Variable(var("x")),
                FilterOperand::Variable(var("nowhere")),
            )],
        );
        let result = Rule::new(
            iri("r"),
            0,
            true,
            vec![],
            vec![pattern("?x", "q", "?y")],
            Some(body),
        );
        assert!(matches!(result, Err(RuleError::MalformedRule { .. })));
    }

    #[test]
    fn join_produces_all_solutions() {
        let model: MemoryQuadModel = [
            quad("a", "p", "b"),
            quad("b", "p", "c"),
            quad("c", "p", "d"),
        ]
        .into_iter()
        .collect();
        let body = RuleBody::new(vec![pattern("?x", "p", "?y"), pattern("?y", "p", "?z")]);
        let mut solutions = Vec::new();
        evaluate_body(&body, &model, None, &mut |bindings| {
            let out = pattern("?x", "p", "?z");
            solutions.push(instantiate(&out, bindings).unwrap());
            Ok(())
        })
        .unwrap();
        solutions.sort_by_key(|q| q.to_string());
        assert_eq!(solutions, vec![quad("a", "p", "c"), quad("b", "p", "d")]);
    }

    #[test]
    fn repeated_variables_constrain_the_join() {
        let model: MemoryQuadModel = [quad("a", "p", "a"), quad("a", "p", "b")]
            .into_iter()
            .collect();
        let body = RuleBody::new(vec![pattern("?x", "p", "?x")]);
        let mut solutions = 0;
        evaluate_body(&body, &model, None, &mut |_| {
            solutions += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(solutions, 1);
    }

    #[test]
    fn filters_restrict_solutions() {
        let model: MemoryQuadModel = [quad("a", "p", "a"), quad("a", "p", "b")]
            .into_iter()
            .collect();
        let body = RuleBody::with_filters(
            vec![pattern("?x", "p", "?y")],
            vec![BodyFilter::NotEqual(
                FilterOperand::Variable(var("x")),
                FilterOperand::Variable(var("y")),
            )],
        );
        let mut solutions = Vec::new();
        evaluate_body(&body, &model, None, &mut |bindings| {
            solutions.push(instantiate(&pattern("?x", "p", "?y"), bindings).unwrap());
            Ok(())
        })
        .unwrap();
        assert_eq!(solutions, vec![quad("a", "p", "b")]);
    }

    #[test]
    fn delta_restricts_solutions_to_new_ones() {
        let model: MemoryQuadModel = [
            quad("a", "p", "b"),
            quad("b", "p", "c"),
            quad("c", "p", "d"),
        ]
        .into_iter()
        .collect();
        // Delta holds only (b p c); solutions through pattern 0 must use it as (?x p ?y).
        let delta = DeltaModel::new([quad("b", "p", "c")], ValueNormalizer::new());
        let body = RuleBody::new(vec![pattern("?x", "p", "?y"), pattern("?y", "p", "?z")]);
        let mut solutions = Vec::new();
        evaluate_body(&body, &model, Some((&delta, 0)), &mut |bindings| {
            solutions.push(instantiate(&pattern("?x", "p", "?z"), bindings).unwrap());
            Ok(())
        })
        .unwrap();
        assert_eq!(solutions, vec![quad("b", "p", "d")]);
    }
}
