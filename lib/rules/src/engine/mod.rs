//! Forward-chaining evaluation of a [`Ruleset`] over models and quad streams.

mod naive;
mod seminaive;
mod stream;

use crate::dedup::StatementDeduplicator;
use crate::matcher::{FilterValue, ResidualFilter, StatementMatcher};
use crate::rule::{BodyFilter, FilterOperand, RuleBody};
use crate::template::StatementTemplate;
use crate::{Rule, RuleError, Ruleset, TotalDeduplicator};
use naive::NaivePhase;
use quadflow_common::{QuadCollection, QuadHandler, StorageError};
use quadflow_model::{
    ground_quad, GraphNamePattern, NamedNodePattern, Quad, QuadPattern, QuadRef,
    StatementComponent, TermPattern, ValueNormalizer, Variable,
};
use quadflow_storage::MemoryQuadModel;
use seminaive::SemiNaivePhase;
use std::fmt;
use std::time::Instant;
use stream::StreamPhase;

/// Quads handed to one worker at a time during parallel stream-rule expansion.
pub(crate) const EXPAND_CHUNK: usize = 1024;

/// Evaluates a ruleset, either over an in-memory model or as a stage of a quad handler chain.
///
/// Construction partitions the rules, which a [`Ruleset`] keeps ordered by `(phase, fixpoint,
/// id)`, into maximal runs sharing a phase index and fixpoint flag, and picks the cheapest
/// evaluation strategy each run admits: fully streamable runs are applied one quad at a time,
/// insert-only runs are evaluated semi-naively on accumulated quads, and everything else falls
/// back to naive fixpoint rounds over a model.
pub struct QueryRuleEngine {
    ruleset: Ruleset,
    phases: Vec<Phase>,
    unique: bool,
}

impl QueryRuleEngine {
    pub fn new(ruleset: Ruleset) -> Result<Self, RuleError> {
        let phases = build_phases(&ruleset)?;
        let mut unique = false;
        for phase in &phases {
            unique = phase.handler_output_unique(unique);
        }
        tracing::debug!(
            rules = ruleset.rules().len(),
            phases = phases.len(),
            unique,
            "rule engine configured"
        );
        Ok(Self {
            ruleset,
            phases,
            unique,
        })
    }

    pub fn ruleset(&self) -> &Ruleset {
        &self.ruleset
    }

    /// True if the streaming output is duplicate-free without a final deduplication stage.
    pub fn is_output_unique(&self) -> bool {
        self.unique
    }

    /// Evaluates all phases against `model`, mutating it in place until every phase has run to
    /// completion.
    pub fn evaluate(&self, model: &mut dyn QuadCollection) -> Result<(), RuleError> {
        for phase in &self.phases {
            phase.normalize(&model.normalizer()).eval_model(model)?;
        }
        Ok(())
    }

    /// Returns a handler that applies the ruleset to the quads pushed through it, emitting the
    /// result to `sink` once the stream is finished (or on the fly, for phases that support
    /// it).
    ///
    /// Leading and trailing runs of stream-capable phases are applied one quad at a time;
    /// whatever sits between them is buffered into a model, evaluated when the stream ends,
    /// and emitted from there. With `deduplicate`, the emitted stream is exactly duplicate
    /// free; without it, duplicates are only suppressed opportunistically.
    pub fn handler<'a>(
        &'a self,
        sink: Box<dyn QuadHandler + 'a>,
        deduplicate: bool,
    ) -> Box<dyn QuadHandler + 'a> {
        if self.phases.is_empty() {
            return sink;
        }

        // Phase range [i, j] evaluated on a buffered model: from the first phase that cannot
        // stream up to the last, excluding a trailing run of stream-only phases that can be
        // chained after the model section.
        let mut i = 0;
        while i < self.phases.len() && self.phases[i].handler_supported() {
            i += 1;
        }
        let last = self.phases.len() - 1;
        let mut j = last;
        while j > i && self.phases[j].handler_supported() && !self.phases[j].model_supported() {
            j -= 1;
        }

        let mut result = sink;
        for k in (j + 1..=last).rev() {
            result = self.phases[k].handler(result, deduplicate && !self.unique && k == last);
        }
        if i <= j {
            result = Box::new(ModelSectionHandler {
                phases: &self.phases[i..=j],
                sink: result,
                model: MemoryQuadModel::new(),
            });
        }
        for k in (0..i).rev() {
            result = self.phases[k].handler(result, deduplicate && !self.unique && k == last);
        }
        result
    }
}

impl fmt::Display for QueryRuleEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rule engine (")?;
        for phase in &self.phases {
            let letter = match phase {
                Phase::Stream(_) => 'X',
                Phase::SemiNaive(_) => 'S',
                Phase::Naive(_) => 'N',
            };
            write!(f, "{letter}")?;
        }
        if self.unique {
            write!(f, "*")?;
        }
        write!(f, ")")
    }
}

/// One maximal run of rules sharing a phase index and fixpoint flag, with the strategy chosen
/// for it.
pub(crate) enum Phase {
    Stream(StreamPhase),
    SemiNaive(SemiNaivePhase),
    Naive(NaivePhase),
}

impl Phase {
    /// True if the phase can be applied as a stage of a handler chain.
    fn handler_supported(&self) -> bool {
        match self {
            Self::Stream(_) => true,
            Self::SemiNaive(p) => p.handler_supported(),
            Self::Naive(_) => false,
        }
    }

    /// True if the phase can be evaluated over a buffered model.
    fn model_supported(&self) -> bool {
        !matches!(self, Self::Stream(_))
    }

    /// Whether the handler output is duplicate free, given whether the input was.
    fn handler_output_unique(&self, input_unique: bool) -> bool {
        match self {
            Self::Stream(p) => p.handler_output_unique(input_unique),
            Self::SemiNaive(p) => p.handler_output_unique(),
            Self::Naive(_) => true,
        }
    }

    /// Returns a copy whose constants are canonicalized through `normalizer`, so that model
    /// evaluation compares interned terms.
    fn normalize(&self, normalizer: &ValueNormalizer) -> Self {
        match self {
            Self::Stream(p) => Self::Stream(p.normalize(normalizer)),
            Self::SemiNaive(p) => Self::SemiNaive(p.normalize(normalizer)),
            Self::Naive(p) => Self::Naive(p.clone()),
        }
    }

    fn eval_model(&self, model: &mut dyn QuadCollection) -> Result<(), RuleError> {
        match self {
            Self::Stream(p) => p.eval_model(model),
            Self::SemiNaive(p) => p.eval_model(model),
            Self::Naive(p) => p.eval_model(model),
        }
    }

    fn handler<'a>(
        &'a self,
        sink: Box<dyn QuadHandler + 'a>,
        deduplicate: bool,
    ) -> Box<dyn QuadHandler + 'a> {
        match self {
            Self::Stream(p) => p.handler(sink, deduplicate),
            Self::SemiNaive(p) => p.handler(sink, deduplicate),
            // Scheduling routes phases that cannot stream into the model section.
            Self::Naive(_) => unreachable!("naive phases are not handler-capable"),
        }
    }
}

fn build_phases(ruleset: &Ruleset) -> Result<Vec<Phase>, RuleError> {
    let mut phases = Vec::new();
    let mut run: Vec<Rule> = Vec::new();
    for rule in ruleset.rules() {
        if let Some(first) = run.first() {
            if rule.phase() != first.phase() || rule.fixpoint() != first.fixpoint() {
                phases.push(build_phase(&run)?);
                run.clear();
            }
        }
        run.push(rule.clone());
    }
    if !run.is_empty() {
        phases.push(build_phase(&run)?);
    }
    Ok(phases)
}

fn build_phase(rules: &[Rule]) -> Result<Phase, RuleError> {
    let streamable = rules.iter().all(Rule::is_streamable);
    let insert_only = rules.iter().all(|r| r.delete().is_empty());
    Ok(if streamable {
        Phase::Stream(StreamPhase::create(rules)?)
    } else if insert_only {
        Phase::SemiNaive(SemiNaivePhase::create(rules)?)
    } else {
        Phase::Naive(NaivePhase::create(rules))
    })
}

/// Buffers the stream into a model, evaluates the phases that need one when the stream ends,
/// and emits the resulting model downstream.
struct ModelSectionHandler<'a> {
    phases: &'a [Phase],
    sink: Box<dyn QuadHandler + 'a>,
    model: MemoryQuadModel,
}

impl QuadHandler for ModelSectionHandler<'_> {
    fn start(&mut self) -> Result<(), StorageError> {
        self.sink.start()
    }

    fn handle(&mut self, quad: Quad) -> Result<(), StorageError> {
        self.model.insert(quad);
        Ok(())
    }

    fn finish(&mut self) -> Result<(), StorageError> {
        let started = Instant::now();
        for phase in self.phases {
            phase.normalize(&self.model.normalizer()).eval_model(&mut self.model)?;
        }
        tracing::debug!(
            quads = self.model.len(),
            phases = self.phases.len(),
            elapsed = ?started.elapsed(),
            "buffered model section evaluated"
        );
        let quads: Vec<Quad> = self.model.iter().map(QuadRef::into_owned).collect();
        for quad in quads {
            self.sink.handle(quad)?;
        }
        self.sink.finish()
    }
}

pub(crate) fn boxed<'a>(handler: impl QuadHandler + 'a) -> Box<dyn QuadHandler + 'a> {
    Box::new(handler)
}

/// Processes one quad against the stream matchers: drops it if already seen, emits it unless a
/// delete pattern claims it, and derives further quads through the insert templates. With
/// `fixpoint`, derivation is applied transitively to its own output; the `deduplicator` keeps
/// that loop from revisiting quads, backed by an exact on-demand guard when it is only
/// approximate.
pub(crate) fn expand(
    quad: Quad,
    sink: &mut dyn QuadHandler,
    deduplicator: &dyn StatementDeduplicator,
    delete_matcher: Option<&StatementMatcher<()>>,
    insert_matcher: Option<&StatementMatcher<StatementTemplate>>,
    fixpoint: bool,
    emit_input: bool,
) -> Result<(), StorageError> {
    if !deduplicator.is_new(quad.as_ref()) {
        return Ok(());
    }
    let passes_delete =
        |q: QuadRef<'_>| delete_matcher.is_none_or(|matcher| !matcher.matches(q));
    if emit_input && passes_delete(quad.as_ref()) {
        sink.handle(quad.clone())?;
    }
    let Some(insert_matcher) = insert_matcher else {
        return Ok(());
    };

    if !fixpoint {
        for template in insert_matcher.map(quad.as_ref()) {
            if let Some(derived) = template.apply(quad.as_ref()) {
                if deduplicator.is_new(derived.as_ref()) {
                    sink.handle(derived)?;
                }
            }
        }
        return Ok(());
    }

    let mut guard: Option<TotalDeduplicator> = None;
    let mut pending: Vec<Quad> = Vec::new();
    let root = quad;
    let mut current = root.clone();
    let mut is_root = true;
    loop {
        if !is_root && passes_delete(current.as_ref()) {
            sink.handle(current.clone())?;
        }
        for template in insert_matcher.map(current.as_ref()) {
            if let Some(derived) = template.apply(current.as_ref()) {
                if !deduplicator.is_new(derived.as_ref()) {
                    continue;
                }
                if !deduplicator.is_total() {
                    let guard = guard.get_or_insert_with(|| {
                        let guard = TotalDeduplicator::new();
                        guard.is_new(root.as_ref());
                        guard
                    });
                    if !guard.is_new(derived.as_ref()) {
                        continue;
                    }
                }
                pending.push(derived);
            }
        }
        match pending.pop() {
            Some(next) => {
                current = next;
                is_root = false;
            }
            None => return Ok(()),
        }
    }
}

/// The ground quads an INSERT-only rule without a WHERE part contributes unconditionally.
pub(crate) fn ground_inserts(rule: &Rule) -> Vec<Quad> {
    rule.insert().iter().filter_map(ground_quad).collect()
}

pub(crate) fn normalize_quads(quads: &[Quad], normalizer: &ValueNormalizer) -> Vec<Quad> {
    quads.iter().map(|q| normalizer.normalize_quad(q)).collect()
}

fn pattern_components(pattern: &QuadPattern) -> Vec<(&Variable, StatementComponent)> {
    let mut components = Vec::new();
    if let TermPattern::Variable(v) = &pattern.subject {
        components.push((v, StatementComponent::Subject));
    }
    if let NamedNodePattern::Variable(v) = &pattern.predicate {
        components.push((v, StatementComponent::Predicate));
    }
    if let TermPattern::Variable(v) = &pattern.object {
        components.push((v, StatementComponent::Object));
    }
    if let GraphNamePattern::Variable(v) = &pattern.graph_name {
        components.push((v, StatementComponent::Graph));
    }
    components
}

/// Compiles the constraints of a single-pattern rule body that the pattern's constant tuple
/// cannot express into a residual filter: equalities between positions bound to a repeated
/// variable, plus the body filters rewritten over quad components. Filter variables are bound
/// by the pattern for every streamable rule, which is the only kind compiled this way.
pub(crate) fn body_residual_filter(body: &RuleBody) -> Option<ResidualFilter> {
    let pattern = &body.patterns[0];
    let components = pattern_components(pattern);
    let mut filters = Vec::new();
    for (i, (variable, component)) in components.iter().enumerate() {
        for (other, other_component) in &components[i + 1..] {
            if variable == other {
                filters.push(ResidualFilter::Equal(
                    FilterValue::Component(*component),
                    FilterValue::Component(*other_component),
                ));
            }
        }
    }
    for filter in &body.filters {
        let value_of = |operand: &FilterOperand| match operand {
            FilterOperand::Constant(t) => Some(FilterValue::Constant(t.clone())),
            FilterOperand::Variable(v) => components
                .iter()
                .find(|(bound, _)| *bound == v)
                .map(|(_, component)| FilterValue::Component(*component)),
        };
        match filter {
            BodyFilter::Equal(a, b) => {
                if let (Some(a), Some(b)) = (value_of(a), value_of(b)) {
                    filters.push(ResidualFilter::Equal(a, b));
                }
            }
            BodyFilter::NotEqual(a, b) => {
                if let (Some(a), Some(b)) = (value_of(a), value_of(b)) {
                    filters.push(ResidualFilter::NotEqual(a, b));
                }
            }
        }
    }
    match filters.len() {
        0 => None,
        1 => filters.pop(),
        _ => Some(ResidualFilter::All(filters)),
    }
}
