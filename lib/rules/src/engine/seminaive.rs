use crate::buffer::{Appender, StatementBuffer};
use crate::dedup::{DedupHandler, PartialDeduplicator, StatementDeduplicator, TotalDeduplicator};
use crate::engine::{
    body_residual_filter, boxed, expand, ground_inserts, normalize_quads, EXPAND_CHUNK,
};
use crate::matcher::StatementMatcher;
use crate::rule::{evaluate_rules, SinkFactory};
use crate::template::StatementTemplate;
use crate::{Rule, RuleError};
use quadflow_common::{QuadCollection, QuadHandler, StorageError};
use quadflow_model::{Quad, QuadRef, ValueNormalizer};
use quadflow_storage::{DeltaModel, MemoryQuadModel};
use rayon::prelude::*;
use std::time::Instant;

/// A phase of insert-only rules evaluated semi-naively.
///
/// The streamable rules of the run are compiled to a template matcher and closed over each
/// quad directly; the remaining join rules are evaluated in rounds where, after the first, the
/// WHERE parts are anchored to the delta of the previous round, so each round only recomputes
/// solutions involving new quads. A second matcher built from the join rules' WHERE patterns
/// decides which quads can feed a join at all; in the streaming setting everything else passes
/// straight through.
pub(crate) struct SemiNaivePhase {
    all_rules: Vec<Rule>,
    join_rules: Vec<Rule>,
    stream_matcher: StatementMatcher<StatementTemplate>,
    join_matcher: StatementMatcher<()>,
    axioms: Vec<Quad>,
    fixpoint: bool,
}

impl SemiNaivePhase {
    pub(crate) fn create(rules: &[Rule]) -> Result<Self, RuleError> {
        let fixpoint = rules.first().is_some_and(Rule::fixpoint);
        let mut join_rules = Vec::new();
        let mut axioms = Vec::new();
        let mut join_builder = StatementMatcher::<()>::builder();
        let mut stream_builder = StatementMatcher::<StatementTemplate>::builder();
        for rule in rules {
            if !rule.is_streamable() {
                join_rules.push(rule.clone());
                if let Some(body) = rule.body() {
                    for pattern in &body.patterns {
                        join_builder.add(pattern, None, std::iter::empty());
                    }
                }
                continue;
            }
            match rule.body() {
                Some(body) => {
                    let pattern = &body.patterns[0];
                    let filter = body_residual_filter(body);
                    for head in rule.insert() {
                        stream_builder.add(
                            pattern,
                            filter.clone(),
                            [StatementTemplate::new(head, Some(pattern))?],
                        );
                    }
                }
                None => axioms.extend(ground_inserts(rule)),
            }
        }
        let join_matcher = join_builder.build();
        let stream_matcher = stream_builder.build();
        tracing::debug!(
            rules = rules.len(),
            join_rules = join_rules.len(),
            fixpoint,
            axioms = axioms.len(),
            join_match_all = join_matcher.match_all(),
            "configured semi-naive phase"
        );
        Ok(Self {
            all_rules: rules.to_vec(),
            join_rules,
            stream_matcher,
            join_matcher,
            axioms,
            fixpoint,
        })
    }

    /// Streaming only works if some quads bypass the joins; a wildcard WHERE pattern forces
    /// the whole stream into the join model, at which point buffering into a real model is
    /// cheaper.
    pub(crate) fn handler_supported(&self) -> bool {
        !self.join_matcher.match_all()
    }

    pub(crate) fn handler_output_unique(&self) -> bool {
        self.fixpoint && self.join_matcher.match_all()
    }

    pub(crate) fn normalize(&self, normalizer: &ValueNormalizer) -> Self {
        Self {
            all_rules: self.all_rules.clone(),
            join_rules: self.join_rules.clone(),
            stream_matcher: self.stream_matcher.normalize(normalizer),
            join_matcher: self.join_matcher.normalize(normalizer),
            axioms: normalize_quads(&self.axioms, normalizer),
            fixpoint: self.fixpoint,
        }
    }

    pub(crate) fn eval_model(&self, model: &mut dyn QuadCollection) -> Result<(), RuleError> {
        let deduplicator = PartialDeduplicator::default();
        if !self.fixpoint {
            return self.eval_join_stream_iteration(&deduplicator, model);
        }
        // Close the model under the stream rules first, so the join rounds start from quads
        // that cannot change any more.
        if self.join_rules.len() < self.all_rules.len() {
            self.eval_stream_fixpoint(&deduplicator, model)?;
        }
        let mut delta: Option<DeltaModel> = None;
        loop {
            let next = self.eval_join_iteration(&deduplicator, model, delta.as_ref(), None)?;
            if next.is_empty() {
                return Ok(());
            }
            delta = Some(next);
        }
    }

    pub(crate) fn handler<'a>(
        &'a self,
        sink: Box<dyn QuadHandler + 'a>,
        deduplicate: bool,
    ) -> Box<dyn QuadHandler + 'a> {
        if self.fixpoint {
            let deduplicator: Box<dyn StatementDeduplicator> =
                if deduplicate && self.join_matcher.match_all() {
                    Box::new(TotalDeduplicator::new())
                } else {
                    Box::new(PartialDeduplicator::default())
                };
            Box::new(FixpointHandler {
                phase: self,
                sink,
                join_model: MemoryQuadModel::new(),
                deduplicator,
            })
        } else {
            let deduplicator: Box<dyn StatementDeduplicator> = if deduplicate {
                Box::new(TotalDeduplicator::new())
            } else {
                Box::new(PartialDeduplicator::default())
            };
            Box::new(NonFixpointHandler {
                phase: self,
                sink,
                join_model: MemoryQuadModel::new(),
                deduplicator,
            })
        }
    }

    /// One pass of every rule, stream and join alike, without fixpoint.
    fn eval_join_stream_iteration(
        &self,
        deduplicator: &dyn StatementDeduplicator,
        model: &mut dyn QuadCollection,
    ) -> Result<(), RuleError> {
        let started = Instant::now();
        let buffer = StatementBuffer::new();
        {
            let mut appender = buffer.appender();
            for axiom in &self.axioms {
                appender.push(axiom.clone());
            }
        }
        let quads: Vec<Quad> = model.iter().map(QuadRef::into_owned).collect();
        self.apply_stream_rules(deduplicator, &quads, &buffer, false)?;
        {
            let buffer = &buffer;
            let factory = move || boxed(DedupHandler::new(buffer.appender(), deduplicator));
            evaluate_rules(
                &self.join_rules,
                model,
                None,
                None,
                Some(&factory as &SinkFactory<'_>),
            )?;
        }
        let insertions = buffer.commit(model, true, None);
        tracing::debug!(
            join_rules = self.join_rules.len(),
            stream_rules = self.all_rules.len() - self.join_rules.len(),
            insertions,
            quads = model.len(),
            elapsed = ?started.elapsed(),
            "semi-naive single iteration done"
        );
        Ok(())
    }

    /// Closes the model under the stream rules alone.
    fn eval_stream_fixpoint(
        &self,
        deduplicator: &dyn StatementDeduplicator,
        model: &mut dyn QuadCollection,
    ) -> Result<(), RuleError> {
        let started = Instant::now();
        let buffer = StatementBuffer::new();
        {
            let mut appender = buffer.appender();
            for axiom in &self.axioms {
                appender.push(axiom.clone());
            }
        }
        let quads: Vec<Quad> = self
            .axioms
            .iter()
            .cloned()
            .chain(model.iter().map(QuadRef::into_owned))
            .collect();
        self.apply_stream_rules(deduplicator, &quads, &buffer, true)?;
        let insertions = buffer.commit(model, true, None);
        tracing::debug!(
            stream_rules = self.all_rules.len() - self.join_rules.len(),
            insertions,
            quads = model.len(),
            elapsed = ?started.elapsed(),
            "stream-rule fixpoint done"
        );
        Ok(())
    }

    /// One join round. Derived quads are closed under the stream rules on the fly; those that
    /// can feed another join are inserted into `model` (collecting the inserted ones as the
    /// returned delta), the rest goes to `escaped` when given and is dropped otherwise.
    fn eval_join_iteration(
        &self,
        deduplicator: &dyn StatementDeduplicator,
        model: &mut dyn QuadCollection,
        delta: Option<&DeltaModel>,
        escaped: Option<&StatementBuffer>,
    ) -> Result<DeltaModel, RuleError> {
        let started = Instant::now();
        let buffer = StatementBuffer::new();
        {
            let buffer = &buffer;
            let factory = move || {
                let inner: Box<dyn QuadHandler + '_> = match escaped {
                    Some(escaped) => boxed(RouteHandler {
                        matcher: &self.join_matcher,
                        matched: buffer.appender(),
                        unmatched: escaped.appender(),
                    }),
                    None => boxed(buffer.appender()),
                };
                boxed(ExpandHandler {
                    sink: inner,
                    deduplicator,
                    matcher: &self.stream_matcher,
                })
            };
            evaluate_rules(
                &self.join_rules,
                model,
                delta,
                None,
                Some(&factory as &SinkFactory<'_>),
            )?;
        }
        let mut delta_quads = Vec::new();
        let insertions = buffer.commit(
            model,
            true,
            Some(&mut |quad: &Quad| delta_quads.push(quad.clone())),
        );
        tracing::debug!(
            join_rules = self.join_rules.len(),
            insertions,
            quads = model.len(),
            delta = delta_quads.len(),
            elapsed = ?started.elapsed(),
            "semi-naive join round done"
        );
        Ok(DeltaModel::new(delta_quads, model.normalizer()))
    }

    fn apply_stream_rules(
        &self,
        deduplicator: &dyn StatementDeduplicator,
        quads: &[Quad],
        buffer: &StatementBuffer,
        fixpoint: bool,
    ) -> Result<(), StorageError> {
        quads.par_chunks(EXPAND_CHUNK).try_for_each(|chunk| {
            let mut appender = buffer.appender();
            for quad in chunk {
                expand(
                    quad.clone(),
                    &mut appender,
                    deduplicator,
                    None,
                    Some(&self.stream_matcher),
                    fixpoint,
                    false,
                )?;
            }
            Ok(())
        })
    }
}

/// Applies the stream templates to every quad passing through, forwarding input and
/// derivations alike.
struct ExpandHandler<'a, H> {
    sink: H,
    deduplicator: &'a dyn StatementDeduplicator,
    matcher: &'a StatementMatcher<StatementTemplate>,
}

impl<H: QuadHandler> QuadHandler for ExpandHandler<'_, H> {
    fn handle(&mut self, quad: Quad) -> Result<(), StorageError> {
        expand(
            quad,
            &mut self.sink,
            self.deduplicator,
            None,
            Some(self.matcher),
            true,
            true,
        )
    }

    fn finish(&mut self) -> Result<(), StorageError> {
        self.sink.finish()
    }
}

/// Splits a stream into quads that can feed a join and quads that cannot.
struct RouteHandler<'a> {
    matcher: &'a StatementMatcher<()>,
    matched: Appender<'a>,
    unmatched: Appender<'a>,
}

impl QuadHandler for RouteHandler<'_> {
    fn handle(&mut self, quad: Quad) -> Result<(), StorageError> {
        if self.matcher.matches(quad.as_ref()) {
            self.matched.push(quad);
        } else {
            self.unmatched.push(quad);
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), StorageError> {
        self.matched.flush();
        self.unmatched.flush();
        Ok(())
    }
}

/// Routes stream-rule output either into the join model or directly downstream.
struct ModelRouteSink<'a, H> {
    matcher: &'a StatementMatcher<()>,
    model: &'a mut MemoryQuadModel,
    sink: H,
}

impl<H: QuadHandler> QuadHandler for ModelRouteSink<'_, H> {
    fn handle(&mut self, quad: Quad) -> Result<(), StorageError> {
        if self.matcher.matches(quad.as_ref()) {
            self.model.insert(quad);
            Ok(())
        } else {
            self.sink.handle(quad)
        }
    }
}

/// The streaming form of a fixpoint semi-naive phase.
///
/// Incoming quads are closed under the stream rules immediately; of the result, whatever can
/// feed a join is buffered in a model and everything else is emitted right away. When the
/// stream ends, the join rules run to fixpoint on the buffered model, which is then emitted.
struct FixpointHandler<'a> {
    phase: &'a SemiNaivePhase,
    sink: Box<dyn QuadHandler + 'a>,
    join_model: MemoryQuadModel,
    deduplicator: Box<dyn StatementDeduplicator>,
}

impl QuadHandler for FixpointHandler<'_> {
    fn start(&mut self) -> Result<(), StorageError> {
        self.sink.start()?;
        for axiom in self.phase.axioms.clone() {
            self.handle(axiom)?;
        }
        Ok(())
    }

    fn handle(&mut self, quad: Quad) -> Result<(), StorageError> {
        let mut route = ModelRouteSink {
            matcher: &self.phase.join_matcher,
            model: &mut self.join_model,
            sink: &mut self.sink,
        };
        expand(
            quad,
            &mut route,
            self.deduplicator.as_ref(),
            None,
            Some(&self.phase.stream_matcher),
            true,
            true,
        )
    }

    fn finish(&mut self) -> Result<(), StorageError> {
        let mut delta: Option<DeltaModel> = None;
        loop {
            let escaped = StatementBuffer::new();
            let next = self.phase.eval_join_iteration(
                self.deduplicator.as_ref(),
                &mut self.join_model,
                delta.as_ref(),
                Some(&escaped),
            )?;
            let mut pending = Vec::new();
            escaped.for_each(|quad| pending.push(quad.clone()));
            for quad in pending {
                self.sink.handle(quad)?;
            }
            if next.is_empty() {
                break;
            }
            delta = Some(next);
        }
        let quads: Vec<Quad> = self.join_model.iter().map(QuadRef::into_owned).collect();
        for quad in quads {
            self.sink.handle(quad)?;
        }
        self.sink.finish()
    }
}

/// The streaming form of a single-pass semi-naive phase: stream rules apply on the fly, join
/// rules run once over the buffered joinable quads when the stream ends.
struct NonFixpointHandler<'a> {
    phase: &'a SemiNaivePhase,
    sink: Box<dyn QuadHandler + 'a>,
    join_model: MemoryQuadModel,
    deduplicator: Box<dyn StatementDeduplicator>,
}

impl QuadHandler for NonFixpointHandler<'_> {
    fn start(&mut self) -> Result<(), StorageError> {
        self.sink.start()?;
        for axiom in &self.phase.axioms {
            self.sink.handle(axiom.clone())?;
        }
        Ok(())
    }

    fn handle(&mut self, quad: Quad) -> Result<(), StorageError> {
        expand(
            quad.clone(),
            &mut self.sink,
            self.deduplicator.as_ref(),
            None,
            Some(&self.phase.stream_matcher),
            false,
            true,
        )?;
        if self.phase.join_matcher.matches(quad.as_ref()) {
            self.join_model.insert(quad);
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), StorageError> {
        {
            let buffer = StatementBuffer::new();
            {
                let buffer = &buffer;
                let deduplicator = self.deduplicator.as_ref();
                let factory =
                    move || boxed(DedupHandler::new(buffer.appender(), deduplicator));
                evaluate_rules(
                    &self.phase.join_rules,
                    &self.join_model,
                    None,
                    None,
                    Some(&factory as &SinkFactory<'_>),
                )?;
            }
            let mut pending = Vec::new();
            buffer.for_each(|quad| pending.push(quad.clone()));
            for quad in pending {
                self.sink.handle(quad)?;
            }
        }
        self.sink.finish()
    }
}
