use crate::buffer::StatementBuffer;
use crate::dedup::{PartialDeduplicator, StatementDeduplicator, TotalDeduplicator};
use crate::engine::{body_residual_filter, expand, ground_inserts, normalize_quads, EXPAND_CHUNK};
use crate::matcher::StatementMatcher;
use crate::template::StatementTemplate;
use crate::{Rule, RuleError};
use quadflow_common::{QuadCollection, QuadHandler, StorageError};
use quadflow_model::{Quad, QuadRef, ValueNormalizer};
use rayon::prelude::*;

/// A phase whose rules are all streamable, applied one quad at a time.
///
/// The rules are compiled away entirely: the DELETE parts become a matcher deciding which
/// quads to drop, the INSERT parts become a matcher mapping each quad to the templates
/// deriving new quads from it, and rules without a WHERE part contribute ground axioms emitted
/// once at the start of the stream.
pub(crate) struct StreamPhase {
    delete_matcher: Option<StatementMatcher<()>>,
    insert_matcher: Option<StatementMatcher<StatementTemplate>>,
    axioms: Vec<Quad>,
    fixpoint: bool,
}

impl StreamPhase {
    pub(crate) fn create(rules: &[Rule]) -> Result<Self, RuleError> {
        let mut delete_builder = StatementMatcher::<()>::builder();
        let mut insert_builder = StatementMatcher::<StatementTemplate>::builder();
        let mut axioms = Vec::new();
        let fixpoint = rules.first().is_some_and(Rule::fixpoint);
        for rule in rules {
            match rule.body() {
                Some(body) => {
                    let pattern = &body.patterns[0];
                    let filter = body_residual_filter(body);
                    for head in rule.insert() {
                        insert_builder.add(
                            pattern,
                            filter.clone(),
                            [StatementTemplate::new(head, Some(pattern))?],
                        );
                    }
                    if !rule.delete().is_empty() {
                        delete_builder.add(pattern, filter.clone(), std::iter::empty());
                    }
                }
                None => axioms.extend(ground_inserts(rule)),
            }
        }
        let delete_matcher = if delete_builder.is_empty() {
            None
        } else {
            Some(delete_builder.build())
        };
        let insert_matcher = if insert_builder.is_empty() {
            None
        } else {
            Some(insert_builder.build())
        };
        tracing::debug!(
            rules = rules.len(),
            fixpoint,
            axioms = axioms.len(),
            can_delete = delete_matcher.is_some(),
            can_insert = insert_matcher.is_some(),
            "configured stream phase"
        );
        Ok(Self {
            delete_matcher,
            insert_matcher,
            axioms,
            fixpoint,
        })
    }

    pub(crate) fn handler_output_unique(&self, input_unique: bool) -> bool {
        input_unique && self.insert_matcher.is_none()
    }

    pub(crate) fn normalize(&self, normalizer: &ValueNormalizer) -> Self {
        Self {
            delete_matcher: self
                .delete_matcher
                .as_ref()
                .map(|m| m.normalize(normalizer)),
            insert_matcher: self
                .insert_matcher
                .as_ref()
                .map(|m| m.normalize(normalizer)),
            axioms: normalize_quads(&self.axioms, normalizer),
            fixpoint: self.fixpoint,
        }
    }

    pub(crate) fn handler<'a>(
        &'a self,
        sink: Box<dyn QuadHandler + 'a>,
        deduplicate: bool,
    ) -> Box<dyn QuadHandler + 'a> {
        let deduplicator: Box<dyn StatementDeduplicator> = if deduplicate {
            Box::new(TotalDeduplicator::new())
        } else {
            Box::new(PartialDeduplicator::default())
        };
        Box::new(StreamHandler {
            phase: self,
            sink,
            deduplicator,
        })
    }

    /// Applies the phase to a buffered model: axioms and derived quads are inserted, quads
    /// matching a DELETE pattern are removed.
    pub(crate) fn eval_model(&self, model: &mut dyn QuadCollection) -> Result<(), RuleError> {
        let deduplicator = PartialDeduplicator::default();
        let insert_buffer = StatementBuffer::new();
        let delete_buffer = StatementBuffer::new();

        {
            let mut inserts = insert_buffer.appender();
            for axiom in &self.axioms {
                expand(
                    axiom.clone(),
                    &mut inserts,
                    &deduplicator,
                    if self.fixpoint {
                        self.delete_matcher.as_ref()
                    } else {
                        None
                    },
                    self.insert_matcher.as_ref(),
                    self.fixpoint,
                    true,
                )?;
            }
        }

        let quads: Vec<Quad> = model.iter().map(QuadRef::into_owned).collect();
        quads.par_chunks(EXPAND_CHUNK).try_for_each(|chunk| {
            let mut inserts = insert_buffer.appender();
            let mut deletes = delete_buffer.appender();
            for quad in chunk {
                if self
                    .delete_matcher
                    .as_ref()
                    .is_some_and(|m| m.matches(quad.as_ref()))
                {
                    deletes.push(quad.clone());
                }
                // The quad itself stays where it is (unless deleted); only derivations are
                // collected.
                expand(
                    quad.clone(),
                    &mut inserts,
                    &deduplicator,
                    self.delete_matcher.as_ref(),
                    self.insert_matcher.as_ref(),
                    self.fixpoint,
                    false,
                )?;
            }
            Ok::<_, StorageError>(())
        })?;

        delete_buffer.commit(model, false, None);
        insert_buffer.commit(model, true, None);
        Ok(())
    }
}

/// The handler stage a [`StreamPhase`] contributes to a chain.
struct StreamHandler<'a> {
    phase: &'a StreamPhase,
    sink: Box<dyn QuadHandler + 'a>,
    deduplicator: Box<dyn StatementDeduplicator>,
}

impl QuadHandler for StreamHandler<'_> {
    fn start(&mut self) -> Result<(), StorageError> {
        self.sink.start()?;
        for axiom in &self.phase.axioms {
            // Axioms are exempt from deletion in a single pass; under fixpoint they are
            // treated like any other quad.
            expand(
                axiom.clone(),
                &mut self.sink,
                self.deduplicator.as_ref(),
                if self.phase.fixpoint {
                    self.phase.delete_matcher.as_ref()
                } else {
                    None
                },
                self.phase.insert_matcher.as_ref(),
                self.phase.fixpoint,
                true,
            )?;
        }
        Ok(())
    }

    fn handle(&mut self, quad: Quad) -> Result<(), StorageError> {
        expand(
            quad,
            &mut self.sink,
            self.deduplicator.as_ref(),
            self.phase.delete_matcher.as_ref(),
            self.phase.insert_matcher.as_ref(),
            self.phase.fixpoint,
            true,
        )
    }

    fn finish(&mut self) -> Result<(), StorageError> {
        self.sink.finish()
    }
}
