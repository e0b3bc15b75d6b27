use crate::buffer::StatementBuffer;
use crate::dedup::{DedupHandler, PartialDeduplicator};
use crate::engine::boxed;
use crate::rule::{evaluate_rules, SinkFactory};
use crate::{Rule, RuleError};
use quadflow_common::QuadCollection;
use std::time::Instant;

/// The fallback phase: repeated whole-model evaluation rounds.
///
/// Used for rule runs that can delete quads from joins, which neither the stream nor the
/// semi-naive strategy supports. Every round evaluates all rules against the full model,
/// applies deletions then insertions, and repeats until a round leaves the model unchanged.
#[derive(Clone)]
pub(crate) struct NaivePhase {
    rules: Vec<Rule>,
    fixpoint: bool,
    can_delete: bool,
    can_insert: bool,
}

impl NaivePhase {
    pub(crate) fn create(rules: &[Rule]) -> Self {
        let fixpoint = rules.first().is_some_and(Rule::fixpoint);
        let can_delete = rules.iter().any(|r| !r.delete().is_empty());
        let can_insert = rules.iter().any(|r| !r.insert().is_empty());
        tracing::debug!(
            rules = rules.len(),
            fixpoint,
            can_delete,
            can_insert,
            "configured naive phase"
        );
        Self {
            rules: rules.to_vec(),
            // Deletion alone shrinks the model monotonically, so one round suffices.
            fixpoint: fixpoint && can_insert,
            can_delete,
            can_insert,
        }
    }

    pub(crate) fn eval_model(&self, model: &mut dyn QuadCollection) -> Result<(), RuleError> {
        let mut delete_dedup = self.can_delete.then(PartialDeduplicator::default);
        let mut insert_dedup = self.can_insert.then(PartialDeduplicator::default);
        if !self.fixpoint {
            self.eval_round(delete_dedup.as_ref(), insert_dedup.as_ref(), model)?;
            return Ok(());
        }
        loop {
            let changed = self.eval_round(delete_dedup.as_ref(), insert_dedup.as_ref(), model)?;
            if !changed {
                return Ok(());
            }
            // A deleted quad may be legitimately re-derived in a later round, so the caches
            // must not remember it across rounds.
            if self.can_insert && self.can_delete {
                delete_dedup = Some(PartialDeduplicator::default());
                insert_dedup = Some(PartialDeduplicator::default());
            }
        }
    }

    /// Evaluates every rule once and applies the resulting changes, reporting whether the
    /// model differs from its state before the round.
    fn eval_round(
        &self,
        delete_dedup: Option<&PartialDeduplicator>,
        insert_dedup: Option<&PartialDeduplicator>,
        model: &mut dyn QuadCollection,
    ) -> Result<bool, RuleError> {
        let started = Instant::now();
        let delete_buffer = StatementBuffer::new();
        let insert_buffer = StatementBuffer::new();

        {
            let delete_buffer = &delete_buffer;
            let insert_buffer = &insert_buffer;
            let delete_factory = delete_dedup
                .map(|dedup| move || boxed(DedupHandler::new(delete_buffer.appender(), dedup)));
            let insert_factory = insert_dedup
                .map(|dedup| move || boxed(DedupHandler::new(insert_buffer.appender(), dedup)));
            evaluate_rules(
                &self.rules,
                model,
                None,
                delete_factory.as_ref().map(|f| f as &SinkFactory<'_>),
                insert_factory.as_ref().map(|f| f as &SinkFactory<'_>),
            )?;
        }

        let size0 = model.len();
        let deletions = delete_buffer.commit(model, false, None);
        let size1 = model.len();
        let insertions = insert_buffer.commit(model, true, None);
        let size2 = model.len();

        let changed = if size0 != size2 {
            true
        } else if size0 == size1 {
            false
        } else {
            // Real deletions, yet the size is back where it started. The model is unchanged
            // exactly when everything deleted was re-inserted by the same round.
            !insert_buffer.contains_all(&delete_buffer)
        };
        tracing::debug!(
            rules = self.rules.len(),
            deletions,
            insertions,
            quads = size2,
            changed,
            elapsed = ?started.elapsed(),
            "naive evaluation round done"
        );
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RuleBody;
    use quadflow_model::{
        GraphName, GraphNamePattern, NamedNode, NamedNodePattern, Quad, QuadPattern, TermPattern,
        Variable,
    };
    use quadflow_storage::MemoryQuadModel;

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
            predicate: NamedNodePattern::NamedNode(iri(p)),
            object: term(o),
            graph_name: GraphNamePattern::Variable(var("g")),
        }
    }

    #[test]
    fn delete_insert_rule_rewrites_the_model() {
        // DELETE (?s old ?o) INSERT (?s new ?o) WHERE (?s old ?o)
        let rule = Rule::new(
            iri("rename"),
            0,
            false,
            vec![pattern("?s", "old", "?o")],
            vec![pattern("?s", "new", "?o")],
            Some(RuleBody::new(vec![pattern("?s", "old", "?o")])),
        )
        .unwrap();
        let phase = NaivePhase::create(&[rule]);
        let mut model: MemoryQuadModel = [quad("a", "old", "b"), quad("c", "p", "d")]
            .into_iter()
            .collect();
        phase.eval_model(&mut model).unwrap();
        assert_eq!(model.len(), 2);
        assert!(model.contains(quad("a", "new", "b").as_ref()));
        assert!(!model.contains(quad("a", "old", "b").as_ref()));
    }

    #[test]
    fn fixpoint_reaches_transitive_closure() {
        let rule = Rule::new(
            iri("trans"),
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
        // Force the naive strategy by pairing with a deleting rule that never fires.
        let noop_delete = Rule::new(
            iri("noop"),
            0,
            true,
            vec![pattern("?x", "q", "?y")],
            vec![],
            Some(RuleBody::new(vec![
                pattern("?x", "q", "?y"),
                pattern("?y", "q", "?x"),
            ])),
        )
        .unwrap();
        let phase = NaivePhase::create(&[rule, noop_delete]);
        let mut model: MemoryQuadModel = [
            quad("a", "p", "b"),
            quad("b", "p", "c"),
            quad("c", "p", "d"),
        ]
        .into_iter()
        .collect();
        phase.eval_model(&mut model).unwrap();
        // All pairs reachable along the path.
        assert_eq!(model.len(), 6);
        assert!(model.contains(quad("a", "p", "d").as_ref()));
    }

    #[test]
    fn deletion_alone_runs_a_single_round() {
        let rule = Rule::new(
            iri("purge"),
            0,
            true,
            vec![pattern("?x", "p", "?y")],
            vec![],
            Some(RuleBody::new(vec![pattern("?x", "p", "?y")])),
        )
        .unwrap();
        let phase = NaivePhase::create(&[rule]);
        assert!(!phase.fixpoint);
        let mut model: MemoryQuadModel = [quad("a", "p", "b"), quad("a", "q", "b")]
            .into_iter()
            .collect();
        phase.eval_model(&mut model).unwrap();
        assert_eq!(model.len(), 1);
        assert!(model.contains(quad("a", "q", "b").as_ref()));
    }

    #[test]
    fn balanced_delete_insert_terminates() {
        // DELETE (?s p ?o) INSERT (?s p ?o): every round rewrites the model to itself, which
        // must be detected as "unchanged" to terminate.
        let rule = Rule::new(
            iri("swap"),
            0,
            true,
            vec![pattern("?s", "p", "?o")],
            vec![pattern("?s", "p", "?o")],
            Some(RuleBody::new(vec![pattern("?s", "p", "?o")])),
        )
        .unwrap();
        let phase = NaivePhase::create(&[rule]);
        let mut model: MemoryQuadModel = [quad("a", "p", "b")].into_iter().collect();
        phase.eval_model(&mut model).unwrap();
        assert_eq!(model.len(), 1);
        assert!(model.contains(quad("a", "p", "b").as_ref()));
    }
}
