use crate::{Rule, RuleError};
use quadflow_model::Term;
use rustc_hash::FxHashSet;
use std::fmt;

/// An ordered collection of rules evaluated together.
///
/// Construction validates the rules as a whole: ids must be unique and every rule must be
/// safe. Rules are kept sorted by `(phase, fixpoint, id)`, which is the order the engine
/// partitions them into phases.
#[derive(Debug, Clone)]
pub struct Ruleset {
    rules: Vec<Rule>,
    static_terms: FxHashSet<Term>,
}

impl Ruleset {
    pub fn new(rules: impl IntoIterator<Item = Rule>) -> Result<Self, RuleError> {
        Self::with_static_terms(rules, [])
    }

    /// Creates a ruleset together with the terms known to come from the schema rather than the
    /// data, which downstream tooling can use to pre-bind patterns.
    pub fn with_static_terms(
        rules: impl IntoIterator<Item = Rule>,
        static_terms: impl IntoIterator<Item = Term>,
    ) -> Result<Self, RuleError> {
        let mut rules: Vec<Rule> = rules.into_iter().collect();
        rules.sort();
        let mut ids = FxHashSet::default();
        for rule in &rules {
            if !ids.insert(rule.id().clone()) {
                return Err(RuleError::DuplicateRule {
                    rule: rule.id().clone(),
                });
            }
        }
        for rule in &rules {
            if let Some(variable) = rule.unbound_head_variable() {
                return Err(RuleError::UnsafeRule {
                    rule: rule.id().clone(),
                    variable: variable.clone(),
                });
            }
        }
        Ok(Self {
            rules,
            static_terms: static_terms.into_iter().collect(),
        })
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn static_terms(&self) -> &FxHashSet<Term> {
        &self.static_terms
    }

    /// True if some rule can retract quads.
    pub fn is_delete_possible(&self) -> bool {
        self.rules.iter().any(|r| !r.delete().is_empty())
    }

    /// True if some rule can assert quads.
    pub fn is_insert_possible(&self) -> bool {
        self.rules.iter().any(|r| !r.insert().is_empty())
    }
}

impl fmt::Display for Ruleset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ruleset with {} rule(s):", self.rules.len())?;
        for rule in &self.rules {
            writeln!(f, "  {rule}")?;
        }
        Ok(())
    }
}
