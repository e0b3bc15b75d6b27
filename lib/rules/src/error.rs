use quadflow_common::StorageError;
use quadflow_model::{NamedNode, PatternError, Variable};

/// An error raised while building or evaluating a ruleset.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RuleError {
    /// The rule binds a head variable that no WHERE pattern binds, so evaluation could not
    /// ground it.
    #[error("rule {rule} is not safe: head variable {variable} is not bound by the WHERE part")]
    UnsafeRule { rule: NamedNode, variable: Variable },
    #[error("rule {rule} is malformed: {source}")]
    MalformedRule {
        rule: NamedNode,
        #[source]
        source: PatternError,
    },
    #[error("duplicate rule {rule}")]
    DuplicateRule { rule: NamedNode },
    #[error(transparent)]
    Pattern(#[from] PatternError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<RuleError> for StorageError {
    fn from(error: RuleError) -> Self {
        match error {
            RuleError::Storage(e) => e,
            other => StorageError::Other(Box::new(other)),
        }
    }
}
