mod interner;
mod pattern;
pub mod vocab;

pub use interner::*;
pub use pattern::*;

// Re-export some oxrdf types.
pub use oxiri::Iri;
pub use oxrdf::{
    BlankNode, BlankNodeRef, GraphName, GraphNameRef, IriParseError, Literal, LiteralRef,
    NamedNode, NamedNodeRef, Quad, QuadRef, Subject, SubjectRef, Term, TermParseError, TermRef,
    Variable, VariableNameParseError, VariableRef,
};

// Re-export the spargebra pattern types used to express rules.
pub use spargebra::term::{GraphNamePattern, NamedNodePattern, QuadPattern, TermPattern};
