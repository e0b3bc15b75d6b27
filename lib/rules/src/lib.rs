//! Forward-chaining DELETE/INSERT/WHERE rule engine over RDF quads.
//!
//! A [`Ruleset`] is compiled into a [`QueryRuleEngine`], which partitions the rules into
//! phases and picks an evaluation strategy per phase: streamable rules are applied one quad
//! at a time, insert-only join rules run a semi-naive fixpoint over a delta, and everything
//! else falls back to naive whole-model rounds. The engine can either rewrite a buffered
//! [`MemoryQuadModel`](quadflow_storage::MemoryQuadModel) in place or act as a stage in a
//! [`QuadHandler`](quadflow_common::QuadHandler) chain, buffering only the sections of the
//! stream that actually need it.

mod buffer;
mod dedup;
mod engine;
mod error;
mod matcher;
mod rule;
mod ruleset;
mod template;

pub use buffer::*;
pub use dedup::*;
pub use engine::QueryRuleEngine;
pub use error::*;
pub use matcher::*;
pub use rule::{BindingValue, BodyFilter, FilterOperand, Rule, RuleBody};
pub use ruleset::*;
pub use template::*;
