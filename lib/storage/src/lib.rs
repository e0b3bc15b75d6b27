//! In-memory quad storage for rule evaluation.
//!
//! [`MemoryQuadModel`] is the workhorse: a fully indexed quad set that implements
//! [`QuadCollection`](quadflow_common::QuadCollection) and interns its terms through a shared
//! [`ValueNormalizer`](quadflow_model::ValueNormalizer). [`DeltaModel`] wraps a small model
//! holding the quads derived in one evaluation round and adds a cheap pre-check for whether a
//! pattern can possibly match it.

mod delta;
mod memory;

pub use delta::*;
pub use memory::*;
