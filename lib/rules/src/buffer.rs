use quadflow_common::{QuadCollection, QuadHandler, StorageError};
use quadflow_model::{Quad, QuadRef};
use rustc_hash::FxHashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Quads per block. Appenders hand over whole blocks, so this bounds both the lock hold time
/// and the quads a dropped appender can still be holding.
const BLOCK_LEN: usize = 1024;

/// An append-only, thread-safe accumulation buffer for quads.
///
/// Concurrent producers obtain an [`Appender`] each and write through it; appenders collect
/// quads into a private block and splice the whole block into the shared list under a short
/// lock. Consumption ([`commit`](Self::commit), [`for_each`](Self::for_each),
/// [`contains_all`](Self::contains_all)) happens after all appenders are done, at the
/// single-threaded point between evaluation rounds.
#[derive(Debug, Default)]
pub struct StatementBuffer {
    blocks: Mutex<Vec<Vec<Quad>>>,
}

impl StatementBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn blocks(&self) -> MutexGuard<'_, Vec<Vec<Quad>>> {
        self.blocks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.blocks().iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks().iter().all(Vec::is_empty)
    }

    /// Appends a single quad directly. Prefer an [`Appender`] in loops.
    pub fn push(&self, quad: Quad) {
        self.blocks().push(vec![quad]);
    }

    pub fn appender(&self) -> Appender<'_> {
        Appender {
            buffer: self,
            block: Vec::new(),
        }
    }

    pub fn for_each(&self, mut f: impl FnMut(&Quad)) {
        for block in self.blocks().iter() {
            for quad in block {
                f(quad);
            }
        }
    }

    /// True if every quad of `other` is also in this buffer.
    pub fn contains_all(&self, other: &StatementBuffer) -> bool {
        let blocks = self.blocks();
        let snapshot: FxHashSet<&Quad> = blocks.iter().flatten().collect();
        let other_blocks = other.blocks();
        other_blocks
            .iter()
            .flatten()
            .all(|quad| snapshot.contains(quad))
    }

    /// Applies the buffered quads to `model`, inserting them if `add` is true and removing
    /// them otherwise. Returns the number of quads that actually changed the model; those are
    /// also reported to `on_change` when given.
    pub fn commit(
        &self,
        model: &mut dyn QuadCollection,
        add: bool,
        mut on_change: Option<&mut dyn FnMut(&Quad)>,
    ) -> usize {
        let mut changed = 0;
        for block in self.blocks().iter() {
            for quad in block {
                let applied = if add {
                    model.insert(quad.clone())
                } else {
                    model.remove(quad.as_ref())
                };
                if applied {
                    changed += 1;
                    if let Some(f) = on_change.as_deref_mut() {
                        f(quad);
                    }
                }
            }
        }
        changed
    }
}

/// A producer-local handle onto a [`StatementBuffer`].
///
/// Flushes automatically when the block fills up and on drop; implements [`QuadHandler`] so it
/// can terminate a handler chain.
#[derive(Debug)]
pub struct Appender<'a> {
    buffer: &'a StatementBuffer,
    block: Vec<Quad>,
}

impl Appender<'_> {
    pub fn push(&mut self, quad: Quad) {
        if self.block.is_empty() {
            self.block.reserve(BLOCK_LEN);
        }
        self.block.push(quad);
        if self.block.len() == BLOCK_LEN {
            self.flush();
        }
    }

    pub fn flush(&mut self) {
        if !self.block.is_empty() {
            let block = std::mem::take(&mut self.block);
            self.buffer.blocks().push(block);
        }
    }
}

impl Drop for Appender<'_> {
    fn drop(&mut self) {
        self.flush();
    }
}

impl QuadHandler for Appender<'_> {
    fn handle(&mut self, quad: Quad) -> Result<(), StorageError> {
        self.push(quad);
        Ok(())
    }

    fn finish(&mut self) -> Result<(), StorageError> {
        self.flush();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quadflow_model::{GraphName, NamedNode};
    use quadflow_storage::MemoryQuadModel;

    fn quad(n: usize) -> Quad {
        Quad {
            subject: NamedNode::new(format!("http://example.com/s{n}")).unwrap().into(),
            predicate: NamedNode::new("http://example.com/p").unwrap(),
            object: NamedNode::new("http://example.com/o").unwrap().into(),
            graph_name: GraphName::DefaultGraph,
        }
    }

    #[test]
    fn appender_crosses_block_boundaries() {
        let buffer = StatementBuffer::new();
        {
            let mut appender = buffer.appender();
            for i in 0..BLOCK_LEN + 7 {
                appender.push(quad(i));
            }
        }
        assert_eq!(buffer.len(), BLOCK_LEN + 7);
        let mut count = 0;
        buffer.for_each(|_| count += 1);
        assert_eq!(count, BLOCK_LEN + 7);
    }

    #[test]
    fn contains_all_compares_contents() {
        let a = StatementBuffer::new();
        let b = StatementBuffer::new();
        a.push(quad(1));
        a.push(quad(2));
        b.push(quad(2));
        assert!(a.contains_all(&b));
        assert!(!b.contains_all(&a));
        assert!(a.contains_all(&StatementBuffer::new()));
    }

    #[test]
    fn commit_reports_actual_changes() {
        let mut model = MemoryQuadModel::new();
        model.insert(quad(1));

        let buffer = StatementBuffer::new();
        buffer.push(quad(1));
        buffer.push(quad(2));
        let mut changed = Vec::new();
        let count = buffer.commit(&mut model, true, Some(&mut |q: &Quad| changed.push(q.clone())));
        assert_eq!(count, 1);
        assert_eq!(changed, vec![quad(2)]);
        assert_eq!(model.len(), 2);

        let count = buffer.commit(&mut model, false, None);
        assert_eq!(count, 2);
        assert!(model.is_empty());
    }
}
