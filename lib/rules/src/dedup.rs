use quadflow_common::{QuadHandler, StorageError};
use quadflow_model::{GraphNameRef, Quad, QuadRef, SubjectRef, TermRef};
use rustc_hash::FxHashSet;
use siphasher::sip128::{Hasher128, SipHasher24};
use std::hash::Hasher;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Number of lock shards of a [`PartialDeduplicator`].
const NUM_LOCKS: usize = 64;

/// Default cache size used by the engine for partial deduplication.
pub const DEFAULT_PARTIAL_CAPACITY: usize = 16 * 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn write_delimited(hasher: &mut SipHasher24, tag: u8, value: &str) {
    hasher.write_u8(tag);
    hasher.write(value.as_bytes());
    hasher.write_u8(0);
}

fn write_term(hasher: &mut SipHasher24, term: TermRef<'_>) {
    match term {
        TermRef::NamedNode(n) => write_delimited(hasher, 1, n.as_str()),
        TermRef::BlankNode(b) => write_delimited(hasher, 2, b.as_str()),
        TermRef::Literal(l) => {
            write_delimited(hasher, 3, l.value());
            write_delimited(hasher, 4, l.datatype().as_str());
            if let Some(lang) = l.language() {
                write_delimited(hasher, 5, lang);
            }
        }
    }
}

/// Computes a 128-bit fingerprint of a quad, collision-free for practical purposes.
fn fingerprint(quad: QuadRef<'_>) -> u128 {
    let mut hasher = SipHasher24::new();
    match quad.subject {
        SubjectRef::NamedNode(n) => write_delimited(&mut hasher, 1, n.as_str()),
        SubjectRef::BlankNode(b) => write_delimited(&mut hasher, 2, b.as_str()),
    }
    write_delimited(&mut hasher, 1, quad.predicate.as_str());
    write_term(&mut hasher, quad.object);
    match quad.graph_name {
        GraphNameRef::NamedNode(n) => write_delimited(&mut hasher, 1, n.as_str()),
        GraphNameRef::BlankNode(b) => write_delimited(&mut hasher, 2, b.as_str()),
        GraphNameRef::DefaultGraph => hasher.write_u8(0),
    }
    hasher.finish128().as_u128()
}

/// Tracks which quads of a stream have been seen before.
///
/// The central operation is [`is_new`](StatementDeduplicator::is_new), which marks the quad as
/// seen and reports whether it was new. Implementations must never report a seen quad as seen
/// when it was not ("seen" answers are exact); a total deduplicator additionally never reports
/// a seen quad as new.
pub trait StatementDeduplicator: Send + Sync {
    /// True if this deduplicator guarantees that a seen quad is never reported as new again.
    fn is_total(&self) -> bool;

    /// Marks `quad` as seen and returns true if it had not been seen before.
    fn is_new(&self, quad: QuadRef<'_>) -> bool;
}

/// Exact deduplicator remembering every quad it has seen. Memory grows with the number of
/// distinct quads.
#[derive(Debug, Default)]
pub struct TotalDeduplicator {
    seen: Mutex<FxHashSet<u128>>,
}

impl TotalDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatementDeduplicator for TotalDeduplicator {
    fn is_total(&self) -> bool {
        true
    }

    fn is_new(&self, quad: QuadRef<'_>) -> bool {
        lock(&self.seen).insert(fingerprint(quad))
    }
}

/// Approximate deduplicator over a fixed-size direct-mapped cache.
///
/// The cache stores full fingerprints, so a "seen" answer is always correct; a colliding new
/// quad evicts the previous occupant, so a quad may be reported as new more than once.
/// Callers must therefore tolerate duplicated "new" answers, typically because a downstream
/// stage (a total deduplicator guarding a fixpoint, or an idempotent model insert) absorbs
/// them.
///
/// The cache is split into [`NUM_LOCKS`] independently locked shards to keep contention low
/// under parallel evaluation.
#[derive(Debug)]
pub struct PartialDeduplicator {
    shards: Vec<Mutex<Box<[u128]>>>,
    slots_per_shard: usize,
}

impl PartialDeduplicator {
    /// Creates a cache holding roughly `capacity` fingerprints.
    pub fn new(capacity: usize) -> Self {
        let slots_per_shard = capacity.div_ceil(NUM_LOCKS).max(1);
        let shards = (0..NUM_LOCKS)
            .map(|_| Mutex::new(vec![0_u128; slots_per_shard].into_boxed_slice()))
            .collect();
        Self {
            shards,
            slots_per_shard,
        }
    }
}

impl Default for PartialDeduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_PARTIAL_CAPACITY)
    }
}

impl StatementDeduplicator for PartialDeduplicator {
    fn is_total(&self) -> bool {
        false
    }

    fn is_new(&self, quad: QuadRef<'_>) -> bool {
        let fingerprint = fingerprint(quad);
        // An all-zero fingerprint would alias the empty-slot marker; remap it.
        let fingerprint = if fingerprint == 0 { 1 } else { fingerprint };
        let index = (fingerprint as u64 as usize) % (NUM_LOCKS * self.slots_per_shard);
        let shard = index % NUM_LOCKS;
        let slot = index / NUM_LOCKS;
        let mut cache = lock(&self.shards[shard]);
        if cache[slot] == fingerprint {
            false
        } else {
            cache[slot] = fingerprint;
            true
        }
    }
}

/// A handler stage that forwards only quads the deduplicator has not seen.
///
/// Borrows the deduplicator, so several stages created for parallel producers can share one.
pub struct DedupHandler<'a, H> {
    sink: H,
    deduplicator: &'a dyn StatementDeduplicator,
}

impl<'a, H: QuadHandler> DedupHandler<'a, H> {
    pub fn new(sink: H, deduplicator: &'a dyn StatementDeduplicator) -> Self {
        Self { sink, deduplicator }
    }
}

impl<H: QuadHandler> QuadHandler for DedupHandler<'_, H> {
    fn start(&mut self) -> Result<(), StorageError> {
        self.sink.start()
    }

    fn handle(&mut self, quad: Quad) -> Result<(), StorageError> {
        if self.deduplicator.is_new(quad.as_ref()) {
            self.sink.handle(quad)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), StorageError> {
        self.sink.finish()
    }
}
