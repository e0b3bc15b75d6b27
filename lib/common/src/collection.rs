use quadflow_model::{
    GraphNameRef, NamedNodeRef, Quad, QuadRef, SubjectRef, TermRef, ValueNormalizer,
};

/// An indexed, mutable collection of quads.
///
/// This is the abstraction rule evaluation runs against: phases scan it with partially bound
/// patterns, estimate pattern cardinalities to order joins, and apply batched insertions and
/// deletions. Implementations must support concurrent reads (`&self` methods are called from
/// multiple worker threads at once); mutation happens single-threaded between evaluation
/// rounds.
pub trait QuadCollection: Send + Sync {
    /// Returns the total number of quads.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains(&self, quad: QuadRef<'_>) -> bool;

    /// Inserts a quad, returning true if it was not present before.
    fn insert(&mut self, quad: Quad) -> bool;

    /// Removes a quad, returning true if it was present.
    fn remove(&mut self, quad: QuadRef<'_>) -> bool;

    /// Iterates over the quads matching the given partially bound pattern.
    ///
    /// `None` positions are wildcards. A bound graph position of
    /// [`GraphNameRef::DefaultGraph`] matches exactly the default graph, while a wildcard
    /// matches quads in any graph including the default one.
    fn matching<'a>(
        &'a self,
        subject: Option<SubjectRef<'a>>,
        predicate: Option<NamedNodeRef<'a>>,
        object: Option<TermRef<'a>>,
        graph_name: Option<GraphNameRef<'a>>,
    ) -> Box<dyn Iterator<Item = QuadRef<'a>> + 'a>;

    /// Returns an upper bound on the number of quads [`matching`](QuadCollection::matching)
    /// would yield for the same pattern. Used to order joins, so cheap beats tight.
    fn estimate(
        &self,
        subject: Option<SubjectRef<'_>>,
        predicate: Option<NamedNodeRef<'_>>,
        object: Option<TermRef<'_>>,
        graph_name: Option<GraphNameRef<'_>>,
    ) -> usize;

    /// Iterates over all quads.
    fn iter(&self) -> Box<dyn Iterator<Item = QuadRef<'_>> + '_> {
        self.matching(None, None, None, None)
    }

    /// Returns a handle to the term interning table of this collection.
    ///
    /// Structures queried against this collection (matchers, templates) normalize their
    /// constants through this handle so that comparisons run against shared term instances.
    fn normalizer(&self) -> ValueNormalizer;
}
