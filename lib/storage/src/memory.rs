use quadflow_common::QuadCollection;
use quadflow_model::{
    GraphName, GraphNameRef, NamedNode, NamedNodeRef, Quad, QuadRef, Subject, SubjectRef, Term,
    TermRef, ValueNormalizer,
};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;

/// A fully indexed in-memory quad collection.
///
/// Quads are shared through [`Arc`] between the primary set and one secondary index per quad
/// component, so each quad is stored once regardless of how many indexes point at it. All terms
/// are interned through the model's [`ValueNormalizer`] on insertion.
///
/// Reads take `&self` and may run concurrently; mutation requires `&mut self` and therefore
/// exclusive access, which matches how rule evaluation alternates parallel read rounds with
/// single-threaded commit steps.
#[derive(Debug, Default)]
pub struct MemoryQuadModel {
    quads: FxHashSet<Arc<Quad>>,
    by_subject: FxHashMap<Subject, FxHashSet<Arc<Quad>>>,
    by_predicate: FxHashMap<NamedNode, FxHashSet<Arc<Quad>>>,
    by_object: FxHashMap<Term, FxHashSet<Arc<Quad>>>,
    by_graph: FxHashMap<GraphName, FxHashSet<Arc<Quad>>>,
    normalizer: ValueNormalizer,
}

enum Candidates<'a> {
    All,
    Set(&'a FxHashSet<Arc<Quad>>),
    Empty,
}

/// Keeps the smallest index entry seen so far. False when the component has no index entry at
/// all, in which case nothing can match.
fn consider<'a>(
    best: &mut Option<&'a FxHashSet<Arc<Quad>>>,
    set: Option<&'a FxHashSet<Arc<Quad>>>,
) -> bool {
    match set {
        None => false,
        Some(set) => {
            if best.is_none_or(|b| set.len() < b.len()) {
                *best = Some(set);
            }
            true
        }
    }
}

impl MemoryQuadModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty model interning into an existing table.
    pub fn with_normalizer(normalizer: ValueNormalizer) -> Self {
        Self {
            normalizer,
            ..Self::default()
        }
    }

    /// Picks the smallest candidate set for the given bound components.
    fn candidates(
        &self,
        subject: Option<SubjectRef<'_>>,
        predicate: Option<NamedNodeRef<'_>>,
        object: Option<TermRef<'_>>,
        graph_name: Option<GraphNameRef<'_>>,
    ) -> Candidates<'_> {
        let mut best: Option<&FxHashSet<Arc<Quad>>> = None;
        if let Some(s) = subject {
            if !consider(&mut best, self.by_subject.get(&s.into_owned())) {
                return Candidates::Empty;
            }
        }
        if let Some(p) = predicate {
            if !consider(&mut best, self.by_predicate.get(&p.into_owned())) {
                return Candidates::Empty;
            }
        }
        if let Some(o) = object {
            if !consider(&mut best, self.by_object.get(&o.into_owned())) {
                return Candidates::Empty;
            }
        }
        if let Some(g) = graph_name {
            if !consider(&mut best, self.by_graph.get(&g.into_owned())) {
                return Candidates::Empty;
            }
        }
        best.map_or(Candidates::All, Candidates::Set)
    }

    pub(crate) fn has_subject(&self, subject: &Subject) -> bool {
        self.by_subject.contains_key(subject)
    }

    pub(crate) fn has_predicate(&self, predicate: &NamedNode) -> bool {
        self.by_predicate.contains_key(predicate)
    }

    pub(crate) fn has_object(&self, object: &Term) -> bool {
        self.by_object.contains_key(object)
    }

    pub(crate) fn has_graph_name(&self, graph_name: &GraphName) -> bool {
        self.by_graph.contains_key(graph_name)
    }
}

impl QuadCollection for MemoryQuadModel {
    fn len(&self) -> usize {
        self.quads.len()
    }

    fn contains(&self, quad: QuadRef<'_>) -> bool {
        self.quads.contains(&quad.into_owned())
    }

    fn insert(&mut self, quad: Quad) -> bool {
        let quad = self.normalizer.normalize_quad(&quad);
        if self.quads.contains(&quad) {
            return false;
        }
        let quad = Arc::new(quad);
        self.by_subject
            .entry(quad.subject.clone())
            .or_default()
            .insert(Arc::clone(&quad));
        self.by_predicate
            .entry(quad.predicate.clone())
            .or_default()
            .insert(Arc::clone(&quad));
        self.by_object
            .entry(quad.object.clone())
            .or_default()
            .insert(Arc::clone(&quad));
        self.by_graph
            .entry(quad.graph_name.clone())
            .or_default()
            .insert(Arc::clone(&quad));
        self.quads.insert(quad);
        true
    }

    fn remove(&mut self, quad: QuadRef<'_>) -> bool {
        let Some(stored) = self.quads.take(&quad.into_owned()) else {
            return false;
        };
        if let Some(set) = self.by_subject.get_mut(&stored.subject) {
            set.remove(&stored);
            if set.is_empty() {
                self.by_subject.remove(&stored.subject);
            }
        }
        if let Some(set) = self.by_predicate.get_mut(&stored.predicate) {
            set.remove(&stored);
            if set.is_empty() {
                self.by_predicate.remove(&stored.predicate);
            }
        }
        if let Some(set) = self.by_object.get_mut(&stored.object) {
            set.remove(&stored);
            if set.is_empty() {
                self.by_object.remove(&stored.object);
            }
        }
        if let Some(set) = self.by_graph.get_mut(&stored.graph_name) {
            set.remove(&stored);
            if set.is_empty() {
                self.by_graph.remove(&stored.graph_name);
            }
        }
        true
    }

    fn matching<'a>(
        &'a self,
        subject: Option<SubjectRef<'a>>,
        predicate: Option<NamedNodeRef<'a>>,
        object: Option<TermRef<'a>>,
        graph_name: Option<GraphNameRef<'a>>,
    ) -> Box<dyn Iterator<Item = QuadRef<'a>> + 'a> {
        let candidates = match self.candidates(subject, predicate, object, graph_name) {
            Candidates::All => &self.quads,
            Candidates::Set(set) => set,
            Candidates::Empty => return Box::new(std::iter::empty()),
        };
        Box::new(candidates.iter().map(|q| (**q).as_ref()).filter(move |q| {
            subject.is_none_or(|s| q.subject == s)
                && predicate.is_none_or(|p| q.predicate == p)
                && object.is_none_or(|o| q.object == o)
                && graph_name.is_none_or(|g| q.graph_name == g)
        }))
    }

    fn estimate(
        &self,
        subject: Option<SubjectRef<'_>>,
        predicate: Option<NamedNodeRef<'_>>,
        object: Option<TermRef<'_>>,
        graph_name: Option<GraphNameRef<'_>>,
    ) -> usize {
        match self.candidates(subject, predicate, object, graph_name) {
            Candidates::All => self.quads.len(),
            Candidates::Set(set) => set.len(),
            Candidates::Empty => 0,
        }
    }

    fn normalizer(&self) -> ValueNormalizer {
        self.normalizer.clone()
    }
}

impl Extend<Quad> for MemoryQuadModel {
    fn extend<T: IntoIterator<Item = Quad>>(&mut self, iter: T) {
        for quad in iter {
            self.insert(quad);
        }
    }
}

impl FromIterator<Quad> for MemoryQuadModel {
    fn from_iter<T: IntoIterator<Item = Quad>>(iter: T) -> Self {
        let mut model = Self::new();
        model.extend(iter);
        model
    }
}

#[cfg(test)]
#[allow(clippy::panic_in_result_fn)]
mod tests {
    use super::*;

    fn quad(s: &str, p: &str, o: &str) -> Quad {
        Quad {
            subject: NamedNode::new(s).unwrap().into(),
            predicate: NamedNode::new(p).unwrap(),
            object: NamedNode::new(o).unwrap().into(),
            graph_name: GraphName::DefaultGraph,
        }
    }

    #[test]
    fn insert_is_idempotent() {
        let mut model = MemoryQuadModel::new();
        let q = quad("http://e.com/a", "http://e.com/p", "http://e.com/b");
        assert!(model.insert(q.clone()));
        assert!(!model.insert(q.clone()));
        assert_eq!(model.len(), 1);
        assert!(model.contains(q.as_ref()));
    }

    #[test]
    fn remove_cleans_indexes() {
        let mut model = MemoryQuadModel::new();
        let q = quad("http://e.com/a", "http://e.com/p", "http://e.com/b");
        model.insert(q.clone());
        assert!(model.remove(q.as_ref()));
        assert!(!model.remove(q.as_ref()));
        assert!(model.is_empty());
        assert_eq!(model.matching(None, None, None, None).count(), 0);
    }

    #[test]
    fn matching_filters_on_all_bound_components() {
        let mut model = MemoryQuadModel::new();
        let q1 = quad("http://e.com/a", "http://e.com/p", "http://e.com/b");
        let q2 = quad("http://e.com/a", "http://e.com/p", "http://e.com/c");
        let q3 = quad("http://e.com/b", "http://e.com/q", "http://e.com/c");
        model.extend([q1.clone(), q2.clone(), q3.clone()]);

        let a = NamedNode::new("http://e.com/a").unwrap();
        let found: Vec<_> = model
            .matching(Some(a.as_ref().into()), None, None, None)
            .map(QuadRef::into_owned)
            .collect();
        assert_eq!(found.len(), 2);
        assert!(found.contains(&q1) && found.contains(&q2));

        let c = NamedNode::new("http://e.com/c").unwrap();
        let found: Vec<_> = model
            .matching(
                Some(a.as_ref().into()),
                None,
                Some(c.as_ref().into()),
                None,
            )
            .map(QuadRef::into_owned)
            .collect();
        assert_eq!(found, vec![q2]);
    }

    #[test]
    fn default_graph_binding_is_exact() {
        let mut model = MemoryQuadModel::new();
        let g = NamedNode::new("http://e.com/g").unwrap();
        let mut named = quad("http://e.com/a", "http://e.com/p", "http://e.com/b");
        named.graph_name = g.clone().into();
        let default = quad("http://e.com/a", "http://e.com/p", "http://e.com/b");
        model.extend([named.clone(), default.clone()]);

        let found: Vec<_> = model
            .matching(None, None, None, Some(GraphNameRef::DefaultGraph))
            .map(QuadRef::into_owned)
            .collect();
        assert_eq!(found, vec![default]);
        assert_eq!(model.matching(None, None, None, None).count(), 2);
    }

    #[test]
    fn matching_with_all_components_bound() {
        let mut model = MemoryQuadModel::new();
        let g = NamedNode::new("http://e.com/g").unwrap();
        let mut named = quad("http://e.com/a", "http://e.com/p", "http://e.com/b");
        named.graph_name = g.clone().into();
        model.insert(named.clone());
        model.insert(quad("http://e.com/a", "http://e.com/p", "http://e.com/b"));
        model.insert(quad("http://e.com/a", "http://e.com/p", "http://e.com/c"));

        let a = NamedNode::new("http://e.com/a").unwrap();
        let p = NamedNode::new("http://e.com/p").unwrap();
        let b = NamedNode::new("http://e.com/b").unwrap();
        let found: Vec<_> = model
            .matching(
                Some(a.as_ref().into()),
                Some(p.as_ref().into()),
                Some(b.as_ref().into()),
                Some(g.as_ref().into()),
            )
            .map(QuadRef::into_owned)
            .collect();
        assert_eq!(found, vec![named]);
    }

    #[test]
    fn estimate_bounds_matching() {
        let mut model = MemoryQuadModel::new();
        model.extend([
            quad("http://e.com/a", "http://e.com/p", "http://e.com/b"),
            quad("http://e.com/a", "http://e.com/p", "http://e.com/c"),
            quad("http://e.com/b", "http://e.com/q", "http://e.com/c"),
        ]);
        let a = NamedNode::new("http://e.com/a").unwrap();
        let q = NamedNode::new("http://e.com/q").unwrap();
        let estimate = model.estimate(Some(a.as_ref().into()), Some(q.as_ref().into()), None, None);
        let actual = model
            .matching(Some(a.as_ref().into()), Some(q.as_ref().into()), None, None)
            .count();
        assert!(estimate >= actual);
        let missing = NamedNode::new("http://e.com/missing").unwrap();
        assert_eq!(
            model.estimate(Some(missing.as_ref().into()), None, None, None),
            0
        );
    }
}
