use quadflow_model::{
    quad_component, GraphName, GraphNamePattern, NamedNode, NamedNodePattern,
    QuadPattern, QuadRef, StatementComponent, Subject, Term, TermPattern, TermRef,
    ValueNormalizer, COMPONENT_GRAPH, COMPONENT_MASKS, COMPONENT_OBJECT, COMPONENT_PREDICATE,
    COMPONENT_SUBJECT,
};
use rustc_hash::{FxHashMap, FxHasher};
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

/// Mask probe order, least selective first. Mask 0 (the wildcard pattern) comes first so a
/// match-all matcher answers quickly.
const MASK_ORDER: [u8; COMPONENT_MASKS] = [0, 8, 2, 4, 1, 10, 12, 9, 6, 3, 5, 14, 11, 13, 7, 15];

/// A value that can be rewritten against a term interning table.
pub trait NormalizeValue: Sized {
    fn normalize_value(&self, normalizer: &ValueNormalizer) -> Self;
}

impl NormalizeValue for () {
    fn normalize_value(&self, _normalizer: &ValueNormalizer) -> Self {}
}

/// Either a position of the matched quad or a constant term, as referenced by a
/// [`ResidualFilter`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FilterValue {
    Component(StatementComponent),
    Constant(Term),
}

impl FilterValue {
    fn resolve<'a>(&'a self, quad: QuadRef<'a>) -> Option<TermRef<'a>> {
        match self {
            Self::Component(c) => quad_component(quad, *c),
            Self::Constant(t) => Some(t.as_ref()),
        }
    }

    fn normalize(&self, normalizer: &ValueNormalizer) -> Self {
        match self {
            Self::Component(c) => Self::Component(*c),
            Self::Constant(t) => Self::Constant(normalizer.normalize_term(t)),
        }
    }
}

/// A condition on a matched quad that the constant tuple of a pattern cannot express, such as
/// an inequality between two components. Filters guard payload runs inside a
/// [`StatementMatcher`].
///
/// Resolving the graph position of a default-graph quad yields no term; two absent values
/// compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResidualFilter {
    Equal(FilterValue, FilterValue),
    NotEqual(FilterValue, FilterValue),
    All(Vec<ResidualFilter>),
}

impl ResidualFilter {
    pub fn test(&self, quad: QuadRef<'_>) -> bool {
        match self {
            Self::Equal(a, b) => a.resolve(quad) == b.resolve(quad),
            Self::NotEqual(a, b) => a.resolve(quad) != b.resolve(quad),
            Self::All(filters) => filters.iter().all(|f| f.test(quad)),
        }
    }

    fn normalize(&self, normalizer: &ValueNormalizer) -> Self {
        match self {
            Self::Equal(a, b) => Self::Equal(a.normalize(normalizer), b.normalize(normalizer)),
            Self::NotEqual(a, b) => {
                Self::NotEqual(a.normalize(normalizer), b.normalize(normalizer))
            }
            Self::All(filters) => {
                Self::All(filters.iter().map(|f| f.normalize(normalizer)).collect())
            }
        }
    }
}

/// The constant components of a quad pattern; variable positions are `None`. The default graph
/// is a constant, not a wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
struct PatternConstants {
    subject: Option<Subject>,
    predicate: Option<NamedNode>,
    object: Option<Term>,
    graph: Option<GraphName>,
}

impl PatternConstants {
    fn from_pattern(pattern: &QuadPattern) -> Self {
        Self {
            subject: match &pattern.subject {
                TermPattern::NamedNode(n) => Some(n.clone().into()),
                TermPattern::BlankNode(b) => Some(b.clone().into()),
                TermPattern::Literal(_) | TermPattern::Variable(_) => None,
            },
            predicate: match &pattern.predicate {
                NamedNodePattern::NamedNode(n) => Some(n.clone()),
                NamedNodePattern::Variable(_) => None,
            },
            object: match &pattern.object {
                TermPattern::NamedNode(n) => Some(n.clone().into()),
                TermPattern::BlankNode(b) => Some(Term::BlankNode(b.clone())),
                TermPattern::Literal(l) => Some(l.clone().into()),
                TermPattern::Variable(_) => None,
            },
            graph: match &pattern.graph_name {
                GraphNamePattern::NamedNode(n) => Some(n.clone().into()),
                GraphNamePattern::DefaultGraph => Some(GraphName::DefaultGraph),
                GraphNamePattern::Variable(_) => None,
            },
        }
    }

    fn mask(&self) -> u8 {
        let mut mask = 0;
        if self.subject.is_some() {
            mask |= COMPONENT_SUBJECT;
        }
        if self.predicate.is_some() {
            mask |= COMPONENT_PREDICATE;
        }
        if self.object.is_some() {
            mask |= COMPONENT_OBJECT;
        }
        if self.graph.is_some() {
            mask |= COMPONENT_GRAPH;
        }
        mask
    }

    /// Hashes the constant tuple the same way [`masked_hash`] hashes a quad, so that a pattern
    /// and the quads it matches land in the same table slot.
    fn masked_hash(&self) -> u64 {
        let mut hasher = FxHasher::default();
        if let Some(s) = &self.subject {
            s.as_ref().hash(&mut hasher);
        }
        if let Some(p) = &self.predicate {
            p.as_ref().hash(&mut hasher);
        }
        if let Some(o) = &self.object {
            o.as_ref().hash(&mut hasher);
        }
        if let Some(g) = &self.graph {
            g.as_ref().hash(&mut hasher);
        }
        hasher.finish()
    }

    fn matches(&self, quad: QuadRef<'_>) -> bool {
        self.subject.as_ref().is_none_or(|s| s.as_ref() == quad.subject)
            && self
                .predicate
                .as_ref()
                .is_none_or(|p| p.as_ref() == quad.predicate)
            && self.object.as_ref().is_none_or(|o| o.as_ref() == quad.object)
            && self
                .graph
                .as_ref()
                .is_none_or(|g| g.as_ref() == quad.graph_name)
    }

    fn normalize(&self, normalizer: &ValueNormalizer) -> Self {
        Self {
            subject: self
                .subject
                .as_ref()
                .map(|s| normalizer.normalize_subject(s)),
            predicate: self
                .predicate
                .as_ref()
                .map(|p| normalizer.normalize_named_node(p)),
            object: self.object.as_ref().map(|o| normalizer.normalize_term(o)),
            graph: self
                .graph
                .as_ref()
                .map(|g| normalizer.normalize_graph_name(g)),
        }
    }
}

fn masked_hash(quad: QuadRef<'_>, mask: u8) -> u64 {
    let mut hasher = FxHasher::default();
    if mask & COMPONENT_SUBJECT != 0 {
        quad.subject.hash(&mut hasher);
    }
    if mask & COMPONENT_PREDICATE != 0 {
        quad.predicate.hash(&mut hasher);
    }
    if mask & COMPONENT_OBJECT != 0 {
        quad.object.hash(&mut hasher);
    }
    if mask & COMPONENT_GRAPH != 0 {
        quad.graph_name.hash(&mut hasher);
    }
    hasher.finish()
}

/// One distinct constant tuple with its payload runs, each run guarded by an optional filter.
#[derive(Debug, Clone)]
struct PatternEntry<V> {
    constants: PatternConstants,
    groups: Vec<(Option<ResidualFilter>, Vec<V>)>,
}

/// Open-addressing table for one mask. A slot of 0 is empty; otherwise the low 12 bits hold a
/// hash residue for cheap rejection and the high bits hold the entry index plus one.
#[derive(Debug, Clone)]
struct MaskTable {
    mask: u8,
    slots: Box<[u64]>,
}

impl MaskTable {
    /// Probes the table for an entry whose constants match `quad`. Constant tuples are unique
    /// per mask, so at most one entry can match.
    fn find<'a, V>(&self, entries: &'a [PatternEntry<V>], quad: QuadRef<'_>) -> Option<&'a PatternEntry<V>> {
        let hash = masked_hash(quad, self.mask);
        let len = self.slots.len();
        let mut slot = (hash % len as u64) as usize;
        while self.slots[slot] != 0 {
            let cell = self.slots[slot];
            if (cell ^ hash) & 0xFFF == 0 {
                let entry = &entries[(cell >> 12) as usize - 1];
                if entry.constants.matches(quad) {
                    return Some(entry);
                }
            }
            slot += 1;
            if slot == len {
                slot = 0;
            }
        }
        None
    }
}

#[derive(Debug, Clone)]
struct MatcherData<V> {
    tables: Vec<MaskTable>,
    entries: Vec<PatternEntry<V>>,
    match_all: bool,
}

impl<V: NormalizeValue> MatcherData<V> {
    /// Rewrites constants, filters and payloads against the interning table. Normalization maps
    /// every term to an equal canonical instance, so hashes are unchanged and the tables can be
    /// reused as they are.
    fn normalize(&self, normalizer: &ValueNormalizer) -> Self
    where
        V: Clone,
    {
        Self {
            tables: self.tables.clone(),
            entries: self
                .entries
                .iter()
                .map(|entry| PatternEntry {
                    constants: entry.constants.normalize(normalizer),
                    groups: entry
                        .groups
                        .iter()
                        .map(|(filter, values)| {
                            (
                                filter.as_ref().map(|f| f.normalize(normalizer)),
                                values
                                    .iter()
                                    .map(|v| v.normalize_value(normalizer))
                                    .collect(),
                            )
                        })
                        .collect(),
                })
                .collect(),
            match_all: self.match_all,
        }
    }
}

/// Matches quads against a set of quad patterns and maps them to payload values.
///
/// Patterns are grouped by their constant-presence mask. Each mask owns a small
/// open-addressing hash table keyed by the pattern's constant tuple; matching a quad probes
/// one table per distinct mask, hashing only the components the mask marks as constant. A slot
/// stores a 12-bit hash residue next to the entry index, so non-matching entries are usually
/// rejected without comparing terms.
///
/// A matcher can be [`normalize`](Self::normalize)d against a model's interning table; the
/// rewrite is performed lazily on first use and at most once.
#[derive(Debug)]
pub struct StatementMatcher<V> {
    base: MatcherData<V>,
    normalizer: Option<ValueNormalizer>,
    normalized: OnceLock<MatcherData<V>>,
}

impl<V: Clone + PartialEq + NormalizeValue> StatementMatcher<V> {
    pub fn builder() -> StatementMatcherBuilder<V> {
        StatementMatcherBuilder::new()
    }

    fn data(&self) -> &MatcherData<V> {
        match &self.normalizer {
            Some(n) => self.normalized.get_or_init(|| self.base.normalize(n)),
            None => &self.base,
        }
    }

    /// Returns a matcher backed by the same patterns whose constants are canonicalized through
    /// `normalizer` on first use.
    #[must_use]
    pub fn normalize(&self, normalizer: &ValueNormalizer) -> Self {
        Self {
            base: self.base.clone(),
            normalizer: Some(normalizer.clone()),
            normalized: OnceLock::new(),
        }
    }

    /// True if an unguarded wildcard pattern is present, in which case every quad matches.
    pub fn match_all(&self) -> bool {
        self.base.match_all
    }

    /// Tests whether any pattern matches `quad`, honoring residual filters.
    pub fn matches(&self, quad: QuadRef<'_>) -> bool {
        if self.base.match_all {
            return true;
        }
        let data = self.data();
        data.tables.iter().any(|table| {
            table
                .find(&data.entries, quad)
                .is_some_and(|entry| {
                    entry
                        .groups
                        .iter()
                        .any(|(filter, _)| filter.as_ref().is_none_or(|f| f.test(quad)))
                })
        })
    }

    /// Collects the payloads of every pattern matching `quad`, honoring residual filters.
    pub fn map(&self, quad: QuadRef<'_>) -> Vec<&V> {
        let data = self.data();
        let mut result = Vec::new();
        for table in &data.tables {
            if let Some(entry) = table.find(&data.entries, quad) {
                for (filter, values) in &entry.groups {
                    if filter.as_ref().is_none_or(|f| f.test(quad)) {
                        result.extend(values.iter());
                    }
                }
            }
        }
        result
    }
}

/// Accumulates patterns before freezing them into a [`StatementMatcher`].
#[derive(Debug)]
pub struct StatementMatcherBuilder<V> {
    patterns: FxHashMap<PatternConstants, Vec<(Option<ResidualFilter>, Vec<V>)>>,
}

impl<V: Clone + PartialEq> StatementMatcherBuilder<V> {
    pub fn new() -> Self {
        Self {
            patterns: FxHashMap::default(),
        }
    }

    /// Registers `pattern` with an optional residual filter and the payloads it maps to.
    /// Variable positions of the pattern are wildcards. Equal payloads registered twice under
    /// the same pattern and filter are stored once.
    pub fn add(
        &mut self,
        pattern: &QuadPattern,
        filter: Option<ResidualFilter>,
        values: impl IntoIterator<Item = V>,
    ) -> &mut Self {
        let constants = PatternConstants::from_pattern(pattern);
        let groups = self.patterns.entry(constants).or_default();
        let group = if let Some(i) = groups.iter().position(|(f, _)| *f == filter) {
            &mut groups[i].1
        } else {
            groups.push((filter, Vec::new()));
            let last = groups.len() - 1;
            &mut groups[last].1
        };
        for value in values {
            if !group.contains(&value) {
                group.push(value);
            }
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn build(self) -> StatementMatcher<V> {
        let mut by_mask: [Vec<(PatternConstants, Vec<(Option<ResidualFilter>, Vec<V>)>)>;
            COMPONENT_MASKS] = std::array::from_fn(|_| Vec::new());
        let mut match_all = false;
        for (constants, groups) in self.patterns {
            let mask = constants.mask();
            if mask == 0 && groups.iter().any(|(filter, _)| filter.is_none()) {
                match_all = true;
            }
            by_mask[mask as usize].push((constants, groups));
        }

        let mut tables = Vec::new();
        let mut entries = Vec::new();
        for mask in MASK_ORDER {
            let patterns = std::mem::take(&mut by_mask[mask as usize]);
            if patterns.is_empty() {
                continue;
            }
            // Load factor 0.66.
            let len = patterns.len() + (patterns.len() / 2).max(1);
            let mut slots = vec![0_u64; len].into_boxed_slice();
            for (constants, groups) in patterns {
                let hash = constants.masked_hash();
                entries.push(PatternEntry { constants, groups });
                let cell = (entries.len() as u64) << 12 | hash & 0xFFF;
                let mut slot = (hash % len as u64) as usize;
                while slots[slot] != 0 {
                    slot += 1;
                    if slot == len {
                        slot = 0;
                    }
                }
                slots[slot] = cell;
            }
            tables.push(MaskTable { mask, slots });
        }

        StatementMatcher {
            base: MatcherData {
                tables,
                entries,
                match_all,
            },
            normalizer: None,
            normalized: OnceLock::new(),
        }
    }
}

impl<V: Clone + PartialEq> Default for StatementMatcherBuilder<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quadflow_model::{GraphName, Literal, Quad, Variable};

    impl NormalizeValue for u8 {
        fn normalize_value(&self, _normalizer: &ValueNormalizer) -> Self {
            *self
        }
    }

    impl NormalizeValue for i32 {
        fn normalize_value(&self, _normalizer: &ValueNormalizer) -> Self {
            *self
        }
    }

    fn iri(s: &str) -> NamedNode {
        NamedNode::new(format!("http://example.com/{s}")).unwrap()
    }

    fn var(s: &str) -> Variable {
        Variable::new(s).unwrap()
    }

    fn quad(s: &str, p: &str, o: &str, g: Option<&str>) -> Quad {
        Quad {
            subject: iri(s).into(),
            predicate: iri(p),
            object: iri(o).into(),
            graph_name: g.map_or(GraphName::DefaultGraph, |g| iri(g).into()),
        }
    }

    /// Builds the pattern that binds exactly the components selected by `mask` to the
    /// components of `base`.
    fn pattern_for_mask(base: &Quad, mask: u8) -> QuadPattern {
        QuadPattern {
            subject: if mask & COMPONENT_SUBJECT != 0 {
                match &base.subject {
                    Subject::NamedNode(n) => TermPattern::NamedNode(n.clone()),
                    Subject::BlankNode(b) => TermPattern::BlankNode(b.clone()),
                }
            } else {
                TermPattern::Variable(var("s"))
            },
            predicate: if mask & COMPONENT_PREDICATE != 0 {
                NamedNodePattern::NamedNode(base.predicate.clone())
            } else {
                NamedNodePattern::Variable(var("p"))
            },
            object: if mask & COMPONENT_OBJECT != 0 {
                match &base.object {
                    Term::NamedNode(n) => TermPattern::NamedNode(n.clone()),
                    Term::BlankNode(b) => TermPattern::BlankNode(b.clone()),
                    Term::Literal(l) => TermPattern::Literal(l.clone()),
                }
            } else {
                TermPattern::Variable(var("o"))
            },
            graph_name: if mask & COMPONENT_GRAPH != 0 {
                match &base.graph_name {
                    GraphName::NamedNode(n) => GraphNamePattern::NamedNode(n.clone()),
                    GraphName::DefaultGraph => GraphNamePattern::DefaultGraph,
                    GraphName::BlankNode(_) => unreachable!(),
                }
            } else {
                GraphNamePattern::Variable(var("g"))
            },
        }
    }

    #[test]
    fn all_sixteen_masks_are_sound() {
        let base = quad("a", "p", "b", Some("g"));
        // Differs from `base` in every component.
        let other = quad("x", "q", "y", None);
        for mask in 0..COMPONENT_MASKS as u8 {
            let mut builder = StatementMatcher::builder();
            builder.add(&pattern_for_mask(&base, mask), None, [mask]);
            let matcher = builder.build();
            assert!(matcher.matches(base.as_ref()), "mask {mask}");
            assert_eq!(matcher.map(base.as_ref()), vec![&mask], "mask {mask}");
            if mask != 0 {
                assert!(!matcher.matches(other.as_ref()), "mask {mask}");
                assert!(matcher.map(other.as_ref()).is_empty(), "mask {mask}");
            } else {
                assert!(matcher.matches(other.as_ref()));
            }
        }
    }

    #[test]
    fn distinct_patterns_of_one_mask_stay_separate() {
        let q1 = quad("a", "p", "b", None);
        let q2 = quad("a", "q", "b", None);
        let mut builder = StatementMatcher::builder();
        builder.add(&pattern_for_mask(&q1, COMPONENT_PREDICATE), None, [1]);
        builder.add(&pattern_for_mask(&q2, COMPONENT_PREDICATE), None, [2]);
        let matcher = builder.build();
        assert_eq!(matcher.map(q1.as_ref()), vec![&1]);
        assert_eq!(matcher.map(q2.as_ref()), vec![&2]);
        assert!(matcher.map(quad("a", "r", "b", None).as_ref()).is_empty());
    }

    #[test]
    fn payloads_accumulate_and_deduplicate() {
        let q = quad("a", "p", "b", None);
        let pattern = pattern_for_mask(&q, COMPONENT_PREDICATE);
        let mut builder = StatementMatcher::builder();
        builder.add(&pattern, None, [1, 2]);
        builder.add(&pattern, None, [2, 3]);
        let matcher = builder.build();
        let mut payloads: Vec<i32> = matcher.map(q.as_ref()).into_iter().copied().collect();
        payloads.sort_unstable();
        assert_eq!(payloads, vec![1, 2, 3]);
    }

    #[test]
    fn match_all_requires_unguarded_wildcard() {
        let q = quad("a", "p", "b", None);
        let wildcard = pattern_for_mask(&q, 0);

        let mut builder = StatementMatcher::builder();
        builder.add(&wildcard, None, [0]);
        assert!(builder.build().match_all());

        let mut builder = StatementMatcher::builder();
        let filter = ResidualFilter::NotEqual(
            FilterValue::Component(StatementComponent::Subject),
            FilterValue::Component(StatementComponent::Object),
        );
        builder.add(&wildcard, Some(filter), [0]);
        let matcher = builder.build();
        assert!(!matcher.match_all());
        assert!(matcher.matches(q.as_ref()));
        assert!(!matcher.matches(quad("a", "p", "a", None).as_ref()));
    }

    #[test]
    fn filters_guard_payload_runs() {
        let q = quad("a", "p", "b", None);
        let pattern = pattern_for_mask(&q, COMPONENT_PREDICATE);
        let eq = ResidualFilter::Equal(
            FilterValue::Component(StatementComponent::Object),
            FilterValue::Constant(iri("b").into()),
        );
        let mut builder = StatementMatcher::builder();
        builder.add(&pattern, None, [1]);
        builder.add(&pattern, Some(eq), [2]);
        let matcher = builder.build();

        let mut payloads: Vec<i32> = matcher.map(q.as_ref()).into_iter().copied().collect();
        payloads.sort_unstable();
        assert_eq!(payloads, vec![1, 2]);
        assert_eq!(matcher.map(quad("a", "p", "c", None).as_ref()), vec![&1]);
    }

    #[test]
    fn default_graph_filter_values_compare_equal() {
        let filter = ResidualFilter::Equal(
            FilterValue::Component(StatementComponent::Graph),
            FilterValue::Component(StatementComponent::Graph),
        );
        assert!(filter.test(quad("a", "p", "b", None).as_ref()));
    }

    #[test]
    fn normalization_preserves_matching() {
        let q = quad("a", "p", "b", Some("g"));
        let mut builder = StatementMatcher::builder();
        builder.add(&pattern_for_mask(&q, 0b1111), None, [7]);
        let matcher = builder.build().normalize(&ValueNormalizer::new());
        assert_eq!(matcher.map(q.as_ref()), vec![&7]);
        assert!(!matcher.matches(quad("a", "p", "b", None).as_ref()));
    }

    #[test]
    fn literal_objects_match() {
        let q = Quad {
            subject: iri("a").into(),
            predicate: iri("p"),
            object: Literal::from(42).into(),
            graph_name: GraphName::DefaultGraph,
        };
        let pattern = QuadPattern {
            subject: TermPattern::Variable(var("s")),
            predicate: NamedNodePattern::NamedNode(iri("p")),
            object: TermPattern::Literal(Literal::from(42)),
            graph_name: GraphNamePattern::Variable(var("g")),
        };
        let mut builder = StatementMatcher::builder();
        builder.add(&pattern, None, [()]);
        let matcher = builder.build();
        assert!(matcher.matches(q.as_ref()));
    }
}
