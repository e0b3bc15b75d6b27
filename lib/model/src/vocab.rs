//! Vocabularies used to encode rulesets as RDF.

pub mod rr {
    //! Vocabulary for expressing DELETE/INSERT/WHERE rules as quads.

    use oxrdf::NamedNodeRef;

    pub const NAMESPACE: &str = "http://rdfpro.fbk.eu/ontologies/rules#";

    /// Class of rules evaluated repeatedly until fixpoint.
    pub const FIXPOINT_RULE: NamedNodeRef<'_> =
        NamedNodeRef::new_unchecked("http://rdfpro.fbk.eu/ontologies/rules#FixpointRule");
    /// Class of rules evaluated exactly once.
    pub const NON_FIXPOINT_RULE: NamedNodeRef<'_> =
        NamedNodeRef::new_unchecked("http://rdfpro.fbk.eu/ontologies/rules#NonFixpointRule");
    /// Generic rule class, an alias for [`FIXPOINT_RULE`].
    pub const RULE: NamedNodeRef<'_> =
        NamedNodeRef::new_unchecked("http://rdfpro.fbk.eu/ontologies/rules#Rule");

    /// Links a rule to the patterns it retracts.
    pub const DELETE: NamedNodeRef<'_> =
        NamedNodeRef::new_unchecked("http://rdfpro.fbk.eu/ontologies/rules#delete");
    /// Links a rule to the patterns it asserts.
    pub const INSERT: NamedNodeRef<'_> =
        NamedNodeRef::new_unchecked("http://rdfpro.fbk.eu/ontologies/rules#insert");
    /// Links a rule to the patterns it matches.
    pub const WHERE: NamedNodeRef<'_> =
        NamedNodeRef::new_unchecked("http://rdfpro.fbk.eu/ontologies/rules#where");
    /// Links a rule to its evaluation phase index.
    pub const PHASE: NamedNodeRef<'_> =
        NamedNodeRef::new_unchecked("http://rdfpro.fbk.eu/ontologies/rules#phase");
    /// Alias for [`INSERT`].
    pub const HEAD: NamedNodeRef<'_> =
        NamedNodeRef::new_unchecked("http://rdfpro.fbk.eu/ontologies/rules#head");
    /// Alias for [`WHERE`].
    pub const BODY: NamedNodeRef<'_> =
        NamedNodeRef::new_unchecked("http://rdfpro.fbk.eu/ontologies/rules#body");
}
