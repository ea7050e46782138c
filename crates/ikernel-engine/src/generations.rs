//! Versioned sets of compiled types.
//!
//! Redefining a type does not invalidate values created from its older
//! definition: each redefinition layers a new immutable generation on
//! the chain, and name resolution walks newest to oldest, stopping at
//! the first owner. Unchanged names keep resolving through older
//! generations.

use std::{collections::BTreeMap, sync::Arc};

use crate::traits::TypeResolver;

/// An immutable set of compiled types layered on a parent generation.
pub struct TypeGeneration {
    id: u64,
    types: BTreeMap<String, Vec<u8>>,
    parent: Option<Arc<TypeGeneration>>,
}

impl TypeGeneration {
    /// Generation id; newer generations have larger ids.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Names owned by this generation (excluding parents).
    #[must_use]
    pub fn owned_names(&self) -> Vec<&str> {
        self.types.keys().map(String::as_str).collect()
    }

    fn lookup(&self, name: &str) -> Option<&[u8]> {
        let mut node = self;
        loop {
            if let Some(bytes) = node.types.get(name) {
                return Some(bytes);
            }
            node = node.parent.as_deref()?;
        }
    }
}

/// Append-only chain of type generations.
#[derive(Default)]
pub struct GenerationChain {
    head: Option<Arc<TypeGeneration>>,
    next_id: u64,
}

impl GenerationChain {
    /// Create an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self {
            head: None,
            next_id: 1,
        }
    }

    /// Resolve a type name, walking newest to oldest.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<&[u8]> {
        self.head.as_deref()?.lookup(name)
    }

    /// The id of the newest generation, if any.
    #[must_use]
    pub fn head_id(&self) -> Option<u64> {
        self.head.as_deref().map(TypeGeneration::id)
    }

    /// Number of generations in the chain.
    #[must_use]
    pub fn generation_count(&self) -> usize {
        let mut count = 0;
        let mut node = self.head.as_deref();
        while let Some(generation) = node {
            count += 1;
            node = generation.parent.as_deref();
        }
        count
    }

    /// Fold a compilation's types into the chain.
    ///
    /// Byte-identical redefinitions are ignored so that live values of
    /// the type keep their identity. When at least one name carries new
    /// bytecode, exactly one generation is created, scoped to the
    /// changed names. Returns how many names changed.
    pub fn absorb(&mut self, types: &BTreeMap<String, Vec<u8>>) -> usize {
        let mut changed = BTreeMap::new();
        for (name, bytes) in types {
            if self.resolve(name) == Some(bytes.as_slice()) {
                continue;
            }
            changed.insert(name.clone(), bytes.clone());
        }
        if changed.is_empty() {
            return 0;
        }

        let count = changed.len();
        let generation = Arc::new(TypeGeneration {
            id: self.next_id,
            types: changed,
            parent: self.head.take(),
        });
        tracing::debug!(
            id = generation.id,
            names = ?generation.owned_names(),
            "new type generation"
        );
        self.next_id += 1;
        self.head = Some(generation);
        count
    }
}

impl TypeResolver for GenerationChain {
    fn resolve_type(&self, name: &str) -> Option<&[u8]> {
        self.resolve(name)
    }
}

/// Loading context for a single submission: its transient compiled
/// types in front of the persistent chain.
pub struct ScopedResolver<'a> {
    pub chain: &'a GenerationChain,
    pub transient: &'a BTreeMap<String, Vec<u8>>,
}

impl TypeResolver for ScopedResolver<'_> {
    fn resolve_type(&self, name: &str) -> Option<&[u8]> {
        self.transient
            .get(name)
            .map(Vec::as_slice)
            .or_else(|| self.chain.resolve(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types(entries: &[(&str, &[u8])]) -> BTreeMap<String, Vec<u8>> {
        entries
            .iter()
            .map(|(name, bytes)| ((*name).to_string(), bytes.to_vec()))
            .collect()
    }

    #[test]
    fn test_identical_redefinition_reuses_generation() {
        let mut chain = GenerationChain::new();
        assert_eq!(chain.absorb(&types(&[("A", b"v1")])), 1);
        assert_eq!(chain.absorb(&types(&[("A", b"v1")])), 0);
        assert_eq!(chain.generation_count(), 1);
    }

    #[test]
    fn test_changed_bytecode_creates_one_generation() {
        let mut chain = GenerationChain::new();
        chain.absorb(&types(&[("A", b"v1"), ("B", b"v1")]));
        assert_eq!(chain.generation_count(), 1);

        // Only A changes; the new generation is scoped to it.
        assert_eq!(chain.absorb(&types(&[("A", b"v2"), ("B", b"v1")])), 1);
        assert_eq!(chain.generation_count(), 2);
        assert_eq!(chain.resolve("A"), Some(b"v2".as_slice()));
    }

    #[test]
    fn test_unchanged_name_resolves_through_older_generation() {
        let mut chain = GenerationChain::new();
        chain.absorb(&types(&[("A", b"v1"), ("B", b"v1")]));
        chain.absorb(&types(&[("A", b"v2")]));

        assert_eq!(chain.resolve("B"), Some(b"v1".as_slice()));
        assert_eq!(chain.resolve("A"), Some(b"v2".as_slice()));
    }

    #[test]
    fn test_scoped_resolver_prefers_transient_types() {
        let mut chain = GenerationChain::new();
        chain.absorb(&types(&[("A", b"chained")]));

        let transient = types(&[("A", b"transient"), ("T", b"only-here")]);
        let resolver = ScopedResolver {
            chain: &chain,
            transient: &transient,
        };

        assert_eq!(resolver.resolve_type("A"), Some(b"transient".as_slice()));
        assert_eq!(resolver.resolve_type("T"), Some(b"only-here".as_slice()));
        assert_eq!(resolver.resolve_type("missing"), None);
    }

    #[test]
    fn test_empty_absorb_creates_nothing() {
        let mut chain = GenerationChain::new();
        assert_eq!(chain.absorb(&BTreeMap::new()), 0);
        assert_eq!(chain.generation_count(), 0);
        assert!(chain.head_id().is_none());
    }
}
