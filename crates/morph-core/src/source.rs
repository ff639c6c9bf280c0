//! Resolved sources and the source pool.
//!
//! A source is a morphology pinned to a specific commit, together
//! with the split rules that decide its output artifacts. The pool
//! collects every source involved in a build, in traversal order.

use crate::morphology::{BuildMode, Morphology, MorphologyKind};
use crate::splitrules::SplitRules;
use std::collections::{HashMap, HashSet};

/// An instantiated, resolved view of a morphology at a commit.
#[derive(Debug, Clone)]
pub struct Source {
    /// Repository name as the user wrote it (possibly an alias).
    pub repo_name: String,
    /// The symbolic ref the user asked for, kept for cache keying.
    pub original_ref: String,
    /// Resolved commit id.
    pub sha1: String,
    /// Root tree of the commit.
    pub tree: String,
    /// Morphology path within the repository.
    pub filename: String,
    pub morphology: Morphology,
    pub split_rules: SplitRules,
    /// Filled in from the owning stratum's chunk spec during artifact
    /// resolution.
    pub build_mode: BuildMode,
    pub prefix: String,
}

impl Source {
    pub fn new(
        repo_name: impl Into<String>,
        original_ref: impl Into<String>,
        sha1: impl Into<String>,
        tree: impl Into<String>,
        filename: impl Into<String>,
        morphology: Morphology,
        split_rules: SplitRules,
    ) -> Self {
        let prefix = morphology
            .as_chunk()
            .map(|c| c.prefix.clone())
            .unwrap_or_else(|| "/usr".to_string());
        Self {
            repo_name: repo_name.into(),
            original_ref: original_ref.into(),
            sha1: sha1.into(),
            tree: tree.into(),
            filename: filename.into(),
            morphology,
            split_rules,
            build_mode: BuildMode::Staging,
            prefix,
        }
    }

    pub fn name(&self) -> &str {
        self.morphology.name()
    }

    pub fn kind(&self) -> MorphologyKind {
        self.morphology.kind()
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}|{}|{}",
            self.repo_name, self.original_ref, self.filename
        )
    }
}

/// Insertion-ordered set of sources with lookup by
/// (repo, original ref, filename).
#[derive(Debug, Clone, Default)]
pub struct SourcePool {
    sources: Vec<Source>,
    by_spec: HashMap<(String, String, String), Vec<usize>>,
    // One source per (repo, commit, filename).
    seen: HashSet<(String, String, String)>,
}

impl SourcePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a source unless an equivalent one (same repo, commit and
    /// filename) is already pooled. Returns the index of the pooled
    /// source either way.
    pub fn add(&mut self, source: Source) -> usize {
        let identity = (
            source.repo_name.clone(),
            source.sha1.clone(),
            source.filename.clone(),
        );
        if self.seen.contains(&identity) {
            // Equivalent source already pooled; find it through the
            // spec index.
            let key = (
                source.repo_name.clone(),
                source.original_ref.clone(),
                source.filename.clone(),
            );
            if let Some(indices) = self.by_spec.get(&key) {
                if let Some(&idx) = indices.first() {
                    return idx;
                }
            }
            // Same commit reached through a different ref: register
            // the extra spec key for lookup.
            let idx = self
                .sources
                .iter()
                .position(|s| {
                    s.repo_name == source.repo_name
                        && s.sha1 == source.sha1
                        && s.filename == source.filename
                })
                .expect("seen source must be pooled");
            self.by_spec.entry(key).or_default().push(idx);
            return idx;
        }

        let idx = self.sources.len();
        self.seen.insert(identity);
        self.by_spec
            .entry((
                source.repo_name.clone(),
                source.original_ref.clone(),
                source.filename.clone(),
            ))
            .or_default()
            .push(idx);
        self.sources.push(source);
        idx
    }

    /// Sources matching a (repo, ref, filename) spec, in pool order.
    pub fn lookup(&self, repo: &str, ref_: &str, filename: &str) -> Vec<usize> {
        self.by_spec
            .get(&(repo.to_string(), ref_.to_string(), filename.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn get(&self, idx: usize) -> &Source {
        &self.sources[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut Source {
        &mut self.sources[idx]
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Iterate sources in the order of first insertion.
    pub fn iter(&self) -> impl Iterator<Item = &Source> {
        self.sources.iter()
    }

    pub fn indices(&self) -> impl Iterator<Item = usize> {
        0..self.sources.len()
    }

    /// True if any pooled source has the given kind.
    pub fn has_kind(&self, kind: MorphologyKind) -> bool {
        self.sources.iter().any(|s| s.kind() == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::morphology::ChunkMorphology;
    use crate::splitrules::{catch_all_rules, unify_chunk_rules};

    fn chunk_source(name: &str, sha1: &str, ref_: &str) -> Source {
        let chunk = ChunkMorphology {
            name: name.to_string(),
            ..ChunkMorphology::default()
        };
        let rules = unify_chunk_rules(&chunk, &catch_all_rules()).unwrap();
        Source::new(
            format!("upstream:{name}"),
            ref_,
            sha1,
            "t".repeat(40),
            format!("{name}.morph"),
            Morphology::Chunk(chunk),
            rules,
        )
    }

    #[test]
    fn add_and_lookup() {
        let mut pool = SourcePool::new();
        let idx = pool.add(chunk_source("foo", &"a".repeat(40), "master"));
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.lookup("upstream:foo", "master", "foo.morph"), vec![idx]);
        assert!(pool.lookup("upstream:foo", "other", "foo.morph").is_empty());
    }

    #[test]
    fn duplicate_identity_is_pooled_once() {
        let mut pool = SourcePool::new();
        let first = pool.add(chunk_source("foo", &"a".repeat(40), "master"));
        let second = pool.add(chunk_source("foo", &"a".repeat(40), "master"));
        assert_eq!(first, second);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn same_commit_via_different_ref_registers_both_specs() {
        let mut pool = SourcePool::new();
        let first = pool.add(chunk_source("foo", &"a".repeat(40), "master"));
        let second = pool.add(chunk_source("foo", &"a".repeat(40), "baserock/morph"));
        assert_eq!(first, second);
        assert_eq!(pool.len(), 1);
        assert_eq!(
            pool.lookup("upstream:foo", "baserock/morph", "foo.morph"),
            vec![first]
        );
    }

    #[test]
    fn iteration_preserves_insertion_order() {
        let mut pool = SourcePool::new();
        pool.add(chunk_source("foo", &"a".repeat(40), "master"));
        pool.add(chunk_source("bar", &"b".repeat(40), "master"));
        pool.add(chunk_source("baz", &"c".repeat(40), "master"));
        let names: Vec<_> = pool.iter().map(Source::name).collect();
        assert_eq!(names, vec!["foo", "bar", "baz"]);
    }

    #[test]
    fn has_kind_reports_pool_contents() {
        let mut pool = SourcePool::new();
        pool.add(chunk_source("foo", &"a".repeat(40), "master"));
        assert!(pool.has_kind(MorphologyKind::Chunk));
        assert!(!pool.has_kind(MorphologyKind::System));
    }
}
