//! The artifact graph: arena, dependency resolution and build order.
//!
//! Artifacts live in one arena indexed by `usize`; `dependencies` and
//! `dependents` are index lists, so the graph serialises without
//! chasing references and ownership stays with the arena.

use crate::morphology::{sanitise_morphology_path, MorphologyKind};
use crate::source::{Source, SourcePool};
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;

pub type ArtifactIndex = usize;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("cyclic dependency between {a} and {b} detected")]
    MutualDependency { a: String, b: String },
    #[error(
        "in stratum {stratum}, chunk {chunk} references a dependency {dependency} \
         that is not defined before it in that stratum"
    )]
    UnknownDependency {
        stratum: String,
        chunk: String,
        dependency: String,
    },
    #[error("cyclic dependency chain detected")]
    CyclicDependencyChain,
    #[error("stratum {stratum} references {spec} which is not in the source pool")]
    MissingSource { stratum: String, spec: String },
    #[error("{source_name} does not produce an artifact named {artifact}")]
    MissingArtifact { source_name: String, artifact: String },
}

pub type Result<T> = std::result::Result<T, GraphError>;

/// A named output of a source with a stable identity in the arena.
#[derive(Debug, Clone)]
pub struct Artifact {
    /// Index of the owning source in the pool.
    pub source: usize,
    pub name: String,
    pub arch: String,
    /// Filled in by the cache-key computer after resolution.
    pub cache_key: Option<String>,
    pub cache_id: Option<serde_json::Value>,
    pub dependencies: Vec<ArtifactIndex>,
    pub dependents: Vec<ArtifactIndex>,
}

/// Source pool plus the artifacts it expands to.
#[derive(Debug, Default)]
pub struct ArtifactGraph {
    pub pool: SourcePool,
    pub artifacts: Vec<Artifact>,
    by_source: Vec<Vec<ArtifactIndex>>,
}

impl ArtifactGraph {
    /// Reassemble a graph from decoded parts. `by_source` must list
    /// each source's artifact indices in split-rule order.
    pub(crate) fn from_parts(
        pool: SourcePool,
        artifacts: Vec<Artifact>,
        by_source: Vec<Vec<ArtifactIndex>>,
    ) -> Self {
        Self {
            pool,
            artifacts,
            by_source,
        }
    }

    pub fn artifact(&self, idx: ArtifactIndex) -> &Artifact {
        &self.artifacts[idx]
    }

    pub fn artifact_mut(&mut self, idx: ArtifactIndex) -> &mut Artifact {
        &mut self.artifacts[idx]
    }

    pub fn source_of(&self, idx: ArtifactIndex) -> &Source {
        self.pool.get(self.artifacts[idx].source)
    }

    /// Artifacts of one source, in split-rule order.
    pub fn artifacts_of_source(&self, source: usize) -> &[ArtifactIndex] {
        &self.by_source[source]
    }

    /// Find a source's artifact by name.
    pub fn find_artifact(&self, source: usize, name: &str) -> Option<ArtifactIndex> {
        self.by_source[source]
            .iter()
            .copied()
            .find(|&idx| self.artifacts[idx].name == name)
    }

    /// Artifacts nothing depends on; what a build ultimately wants.
    pub fn roots(&self) -> Vec<ArtifactIndex> {
        (0..self.artifacts.len())
            .filter(|&idx| self.artifacts[idx].dependents.is_empty())
            .collect()
    }

    /// Make every artifact of `source` depend on `dependency`.
    fn add_dependency(&mut self, source: usize, dependency: ArtifactIndex) {
        for &artifact in &self.by_source[source].clone() {
            if artifact == dependency || self.artifacts[artifact].dependencies.contains(&dependency)
            {
                continue;
            }
            self.artifacts[artifact].dependencies.push(dependency);
            self.artifacts[dependency].dependents.push(artifact);
        }
    }

    /// Does any artifact of `source` depend on `artifact`?
    fn source_depends_on(&self, source: usize, artifact: ArtifactIndex) -> bool {
        self.by_source[source]
            .iter()
            .any(|&a| self.artifacts[a].dependencies.contains(&artifact))
    }

    /// Depth-first post-order walk from a root: leaves first, root
    /// last, each artifact once. Yields a topological ordering of the
    /// root's dependency closure.
    pub fn walk(&self, root: ArtifactIndex) -> Vec<ArtifactIndex> {
        let mut done = HashSet::new();
        let mut result = Vec::new();
        // (index, dependencies already expanded)
        let mut stack = vec![(root, false)];
        while let Some((idx, expanded)) = stack.pop() {
            if done.contains(&idx) {
                continue;
            }
            if expanded {
                done.insert(idx);
                result.push(idx);
            } else {
                stack.push((idx, true));
                for &dep in self.artifacts[idx].dependencies.iter().rev() {
                    if !done.contains(&dep) {
                        stack.push((dep, false));
                    }
                }
            }
        }
        result
    }
}

/// Expands a source pool into an artifact graph with typed
/// build-dependency edges.
#[derive(Debug)]
pub struct ArtifactResolver {
    arch: String,
}

impl ArtifactResolver {
    pub fn new(arch: impl Into<String>) -> Self {
        Self { arch: arch.into() }
    }

    pub fn resolve(&self, pool: SourcePool) -> Result<ArtifactGraph> {
        let mut graph = ArtifactGraph {
            pool,
            artifacts: Vec::new(),
            by_source: Vec::new(),
        };

        // Create every artifact up front so edges can point anywhere.
        for source_idx in 0..graph.pool.len() {
            let source = graph.pool.get(source_idx);
            let arch = match &source.morphology {
                crate::morphology::Morphology::System(s) => s.arch.as_str().to_string(),
                _ => self.arch.clone(),
            };
            let names: Vec<String> = source
                .split_rules
                .artifacts()
                .into_iter()
                .map(str::to_string)
                .collect();
            let mut indices = Vec::new();
            for name in names {
                let idx = graph.artifacts.len();
                graph.artifacts.push(Artifact {
                    source: source_idx,
                    name,
                    arch: arch.clone(),
                    cache_key: None,
                    cache_id: None,
                    dependencies: Vec::new(),
                    dependents: Vec::new(),
                });
                indices.push(idx);
            }
            graph.by_source.push(indices);
        }

        for source_idx in 0..graph.pool.len() {
            match graph.pool.get(source_idx).kind() {
                MorphologyKind::Chunk => {}
                MorphologyKind::Stratum => self.resolve_stratum(&mut graph, source_idx)?,
                MorphologyKind::System => self.resolve_system(&mut graph, source_idx)?,
                MorphologyKind::Cluster => {}
            }
        }

        Ok(graph)
    }

    fn lookup_one(
        &self,
        graph: &ArtifactGraph,
        parent: usize,
        repo: Option<&str>,
        ref_: Option<&str>,
        filename: &str,
    ) -> Option<usize> {
        let parent_source = graph.pool.get(parent);
        let repo = repo.unwrap_or(&parent_source.repo_name);
        let ref_ = ref_.unwrap_or(&parent_source.original_ref);
        graph.pool.lookup(repo, ref_, filename).first().copied()
    }

    fn resolve_stratum(&self, graph: &mut ArtifactGraph, source_idx: usize) -> Result<()> {
        let morphology = match &graph.pool.get(source_idx).morphology {
            crate::morphology::Morphology::Stratum(s) => s.clone(),
            _ => unreachable!("resolve_stratum called for a stratum source"),
        };
        let stratum_name = morphology.name.clone();

        // Every artifact of this stratum depends on every artifact of
        // each stratum it build-depends on.
        let mut stratum_build_depends: Vec<ArtifactIndex> = Vec::new();
        for spec in &morphology.build_depends {
            let filename = sanitise_morphology_path(&spec.morph);
            let other = self
                .lookup_one(
                    graph,
                    source_idx,
                    spec.repo.as_deref(),
                    spec.ref_.as_deref(),
                    &filename,
                )
                .ok_or_else(|| GraphError::MissingSource {
                    stratum: stratum_name.clone(),
                    spec: filename.clone(),
                })?;

            for &other_artifact in &graph.artifacts_of_source(other).to_vec() {
                for &own_artifact in &graph.artifacts_of_source(source_idx).to_vec() {
                    if graph.source_depends_on(other, own_artifact) {
                        return Err(GraphError::MutualDependency {
                            a: graph.artifacts[own_artifact].name.clone(),
                            b: graph.artifacts[other_artifact].name.clone(),
                        });
                    }
                }
                stratum_build_depends.push(other_artifact);
                graph.add_dependency(source_idx, other_artifact);
            }
        }

        // Chunks become visible to later siblings as they are
        // processed, so referencing a chunk that has not been defined
        // yet is an error.
        let mut processed: HashMap<String, Vec<ArtifactIndex>> = HashMap::new();
        let mut processed_order: Vec<ArtifactIndex> = Vec::new();

        for spec in &morphology.chunks {
            let filename = spec.morphology_filename();
            let ref_ = spec.ref_.as_deref();
            let chunk_source = self
                .lookup_one(graph, source_idx, Some(spec.repo.as_str()), ref_, &filename)
                .ok_or_else(|| GraphError::MissingSource {
                    stratum: stratum_name.clone(),
                    spec: filename.clone(),
                })?;

            {
                let source = graph.pool.get_mut(chunk_source);
                source.build_mode = spec.build_mode;
                if let Some(prefix) = &spec.prefix {
                    source.prefix = prefix.clone();
                }
            }

            for &other_stratum in &stratum_build_depends {
                graph.add_dependency(chunk_source, other_stratum);
            }

            let chunk_artifacts = graph.artifacts_of_source(chunk_source).to_vec();
            match &spec.build_depends {
                Some(names) => {
                    for name in names {
                        let Some(others) = processed.get(name) else {
                            return Err(GraphError::UnknownDependency {
                                stratum: stratum_name.clone(),
                                chunk: spec.name.clone(),
                                dependency: name.clone(),
                            });
                        };
                        for &other in others {
                            graph.add_dependency(chunk_source, other);
                        }
                    }
                }
                None => {
                    // No explicit list: build after every earlier chunk.
                    for &other in &processed_order {
                        graph.add_dependency(chunk_source, other);
                    }
                }
            }

            processed.insert(spec.name.clone(), chunk_artifacts.clone());
            processed_order.extend(chunk_artifacts);
        }

        // Stratum artifacts depend on the chunk artifacts their split
        // rules claim.
        let mut pairs = Vec::new();
        for spec in &morphology.chunks {
            let filename = spec.morphology_filename();
            if let Some(chunk_source) =
                self.lookup_one(graph, source_idx, Some(spec.repo.as_str()), spec.ref_.as_deref(), &filename)
            {
                for &artifact in graph.artifacts_of_source(chunk_source) {
                    pairs.push((
                        chunk_source,
                        artifact,
                        spec.name.clone(),
                        graph.artifacts[artifact].name.clone(),
                    ));
                }
            }
        }
        let rules = graph.pool.get(source_idx).split_rules.clone();
        for (_, artifact, chunk_name, artifact_name) in pairs {
            if !rules.match_artifact(&chunk_name, &artifact_name).is_empty() {
                graph.add_dependency(source_idx, artifact);
            }
        }

        Ok(())
    }

    fn resolve_system(&self, graph: &mut ArtifactGraph, source_idx: usize) -> Result<()> {
        let morphology = match &graph.pool.get(source_idx).morphology {
            crate::morphology::Morphology::System(s) => s.clone(),
            _ => unreachable!("resolve_system called for a system source"),
        };
        let rules = graph.pool.get(source_idx).split_rules.clone();

        for spec in &morphology.strata {
            let filename = sanitise_morphology_path(&spec.morph);
            let stratum_source = self
                .lookup_one(
                    graph,
                    source_idx,
                    spec.repo.as_deref(),
                    spec.ref_.as_deref(),
                    &filename,
                )
                .ok_or_else(|| GraphError::MissingSource {
                    stratum: morphology.name.clone(),
                    spec: filename.clone(),
                })?;

            let stratum_name = graph.pool.get(stratum_source).name().to_string();
            for &artifact in &graph.artifacts_of_source(stratum_source).to_vec() {
                let artifact_name = graph.artifacts[artifact].name.clone();
                if !rules.match_artifact(&stratum_name, &artifact_name).is_empty() {
                    graph.add_dependency(source_idx, artifact);
                }
            }

            // An enumerated artifact that the stratum does not produce
            // is a definition error.
            if let Some(selected) = &spec.artifacts {
                for name in selected {
                    if graph.find_artifact(stratum_source, name).is_none() {
                        return Err(GraphError::MissingArtifact {
                            source_name: stratum_name.clone(),
                            artifact: name.clone(),
                        });
                    }
                }
            }
        }

        Ok(())
    }
}

/// A topological ordering of the whole graph, partitioned into groups
/// with no intra-group dependencies. Groups expose parallelism.
#[derive(Debug)]
pub struct BuildOrder {
    pub order: Vec<ArtifactIndex>,
    pub groups: Vec<Vec<ArtifactIndex>>,
}

impl BuildOrder {
    pub fn new(graph: &ArtifactGraph) -> Result<Self> {
        let order = Self::topological_sort(graph)?;
        let groups = Self::build_groups(graph, &order);
        Ok(Self { order, groups })
    }

    fn topological_sort(graph: &ArtifactGraph) -> Result<Vec<ArtifactIndex>> {
        let mut satisfied: Vec<usize> = vec![0; graph.artifacts.len()];
        let mut sorting = Vec::with_capacity(graph.artifacts.len());
        let mut leafs: VecDeque<ArtifactIndex> = (0..graph.artifacts.len())
            .filter(|&idx| graph.artifacts[idx].dependencies.is_empty())
            .collect();

        while let Some(idx) = leafs.pop_front() {
            sorting.push(idx);
            for &dependent in &graph.artifacts[idx].dependents {
                satisfied[dependent] += 1;
                if satisfied[dependent] == graph.artifacts[dependent].dependencies.len() {
                    leafs.push_back(dependent);
                }
            }
        }

        if sorting.len() < graph.artifacts.len() {
            return Err(GraphError::CyclicDependencyChain);
        }
        Ok(sorting)
    }

    fn build_groups(graph: &ArtifactGraph, order: &[ArtifactIndex]) -> Vec<Vec<ArtifactIndex>> {
        let mut groups: Vec<Vec<ArtifactIndex>> = Vec::new();
        if order.is_empty() {
            return groups;
        }
        let mut group: Vec<ArtifactIndex> = Vec::new();
        let mut group_set: HashSet<ArtifactIndex> = HashSet::new();
        for &idx in order {
            let splits = graph.artifacts[idx]
                .dependencies
                .iter()
                .any(|dep| group_set.contains(dep));
            if splits {
                groups.push(group);
                group = Vec::new();
                group_set.clear();
            }
            group.push(idx);
            group_set.insert(idx);
        }
        groups.push(group);
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::morphology::{
        ChunkMorphology, ChunkSpec, Morphology, StratumMorphology, StratumSpec,
    };
    use crate::splitrules::{
        catch_all_rules, unify_chunk_rules, unify_stratum_rules, unify_system_rules,
    };
    use crate::source::Source;

    const SHA: &str = "f8b2b39e443df5cb77b1f757aca183e48672a139";
    const TREE: &str = "e6ebd38c8ea1a65a0d4be0ae26a8e01112d5fb11";

    fn add_chunk(pool: &mut SourcePool, name: &str, repo: &str) {
        let chunk = ChunkMorphology {
            name: name.to_string(),
            ..ChunkMorphology::default()
        };
        let rules = unify_chunk_rules(&chunk, &Vec::new()).unwrap();
        pool.add(Source::new(
            repo,
            "master",
            SHA,
            TREE,
            format!("{name}.morph"),
            Morphology::Chunk(chunk),
            rules,
        ));
    }

    fn add_stratum(pool: &mut SourcePool, stratum: StratumMorphology) {
        let rules = unify_stratum_rules(&stratum, &Vec::new()).unwrap();
        let filename = format!("{}.morph", stratum.name);
        pool.add(Source::new(
            "definitions",
            "master",
            SHA,
            TREE,
            filename,
            Morphology::Stratum(stratum),
            rules,
        ));
    }

    fn chunk_spec(name: &str, build_depends: Option<&[&str]>) -> ChunkSpec {
        ChunkSpec {
            name: name.to_string(),
            repo: name.to_string(),
            ref_: Some("master".to_string()),
            build_system: Some(crate::morphology::BuildSystemKind::Manual),
            build_mode: crate::morphology::BuildMode::Bootstrap,
            build_depends: build_depends
                .map(|names| names.iter().map(|s| (*s).to_string()).collect()),
            ..ChunkSpec::default()
        }
    }

    fn single_chunk_graph() -> ArtifactGraph {
        let mut pool = SourcePool::new();
        add_chunk(&mut pool, "chunk", "chunk");
        ArtifactResolver::new("x86_64").resolve(pool).unwrap()
    }

    #[test]
    fn single_chunk_yields_one_artifact() {
        let graph = single_chunk_graph();
        assert_eq!(graph.artifacts.len(), 1);
        let artifact = graph.artifact(0);
        assert_eq!(artifact.name, "chunk");
        assert!(artifact.dependencies.is_empty());
        assert!(artifact.dependents.is_empty());
        assert_eq!(graph.roots(), vec![0]);
    }

    fn stratum_with_three_chunks(
        deps: [Option<&'static [&'static str]>; 3],
    ) -> ArtifactGraph {
        let mut pool = SourcePool::new();
        for name in ["c1", "c2", "c3"] {
            add_chunk(&mut pool, name, name);
        }
        let stratum = StratumMorphology {
            name: "core".to_string(),
            chunks: vec![
                chunk_spec("c1", deps[0]),
                chunk_spec("c2", deps[1]),
                chunk_spec("c3", deps[2]),
            ],
            ..StratumMorphology::default()
        };
        add_stratum(&mut pool, stratum);
        ArtifactResolver::new("x86_64").resolve(pool).unwrap()
    }

    #[test]
    fn implicit_chunk_order_builds_chain() {
        let graph = stratum_with_three_chunks([None, None, None]);

        let c1 = graph.find_artifact(0, "c1").unwrap();
        let c2 = graph.find_artifact(1, "c2").unwrap();
        let c3 = graph.find_artifact(2, "c3").unwrap();
        let stratum = graph.find_artifact(3, "core").unwrap();

        assert!(graph.artifact(c1).dependencies.is_empty());
        assert_eq!(graph.artifact(c2).dependencies, vec![c1]);
        assert_eq!(graph.artifact(c3).dependencies, vec![c1, c2]);
        let stratum_deps = &graph.artifact(stratum).dependencies;
        assert!(stratum_deps.contains(&c1) && stratum_deps.contains(&c2) && stratum_deps.contains(&c3));
    }

    #[test]
    fn explicit_empty_build_depends_means_independent() {
        let graph = stratum_with_three_chunks([Some(&[]), Some(&[]), Some(&["c1"])]);

        let c1 = graph.find_artifact(0, "c1").unwrap();
        let c2 = graph.find_artifact(1, "c2").unwrap();
        let c3 = graph.find_artifact(2, "c3").unwrap();

        assert!(graph.artifact(c1).dependencies.is_empty());
        assert!(graph.artifact(c2).dependencies.is_empty());
        assert_eq!(graph.artifact(c3).dependencies, vec![c1]);
    }

    #[test]
    fn forward_reference_is_unknown_dependency() {
        let mut pool = SourcePool::new();
        for name in ["c1", "c2"] {
            add_chunk(&mut pool, name, name);
        }
        let stratum = StratumMorphology {
            name: "core".to_string(),
            chunks: vec![chunk_spec("c1", Some(&["c2"])), chunk_spec("c2", None)],
            ..StratumMorphology::default()
        };
        add_stratum(&mut pool, stratum);

        let err = ArtifactResolver::new("x86_64").resolve(pool).unwrap_err();
        assert!(matches!(
            err,
            GraphError::UnknownDependency { ref dependency, .. } if dependency == "c2"
        ));
    }

    #[test]
    fn mutual_stratum_dependency_is_detected() {
        let mut pool = SourcePool::new();
        add_chunk(&mut pool, "c1", "c1");
        add_chunk(&mut pool, "c2", "c2");

        let mut first = StratumMorphology {
            name: "first".to_string(),
            chunks: vec![chunk_spec("c1", None)],
            ..StratumMorphology::default()
        };
        first.build_depends.push(StratumSpec {
            morph: "second".to_string(),
            ..StratumSpec::default()
        });
        let mut second = StratumMorphology {
            name: "second".to_string(),
            chunks: vec![chunk_spec("c2", None)],
            ..StratumMorphology::default()
        };
        second.build_depends.push(StratumSpec {
            morph: "first".to_string(),
            ..StratumSpec::default()
        });

        add_stratum(&mut pool, first);
        add_stratum(&mut pool, second);

        let err = ArtifactResolver::new("x86_64").resolve(pool).unwrap_err();
        assert!(matches!(err, GraphError::MutualDependency { .. }));
    }

    #[test]
    fn stratum_depends_on_its_build_depends() {
        let mut pool = SourcePool::new();
        add_chunk(&mut pool, "c1", "c1");
        add_chunk(&mut pool, "c2", "c2");

        let base = StratumMorphology {
            name: "base".to_string(),
            chunks: vec![chunk_spec("c1", None)],
            ..StratumMorphology::default()
        };
        let mut upper = StratumMorphology {
            name: "upper".to_string(),
            chunks: vec![chunk_spec("c2", None)],
            ..StratumMorphology::default()
        };
        upper.build_depends.push(StratumSpec {
            morph: "base".to_string(),
            ..StratumSpec::default()
        });

        add_stratum(&mut pool, base);
        add_stratum(&mut pool, upper);

        let graph = ArtifactResolver::new("x86_64").resolve(pool).unwrap();
        let base_artifact = graph.find_artifact(2, "base").unwrap();
        let upper_artifact = graph.find_artifact(3, "upper").unwrap();
        let c2 = graph.find_artifact(1, "c2").unwrap();

        assert!(graph.artifact(upper_artifact).dependencies.contains(&base_artifact));
        // Chunks of the upper stratum also wait for the base stratum.
        assert!(graph.artifact(c2).dependencies.contains(&base_artifact));
    }

    fn graph_with_system() -> ArtifactGraph {
        let mut pool = SourcePool::new();
        add_chunk(&mut pool, "c1", "c1");
        let stratum = StratumMorphology {
            name: "core".to_string(),
            chunks: vec![chunk_spec("c1", None)],
            ..StratumMorphology::default()
        };
        add_stratum(&mut pool, stratum);

        let system = crate::morphology::SystemMorphology {
            name: "devel".to_string(),
            arch: crate::morphology::Architecture::X86_64,
            strata: vec![crate::morphology::SystemStratumSpec {
                name: Some("core".to_string()),
                morph: "core".to_string(),
                ..crate::morphology::SystemStratumSpec::default()
            }],
            ..crate::morphology::SystemMorphology::default()
        };
        let rules = unify_system_rules(&system);
        pool.add(Source::new(
            "definitions",
            "master",
            SHA,
            TREE,
            "devel.morph",
            Morphology::System(system),
            rules,
        ));
        ArtifactResolver::new("x86_64").resolve(pool).unwrap()
    }

    #[test]
    fn system_rootfs_depends_on_matched_strata() {
        let graph = graph_with_system();
        let rootfs = graph.find_artifact(2, "devel-rootfs").unwrap();
        let stratum = graph.find_artifact(1, "core").unwrap();
        assert!(graph.artifact(rootfs).dependencies.contains(&stratum));
        assert_eq!(graph.roots(), vec![rootfs]);
    }

    #[test]
    fn walk_is_post_order_with_leaves_first() {
        let graph = graph_with_system();
        let rootfs = graph.find_artifact(2, "devel-rootfs").unwrap();
        let order = graph.walk(rootfs);
        assert_eq!(*order.last().unwrap(), rootfs);
        // Every artifact appears after all its dependencies.
        for (pos, &idx) in order.iter().enumerate() {
            for dep in &graph.artifact(idx).dependencies {
                assert!(order[..pos].contains(dep));
            }
        }
    }

    #[test]
    fn build_order_groups_have_no_internal_edges() {
        let graph = stratum_with_three_chunks([None, None, None]);
        let order = BuildOrder::new(&graph).unwrap();
        assert_eq!(order.order.len(), graph.artifacts.len());
        for group in &order.groups {
            for &a in group {
                for &b in group {
                    assert!(!graph.artifact(a).dependencies.contains(&b));
                }
            }
        }
    }

    #[test]
    fn constructed_cycle_fails_topological_sort() {
        let mut graph = single_chunk_graph();
        // Manufacture a cycle directly in the arena.
        graph.artifacts.push(Artifact {
            source: 0,
            name: "evil-twin".to_string(),
            arch: "x86_64".to_string(),
            cache_key: None,
            cache_id: None,
            dependencies: vec![0],
            dependents: vec![],
        });
        graph.artifacts[0].dependencies.push(1);
        graph.artifacts[0].dependents.push(1);
        graph.artifacts[1].dependents.push(0);

        assert!(matches!(
            BuildOrder::new(&graph),
            Err(GraphError::CyclicDependencyChain)
        ));
    }

    #[test]
    fn resolution_is_idempotent() {
        let build = || {
            let graph = stratum_with_three_chunks([None, None, None]);
            graph
                .pool
                .iter()
                .map(|s| (s.repo_name.clone(), s.sha1.clone(), s.filename.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(build(), build());
    }
}
