//! Wire encoding of artifact graphs.
//!
//! A controller ships a self-contained slice of the artifact graph to
//! a remote worker: every source and artifact the root's closure
//! needs, keyed by string ids, with dependency order preserved. The
//! worker decodes it back into an arena graph it can build from.

use crate::graph::{Artifact, ArtifactGraph, ArtifactIndex};
use crate::morphology::{BuildMode, Morphology};
use crate::source::{Source, SourcePool};
use crate::splitrules::{
    catch_all_rules, unify_chunk_rules, unify_stratum_rules, unify_system_rules, SplitRuleError,
    SplitRules,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SerialiseError {
    #[error("invalid artifact graph document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("artifact graph references unknown id {0}")]
    UnknownId(String),
    #[error(transparent)]
    SplitRule(#[from] SplitRuleError),
}

pub type Result<T> = std::result::Result<T, SerialiseError>;

#[derive(Debug, Serialize, Deserialize)]
struct EncodedSource {
    repo_name: String,
    original_ref: String,
    sha1: String,
    tree: String,
    filename: String,
    morphology: Morphology,
    build_mode: BuildMode,
    prefix: String,
    artifact_ids: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EncodedArtifact {
    source_id: String,
    name: String,
    cache_id: Option<serde_json::Value>,
    cache_key: Option<String>,
    dependencies: Vec<String>,
    arch: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct EncodedGraph {
    sources: BTreeMap<String, EncodedSource>,
    artifacts: BTreeMap<String, EncodedArtifact>,
    root: String,
}

/// Encode the dependency closure of `root` as a JSON document.
pub fn serialise_artifact(graph: &ArtifactGraph, root: ArtifactIndex) -> Result<String> {
    // Builders produce all artifacts of a source together, so every
    // sibling of an artifact in the closure ships too.
    let mut involved_sources = BTreeSet::new();
    for idx in graph.walk(root) {
        involved_sources.insert(graph.artifact(idx).source);
    }
    let mut artifact_ids = BTreeSet::new();
    for &source in &involved_sources {
        artifact_ids.extend(graph.artifacts_of_source(source).iter().copied());
    }

    let mut sources = BTreeMap::new();
    for &source_idx in &involved_sources {
        let source = graph.pool.get(source_idx);
        sources.insert(
            source_idx.to_string(),
            EncodedSource {
                repo_name: source.repo_name.clone(),
                original_ref: source.original_ref.clone(),
                sha1: source.sha1.clone(),
                tree: source.tree.clone(),
                filename: source.filename.clone(),
                morphology: source.morphology.clone(),
                build_mode: source.build_mode,
                prefix: source.prefix.clone(),
                artifact_ids: graph
                    .artifacts_of_source(source_idx)
                    .iter()
                    .map(ArtifactIndex::to_string)
                    .collect(),
            },
        );
    }

    let mut artifacts = BTreeMap::new();
    for &idx in &artifact_ids {
        let artifact = graph.artifact(idx);
        artifacts.insert(
            idx.to_string(),
            EncodedArtifact {
                source_id: artifact.source.to_string(),
                name: artifact.name.clone(),
                cache_id: artifact.cache_id.clone(),
                cache_key: artifact.cache_key.clone(),
                dependencies: artifact
                    .dependencies
                    .iter()
                    .map(ArtifactIndex::to_string)
                    .collect(),
                arch: artifact.arch.clone(),
            },
        );
    }

    let encoded = EncodedGraph {
        sources,
        artifacts,
        root: root.to_string(),
    };
    Ok(serde_json::to_string(&encoded)?)
}

fn revive_split_rules(morphology: &Morphology) -> Result<SplitRules> {
    // The wire format does not carry rule patterns; they are revived
    // from the morphology with the catch-all defaults.
    Ok(match morphology {
        Morphology::Chunk(c) => unify_chunk_rules(c, &catch_all_rules())?,
        Morphology::Stratum(s) => unify_stratum_rules(s, &catch_all_rules())?,
        Morphology::System(s) => unify_system_rules(s),
        Morphology::Cluster(_) => SplitRules::new(),
    })
}

/// Decode a document produced by [`serialise_artifact`]. Returns the
/// rebuilt graph and the root's index in it.
pub fn deserialise_artifact(text: &str) -> Result<(ArtifactGraph, ArtifactIndex)> {
    let encoded: EncodedGraph = serde_json::from_str(text)?;

    // Ids are stringified arena indices; rebuild in numeric order so
    // pool and walk orders survive the round trip.
    let numeric = |id: &str| id.parse::<u64>().unwrap_or(u64::MAX);
    let mut source_ids: Vec<&String> = encoded.sources.keys().collect();
    source_ids.sort_by_key(|id| numeric(id));
    let mut artifact_ids: Vec<&String> = encoded.artifacts.keys().collect();
    artifact_ids.sort_by_key(|id| numeric(id));

    let mut pool = SourcePool::new();
    let mut source_index: HashMap<&str, usize> = HashMap::new();
    for id in &source_ids {
        let enc = &encoded.sources[*id];
        let split_rules = revive_split_rules(&enc.morphology)?;
        let mut source = Source::new(
            enc.repo_name.clone(),
            enc.original_ref.clone(),
            enc.sha1.clone(),
            enc.tree.clone(),
            enc.filename.clone(),
            enc.morphology.clone(),
            split_rules,
        );
        source.build_mode = enc.build_mode;
        source.prefix = enc.prefix.clone();
        source_index.insert(id.as_str(), pool.add(source));
    }

    let mut artifact_index: HashMap<&str, ArtifactIndex> = HashMap::new();
    for (new_idx, id) in artifact_ids.iter().enumerate() {
        artifact_index.insert(id.as_str(), new_idx);
    }

    let mut artifacts = Vec::with_capacity(artifact_ids.len());
    for id in &artifact_ids {
        let enc = &encoded.artifacts[*id];
        let source = *source_index
            .get(enc.source_id.as_str())
            .ok_or_else(|| SerialiseError::UnknownId(enc.source_id.clone()))?;
        let dependencies = enc
            .dependencies
            .iter()
            .map(|dep| {
                artifact_index
                    .get(dep.as_str())
                    .copied()
                    .ok_or_else(|| SerialiseError::UnknownId(dep.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        artifacts.push(Artifact {
            source,
            name: enc.name.clone(),
            arch: enc.arch.clone(),
            cache_key: enc.cache_key.clone(),
            cache_id: enc.cache_id.clone(),
            dependencies,
            dependents: Vec::new(),
        });
    }

    // Derive dependents from the (order-preserving) dependency lists.
    for idx in 0..artifacts.len() {
        for dep_pos in 0..artifacts[idx].dependencies.len() {
            let dep = artifacts[idx].dependencies[dep_pos];
            artifacts[dep].dependents.push(idx);
        }
    }

    let mut by_source: Vec<Vec<ArtifactIndex>> = vec![Vec::new(); pool.len()];
    for id in &source_ids {
        let enc = &encoded.sources[*id];
        let source = source_index[id.as_str()];
        for aid in &enc.artifact_ids {
            let idx = *artifact_index
                .get(aid.as_str())
                .ok_or_else(|| SerialiseError::UnknownId(aid.clone()))?;
            by_source[source].push(idx);
        }
    }

    let root = *artifact_index
        .get(encoded.root.as_str())
        .ok_or_else(|| SerialiseError::UnknownId(encoded.root.clone()))?;

    Ok((ArtifactGraph::from_parts(pool, artifacts, by_source), root))
}
