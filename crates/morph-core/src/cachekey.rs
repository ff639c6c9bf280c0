//! Content-addressed identity for artifacts.
//!
//! Every artifact gets a 64-hex SHA-256 over its build-relevant
//! inputs plus the cache keys of its direct dependencies, so a change
//! anywhere below an artifact changes the artifact's own key. The
//! hashed structure is also kept verbatim as the artifact's cache id
//! for diagnostics.

use crate::buildenv::BuildEnvironment;
use crate::buildsystem::BuildSystemRegistry;
use crate::graph::{ArtifactGraph, BuildOrder, GraphError};
use crate::morphology::{BuildPhase, Morphology};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

/// Bumped whenever the hashed structure changes shape.
pub const METADATA_VERSION: u64 = 1;

const STRATUM_FORMAT_VERSION: i64 = 1;
const SYSTEM_COMPATIBILITY_VERSION: &str = "2~ (upgradable, root rw)";

/// Environment variables that participate in cache keys.
const HASHED_ENV_VARS: [&str; 6] = [
    "LOGNAME",
    "MORPH_ARCH",
    "TARGET",
    "TARGET_STAGE1",
    "USER",
    "USERNAME",
];

/// Fill in `cache_key` and `cache_id` for every artifact in the
/// graph, dependencies first.
pub fn compute_keys(
    graph: &mut ArtifactGraph,
    build_env: &BuildEnvironment,
    registry: &BuildSystemRegistry,
) -> Result<(), GraphError> {
    let order = BuildOrder::new(graph)?;
    for idx in order.order {
        let cache_id = cache_id_for(graph, build_env, registry, idx);
        let key = hash_id(&cache_id);
        let artifact = graph.artifact_mut(idx);
        artifact.cache_id = Some(cache_id);
        artifact.cache_key = Some(key);
    }
    Ok(())
}

fn filtered_env(build_env: &BuildEnvironment) -> Value {
    let mut env = Map::new();
    for name in HASHED_ENV_VARS {
        let value = build_env.env.get(name).cloned().unwrap_or_default();
        env.insert(name.to_string(), Value::String(value));
    }
    Value::Object(env)
}

fn cache_id_for(
    graph: &ArtifactGraph,
    build_env: &BuildEnvironment,
    registry: &BuildSystemRegistry,
    idx: usize,
) -> Value {
    let artifact = graph.artifact(idx);
    let source = graph.source_of(idx);

    let kids: Vec<Value> = artifact
        .dependencies
        .iter()
        .map(|&dep| {
            let dep_artifact = graph.artifact(dep);
            json!({
                "artifact": dep_artifact.name,
                "cache-key": dep_artifact
                    .cache_key
                    .clone()
                    .expect("dependencies are keyed before their dependents"),
            })
        })
        .collect();

    let mut keys = Map::new();
    keys.insert("env".to_string(), filtered_env(build_env));
    keys.insert("kids".to_string(), Value::Array(kids));
    keys.insert("metadata-version".to_string(), json!(METADATA_VERSION));

    match &source.morphology {
        Morphology::Chunk(chunk) => {
            keys.insert(
                "build-mode".to_string(),
                json!(source.build_mode.as_str()),
            );
            keys.insert("prefix".to_string(), json!(source.prefix));
            keys.insert("tree".to_string(), json!(source.tree));
            let rules: Vec<Value> = source
                .split_rules
                .rule_patterns()
                .into_iter()
                .map(|(name, patterns)| json!([name, patterns]))
                .collect();
            keys.insert("split-rules".to_string(), Value::Array(rules));

            // Commands are hashed as they will be executed, with the
            // build-system table filled in. Strip commands do not
            // change artifact contents that matter for reuse.
            for phase in [
                BuildPhase::Configure,
                BuildPhase::Build,
                BuildPhase::Test,
                BuildPhase::Install,
            ] {
                let commands = chunk.phase(phase);
                let field = phase.field_name();
                keys.insert(format!("pre-{field}"), json!(commands.pre));
                keys.insert(field.clone(), json!(registry.resolved_commands(chunk, phase)));
                keys.insert(format!("post-{field}"), json!(commands.post));
            }

            keys.insert("devices".to_string(), chunk.devices.clone());
            keys.insert("max-jobs".to_string(), json!(chunk.max_jobs));
            keys.insert(
                "system-integration".to_string(),
                chunk.system_integration.clone(),
            );
            // Products are not hashed separately; the split rules
            // already absorbed them.
        }
        Morphology::Stratum(_) | Morphology::System(_) => {
            let morph_value = serde_json::to_value(&source.morphology)
                .expect("morphology records serialise");
            if let Value::Object(fields) = morph_value {
                // Description is cosmetic; dependency-bearing fields
                // are already covered by `kids`.
                const IGNORED: [&str; 5] =
                    ["description", "strata", "build-depends", "chunks", "products"];
                for (field, value) in fields {
                    if !IGNORED.contains(&field.as_str()) {
                        keys.insert(field, value);
                    }
                }
            }
            if source.morphology.as_stratum().is_some() {
                keys.insert(
                    "stratum-format-version".to_string(),
                    json!(STRATUM_FORMAT_VERSION),
                );
            } else {
                keys.insert(
                    "system-compatibility-version".to_string(),
                    json!(SYSTEM_COMPATIBILITY_VERSION),
                );
            }
        }
        Morphology::Cluster(_) => {}
    }

    Value::Object(keys)
}

fn hash_id(cache_id: &Value) -> String {
    let mut sha = Sha256::new();
    hash_value(&mut sha, cache_id);
    format!("{:x}", sha.finalize())
}

/// Canonical hashing: mappings as key-sorted entry sequences, lists
/// element-wise in order, scalars as their string form.
fn hash_value(sha: &mut Sha256, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by_key(|(k, _)| k.as_str());
            for (key, item) in entries {
                sha.update(key.as_bytes());
                hash_value(sha, item);
            }
        }
        Value::Array(items) => {
            for item in items {
                hash_value(sha, item);
            }
        }
        Value::String(s) => sha.update(s.as_bytes()),
        Value::Number(n) => sha.update(n.to_string().as_bytes()),
        Value::Bool(b) => sha.update(if *b { b"true".as_slice() } else { b"false".as_slice() }),
        Value::Null => sha.update(b"null"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ArtifactResolver;
    use crate::morphology::{
        BuildMode, BuildSystemKind, ChunkMorphology, ChunkSpec, StratumMorphology,
    };
    use crate::settings::Settings;
    use crate::source::{Source, SourcePool};
    use crate::splitrules::{unify_chunk_rules, unify_stratum_rules};
    use std::collections::BTreeMap;

    const SHA: &str = "f8b2b39e443df5cb77b1f757aca183e48672a139";
    const TREE: &str = "e6ebd38c8ea1a65a0d4be0ae26a8e01112d5fb11";

    fn build_env() -> BuildEnvironment {
        BuildEnvironment::with_host_env(&Settings::default(), "x86_64", &BTreeMap::new())
    }

    fn pool_with_stratum(description: &str, tree: &str) -> SourcePool {
        let mut pool = SourcePool::new();

        let chunk = ChunkMorphology {
            name: "busybox".to_string(),
            build_system: BuildSystemKind::Autotools,
            prefix: "/usr".to_string(),
            ..ChunkMorphology::default()
        };
        let rules = unify_chunk_rules(&chunk, &Vec::new()).unwrap();
        pool.add(Source::new(
            "upstream:busybox",
            "master",
            SHA,
            tree,
            "busybox.morph",
            Morphology::Chunk(chunk),
            rules,
        ));

        let stratum = StratumMorphology {
            name: "core".to_string(),
            description: description.to_string(),
            chunks: vec![ChunkSpec {
                name: "busybox".to_string(),
                repo: "upstream:busybox".to_string(),
                ref_: Some("master".to_string()),
                build_system: Some(BuildSystemKind::Autotools),
                build_mode: BuildMode::Bootstrap,
                ..ChunkSpec::default()
            }],
            ..StratumMorphology::default()
        };
        let rules = unify_stratum_rules(&stratum, &Vec::new()).unwrap();
        pool.add(Source::new(
            "definitions",
            "master",
            SHA,
            TREE,
            "core.morph",
            Morphology::Stratum(stratum),
            rules,
        ));
        pool
    }

    fn keyed_graph(description: &str, tree: &str) -> ArtifactGraph {
        let mut graph = ArtifactResolver::new("x86_64")
            .resolve(pool_with_stratum(description, tree))
            .unwrap();
        compute_keys(&mut graph, &build_env(), &BuildSystemRegistry::standard()).unwrap();
        graph
    }

    fn key_of(graph: &ArtifactGraph, name: &str) -> String {
        let idx = (0..graph.artifacts.len())
            .find(|&i| graph.artifact(i).name == name)
            .unwrap();
        graph.artifact(idx).cache_key.clone().unwrap()
    }

    #[test]
    fn keys_are_64_hex() {
        let graph = keyed_graph("", TREE);
        for artifact in &graph.artifacts {
            let key = artifact.cache_key.as_ref().unwrap();
            assert_eq!(key.len(), 64);
            assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn keys_are_deterministic_across_runs() {
        let first = keyed_graph("", TREE);
        let second = keyed_graph("", TREE);
        assert_eq!(key_of(&first, "busybox"), key_of(&second, "busybox"));
        assert_eq!(key_of(&first, "core"), key_of(&second, "core"));
    }

    #[test]
    fn description_change_does_not_change_keys() {
        let plain = keyed_graph("", TREE);
        let documented = keyed_graph("the core stratum, now described", TREE);
        assert_eq!(key_of(&plain, "core"), key_of(&documented, "core"));
        assert_eq!(key_of(&plain, "busybox"), key_of(&documented, "busybox"));
    }

    #[test]
    fn tree_change_changes_chunk_key() {
        let before = keyed_graph("", TREE);
        let after = keyed_graph("", "0000000000000000000000000000000000000000");
        assert_ne!(key_of(&before, "busybox"), key_of(&after, "busybox"));
    }

    #[test]
    fn dependency_key_change_cascades_to_dependents() {
        // The chunk key changes with its tree; the stratum must
        // follow even though no stratum field changed.
        let before = keyed_graph("", TREE);
        let after = keyed_graph("", "0000000000000000000000000000000000000000");
        assert_ne!(key_of(&before, "core"), key_of(&after, "core"));
    }

    #[test]
    fn prefix_change_changes_chunk_key() {
        let mut pool = pool_with_stratum("", TREE);
        pool.get_mut(0).prefix = "/opt".to_string();
        let mut graph = ArtifactResolver::new("x86_64").resolve(pool).unwrap();
        compute_keys(&mut graph, &build_env(), &BuildSystemRegistry::standard()).unwrap();

        let plain = keyed_graph("", TREE);
        assert_ne!(key_of(&graph, "busybox"), key_of(&plain, "busybox"));
    }

    #[test]
    fn hashed_env_subset_changes_key() {
        let settings = Settings::default();
        let mut host = BTreeMap::new();
        host.insert("DISTCC_HOSTS".to_string(), "other".to_string());
        // DISTCC_HOSTS is copied into the build env but not hashed.
        let env_a = BuildEnvironment::with_host_env(&settings, "x86_64", &BTreeMap::new());
        let env_b = BuildEnvironment::with_host_env(&settings, "x86_64", &host);

        let mut graph_a = ArtifactResolver::new("x86_64")
            .resolve(pool_with_stratum("", TREE))
            .unwrap();
        compute_keys(&mut graph_a, &env_a, &BuildSystemRegistry::standard()).unwrap();
        let mut graph_b = ArtifactResolver::new("x86_64")
            .resolve(pool_with_stratum("", TREE))
            .unwrap();
        compute_keys(&mut graph_b, &env_b, &BuildSystemRegistry::standard()).unwrap();
        assert_eq!(key_of(&graph_a, "busybox"), key_of(&graph_b, "busybox"));

        // A different architecture is hashed, via MORPH_ARCH/TARGET.
        let env_c = BuildEnvironment::with_host_env(&settings, "armv7l", &BTreeMap::new());
        let mut graph_c = ArtifactResolver::new("armv7l")
            .resolve(pool_with_stratum("", TREE))
            .unwrap();
        compute_keys(&mut graph_c, &env_c, &BuildSystemRegistry::standard()).unwrap();
        assert_ne!(key_of(&graph_a, "busybox"), key_of(&graph_c, "busybox"));
    }

    #[test]
    fn cache_id_is_kept_for_diagnostics() {
        let graph = keyed_graph("", TREE);
        let idx = (0..graph.artifacts.len())
            .find(|&i| graph.artifact(i).name == "busybox")
            .unwrap();
        let id = graph.artifact(idx).cache_id.as_ref().unwrap();
        assert_eq!(id["tree"], TREE);
        assert_eq!(id["metadata-version"], METADATA_VERSION);
        // The autotools table was folded into the hashed commands.
        assert_eq!(id["build-commands"][0], "make");
    }
}
