//! Morphology loading and validation.
//!
//! Lowers YAML text into [`Morphology`] records. Validation happens
//! while lowering, so every field access is checked exactly once and
//! errors carry the offending field path (e.g.
//! `products[0].include[2]`) together with the morphology name.

use crate::buildsystem::{BuildSystem, BuildSystemRegistry};
use crate::morphology::{
    Architecture, BuildMode, BuildPhase, BuildSystemKind, ChunkMorphology, ChunkSpec,
    ClusterMorphology, ClusterSystemSpec, Morphology, PhaseCommands, ProductSpec, StratumMorphology,
    StratumSpec, SystemMorphology, SystemStratumSpec,
};
use crate::splitrules::DefaultRules;
use serde_yaml::{Mapping, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;

/// Definitions format versions this loader understands.
pub const SUPPORTED_VERSIONS: [i64; 1] = [7];

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("{source_name}: syntax error: {message}")]
    Syntax {
        source_name: String,
        message: String,
    },
    #[error("{source_name}: morphology is not a mapping")]
    NotAMapping { source_name: String },
    #[error("{morphology}: unknown kind '{kind}'")]
    UnknownKind { morphology: String, kind: String },
    #[error("{morphology}: missing field '{field}'")]
    MissingField { morphology: String, field: String },
    #[error("{morphology}: unknown field '{field}'")]
    InvalidField { morphology: String, field: String },
    #[error("{morphology}: field '{field}' must be {expected}")]
    InvalidType {
        morphology: String,
        field: String,
        expected: &'static str,
    },
    #[error("{morphology}: unknown build system '{name}'")]
    UnknownBuildSystem { morphology: String, name: String },
    #[error("{morphology}: unknown build mode '{mode}' in '{field}'")]
    UnknownBuildMode {
        morphology: String,
        field: String,
        mode: String,
    },
    #[error("{morphology}: unknown architecture '{arch}'")]
    UnknownArchitecture { morphology: String, arch: String },
    #[error("stratum {morphology} has no chunks")]
    EmptyStratum { morphology: String },
    #[error("system {morphology} has no strata")]
    EmptySystem { morphology: String },
    #[error(
        "stratum {morphology} has no build-dependencies and no bootstrap chunks"
    )]
    NoBuildDependencies { morphology: String },
    #[error("{morphology}: duplicate name '{name}' in '{field}'")]
    DuplicateName {
        morphology: String,
        field: String,
        name: String,
    },
    #[error("stratum {morphology} build-depends on itself")]
    SelfDependency { morphology: String },
    #[error("{morphology}: chunk '{chunk}' has an empty ref")]
    EmptyRef { morphology: String, chunk: String },
    #[error(
        "{morphology}: chunk '{chunk}' specifies both 'morph' and 'build-system'"
    )]
    ConflictingBuildInstructions { morphology: String, chunk: String },
    #[error(
        "{morphology}: chunk '{chunk}' specifies neither 'morph' nor 'build-system'"
    )]
    MissingBuildInstructions { morphology: String, chunk: String },
    #[error("{morphology}: duplicate deployment name '{name}'")]
    DuplicateDeployment { morphology: String, name: String },
    #[error("invalid VERSION file: '{text}'")]
    InvalidVersionFile { text: String },
    #[error("definitions format version {version} is not supported")]
    UnsupportedVersion { version: i64 },
    #[error("invalid DEFAULTS file: {message}")]
    InvalidDefaults { message: String },
}

pub type Result<T> = std::result::Result<T, LoaderError>;

/// Parses and validates morphology documents.
#[derive(Debug, Default)]
pub struct MorphologyLoader;

const CHUNK_FIELDS: &[&str] = &[
    "name",
    "kind",
    "description",
    "build-system",
    "pre-configure-commands",
    "configure-commands",
    "post-configure-commands",
    "pre-build-commands",
    "build-commands",
    "post-build-commands",
    "pre-test-commands",
    "test-commands",
    "post-test-commands",
    "pre-install-commands",
    "install-commands",
    "post-install-commands",
    "pre-strip-commands",
    "strip-commands",
    "post-strip-commands",
    "max-jobs",
    "products",
    "system-integration",
    "devices",
    "prefix",
];

const STRATUM_FIELDS: &[&str] = &[
    "name",
    "kind",
    "description",
    "build-depends",
    "chunks",
    "products",
];

const CHUNK_SPEC_FIELDS: &[&str] = &[
    "name",
    "repo",
    "ref",
    "morph",
    "build-system",
    "build-mode",
    "prefix",
    "build-depends",
    "artifacts",
];

const SYSTEM_FIELDS: &[&str] = &[
    "name",
    "kind",
    "description",
    "arch",
    "strata",
    "configuration-extensions",
];

const CLUSTER_FIELDS: &[&str] = &["name", "kind", "description", "systems"];

impl MorphologyLoader {
    pub fn new() -> Self {
        Self
    }

    /// Parse YAML text into a validated morphology with defaults
    /// applied. `source_name` labels errors (usually the filename).
    pub fn parse(&self, text: &str, source_name: &str) -> Result<Morphology> {
        let value: Value = serde_yaml::from_str(text).map_err(|e| LoaderError::Syntax {
            source_name: source_name.to_string(),
            message: e.to_string(),
        })?;
        let map = value.as_mapping().ok_or_else(|| LoaderError::NotAMapping {
            source_name: source_name.to_string(),
        })?;

        let name = require_str(map, "name", source_name)?;
        let kind = require_str(map, "kind", source_name)?;

        match kind.as_str() {
            "chunk" => self.lower_chunk(map, &name).map(Morphology::Chunk),
            "stratum" => self.lower_stratum(map, &name).map(Morphology::Stratum),
            "system" => self.lower_system(map, &name).map(Morphology::System),
            "cluster" => self.lower_cluster(map, &name).map(Morphology::Cluster),
            other => Err(LoaderError::UnknownKind {
                morphology: name,
                kind: other.to_string(),
            }),
        }
    }

    fn lower_chunk(&self, map: &Mapping, name: &str) -> Result<ChunkMorphology> {
        check_fields(map, CHUNK_FIELDS, name)?;

        let build_system = match opt_str(map, "build-system", name)? {
            Some(bs) => {
                BuildSystemKind::parse(&bs).ok_or_else(|| LoaderError::UnknownBuildSystem {
                    morphology: name.to_string(),
                    name: bs,
                })?
            }
            None => BuildSystemKind::Manual,
        };

        let mut chunk = ChunkMorphology {
            name: name.to_string(),
            description: opt_str(map, "description", name)?.unwrap_or_default(),
            build_system,
            max_jobs: opt_int(map, "max-jobs", name)?.map(|n| n as u32),
            products: lower_products(map, name)?,
            system_integration: json_field(map, "system-integration", name)?,
            devices: json_field(map, "devices", name)?,
            prefix: opt_str(map, "prefix", name)?.unwrap_or_else(|| "/usr".to_string()),
            ..ChunkMorphology::default()
        };

        for phase in BuildPhase::ALL {
            let field = phase.field_name();
            *chunk.phase_mut(phase) = PhaseCommands {
                pre: opt_string_list(map, &format!("pre-{field}"), name)?.unwrap_or_default(),
                main: opt_string_list(map, &field, name)?,
                post: opt_string_list(map, &format!("post-{field}"), name)?.unwrap_or_default(),
            };
        }

        let mut seen = HashSet::new();
        for (i, product) in chunk.products.iter().enumerate() {
            if !seen.insert(product.artifact.clone()) {
                return Err(LoaderError::DuplicateName {
                    morphology: name.to_string(),
                    field: format!("products[{i}].artifact"),
                    name: product.artifact.clone(),
                });
            }
        }

        Ok(chunk)
    }

    fn lower_stratum(&self, map: &Mapping, name: &str) -> Result<StratumMorphology> {
        check_fields(map, STRATUM_FIELDS, name)?;

        let mut stratum = StratumMorphology {
            name: name.to_string(),
            description: opt_str(map, "description", name)?.unwrap_or_default(),
            ..StratumMorphology::default()
        };

        if let Some(deps) = map.get("build-depends") {
            let list = expect_seq(deps, name, "build-depends")?;
            for (i, item) in list.iter().enumerate() {
                let field = format!("build-depends[{i}]");
                let spec = expect_map(item, name, &field)?;
                let morph = require_str_at(spec, "morph", name, &field)?;
                if morph_stem(&morph) == name {
                    return Err(LoaderError::SelfDependency {
                        morphology: name.to_string(),
                    });
                }
                stratum.build_depends.push(StratumSpec {
                    morph,
                    repo: opt_str_at(spec, "repo", name, &field)?,
                    ref_: opt_str_at(spec, "ref", name, &field)?,
                });
            }
        }

        let chunks = map.get("chunks").ok_or_else(|| LoaderError::MissingField {
            morphology: name.to_string(),
            field: "chunks".to_string(),
        })?;
        let list = expect_seq(chunks, name, "chunks")?;
        if list.is_empty() {
            return Err(LoaderError::EmptyStratum {
                morphology: name.to_string(),
            });
        }

        let mut seen = HashSet::new();
        for (i, item) in list.iter().enumerate() {
            let field = format!("chunks[{i}]");
            let spec_map = expect_map(item, name, &field)?;
            check_fields_at(spec_map, CHUNK_SPEC_FIELDS, name, &field)?;
            let spec = self.lower_chunk_spec(spec_map, name, &field)?;
            if !seen.insert(spec.name.clone()) {
                return Err(LoaderError::DuplicateName {
                    morphology: name.to_string(),
                    field,
                    name: spec.name,
                });
            }
            stratum.chunks.push(spec);
        }

        stratum.products = lower_products(map, name)?;

        // A stratum with nothing before it can only be built if some
        // chunk bootstraps from the bare host.
        let has_bootstrap = stratum
            .chunks
            .iter()
            .any(|c| c.build_mode == BuildMode::Bootstrap);
        if stratum.build_depends.is_empty() && !has_bootstrap {
            return Err(LoaderError::NoBuildDependencies {
                morphology: name.to_string(),
            });
        }

        Ok(stratum)
    }

    fn lower_chunk_spec(&self, map: &Mapping, morphology: &str, field: &str) -> Result<ChunkSpec> {
        let chunk_name = require_str_at(map, "name", morphology, field)?;

        if let Some(Value::String(r)) = map.get("ref") {
            if r.is_empty() {
                return Err(LoaderError::EmptyRef {
                    morphology: morphology.to_string(),
                    chunk: chunk_name,
                });
            }
        }

        let morph = opt_str_at(map, "morph", morphology, field)?;
        let build_system = match opt_str_at(map, "build-system", morphology, field)? {
            Some(bs) => Some(BuildSystemKind::parse(&bs).ok_or_else(|| {
                LoaderError::UnknownBuildSystem {
                    morphology: morphology.to_string(),
                    name: bs,
                }
            })?),
            None => None,
        };
        match (&morph, &build_system) {
            (Some(_), Some(_)) => {
                return Err(LoaderError::ConflictingBuildInstructions {
                    morphology: morphology.to_string(),
                    chunk: chunk_name,
                })
            }
            (None, None) => {
                return Err(LoaderError::MissingBuildInstructions {
                    morphology: morphology.to_string(),
                    chunk: chunk_name,
                })
            }
            _ => {}
        }

        let build_mode = match opt_str_at(map, "build-mode", morphology, field)? {
            Some(mode) => BuildMode::parse(&mode).ok_or_else(|| LoaderError::UnknownBuildMode {
                morphology: morphology.to_string(),
                field: format!("{field}.build-mode"),
                mode,
            })?,
            None => BuildMode::Staging,
        };

        let mut artifacts = BTreeMap::new();
        if let Some(value) = map.get("artifacts") {
            let amap = expect_map(value, morphology, &format!("{field}.artifacts"))?;
            for (k, v) in amap {
                let key = k.as_str().ok_or_else(|| LoaderError::InvalidType {
                    morphology: morphology.to_string(),
                    field: format!("{field}.artifacts"),
                    expected: "a mapping of artifact names",
                })?;
                let val = v.as_str().ok_or_else(|| LoaderError::InvalidType {
                    morphology: morphology.to_string(),
                    field: format!("{field}.artifacts.{key}"),
                    expected: "an artifact name",
                })?;
                artifacts.insert(key.to_string(), val.to_string());
            }
        }

        Ok(ChunkSpec {
            repo: opt_str_at(map, "repo", morphology, field)?.unwrap_or_else(|| chunk_name.clone()),
            ref_: opt_str_at(map, "ref", morphology, field)?,
            morph,
            build_system,
            build_mode,
            prefix: opt_str_at(map, "prefix", morphology, field)?,
            build_depends: opt_string_list(map, "build-depends", morphology)?,
            artifacts,
            name: chunk_name,
        })
    }

    fn lower_system(&self, map: &Mapping, name: &str) -> Result<SystemMorphology> {
        check_fields(map, SYSTEM_FIELDS, name)?;

        let arch_name = require_str(map, "arch", name)?;
        let arch =
            Architecture::parse(&arch_name).ok_or_else(|| LoaderError::UnknownArchitecture {
                morphology: name.to_string(),
                arch: arch_name,
            })?;

        let strata_value = map.get("strata").ok_or_else(|| LoaderError::MissingField {
            morphology: name.to_string(),
            field: "strata".to_string(),
        })?;
        let list = expect_seq(strata_value, name, "strata")?;
        if list.is_empty() {
            return Err(LoaderError::EmptySystem {
                morphology: name.to_string(),
            });
        }

        let mut strata = Vec::new();
        let mut seen = HashSet::new();
        for (i, item) in list.iter().enumerate() {
            let field = format!("strata[{i}]");
            let spec = expect_map(item, name, &field)?;
            let morph = require_str_at(spec, "morph", name, &field)?;
            let stratum_name = opt_str_at(spec, "name", name, &field)?;
            let artifacts = match spec.get("artifacts") {
                None => None,
                Some(v) => Some(string_list(v, name, &format!("{field}.artifacts"))?),
            };
            let entry = SystemStratumSpec {
                name: stratum_name,
                morph,
                repo: opt_str_at(spec, "repo", name, &field)?,
                ref_: opt_str_at(spec, "ref", name, &field)?,
                artifacts,
            };
            if !seen.insert(entry.source_name().to_string()) {
                return Err(LoaderError::DuplicateName {
                    morphology: name.to_string(),
                    field,
                    name: entry.source_name().to_string(),
                });
            }
            strata.push(entry);
        }

        Ok(SystemMorphology {
            name: name.to_string(),
            description: opt_str(map, "description", name)?.unwrap_or_default(),
            arch,
            strata,
            configuration_extensions: opt_string_list(map, "configuration-extensions", name)?
                .unwrap_or_default(),
        })
    }

    fn lower_cluster(&self, map: &Mapping, name: &str) -> Result<ClusterMorphology> {
        check_fields(map, CLUSTER_FIELDS, name)?;

        let systems_value = map.get("systems").ok_or_else(|| LoaderError::MissingField {
            morphology: name.to_string(),
            field: "systems".to_string(),
        })?;
        let list = expect_seq(systems_value, name, "systems")?;

        let mut systems = Vec::new();
        for (i, item) in list.iter().enumerate() {
            let field = format!("systems[{i}]");
            let spec = expect_map(item, name, &field)?;
            systems.push(self.lower_cluster_system(spec, name, &field)?);
        }

        // Deployment names must be unique across systems and their
        // subsystems.
        let mut seen = HashSet::new();
        let mut stack: Vec<&ClusterSystemSpec> = systems.iter().collect();
        while let Some(system) = stack.pop() {
            for deployment in system.deploy.keys() {
                if !seen.insert(deployment.clone()) {
                    return Err(LoaderError::DuplicateDeployment {
                        morphology: name.to_string(),
                        name: deployment.clone(),
                    });
                }
            }
            stack.extend(system.subsystems.iter());
        }

        Ok(ClusterMorphology {
            name: name.to_string(),
            description: opt_str(map, "description", name)?.unwrap_or_default(),
            systems,
        })
    }

    fn lower_cluster_system(
        &self,
        map: &Mapping,
        morphology: &str,
        field: &str,
    ) -> Result<ClusterSystemSpec> {
        let morph = require_str_at(map, "morph", morphology, field)?;

        let mut deploy = BTreeMap::new();
        if let Some(value) = map.get("deploy") {
            let dmap = expect_map(value, morphology, &format!("{field}.deploy"))?;
            for (k, v) in dmap {
                let key = k.as_str().ok_or_else(|| LoaderError::InvalidType {
                    morphology: morphology.to_string(),
                    field: format!("{field}.deploy"),
                    expected: "a mapping of deployment names",
                })?;
                deploy.insert(key.to_string(), yaml_to_json(v, morphology, field)?);
            }
        }

        let mut deploy_defaults = BTreeMap::new();
        if let Some(value) = map.get("deploy-defaults") {
            let dmap = expect_map(value, morphology, &format!("{field}.deploy-defaults"))?;
            for (k, v) in dmap {
                if let Some(key) = k.as_str() {
                    deploy_defaults.insert(key.to_string(), yaml_to_json(v, morphology, field)?);
                }
            }
        }

        let mut subsystems = Vec::new();
        if let Some(value) = map.get("subsystems") {
            let list = expect_seq(value, morphology, &format!("{field}.subsystems"))?;
            for (i, item) in list.iter().enumerate() {
                let sub_field = format!("{field}.subsystems[{i}]");
                let spec = expect_map(item, morphology, &sub_field)?;
                subsystems.push(self.lower_cluster_system(spec, morphology, &sub_field)?);
            }
        }

        Ok(ClusterSystemSpec {
            morph,
            deploy,
            deploy_defaults,
            subsystems,
        })
    }
}

// --- field helpers ---

fn check_fields(map: &Mapping, allowed: &[&str], morphology: &str) -> Result<()> {
    check_fields_at(map, allowed, morphology, "")
}

fn check_fields_at(map: &Mapping, allowed: &[&str], morphology: &str, prefix: &str) -> Result<()> {
    for key in map.keys() {
        let key = key.as_str().ok_or_else(|| LoaderError::InvalidType {
            morphology: morphology.to_string(),
            field: prefix.to_string(),
            expected: "string field names",
        })?;
        if !allowed.contains(&key) {
            let field = if prefix.is_empty() {
                key.to_string()
            } else {
                format!("{prefix}.{key}")
            };
            return Err(LoaderError::InvalidField {
                morphology: morphology.to_string(),
                field,
            });
        }
    }
    Ok(())
}

fn require_str(map: &Mapping, field: &str, morphology: &str) -> Result<String> {
    require_str_at(map, field, morphology, "")
}

fn require_str_at(map: &Mapping, field: &str, morphology: &str, prefix: &str) -> Result<String> {
    let path = if prefix.is_empty() {
        field.to_string()
    } else {
        format!("{prefix}.{field}")
    };
    match map.get(field) {
        None => Err(LoaderError::MissingField {
            morphology: morphology.to_string(),
            field: path,
        }),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(LoaderError::InvalidType {
            morphology: morphology.to_string(),
            field: path,
            expected: "a string",
        }),
    }
}

fn opt_str(map: &Mapping, field: &str, morphology: &str) -> Result<Option<String>> {
    opt_str_at(map, field, morphology, "")
}

fn opt_str_at(
    map: &Mapping,
    field: &str,
    morphology: &str,
    prefix: &str,
) -> Result<Option<String>> {
    let path = if prefix.is_empty() {
        field.to_string()
    } else {
        format!("{prefix}.{field}")
    };
    match map.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(LoaderError::InvalidType {
            morphology: morphology.to_string(),
            field: path,
            expected: "a string",
        }),
    }
}

fn opt_int(map: &Mapping, field: &str, morphology: &str) -> Result<Option<i64>> {
    match map.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) if n.as_i64().is_some() => Ok(n.as_i64()),
        // Integers sometimes arrive quoted; coerce them.
        Some(Value::String(s)) => match s.parse::<i64>() {
            Ok(n) => Ok(Some(n)),
            Err(_) => Err(LoaderError::InvalidType {
                morphology: morphology.to_string(),
                field: field.to_string(),
                expected: "an integer",
            }),
        },
        Some(_) => Err(LoaderError::InvalidType {
            morphology: morphology.to_string(),
            field: field.to_string(),
            expected: "an integer",
        }),
    }
}

fn expect_seq<'a>(value: &'a Value, morphology: &str, field: &str) -> Result<&'a Vec<Value>> {
    value.as_sequence().ok_or_else(|| LoaderError::InvalidType {
        morphology: morphology.to_string(),
        field: field.to_string(),
        expected: "a list",
    })
}

fn expect_map<'a>(value: &'a Value, morphology: &str, field: &str) -> Result<&'a Mapping> {
    value.as_mapping().ok_or_else(|| LoaderError::InvalidType {
        morphology: morphology.to_string(),
        field: field.to_string(),
        expected: "a mapping",
    })
}

fn string_list(value: &Value, morphology: &str, field: &str) -> Result<Vec<String>> {
    let seq = expect_seq(value, morphology, field)?;
    seq.iter()
        .enumerate()
        .map(|(i, item)| {
            item.as_str().map(str::to_string).ok_or_else(|| {
                LoaderError::InvalidType {
                    morphology: morphology.to_string(),
                    field: format!("{field}[{i}]"),
                    expected: "a string",
                }
            })
        })
        .collect()
}

fn opt_string_list(map: &Mapping, field: &str, morphology: &str) -> Result<Option<Vec<String>>> {
    match map.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => string_list(value, morphology, field).map(Some),
    }
}

fn lower_products(map: &Mapping, morphology: &str) -> Result<Vec<ProductSpec>> {
    let Some(value) = map.get("products") else {
        return Ok(Vec::new());
    };
    let list = expect_seq(value, morphology, "products")?;
    let mut products = Vec::new();
    for (i, item) in list.iter().enumerate() {
        let field = format!("products[{i}]");
        let spec = expect_map(item, morphology, &field)?;
        let artifact = require_str_at(spec, "artifact", morphology, &field)?;
        let include_value = spec.get("include").ok_or_else(|| LoaderError::MissingField {
            morphology: morphology.to_string(),
            field: format!("{field}.include"),
        })?;
        let include = string_list(include_value, morphology, &format!("{field}.include"))?;
        products.push(ProductSpec { artifact, include });
    }
    Ok(products)
}

fn json_field(map: &Mapping, field: &str, morphology: &str) -> Result<serde_json::Value> {
    match map.get(field) {
        None => Ok(serde_json::Value::Null),
        Some(value) => yaml_to_json(value, morphology, field),
    }
}

fn yaml_to_json(value: &Value, morphology: &str, field: &str) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(|_| LoaderError::InvalidType {
        morphology: morphology.to_string(),
        field: field.to_string(),
        expected: "a plain YAML value",
    })
}

fn morph_stem(path: &str) -> &str {
    let base = path.rsplit('/').next().unwrap_or(path);
    base.strip_suffix(".morph").unwrap_or(base)
}

// --- VERSION and DEFAULTS files ---

/// Parse a definitions VERSION file. Returns the version number if
/// the text is a YAML mapping with an integer `version` key.
pub fn parse_version_file(text: &str) -> Option<i64> {
    let value: Value = serde_yaml::from_str(text).ok()?;
    value.as_mapping()?.get("version")?.as_i64()
}

/// Validate a VERSION file and return the supported version number.
pub fn check_version_file(text: &str) -> Result<i64> {
    let version = parse_version_file(text).ok_or_else(|| LoaderError::InvalidVersionFile {
        text: text.trim().to_string(),
    })?;
    if !SUPPORTED_VERSIONS.contains(&version) {
        return Err(LoaderError::UnsupportedVersion { version });
    }
    Ok(version)
}

/// Parsed DEFAULTS document: extra build-system command tables plus
/// per-kind default split rules.
#[derive(Debug, Default)]
pub struct Defaults {
    pub build_systems: HashMap<BuildSystemKind, BuildSystem>,
    pub chunk_split_rules: DefaultRules,
    pub stratum_split_rules: DefaultRules,
}

impl Defaults {
    /// Parse a DEFAULTS file. An empty document is fine.
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_yaml::from_str(text).map_err(|e| LoaderError::InvalidDefaults {
            message: e.to_string(),
        })?;
        let mut defaults = Self::default();
        let Some(map) = value.as_mapping() else {
            if value.is_null() {
                return Ok(defaults);
            }
            return Err(LoaderError::InvalidDefaults {
                message: "document is not a mapping".to_string(),
            });
        };

        if let Some(section) = map.get("build-systems") {
            let systems = expect_map(section, "DEFAULTS", "build-systems")?;
            for (key, commands) in systems {
                let name = key.as_str().unwrap_or_default();
                let Some(kind) = BuildSystemKind::parse(name) else {
                    return Err(LoaderError::InvalidDefaults {
                        message: format!("unknown build system '{name}'"),
                    });
                };
                let table = expect_map(commands, "DEFAULTS", "build-systems")?;
                let mut system = BuildSystem::default();
                for phase in BuildPhase::ALL {
                    if let Some(list) = table.get(phase.field_name().as_str()) {
                        *system.commands_mut(phase) =
                            string_list(list, "DEFAULTS", &phase.field_name())?;
                    }
                }
                defaults.build_systems.insert(kind, system);
            }
        }

        if let Some(section) = map.get("split-rules") {
            let kinds = expect_map(section, "DEFAULTS", "split-rules")?;
            for (key, rules) in kinds {
                let kind = key.as_str().unwrap_or_default();
                let parsed = Self::parse_rules(rules)?;
                match kind {
                    "chunk" => defaults.chunk_split_rules = parsed,
                    "stratum" => defaults.stratum_split_rules = parsed,
                    other => {
                        return Err(LoaderError::InvalidDefaults {
                            message: format!("unknown split-rule kind '{other}'"),
                        })
                    }
                }
            }
        }

        Ok(defaults)
    }

    fn parse_rules(value: &Value) -> Result<DefaultRules> {
        let list = expect_seq(value, "DEFAULTS", "split-rules")?;
        let mut rules = Vec::new();
        for (i, item) in list.iter().enumerate() {
            let field = format!("split-rules[{i}]");
            let map = expect_map(item, "DEFAULTS", &field)?;
            let artifact = require_str_at(map, "artifact", "DEFAULTS", &field)?;
            let include_value = map.get("include").ok_or_else(|| LoaderError::MissingField {
                morphology: "DEFAULTS".to_string(),
                field: format!("{field}.include"),
            })?;
            let include = string_list(include_value, "DEFAULTS", &format!("{field}.include"))?;
            rules.push((artifact, include));
        }
        Ok(rules)
    }

    /// Fold the DEFAULTS build systems into a command registry.
    pub fn apply_to(&self, registry: &mut BuildSystemRegistry) {
        for (kind, system) in &self.build_systems {
            registry.register(*kind, system.clone());
        }
    }
}
