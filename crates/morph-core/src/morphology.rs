//! Typed morphology records.
//!
//! A morphology is a declarative recipe describing a chunk, stratum,
//! system or cluster. The loader lowers YAML into these records; after
//! that nothing in the build core touches untyped data.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The `kind` discriminator of a morphology document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MorphologyKind {
    Chunk,
    Stratum,
    System,
    Cluster,
}

impl MorphologyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chunk => "chunk",
            Self::Stratum => "stratum",
            Self::System => "system",
            Self::Cluster => "cluster",
        }
    }
}

/// Well-known build systems with predefined command tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildSystemKind {
    #[default]
    Manual,
    Autotools,
    PythonDistutils,
    Cpan,
    ModuleBuild,
    Cmake,
    Qmake,
    Dummy,
}

impl BuildSystemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Autotools => "autotools",
            Self::PythonDistutils => "python-distutils",
            Self::Cpan => "cpan",
            Self::ModuleBuild => "module-build",
            Self::Cmake => "cmake",
            Self::Qmake => "qmake",
            Self::Dummy => "dummy",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "manual" => Some(Self::Manual),
            "autotools" => Some(Self::Autotools),
            "python-distutils" => Some(Self::PythonDistutils),
            "cpan" => Some(Self::Cpan),
            "module-build" => Some(Self::ModuleBuild),
            "cmake" => Some(Self::Cmake),
            "qmake" => Some(Self::Qmake),
            "dummy" => Some(Self::Dummy),
            _ => None,
        }
    }
}

/// How a chunk is built relative to the staging sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    /// No staging chroot; host tools are visible on PATH.
    Bootstrap,
    /// Isolated staging chroot built from dependency artifacts.
    #[default]
    Staging,
    /// Like bootstrap, used for test builds of the tooling itself.
    Test,
}

impl BuildMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bootstrap => "bootstrap",
            Self::Staging => "staging",
            Self::Test => "test",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "bootstrap" => Some(Self::Bootstrap),
            "staging" => Some(Self::Staging),
            "test" => Some(Self::Test),
            _ => None,
        }
    }
}

/// Machine architectures a system morphology may target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Architecture {
    #[default]
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "x86_32")]
    X86_32,
    #[serde(rename = "armv7l")]
    Armv7l,
    #[serde(rename = "armv7b")]
    Armv7b,
    #[serde(rename = "armv5l")]
    Armv5l,
    #[serde(rename = "armv8l64")]
    Armv8l64,
    #[serde(rename = "armv8b64")]
    Armv8b64,
    #[serde(rename = "ppc64")]
    Ppc64,
    #[serde(rename = "mips32l")]
    Mips32l,
    #[serde(rename = "mips32b")]
    Mips32b,
    #[serde(rename = "mips64l")]
    Mips64l,
    #[serde(rename = "mips64b")]
    Mips64b,
}

impl Architecture {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::X86_32 => "x86_32",
            Self::Armv7l => "armv7l",
            Self::Armv7b => "armv7b",
            Self::Armv5l => "armv5l",
            Self::Armv8l64 => "armv8l64",
            Self::Armv8b64 => "armv8b64",
            Self::Ppc64 => "ppc64",
            Self::Mips32l => "mips32l",
            Self::Mips32b => "mips32b",
            Self::Mips64l => "mips64l",
            Self::Mips64b => "mips64b",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        [
            Self::X86_64,
            Self::X86_32,
            Self::Armv7l,
            Self::Armv7b,
            Self::Armv5l,
            Self::Armv8l64,
            Self::Armv8b64,
            Self::Ppc64,
            Self::Mips32l,
            Self::Mips32b,
            Self::Mips64l,
            Self::Mips64b,
        ]
        .into_iter()
        .find(|a| a.as_str() == name)
    }
}

/// One of the five command phases of a chunk build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
    Configure,
    Build,
    Test,
    Install,
    Strip,
}

impl BuildPhase {
    pub const ALL: [Self; 5] = [
        Self::Configure,
        Self::Build,
        Self::Test,
        Self::Install,
        Self::Strip,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configure => "configure",
            Self::Build => "build",
            Self::Test => "test",
            Self::Install => "install",
            Self::Strip => "strip",
        }
    }

    /// Morphology field name of the main command list, e.g. `build-commands`.
    pub fn field_name(&self) -> String {
        format!("{}-commands", self.as_str())
    }
}

/// A declared output artifact of a chunk or stratum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductSpec {
    pub artifact: String,
    pub include: Vec<String>,
}

/// Pre/main/post command lists for one build phase.
///
/// `main` is `None` when the morphology leaves the phase to its
/// build-system's predefined commands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseCommands {
    #[serde(default)]
    pub pre: Vec<String>,
    #[serde(default)]
    pub main: Option<Vec<String>>,
    #[serde(default)]
    pub post: Vec<String>,
}

/// A buildable unit, typically one upstream project.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ChunkMorphology {
    pub name: String,
    pub description: String,
    pub build_system: BuildSystemKind,
    pub configure_commands: PhaseCommands,
    pub build_commands: PhaseCommands,
    pub test_commands: PhaseCommands,
    pub install_commands: PhaseCommands,
    pub strip_commands: PhaseCommands,
    pub max_jobs: Option<u32>,
    pub products: Vec<ProductSpec>,
    pub system_integration: serde_json::Value,
    pub devices: serde_json::Value,
    pub prefix: String,
}

impl ChunkMorphology {
    pub fn phase(&self, phase: BuildPhase) -> &PhaseCommands {
        match phase {
            BuildPhase::Configure => &self.configure_commands,
            BuildPhase::Build => &self.build_commands,
            BuildPhase::Test => &self.test_commands,
            BuildPhase::Install => &self.install_commands,
            BuildPhase::Strip => &self.strip_commands,
        }
    }

    pub fn phase_mut(&mut self, phase: BuildPhase) -> &mut PhaseCommands {
        match phase {
            BuildPhase::Configure => &mut self.configure_commands,
            BuildPhase::Build => &mut self.build_commands,
            BuildPhase::Test => &mut self.test_commands,
            BuildPhase::Install => &mut self.install_commands,
            BuildPhase::Strip => &mut self.strip_commands,
        }
    }
}

/// A stratum's reference to another stratum morphology.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct StratumSpec {
    pub morph: String,
    pub repo: Option<String>,
    #[serde(rename = "ref")]
    pub ref_: Option<String>,
}

/// A stratum's reference to a chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ChunkSpec {
    pub name: String,
    /// Defaults to the chunk's name when omitted.
    pub repo: String,
    #[serde(rename = "ref")]
    pub ref_: Option<String>,
    /// Path of the chunk morphology inside its repository. Mutually
    /// exclusive with `build_system`.
    pub morph: Option<String>,
    pub build_system: Option<BuildSystemKind>,
    pub build_mode: BuildMode,
    pub prefix: Option<String>,
    /// Names of sibling chunks this chunk builds after. `None` means
    /// the chunk implicitly depends on every chunk listed before it;
    /// an empty list means it depends on none of them.
    pub build_depends: Option<Vec<String>>,
    /// Explicit chunk-artifact → stratum-artifact assignments.
    pub artifacts: BTreeMap<String, String>,
}

impl ChunkSpec {
    /// Morphology filename used to resolve this chunk.
    pub fn morphology_filename(&self) -> String {
        sanitise_morphology_path(self.morph.as_deref().unwrap_or(&self.name))
    }
}

/// An ordered collection of chunks plus stratum build-dependencies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct StratumMorphology {
    pub name: String,
    pub description: String,
    pub build_depends: Vec<StratumSpec>,
    pub chunks: Vec<ChunkSpec>,
    pub products: Vec<ProductSpec>,
}

/// A system's reference to a stratum, optionally selecting artifacts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SystemStratumSpec {
    pub name: Option<String>,
    pub morph: String,
    pub repo: Option<String>,
    #[serde(rename = "ref")]
    pub ref_: Option<String>,
    /// When set, only these stratum artifacts go into the system.
    pub artifacts: Option<Vec<String>>,
}

impl SystemStratumSpec {
    /// The stratum source name this spec refers to.
    pub fn source_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.morph)
    }
}

/// A bootable root filesystem composed of strata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SystemMorphology {
    pub name: String,
    pub description: String,
    pub arch: Architecture,
    pub strata: Vec<SystemStratumSpec>,
    pub configuration_extensions: Vec<String>,
}

/// One system deployment inside a cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ClusterSystemSpec {
    pub morph: String,
    /// Deployment name → deployment parameters.
    pub deploy: BTreeMap<String, serde_json::Value>,
    pub deploy_defaults: BTreeMap<String, serde_json::Value>,
    pub subsystems: Vec<ClusterSystemSpec>,
}

/// A deployment recipe referencing systems. Validated but not built.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ClusterMorphology {
    pub name: String,
    pub description: String,
    pub systems: Vec<ClusterSystemSpec>,
}

/// A validated morphology of exactly one kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Morphology {
    Chunk(ChunkMorphology),
    Stratum(StratumMorphology),
    System(SystemMorphology),
    Cluster(ClusterMorphology),
}

impl Morphology {
    pub fn kind(&self) -> MorphologyKind {
        match self {
            Self::Chunk(_) => MorphologyKind::Chunk,
            Self::Stratum(_) => MorphologyKind::Stratum,
            Self::System(_) => MorphologyKind::System,
            Self::Cluster(_) => MorphologyKind::Cluster,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Chunk(m) => &m.name,
            Self::Stratum(m) => &m.name,
            Self::System(m) => &m.name,
            Self::Cluster(m) => &m.name,
        }
    }

    pub fn as_chunk(&self) -> Option<&ChunkMorphology> {
        match self {
            Self::Chunk(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_stratum(&self) -> Option<&StratumMorphology> {
        match self {
            Self::Stratum(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_system(&self) -> Option<&SystemMorphology> {
        match self {
            Self::System(m) => Some(m),
            _ => None,
        }
    }
}

/// Normalise a morphology reference into a repository-relative path.
///
/// References may be written with or without the `.morph` suffix;
/// the canonical form always carries it.
pub fn sanitise_morphology_path(path: &str) -> String {
    if path.ends_with(".morph") {
        path.to_string()
    } else {
        format!("{path}.morph")
    }
}
