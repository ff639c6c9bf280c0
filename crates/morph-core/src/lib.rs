pub mod aliases;
pub mod buildenv;
pub mod buildsystem;
pub mod cachekey;
pub mod graph;
pub mod loader;
pub mod morphology;
pub mod protocol;
pub mod serialise;
pub mod settings;
pub mod source;
pub mod splitrules;

pub use aliases::RepoAliasResolver;
pub use buildenv::BuildEnvironment;
pub use buildsystem::{detect_build_system, BuildSystem, BuildSystemRegistry};
pub use cachekey::compute_keys;
pub use graph::{Artifact, ArtifactGraph, ArtifactIndex, ArtifactResolver, BuildOrder, GraphError};
pub use loader::{Defaults, LoaderError, MorphologyLoader};
pub use morphology::{
    sanitise_morphology_path, Architecture, BuildMode, BuildPhase, BuildSystemKind,
    ChunkMorphology, ChunkSpec, Morphology, MorphologyKind, StratumMorphology, SystemMorphology,
};
pub use protocol::{BuildInfo, BuildRequest, BuildStatus, Message, PROTOCOL_VERSION};
pub use serialise::{deserialise_artifact, serialise_artifact};
pub use settings::{LocalChanges, Settings};
pub use source::{Source, SourcePool};
pub use splitrules::{
    catch_all_rules, unify_chunk_rules, unify_stratum_rules, unify_system_rules, DefaultRules,
    Matcher, Partition, SplitRules,
};
