//! Builders for chunks, strata and systems.
//!
//! A chunk is checked out into a staging area, taken through its
//! command phases, and its install tree is split into per-artifact
//! tarballs. A stratum artifact is a manifest of the chunk artifacts
//! its split rules claimed. A system artifact is the unpacked union
//! of its strata's chunk artifacts, repacked as one rootfs tarball.
//! Every artifact of a source is published together.

use crate::artifactcache::{
    artifact_basename, source_metadata_basename, CacheError, LocalArtifactCache,
};
use crate::repocache::{LocalRepoCache, RepoCacheError};
use crate::staging::{hardlink_all_files, StagingArea, StagingError};
use flate2::write::GzEncoder;
use flate2::Compression;
use morph_core::graph::ArtifactGraph;
use morph_core::morphology::{BuildMode, BuildPhase, MorphologyKind};
use morph_core::splitrules::SplitRuleError;
use morph_core::{BuildEnvironment, BuildSystemRegistry, Settings};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Staging(#[from] StagingError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Repo(#[from] RepoCacheError),
    #[error(transparent)]
    SplitRule(#[from] SplitRuleError),
    #[error("build i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("artifact metadata error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("artifact {0} has no cache key")]
    MissingCacheKey(String),
    #[error(
        "{source_name}: {phase} command exited with status {exit_code}: {command} (log: {log})"
    )]
    CommandFailed {
        source_name: String,
        phase: String,
        command: String,
        exit_code: i32,
        log: String,
    },
}

pub type Result<T> = std::result::Result<T, BuildError>;

/// One member of a stratum artifact: a pointer into the artifact
/// cache.
#[derive(Debug, Serialize, Deserialize)]
pub struct StratumMember {
    pub cache_key: String,
    pub source: String,
    pub artifact: String,
    pub basename: String,
}

/// Executes individual source builds against the caches.
#[derive(Debug)]
pub struct Builder<'a> {
    pub settings: &'a Settings,
    pub lrc: &'a LocalRepoCache,
    pub lac: &'a LocalArtifactCache,
    pub build_env: &'a BuildEnvironment,
    pub registry: &'a BuildSystemRegistry,
    pub max_jobs: u32,
}

impl Builder<'_> {
    /// Build every artifact of the source owning `artifact_idx` and
    /// publish them into the local cache.
    pub async fn build_source(&self, graph: &ArtifactGraph, artifact_idx: usize) -> Result<()> {
        let source_idx = graph.artifact(artifact_idx).source;
        match graph.pool.get(source_idx).kind() {
            MorphologyKind::Chunk => self.build_chunk(graph, source_idx).await,
            MorphologyKind::Stratum => self.build_stratum(graph, source_idx),
            MorphologyKind::System => self.build_system(graph, source_idx),
            MorphologyKind::Cluster => Ok(()),
        }
    }

    fn cache_key_of(&self, graph: &ArtifactGraph, source_idx: usize) -> Result<String> {
        let idx = graph.artifacts_of_source(source_idx)[0];
        graph
            .artifact(idx)
            .cache_key
            .clone()
            .ok_or_else(|| BuildError::MissingCacheKey(graph.artifact(idx).name.clone()))
    }

    /// Chunk artifact dependencies shared by a source's artifacts.
    fn chunk_dependencies(&self, graph: &ArtifactGraph, source_idx: usize) -> Vec<usize> {
        let mut seen = BTreeSet::new();
        for &artifact in graph.artifacts_of_source(source_idx) {
            for &dep in &graph.artifact(artifact).dependencies {
                if graph.source_of(dep).kind() == MorphologyKind::Chunk {
                    seen.insert(dep);
                }
            }
        }
        seen.into_iter().collect()
    }

    async fn build_chunk(&self, graph: &ArtifactGraph, source_idx: usize) -> Result<()> {
        let source = graph.pool.get(source_idx);
        let cache_key = self.cache_key_of(graph, source_idx)?;
        let chunk = source
            .morphology
            .as_chunk()
            .expect("chunk sources carry chunk morphologies")
            .clone();
        let name = chunk.name.clone();
        info!(chunk = %name, cache_key = %cache_key, "building chunk");

        let use_chroot = self.settings.staging_chroot && source.build_mode == BuildMode::Staging;
        let staging = StagingArea::create(
            &self.settings.tempdir,
            &name,
            self.build_env,
            use_chroot,
            &[],
        )?;

        let chunks_dir = self.settings.tempdir.join("chunks");
        for dep in self.chunk_dependencies(graph, source_idx) {
            let dep_artifact = graph.artifact(dep);
            let dep_source = graph.source_of(dep);
            let dep_key = dep_artifact
                .cache_key
                .clone()
                .ok_or_else(|| BuildError::MissingCacheKey(dep_artifact.name.clone()))?;
            let blob = self.lac.file_path(&artifact_basename(
                &dep_key,
                dep_source.name(),
                &dep_artifact.name,
            ));
            staging.install_artifact(&chunks_dir, &blob)?;
        }

        let builddir = staging.builddir();
        self.lrc
            .extract_commit(&source.repo_name, &source.sha1, &builddir)?;

        let log_path = staging.dirname().with_extension("log");
        let mut log = File::create(&log_path)?;
        let mut build_times: BTreeMap<String, f64> = BTreeMap::new();

        let mut phase_env = BTreeMap::new();
        phase_env.insert("PREFIX".to_string(), source.prefix.clone());

        let result = self
            .run_phases(&staging, &chunk, &cache_key, &phase_env, &mut log, &mut build_times)
            .await;

        // The log is cached even for failed builds so they can be
        // inspected afterwards.
        drop(log);
        let log_bytes = fs::read(&log_path)?;
        self.lac
            .put_bytes(&source_metadata_basename(&cache_key, "build-log"), &log_bytes)?;
        result?;

        self.package_chunk(&staging, source, &cache_key)?;

        self.lac.put_bytes(
            &source_metadata_basename(&cache_key, "build-times"),
            &serde_json::to_vec(&build_times)?,
        )?;

        fs::remove_file(&log_path)?;
        staging.remove()?;
        Ok(())
    }

    async fn run_phases(
        &self,
        staging: &StagingArea,
        chunk: &morph_core::ChunkMorphology,
        cache_key: &str,
        base_env: &BTreeMap<String, String>,
        log: &mut File,
        build_times: &mut BTreeMap<String, f64>,
    ) -> Result<()> {
        let builddir = staging.builddir();
        let destdir = staging.destdir();
        let jobs = chunk.max_jobs.unwrap_or(self.max_jobs).max(1);

        for phase in BuildPhase::ALL {
            let started = Instant::now();
            let commands = chunk.phase(phase);
            let main = self.registry.resolved_commands(chunk, phase);

            let mut env = base_env.clone();
            env.insert(
                "DESTDIR".to_string(),
                staging.relative(&destdir).display().to_string(),
            );

            for (stage, commands) in [
                ("pre", commands.pre.clone()),
                ("main", main),
                ("post", commands.post.clone()),
            ] {
                let mut env = env.clone();
                if phase == BuildPhase::Build && stage == "main" && jobs > 1 {
                    env.insert("MAKEFLAGS".to_string(), format!("-j{jobs}"));
                }
                for command in commands {
                    let result = staging.runcmd(&command, &builddir, &env, Some(log)).await?;
                    if result.exit_code != 0 {
                        return Err(BuildError::CommandFailed {
                            source_name: chunk.name.clone(),
                            phase: phase.as_str().to_string(),
                            command,
                            exit_code: result.exit_code,
                            log: source_metadata_basename(cache_key, "build-log"),
                        });
                    }
                }
            }

            build_times.insert(
                phase.as_str().to_string(),
                started.elapsed().as_secs_f64(),
            );
        }
        Ok(())
    }

    fn package_chunk(
        &self,
        staging: &StagingArea,
        source: &morph_core::Source,
        cache_key: &str,
    ) -> Result<()> {
        let destdir = staging.destdir();
        let files = list_tree_files(&destdir)?;
        let partition = source.split_rules.partition_files(files.into_iter());

        for (file, artifacts) in &partition.overlaps {
            warn!(
                file,
                artifacts = artifacts.join(", "),
                "file matches more than one artifact; first match wins"
            );
        }
        for file in &partition.unmatched {
            warn!(file, chunk = source.name(), "file not matched by any split rule");
        }

        for artifact_name in source.split_rules.artifacts() {
            let empty = Vec::new();
            let members = partition.matches.get(artifact_name).unwrap_or(&empty);
            let basename = artifact_basename(cache_key, source.name(), artifact_name);
            let save = self.lac.put(&basename)?;
            pack_tree(&destdir, members, save)?.commit()?;
            info!(artifact = %basename, files = members.len(), "published chunk artifact");
        }
        Ok(())
    }

    fn build_stratum(&self, graph: &ArtifactGraph, source_idx: usize) -> Result<()> {
        let source = graph.pool.get(source_idx);
        let cache_key = self.cache_key_of(graph, source_idx)?;
        info!(stratum = source.name(), cache_key = %cache_key, "assembling stratum");

        // Partition the chunk artifacts this stratum depends on using
        // its split rules; each stratum artifact lists its members.
        let mut pairs = Vec::new();
        for dep in self.chunk_dependencies(graph, source_idx) {
            let dep_artifact = graph.artifact(dep);
            let dep_source = graph.source_of(dep);
            pairs.push((dep, (dep_source.name().to_string(), dep_artifact.name.clone())));
        }

        let partition = source
            .split_rules
            .partition_artifacts(pairs.iter().map(|(_, pair)| pair.clone()));

        for artifact_name in source.split_rules.artifacts() {
            let empty = Vec::new();
            let matched = partition.matches.get(artifact_name).unwrap_or(&empty);
            let members: Vec<StratumMember> = matched
                .iter()
                .filter_map(|pair| {
                    pairs
                        .iter()
                        .find(|(_, p)| p == pair)
                        .map(|(dep, (source_name, artifact))| {
                            let dep_key = graph
                                .artifact(*dep)
                                .cache_key
                                .clone()
                                .unwrap_or_default();
                            StratumMember {
                                basename: artifact_basename(&dep_key, source_name, artifact),
                                cache_key: dep_key,
                                source: source_name.clone(),
                                artifact: artifact.clone(),
                            }
                        })
                })
                .collect();

            let basename = artifact_basename(&cache_key, source.name(), artifact_name);
            self.lac
                .put_bytes(&basename, &serde_json::to_vec_pretty(&members)?)?;
            info!(artifact = %basename, members = members.len(), "published stratum artifact");
        }
        Ok(())
    }

    fn build_system(&self, graph: &ArtifactGraph, source_idx: usize) -> Result<()> {
        let source = graph.pool.get(source_idx);
        let cache_key = self.cache_key_of(graph, source_idx)?;
        info!(system = source.name(), cache_key = %cache_key, "assembling system rootfs");

        let staging_root = tempfile::Builder::new()
            .prefix("system-")
            .tempdir_in(&self.settings.tempdir)?;
        let rootfs = staging_root.path().join("rootfs");
        fs::create_dir_all(&rootfs)?;

        let chunks_dir = self.settings.tempdir.join("chunks");
        for &artifact in graph.artifacts_of_source(source_idx) {
            for &dep in &graph.artifact(artifact).dependencies {
                if graph.source_of(dep).kind() != MorphologyKind::Stratum {
                    continue;
                }
                let dep_artifact = graph.artifact(dep);
                let dep_source = graph.source_of(dep);
                let dep_key = dep_artifact
                    .cache_key
                    .clone()
                    .ok_or_else(|| BuildError::MissingCacheKey(dep_artifact.name.clone()))?;
                let manifest = self.lac.get_bytes(&artifact_basename(
                    &dep_key,
                    dep_source.name(),
                    &dep_artifact.name,
                ))?;
                let members: Vec<StratumMember> = serde_json::from_slice(&manifest)?;
                for member in members {
                    self.unpack_member_into(&chunks_dir, &member, &rootfs)?;
                }
            }
        }

        for artifact_name in source.split_rules.artifacts() {
            let files = list_tree_files(&rootfs)?;
            let basename = artifact_basename(&cache_key, source.name(), artifact_name);
            let save = self.lac.put(&basename)?;
            pack_tree(&rootfs, &files, save)?.commit()?;
            info!(artifact = %basename, files = files.len(), "published system artifact");
        }
        Ok(())
    }

    fn unpack_member_into(
        &self,
        chunks_dir: &Path,
        member: &StratumMember,
        rootfs: &Path,
    ) -> Result<()> {
        let blob = self.lac.get(&member.basename)?;
        let unpacked = chunks_dir.join(format!("{}.d", member.basename));
        if !unpacked.exists() {
            fs::create_dir_all(&unpacked)?;
            let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(blob));
            archive.set_preserve_permissions(true);
            archive.unpack(&unpacked)?;
        }
        hardlink_all_files(&unpacked, rootfs)?;
        Ok(())
    }
}

/// Relative paths of every file and symlink under `root`, sorted.
pub fn list_tree_files(root: &Path) -> std::io::Result<Vec<String>> {
    fn visit(root: &Path, dir: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() && !file_type.is_symlink() {
                visit(root, &path, out)?;
            } else {
                let rel = path
                    .strip_prefix(root)
                    .expect("walked paths sit under the root")
                    .to_string_lossy()
                    .into_owned();
                out.push(rel);
            }
        }
        Ok(())
    }
    let mut files = Vec::new();
    if root.exists() {
        visit(root, root, &mut files)?;
    }
    files.sort();
    Ok(files)
}

/// Write the named files from `root` as a gzipped tarball, handing
/// the writer back so the caller can publish it.
fn pack_tree<W: Write>(root: &Path, files: &[String], writer: W) -> Result<W> {
    let encoder = GzEncoder::new(writer, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    for file in files {
        builder.append_path_with_name(root.join(file), file)?;
    }
    let encoder = builder.into_inner()?;
    let mut writer = encoder.finish()?;
    writer.flush()?;
    Ok(writer)
}
