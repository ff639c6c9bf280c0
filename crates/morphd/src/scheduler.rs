//! The build scheduler.
//!
//! Walks an artifact graph in dependency order, elides artifacts the
//! caches already hold, and drives the builders group by group.
//! Artifacts inside one build group share no edges, so they build in
//! parallel behind a semaphore. A cache key is built at most once per
//! run; failures cascade to dependents as skips while independent
//! branches continue.

use crate::artifactcache::{artifact_basename, CacheError, LocalArtifactCache};
use crate::builder::{BuildError, Builder};
use crate::remote::{RemoteArtifactCache, RemoteError};
use crate::repocache::LocalRepoCache;
use morph_core::graph::{ArtifactGraph, BuildOrder, GraphError};
use morph_core::MorphologyKind;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("scheduler shutdown")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Where each artifact ended up after a scheduler run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Already present in the local cache.
    Cached,
    /// Streamed in from the remote cache.
    Downloaded,
    /// Built in this run.
    Built,
    /// A build phase failed; the reason is kept for reporting.
    Failed(String),
    /// Not attempted because a dependency failed.
    Skipped,
}

/// Progress notifications for log streaming.
#[derive(Debug, Clone)]
pub enum BuildEvent {
    Status(String),
    ArtifactStarted(String),
    ArtifactBuilt(String),
    ArtifactFailed { artifact: String, reason: String },
}

/// Summary of one scheduler run.
#[derive(Debug, Default)]
pub struct BuildReport {
    /// Artifact name → outcome, for every artifact in the graph.
    pub outcomes: BTreeMap<String, Outcome>,
}

impl BuildReport {
    pub fn succeeded(&self) -> bool {
        !self
            .outcomes
            .values()
            .any(|o| matches!(o, Outcome::Failed(_) | Outcome::Skipped))
    }

    pub fn built_count(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| matches!(o, Outcome::Built))
            .count()
    }

    pub fn failures(&self) -> Vec<(&str, &str)> {
        self.outcomes
            .iter()
            .filter_map(|(name, outcome)| match outcome {
                Outcome::Failed(reason) => Some((name.as_str(), reason.as_str())),
                _ => None,
            })
            .collect()
    }
}

/// Drives topologically-ordered, at-most-once builds.
pub struct BuildScheduler<'a> {
    pub builder: Builder<'a>,
    pub lac: &'a LocalArtifactCache,
    pub rac: Option<&'a RemoteArtifactCache>,
    pub lrc: &'a LocalRepoCache,
    pub max_parallel: usize,
    pub events: Option<mpsc::UnboundedSender<BuildEvent>>,
    shutdown: AtomicBool,
}

impl<'a> BuildScheduler<'a> {
    pub fn new(
        builder: Builder<'a>,
        lac: &'a LocalArtifactCache,
        rac: Option<&'a RemoteArtifactCache>,
        lrc: &'a LocalRepoCache,
        max_parallel: usize,
        events: Option<mpsc::UnboundedSender<BuildEvent>>,
    ) -> Self {
        Self {
            builder,
            lac,
            rac,
            lrc,
            max_parallel: max_parallel.max(1),
            events,
            shutdown: AtomicBool::new(false),
        }
    }

    /// Ask the scheduler to stop starting new builds.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn emit(&self, event: BuildEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn basename(graph: &ArtifactGraph, idx: usize) -> Option<String> {
        let artifact = graph.artifact(idx);
        let source = graph.source_of(idx);
        artifact
            .cache_key
            .as_ref()
            .map(|key| artifact_basename(key, source.name(), &artifact.name))
    }

    /// Build everything the graph needs. Artifacts already in the
    /// local cache, or fetchable from the remote cache, are not
    /// rebuilt.
    pub async fn build(&self, graph: &ArtifactGraph) -> Result<BuildReport> {
        self.build_selection(graph, None).await
    }

    /// Like [`BuildScheduler::build`], limited to the dependency
    /// closures of the given target artifacts.
    pub async fn build_selection(
        &self,
        graph: &ArtifactGraph,
        targets: Option<&[usize]>,
    ) -> Result<BuildReport> {
        let order = BuildOrder::new(graph)?;
        let allowed: Option<HashSet<usize>> = targets.map(|targets| {
            targets
                .iter()
                .flat_map(|&target| graph.walk(target))
                .collect()
        });
        let in_selection =
            |idx: usize| allowed.as_ref().map_or(true, |set| set.contains(&idx));

        let mut outcomes: BTreeMap<usize, Outcome> = BTreeMap::new();
        let mut needed: Vec<usize> = Vec::new();

        // First pass: elide whatever a cache already has.
        for &idx in &order.order {
            if !in_selection(idx) {
                continue;
            }
            let Some(basename) = Self::basename(graph, idx) else {
                needed.push(idx);
                continue;
            };
            if self.lac.has(&basename) {
                outcomes.insert(idx, Outcome::Cached);
            } else if self.fetch_from_remote(&basename).await? {
                self.emit(BuildEvent::Status(format!("fetched {basename}")));
                outcomes.insert(idx, Outcome::Downloaded);
            } else {
                needed.push(idx);
            }
        }
        info!(
            cached = outcomes.len(),
            needed = needed.len(),
            "cache elision complete"
        );

        // Second pass: build what is left, group by group.
        let needed_set: HashSet<usize> = needed.iter().copied().collect();
        let mut broken: HashSet<usize> = HashSet::new();
        let mut built_keys: HashSet<String> = HashSet::new();
        let semaphore = Semaphore::new(self.max_parallel);

        for group in &order.groups {
            if self.is_shutdown() {
                for &idx in group {
                    if needed_set.contains(&idx) && !outcomes.contains_key(&idx) {
                        outcomes.insert(idx, Outcome::Skipped);
                        broken.insert(idx);
                    }
                }
                continue;
            }

            // One job per source; a single build publishes every
            // artifact of its source.
            let mut jobs: Vec<(usize, Vec<usize>)> = Vec::new();
            for &idx in group {
                if !needed_set.contains(&idx) || outcomes.contains_key(&idx) {
                    continue;
                }
                let artifact = graph.artifact(idx);
                if artifact.dependencies.iter().any(|d| broken.contains(d)) {
                    outcomes.insert(idx, Outcome::Skipped);
                    broken.insert(idx);
                    continue;
                }
                if let Some(key) = &artifact.cache_key {
                    if built_keys.contains(key) {
                        outcomes.insert(idx, Outcome::Built);
                        continue;
                    }
                }
                if let Some(job) = jobs.iter_mut().find(|(s, _)| *s == artifact.source) {
                    job.1.push(idx);
                } else {
                    jobs.push((artifact.source, vec![idx]));
                }
            }

            if jobs.is_empty() {
                continue;
            }

            // Chunk sources need their repository mirrored before the
            // staging checkout.
            for (source_idx, _) in &jobs {
                let source = graph.pool.get(*source_idx);
                if source.kind() == MorphologyKind::Chunk && !self.lrc.has_repo(&source.repo_name)
                {
                    if let Err(e) = self.lrc.cache_repo(&source.repo_name) {
                        warn!(repo = %source.repo_name, error = %e, "failed to mirror repository");
                    }
                }
            }

            let results = futures_util::future::join_all(jobs.iter().map(
                |(source_idx, artifacts)| {
                    let semaphore = &semaphore;
                    async move {
                        let _permit =
                            semaphore.acquire().await.expect("semaphore never closes");
                        let lead = artifacts[0];
                        let name = graph.artifact(lead).name.clone();
                        self.emit(BuildEvent::ArtifactStarted(name.clone()));
                        let result = self.builder.build_source(graph, lead).await;
                        (*source_idx, artifacts.clone(), name, result)
                    }
                },
            ))
            .await;

            for (source_idx, artifacts, name, result) in results {
                match result {
                    Ok(()) => {
                        self.emit(BuildEvent::ArtifactBuilt(name));
                        for idx in graph.artifacts_of_source(source_idx) {
                            if needed_set.contains(idx) {
                                outcomes.insert(*idx, Outcome::Built);
                            }
                            if let Some(key) = &graph.artifact(*idx).cache_key {
                                built_keys.insert(key.clone());
                            }
                        }
                    }
                    Err(error) => {
                        let reason = describe_failure(&error);
                        self.emit(BuildEvent::ArtifactFailed {
                            artifact: name,
                            reason: reason.clone(),
                        });
                        for &idx in &artifacts {
                            outcomes.insert(idx, Outcome::Failed(reason.clone()));
                            broken.insert(idx);
                        }
                        for idx in graph.artifacts_of_source(source_idx) {
                            broken.insert(*idx);
                            outcomes
                                .entry(*idx)
                                .or_insert_with(|| Outcome::Failed(reason.clone()));
                        }
                    }
                }
            }
        }

        let mut report = BuildReport::default();
        for (idx, outcome) in outcomes {
            report
                .outcomes
                .insert(graph.artifact(idx).name.clone(), outcome);
        }
        Ok(report)
    }

    /// Try to stream one artifact from the remote cache into the
    /// local one. Remote trouble degrades to "not cached".
    async fn fetch_from_remote(&self, basename: &str) -> Result<bool> {
        let Some(rac) = self.rac else {
            return Ok(false);
        };
        match rac.get(basename).await {
            Ok(Some(bytes)) => {
                self.lac.put_bytes(basename, &bytes)?;
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(RemoteError::Status { status, url }) => {
                warn!(status, url = %url, "remote artifact cache error; treating as miss");
                Ok(false)
            }
            Err(e) => {
                warn!(error = %e, "remote artifact cache unreachable; treating as miss");
                Ok(false)
            }
        }
    }
}

fn describe_failure(error: &BuildError) -> String {
    match error {
        BuildError::CommandFailed {
            source_name,
            phase,
            command,
            exit_code,
            log,
        } => format!(
            "{source_name}: {phase} command '{command}' exited with status {exit_code} (log: {log})"
        ),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifactcache::source_metadata_basename;
    use morph_core::graph::ArtifactResolver;
    use morph_core::morphology::{
        BuildMode, BuildSystemKind, ChunkMorphology, ChunkSpec, Morphology, ProductSpec,
        StratumMorphology,
    };
    use morph_core::source::{Source, SourcePool};
    use morph_core::splitrules::{unify_chunk_rules, unify_stratum_rules};
    use morph_core::{
        compute_keys, BuildEnvironment, BuildSystemRegistry, RepoAliasResolver, Settings,
    };
    use std::collections::BTreeMap as Map;
    use std::io::Read;
    use std::process::Command;
    use tempfile::TempDir;

    struct Fixture {
        _root: TempDir,
        settings: Settings,
        lrc: LocalRepoCache,
        lac: LocalArtifactCache,
        build_env: BuildEnvironment,
        registry: BuildSystemRegistry,
        repo_url: String,
        _upstream: TempDir,
    }

    fn git(dir: &std::path::Path, args: &[&str]) {
        let out = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(out.status.success(), "git {args:?} failed");
    }

    fn fixture() -> Fixture {
        let root = TempDir::new().unwrap();
        let mut settings = Settings::default();
        settings.cachedir = root.path().join("cache");
        settings.tempdir = root.path().join("tmp");
        settings.staging_chroot = false;
        settings.no_ccache = true;
        std::fs::create_dir_all(&settings.tempdir).unwrap();

        let upstream = TempDir::new().unwrap();
        git(upstream.path(), &["init", "--quiet", "--initial-branch=main"]);
        git(upstream.path(), &["config", "user.email", "t@t"]);
        git(upstream.path(), &["config", "user.name", "t"]);
        std::fs::write(upstream.path().join("hello.c"), "int main(void) {}\n").unwrap();
        git(upstream.path(), &["add", "."]);
        git(upstream.path(), &["commit", "--quiet", "-m", "initial"]);
        let repo_url = format!("file://{}", upstream.path().display());

        let lrc = LocalRepoCache::new(settings.gits_dir(), RepoAliasResolver::default());
        lrc.cache_repo(&repo_url).unwrap();
        let lac = LocalArtifactCache::new(settings.artifacts_dir()).unwrap();
        let build_env = BuildEnvironment::with_host_env(&settings, "x86_64", &Map::new());

        Fixture {
            settings,
            lrc,
            lac,
            build_env,
            registry: BuildSystemRegistry::standard(),
            repo_url,
            _upstream: upstream,
            _root: root,
        }
    }

    fn chunk_source(
        fx: &Fixture,
        name: &str,
        install: &str,
        products: Vec<ProductSpec>,
    ) -> Source {
        let mut chunk = ChunkMorphology {
            name: name.to_string(),
            build_system: BuildSystemKind::Manual,
            prefix: "/usr".to_string(),
            products,
            ..ChunkMorphology::default()
        };
        chunk.install_commands.main = Some(vec![install.to_string()]);

        let (sha1, tree) = fx.lrc.resolve_ref(&fx.repo_url, "main").unwrap();
        let rules = unify_chunk_rules(&chunk, &Vec::new()).unwrap();
        let mut source = Source::new(
            fx.repo_url.clone(),
            "main",
            sha1,
            tree,
            format!("{name}.morph"),
            Morphology::Chunk(chunk),
            rules,
        );
        source.build_mode = BuildMode::Bootstrap;
        source
    }

    fn stratum_over(fx: &Fixture, name: &str, chunk_name: &str) -> Source {
        let stratum = StratumMorphology {
            name: name.to_string(),
            chunks: vec![ChunkSpec {
                name: chunk_name.to_string(),
                repo: fx.repo_url.clone(),
                ref_: Some("main".to_string()),
                build_system: Some(BuildSystemKind::Manual),
                build_mode: BuildMode::Bootstrap,
                ..ChunkSpec::default()
            }],
            ..StratumMorphology::default()
        };
        let rules = unify_stratum_rules(&stratum, &Vec::new()).unwrap();
        let (sha1, tree) = fx.lrc.resolve_ref(&fx.repo_url, "main").unwrap();
        Source::new(
            "definitions",
            "main",
            sha1,
            tree,
            format!("{name}.morph"),
            Morphology::Stratum(stratum),
            rules,
        )
    }

    fn keyed(fx: &Fixture, pool: SourcePool) -> ArtifactGraph {
        let mut graph = ArtifactResolver::new("x86_64").resolve(pool).unwrap();
        compute_keys(&mut graph, &fx.build_env, &fx.registry).unwrap();
        graph
    }

    fn scheduler(fx: &Fixture) -> BuildScheduler<'_> {
        BuildScheduler::new(
            Builder {
                settings: &fx.settings,
                lrc: &fx.lrc,
                lac: &fx.lac,
                build_env: &fx.build_env,
                registry: &fx.registry,
                max_jobs: 1,
            },
            &fx.lac,
            None,
            &fx.lrc,
            2,
            None,
        )
    }

    #[tokio::test]
    async fn single_chunk_builds_and_caches() {
        let fx = fixture();
        let source = chunk_source(
            &fx,
            "chunk",
            "mkdir -p \"$DESTDIR/usr/bin\" && echo tool > \"$DESTDIR/usr/bin/tool\"",
            Vec::new(),
        );
        let mut pool = SourcePool::new();
        pool.add(source);
        let graph = keyed(&fx, pool);

        let report = scheduler(&fx).build(&graph).await.unwrap();
        assert!(report.succeeded(), "failures: {:?}", report.failures());
        assert_eq!(report.outcomes["chunk"], Outcome::Built);

        let key = graph.artifact(0).cache_key.clone().unwrap();
        assert!(fx.lac.has(&artifact_basename(&key, "chunk", "chunk")));
        assert!(fx.lac.has(&source_metadata_basename(&key, "build-log")));
        assert!(fx.lac.has(&source_metadata_basename(&key, "build-times")));
    }

    #[tokio::test]
    async fn products_split_install_tree_into_artifacts() {
        let fx = fixture();
        let install = "mkdir -p \"$DESTDIR/usr/bin\" \"$DESTDIR/usr/include\" \
                       \"$DESTDIR/usr/share/doc\" && \
                       echo foo > \"$DESTDIR/usr/bin/foo\" && \
                       echo h > \"$DESTDIR/usr/include/foo.h\" && \
                       echo doc > \"$DESTDIR/usr/share/doc/x\"";
        let products = vec![
            ProductSpec {
                artifact: "chunk-runtime".to_string(),
                include: vec![
                    "usr/bin".to_string(),
                    "usr/sbin".to_string(),
                    "usr/lib".to_string(),
                    "usr/libexec".to_string(),
                ],
            },
            ProductSpec {
                artifact: "chunk-devel".to_string(),
                include: vec!["usr/include".to_string()],
            },
        ];
        let source = chunk_source(&fx, "chunk", install, products);
        let mut pool = SourcePool::new();
        pool.add(source);
        let graph = keyed(&fx, pool);

        let report = scheduler(&fx).build(&graph).await.unwrap();
        assert!(report.succeeded(), "failures: {:?}", report.failures());

        let key = graph.artifact(0).cache_key.clone().unwrap();
        let list_tar = |artifact: &str| -> Vec<String> {
            let blob = fx
                .lac
                .get(&artifact_basename(&key, "chunk", artifact))
                .unwrap();
            let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(blob));
            archive
                .entries()
                .unwrap()
                .map(|e| e.unwrap().path().unwrap().display().to_string())
                .collect()
        };

        assert_eq!(list_tar("chunk-runtime"), vec!["usr/bin/foo"]);
        assert_eq!(list_tar("chunk-devel"), vec!["usr/include/foo.h"]);
        // The doc file matched no product and stays out of both.
        for name in ["chunk-runtime", "chunk-devel"] {
            assert!(!list_tar(name).contains(&"usr/share/doc/x".to_string()));
        }
    }

    #[tokio::test]
    async fn cached_artifacts_are_not_rebuilt() {
        let fx = fixture();
        let source = chunk_source(
            &fx,
            "chunk",
            "mkdir -p \"$DESTDIR/usr\" && echo x > \"$DESTDIR/usr/file\"",
            Vec::new(),
        );
        let mut pool = SourcePool::new();
        pool.add(source);
        let graph = keyed(&fx, pool);

        let first = scheduler(&fx).build(&graph).await.unwrap();
        assert_eq!(first.built_count(), 1);

        let second = scheduler(&fx).build(&graph).await.unwrap();
        assert_eq!(second.built_count(), 0);
        assert_eq!(second.outcomes["chunk"], Outcome::Cached);
    }

    #[tokio::test]
    async fn failed_build_cascades_to_dependents() {
        let fx = fixture();
        let mut failing = chunk_source(&fx, "broken", "true", Vec::new());
        if let Morphology::Chunk(chunk) = &mut failing.morphology {
            chunk.configure_commands.main = Some(vec!["exit 1".to_string()]);
        }

        let mut pool = SourcePool::new();
        pool.add(failing);
        pool.add(stratum_over(&fx, "core", "broken"));

        let graph = keyed(&fx, pool);
        let report = scheduler(&fx).build(&graph).await.unwrap();

        assert!(!report.succeeded());
        assert!(matches!(report.outcomes["broken"], Outcome::Failed(_)));
        assert_eq!(report.outcomes["core"], Outcome::Skipped);
        let failures = report.failures();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].1.contains("configure"));
    }

    #[tokio::test]
    async fn stratum_artifact_lists_chunk_members() {
        let fx = fixture();
        let source = chunk_source(
            &fx,
            "busybox",
            "mkdir -p \"$DESTDIR/bin\" && echo b > \"$DESTDIR/bin/busybox\"",
            Vec::new(),
        );
        let mut pool = SourcePool::new();
        pool.add(source);
        pool.add(stratum_over(&fx, "core", "busybox"));

        let graph = keyed(&fx, pool);
        let report = scheduler(&fx).build(&graph).await.unwrap();
        assert!(report.succeeded(), "failures: {:?}", report.failures());

        let stratum_idx = (0..graph.artifacts.len())
            .find(|&i| graph.artifact(i).name == "core")
            .unwrap();
        let key = graph.artifact(stratum_idx).cache_key.clone().unwrap();
        let mut manifest = String::new();
        fx.lac
            .get(&artifact_basename(&key, "core", "core"))
            .unwrap()
            .read_to_string(&mut manifest)
            .unwrap();
        let members: Vec<crate::builder::StratumMember> =
            serde_json::from_str(&manifest).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].source, "busybox");
        assert_eq!(members[0].artifact, "busybox");
    }

    #[tokio::test]
    async fn shutdown_skips_unstarted_work() {
        let fx = fixture();
        let source = chunk_source(
            &fx,
            "chunk",
            "mkdir -p \"$DESTDIR/usr\" && echo x > \"$DESTDIR/usr/file\"",
            Vec::new(),
        );
        let mut pool = SourcePool::new();
        pool.add(source);
        let graph = keyed(&fx, pool);

        let scheduler = scheduler(&fx);
        scheduler.shutdown();
        let report = scheduler.build(&graph).await.unwrap();
        assert_eq!(report.outcomes["chunk"], Outcome::Skipped);
        assert_eq!(report.built_count(), 0);
    }
}
