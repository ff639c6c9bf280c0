//! morphd - build engine and distbuild controller.
//!
//! Library components for the daemon process and for local builds
//! driven by the CLI.

pub mod artifactcache;
pub mod builder;
pub mod gc;
pub mod remote;
pub mod repocache;
pub mod resolve;
pub mod scheduler;
pub mod server;
pub mod staging;
pub mod storage;
pub mod worker;

use crate::artifactcache::LocalArtifactCache;
use crate::builder::Builder;
use crate::remote::{RemoteArtifactCache, RemoteRepoCache};
use crate::repocache::LocalRepoCache;
use crate::resolve::{ResolveError, SourceResolver};
use crate::scheduler::{BuildEvent, BuildReport, BuildScheduler, SchedulerError};
use morph_core::graph::{ArtifactGraph, ArtifactResolver, GraphError};
use morph_core::{
    compute_keys, BuildEnvironment, BuildSystemRegistry, RepoAliasResolver, Settings,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Cache(#[from] artifactcache::CacheError),
    #[error("unknown component: {0}")]
    UnknownComponent(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// The machine architecture builds target, from the host.
pub fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86" => "x86_32",
        "arm" => "armv7l",
        "aarch64" => "armv8l64",
        "powerpc64" => "ppc64",
        _ => "x86_64",
    }
}

/// Everything needed to resolve and build morphologies on this host.
pub struct BuildEngine {
    pub settings: Settings,
    pub lrc: LocalRepoCache,
    pub lac: LocalArtifactCache,
    pub rrc: Option<RemoteRepoCache>,
    pub rac: Option<RemoteArtifactCache>,
    pub build_env: BuildEnvironment,
    pub arch: String,
}

impl BuildEngine {
    pub fn new(settings: Settings) -> Result<Self> {
        let resolver = RepoAliasResolver::new(&settings.repo_alias);
        let lrc = LocalRepoCache::new(settings.gits_dir(), resolver.clone());
        let lac = LocalArtifactCache::new(settings.artifacts_dir())?;
        let rrc = settings
            .cache_server
            .as_ref()
            .map(|url| RemoteRepoCache::new(url.clone(), resolver));
        let rac = settings
            .artifact_cache_server
            .as_ref()
            .map(|url| RemoteArtifactCache::new(url.clone()));

        let arch = host_arch().to_string();
        let build_env = BuildEnvironment::new(&settings, &arch);
        std::fs::create_dir_all(&settings.tempdir).map_err(artifactcache::CacheError::from)?;

        Ok(Self {
            settings,
            lrc,
            lac,
            rrc,
            rac,
            build_env,
            arch,
        })
    }

    fn max_jobs(&self) -> u32 {
        self.settings.max_jobs.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1)
        })
    }

    /// Resolve a morphology into a cache-keyed artifact graph,
    /// together with the command registry the definitions configured.
    pub async fn resolve(
        &self,
        repo: &str,
        ref_: &str,
        filename: &str,
        original_ref: Option<&str>,
    ) -> Result<(ArtifactGraph, BuildSystemRegistry)> {
        let mut resolver = SourceResolver::new(
            &self.lrc,
            self.rrc.as_ref(),
            !self.settings.no_git_update,
            self.settings.cachedir.join("resolver"),
        );
        let pool = resolver
            .create_source_pool(repo, ref_, &[filename.to_string()], original_ref)
            .await?;

        let mut registry = BuildSystemRegistry::standard();
        resolver.defaults().apply_to(&mut registry);
        resolver.save_memos();

        let mut graph = ArtifactResolver::new(&self.arch).resolve(pool)?;
        compute_keys(&mut graph, &self.build_env, &registry)?;
        Ok((graph, registry))
    }

    /// Resolve and build one morphology, optionally restricted to
    /// named component artifacts of it.
    pub async fn build(
        &self,
        repo: &str,
        ref_: &str,
        filename: &str,
        original_ref: Option<&str>,
        component_names: &[String],
        events: Option<mpsc::UnboundedSender<BuildEvent>>,
    ) -> Result<BuildReport> {
        let (graph, registry) = self.resolve(repo, ref_, filename, original_ref).await?;
        info!(
            artifacts = graph.artifacts.len(),
            sources = graph.pool.len(),
            "artifact graph resolved"
        );

        let targets = if component_names.is_empty() {
            None
        } else {
            let mut targets = Vec::new();
            for name in component_names {
                let found = (0..graph.artifacts.len())
                    .find(|&idx| {
                        graph.artifact(idx).name == *name
                            || graph.source_of(idx).name() == *name
                    })
                    .ok_or_else(|| EngineError::UnknownComponent(name.clone()))?;
                targets.push(found);
            }
            Some(targets)
        };

        let builder = Builder {
            settings: &self.settings,
            lrc: &self.lrc,
            lac: &self.lac,
            build_env: &self.build_env,
            registry: &registry,
            max_jobs: self.max_jobs(),
        };
        let scheduler = BuildScheduler::new(
            builder,
            &self.lac,
            self.rac.as_ref(),
            &self.lrc,
            self.max_jobs() as usize,
            events,
        );
        Ok(scheduler
            .build_selection(&graph, targets.as_deref())
            .await?)
    }
}
