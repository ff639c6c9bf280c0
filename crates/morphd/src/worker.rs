//! Execution of serialised artifact graphs.
//!
//! A distbuild worker receives a self-contained artifact graph from
//! the controller, rebuilds the root artifact's closure, and
//! publishes the results through its artifact cache (shared with the
//! controller via the remote cache).

use crate::builder::Builder;
use crate::scheduler::{BuildReport, BuildScheduler, SchedulerError};
use morph_core::serialise::{deserialise_artifact, SerialiseError};
use morph_core::BuildSystemRegistry;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Serialise(#[from] SerialiseError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

pub type Result<T> = std::result::Result<T, WorkerError>;

/// Decode an artifact graph document and build its root.
pub async fn execute_graph(engine: &crate::BuildEngine, document: &str) -> Result<BuildReport> {
    let (graph, root) = deserialise_artifact(document)?;
    info!(
        artifacts = graph.artifacts.len(),
        root = graph.artifact(root).name,
        "executing serialised artifact graph"
    );

    // Cache keys travel with the graph; only the command tables are
    // local.
    let registry = BuildSystemRegistry::standard();
    let builder = Builder {
        settings: &engine.settings,
        lrc: &engine.lrc,
        lac: &engine.lac,
        build_env: &engine.build_env,
        registry: &registry,
        max_jobs: engine.settings.max_jobs.unwrap_or(1),
    };
    let scheduler = BuildScheduler::new(
        builder,
        &engine.lac,
        engine.rac.as_ref(),
        &engine.lrc,
        engine.settings.max_jobs.unwrap_or(1) as usize,
        None,
    );
    Ok(scheduler.build_selection(&graph, Some(&[root])).await?)
}
