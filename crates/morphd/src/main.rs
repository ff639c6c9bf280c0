//! morphd - distbuild controller daemon.
//!
//! Main entry point for the daemon binary.

use clap::{Parser, Subcommand};
use eyre::WrapErr;
use morph_core::Settings;
use morphd::artifactcache::LocalArtifactCache;
use morphd::gc::GarbageCollector;
use morphd::storage::Storage;
use morphd::BuildEngine;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// Build controller daemon for distributed morphology builds.
#[derive(Parser)]
#[command(name = "morphd")]
#[command(about = "Baserock distbuild controller")]
#[command(version)]
struct Cli {
    /// Settings file (key = value format)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller (default)
    Serve {
        /// Listen address override
        #[arg(long)]
        address: Option<String>,
        /// Listen port override
        #[arg(long)]
        port: Option<u16>,
    },
    /// Clean the tempdir and evict old cache entries
    Gc,
    /// Build the root of a serialised artifact graph
    Worker {
        /// Path to the graph document
        graph: PathBuf,
    },
}

fn load_settings(config: Option<&PathBuf>) -> eyre::Result<Settings> {
    match config {
        Some(path) => {
            Settings::from_file(path).wrap_err_with(|| format!("loading {}", path.display()))
        }
        None => Ok(Settings::default()),
    }
}

fn main() -> eyre::Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = load_settings(cli.config.as_ref())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    runtime.block_on(async {
        match cli.command.unwrap_or(Command::Serve {
            address: None,
            port: None,
        }) {
            Command::Serve { address, port } => {
                let address =
                    address.unwrap_or_else(|| settings.controller_initiator_address.clone());
                let port = port.unwrap_or(settings.controller_initiator_port);

                let storage = Storage::new(&settings.cachedir.join("morphd.db"))
                    .await
                    .wrap_err("opening build ledger")?;
                storage.migrate_embedded().await.wrap_err("migrating ledger")?;
                let engine = BuildEngine::new(settings).wrap_err("initialising build engine")?;

                tokio::select! {
                    result = morphd::server::start_server(
                        Arc::new(storage),
                        Arc::new(engine),
                        &address,
                        port,
                    ) => {
                        if let Err(e) = result {
                            error!("controller error: {e}");
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("received SIGINT; shutting down");
                    }
                }
                Ok(())
            }
            Command::Gc => {
                let lac = LocalArtifactCache::new(settings.artifacts_dir())
                    .wrap_err("opening artifact cache")?;
                let gc = GarbageCollector {
                    settings: &settings,
                    lac: &lac,
                };
                let report = gc.collect().wrap_err("gc pass failed")?;
                info!(
                    evicted = report.evicted_keys.len(),
                    tempdirs = report.removed_tempdirs.len(),
                    "gc finished"
                );
                Ok(())
            }
            Command::Worker { graph } => {
                let document = std::fs::read_to_string(&graph)
                    .wrap_err_with(|| format!("reading {}", graph.display()))?;
                let engine = BuildEngine::new(settings).wrap_err("initialising build engine")?;
                let report = morphd::worker::execute_graph(&engine, &document)
                    .await
                    .wrap_err("worker build failed")?;
                if report.succeeded() {
                    Ok(())
                } else {
                    for (artifact, reason) in report.failures() {
                        error!(artifact, reason, "build failed");
                    }
                    std::process::exit(1);
                }
            }
        }
    })
}
