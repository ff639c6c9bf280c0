//! morph - Baserock build tool.
//!
//! Builds systems locally, hands them to a distbuild controller, and
//! inspects the artifact cache.

mod client;
mod render;

use clap::{Parser, Subcommand};
use client::Client;
use morph_core::protocol::{BuildRequest, Message, PROTOCOL_VERSION};
use morph_core::{LocalChanges, Settings};
use morphd::artifactcache::{artifact_basename, source_metadata_basename};
use morphd::gc::GarbageCollector;
use morphd::scheduler::BuildEvent;
use morphd::BuildEngine;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;

/// Baserock system build tool.
#[derive(Parser)]
#[command(name = "morph")]
#[command(about = "Build and deploy Baserock systems")]
#[command(version)]
struct Cli {
    /// Settings file (key = value format)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Controller URL override for distbuild commands
    #[arg(long, global = true, env = "MORPH_CONTROLLER")]
    controller: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build a morphology locally
    Build {
        repo: String,
        #[arg(value_name = "REF")]
        ref_: String,
        morphology: String,

        /// Build only these components of the target
        #[arg(long = "component")]
        components: Vec<String>,
    },
    /// Build on a distbuild controller, streaming status and logs
    Distbuild {
        repo: String,
        #[arg(value_name = "REF")]
        ref_: String,
        morphology: String,

        #[arg(long = "component")]
        components: Vec<String>,

        /// Return immediately with the build id
        #[arg(long)]
        detach: bool,
    },
    /// Start a distbuild and detach immediately
    DistbuildStart {
        repo: String,
        #[arg(value_name = "REF")]
        ref_: String,
        morphology: String,

        #[arg(long = "component")]
        components: Vec<String>,
    },
    /// List the artifacts a morphology resolves to
    ListArtifacts {
        repo: String,
        #[arg(value_name = "REF")]
        ref_: String,
        morphology: String,
    },
    /// Print the captured build log of a component
    ShowBuildLog {
        repo: String,
        #[arg(value_name = "REF")]
        ref_: String,
        morphology: String,

        /// Component to show; defaults to the build target itself
        component: Option<String>,
    },
    /// Clean temporary build state and evict old cache entries
    Gc,
    /// List builds known to the controller
    ListBuilds,
    /// Show the status of a controller build
    Status { id: String },
    /// Cancel a controller build
    Cancel { id: String },
}

fn load_settings(config: Option<&PathBuf>) -> Result<Settings, Box<dyn std::error::Error>> {
    Ok(match config {
        Some(path) => Settings::from_file(path)?,
        None => Settings::default(),
    })
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("ERROR: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let settings = load_settings(cli.config.as_ref())?;
    let controller_url = cli
        .controller
        .clone()
        .unwrap_or_else(|| settings.controller_url());

    match cli.command {
        Command::Build {
            repo,
            ref_,
            morphology,
            components,
        } => {
            let engine = BuildEngine::new(settings)?;
            let (events, mut rx) = tokio::sync::mpsc::unbounded_channel();
            let printer = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    match event {
                        BuildEvent::Status(message) => println!("{message}"),
                        BuildEvent::ArtifactStarted(artifact) => {
                            println!("building {artifact}");
                        }
                        BuildEvent::ArtifactBuilt(artifact) => println!("built {artifact}"),
                        BuildEvent::ArtifactFailed { artifact, reason } => {
                            eprintln!("failed {artifact}: {reason}");
                        }
                    }
                }
            });

            let report = engine
                .build(&repo, &ref_, &morphology, None, &components, Some(events))
                .await?;
            let _ = printer.await;

            render::print_build_report(&report);
            if !report.succeeded() {
                std::process::exit(1);
            }
        }

        Command::Distbuild {
            repo,
            ref_,
            morphology,
            components,
            detach,
        } => {
            distbuild(
                &settings,
                &controller_url,
                &repo,
                &ref_,
                &morphology,
                &components,
                detach,
            )
            .await?;
        }

        Command::DistbuildStart {
            repo,
            ref_,
            morphology,
            components,
        } => {
            distbuild(
                &settings,
                &controller_url,
                &repo,
                &ref_,
                &morphology,
                &components,
                true,
            )
            .await?;
        }

        Command::ListArtifacts {
            repo,
            ref_,
            morphology,
        } => {
            let engine = BuildEngine::new(settings)?;
            let (graph, _) = engine.resolve(&repo, &ref_, &morphology, None).await?;
            let order = morph_core::BuildOrder::new(&graph)?;
            let mut basenames = Vec::new();
            for idx in order.order {
                let artifact = graph.artifact(idx);
                if let Some(key) = &artifact.cache_key {
                    basenames.push(artifact_basename(
                        key,
                        graph.source_of(idx).name(),
                        &artifact.name,
                    ));
                }
            }
            render::print_artifact_list(&basenames);
        }

        Command::ShowBuildLog {
            repo,
            ref_,
            morphology,
            component,
        } => {
            let engine = BuildEngine::new(settings)?;
            let (graph, _) = engine.resolve(&repo, &ref_, &morphology, None).await?;
            let target = match &component {
                Some(name) => (0..graph.artifacts.len())
                    .find(|&idx| {
                        graph.artifact(idx).name == *name
                            || graph.source_of(idx).name() == *name
                    })
                    .ok_or_else(|| format!("unknown component: {name}"))?,
                None => *graph
                    .roots()
                    .first()
                    .ok_or("morphology resolves to no artifacts")?,
            };
            let key = graph
                .artifact(target)
                .cache_key
                .clone()
                .ok_or("artifact has no cache key")?;
            let basename = source_metadata_basename(&key, "build-log");

            let bytes = match engine.lac.get_bytes(&basename) {
                Ok(bytes) => bytes,
                Err(_) => match &engine.rac {
                    Some(rac) => rac
                        .get(&basename)
                        .await?
                        .ok_or_else(|| format!("no build log cached for {basename}"))?,
                    None => return Err(format!("no build log cached for {basename}").into()),
                },
            };
            std::io::stdout().write_all(&bytes)?;
        }

        Command::Gc => {
            let lac = morphd::artifactcache::LocalArtifactCache::new(settings.artifacts_dir())?;
            let gc = GarbageCollector {
                settings: &settings,
                lac: &lac,
            };
            let report = gc.collect()?;
            println!(
                "evicted {} cache entr(y/ies), removed {} temp dir(s)",
                report.evicted_keys.len(),
                report.removed_tempdirs.len()
            );
        }

        Command::ListBuilds => {
            let client = Client::new(&controller_url);
            let builds = client.list_builds().await?;
            render::print_build_list(&builds);
        }

        Command::Status { id } => {
            let client = Client::new(&controller_url);
            let build = client.get_build(&id).await?;
            render::print_build_details(&build);
        }

        Command::Cancel { id } => {
            let client = Client::new(&controller_url);
            client.cancel_build(&id).await?;
            println!("cancel requested for {id}");
        }
    }
    Ok(())
}

async fn distbuild(
    settings: &Settings,
    controller_url: &str,
    repo: &str,
    ref_: &str,
    morphology: &str,
    components: &[String],
    detach: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let (commit, original_ref) = resolve_for_distbuild(settings, repo, ref_)?;

    let request = BuildRequest {
        protocol_version: PROTOCOL_VERSION,
        repo: repo.to_string(),
        commit,
        morphology: morphology.to_string(),
        original_ref: Some(original_ref),
        component_names: components.to_vec(),
    };

    let client = Client::new(controller_url);
    let id = client.submit_build(&request).await?;
    println!("build {id}");

    if detach {
        return Ok(());
    }

    client
        .stream_events(&id, |message| match message {
            Message::StatusEvent { message, .. } => println!("{message}"),
            Message::LogChunk { artifact, chunk, .. } => {
                for line in chunk.lines() {
                    println!("{artifact}: {line}");
                }
            }
            Message::BuildComplete { .. } => println!("build complete"),
            Message::BuildFailed { reason, .. } => eprintln!("build failed: {reason}"),
            _ => {}
        })
        .await?;

    let build = client.get_build(&id).await?;
    if build.status != morph_core::protocol::BuildStatus::Complete {
        std::process::exit(1);
    }
    Ok(())
}

/// Turn (repo, ref) into the commit a controller should build.
///
/// For a local definitions checkout, uncommitted changes are captured
/// on a build branch first (unless `local-changes = ignore`), so the
/// controller builds exactly what the tree contains.
fn resolve_for_distbuild(
    settings: &Settings,
    repo: &str,
    ref_: &str,
) -> Result<(String, String), Box<dyn std::error::Error>> {
    let checkout = Path::new(repo);
    if checkout.join(".git").exists() && settings.local_changes == LocalChanges::Include {
        let commit = capture_local_changes(settings, checkout)?;
        return Ok((commit, ref_.to_string()));
    }

    // Not a checkout (or local changes ignored): resolve through the
    // repo cache like any other build.
    let engine = BuildEngine::new(settings.clone())?;
    if !engine.lrc.has_repo(repo) {
        engine.lrc.cache_repo(repo)?;
    }
    let (commit, _tree) = engine.lrc.resolve_ref(repo, ref_)?;
    Ok((commit, ref_.to_string()))
}

/// Commit the working tree (including uncommitted changes) onto a
/// build ref, pushing it when configured, and return the commit.
fn capture_local_changes(
    settings: &Settings,
    checkout: &Path,
) -> Result<String, Box<dyn std::error::Error>> {
    let git = |args: &[&str]| -> Result<String, Box<dyn std::error::Error>> {
        let output = ProcessCommand::new("git")
            .args(args)
            .current_dir(checkout)
            .output()?;
        if !output.status.success() {
            return Err(format!(
                "git {:?}: {}",
                args,
                String::from_utf8_lossy(&output.stderr).trim()
            )
            .into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    };

    // `git stash create` commits the dirty tree without touching it;
    // a clean tree yields nothing and HEAD is already what we want.
    let stash = git(&["stash", "create", "morph distbuild"])?;
    let commit = if stash.is_empty() {
        git(&["rev-parse", "HEAD"])?
    } else {
        stash
    };

    let build_ref = format!(
        "{}{}",
        settings.build_ref_prefix,
        &commit[..commit.len().min(16)]
    );
    git(&["update-ref", &format!("refs/heads/{build_ref}"), &commit])?;
    println!("created build branch {build_ref}");

    if settings.push_build_branches {
        git(&["push", "origin", &format!("{build_ref}:{build_ref}")])?;
        println!("pushed build branch {build_ref}");
    }

    Ok(commit)
}
