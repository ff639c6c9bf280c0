//! Output rendering for the morph CLI.
//!
//! Formats build requests, build reports and artifact listings for
//! terminal display.

use chrono::{DateTime, Utc};
use morph_core::protocol::{BuildInfo, BuildStatus};
use morphd::scheduler::{BuildReport, Outcome};

/// Print a list of controller builds in tabular format.
pub fn print_build_list(builds: &[BuildInfo]) {
    if builds.is_empty() {
        println!("No builds found.");
        return;
    }

    println!(
        "{:<36}  {:<10}  {:<40}  {:<20}",
        "ID", "STATUS", "MORPHOLOGY", "CREATED"
    );
    println!("{}", "-".repeat(112));

    for build in builds {
        println!(
            "{:<36}  {:<10}  {:<40}  {:<20}",
            build.id,
            build.status.as_str(),
            truncate(&build.morphology, 40),
            format_time(&build.created_at),
        );
    }

    println!();
    println!("{} build(s)", builds.len());
}

/// Print one build's details.
pub fn print_build_details(build: &BuildInfo) {
    println!("Build: {}", build.id);
    println!();
    println!("  Repo:       {}", build.repo);
    println!("  Commit:     {}", build.commit);
    println!("  Morphology: {}", build.morphology);
    if let Some(ref original_ref) = build.original_ref {
        println!("  Ref:        {original_ref}");
    }
    if !build.component_names.is_empty() {
        println!("  Components: {}", build.component_names.join(", "));
    }
    println!("  Status:     {}", build.status.as_str());
    if let Some(ref error) = build.error {
        println!("  Error:      {error}");
    }
    println!("  Created:    {}", format_time(&build.created_at));
    println!("  Updated:    {}", format_time(&build.updated_at));
}

/// Print a local build report summary.
pub fn print_build_report(report: &BuildReport) {
    let mut cached = 0usize;
    let mut built = 0usize;
    for outcome in report.outcomes.values() {
        match outcome {
            Outcome::Cached | Outcome::Downloaded => cached += 1,
            Outcome::Built => built += 1,
            _ => {}
        }
    }
    println!("{built} artifact(s) built, {cached} already cached");

    for (artifact, reason) in report.failures() {
        eprintln!("ERROR: {artifact}: {reason}");
    }
    let skipped: Vec<&str> = report
        .outcomes
        .iter()
        .filter(|(_, o)| matches!(o, Outcome::Skipped))
        .map(|(name, _)| name.as_str())
        .collect();
    if !skipped.is_empty() {
        eprintln!("skipped (dependency failed): {}", skipped.join(", "));
    }
}

/// Print artifact cache filenames, one per line.
pub fn print_artifact_list(basenames: &[String]) {
    for basename in basenames {
        println!("{basename}");
    }
}

pub fn format_status(status: BuildStatus) -> &'static str {
    status.as_str()
}

fn format_time(time: &DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        format!("{}…", &text[..max.saturating_sub(1)])
    }
}
