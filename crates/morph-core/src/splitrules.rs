//! Rules for splitting a source's build output into named artifacts.
//!
//! Chunks split files from their install tree; strata and systems
//! split the artifacts of their children. Rules are evaluated in
//! declaration order and the first match assigns the item, though
//! every match is recorded so overlaps can be reported.

use crate::morphology::{ChunkMorphology, StratumMorphology, SystemMorphology};
use regex::Regex;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SplitRuleError {
    #[error("invalid split-rule regex '{pattern}': {source}")]
    InvalidRegex {
        pattern: String,
        source: regex::Error,
    },
}

pub type Result<T> = std::result::Result<T, SplitRuleError>;

/// Default rules are (artifact-name-suffix, patterns) pairs; the
/// catch-all used when a definitions tree supplies none.
pub type DefaultRules = Vec<(String, Vec<String>)>;

/// An empty rule list would make every file unmatched, which is never
/// what a user wants, so the fallback assigns everything to one
/// artifact named after the source.
pub fn catch_all_rules() -> DefaultRules {
    vec![(String::new(), vec![".*".to_string()])]
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            // Match anchored at the start of the candidate, like the
            // include patterns are written.
            Regex::new(&format!(r"\A(?:{p})")).map_err(|source| SplitRuleError::InvalidRegex {
                pattern: p.clone(),
                source,
            })
        })
        .collect()
}

/// One way of deciding whether a file or child artifact belongs to an
/// output artifact.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Match file paths against regexes (chunk artifacts).
    File {
        patterns: Vec<String>,
        regexes: Vec<Regex>,
    },
    /// Match child artifact names against regexes (stratum artifacts).
    Artifact {
        patterns: Vec<String>,
        regexes: Vec<Regex>,
    },
    /// Exact (source, artifact) assignment.
    ArtifactAssign { source: String, artifact: String },
    /// Assign every artifact produced by a source.
    SourceAssign { source: String },
}

impl Matcher {
    pub fn file(patterns: Vec<String>) -> Result<Self> {
        let regexes = compile(&patterns)?;
        Ok(Self::File { patterns, regexes })
    }

    pub fn artifact(patterns: Vec<String>) -> Result<Self> {
        let regexes = compile(&patterns)?;
        Ok(Self::Artifact { patterns, regexes })
    }

    fn matches_file(&self, path: &str) -> bool {
        match self {
            Self::File { regexes, .. } => regexes.iter().any(|r| r.is_match(path)),
            _ => false,
        }
    }

    fn matches_artifact(&self, source: &str, artifact: &str) -> bool {
        match self {
            Self::File { .. } => false,
            Self::Artifact { regexes, .. } => regexes.iter().any(|r| r.is_match(artifact)),
            Self::ArtifactAssign {
                source: s,
                artifact: a,
            } => s == source && a == artifact,
            Self::SourceAssign { source: s } => s == source,
        }
    }

    /// The regex patterns of a match rule, if it has any.
    pub fn patterns(&self) -> Option<&[String]> {
        match self {
            Self::File { patterns, .. } | Self::Artifact { patterns, .. } => Some(patterns),
            _ => None,
        }
    }
}

/// The result of matching many files or child artifacts at once.
#[derive(Debug)]
pub struct Partition<T> {
    /// Artifact name → items assigned to it, in input order.
    pub matches: BTreeMap<String, Vec<T>>,
    /// Items that matched more than one rule, with every match.
    pub overlaps: Vec<(T, Vec<String>)>,
    /// Items no rule matched.
    pub unmatched: Vec<T>,
}

impl<T> Default for Partition<T> {
    fn default() -> Self {
        Self {
            matches: BTreeMap::new(),
            overlaps: Vec::new(),
            unmatched: Vec::new(),
        }
    }
}

/// Ordered rules mapping items into named output artifacts.
#[derive(Debug, Clone, Default)]
pub struct SplitRules {
    rules: Vec<(String, Matcher)>,
}

impl SplitRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, artifact: impl Into<String>, matcher: Matcher) {
        self.rules.push((artifact.into(), matcher));
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, Matcher)> {
        self.rules.iter()
    }

    /// Names of all output artifacts, in declaration order, without
    /// repeats.
    pub fn artifacts(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for (name, _) in &self.rules {
            if !seen.contains(&name.as_str()) {
                seen.push(name.as_str());
            }
        }
        seen
    }

    /// Artifact names whose rule matches a file path, in rule order.
    pub fn match_file(&self, path: &str) -> Vec<&str> {
        self.rules
            .iter()
            .filter(|(_, m)| m.matches_file(path))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Artifact names whose rule matches a child artifact, in rule
    /// order.
    pub fn match_artifact(&self, source: &str, artifact: &str) -> Vec<&str> {
        self.rules
            .iter()
            .filter(|(_, m)| m.matches_artifact(source, artifact))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Group file paths by the artifact each belongs to.
    pub fn partition_files<I>(&self, paths: I) -> Partition<String>
    where
        I: IntoIterator<Item = String>,
    {
        self.partition_with(paths, |rules, path| rules.match_file(path))
    }

    /// Group (source, artifact) pairs by the artifact each belongs to.
    pub fn partition_artifacts<I>(&self, pairs: I) -> Partition<(String, String)>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.partition_with(pairs, |rules, (source, artifact)| {
            rules.match_artifact(source, artifact)
        })
    }

    fn partition_with<T, I, F>(&self, items: I, matcher: F) -> Partition<T>
    where
        T: Clone,
        I: IntoIterator<Item = T>,
        F: for<'r> Fn(&'r Self, &T) -> Vec<&'r str>,
    {
        let mut partition = Partition::default();
        for item in items {
            let matched: Vec<String> = matcher(self, &item)
                .into_iter()
                .map(str::to_string)
                .collect();
            match matched.split_first() {
                None => partition.unmatched.push(item),
                Some((first, rest)) => {
                    if !rest.is_empty() {
                        partition.overlaps.push((item.clone(), matched.clone()));
                    }
                    partition.matches.entry(first.clone()).or_default().push(item);
                }
            }
        }
        partition
    }

    /// (artifact-name, patterns) pairs for cache keying. Assignment
    /// rules carry no patterns and serialise as empty lists.
    pub fn rule_patterns(&self) -> Vec<(String, Vec<String>)> {
        self.rules
            .iter()
            .map(|(name, matcher)| {
                (
                    name.clone(),
                    matcher.patterns().map(<[String]>::to_vec).unwrap_or_default(),
                )
            })
            .collect()
    }
}

/// Split rules for a chunk: declared products first, then default
/// rules for any artifact name not already declared. Defaults are an
/// all-or-nothing fallback, not additive.
pub fn unify_chunk_rules(
    morphology: &ChunkMorphology,
    default_rules: &DefaultRules,
) -> Result<SplitRules> {
    let defaults = if default_rules.is_empty() {
        catch_all_rules()
    } else {
        default_rules.clone()
    };

    let mut rules = SplitRules::new();
    for product in &morphology.products {
        rules.add(product.artifact.clone(), Matcher::file(product.include.clone())?);
    }
    for (suffix, patterns) in &defaults {
        let name = format!("{}{}", morphology.name, suffix);
        if !rules.artifacts().contains(&name.as_str()) {
            rules.add(name, Matcher::file(patterns.clone())?);
        }
    }
    Ok(rules)
}

/// Split rules for a stratum: explicit chunk-artifact assignments
/// first, then the stratum's own product matches, then defaults with
/// the same override policy as chunks.
pub fn unify_stratum_rules(
    morphology: &StratumMorphology,
    default_rules: &DefaultRules,
) -> Result<SplitRules> {
    let defaults = if default_rules.is_empty() {
        catch_all_rules()
    } else {
        default_rules.clone()
    };

    let mut rules = SplitRules::new();
    for spec in &morphology.chunks {
        for (chunk_artifact, stratum_artifact) in &spec.artifacts {
            rules.add(
                stratum_artifact.clone(),
                Matcher::ArtifactAssign {
                    source: spec.name.clone(),
                    artifact: chunk_artifact.clone(),
                },
            );
        }
    }

    // Match rules supplement the assignment rules rather than replace
    // them, so the declared-artifact check only consults this set.
    let mut match_rules = SplitRules::new();
    for product in &morphology.products {
        match_rules.add(
            product.artifact.clone(),
            Matcher::artifact(product.include.clone())?,
        );
    }
    for (suffix, patterns) in &defaults {
        let name = format!("{}{}", morphology.name, suffix);
        if !match_rules.artifacts().contains(&name.as_str()) {
            match_rules.add(name, Matcher::artifact(patterns.clone())?);
        }
    }

    for (name, matcher) in match_rules.rules {
        rules.add(name, matcher);
    }
    Ok(rules)
}

/// Split rules for a system: one `<name>-rootfs` artifact assigned
/// every artifact of every stratum, unless the spec enumerates the
/// stratum artifacts to take.
pub fn unify_system_rules(morphology: &SystemMorphology) -> SplitRules {
    let rootfs = format!("{}-rootfs", morphology.name);
    let mut rules = SplitRules::new();

    for spec in &morphology.strata {
        match &spec.artifacts {
            None => rules.add(
                rootfs.clone(),
                Matcher::SourceAssign {
                    source: spec.source_name().to_string(),
                },
            ),
            Some(selected) => {
                for artifact in selected {
                    rules.add(
                        rootfs.clone(),
                        Matcher::ArtifactAssign {
                            source: spec.source_name().to_string(),
                            artifact: artifact.clone(),
                        },
                    );
                }
            }
        }
    }
    rules
}
