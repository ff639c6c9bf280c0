//! Settings shared by the build engine, the daemon and the CLI.
//!
//! Parsed from a `key = value` config file merged over defaults;
//! flags on the binaries override individual values afterwards.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("invalid size value for {key}: {value}")]
    InvalidSize { key: String, value: String },
}

/// What to do with uncommitted changes when starting a distributed
/// build from a definitions checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocalChanges {
    #[default]
    Include,
    Ignore,
}

impl LocalChanges {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Include => "include",
            Self::Ignore => "ignore",
        }
    }
}

/// Global settings. Field names map to the dashed config keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub cachedir: PathBuf,
    pub tempdir: PathBuf,
    /// Free space to keep on the cachedir filesystem, in bytes.
    pub cachedir_min_space: u64,
    pub tempdir_min_space: u64,
    /// Remove cached artifacts older than this many seconds during GC.
    pub cachedir_artifact_delete_older_than: u64,
    /// Never GC artifacts younger than this many seconds.
    pub cachedir_artifact_keep_younger_than: u64,
    /// Parallel jobs passed to build commands; `None` means one per
    /// host CPU.
    pub max_jobs: Option<u32>,
    /// Install prefix exported to builds as `$PREFIX`.
    pub prefix: String,
    /// `name=pull#push` repo alias definitions.
    pub repo_alias: Vec<String>,
    /// Remote repo cache server base URL.
    pub cache_server: Option<String>,
    /// Remote artifact cache server base URL.
    pub artifact_cache_server: Option<String>,
    pub no_git_update: bool,
    pub staging_chroot: bool,
    pub no_ccache: bool,
    pub no_distcc: bool,
    pub local_changes: LocalChanges,
    pub push_build_branches: bool,
    pub build_ref_prefix: String,
    pub controller_initiator_address: String,
    pub controller_initiator_port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cachedir: dirs::home_dir()
                .map_or_else(|| PathBuf::from(".cache/morph"), |h| h.join(".cache/morph")),
            tempdir: std::env::temp_dir().join("morph"),
            cachedir_min_space: 512 * 1024 * 1024,
            tempdir_min_space: 512 * 1024 * 1024,
            cachedir_artifact_delete_older_than: 60 * 60 * 24 * 7,
            cachedir_artifact_keep_younger_than: 60 * 60 * 24,
            max_jobs: None,
            prefix: "/usr".to_string(),
            repo_alias: Vec::new(),
            cache_server: None,
            artifact_cache_server: None,
            no_git_update: false,
            staging_chroot: true,
            no_ccache: false,
            no_distcc: true,
            local_changes: LocalChanges::Include,
            push_build_branches: false,
            build_ref_prefix: "baserock/builds/".to_string(),
            controller_initiator_address: "127.0.0.1".to_string(),
            controller_initiator_port: 7878,
        }
    }
}

impl Settings {
    /// Load settings from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, SettingsError> {
        let mut settings = Self::default();
        settings.load_file(path)?;
        Ok(settings)
    }

    pub fn load_file(&mut self, path: &Path) -> Result<(), SettingsError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    fn parse_content(&mut self, content: &str) -> Result<(), SettingsError> {
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(SettingsError::InvalidLine(line.to_string()));
            };
            self.apply_value(key.trim(), &Self::unquote(value.trim()))?;
        }
        Ok(())
    }

    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), SettingsError> {
        match key {
            "cachedir" => self.cachedir = PathBuf::from(value),
            "tempdir" => self.tempdir = PathBuf::from(value),
            "cachedir-min-space" => self.cachedir_min_space = parse_size(key, value)?,
            "tempdir-min-space" => self.tempdir_min_space = parse_size(key, value)?,
            "cachedir-artifact-delete-older-than" => {
                self.cachedir_artifact_delete_older_than = parse_int(key, value)?;
            }
            "cachedir-artifact-keep-younger-than" => {
                self.cachedir_artifact_keep_younger_than = parse_int(key, value)?;
            }
            "max-jobs" => self.max_jobs = Some(parse_int(key, value)? as u32),
            "prefix" => self.prefix = value.to_string(),
            "repo-alias" => {
                self.repo_alias = value
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            "cache-server" => {
                self.cache_server = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "artifact-cache-server" => {
                self.artifact_cache_server = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "no-git-update" => self.no_git_update = parse_bool(key, value)?,
            "staging-chroot" => self.staging_chroot = parse_bool(key, value)?,
            "no-ccache" => self.no_ccache = parse_bool(key, value)?,
            "no-distcc" => self.no_distcc = parse_bool(key, value)?,
            "local-changes" => {
                self.local_changes = match value {
                    "include" => LocalChanges::Include,
                    "ignore" => LocalChanges::Ignore,
                    _ => {
                        return Err(SettingsError::InvalidLine(format!(
                            "local-changes must be 'include' or 'ignore', got '{value}'"
                        )))
                    }
                }
            }
            "push-build-branches" => self.push_build_branches = parse_bool(key, value)?,
            "build-ref-prefix" => self.build_ref_prefix = value.to_string(),
            "controller-initiator-address" => {
                self.controller_initiator_address = value.to_string();
            }
            "controller-initiator-port" => {
                self.controller_initiator_port = parse_int(key, value)? as u16;
            }
            _ => {
                // Unknown keys warn rather than fail, so configs can
                // be shared across versions.
                eprintln!("Warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    /// Directory for bare git mirrors.
    pub fn gits_dir(&self) -> PathBuf {
        self.cachedir.join("gits")
    }

    /// Directory for the local artifact cache.
    pub fn artifacts_dir(&self) -> PathBuf {
        self.cachedir.join("artifacts")
    }

    /// Base URL of the initiator's controller.
    pub fn controller_url(&self) -> String {
        format!(
            "http://{}:{}",
            self.controller_initiator_address, self.controller_initiator_port
        )
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, SettingsError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "y" | "on" => Ok(true),
        "false" | "0" | "no" | "n" | "off" => Ok(false),
        _ => Err(SettingsError::InvalidBool {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_int(key: &str, value: &str) -> Result<u64, SettingsError> {
    value.parse().map_err(|_| SettingsError::InvalidInt {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Parse a size with an optional K/M/G suffix into bytes.
fn parse_size(key: &str, value: &str) -> Result<u64, SettingsError> {
    let err = || SettingsError::InvalidSize {
        key: key.to_string(),
        value: value.to_string(),
    };
    let trimmed = value.trim();
    let (number, multiplier) = match trimmed.chars().last() {
        Some('K' | 'k') => (&trimmed[..trimmed.len() - 1], 1024),
        Some('M' | 'm') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        Some('G' | 'g') => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        _ => (trimmed, 1),
    };
    let number: u64 = number.trim().parse().map_err(|_| err())?;
    Ok(number * multiplier)
}

/// Optional dependency for resolving user directories.
mod dirs {
    use std::path::PathBuf;

    pub fn home_dir() -> Option<PathBuf> {
        std::env::var_os("HOME").map(PathBuf::from)
    }
}
