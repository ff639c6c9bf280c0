//! Locally cached git mirrors.
//!
//! Builds need repository content without cloning upstream once per
//! build, so remotes are mirrored bare under `cachedir/gits` with
//! their refs remapped under `refs/remotes/origin/*`. Repositories
//! update at most once per process run.

use morph_core::RepoAliasResolver;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RepoCacheError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
    #[error("ref {ref_} not found in repository {repo}")]
    InvalidRef { repo: String, ref_: String },
    #[error("file {filename} not found in {repo} at {commit}")]
    FileNotFound {
        repo: String,
        commit: String,
        filename: String,
    },
    #[error("repository {0} is not cached locally and git updates are disabled")]
    NotCached(String),
    #[error("cannot mirror remote git repository {repo}: {detail}")]
    CloneFailed { repo: String, detail: String },
}

pub type Result<T> = std::result::Result<T, RepoCacheError>;

/// True for a full 40-hex commit id.
pub fn is_valid_sha1(ref_: &str) -> bool {
    ref_.len() == 40 && ref_.chars().all(|c| c.is_ascii_hexdigit())
}

/// Manages bare mirrors of the repositories a build references.
#[derive(Debug)]
pub struct LocalRepoCache {
    gits_dir: PathBuf,
    resolver: RepoAliasResolver,
    /// Repositories already updated during this process run.
    updated: Mutex<HashSet<String>>,
}

impl LocalRepoCache {
    pub fn new(gits_dir: PathBuf, resolver: RepoAliasResolver) -> Self {
        Self {
            gits_dir,
            resolver,
            updated: Mutex::new(HashSet::new()),
        }
    }

    pub fn pull_url(&self, reponame: &str) -> String {
        self.resolver.pull_url(reponame)
    }

    /// Filesystem path of a repository's mirror.
    pub fn repo_path(&self, reponame: &str) -> PathBuf {
        let url = self.pull_url(reponame);
        self.gits_dir
            .join(urlencoding::encode(&url).into_owned())
    }

    pub fn has_repo(&self, reponame: &str) -> bool {
        self.repo_path(reponame).join("HEAD").exists()
    }

    /// Mirror a repository unless it is already cached.
    pub fn cache_repo(&self, reponame: &str) -> Result<()> {
        if self.has_repo(reponame) {
            return Ok(());
        }
        let url = self.pull_url(reponame);
        let path = self.repo_path(reponame);
        std::fs::create_dir_all(&path)?;
        info!(repo = reponame, url = %url, "mirroring git repository");

        let init = run_git(&["init", "--bare", "--quiet", path_str(&path)?], None)?;
        if !init.status.success() {
            return Err(clone_error(reponame, &init));
        }
        let gitdir = path_str(&path)?;
        for args in [
            vec!["--git-dir", gitdir, "remote", "add", "origin", url.as_str()],
            vec![
                "--git-dir",
                gitdir,
                "config",
                "remote.origin.fetch",
                "+refs/*:refs/remotes/origin/*",
            ],
        ] {
            let output = run_git(&args, None)?;
            if !output.status.success() {
                return Err(clone_error(reponame, &output));
            }
        }
        self.fetch(reponame)?;
        Ok(())
    }

    /// Fetch new objects for a repository, at most once per run.
    pub fn update_repo(&self, reponame: &str) -> Result<()> {
        {
            let updated = self.updated.lock().expect("repo cache lock");
            if updated.contains(reponame) {
                debug!(repo = reponame, "already updated in this run");
                return Ok(());
            }
        }
        if !self.has_repo(reponame) {
            return self.cache_repo(reponame);
        }
        self.fetch(reponame)
    }

    fn fetch(&self, reponame: &str) -> Result<()> {
        let path = self.repo_path(reponame);
        let output = run_git(
            &["--git-dir", path_str(&path)?, "fetch", "origin", "--prune", "--quiet"],
            None,
        )?;
        if !output.status.success() {
            return Err(RepoCacheError::CloneFailed {
                repo: reponame.to_string(),
                detail: stderr_of(&output),
            });
        }
        self.updated
            .lock()
            .expect("repo cache lock")
            .insert(reponame.to_string());
        Ok(())
    }

    /// False when updating could not change what the ref resolves to:
    /// local `file://` mirrors, commits already present, and repos
    /// updated earlier in this run.
    pub fn requires_update_for_ref(&self, reponame: &str, ref_: &str) -> bool {
        if self.pull_url(reponame).starts_with("file://") {
            return false;
        }
        if self
            .updated
            .lock()
            .expect("repo cache lock")
            .contains(reponame)
        {
            return false;
        }
        if is_valid_sha1(ref_) && self.has_commit(reponame, ref_) {
            return false;
        }
        true
    }

    fn has_commit(&self, reponame: &str, sha1: &str) -> bool {
        let Ok(path) = path_string(&self.repo_path(reponame)) else {
            return false;
        };
        run_git(
            &["--git-dir", &path, "cat-file", "-e", &format!("{sha1}^{{commit}}")],
            None,
        )
        .map(|out| out.status.success())
        .unwrap_or(false)
    }

    /// Resolve a ref to (commit sha1, root tree sha1).
    pub fn resolve_ref(&self, reponame: &str, ref_: &str) -> Result<(String, String)> {
        if !self.has_repo(reponame) {
            return Err(RepoCacheError::NotCached(reponame.to_string()));
        }
        let path = path_string(&self.repo_path(reponame))?;

        let candidates: Vec<String> = if is_valid_sha1(ref_) {
            vec![ref_.to_string()]
        } else {
            vec![format!("refs/remotes/origin/{ref_}"), ref_.to_string()]
        };

        for candidate in candidates {
            let output = run_git(
                &[
                    "--git-dir",
                    &path,
                    "rev-parse",
                    "--verify",
                    "--quiet",
                    &format!("{candidate}^{{commit}}"),
                ],
                None,
            )?;
            if output.status.success() {
                let commit = stdout_line(&output)?;
                let tree_out = run_git(
                    &[
                        "--git-dir",
                        &path,
                        "rev-parse",
                        &format!("{commit}^{{tree}}"),
                    ],
                    None,
                )?;
                if !tree_out.status.success() {
                    break;
                }
                return Ok((commit, stdout_line(&tree_out)?));
            }
        }

        Err(RepoCacheError::InvalidRef {
            repo: reponame.to_string(),
            ref_: ref_.to_string(),
        })
    }

    /// Read one file's bytes at a commit.
    pub fn read_file(&self, reponame: &str, commit: &str, filename: &str) -> Result<Vec<u8>> {
        let path = path_string(&self.repo_path(reponame))?;
        let output = run_git(
            &[
                "--git-dir",
                &path,
                "cat-file",
                "blob",
                &format!("{commit}:{filename}"),
            ],
            None,
        )?;
        if !output.status.success() {
            return Err(RepoCacheError::FileNotFound {
                repo: reponame.to_string(),
                commit: commit.to_string(),
                filename: filename.to_string(),
            });
        }
        Ok(output.stdout)
    }

    /// File paths in the tree at a commit; top level only unless
    /// `recurse`.
    pub fn list_files(&self, reponame: &str, commit: &str, recurse: bool) -> Result<Vec<String>> {
        let path = path_string(&self.repo_path(reponame))?;
        let mut args = vec!["--git-dir", path.as_str(), "ls-tree", "--name-only"];
        if recurse {
            args.push("-r");
        }
        args.push(commit);
        let output = run_git(&args, None)?;
        if !output.status.success() {
            return Err(RepoCacheError::InvalidRef {
                repo: reponame.to_string(),
                ref_: commit.to_string(),
            });
        }
        let text = String::from_utf8(output.stdout).map_err(|_| RepoCacheError::InvalidUtf8)?;
        Ok(text.lines().map(str::to_string).collect())
    }

    /// Clone the mirror into a working directory and check out a
    /// commit; how chunk sources land in their build directory.
    pub fn extract_commit(&self, reponame: &str, commit: &str, target: &Path) -> Result<()> {
        let mirror = path_string(&self.repo_path(reponame))?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let clone = run_git(
            &["clone", "--quiet", "--no-checkout", &mirror, path_str(target)?],
            None,
        )?;
        if !clone.status.success() {
            return Err(RepoCacheError::CommandFailed(stderr_of(&clone)));
        }
        let checkout = run_git(&["checkout", "--quiet", commit], Some(target))?;
        if !checkout.status.success() {
            return Err(RepoCacheError::InvalidRef {
                repo: reponame.to_string(),
                ref_: commit.to_string(),
            });
        }
        Ok(())
    }
}

fn run_git(args: &[&str], cwd: Option<&Path>) -> Result<std::process::Output> {
    let mut command = Command::new("git");
    command.args(args);
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }
    debug!(?args, "running git");
    Ok(command.output()?)
}

fn clone_error(reponame: &str, output: &std::process::Output) -> RepoCacheError {
    RepoCacheError::CloneFailed {
        repo: reponame.to_string(),
        detail: stderr_of(output),
    }
}

fn stderr_of(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

fn stdout_line(output: &std::process::Output) -> Result<String> {
    let text = String::from_utf8(output.stdout.clone()).map_err(|_| RepoCacheError::InvalidUtf8)?;
    Ok(text.trim().to_string())
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| RepoCacheError::CommandFailed(format!("non-utf8 path: {}", path.display())))
}

fn path_string(path: &Path) -> Result<String> {
    path_str(path).map(str::to_string)
}
