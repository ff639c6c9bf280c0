//! Per-build staging areas.
//!
//! Each chunk builds inside an isolated directory populated by
//! hard-linking its dependency artifacts out of the unpacked-chunk
//! cache. The directory holds an exclusive advisory lock for its
//! whole lifetime; the GC takes the same lock before deleting
//! anything, so an in-use area is never swept away.

use flate2::read::GzDecoder;
use fs2::FileExt;
use morph_core::BuildEnvironment;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

const BASE_PATH: [&str; 4] = ["/sbin", "/usr/sbin", "/bin", "/usr/bin"];

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("staging i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to unpack artifact {artifact}: {detail}")]
    Unpack { artifact: String, detail: String },
    #[error("cannot hard-link {0} into the staging area: unsupported file type")]
    UnsupportedFileType(PathBuf),
    #[error("failed to lock staging directory {0}")]
    Lock(PathBuf),
}

pub type Result<T> = std::result::Result<T, StagingError>;

/// Outcome of one command run inside the staging area.
#[derive(Debug)]
pub struct CommandResult {
    pub exit_code: i32,
    pub output: String,
}

/// An isolated root directory for one build.
#[derive(Debug)]
pub struct StagingArea {
    dirname: PathBuf,
    source_name: String,
    use_chroot: bool,
    env: BTreeMap<String, String>,
    // Exclusive advisory lock shared with the GC; released on drop.
    lock: File,
}

impl StagingArea {
    /// Create a fresh staging area under `tempdir` with its build and
    /// destination directories and the PATH policy for the build
    /// mode: chroot builds see only staging paths, bootstrap and test
    /// builds get the host PATH appended.
    pub fn create(
        tempdir: &Path,
        source_name: &str,
        build_env: &BuildEnvironment,
        use_chroot: bool,
        extra_path: &[String],
    ) -> Result<Self> {
        let dirname = tempdir.join(Uuid::new_v4().to_string());
        fs::create_dir_all(&dirname)?;

        let lock = File::open(&dirname)?;
        lock.try_lock_exclusive()
            .map_err(|_| StagingError::Lock(dirname.clone()))?;

        let mut env = build_env.env.clone();
        let path = if use_chroot {
            let mut parts: Vec<String> = Vec::new();
            parts.extend(extra_path.iter().cloned());
            parts.extend(build_env.extra_path.iter().cloned());
            parts.extend(BASE_PATH.iter().map(|p| (*p).to_string()));
            parts.join(":")
        } else {
            let mut parts: Vec<String> = extra_path
                .iter()
                .chain(build_env.extra_path.iter())
                .map(|p| {
                    format!(
                        "{}/{}",
                        dirname.display(),
                        p.trim_start_matches('/')
                    )
                })
                .collect();
            if let Ok(host_path) = std::env::var("PATH") {
                parts.push(host_path);
            }
            parts.join(":")
        };
        env.insert("PATH".to_string(), path);

        let area = Self {
            dirname,
            source_name: source_name.to_string(),
            use_chroot,
            env,
            lock,
        };
        fs::create_dir_all(area.builddir())?;
        fs::create_dir_all(area.destdir())?;
        info!(dir = %area.dirname.display(), source = source_name, "staging area ready");
        Ok(area)
    }

    pub fn dirname(&self) -> &Path {
        &self.dirname
    }

    /// Where the chunk's source tree is checked out and built.
    pub fn builddir(&self) -> PathBuf {
        self.dirname.join(format!("{}.build", self.source_name))
    }

    /// `$DESTDIR` for the chunk's install phase.
    pub fn destdir(&self) -> PathBuf {
        self.dirname.join(format!("{}.inst", self.source_name))
    }

    /// Paths as build commands see them: rooted at `/` inside a
    /// chroot, real paths otherwise.
    pub fn relative(&self, path: &Path) -> PathBuf {
        if self.use_chroot {
            let name = path.file_name().map(PathBuf::from).unwrap_or_default();
            Path::new("/").join(name)
        } else {
            path.to_path_buf()
        }
    }

    /// Unpack a dependency artifact (once, into the shared chunks
    /// cache) and hard-link its tree into this staging area.
    pub fn install_artifact(&self, chunks_dir: &Path, blob_path: &Path) -> Result<()> {
        let basename = blob_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let unpacked = chunks_dir.join(format!("{basename}.d"));

        if !unpacked.exists() {
            debug!(artifact = %basename, "unpacking chunk from cache");
            fs::create_dir_all(chunks_dir)?;
            let staging = tempfile::Builder::new()
                .prefix(".unpack-")
                .tempdir_in(chunks_dir)?;
            let file = File::open(blob_path)?;
            let mut archive = tar::Archive::new(GzDecoder::new(file));
            archive
                .set_preserve_permissions(true);
            archive
                .unpack(staging.path())
                .map_err(|e| StagingError::Unpack {
                    artifact: basename.clone(),
                    detail: e.to_string(),
                })?;
            // Another build may have unpacked the same chunk while we
            // worked; theirs is as good as ours.
            let kept = staging.keep();
            match fs::rename(&kept, &unpacked) {
                Ok(()) => {}
                Err(_) if unpacked.exists() => {
                    let _ = fs::remove_dir_all(&kept);
                }
                Err(e) => return Err(e.into()),
            }
        }

        hardlink_all_files(&unpacked, &self.dirname)
    }

    /// Run one shell command inside the staging area, appending its
    /// combined output to `logfile` when given. A failing command
    /// leaves a recovery shell script next to the staging directory.
    pub async fn runcmd(
        &self,
        command: &str,
        cwd: &Path,
        extra_env: &BTreeMap<String, String>,
        logfile: Option<&mut File>,
    ) -> Result<CommandResult> {
        let mut env = self.env.clone();
        env.extend(extra_env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut process = if self.use_chroot {
            let mut process = Command::new("chroot");
            process
                .arg(&self.dirname)
                .arg("/bin/sh")
                .arg("-c")
                .arg(format!("cd {} && {}", self.relative(cwd).display(), command));
            process
        } else {
            let mut process = Command::new("/bin/sh");
            process.arg("-c").arg(command).current_dir(cwd);
            process
        };
        process
            .env_clear()
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(command, cwd = %cwd.display(), "running build command");
        let output = process.output().await?;
        let exit_code = output.status.code().unwrap_or(-1);

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.stderr.is_empty() {
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
        }
        if let Some(logfile) = logfile {
            writeln!(logfile, "# {command}")?;
            logfile.write_all(combined.as_bytes())?;
        }

        if exit_code != 0 {
            warn!(command, exit_code, "build command failed");
            self.write_recovery_script(&env)?;
        }

        Ok(CommandResult {
            exit_code,
            output: combined,
        })
    }

    /// Write `<stagingdir>.sh`, a script reproducing the build
    /// environment for debugging a failed build by hand.
    fn write_recovery_script(&self, env: &BTreeMap<String, String>) -> Result<()> {
        let script_path = self.dirname.with_extension("sh");
        let mut script = File::create(&script_path)?;
        write!(script, "env -i")?;
        for (key, value) in env {
            write!(script, " {key}='{value}'")?;
        }
        if self.use_chroot {
            writeln!(script, " chroot '{}' /bin/sh", self.dirname.display())?;
        } else {
            writeln!(script, " /bin/sh")?;
        }
        info!(script = %script_path.display(), "wrote recovery shell script");
        Ok(())
    }

    /// Tear the staging area down entirely and release its lock.
    pub fn remove(self) -> Result<()> {
        fs::remove_dir_all(&self.dirname)?;
        let script = self.dirname.with_extension("sh");
        if script.exists() {
            fs::remove_file(script)?;
        }
        fs2::FileExt::unlock(&self.lock)?;
        Ok(())
    }
}

/// Hard-link a tree into the staging area. Directories are created,
/// regular files hard-linked, symlinks reproduced; existing files are
/// replaced so newer extractions win.
pub fn hardlink_all_files(srcpath: &Path, destpath: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(srcpath)?;
    let file_type = metadata.file_type();

    if file_type.is_dir() {
        if !destpath.exists() {
            fs::create_dir_all(destpath)?;
        }
        for entry in fs::read_dir(srcpath)? {
            let entry = entry?;
            hardlink_all_files(&entry.path(), &destpath.join(entry.file_name()))?;
        }
    } else if file_type.is_symlink() {
        if fs::symlink_metadata(destpath).is_ok() {
            fs::remove_file(destpath)?;
        }
        symlink(fs::read_link(srcpath)?, destpath)?;
    } else if file_type.is_file() {
        if fs::symlink_metadata(destpath).is_ok() {
            fs::remove_file(destpath)?;
        }
        fs::hard_link(srcpath, destpath)?;
    } else {
        return Err(StagingError::UnsupportedFileType(srcpath.to_path_buf()));
    }
    Ok(())
}
