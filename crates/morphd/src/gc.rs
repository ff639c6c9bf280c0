//! Garbage collection for the tempdir and the artifact cache.
//!
//! Two phases: first reclaim temporary build space (deployments,
//! failed builds, the unpacked-chunk cache, abandoned staging areas),
//! then evict cached artifacts by age. Files older than the
//! delete-older-than threshold always go; files between the two
//! thresholds go oldest-first until the configured free space is
//! reached; younger files stay. Staging areas holding their exclusive
//! lock are never touched.

use crate::artifactcache::{CacheError, LocalArtifactCache};
use fs2::FileExt;
use morph_core::Settings;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum GcError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("gc i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GcError>;

/// What one GC pass did.
#[derive(Debug, Default)]
pub struct GcReport {
    pub removed_tempdirs: Vec<PathBuf>,
    pub evicted_keys: Vec<String>,
    pub skipped_locked: usize,
}

#[derive(Debug)]
pub struct GarbageCollector<'a> {
    pub settings: &'a Settings,
    pub lac: &'a LocalArtifactCache,
}

impl GarbageCollector<'_> {
    pub fn collect(&self) -> Result<GcReport> {
        let mut report = GcReport::default();
        self.clean_tempdir(&mut report)?;
        self.clean_artifact_cache(&mut report)?;
        info!(
            removed_tempdirs = report.removed_tempdirs.len(),
            evicted_keys = report.evicted_keys.len(),
            skipped_locked = report.skipped_locked,
            "gc pass complete"
        );
        Ok(report)
    }

    fn tempdir_needs_space(&self) -> bool {
        free_space(&self.settings.tempdir) < self.settings.tempdir_min_space
    }

    fn clean_tempdir(&self, report: &mut GcReport) -> Result<()> {
        let tempdir = &self.settings.tempdir;
        if !tempdir.exists() {
            return Ok(());
        }

        for subdir in ["deployments", "failed", "chunks"] {
            if !self.tempdir_needs_space() {
                break;
            }
            let path = tempdir.join(subdir);
            if path.exists() {
                debug!(dir = %path.display(), "removing tempdir subdirectory");
                fs::remove_dir_all(&path)?;
                report.removed_tempdirs.push(path);
            }
        }

        // Abandoned staging areas: any directory whose exclusive lock
        // can be taken is no longer in use by a builder.
        for entry in fs::read_dir(tempdir)? {
            let entry = entry?;
            let path = entry.path();
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if ["deployments", "failed", "chunks"].contains(&name.as_str()) {
                continue;
            }
            match File::open(&path).and_then(|f| {
                f.try_lock_exclusive()?;
                Ok(f)
            }) {
                Ok(lock) => {
                    debug!(dir = %path.display(), "removing abandoned staging area");
                    fs::remove_dir_all(&path)?;
                    let script = path.with_extension("sh");
                    if script.exists() {
                        fs::remove_file(script)?;
                    }
                    let _ = fs2::FileExt::unlock(&lock);
                    report.removed_tempdirs.push(path);
                }
                Err(_) => {
                    debug!(dir = %path.display(), "staging area is locked; skipping");
                    report.skipped_locked += 1;
                }
            }
        }
        Ok(())
    }

    fn clean_artifact_cache(&self, report: &mut GcReport) -> Result<()> {
        let now = SystemTime::now();
        let max_age = Duration::from_secs(self.settings.cachedir_artifact_delete_older_than);
        let min_age = Duration::from_secs(self.settings.cachedir_artifact_keep_younger_than);

        let mut always_delete = Vec::new();
        let mut may_delete = Vec::new();

        for entry in self.lac.list_contents()? {
            let age = now
                .duration_since(entry.last_used)
                .unwrap_or(Duration::ZERO);
            if age > max_age {
                always_delete.push(entry);
            } else if age > min_age {
                may_delete.push(entry);
            }
        }
        // Oldest first, so the least recently used go before anything
        // a current build might still want.
        may_delete.sort_by_key(|e| e.last_used);

        for entry in always_delete {
            self.lac.remove(&entry.cache_key)?;
            report.evicted_keys.push(entry.cache_key);
        }

        for entry in may_delete {
            if free_space(self.lac.cachedir()) >= self.settings.cachedir_min_space {
                break;
            }
            self.lac.remove(&entry.cache_key)?;
            report.evicted_keys.push(entry.cache_key);
        }
        Ok(())
    }
}

fn free_space(path: &Path) -> u64 {
    match fs2::available_space(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot query free space");
            u64::MAX
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifactcache::artifact_basename;
    use std::fs::OpenOptions;
    use tempfile::TempDir;

    const OLD_KEY: &str = "1111111111111111111111111111111111111111111111111111111111111111";
    const MID_KEY: &str = "2222222222222222222222222222222222222222222222222222222222222222";
    const NEW_KEY: &str = "3333333333333333333333333333333333333333333333333333333333333333";

    fn settings(root: &TempDir) -> Settings {
        let mut settings = Settings::default();
        settings.cachedir = root.path().join("cache");
        settings.tempdir = root.path().join("tmp");
        settings.cachedir_min_space = 0;
        settings.tempdir_min_space = 0;
        std::fs::create_dir_all(&settings.tempdir).unwrap();
        settings
    }

    fn age_file(path: &Path, seconds: u64) {
        let file = OpenOptions::new().append(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(seconds))
            .unwrap();
    }

    #[test]
    fn old_artifacts_are_always_evicted() {
        let root = TempDir::new().unwrap();
        let settings = settings(&root);
        let lac = LocalArtifactCache::new(settings.artifacts_dir()).unwrap();

        let old = artifact_basename(OLD_KEY, "chunk", "chunk");
        let new = artifact_basename(NEW_KEY, "chunk", "chunk");
        lac.put_bytes(&old, b"old").unwrap();
        lac.put_bytes(&new, b"new").unwrap();
        // Older than the one-week delete threshold.
        age_file(&lac.file_path(&old), 60 * 60 * 24 * 8);

        let gc = GarbageCollector {
            settings: &settings,
            lac: &lac,
        };
        let report = gc.collect().unwrap();

        assert_eq!(report.evicted_keys, vec![OLD_KEY.to_string()]);
        assert!(!lac.has(&old));
        assert!(lac.has(&new));
    }

    #[test]
    fn eviction_removes_all_files_of_a_key() {
        let root = TempDir::new().unwrap();
        let settings = settings(&root);
        let lac = LocalArtifactCache::new(settings.artifacts_dir()).unwrap();

        let bins = artifact_basename(OLD_KEY, "chunk", "chunk-bins");
        let devel = artifact_basename(OLD_KEY, "chunk", "chunk-devel");
        lac.put_bytes(&bins, b"a").unwrap();
        lac.put_bytes(&devel, b"b").unwrap();
        age_file(&lac.file_path(&bins), 60 * 60 * 24 * 9);
        age_file(&lac.file_path(&devel), 60 * 60 * 24 * 9);

        let gc = GarbageCollector {
            settings: &settings,
            lac: &lac,
        };
        gc.collect().unwrap();

        // Companion files leave together: none left behind.
        assert!(!lac.has(&bins));
        assert!(!lac.has(&devel));
    }

    #[test]
    fn middle_band_survives_when_space_is_fine() {
        let root = TempDir::new().unwrap();
        let settings = settings(&root);
        let lac = LocalArtifactCache::new(settings.artifacts_dir()).unwrap();

        let mid = artifact_basename(MID_KEY, "chunk", "chunk");
        lac.put_bytes(&mid, b"m").unwrap();
        // Older than keep-younger-than (1 day) but younger than
        // delete-older-than (1 week).
        age_file(&lac.file_path(&mid), 60 * 60 * 24 * 3);

        let gc = GarbageCollector {
            settings: &settings,
            lac: &lac,
        };
        let report = gc.collect().unwrap();
        assert!(report.evicted_keys.is_empty());
        assert!(lac.has(&mid));
    }

    #[test]
    fn locked_staging_areas_are_skipped() {
        let root = TempDir::new().unwrap();
        let settings = settings(&root);
        let lac = LocalArtifactCache::new(settings.artifacts_dir()).unwrap();

        let locked = settings.tempdir.join("in-use-staging");
        let abandoned = settings.tempdir.join("abandoned-staging");
        std::fs::create_dir_all(&locked).unwrap();
        std::fs::create_dir_all(&abandoned).unwrap();

        let lock = File::open(&locked).unwrap();
        lock.try_lock_exclusive().unwrap();

        let gc = GarbageCollector {
            settings: &settings,
            lac: &lac,
        };
        let report = gc.collect().unwrap();

        assert!(locked.exists());
        assert!(!abandoned.exists());
        assert_eq!(report.skipped_locked, 1);

        fs2::FileExt::unlock(&lock).unwrap();
    }
}
