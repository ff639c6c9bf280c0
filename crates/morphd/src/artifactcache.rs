//! The local artifact cache.
//!
//! A flat, content-addressed directory of built artifacts and their
//! metadata. Writers stage into a temp file and atomically rename, so
//! readers see whole artifacts or nothing. Every access refreshes the
//! file's mtime; the GC uses those times to pick eviction victims.
//!
//! Parts of the build assume every artifact of a source is available
//! together, so eviction always removes all files sharing a cache
//! key.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("artifact cache i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("artifact not cached: {0}")]
    NotCached(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// On-disk name of an artifact blob.
pub fn artifact_basename(cache_key: &str, source_name: &str, artifact_name: &str) -> String {
    format!("{cache_key}.{source_name}.{artifact_name}")
}

/// On-disk name of a per-artifact metadata file.
pub fn artifact_metadata_basename(
    cache_key: &str,
    source_name: &str,
    artifact_name: &str,
    meta_name: &str,
) -> String {
    format!("{cache_key}.{source_name}.{artifact_name}.{meta_name}")
}

/// On-disk name of a per-source metadata file (build log, timings).
pub fn source_metadata_basename(cache_key: &str, meta_name: &str) -> String {
    format!("{cache_key}.{meta_name}")
}

/// A cache entry being written; nothing is visible until `commit`.
#[derive(Debug)]
pub struct SaveFile {
    temp: tempfile::NamedTempFile,
    target: PathBuf,
}

impl SaveFile {
    /// Atomically publish the file under its final name. Dropping a
    /// `SaveFile` without committing leaves no partial file behind.
    pub fn commit(self) -> Result<()> {
        self.temp
            .persist(&self.target)
            .map_err(|e| CacheError::Io(e.error))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }
}

impl Write for SaveFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.temp.as_file_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.temp.as_file_mut().flush()
    }
}

/// Summary of one cache key's files, as the GC sees them.
#[derive(Debug)]
pub struct CacheEntry {
    pub cache_key: String,
    pub artifacts: Vec<String>,
    pub last_used: SystemTime,
}

#[derive(Debug)]
pub struct LocalArtifactCache {
    cachedir: PathBuf,
}

impl LocalArtifactCache {
    pub fn new(cachedir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&cachedir)?;
        Ok(Self { cachedir })
    }

    pub fn cachedir(&self) -> &Path {
        &self.cachedir
    }

    pub fn file_path(&self, basename: &str) -> PathBuf {
        self.cachedir.join(basename)
    }

    /// Open a writer whose contents appear under `basename` only
    /// after `commit`.
    pub fn put(&self, basename: &str) -> Result<SaveFile> {
        let temp = tempfile::Builder::new()
            .prefix(".tmp-")
            .tempfile_in(&self.cachedir)?;
        debug!(basename, "staging cache entry");
        Ok(SaveFile {
            temp,
            target: self.file_path(basename),
        })
    }

    /// Convenience for small metadata blobs.
    pub fn put_bytes(&self, basename: &str, bytes: &[u8]) -> Result<()> {
        let mut save = self.put(basename)?;
        save.write_all(bytes)?;
        save.commit()
    }

    pub fn has(&self, basename: &str) -> bool {
        let path = self.file_path(basename);
        if path.exists() {
            let _ = touch(&path);
            true
        } else {
            false
        }
    }

    /// Open a cached file for reading, refreshing its mtime.
    pub fn get(&self, basename: &str) -> Result<File> {
        let path = self.file_path(basename);
        if !path.exists() {
            return Err(CacheError::NotCached(basename.to_string()));
        }
        touch(&path)?;
        Ok(File::open(path)?)
    }

    pub fn get_bytes(&self, basename: &str) -> Result<Vec<u8>> {
        let path = self.file_path(basename);
        if !path.exists() {
            return Err(CacheError::NotCached(basename.to_string()));
        }
        touch(&path)?;
        Ok(fs::read(path)?)
    }

    /// Group cached files by cache key with each group's most recent
    /// use time.
    pub fn list_contents(&self) -> Result<Vec<CacheEntry>> {
        let mut grouped: BTreeMap<String, (Vec<String>, SystemTime)> = BTreeMap::new();
        for entry in fs::read_dir(&self.cachedir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(".tmp-") {
                continue;
            }
            let Some((key, rest)) = name.split_once('.') else {
                continue;
            };
            let mtime = entry
                .metadata()?
                .modified()
                .unwrap_or(SystemTime::UNIX_EPOCH);
            let slot = grouped
                .entry(key.to_string())
                .or_insert_with(|| (Vec::new(), SystemTime::UNIX_EPOCH));
            slot.0.push(rest.to_string());
            if mtime > slot.1 {
                slot.1 = mtime;
            }
        }
        Ok(grouped
            .into_iter()
            .map(|(cache_key, (artifacts, last_used))| CacheEntry {
                cache_key,
                artifacts,
                last_used,
            })
            .collect())
    }

    /// Evict every file belonging to a cache key. All artifacts of a
    /// source leave together; a half-evicted source would wedge the
    /// build.
    pub fn remove(&self, cache_key: &str) -> Result<()> {
        let prefix = format!("{cache_key}.");
        for entry in fs::read_dir(&self.cachedir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&prefix) {
                debug!(file = name, "evicting cache entry");
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    /// Empty the cache entirely.
    pub fn clear(&self) -> Result<()> {
        for entry in fs::read_dir(&self.cachedir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

fn touch(path: &Path) -> io::Result<()> {
    let file = OpenOptions::new().append(true).open(path)?;
    file.set_modified(SystemTime::now())
}
