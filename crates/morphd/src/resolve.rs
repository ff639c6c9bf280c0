//! Source resolution: from a root morphology to a source pool.
//!
//! Walks the tree of system, stratum and chunk morphologies starting
//! at a root, resolving each (repo, ref) to a commit exactly once and
//! reading morphology text through the local mirror or the remote
//! repo cache. Chunks without a morphology get one synthesised from
//! their build-system marker files. Ref resolutions and repository
//! file listings are memoised to disk so repeated runs skip the
//! network.

use crate::remote::{RemoteError, RemoteRepoCache};
use crate::repocache::{LocalRepoCache, RepoCacheError};
use morph_core::loader::{Defaults, LoaderError, MorphologyLoader};
use morph_core::morphology::Morphology;
use morph_core::source::{Source, SourcePool};
use morph_core::splitrules::{
    unify_chunk_rules, unify_stratum_rules, unify_system_rules, SplitRuleError, SplitRules,
};
use morph_core::{detect_build_system, sanitise_morphology_path};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Repo(#[from] RepoCacheError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Loader(#[from] LoaderError),
    #[error(transparent)]
    SplitRule(#[from] SplitRuleError),
    #[error("couldn't find morphology: {filename} in {repo}")]
    MorphologyNotFound { repo: String, filename: String },
    #[error("cannot build a morphology of type 'cluster'")]
    CannotBuildCluster,
    #[error(
        "repository {0} is not cached locally and there is no remote cache specified"
    )]
    NotCached(String),
    #[error("resolver i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ResolveError>;

/// A small, size-bounded key→value memo persisted as JSON.
#[derive(Debug)]
pub struct DiskMemo {
    path: PathBuf,
    capacity: usize,
    entries: Vec<(String, serde_json::Value)>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MemoData {
    entries: Vec<(String, serde_json::Value)>,
}

impl DiskMemo {
    pub fn load(path: PathBuf, capacity: usize) -> Self {
        let entries = std::fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<MemoData>(&bytes).ok())
            .map(|data| data.entries)
            .unwrap_or_default();
        Self {
            path,
            capacity,
            entries,
        }
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn put(&mut self, key: String, value: serde_json::Value) {
        self.entries.retain(|(k, _)| k != &key);
        self.entries.push((key, value));
        while self.entries.len() > self.capacity {
            self.entries.remove(0);
        }
    }

    /// Best-effort persist; a lost memo only costs time.
    pub fn save(&self) {
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let data = MemoData {
            entries: self.entries.clone(),
        };
        match serde_json::to_vec(&data) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&self.path, bytes) {
                    warn!(path = %self.path.display(), error = %e, "failed to save memo cache");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode memo cache"),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn memo_key(parts: &[&str]) -> String {
    parts.join("\0")
}

enum ChunkQueueEntry {
    /// Morphology named explicitly, living in the definitions repo.
    InDefinitions {
        repo: String,
        ref_: String,
        filename: String,
    },
    /// Morphology (or auto-detection) in the chunk's own repository.
    InSourceRepo {
        repo: String,
        ref_: String,
        filename: String,
    },
}

/// Walks morphology references into a [`SourcePool`].
pub struct SourceResolver<'a> {
    lrc: &'a LocalRepoCache,
    rrc: Option<&'a RemoteRepoCache>,
    update: bool,
    loader: MorphologyLoader,
    defaults: Defaults,
    refs_memo: DiskMemo,
    trees_memo: DiskMemo,
    resolved_refs: HashMap<(String, String), (String, String)>,
    resolved_morphologies: HashMap<(String, String, String), Morphology>,
}

impl<'a> SourceResolver<'a> {
    pub fn new(
        lrc: &'a LocalRepoCache,
        rrc: Option<&'a RemoteRepoCache>,
        update: bool,
        memo_dir: PathBuf,
    ) -> Self {
        Self {
            lrc,
            rrc,
            update,
            loader: MorphologyLoader::new(),
            defaults: Defaults::default(),
            refs_memo: DiskMemo::load(memo_dir.join("resolved-refs.json"), 10_000),
            trees_memo: DiskMemo::load(memo_dir.join("tree-listings.json"), 10_000),
            resolved_refs: HashMap::new(),
            resolved_morphologies: HashMap::new(),
        }
    }

    /// DEFAULTS-provided split rules and build systems, once the
    /// definitions have been inspected.
    pub fn defaults(&self) -> &Defaults {
        &self.defaults
    }

    /// Persist the memo caches for the next run.
    pub fn save_memos(&self) {
        self.refs_memo.save();
        self.trees_memo.save();
    }

    /// Resolve a (repo, ref) pair to (commit, tree), memoised for the
    /// resolver's lifetime and, for pinned commits, across runs.
    pub async fn resolve_ref(&mut self, repo: &str, ref_: &str) -> Result<(String, String)> {
        let key = (repo.to_string(), ref_.to_string());
        if let Some(resolved) = self.resolved_refs.get(&key) {
            return Ok(resolved.clone());
        }

        // Without git updates a persisted resolution is as good as a
        // fresh one.
        let memo_key = memo_key(&[repo, ref_]);
        if !self.update {
            if let Some(value) = self.refs_memo.get(&memo_key) {
                if let (Some(commit), Some(tree)) = (
                    value.get(0).and_then(|v| v.as_str()),
                    value.get(1).and_then(|v| v.as_str()),
                ) {
                    let resolved = (commit.to_string(), tree.to_string());
                    self.resolved_refs.insert(key, resolved.clone());
                    return Ok(resolved);
                }
            }
        }

        let resolved = self.resolve_ref_uncached(repo, ref_).await?;
        self.refs_memo.put(
            memo_key,
            serde_json::json!([resolved.0, resolved.1]),
        );
        self.resolved_refs.insert(key, resolved.clone());
        Ok(resolved)
    }

    async fn resolve_ref_uncached(&mut self, repo: &str, ref_: &str) -> Result<(String, String)> {
        if self.lrc.has_repo(repo) {
            if self.update && self.lrc.requires_update_for_ref(repo, ref_) {
                info!(repo, ref_, "updating cached git repository");
                self.lrc.update_repo(repo)?;
            }
            return Ok(self.lrc.resolve_ref(repo, ref_)?);
        }

        if let Some(rrc) = self.rrc {
            match rrc.resolve_ref(repo, ref_).await {
                Ok(resolved) => {
                    debug!(repo, ref_, "resolved via remote repo cache");
                    return Ok(resolved);
                }
                Err(e) => warn!(repo, ref_, error = %e, "remote ref resolution failed"),
            }
        }

        if self.update {
            info!(repo, "caching git repository");
            self.lrc.cache_repo(repo)?;
            return Ok(self.lrc.resolve_ref(repo, ref_)?);
        }
        Err(ResolveError::NotCached(repo.to_string()))
    }

    /// Fetch and parse the morphology at (repo, commit, filename),
    /// synthesising a chunk morphology from the repository's file
    /// list when the file does not exist and detection is allowed.
    async fn get_morphology(
        &mut self,
        repo: &str,
        commit: &str,
        filename: &str,
        allow_detection: bool,
    ) -> Result<Morphology> {
        let key = (repo.to_string(), commit.to_string(), filename.to_string());
        if let Some(morphology) = self.resolved_morphologies.get(&key) {
            return Ok(morphology.clone());
        }

        let text = self.read_file(repo, commit, filename).await?;
        let morphology = match text {
            Some(text) => self.loader.parse(&text, filename)?,
            None if allow_detection => {
                let files = self.list_files(repo, commit).await?;
                let Some(kind) = detect_build_system(&files) else {
                    return Err(ResolveError::MorphologyNotFound {
                        repo: repo.to_string(),
                        filename: filename.to_string(),
                    });
                };
                debug!(repo, filename, build_system = kind.as_str(),
                    "synthesised chunk morphology from build-system detection");
                let name = morph_stem(filename);
                morph_core::buildsystem::synthesise_morphology(&name, kind)
            }
            None => {
                return Err(ResolveError::MorphologyNotFound {
                    repo: repo.to_string(),
                    filename: filename.to_string(),
                })
            }
        };

        self.resolved_morphologies.insert(key, morphology.clone());
        Ok(morphology)
    }

    async fn read_file(&mut self, repo: &str, commit: &str, filename: &str) -> Result<Option<String>> {
        if self.lrc.has_repo(repo) {
            return match self.lrc.read_file(repo, commit, filename) {
                Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
                Err(RepoCacheError::FileNotFound { .. }) => Ok(None),
                Err(e) => Err(e.into()),
            };
        }
        if let Some(rrc) = self.rrc {
            return match rrc.cat_file(repo, commit, filename).await {
                Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
                Err(RemoteError::CatFile { .. }) => Ok(None),
                Err(e) => Err(e.into()),
            };
        }
        Err(ResolveError::NotCached(repo.to_string()))
    }

    async fn list_files(&mut self, repo: &str, commit: &str) -> Result<Vec<String>> {
        let key = memo_key(&[repo, commit]);
        if let Some(value) = self.trees_memo.get(&key) {
            if let Some(list) = value.as_array() {
                return Ok(list
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect());
            }
        }

        let files = if self.lrc.has_repo(repo) {
            self.lrc.list_files(repo, commit, false)?
        } else if let Some(rrc) = self.rrc {
            rrc.ls_tree(repo, commit).await?
        } else {
            return Err(ResolveError::NotCached(repo.to_string()));
        };

        self.trees_memo
            .put(key, serde_json::json!(files));
        Ok(files)
    }

    fn split_rules_for(&self, morphology: &Morphology) -> Result<SplitRules> {
        Ok(match morphology {
            Morphology::Chunk(c) => unify_chunk_rules(c, &self.defaults.chunk_split_rules)?,
            Morphology::Stratum(s) => unify_stratum_rules(s, &self.defaults.stratum_split_rules)?,
            Morphology::System(s) => unify_system_rules(s),
            Morphology::Cluster(_) => SplitRules::new(),
        })
    }

    /// Read VERSION and DEFAULTS at the definitions commit. A missing
    /// VERSION file is accepted (plain definitions trees); a present
    /// one must name a supported version before DEFAULTS is honoured.
    async fn load_definitions_metadata(&mut self, repo: &str, commit: &str) -> Result<()> {
        if let Some(text) = self.read_file(repo, commit, "VERSION").await? {
            let version = morph_core::loader::check_version_file(&text)?;
            debug!(version, "definitions format version");
            if let Some(defaults_text) = self.read_file(repo, commit, "DEFAULTS").await? {
                self.defaults = Defaults::parse(&defaults_text)?;
            }
        }
        Ok(())
    }

    /// Traverse the morphology tree rooted at the given filenames and
    /// return the pool of every source involved.
    pub async fn create_source_pool(
        &mut self,
        definitions_repo: &str,
        definitions_ref: &str,
        filenames: &[String],
        original_ref: Option<&str>,
    ) -> Result<SourcePool> {
        let mut pool = SourcePool::new();
        let (definitions_commit, definitions_tree) = self
            .resolve_ref(definitions_repo, definitions_ref)
            .await?;
        // Cache keys use the symbolic ref where the user gave one.
        let definitions_ref = original_ref.unwrap_or(definitions_ref);

        self.load_definitions_metadata(definitions_repo, &definitions_commit)
            .await?;

        // Systems and strata all live in the definitions repository;
        // they queue up the chunks as they are visited.
        let mut definitions_queue: VecDeque<String> =
            filenames.iter().map(|f| sanitise_morphology_path(f)).collect();
        let mut chunk_queue: Vec<ChunkQueueEntry> = Vec::new();
        let mut visited: std::collections::HashSet<String> = std::collections::HashSet::new();

        while let Some(filename) = definitions_queue.pop_front() {
            if !visited.insert(filename.clone()) {
                continue;
            }
            let morphology = self
                .get_morphology(definitions_repo, &definitions_commit, &filename, false)
                .await?;

            match &morphology {
                Morphology::Cluster(_) => return Err(ResolveError::CannotBuildCluster),
                Morphology::System(system) => {
                    for spec in &system.strata {
                        definitions_queue.push_back(sanitise_morphology_path(&spec.morph));
                    }
                }
                Morphology::Stratum(stratum) => {
                    for spec in &stratum.build_depends {
                        definitions_queue.push_back(sanitise_morphology_path(&spec.morph));
                    }
                    for chunk in &stratum.chunks {
                        let ref_ = chunk
                            .ref_
                            .clone()
                            .unwrap_or_else(|| definitions_ref.to_string());
                        match &chunk.morph {
                            Some(morph) => chunk_queue.push(ChunkQueueEntry::InDefinitions {
                                repo: chunk.repo.clone(),
                                ref_,
                                filename: sanitise_morphology_path(morph),
                            }),
                            None => chunk_queue.push(ChunkQueueEntry::InSourceRepo {
                                repo: chunk.repo.clone(),
                                ref_,
                                filename: sanitise_morphology_path(&chunk.name),
                            }),
                        }
                    }
                }
                Morphology::Chunk(_) => {}
            }

            let split_rules = self.split_rules_for(&morphology)?;
            pool.add(Source::new(
                definitions_repo,
                definitions_ref,
                definitions_commit.clone(),
                definitions_tree.clone(),
                filename,
                morphology,
                split_rules,
            ));
        }

        for entry in chunk_queue {
            let (repo, ref_, filename, in_definitions) = match entry {
                ChunkQueueEntry::InDefinitions {
                    repo,
                    ref_,
                    filename,
                } => (repo, ref_, filename, true),
                ChunkQueueEntry::InSourceRepo {
                    repo,
                    ref_,
                    filename,
                } => (repo, ref_, filename, false),
            };

            let (commit, tree) = self.resolve_ref(&repo, &ref_).await?;
            let morphology = if in_definitions {
                self.get_morphology(definitions_repo, &definitions_commit, &filename, false)
                    .await?
            } else {
                self.get_morphology(&repo, &commit, &filename, true).await?
            };

            let split_rules = self.split_rules_for(&morphology)?;
            pool.add(Source::new(
                repo, ref_, commit, tree, filename, morphology, split_rules,
            ));
        }

        info!(sources = pool.len(), "source pool resolved");
        Ok(pool)
    }
}

fn morph_stem(filename: &str) -> String {
    let base = filename.rsplit('/').next().unwrap_or(filename);
    base.strip_suffix(".morph").unwrap_or(base).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use morph_core::morphology::MorphologyKind;
    use morph_core::RepoAliasResolver;
    use std::process::Command;
    use tempfile::TempDir;

    fn git(dir: &std::path::Path, args: &[&str]) {
        let out = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(out.status.success(), "git {args:?} failed");
    }

    fn init_repo(dir: &std::path::Path) {
        git(dir, &["init", "--quiet", "--initial-branch=main"]);
        git(dir, &["config", "user.email", "t@t"]);
        git(dir, &["config", "user.name", "t"]);
    }

    fn commit_all(dir: &std::path::Path) {
        git(dir, &["add", "."]);
        git(dir, &["commit", "--quiet", "-m", "update"]);
    }

    struct Definitions {
        definitions: TempDir,
        chunk_repo: TempDir,
        gits: TempDir,
    }

    /// A definitions repo with a system → stratum → chunk tree, plus
    /// an upstream chunk repo without its own morphology.
    fn setup() -> Definitions {
        let chunk_repo = TempDir::new().unwrap();
        init_repo(chunk_repo.path());
        std::fs::write(chunk_repo.path().join("setup.py"), "# build\n").unwrap();
        commit_all(chunk_repo.path());
        let chunk_url = format!("file://{}", chunk_repo.path().display());

        let definitions = TempDir::new().unwrap();
        init_repo(definitions.path());
        std::fs::write(definitions.path().join("VERSION"), "version: 7\n").unwrap();
        std::fs::write(
            definitions.path().join("DEFAULTS"),
            "split-rules:\n  chunk:\n  - artifact: -bins\n    include:\n    - (usr/)?bin/.*\n",
        )
        .unwrap();
        std::fs::create_dir_all(definitions.path().join("strata")).unwrap();
        std::fs::create_dir_all(definitions.path().join("systems")).unwrap();
        std::fs::write(
            definitions.path().join("systems/devel.morph"),
            "\
name: devel
kind: system
arch: x86_64
strata:
- name: core
  morph: strata/core.morph
",
        )
        .unwrap();
        std::fs::write(
            definitions.path().join("strata/core.morph"),
            format!(
                "\
name: core
kind: stratum
chunks:
- name: hello
  repo: {chunk_url}
  ref: main
  build-system: python-distutils
  build-mode: bootstrap
"
            ),
        )
        .unwrap();
        commit_all(definitions.path());

        Definitions {
            definitions,
            chunk_repo,
            gits: TempDir::new().unwrap(),
        }
    }

    fn url(dir: &TempDir) -> String {
        format!("file://{}", dir.path().display())
    }

    async fn resolve_pool(defs: &Definitions) -> SourcePool {
        let lrc = LocalRepoCache::new(defs.gits.path().to_path_buf(), RepoAliasResolver::default());
        let mut resolver =
            SourceResolver::new(&lrc, None, true, defs.gits.path().join("memos"));
        resolver
            .create_source_pool(
                &url(&defs.definitions),
                "main",
                &["systems/devel.morph".to_string()],
                None,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn resolves_system_stratum_and_chunk() {
        let defs = setup();
        let pool = resolve_pool(&defs).await;

        assert_eq!(pool.len(), 3);
        let kinds: Vec<MorphologyKind> = pool.iter().map(Source::kind).collect();
        assert_eq!(
            kinds,
            vec![
                MorphologyKind::System,
                MorphologyKind::Stratum,
                MorphologyKind::Chunk
            ]
        );

        let chunk = pool.iter().last().unwrap();
        assert_eq!(chunk.name(), "hello");
        assert_eq!(chunk.original_ref, "main");
        assert_eq!(chunk.repo_name, url(&defs.chunk_repo));
        assert!(crate::repocache::is_valid_sha1(&chunk.sha1));
    }

    #[tokio::test]
    async fn defaults_split_rules_apply_to_chunks() {
        let defs = setup();
        let pool = resolve_pool(&defs).await;
        let chunk = pool.iter().last().unwrap();
        // The DEFAULTS file declared a -bins rule for chunks.
        assert_eq!(chunk.split_rules.artifacts(), vec!["hello-bins"]);
    }

    #[tokio::test]
    async fn resolution_is_idempotent() {
        let defs = setup();
        let first: Vec<_> = resolve_pool(&defs)
            .await
            .iter()
            .map(|s| (s.repo_name.clone(), s.sha1.clone(), s.filename.clone()))
            .collect();
        let second: Vec<_> = resolve_pool(&defs)
            .await
            .iter()
            .map(|s| (s.repo_name.clone(), s.sha1.clone(), s.filename.clone()))
            .collect();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn chunk_without_morphology_is_detected() {
        let defs = setup();
        let pool = resolve_pool(&defs).await;
        let chunk = pool.iter().last().unwrap();
        // The chunk repo only has setup.py; the stratum spec named
        // build-system python-distutils and no morph file exists, so
        // the synthesised morphology detects the same.
        let morph = chunk.morphology.as_chunk().unwrap();
        assert_eq!(
            morph.build_system,
            morph_core::BuildSystemKind::PythonDistutils
        );
    }

    #[tokio::test]
    async fn missing_morphology_without_detection_fails() {
        let defs = setup();
        let lrc = LocalRepoCache::new(defs.gits.path().to_path_buf(), RepoAliasResolver::default());
        let mut resolver =
            SourceResolver::new(&lrc, None, true, defs.gits.path().join("memos"));
        let err = resolver
            .create_source_pool(
                &url(&defs.definitions),
                "main",
                &["systems/missing.morph".to_string()],
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::MorphologyNotFound { .. }));
    }

    #[tokio::test]
    async fn clusters_are_not_buildable() {
        let defs = setup();
        std::fs::write(
            defs.definitions.path().join("cluster.morph"),
            "\
name: deploy
kind: cluster
systems:
- morph: systems/devel.morph
  deploy:
    site:
      type: rawdisk
",
        )
        .unwrap();
        commit_all(defs.definitions.path());

        let lrc = LocalRepoCache::new(defs.gits.path().to_path_buf(), RepoAliasResolver::default());
        let mut resolver =
            SourceResolver::new(&lrc, None, true, defs.gits.path().join("memos"));
        let err = resolver
            .create_source_pool(
                &url(&defs.definitions),
                "main",
                &["cluster.morph".to_string()],
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::CannotBuildCluster));
    }

    #[tokio::test]
    async fn uncached_repo_without_update_fails() {
        let defs = setup();
        let lrc = LocalRepoCache::new(defs.gits.path().to_path_buf(), RepoAliasResolver::default());
        let mut resolver =
            SourceResolver::new(&lrc, None, false, defs.gits.path().join("memos"));
        let err = resolver
            .create_source_pool(
                &url(&defs.definitions),
                "main",
                &["systems/devel.morph".to_string()],
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::NotCached(_)));
    }

    #[tokio::test]
    async fn original_ref_is_kept_on_sources() {
        let defs = setup();
        let lrc = LocalRepoCache::new(defs.gits.path().to_path_buf(), RepoAliasResolver::default());
        let mut resolver =
            SourceResolver::new(&lrc, None, true, defs.gits.path().join("memos"));
        let pool = resolver
            .create_source_pool(
                &url(&defs.definitions),
                "main",
                &["systems/devel.morph".to_string()],
                Some("baserock/builds/abc"),
            )
            .await
            .unwrap();
        let system = pool.iter().next().unwrap();
        assert_eq!(system.original_ref, "baserock/builds/abc");
    }

    #[test]
    fn disk_memo_round_trips_and_bounds_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("memo.json");

        let mut memo = DiskMemo::load(path.clone(), 3);
        for i in 0..5 {
            memo.put(format!("key-{i}"), serde_json::json!(i));
        }
        assert_eq!(memo.len(), 3);
        assert!(memo.get("key-0").is_none());
        assert_eq!(memo.get("key-4").unwrap(), &serde_json::json!(4));
        memo.save();

        let reloaded = DiskMemo::load(path, 3);
        assert_eq!(reloaded.len(), 3);
        assert_eq!(reloaded.get("key-2").unwrap(), &serde_json::json!(2));
    }
}
