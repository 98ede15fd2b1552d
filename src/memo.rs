//! The persistent memo store.
//!
//! Facts produced by memoized rules survive across build invocations, keyed
//! on the digest of the dependency set their probe recorded. Artifacts live
//! in a managed tree next to the db file; an entry is only served while its
//! artifacts still exist and its execute-phase file observations still hold.

use crate::{
    error::{BuildError, Result},
    hash::ContentHash,
    rule::{FileDep, RuleId},
    utils,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

/// Format marker of the memo db file; bumping it discards older stores.
const MEMO_FORMAT: &str = "upcxx-build-memo-1";

/// The file name of the memo db inside the cache directory.
pub const MEMO_DB_FILENAME: &str = "memo.json";

/// One persisted result of a memoized rule instance.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MemoEntry {
    /// Digest of the probe's dependency set.
    pub digest: ContentHash,
    /// The fact returned to callers.
    pub result: serde_json::Value,
    /// Paths allocated by the execute phase; all must exist for a hit.
    pub artifacts: Vec<PathBuf>,
    /// Files first observed during execute (e.g. headers reported by the
    /// compiler), revalidated in recorded order.
    pub post_deps: Vec<FileDep>,
}

impl MemoEntry {
    /// Incremental revalidation: post-deps in recorded order first (the
    /// first mismatch aborts), then artifact existence.
    fn is_valid(&self) -> bool {
        self.post_deps.iter().all(FileDep::still_valid)
            && self.artifacts.iter().all(|p| p.exists())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MemoFile {
    #[serde(rename = "_format")]
    format: String,
    rules: BTreeMap<String, Vec<MemoEntry>>,
}

impl Default for MemoFile {
    fn default() -> Self {
        Self { format: MEMO_FORMAT.to_string(), rules: BTreeMap::new() }
    }
}

/// Persistent key→artifact map rooted at `<cache_dir>`.
#[derive(Debug)]
pub struct MemoDb {
    cache_dir: PathBuf,
    file: MemoFile,
}

impl MemoDb {
    /// Opens (or initializes) the store under the given cache directory.
    ///
    /// A db file with an unknown `_format` is discarded, not an error.
    pub fn open(cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let cache_dir = cache_dir.into();
        fs::create_dir_all(&cache_dir).map_err(|err| BuildError::io(err, &cache_dir))?;
        let db_path = cache_dir.join(MEMO_DB_FILENAME);
        let file = if db_path.exists() {
            match utils::read_json_file::<MemoFile>(&db_path) {
                Ok(file) if file.format == MEMO_FORMAT => file,
                Ok(file) => {
                    debug!(format = %file.format, "discarding memo db with unknown format");
                    MemoFile::default()
                }
                Err(err) => {
                    debug!(%err, "discarding unreadable memo db");
                    MemoFile::default()
                }
            }
        } else {
            MemoFile::default()
        };
        trace!(cache_dir = %cache_dir.display(), rules = file.rules.len(), "opened memo db");
        Ok(Self { cache_dir, file })
    }

    /// The directory artifact paths are allocated under.
    pub fn artifact_root(&self) -> PathBuf {
        self.cache_dir.join("art")
    }

    fn db_path(&self) -> PathBuf {
        self.cache_dir.join(MEMO_DB_FILENAME)
    }

    /// Look up a still-valid entry for `(rule, dep-digest)`.
    pub fn lookup(&self, id: &RuleId, digest: &ContentHash) -> Option<MemoEntry> {
        let entries = self.file.rules.get(&id.instance_key())?;
        let entry = entries.iter().find(|e| e.digest == *digest)?;
        if entry.is_valid() {
            trace!(rule = %id, digest = %digest.short(), "memo hit");
            Some(entry.clone())
        } else {
            trace!(rule = %id, digest = %digest.short(), "memo entry stale");
            None
        }
    }

    /// Persist an entry, replacing any previous one with the same digest.
    ///
    /// The caller has already written the artifacts, so the rename of the db
    /// file is the commit point: an interrupted build never leaves an entry
    /// pointing at a missing artifact.
    pub fn store(&mut self, id: &RuleId, entry: MemoEntry) -> Result<()> {
        let entries = self.file.rules.entry(id.instance_key()).or_default();
        entries.retain(|e| e.digest != entry.digest);
        entries.push(entry);
        utils::write_json_file(&self.file, &self.db_path())
    }

    /// A fresh artifact path owned by one rule instance and dependency
    /// digest: `art/<instance>/<digest8>/<key><suffix>`.
    ///
    /// With an empty `key` and `suffix` this is the per-instance directory
    /// itself (created), for rules that lay out their own tree.
    pub fn mkpath(
        &self,
        id: &RuleId,
        digest: &ContentHash,
        key: Option<&str>,
        suffix: &str,
    ) -> Result<PathBuf> {
        let dir = self.artifact_root().join(id.instance_key()).join(digest.short());
        fs::create_dir_all(&dir).map_err(|err| BuildError::io(err, &dir))?;
        let name = format!("{}{}", key.unwrap_or(""), suffix);
        if name.is_empty() {
            Ok(dir)
        } else {
            Ok(dir.join(name))
        }
    }

    /// A fresh temp file path under the store; the file is created empty and
    /// kept (its owner decides its lifetime).
    pub fn mktemp(&self) -> Result<PathBuf> {
        let tmp_dir = self.cache_dir.join("tmp");
        fs::create_dir_all(&tmp_dir).map_err(|err| BuildError::io(err, &tmp_dir))?;
        let file = tempfile::Builder::new()
            .prefix("t")
            .tempfile_in(&tmp_dir)
            .map_err(|err| BuildError::io(err, &tmp_dir))?;
        let (_, path) = file.keep().map_err(|err| BuildError::io(err.error, &tmp_dir))?;
        Ok(path)
    }

    /// Materialize a symlink tree artifact: a directory whose entries point
    /// at the given targets.
    pub fn mktree(
        &self,
        id: &RuleId,
        digest: &ContentHash,
        entries: &BTreeMap<String, PathBuf>,
    ) -> Result<PathBuf> {
        let root = self.mkpath(id, digest, Some("tree"), "")?;
        if root.exists() {
            // re-execution with the same digest lays the same links down
            fs::remove_dir_all(&root).map_err(|err| BuildError::io(err, &root))?;
        }
        utils::mktree(&root, entries)?;
        Ok(root)
    }
}

/// Whether `path` lies inside the artifact store of `cache_dir`.
pub fn in_artifact_store(path: &Path, cache_dir: &Path) -> bool {
    utils::path_within_dir(path, cache_dir)
}
