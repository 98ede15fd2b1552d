#![doc = include_str!("../README.md")]
#![warn(rustdoc::all)]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

pub mod error;
pub use error::{BuildError, BuildIoError, Result};

mod hash;
pub use hash::ContentHash;

pub mod rule;
pub use rule::{DepItem, RuleId};

pub mod memo;
pub use memo::{MemoDb, MemoEntry};

pub mod session;
pub use session::{Ctx, Exec, ExecCtx, Session};

pub mod libset;
pub use libset::{LibRecord, LibSet};

pub mod toolchain;

pub mod crawl;

pub mod product;

pub mod gasnet;

pub mod install;

pub mod utils;

use std::{
    collections::BTreeMap,
    future::Future,
    path::{Path, PathBuf},
};

/// Directory name of the memo store under the project root.
pub const CACHE_DIR_NAME: &str = ".upcxx-build";

/// A source tree the engine builds from, plus the ambient configuration a
/// build run snapshots: environment, crawlable directories, per-directory
/// library requirements and the subprocess concurrency cap.
///
/// The environment is captured once at construction so that every build run
/// observes a consistent view; rules re-read it only through fact-recording
/// accessors on [`Ctx`].
#[derive(Clone, Debug)]
pub struct Project {
    root: PathBuf,
    src_dir: PathBuf,
    test_dir: PathBuf,
    cache_dir: PathBuf,
    crawl_dirs: Vec<PathBuf>,
    include_alias: String,
    gasnet_source_dirs: Vec<PathBuf>,
    backend_source_dirs: Vec<PathBuf>,
    jobs: usize,
    env: BTreeMap<String, String>,
}

impl Project {
    /// A project rooted at `root` with the conventional layout: sources
    /// under `src/`, tests under `test/`, the memo store under
    /// `.upcxx-build/`, and both source directories crawlable.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = utils::canonicalize(root.as_ref())?;
        let src_dir = root.join("src");
        let test_dir = root.join("test");
        let cache_dir = root.join(CACHE_DIR_NAME);
        Ok(Self {
            crawl_dirs: vec![src_dir.clone(), test_dir.clone()],
            src_dir,
            test_dir,
            cache_dir,
            root,
            include_alias: "upcxx".to_string(),
            gasnet_source_dirs: Vec::new(),
            backend_source_dirs: Vec::new(),
            jobs: num_cpus::get(),
            env: std::env::vars().collect(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn src_dir(&self) -> &Path {
        &self.src_dir
    }

    pub fn test_dir(&self) -> &Path {
        &self.test_dir
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Directories within which a header implies a sibling source file.
    pub fn crawl_dirs(&self) -> &[PathBuf] {
        &self.crawl_dirs
    }

    /// Name under which the include shim exposes `src/`
    /// (`#include <upcxx/foo.hpp>`).
    pub fn include_alias(&self) -> &str {
        &self.include_alias
    }

    /// Directories whose sources link against GASNet.
    pub fn gasnet_source_dirs(&self) -> &[PathBuf] {
        &self.gasnet_source_dirs
    }

    /// Directories whose sources require the UPC++ backend pseudo-library.
    pub fn backend_source_dirs(&self) -> &[PathBuf] {
        &self.backend_source_dirs
    }

    /// Maximum number of concurrently running external processes.
    pub fn jobs(&self) -> usize {
        self.jobs
    }

    /// Read a variable from the environment snapshot.
    pub fn env_var(&self, name: &str) -> Option<&str> {
        self.env.get(name).map(String::as_str)
    }

    /// The whole environment snapshot taken at construction.
    pub fn env_snapshot(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn set_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs;
        self
    }

    /// Replace the environment snapshot (primarily for tests and embedders).
    pub fn set_env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self
    }

    /// Override or add a single environment variable in the snapshot.
    pub fn env_override(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    pub fn set_crawl_dirs<I, P>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.crawl_dirs = dirs.into_iter().map(Into::into).collect();
        self
    }

    pub fn add_gasnet_source_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.gasnet_source_dirs.push(dir.into());
        self
    }

    pub fn add_backend_source_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backend_source_dirs.push(dir.into());
        self
    }

    /// Run one build to completion on a fresh single-threaded runtime.
    ///
    /// This is the synchronous entrypoint the CLI uses; embedders already
    /// inside a runtime can drive [`Session`] directly.
    pub fn run_build<T, F, Fut>(&self, body: F) -> Result<T>
    where
        F: FnOnce(Ctx) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let session = Session::new(self)?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| BuildError::msg(format!("failed to start runtime: {err}")))?;
        runtime.block_on(body(session.ctx()))
    }
}
