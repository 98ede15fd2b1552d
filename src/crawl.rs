//! Transitive discovery of translation units.
//!
//! The project encodes translation-unit grouping by filename convention: a
//! header `foo.hpp` pairs with a sibling `foo.cpp` (or any other recognized
//! source extension). Starting from one entry source, the crawler asks the
//! compiler for each file's header closure and, for every header inside a
//! crawlable directory, probes for sibling sources to pull into the build.
//! Every probe is recorded as a file dependency, so a sibling that appears
//! later invalidates the crawl.

use crate::{
    error::Result,
    libset::LibSet,
    session::Ctx,
    utils,
};
use futures::{future::LocalBoxFuture, stream::FuturesUnordered, FutureExt, StreamExt};
use std::{
    collections::{BTreeSet, HashSet},
    path::{Path, PathBuf},
};

/// Compile the entry source and every sibling source reachable through its
/// transitive header closure. Returns the set of produced object files and
/// the merged library set of all compiled sources.
///
/// Sources are processed concurrently; per-source work deduplicates through
/// the session's rule table, and the first failure cancels the rest.
pub async fn crawl(cxt: &Ctx, entry: &Path) -> Result<(Vec<PathBuf>, LibSet)> {
    let entry = utils::canonicalized(entry);
    let mut visited: HashSet<PathBuf> = HashSet::new();
    let mut incs_seen: HashSet<PathBuf> = HashSet::new();
    let mut objs: BTreeSet<PathBuf> = BTreeSet::new();
    let mut libset = LibSet::new();

    type SourceDone = Result<(PathBuf, LibSet, Vec<PathBuf>)>;
    let mut pending: FuturesUnordered<LocalBoxFuture<'_, SourceDone>> = FuturesUnordered::new();

    visited.insert(entry.clone());
    pending.push(source_task(cxt, entry).boxed_local());

    while let Some(done) = pending.next().await {
        let (obj, src_libs, incs) = done?;
        objs.insert(obj);
        libset.merge_from(src_libs)?;

        for inc in incs {
            let inc = utils::canonicalized(inc);
            if !incs_seen.insert(inc.clone()) {
                continue;
            }
            let base = utils::without_ext(&inc);
            if !cxt.project().crawl_dirs().iter().any(|d| utils::path_within_dir(&base, d)) {
                continue;
            }
            for ext in utils::SOURCE_EXTS {
                let sibling = PathBuf::from(format!("{}{ext}", base.display()));
                cxt.depend_file(&sibling)?;
                if sibling.exists() && visited.insert(sibling.clone()) {
                    pending.push(source_task(cxt, sibling).boxed_local());
                }
            }
        }
    }

    Ok((objs.into_iter().collect(), libset))
}

/// Per-source fan-out: header closure, object file and library set resolve
/// concurrently.
async fn source_task(cxt: &Ctx, src: PathBuf) -> Result<(PathBuf, LibSet, Vec<PathBuf>)> {
    let (incs, obj, libs) = futures::future::try_join3(
        cxt.includes(&src),
        cxt.compile(&src),
        cxt.libraries(&src),
    )
    .await?;
    Ok((obj, libs, incs))
}
