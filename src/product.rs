//! Build products: executables, static libraries, install trees.

use crate::{
    crawl::crawl,
    error::{BuildError, Result},
    install,
    libset::{LibRecord, LibSet},
    session::{Ctx, Exec},
    utils,
};
use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

fn arg_of(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn stem_of(path: &Path) -> String {
    path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_else(|| "out".into())
}

impl Ctx {
    /// Crawl from `entry`, link all produced objects and their library
    /// dependencies, and return the executable's path.
    ///
    /// If some library supplies a linker command it is used with its first
    /// token replaced by the C++ compiler's, so linking always goes through
    /// a compatible front-end driver; otherwise the C++ compiler links.
    pub async fn executable(&self, entry: &Path) -> Result<PathBuf> {
        let entry = utils::canonicalized(entry);
        let arg = arg_of(&entry);
        self.memoized(
            "executable",
            vec![arg],
            move |cxt| async move {
                let (objs, libset) = crawl(&cxt, &entry).await?;
                let cxx = cxt.cxx().await?;
                Ok((entry, objs, libset, cxx))
            },
            |ecxt, (entry, objs, libset, cxx)| async move {
                let exe = ecxt.mkpath(Some(&stem_of(&entry)), ".x")?;

                let ld = link_command(libset.ld()?, &cxx);

                let exec = Exec::new(ld)
                    .args(libset.ldflags())
                    .args(["-o".to_string(), arg_of(&exe)])
                    .args(objs.iter().map(|o| arg_of(o)))
                    .args(libset.libflags()?);
                ecxt.launch(&exec).await?;
                Ok(exe)
            },
        )
        .await
    }

    /// Crawl from `entry` and archive the produced objects into
    /// `lib<stem>.a`, returning a library set with the new archive as the
    /// one primary record and the crawled set demoted to secondary.
    ///
    /// The record's public headers are the entry's transitive headers lying
    /// inside the repository or the artifact store, served through the
    /// include shim so clients use the canonical `<upcxx/...>` paths.
    pub async fn library(&self, entry: &Path) -> Result<LibSet> {
        let entry = utils::canonicalized(entry);
        let arg = arg_of(&entry);
        self.memoized(
            "library",
            vec![arg],
            move |cxt| async move {
                let (objs, libset) = crawl(&cxt, &entry).await?;

                let root = cxt.project().root().to_path_buf();
                let cache = cxt.project().cache_dir().to_path_buf();
                let incs: BTreeSet<PathBuf> = cxt
                    .includes(&entry)
                    .await?
                    .into_iter()
                    .filter(|i| {
                        utils::path_within_dir(i, &root) || utils::path_within_dir(i, &cache)
                    })
                    .collect();

                let inc_dir = cxt.include_tree().await?;
                Ok((entry, objs, libset, incs.into_iter().collect::<Vec<_>>(), inc_dir))
            },
            |ecxt, (entry, objs, libset, incs, inc_dir)| async move {
                let par_dir = ecxt.mkpath(None, "")?;
                let libname = stem_of(&entry);
                let libpath = par_dir.join(format!("lib{libname}.a"));

                let exec = Exec::new(["ar".to_string(), "rcs".to_string(), arg_of(&libpath)])
                    .args(objs.iter().map(|o| arg_of(o)));
                ecxt.launch(&exec).await?;

                let deplibs = libset.names().map(str::to_string).collect();
                let mut primary = LibSet::new();
                primary.insert(
                    libname,
                    LibRecord {
                        primary: true,
                        incdirs: vec![inc_dir],
                        incfiles: incs,
                        libfiles: vec![libpath],
                        deplibs,
                        ..Default::default()
                    },
                );
                LibSet::merge([libset.as_secondary(), primary])
            },
        )
        .await
    }

    /// Build the library for `entry` and write the `bin/include/lib` tree
    /// under `dest`. Partial writes are rolled back; colliding with
    /// existing files refuses to clobber.
    pub async fn install(&self, entry: &Path, dest: &Path) -> Result<()> {
        let entry = utils::canonicalized(entry);
        let dest = utils::absolutize(dest);
        let args = vec![arg_of(&entry), arg_of(&dest)];
        self.transient("install", args, |cxt| async move {
            let libset = cxt.library(&entry).await?;

            let primaries = libset.primary_names();
            let &[name] = primaries.as_slice() else {
                return Err(BuildError::conflict(format!(
                    "Expected exactly one primary library, got: {}",
                    primaries.join(", ")
                )));
            };
            install::install_libset(&dest, name, &libset)
        })
        .await
    }
}

/// The link command: a library-supplied linker with its first token replaced
/// by the C++ compiler's (forcing a compatible front-end driver), or the C++
/// compiler itself when no library demands a linker.
fn link_command(ld: Option<Vec<String>>, cxx: &[String]) -> Vec<String> {
    let mut ld = ld.unwrap_or_else(|| cxx.to_vec());
    if let (Some(slot), Some(front)) = (ld.first_mut(), cxx.first()) {
        *slot = front.clone();
    }
    ld
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn v(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn link_command_substitutes_front_end() {
        let cxx = v(&["g++", "-std=c++11"]);
        assert_eq!(
            link_command(Some(v(&["mpicc", "-pthread", "-lrt"])), &cxx),
            v(&["g++", "-pthread", "-lrt"])
        );
        assert_eq!(link_command(None, &cxx), cxx);
    }
}
