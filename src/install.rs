//! The install writer.
//!
//! Produces the conventional `bin/include/lib` layout plus a pkgconfig-like
//! metadata script `bin/<name>-meta` that echoes the installed library set's
//! flag lists. Every created path is undo-logged; any failure removes them
//! all, and a collision with a pre-existing file aborts as clobber-refused
//! rather than overwriting.

use crate::{
    error::{BuildError, Result},
    libset::LibSet,
    utils,
};
use std::{
    collections::BTreeSet,
    fs, io,
    path::{Path, PathBuf},
};

/// Write `libset` under `install_path` as an `include/`, `lib/` and
/// `bin/<name>-meta` tree, with headers and archives hard-linked (or copied)
/// from their build locations.
pub fn install_libset(install_path: &Path, name: &str, libset: &LibSet) -> Result<()> {
    let mut undo: Vec<PathBuf> = Vec::new();
    match write_tree(install_path, name, libset, &mut undo) {
        Ok(()) => Ok(()),
        Err(err) => {
            debug!(%err, undo = undo.len(), "rolling back partial install");
            for path in undo.iter().rev() {
                let _ = if path.is_dir() { fs::remove_dir_all(path) } else { fs::remove_file(path) };
            }
            if is_clobber(&err) {
                Err(BuildError::Clobber(install_path.to_path_buf()))
            } else {
                Err(err)
            }
        }
    }
}

fn is_clobber(err: &BuildError) -> bool {
    matches!(err, BuildError::Io(ioe) if ioe.inner().kind() == io::ErrorKind::AlreadyExists)
}

fn write_tree(
    install_path: &Path,
    name: &str,
    libset: &LibSet,
    undo: &mut Vec<PathBuf>,
) -> Result<()> {
    let include_root = install_path.join("include");
    let lib_root = install_path.join("lib");

    let mut libfiles_all: Vec<PathBuf> = Vec::new();
    let mut installed = LibSet::new();

    for (xname, rec) in libset.iter() {
        let mut installed_incs: Vec<PathBuf> = Vec::new();
        libfiles_all.extend(rec.libfiles.iter().cloned());

        // copy each header once per containing include directory, preserving
        // its relative path under include/
        for f in &rec.incfiles {
            for d in rec.incdirs.iter().rev() {
                let Ok(rel) = f.strip_prefix(d) else { continue };
                let dest = include_root.join(rel);
                installed_incs.push(dest.clone());
                utils::create_parent_dir_all(&dest)?;
                undo.push(dest.clone());
                utils::link_or_copy(f, &dest).map_err(|err| BuildError::io(err, &dest))?;
            }
        }

        let mut rec1 = rec.clone();
        rec1.incdirs = vec![include_root.clone()];
        rec1.incfiles = installed_incs;
        rec1.libfiles = rec
            .libfiles
            .iter()
            .map(|f| lib_root.join(f.file_name().unwrap_or_default()))
            .collect();
        installed.insert(xname.clone(), rec1);
    }

    let basenames: BTreeSet<_> = libfiles_all.iter().filter_map(|f| f.file_name()).collect();
    if basenames.len() != libfiles_all.len() {
        return Err(BuildError::conflict(format!(
            "Duplicate library names in list:\n  {}",
            libfiles_all.iter().map(|f| f.display().to_string()).collect::<Vec<_>>().join("\n  ")
        )));
    }

    for f in &libfiles_all {
        let dest = lib_root.join(f.file_name().unwrap_or_default());
        utils::create_parent_dir_all(&dest)?;
        undo.push(dest.clone());
        utils::link_or_copy(f, &dest).map_err(|err| BuildError::io(err, &dest))?;
    }

    let meta = install_path.join("bin").join(format!("{name}-meta"));
    utils::create_parent_dir_all(&meta)?;
    if meta.exists() {
        return Err(BuildError::io(
            io::Error::new(io::ErrorKind::AlreadyExists, "metadata script exists"),
            &meta,
        ));
    }
    undo.push(meta.clone());
    let script = format!(
        "#!/bin/sh\nPPFLAGS=\"{}\"\nLDFLAGS=\"{}\"\nLIBFLAGS=\"{}\"\n[ \"$1\" != \"\" ] && eval echo '$'\"$1\"\n",
        installed.ppflags().join(" "),
        installed.ldflags().join(" "),
        installed.libflags()?.join(" "),
    );
    fs::write(&meta, script).map_err(|err| BuildError::io(err, &meta))?;
    utils::set_executable(&meta)?;

    info!(path = %install_path.display(), %name, "installed");
    Ok(())
}
