//! Utility functions

use crate::error::{BuildError, BuildIoError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

/// Extensions recognized as C++ translation units.
pub const CXX_EXTS: &[&str] = &[".cpp", ".cxx", ".c++", ".C", ".C++"];

/// Extensions recognized as C translation units.
pub const C_EXTS: &[&str] = &[".c"];

/// Every extension probed when looking for a sibling source of a header.
pub const SOURCE_EXTS: &[&str] = &[".c", ".cpp", ".cxx", ".c++", ".C", ".C++"];

fn has_any_ext(path: &Path, exts: &[&str]) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else { return false };
    // `Path::extension` folds case on some platforms; the `.C`/`.c` split is
    // significant here, so compare raw name suffixes.
    exts.iter().any(|ext| name.ends_with(ext) && name.len() > ext.len())
}

/// Whether the file name carries a C++ source extension.
pub fn is_cxx_source(path: &Path) -> bool {
    has_any_ext(path, CXX_EXTS)
}

/// Whether the file name carries a C source extension.
pub fn is_c_source(path: &Path) -> bool {
    has_any_ext(path, C_EXTS) && !has_any_ext(path, CXX_EXTS)
}

/// The path with its final extension removed: `src/a.hpp` -> `src/a`.
pub fn without_ext(path: &Path) -> PathBuf {
    path.with_extension("")
}

/// Returns `true` if `path` equals `dir` or lies underneath it.
pub fn path_within_dir(path: &Path, dir: &Path) -> bool {
    path == dir || path.strip_prefix(dir).is_ok()
}

/// Canonicalize the path, resolving symlinks, without UNC weirdness.
pub fn canonicalize(path: impl AsRef<Path>) -> Result<PathBuf, BuildIoError> {
    let path = path.as_ref();
    dunce::canonicalize(path).map_err(|err| BuildIoError::new(err, path))
}

/// Like [`canonicalize`] but falls back to the input for paths that do not
/// exist (probed sibling sources, artifact paths about to be created).
pub fn canonicalized(path: impl Into<PathBuf>) -> PathBuf {
    let path = path.into();
    canonicalize(&path).unwrap_or(path)
}

/// Make `path` absolute against the current working directory.
pub fn absolutize(path: impl Into<PathBuf>) -> PathBuf {
    let path = path.into();
    if path.is_absolute() {
        path
    } else {
        std::env::current_dir().map(|cwd| cwd.join(&path)).unwrap_or(path)
    }
}

/// Creates all parent directories of the given file path.
pub fn create_parent_dir_all(file: impl AsRef<Path>) -> Result<()> {
    let file = file.as_ref();
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent).map_err(|err| BuildError::io(err, parent))?;
    }
    Ok(())
}

/// Materialize a directory whose entries are symlinks to the given targets.
///
/// Existing `root` contents are left alone; colliding names error.
pub fn mktree(root: &Path, entries: &BTreeMap<String, PathBuf>) -> Result<()> {
    fs::create_dir_all(root).map_err(|err| BuildError::io(err, root))?;
    for (name, target) in entries {
        let link = root.join(name);
        symlink(target, &link)?;
    }
    Ok(())
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link).map_err(|err| BuildError::io(err, link))
}

#[cfg(not(unix))]
fn symlink(target: &Path, link: &Path) -> Result<()> {
    // Symlink creation is privileged on some platforms; a copy preserves the
    // include-resolution semantics the shim needs.
    fs::copy(target, link).map_err(|err| BuildError::io(err, link))?;
    Ok(())
}

/// Hard-link `src` to `dst`, falling back to a copy across filesystems.
///
/// Never overwrites: an existing `dst` surfaces as `AlreadyExists`, which the
/// install writer maps to a clobber-refused error.
pub fn link_or_copy(src: &Path, dst: &Path) -> Result<(), io::Error> {
    if dst.exists() {
        return Err(io::Error::new(io::ErrorKind::AlreadyExists, "destination exists"));
    }
    match fs::hard_link(src, dst) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Err(err),
        Err(_) => fs::copy(src, dst).map(|_| ()),
    }
}

/// Mark a file executable (0755). No-op outside unix.
pub fn set_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o755);
        fs::set_permissions(path, perms).map_err(|err| BuildError::io(err, path))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// Deserializes the json file at the given path.
pub fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = fs::File::open(path).map_err(|err| BuildError::io(err, path))?;
    let file = io::BufReader::new(file);
    Ok(serde_json::from_reader(file)?)
}

/// Serializes to json and writes atomically: a sibling temp file is written
/// first and renamed over `path`, so interrupted writes never leave a torn
/// file behind.
pub fn write_json_file<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    create_parent_dir_all(path)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|err| BuildError::io(err, dir))?;
    let buf = serde_json::to_vec_pretty(value)?;
    io::Write::write_all(&mut tmp, &buf).map_err(|err| BuildError::io(err, path))?;
    tmp.persist(path).map_err(|err| BuildError::io(err.error, path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_extensions() {
        assert!(is_cxx_source(Path::new("a/b.cpp")));
        assert!(is_cxx_source(Path::new("a/b.C")));
        assert!(is_cxx_source(Path::new("a/b.c++")));
        assert!(is_c_source(Path::new("a/b.c")));
        assert!(!is_c_source(Path::new("a/b.cpp")));
        assert!(!is_cxx_source(Path::new("a/b.hpp")));
        assert!(!is_cxx_source(Path::new(".cpp")));
    }

    #[test]
    fn within_dir() {
        let dir = Path::new("/x/y");
        assert!(path_within_dir(Path::new("/x/y"), dir));
        assert!(path_within_dir(Path::new("/x/y/z.h"), dir));
        assert!(!path_within_dir(Path::new("/x/z.h"), dir));
    }

    #[test]
    fn strips_final_extension_only() {
        assert_eq!(without_ext(Path::new("/a/b.gen.hpp")), PathBuf::from("/a/b.gen"));
    }
}
