//! Library sets.
//!
//! A library set maps a short library name (`m` for `libm`) to a record
//! describing how to compile against and link with it: include directories
//! and headers, flag vectors for the preprocess/code-gen/link phases, static
//! archives, and the names of the libraries it depends on. The flag-list
//! accessors at the bottom render complete command-line fragments; `incdirs`,
//! `incfiles` and `libfiles` are deliberately *not* baked into the stored
//! flag vectors.

use crate::error::{BuildError, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::{btree_map, BTreeMap, BTreeSet, HashMap},
    path::{Path, PathBuf},
};

/// How to compile against and link with one library.
///
/// `primary` marks libraries the immediate consumer targets directly;
/// non-primary records are transitive dependencies. An empty `ld` means the
/// caller decides which linker front-end to use.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct LibRecord {
    #[serde(default)]
    pub primary: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ld: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub incdirs: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub incfiles: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ppflags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cgflags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ldflags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub libfiles: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub libflags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deplibs: Vec<String>,
}

impl LibRecord {
    /// Equality on everything except `primary`, which merges disjunctively.
    fn config_eq(&self, other: &Self) -> bool {
        let mut a = self.clone();
        let mut b = other.clone();
        a.primary = false;
        b.primary = false;
        a == b
    }
}

/// An ordered collection of library records keyed by short name.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LibSet(BTreeMap<String, LibRecord>);

impl LibSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, record: LibRecord) {
        self.0.insert(name.into(), record);
    }

    pub fn get(&self, name: &str) -> Option<&LibRecord> {
        self.0.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, LibRecord> {
        self.0.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// The names of all primary records.
    pub fn primary_names(&self) -> Vec<&str> {
        self.0.iter().filter(|(_, r)| r.primary).map(|(n, _)| n.as_str()).collect()
    }

    /// Merge the records of `other` into `self`.
    ///
    /// Records sharing a name must agree on every field except `primary`
    /// (true if either side is true); disagreement is a hard error.
    pub fn merge_from(&mut self, other: LibSet) -> Result<()> {
        for (name, theirs) in other.0 {
            match self.0.entry(name) {
                btree_map::Entry::Vacant(slot) => {
                    slot.insert(theirs);
                }
                btree_map::Entry::Occupied(mut slot) => {
                    let ours = slot.get_mut();
                    if !ours.config_eq(&theirs) {
                        return Err(BuildError::conflict(format!(
                            "Multiple '{}' libraries with differing configurations.",
                            slot.key()
                        )));
                    }
                    ours.primary = ours.primary || theirs.primary;
                }
            }
        }
        Ok(())
    }

    /// Combine a series of libsets into one.
    pub fn merge<I: IntoIterator<Item = LibSet>>(sets: I) -> Result<LibSet> {
        let mut ans = LibSet::new();
        for set in sets {
            ans.merge_from(set)?;
        }
        Ok(ans)
    }

    /// A copy with every record demoted to non-primary.
    pub fn as_secondary(&self) -> LibSet {
        let mut ans = self.clone();
        for record in ans.0.values_mut() {
            record.primary = false;
        }
        ans
    }

    /// Preprocessor flags: every record's `ppflags`, then a deduplicated
    /// `-I<dir>` per include directory (first occurrence wins).
    pub fn ppflags(&self) -> Vec<String> {
        let mut flags: Vec<String> = Vec::new();
        for record in self.0.values() {
            flags.extend(record.ppflags.iter().cloned());
        }
        for record in self.0.values() {
            for dir in &record.incdirs {
                let flag = format!("-I{}", dir.display());
                if !flags.contains(&flag) {
                    flags.push(flag);
                }
            }
        }
        flags
    }

    /// Code-gen flags across all records.
    pub fn cgflags(&self) -> Vec<String> {
        self.0.values().flat_map(|r| r.cgflags.iter().cloned()).collect()
    }

    /// Link-phase flags across all records.
    pub fn ldflags(&self) -> Vec<String> {
        self.0.values().flat_map(|r| r.ldflags.iter().cloned()).collect()
    }

    /// The one linker command demanded by the set, if any.
    ///
    /// Empty `ld` vectors are "caller decides"; more than one distinct
    /// non-empty command is a hard error.
    pub fn ld(&self) -> Result<Option<Vec<String>>> {
        let lds: BTreeSet<&Vec<String>> =
            self.0.values().map(|r| &r.ld).filter(|ld| !ld.is_empty()).collect();
        match lds.len() {
            0 => Ok(None),
            1 => Ok(lds.into_iter().next().cloned()),
            _ => Err(BuildError::conflict(format!(
                "Multiple linkers demanded:{}",
                lds.into_iter()
                    .map(|ld| format!("\n  {}", ld.join(" ")))
                    .collect::<String>()
            ))),
        }
    }

    /// Link-line library flags from a topological sort over `deplibs`.
    ///
    /// Static archives resolve left to right, so a consumer must appear
    /// before the archive that satisfies it: dependencies are emitted in
    /// post-order and the whole line is reversed. `-L` flags are
    /// deduplicated preserving first occurrence. A `deplibs` cycle is a hard
    /// error.
    pub fn libflags(&self) -> Result<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit(
            set: &LibSet,
            name: &str,
            marks: &mut HashMap<String, Mark>,
            lpaths: &mut Vec<Vec<String>>,
            lflags: &mut Vec<Vec<String>>,
        ) -> Result<()> {
            match marks.get(name) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => {
                    return Err(BuildError::conflict(format!(
                        "Dependency cycle through library '{name}'."
                    )))
                }
                None => {}
            }
            marks.insert(name.to_string(), Mark::Visiting);

            let synthesized;
            let record = match set.get(name) {
                Some(record) => record,
                None => {
                    // unknown short name: assume the toolchain can find it
                    synthesized =
                        LibRecord { libflags: vec![format!("-l{name}")], ..Default::default() };
                    &synthesized
                }
            };

            for dep in &record.deplibs {
                visit(set, dep, marks, lpaths, lflags)?;
            }
            marks.insert(name.to_string(), Mark::Done);

            lpaths.push(
                record
                    .libfiles
                    .iter()
                    .map(|f| format!("-L{}", f.parent().unwrap_or(Path::new("")).display()))
                    .collect(),
            );
            lflags.push(
                record
                    .libfiles
                    .iter()
                    .map(|f| format!("-l{}", archive_link_name(f)))
                    .chain(record.libflags.iter().cloned())
                    .collect(),
            );
            Ok(())
        }

        let mut marks = HashMap::new();
        let mut lpaths: Vec<Vec<String>> = Vec::new();
        let mut lflags: Vec<Vec<String>> = Vec::new();
        for name in self.0.keys() {
            visit(self, name, &mut marks, &mut lpaths, &mut lflags)?;
        }

        lpaths.reverse();
        lflags.reverse();

        let mut unique_lpaths: Vec<String> = Vec::new();
        for flag in lpaths.into_iter().flatten() {
            if !unique_lpaths.contains(&flag) {
                unique_lpaths.push(flag);
            }
        }
        unique_lpaths.extend(lflags.into_iter().flatten());
        Ok(unique_lpaths)
    }
}

impl FromIterator<(String, LibRecord)> for LibSet {
    fn from_iter<I: IntoIterator<Item = (String, LibRecord)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for LibSet {
    type Item = (String, LibRecord);
    type IntoIter = btree_map::IntoIter<String, LibRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// `path/to/libfoo.a` -> `foo`.
fn archive_link_name(libfile: &Path) -> String {
    let base = libfile.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let stem = base.strip_suffix(".a").unwrap_or(base);
    stem.strip_prefix("lib").unwrap_or(stem).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn lib(primary: bool, deplibs: &[&str], libfiles: &[&str]) -> LibRecord {
        LibRecord {
            primary,
            deplibs: deplibs.iter().map(|s| s.to_string()).collect(),
            libfiles: libfiles.iter().map(PathBuf::from).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn merge_is_associative() {
        let mut a = LibSet::new();
        a.insert("x", lib(true, &[], &["/p/libx.a"]));
        let mut b = LibSet::new();
        b.insert("y", lib(false, &["x"], &[]));
        let mut c = LibSet::new();
        c.insert("x", lib(false, &[], &["/p/libx.a"]));

        let left = LibSet::merge([LibSet::merge([a.clone(), b.clone()]).unwrap(), c.clone()])
            .unwrap();
        let right =
            LibSet::merge([a, LibSet::merge([b, c]).unwrap()]).unwrap();
        assert_eq!(left, right);
    }

    #[test]
    fn merge_ors_primary() {
        let mut a = LibSet::new();
        a.insert("x", lib(false, &[], &[]));
        let mut b = LibSet::new();
        b.insert("x", lib(true, &[], &[]));
        let merged = LibSet::merge([a, b]).unwrap();
        assert!(merged.get("x").unwrap().primary);
    }

    #[test]
    fn merge_conflict_is_fatal() {
        let mut a = LibSet::new();
        a.insert("upcxx-backend", LibRecord {
            ppflags: vec!["-DUPCXX_BACKEND=gasnet1_seq".into()],
            ..Default::default()
        });
        let mut b = LibSet::new();
        b.insert("upcxx-backend", LibRecord {
            ppflags: vec!["-DUPCXX_BACKEND=gasnet1_par".into()],
            ..Default::default()
        });
        let err = LibSet::merge([a, b]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Multiple 'upcxx-backend' libraries with differing configurations."
        );
    }

    #[test]
    fn as_secondary_is_idempotent() {
        let mut s = LibSet::new();
        s.insert("x", lib(true, &[], &[]));
        s.insert("y", lib(false, &[], &[]));
        let once = s.as_secondary();
        assert_eq!(once, once.as_secondary());
        assert!(once.iter().all(|(_, r)| !r.primary));
    }

    #[test]
    fn ld_unique_or_fatal() {
        let mut s = LibSet::new();
        s.insert("a", LibRecord { ld: vec!["mpicc".into()], ..Default::default() });
        s.insert("b", LibRecord::default());
        assert_eq!(s.ld().unwrap(), Some(vec!["mpicc".to_string()]));

        s.insert("c", LibRecord { ld: vec!["cc".into()], ..Default::default() });
        let err = s.ld().unwrap_err();
        assert!(err.to_string().starts_with("Multiple linkers demanded:"), "{err}");
    }

    #[test]
    fn libflags_orders_consumers_before_providers() {
        let mut s = LibSet::new();
        s.insert("A", lib(true, &["B"], &["/l/libA.a"]));
        s.insert("B", lib(false, &[], &["/l/libB.a"]));
        let flags = s.libflags().unwrap();
        let la = flags.iter().position(|f| f == "-lA").unwrap();
        let lb = flags.iter().position(|f| f == "-lB").unwrap();
        assert!(la < lb, "{flags:?}");
        // -L flags are deduplicated and lead the line
        assert_eq!(flags.iter().filter(|f| *f == "-L/l").count(), 1);
        assert_eq!(flags[0], "-L/l");
    }

    #[test]
    fn libflags_synthesizes_unknown_names() {
        let mut s = LibSet::new();
        s.insert("A", lib(true, &["m"], &["/l/libA.a"]));
        let flags = s.libflags().unwrap();
        let la = flags.iter().position(|f| f == "-lA").unwrap();
        let lm = flags.iter().position(|f| f == "-lm").unwrap();
        assert!(la < lm, "{flags:?}");
    }

    #[test]
    fn libflags_detects_cycles() {
        let mut s = LibSet::new();
        s.insert("A", lib(true, &["B"], &[]));
        s.insert("B", lib(false, &["A"], &[]));
        let err = s.libflags().unwrap_err();
        assert!(err.to_string().contains("Dependency cycle"), "{err}");
    }

    #[test]
    fn ppflags_dedups_incdirs_keeping_first() {
        let mut s = LibSet::new();
        s.insert("a", LibRecord {
            ppflags: vec!["-DX=1".into()],
            incdirs: vec!["/i/one".into(), "/i/two".into()],
            ..Default::default()
        });
        s.insert("b", LibRecord { incdirs: vec!["/i/one".into()], ..Default::default() });
        assert_eq!(s.ppflags(), vec!["-DX=1", "-I/i/one", "-I/i/two"]);
    }
}
