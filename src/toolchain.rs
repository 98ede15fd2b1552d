//! The toolchain driver: compiler resolution and composition layers.
//!
//! Command vectors are composed in layers, each rule consuming the previous:
//! `cxx`/`cc` resolve the front-end, `comp_lang` adds the language dialect,
//! `comp_lang_pp` the preprocessor surface, `comp_lang_pp_cg` the code-gen
//! knobs, and `compiler` yields the per-file base command an object
//! invocation is appended to.

use crate::{
    error::{BuildError, Result},
    session::{Ctx, Exec},
    utils,
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

/// A regex that matches a make-rule line continuation (`\` at end of line).
static RE_MAKE_CONTINUATION: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\\r?\n").unwrap());

/// Flags engaging the C11 dialect for the C compiler.
const LANG_C11: &[&str] = &["-std=c11"];

/// Flags engaging the C++11 dialect for the C++ compiler.
const LANG_CXX11: &[&str] = &["-std=c++11"];

fn arg_of(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl Ctx {
    /// Command vector for the C++ compiler.
    ///
    /// Priority: the cross-config script's `CXX`, then the user's `CXX`
    /// environment variable, then a host default (`CC` on NERSC Cray
    /// front-ends, `g++` otherwise).
    pub async fn cxx(&self) -> Result<Vec<String>> {
        self.transient("cxx", vec![], |cxt| async move {
            let config = cxt.gasnet_config().await?;
            let from_cross: Vec<String> = config
                .env
                .get("CXX")
                .map(|v| v.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default();

            let mut default = Vec::new();
            if matches!(cxt.env("NERSC_HOST")?.as_deref(), Some("cori" | "edison")) {
                default = vec!["CC".to_string()];
            }
            if default.is_empty() {
                default = vec!["g++".to_string()];
            }

            let from_user: Vec<String> = cxt
                .env("CXX")?
                .map(|v| v.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default();

            if !from_cross.is_empty() && !from_user.is_empty() && from_user != from_cross {
                warn!(
                    "Cross C++ compiler ({}) differs from CXX environment variable ({}).",
                    from_cross.join(" "),
                    from_user.join(" ")
                );
            }

            if !from_cross.is_empty() {
                Ok(from_cross)
            } else if !from_user.is_empty() {
                Ok(from_user)
            } else {
                Ok(default)
            }
        })
        .await
    }

    /// Command vector for the C compiler (same priority scheme as [`Ctx::cxx`]).
    pub async fn cc(&self) -> Result<Vec<String>> {
        self.transient("cc", vec![], |cxt| async move {
            let config = cxt.gasnet_config().await?;
            let from_cross: Vec<String> = config
                .env
                .get("CC")
                .map(|v| v.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default();

            let mut default = Vec::new();
            if matches!(cxt.env("NERSC_HOST")?.as_deref(), Some("cori" | "edison")) {
                default = vec!["cc".to_string()];
            }
            if default.is_empty() {
                default = vec!["gcc".to_string()];
            }

            let from_user: Vec<String> = cxt
                .env("CC")?
                .map(|v| v.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default();

            if !from_cross.is_empty() && !from_user.is_empty() && from_user != from_cross {
                warn!(
                    "Cross C compiler ({}) differs from CC environment variable ({}).",
                    from_cross.join(" "),
                    from_user.join(" ")
                );
            }

            if !from_cross.is_empty() {
                Ok(from_cross)
            } else if !from_user.is_empty() {
                Ok(from_user)
            } else {
                Ok(default)
            }
        })
        .await
    }

    /// File-specific compiler with the source-language dialect flags.
    pub async fn comp_lang(&self, src: &Path) -> Result<Vec<String>> {
        let src = src.to_path_buf();
        self.transient("comp-lang", vec![arg_of(&src)], |cxt| async move {
            if utils::is_cxx_source(&src) {
                let mut comp = cxt.cxx().await?;
                comp.extend(LANG_CXX11.iter().map(|s| s.to_string()));
                Ok(comp)
            } else if utils::is_c_source(&src) {
                let mut comp = cxt.cc().await?;
                comp.extend(LANG_C11.iter().map(|s| s.to_string()));
                Ok(comp)
            } else {
                Err(BuildError::config(format!(
                    "Unrecognized source file extension: {}",
                    src.display()
                )))
            }
        })
        .await
    }

    /// Identity string of the file-specific compiler: its verbatim
    /// `--version` output.
    pub async fn comp_version(&self, src: &Path) -> Result<String> {
        let src = src.to_path_buf();
        self.transient("comp-version", vec![arg_of(&src)], |cxt| async move {
            let comp = if utils::is_cxx_source(&src) {
                cxt.cxx().await?
            } else if utils::is_c_source(&src) {
                cxt.cc().await?
            } else {
                return Err(BuildError::config(format!(
                    "Unrecognized source file extension: {}",
                    src.display()
                )));
            };
            let exec = Exec::new(comp).arg("--version");
            let output = cxt.launch(&exec).await?;
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        })
        .await
    }

    /// File-specific compiler with language and preprocessor flags.
    pub async fn comp_lang_pp(&self, src: &Path) -> Result<Vec<String>> {
        let src = src.to_path_buf();
        self.transient("comp-lang-pp", vec![arg_of(&src)], |cxt| async move {
            let mut comp = cxt.comp_lang(&src).await?;
            let shim = cxt.include_tree().await?;
            let libs = cxt.libraries(&src).await?;
            // Required for full latest POSIX on some systems
            comp.push("-D_GNU_SOURCE=1".to_string());
            comp.push(format!("-I{}", shim.display()));
            comp.extend(libs.ppflags());
            Ok(comp)
        })
        .await
    }

    /// Code-gen optimization level (`OPTLEV`, default 2).
    pub fn cg_optlev(&self) -> Result<i64> {
        self.env_int("OPTLEV", 2)
    }

    /// Whether to emit debugging symbols (`DBGSYM`, default off).
    pub fn cg_dbgsym(&self) -> Result<bool> {
        self.env_flag("DBGSYM")
    }

    /// File-specific compiler with language, preprocessor and code-gen flags.
    pub async fn comp_lang_pp_cg(&self, src: &Path) -> Result<Vec<String>> {
        let src = src.to_path_buf();
        self.transient("comp-lang-pp-cg", vec![arg_of(&src)], |cxt| async move {
            let mut comp = cxt.comp_lang_pp(&src).await?;
            let optlev = cxt.cg_optlev()?;
            let dbgsym = cxt.cg_dbgsym()?;
            let libs = cxt.libraries(&src).await?;
            comp.push(format!("-O{optlev}"));
            if dbgsym {
                comp.push("-g".to_string());
            }
            comp.push("-Wall".to_string());
            comp.extend(libs.cgflags());
            Ok(comp)
        })
        .await
    }

    /// The per-file base command; `-c <src> -o <obj>` is appended to it by
    /// the compile rule.
    pub async fn compiler(&self, src: &Path) -> Result<Vec<String>> {
        self.comp_lang_pp_cg(src).await
    }

    /// Shim directory containing the single symlink `<alias> -> src/`, so
    /// project headers resolve as `#include <upcxx/foo.hpp>` through one
    /// `-I`.
    pub async fn include_tree(&self) -> Result<PathBuf> {
        self.memoized(
            "include-tree",
            vec![],
            |cxt| async move {
                let alias = cxt.project().include_alias().to_string();
                let src_dir = cxt.project().src_dir().to_path_buf();
                cxt.depend_fact("alias", &alias)?;
                cxt.depend_fact("src-dir", &arg_of(&src_dir))?;
                Ok((alias, src_dir))
            },
            |ecxt, (alias, src_dir)| async move {
                let entries = BTreeMap::from([(alias, src_dir)]);
                ecxt.mktree(&entries)
            },
        )
        .await
    }

    /// All non-system headers pulled in by preprocessing `src`, as reported
    /// by the compiler's dependency-generation mode. Memoized; each reported
    /// header is recorded so its change invalidates the entry.
    pub async fn includes(&self, src: &Path) -> Result<Vec<PathBuf>> {
        let src = src.to_path_buf();
        let arg = arg_of(&src);
        self.memoized(
            "includes",
            vec![arg],
            move |cxt| async move {
                cxt.depend_file(&src)?;
                let version = cxt.comp_version(&src).await?;
                cxt.depend_fact("compiler", &version)?;
                let comp_pp = cxt.comp_lang_pp(&src).await?;
                Ok((comp_pp, src))
            },
            |ecxt, (comp_pp, src)| async move {
                // See the depcomp script in automake for adapting this to
                // compilers without a GCC-compatible -MM mode.
                let exec = Exec::new(comp_pp).args(["-MM", "-MT", "x"]).arg(arg_of(&src));
                let output = ecxt.launch(&exec).await?;
                let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                let deps = parse_make_deps(&stdout)?
                    .into_iter()
                    .skip(1) // first prerequisite is the source file itself
                    .map(utils::absolutize)
                    .collect::<Vec<PathBuf>>();
                ecxt.depend_files(&deps)?;
                Ok(deps)
            },
        )
        .await
    }

    /// Compile `src` into an object file in the artifact store.
    pub async fn compile(&self, src: &Path) -> Result<PathBuf> {
        let src = src.to_path_buf();
        let arg = arg_of(&src);
        self.memoized(
            "compile",
            vec![arg],
            move |cxt| async move {
                let compiler = cxt.compiler(&src).await?;
                let version = cxt.comp_version(&src).await?;
                cxt.depend_fact("compiler", &version)?;
                let includes = cxt.includes(&src).await?;
                cxt.depend_file(&src)?;
                cxt.depend_files(includes)?;
                Ok((compiler, src))
            },
            |ecxt, (compiler, src)| async move {
                let base = src
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "src".to_string());
                let obj = ecxt.mkpath(None, &format!("{base}.o"))?;
                let exec = Exec::new(compiler)
                    .args(["-c".to_string(), arg_of(&src), "-o".to_string(), arg_of(&obj)]);
                ecxt.launch(&exec).await?;
                Ok(obj)
            },
        )
        .await
    }

    /// Whether `src` links against GASNet: project configuration plus the
    /// `REQUIRES_GASNET` override hook.
    pub fn requires_gasnet(&self, src: &Path) -> Result<bool> {
        let forced = self.env_flag("REQUIRES_GASNET")?;
        let configured =
            self.project().gasnet_source_dirs().iter().any(|d| utils::path_within_dir(src, d));
        let ans = forced || configured;
        self.depend_fact(format!("requires-gasnet:{}", src.display()), &ans)?;
        Ok(ans)
    }

    /// Whether `src` requires the UPC++ backend pseudo-library.
    pub fn requires_upcxx_backend(&self, src: &Path) -> Result<bool> {
        let forced = self.env_flag("REQUIRES_UPCXX_BACKEND")?;
        let configured =
            self.project().backend_source_dirs().iter().any(|d| utils::path_within_dir(src, d));
        let ans = forced || configured;
        self.depend_fact(format!("requires-upcxx-backend:{}", src.display()), &ans)?;
        Ok(ans)
    }

    /// The library set required to compile and eventually link `src`.
    pub async fn libraries(&self, src: &Path) -> Result<crate::LibSet> {
        let src = src.to_path_buf();
        self.transient("libraries", vec![arg_of(&src)], |cxt| async move {
            let gasnet = if cxt.requires_gasnet(&src)? {
                cxt.gasnet().await?
            } else {
                crate::LibSet::new()
            };
            let backend = if cxt.requires_upcxx_backend(&src)? {
                cxt.upcxx_backend().await?
            } else {
                crate::LibSet::new()
            };
            crate::LibSet::merge([gasnet, backend])
        })
        .await
    }
}

/// Parse the output of a GCC-style `-MM -MT x` invocation into its
/// prerequisite list: strip the `x:` target, join `\`-continued lines,
/// unescape `\ ` within paths, split on whitespace.
pub fn parse_make_deps(output: &str) -> Result<Vec<PathBuf>> {
    let rest = match output.find(':') {
        Some(idx) => &output[idx + 1..],
        None => {
            return Err(BuildError::msg(format!(
                "Unexpected dependency output from compiler: {output:?}"
            )))
        }
    };
    let joined = RE_MAKE_CONTINUATION.replace_all(rest, " ");

    let mut deps = Vec::new();
    let mut token = String::new();
    let mut chars = joined.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&' ') => {
                chars.next();
                token.push(' ');
            }
            c if c.is_whitespace() => {
                if !token.is_empty() {
                    deps.push(PathBuf::from(std::mem::take(&mut token)));
                }
            }
            c => token.push(c),
        }
    }
    if !token.is_empty() {
        deps.push(PathBuf::from(token));
    }
    Ok(deps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_continued_dep_lines() {
        let out = "x: /a/b.cpp /a/b.hpp \\\n  /a/c.hpp \\\n  /usr/include/d.h\n";
        let deps = parse_make_deps(out).unwrap();
        assert_eq!(
            deps,
            vec![
                PathBuf::from("/a/b.cpp"),
                PathBuf::from("/a/b.hpp"),
                PathBuf::from("/a/c.hpp"),
                PathBuf::from("/usr/include/d.h"),
            ]
        );
    }

    #[test]
    fn unescapes_spaces_in_paths() {
        let out = "x: /a/my\\ file.cpp /a/hdr.hpp\n";
        let deps = parse_make_deps(out).unwrap();
        assert_eq!(deps, vec![PathBuf::from("/a/my file.cpp"), PathBuf::from("/a/hdr.hpp")]);
    }

    #[test]
    fn rejects_unrecognized_output() {
        assert!(parse_make_deps("garbage with no rule").is_err());
    }
}
