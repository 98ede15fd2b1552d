//! Acquiring, configuring and building GASNet.
//!
//! The engine consumes GASNet through a narrow interface: a build (or
//! install) directory yielding a `<conduit>-<syncmode>.mak` makefile
//! fragment, from which the linker command and flag vectors are extracted.
//! Everything upstream of that (tarball download, cross-configure capture,
//! `configure` and `make`) is modeled as memoized rules so a finished GASNet
//! build is never repeated.

use crate::{
    error::{BuildError, Result},
    libset::{LibRecord, LibSet},
    session::{Ctx, Exec, ExecCtx},
    utils,
};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

/// Base64 of the default GASNet-EX release tarball URL.
const DEFAULT_GASNET_URL_B64: &str =
    "aHR0cDovL2dhc25ldC5sYmwuZ292L0VYL0dBU05ldC0yMDE3LjYuMC50YXIuZ3o=";

/// Conduits configure probes for even when absent; disabled to prevent
/// configure failures when that hardware is detected.
const DISABLED_CONDUITS: &[&str] =
    &["--disable-psm", "--disable-mxm", "--disable-portals4", "--disable-ofi"];

/// Environment variables always kept from a cross-configure capture.
const CROSS_ENV_KEEP: &[&str] =
    &["CC", "CXX", "HOST_CC", "HOST_CXX", "MPI_CC", "MPI_CFLAGS", "MPI_LIBS", "MPIRUN_CMD"];

/// What the `GASNET` environment variable points at.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "kebab-case")]
pub enum GasnetUser {
    /// A URL to fetch a release tarball from.
    TarballUrl(String),
    /// A local tarball file.
    Tarball(PathBuf),
    /// An already-configured build directory (has a `Makefile`).
    Build(PathBuf),
    /// An installed tree (has `include/` and `lib/`).
    Install(PathBuf),
    /// An unpacked source tree.
    Source(PathBuf),
}

/// The argv and environment delta a site's cross-configure script would
/// hand to `configure`.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct CrossConfig {
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl Ctx {
    /// Classify the `GASNET` environment variable.
    pub async fn gasnet_user(&self) -> Result<GasnetUser> {
        self.transient("gasnet-user", vec![], |cxt| async move {
            let value = match cxt.env("GASNET")? {
                Some(v) if !v.is_empty() => v,
                _ => {
                    let bytes = base64::engine::general_purpose::STANDARD
                        .decode(DEFAULT_GASNET_URL_B64)
                        .map_err(|err| BuildError::msg(format!("bad builtin url: {err}")))?;
                    String::from_utf8_lossy(&bytes).into_owned()
                }
            };

            if let Ok(parsed) = url::Url::parse(&value) {
                if parsed.host().is_some() {
                    return Ok(GasnetUser::TarballUrl(value));
                }
            }

            let path = PathBuf::from(&value);
            if !path.exists() {
                return Err(BuildError::config(format!("Non-existent path for GASNET={value}")));
            }
            let path = utils::canonicalize(&path)?;
            if path.is_file() {
                Ok(GasnetUser::Tarball(path))
            } else if path.join("Makefile").exists() {
                Ok(GasnetUser::Build(path))
            } else if path.join("include").exists() && path.join("lib").exists() {
                Ok(GasnetUser::Install(path))
            } else {
                Ok(GasnetUser::Source(path))
            }
        })
        .await
    }

    /// GASNet conduit to use.
    pub async fn gasnet_conduit(&self) -> Result<String> {
        self.transient("gasnet-conduit", vec![], |cxt| async move {
            let default = if cxt.env_or("CROSS", "")?.starts_with("cray-aries-") {
                "aries"
            } else {
                "smp"
            };
            cxt.env_or("GASNET_CONDUIT", default)
        })
        .await
    }

    /// GASNet sync-mode to use.
    pub async fn gasnet_syncmode(&self) -> Result<String> {
        self.transient("gasnet-syncmode", vec![], |_cxt| async move {
            // TODO: derive from the chosen UPC++ backend once more than
            // gasnet1_seq exists
            Ok("seq".to_string())
        })
        .await
    }

    /// A GASNet source tree: as given, derived from a build directory, or
    /// fetched and unpacked from a tarball.
    pub async fn gasnet_source(&self) -> Result<PathBuf> {
        self.memoized(
            "gasnet-source",
            vec![],
            |cxt| async move {
                let user = cxt.gasnet_user().await?;
                if let GasnetUser::Tarball(tgz) = &user {
                    // the user may swap the tarball without renaming it
                    cxt.depend_file(tgz)?;
                }
                Ok(user)
            },
            |ecxt, user| async move {
                match user {
                    GasnetUser::Source(dir) => Ok(dir),
                    GasnetUser::Build(dir) => {
                        let makefile = dir.join("Makefile");
                        let top = ecxt.makefile_extract(&makefile, "TOP_SRCDIR").await?;
                        if top.is_empty() {
                            return Err(BuildError::config(format!(
                                "Missing TOP_SRCDIR in {}",
                                makefile.display()
                            )));
                        }
                        Ok(PathBuf::from(top))
                    }
                    GasnetUser::Install(dir) => Ok(dir),
                    GasnetUser::Tarball(tgz) => untar(&ecxt, &tgz).await,
                    GasnetUser::TarballUrl(url) => {
                        let tgz = ecxt.mktemp()?;
                        info!("Downloading {url}");
                        let body =
                            reqwest::get(url.as_str()).await?.error_for_status()?.bytes().await?;
                        tokio::fs::write(&tgz, &body)
                            .await
                            .map_err(|err| BuildError::io(err, &tgz))?;
                        info!("Finished    {url}");
                        untar(&ecxt, &tgz).await
                    }
                }
            },
        )
        .await
    }

    /// The `(argv, env)` context in which the site's
    /// `other/contrib/cross-configure-<CROSS>` script would run `configure`.
    ///
    /// Without `CROSS` this is empty. With it, the script runs against a
    /// shallow copy of the GASNet tree whose `configure` is a shim that
    /// captures its argv and environment instead of configuring.
    pub async fn gasnet_config(&self) -> Result<CrossConfig> {
        self.memoized(
            "gasnet-config",
            vec![],
            |cxt| async move {
                let cross = cxt.env("CROSS")?.filter(|v| !v.is_empty());
                let user = cxt.gasnet_user().await?;

                if cross.is_some() && matches!(user, GasnetUser::Install(_)) {
                    return Err(BuildError::config(
                        "It is invalid to use both cross-compile (CROSS) and externally \
                         installed gasnet (GASNET).",
                    ));
                }

                let gasnet_src = if cross.is_some() {
                    Some(cxt.gasnet_source().await?)
                } else {
                    None
                };

                // canned env-var dependencies of the site scripts
                match cross.as_deref() {
                    Some("cray-aries-slurm") => {
                        cxt.env("SRUN")?;
                    }
                    Some("bgq") => {
                        cxt.env("USE_GCC")?;
                        cxt.env("USE_CLANG")?;
                    }
                    _ => {}
                }

                Ok((cross, gasnet_src))
            },
            |ecxt, (cross, gasnet_src)| async move {
                let Some(cross) = cross else { return Ok(CrossConfig::default()) };
                let gasnet_src = gasnet_src.expect("cross implies a source tree");

                let crosslong = format!("cross-configure-{cross}");
                let crosspath = gasnet_src.join("other").join("contrib").join(&crosslong);
                if !crosspath.exists() {
                    return Err(BuildError::config(format!(
                        "Invalid GASNet cross-compile script name ({cross})."
                    )));
                }

                // Shallow copy of the source tree minus "configure", plus the
                // site script at top level.
                let mut entries: BTreeMap<String, PathBuf> = BTreeMap::new();
                let listing = fs::read_dir(&gasnet_src)
                    .map_err(|err| BuildError::io(err, &gasnet_src))?;
                for item in listing {
                    let item = item.map_err(|err| BuildError::io(err, &gasnet_src))?;
                    let name = item.file_name().to_string_lossy().into_owned();
                    if name != "configure" {
                        entries.insert(name, item.path());
                    }
                }
                entries.insert(crosslong.clone(), crosspath);
                let tree = ecxt.mktree(&entries)?;

                // Shim "configure" reaping the command line and environment.
                let capture = ecxt.mkpath(Some("capture"), "")?;
                fs::create_dir_all(&capture).map_err(|err| BuildError::io(err, &capture))?;
                let shim = tree.join("configure");
                fs::write(
                    &shim,
                    "#!/bin/sh\nprintf '%s\\0' \"$@\" > \"$CAPTURE_DIR/argv\"\nenv -0 > \"$CAPTURE_DIR/env\"\n",
                )
                .map_err(|err| BuildError::io(err, &shim))?;
                utils::set_executable(&shim)?;

                let script = tree.join(&crosslong);
                let exec = Exec::new([script.to_string_lossy().into_owned()])
                    .cwd(&tree)
                    .env("CAPTURE_DIR", capture.to_string_lossy().into_owned());
                ecxt.launch(&exec).await.map_err(|_| {
                    BuildError::config(format!(
                        "GASNet cross-compile script ({cross}) failed."
                    ))
                })?;

                let argv = read_nul_list(&capture.join("argv"))?;
                let captured = read_nul_env(&capture.join("env"))?;
                let env = cross_env_delta(captured, ecxt.project().env_snapshot());
                Ok(CrossConfig { args: argv, env })
            },
        )
        .await
    }

    /// A configured GASNet build directory.
    pub async fn gasnet_configured(&self) -> Result<PathBuf> {
        enum Input {
            Ready(PathBuf),
            Configure {
                cc: Vec<String>,
                cxx: Vec<String>,
                optlev: i64,
                debug: bool,
                config: CrossConfig,
                source_dir: PathBuf,
            },
        }

        self.memoized(
            "gasnet-configured",
            vec![],
            |cxt| async move {
                if let GasnetUser::Build(dir) = cxt.gasnet_user().await? {
                    return Ok(Input::Ready(dir));
                }
                let cc = cxt.cc().await?;
                cxt.depend_fact("CC", &version_of(&cxt, &cc).await?)?;
                let cxx = cxt.cxx().await?;
                cxt.depend_fact("CXX", &version_of(&cxt, &cxx).await?)?;
                Ok(Input::Configure {
                    cc,
                    cxx,
                    optlev: cxt.cg_optlev()?,
                    debug: cxt.cg_dbgsym()?,
                    config: cxt.gasnet_config().await?,
                    source_dir: cxt.gasnet_source().await?,
                })
            },
            |ecxt, input| async move {
                let (cc, cxx, optlev, debug, config, source_dir) = match input {
                    Input::Ready(dir) => return Ok(dir),
                    Input::Configure { cc, cxx, optlev, debug, config, source_dir } => {
                        (cc, cxx, optlev, debug, config, source_dir)
                    }
                };

                let build_dir = ecxt.mkpath(Some("build"), "")?;
                fs::create_dir_all(&build_dir).map_err(|err| BuildError::io(err, &build_dir))?;

                let mut env = config.env.clone();
                env.entry("CC".to_string())
                    .or_insert_with(|| format!("{} -O{optlev}", cc.join(" ")));
                env.entry("CXX".to_string())
                    .or_insert_with(|| format!("{} -O{optlev}", cxx.join(" ")));

                let mut exec = Exec::new([source_dir
                    .join("configure")
                    .to_string_lossy()
                    .into_owned()])
                .args(config.args.iter().cloned())
                .cwd(&build_dir)
                .envs(env);
                if debug {
                    exec = exec.arg("--enable-debug");
                }
                exec = exec.args(DISABLED_CONDUITS.iter().copied());

                info!("Configuring GASNet...");
                ecxt.launch(&exec).await?;
                Ok(build_dir)
            },
        )
        .await
    }

    /// Build GASNet and distill its makefile fragment into a library set.
    pub async fn gasnet(&self) -> Result<LibSet> {
        self.memoized(
            "gasnet",
            vec![],
            |cxt| async move {
                let user = cxt.gasnet_user().await?;
                let conduit = cxt.gasnet_conduit().await?;
                let syncmode = cxt.gasnet_syncmode().await?;
                let (installed, dir) = match user {
                    GasnetUser::Install(dir) => (true, dir),
                    _ => (false, cxt.gasnet_configured().await?),
                };
                Ok((conduit, syncmode, installed, dir))
            },
            |ecxt, (conduit, syncmode, installed, dir)| async move {
                if !installed {
                    info!("Building GASNet (conduit={conduit}, threading={syncmode})...");
                    let exec = Exec::new(["make".to_string(), syncmode.clone()])
                        .cwd(dir.join(format!("{conduit}-conduit")));
                    ecxt.launch(&exec).await?;
                }

                let mut makefile = dir.clone();
                if installed {
                    makefile.push("include");
                }
                makefile.push(format!("{conduit}-conduit"));
                makefile.push(format!("{conduit}-{syncmode}.mak"));

                let ld = split_words(&ecxt.makefile_extract(&makefile, "GASNET_LD").await?);
                if ld.is_empty() {
                    return Err(BuildError::config(format!(
                        "Missing GASNET_LD in {}",
                        makefile.display()
                    )));
                }
                let ldflags =
                    split_words(&ecxt.makefile_extract(&makefile, "GASNET_LDFLAGS").await?);
                let mut ppflags =
                    split_words(&ecxt.makefile_extract(&makefile, "GASNET_CXXCPPFLAGS").await?);
                let cgflags =
                    split_words(&ecxt.makefile_extract(&makefile, "GASNET_CXXFLAGS").await?);
                let mut libflags =
                    split_words(&ecxt.makefile_extract(&makefile, "GASNET_LIBS").await?);

                let mut incdirs: Vec<PathBuf> = Vec::new();
                let mut incfiles: Vec<PathBuf> = Vec::new();
                let mut libfiles: Vec<PathBuf> = Vec::new();

                if !installed {
                    // pull "-I..." arguments out of the preprocessor flags
                    incdirs = ppflags
                        .iter()
                        .filter_map(|x| x.strip_prefix("-I"))
                        .map(PathBuf::from)
                        .collect();
                    ppflags.retain(|x| !x.starts_with("-I"));

                    let build_makefile = dir.join("Makefile");
                    let source_dir = PathBuf::from(
                        ecxt.makefile_extract(&build_makefile, "TOP_SRCDIR").await?,
                    );
                    incfiles = split_words(
                        &ecxt.makefile_extract(&build_makefile, "include_HEADERS").await?,
                    )
                    .into_iter()
                    .map(|h| source_dir.join(h))
                    .collect();

                    // resolve "-L"/"-l" pairs into concrete archives made by
                    // this gasnet build
                    let libdirs: Vec<PathBuf> = libflags
                        .iter()
                        .filter_map(|x| x.strip_prefix("-L"))
                        .map(PathBuf::from)
                        .filter(|d| utils::path_within_dir(d, &dir))
                        .collect();
                    let libnames: Vec<String> = libflags
                        .iter()
                        .filter_map(|x| x.strip_prefix("-l"))
                        .map(str::to_string)
                        .collect();

                    let mut matched: Vec<String> = Vec::new();
                    for libname in &libnames {
                        for libdir in &libdirs {
                            let libfile = libdir.join(format!("lib{libname}.a"));
                            if libfile.exists() {
                                if matched.iter().any(|m| m == libname) {
                                    return Err(BuildError::conflict(format!(
                                        "Library '{libname}' found under multiple gasnet lib \
                                         directories."
                                    )));
                                }
                                libfiles.push(libfile);
                                matched.push(libname.clone());
                            }
                        }
                    }

                    libflags.retain(|x| {
                        if let Some(d) = x.strip_prefix("-L") {
                            !libdirs.iter().any(|ld| ld == Path::new(d))
                        } else if let Some(n) = x.strip_prefix("-l") {
                            !matched.iter().any(|m| m == n)
                        } else {
                            true
                        }
                    });
                }

                let mut set = LibSet::new();
                set.insert(
                    "gasnet",
                    LibRecord {
                        primary: true,
                        ld,
                        incdirs,
                        incfiles,
                        ppflags,
                        cgflags,
                        ldflags,
                        libfiles,
                        libflags,
                        // all library-level dependencies are flattened into
                        // libflags by gasnet itself
                        deplibs: vec![],
                    },
                );
                Ok(set)
            },
        )
        .await
    }

    /// Pseudo-library injecting `-DUPCXX_BACKEND=<value>` and roping in
    /// gasnet as a secondary dependency.
    pub async fn upcxx_backend(&self) -> Result<LibSet> {
        self.transient("upcxx-backend", vec![], |cxt| async move {
            let backend = cxt.env_or("UPCXX_BACKEND", "gasnet1_seq")?;
            let mut set = LibSet::new();
            set.insert(
                "upcxx-backend",
                LibRecord {
                    primary: true,
                    ppflags: vec![format!("-DUPCXX_BACKEND={backend}")],
                    deplibs: vec!["gasnet".to_string()],
                    ..Default::default()
                },
            );
            let gasnet = cxt.gasnet().await?;
            LibSet::merge([set, gasnet.as_secondary()])
        })
        .await
    }
}

/// Verbatim `--version` output of a compiler command.
async fn version_of(cxt: &Ctx, comp: &[String]) -> Result<String> {
    let exec = Exec::new(comp.iter().cloned()).arg("--version");
    let output = cxt.launch(&exec).await?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

impl ExecCtx {
    /// Extract a variable's value from a makefile by spawning `make` on a
    /// generated include-and-echo recipe. `-s` is required so make's
    /// directory chatter does not pollute the captured value.
    pub async fn makefile_extract(&self, makefile: &Path, varname: &str) -> Result<String> {
        let script =
            format!("include {}\ngimme:\n\t@echo $({})\n", makefile.display(), varname);
        let exec = Exec::new(["make", "-s", "-f", "-", "gimme"]).stdin(script.into_bytes());
        let output = self.launch(&exec).await.map_err(|_| {
            BuildError::config(format!("Makefile {} not found.", makefile.display()))
        })?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

async fn untar(ecxt: &ExecCtx, tgz: &Path) -> Result<PathBuf> {
    let untar_dir = ecxt.mkpath(Some("src"), "")?;
    fs::create_dir_all(&untar_dir).map_err(|err| BuildError::io(err, &untar_dir))?;
    let exec = Exec::new([
        "tar".to_string(),
        "xf".to_string(),
        tgz.to_string_lossy().into_owned(),
        "-C".to_string(),
        untar_dir.to_string_lossy().into_owned(),
    ]);
    ecxt.launch(&exec).await?;

    // a release tarball unpacks to a single top-level directory
    let mut entries = fs::read_dir(&untar_dir)
        .map_err(|err| BuildError::io(err, &untar_dir))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect::<Vec<_>>();
    match (entries.pop(), entries.is_empty()) {
        (Some(dir), true) if dir.is_dir() => Ok(dir),
        _ => Err(BuildError::config(format!(
            "Unexpected tarball layout in {}",
            tgz.display()
        ))),
    }
}

fn split_words(value: &str) -> Vec<String> {
    value.split_whitespace().map(str::to_string).collect()
}

fn read_nul_list(path: &Path) -> Result<Vec<String>> {
    let bytes = fs::read(path).map_err(|err| BuildError::io(err, path))?;
    Ok(String::from_utf8_lossy(&bytes)
        .split('\0')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect())
}

fn read_nul_env(path: &Path) -> Result<BTreeMap<String, String>> {
    let entries = read_nul_list(path)?;
    Ok(entries
        .into_iter()
        .filter_map(|entry| {
            entry.split_once('=').map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect())
}

/// Reduce a captured cross-configure environment to its delta against the
/// ambient environment. Compiler- and MPI-selection variables are always
/// kept, as is anything `CROSS_`-prefixed.
fn cross_env_delta(
    mut captured: BTreeMap<String, String>,
    ambient: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    captured.retain(|key, value| {
        if CROSS_ENV_KEEP.contains(&key.as_str()) || key.starts_with("CROSS_") {
            return true;
        }
        ambient.get(key).map(String::as_str) != Some(value.as_str())
    });
    captured
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn env_delta_keeps_changes_and_canned_names() {
        let ambient: BTreeMap<String, String> = [
            ("PATH".to_string(), "/usr/bin".to_string()),
            ("HOME".to_string(), "/home/u".to_string()),
            ("CC".to_string(), "gcc".to_string()),
        ]
        .into();
        let captured: BTreeMap<String, String> = [
            ("PATH".to_string(), "/usr/bin".to_string()),     // unchanged, dropped
            ("HOME".to_string(), "/tmp".to_string()),         // changed, kept
            ("CC".to_string(), "gcc".to_string()),            // canned, kept
            ("CROSS_SIZEOF_INT".to_string(), "4".to_string()), // CROSS_, kept
        ]
        .into();
        let delta = cross_env_delta(captured, &ambient);
        assert_eq!(
            delta.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["CC", "CROSS_SIZEOF_INT", "HOME"]
        );
    }

    #[test]
    fn nul_lists_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let f = tmp.path().join("argv");
        std::fs::write(&f, b"--enable-x\0CC=cc\0").unwrap();
        assert_eq!(read_nul_list(&f).unwrap(), vec!["--enable-x", "CC=cc"]);
    }

    #[test]
    fn default_gasnet_value_is_a_url() {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(DEFAULT_GASNET_URL_B64)
            .unwrap();
        let value = String::from_utf8(bytes).unwrap();
        let url = url::Url::parse(&value).unwrap();
        assert!(url.host().is_some());
        assert!(value.ends_with(".tar.gz"));
    }
}
