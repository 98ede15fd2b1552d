use std::{
    io,
    path::{Path, PathBuf},
    process::ExitStatus,
    sync::Arc,
};

pub type Result<T, E = BuildError> = std::result::Result<T, E>;

/// Various error types for the build engine.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// Invalid environment or project configuration. Never retried.
    #[error("Configuration error: {0}")]
    Config(String),
    /// Two library records (or linkers, or install targets) disagree.
    #[error("{0}")]
    Conflict(String),
    /// An external compiler, linker, archiver, configure or make failed.
    #[error("command failed ({status}): {cmd}\n{stderr}")]
    Process { cmd: String, status: ExitStatus, stderr: String },
    /// An install run would overwrite files that already exist.
    #[error("Installation aborted because it would clobber files in \"{}\"", .0.display())]
    Clobber(PathBuf),
    #[error(transparent)]
    Io(#[from] BuildIoError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Message(String),
    /// A failure first raised by another task of the same build run.
    ///
    /// Sub-rule results are shared between all requesters, so every waiter
    /// observes the originating error through this variant.
    #[error("{0}")]
    Shared(Arc<BuildError>),
}

impl BuildError {
    pub fn io(err: io::Error, path: impl Into<PathBuf>) -> Self {
        BuildIoError::new(err, path).into()
    }

    pub fn config(msg: impl std::fmt::Display) -> Self {
        BuildError::Config(msg.to_string())
    }

    pub fn conflict(msg: impl std::fmt::Display) -> Self {
        BuildError::Conflict(msg.to_string())
    }

    pub fn msg(msg: impl std::fmt::Display) -> Self {
        BuildError::Message(msg.to_string())
    }

    /// Create an error from a failed child process, surfacing its stderr
    /// verbatim (falling back to stdout when stderr is empty).
    pub(crate) fn process(cmd: &[String], output: &std::process::Output) -> Self {
        let mut msg = String::from_utf8_lossy(&output.stderr);
        let mut trimmed = msg.trim();
        if trimmed.is_empty() {
            msg = String::from_utf8_lossy(&output.stdout);
            trimmed = msg.trim();
            if trimmed.is_empty() {
                trimmed = "<empty output>";
            }
        }
        BuildError::Process { cmd: cmd.join(" "), status: output.status, stderr: trimmed.into() }
    }
}

/// A wrapper around an `io::Error` that remembers the path it occurred on.
#[derive(Debug, thiserror::Error)]
#[error("\"{}\": {source}", .path.display())]
pub struct BuildIoError {
    #[source]
    source: io::Error,
    path: PathBuf,
}

impl BuildIoError {
    pub fn new(source: io::Error, path: impl Into<PathBuf>) -> Self {
        Self { source, path: path.into() }
    }

    /// The path the io error occurred on.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn inner(&self) -> &io::Error {
        &self.source
    }
}

impl From<BuildIoError> for io::Error {
    fn from(err: BuildIoError) -> Self {
        err.source
    }
}
