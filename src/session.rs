//! Cooperative evaluation of the rule graph.
//!
//! One [`Session`] is one build run. Rule invocations are independently
//! schedulable tasks multiplexed over a single control thread; a task
//! suspends when it requests a not-yet-ready sub-rule result or waits on an
//! external process. Invocations are deduplicated by rule identity: a second
//! request joins the first task's completion instead of re-running it, which
//! is the engine's primary consistency rule. Parallelism is confined to the
//! external child processes, capped by a semaphore.

use crate::{
    error::{BuildError, Result},
    hash::ContentHash,
    memo::{MemoDb, MemoEntry},
    rule::{DepRecord, FileDep, RuleId},
    Project,
};
use futures::{
    future::{LocalBoxFuture, Shared},
    FutureExt,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    cell::RefCell,
    collections::{BTreeMap, HashMap},
    future::Future,
    path::{Path, PathBuf},
    process::{Output, Stdio},
    rc::Rc,
    sync::Arc,
};

type TaskResult = Result<serde_json::Value, Arc<BuildError>>;
type TaskFuture = Shared<LocalBoxFuture<'static, TaskResult>>;

/// One build run: the per-run task table, the open memo store and the
/// subprocess concurrency cap.
pub struct Session {
    inner: Rc<SessionInner>,
}

pub(crate) struct SessionInner {
    pub(crate) project: Project,
    pub(crate) db: RefCell<MemoDb>,
    tasks: RefCell<HashMap<RuleId, TaskFuture>>,
    procs: tokio::sync::Semaphore,
}

impl Session {
    /// Opens the project's memo store and prepares an empty task table.
    pub fn new(project: &Project) -> Result<Self> {
        let db = MemoDb::open(project.cache_dir())?;
        Ok(Self {
            inner: Rc::new(SessionInner {
                project: project.clone(),
                db: RefCell::new(db),
                tasks: RefCell::new(HashMap::new()),
                procs: tokio::sync::Semaphore::new(project.jobs().max(1)),
            }),
        })
    }

    /// A fresh root context; its dependency record is discarded.
    pub fn ctx(&self) -> Ctx {
        Ctx { session: self.inner.clone(), deps: Rc::new(RefCell::new(DepRecord::default())) }
    }
}

impl SessionInner {
    /// Spawn an external command, counted against the job cap.
    ///
    /// Nonzero exit is an error carrying the command line and its stderr
    /// verbatim. Stdout is captured and returned.
    pub(crate) async fn launch(&self, exec: &Exec) -> Result<Output> {
        let Some((prog, rest)) = exec.argv.split_first() else {
            return Err(BuildError::config("Empty command line."));
        };
        let _permit = self
            .procs
            .acquire()
            .await
            .map_err(|_| BuildError::msg("process limiter closed"))?;

        let mut cmd = tokio::process::Command::new(prog);
        cmd.args(rest).stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());
        if let Some(cwd) = &exec.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &exec.env {
            cmd.env(key, value);
        }

        debug!(cmd = %exec.argv.join(" "), "spawning");
        let mut child = cmd.spawn().map_err(|err| BuildError::io(err, prog))?;
        let stdin = child.stdin.take();
        if let Some(bytes) = &exec.stdin {
            use tokio::io::AsyncWriteExt;
            if let Some(mut stdin) = stdin {
                stdin.write_all(bytes).await.map_err(|err| BuildError::io(err, prog))?;
                stdin.flush().await.map_err(|err| BuildError::io(err, prog))?;
            }
        }
        let output = child.wait_with_output().await.map_err(|err| BuildError::io(err, prog))?;
        trace!(status = ?output.status, "child exited");
        if !output.status.success() {
            return Err(BuildError::process(&exec.argv, &output));
        }
        Ok(output)
    }
}

/// Builder for one external process invocation.
#[derive(Clone, Debug, Default)]
pub struct Exec {
    argv: Vec<String>,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
    stdin: Option<Vec<u8>>,
}

impl Exec {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { argv: argv.into_iter().map(Into::into).collect(), ..Default::default() }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env.extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn stdin(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(bytes.into());
        self
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }
}

/// The handle a rule body receives: sub-rule requests, dependency recording
/// and subprocess launches all go through here.
#[derive(Clone)]
pub struct Ctx {
    pub(crate) session: Rc<SessionInner>,
    pub(crate) deps: Rc<RefCell<DepRecord>>,
}

impl Ctx {
    pub fn project(&self) -> &Project {
        &self.session.project
    }

    /// Record a file dependency, hashing its current contents (absence is
    /// itself an observation).
    pub fn depend_file(&self, path: impl Into<PathBuf>) -> Result<()> {
        self.deps.borrow_mut().push_file(path.into())
    }

    pub fn depend_files<I, P>(&self, paths: I) -> Result<()>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        for path in paths {
            self.depend_file(path)?;
        }
        Ok(())
    }

    /// Record an ambient `(key, value)` input.
    pub fn depend_fact(&self, key: impl Into<String>, value: &impl Serialize) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.deps.borrow_mut().push_fact(key, value);
        Ok(())
    }

    /// Read an environment variable from the session snapshot, recording it
    /// as a fact dependency.
    pub fn env(&self, name: &str) -> Result<Option<String>> {
        let value = self.session.project.env_var(name).map(str::to_string);
        self.depend_fact(name, &value)?;
        Ok(value)
    }

    /// [`Ctx::env`] with a default for the unset case.
    pub fn env_or(&self, name: &str, default: &str) -> Result<String> {
        Ok(self.env(name)?.unwrap_or_else(|| default.to_string()))
    }

    /// Environment variable normalized to an integer before being recorded,
    /// so `"2"` and `2` digest identically across runs.
    pub fn env_int(&self, name: &str, default: i64) -> Result<i64> {
        let value = match self.session.project.env_var(name) {
            None => default,
            Some(raw) => raw.trim().parse::<i64>().map_err(|_| {
                BuildError::config(format!("{name} must be an integer, got \"{raw}\""))
            })?,
        };
        self.depend_fact(name, &value)?;
        Ok(value)
    }

    /// A 0/1 environment flag, default off.
    pub fn env_flag(&self, name: &str) -> Result<bool> {
        Ok(self.env_int(name, 0)? != 0)
    }

    /// Launch an external process, counted against the session's job cap.
    /// Nonzero exit is an error carrying the command and its stderr verbatim.
    pub async fn launch(&self, exec: &Exec) -> Result<Output> {
        self.session.launch(exec).await
    }

    /// Request a rule's result, deduplicated by identity for this run.
    async fn invoke(
        &self,
        id: RuleId,
        make: impl FnOnce(Ctx) -> LocalBoxFuture<'static, Result<serde_json::Value>>,
    ) -> Result<serde_json::Value> {
        let fut = {
            let mut tasks = self.session.tasks.borrow_mut();
            if let Some(existing) = tasks.get(&id) {
                trace!(rule = %id, "joining running task");
                existing.clone()
            } else {
                let cxt = Ctx {
                    session: self.session.clone(),
                    deps: Rc::new(RefCell::new(DepRecord::default())),
                };
                let fut = make(cxt).map(|res| res.map_err(Arc::new)).boxed_local().shared();
                tasks.insert(id.clone(), fut.clone());
                fut
            }
        };
        match fut.await {
            Ok(value) => {
                self.deps.borrow_mut().push_rule(id, ContentHash::of_value(&value));
                Ok(value)
            }
            Err(err) => Err(BuildError::Shared(err)),
        }
    }

    /// A transient rule: evaluated at most once per run, never persisted.
    pub async fn transient<T, F, Fut>(&self, name: &str, args: Vec<String>, body: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Ctx) -> Fut + 'static,
        Fut: Future<Output = Result<T>> + 'static,
    {
        let value = self
            .invoke(RuleId::new(name, args), move |cxt| {
                async move {
                    let fact = body(cxt).await?;
                    Ok(serde_json::to_value(fact)?)
                }
                .boxed_local()
            })
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// A memoized rule, split into a dependency probe and an execute phase.
    ///
    /// The probe records everything needed to decide whether a cached result
    /// is still valid and returns the intermediate state execution would
    /// need. If the probe's dependency digest hits the memo store the
    /// execute phase is elided entirely; otherwise it runs, and its result,
    /// artifacts and execute-phase file observations are persisted.
    pub async fn memoized<I, T, P, PF, X, XF>(
        &self,
        name: &str,
        args: Vec<String>,
        probe: P,
        execute: X,
    ) -> Result<T>
    where
        I: 'static,
        T: Serialize + DeserializeOwned,
        P: FnOnce(Ctx) -> PF + 'static,
        PF: Future<Output = Result<I>> + 'static,
        X: FnOnce(ExecCtx, I) -> XF + 'static,
        XF: Future<Output = Result<T>> + 'static,
    {
        let id = RuleId::new(name, args);
        let rule = id.clone();
        let value = self
            .invoke(id, move |cxt| {
                async move {
                    let session = cxt.session.clone();
                    let input = probe(cxt.clone()).await?;
                    let digest = cxt.deps.borrow().digest();

                    let hit = session.db.borrow().lookup(&rule, &digest);
                    if let Some(entry) = hit {
                        debug!(rule = %rule, "memo hit, execute elided");
                        return Ok(entry.result);
                    }

                    debug!(rule = %rule, "memo miss, executing");
                    let ecxt = ExecCtx::new(session.clone(), rule.clone(), digest.clone());
                    let fact = execute(ecxt.clone(), input).await?;
                    let result = serde_json::to_value(&fact)?;
                    let entry = MemoEntry {
                        digest,
                        result: result.clone(),
                        artifacts: ecxt.take_artifacts(),
                        post_deps: ecxt.take_post_deps(),
                    };
                    session.db.borrow_mut().store(&rule, entry)?;
                    Ok(result)
                }
                .boxed_local()
            })
            .await?;
        Ok(serde_json::from_value(value)?)
    }
}

/// The handle an execute phase receives: artifact allocation, execute-phase
/// file observations and subprocess launches.
#[derive(Clone)]
pub struct ExecCtx {
    inner: Rc<ExecInner>,
}

struct ExecInner {
    session: Rc<SessionInner>,
    id: RuleId,
    digest: ContentHash,
    post_deps: RefCell<Vec<FileDep>>,
    artifacts: RefCell<Vec<PathBuf>>,
}

impl ExecCtx {
    fn new(session: Rc<SessionInner>, id: RuleId, digest: ContentHash) -> Self {
        Self {
            inner: Rc::new(ExecInner {
                session,
                id,
                digest,
                post_deps: RefCell::new(Vec::new()),
                artifacts: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn project(&self) -> &Project {
        &self.inner.session.project
    }

    /// Record a file first observed during execution (revalidated in this
    /// order on later lookups).
    pub fn depend_file(&self, path: impl Into<PathBuf>) -> Result<()> {
        let dep = FileDep::observe(path.into())?;
        self.inner.post_deps.borrow_mut().push(dep);
        Ok(())
    }

    pub fn depend_files<I, P>(&self, paths: I) -> Result<()>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        for path in paths {
            self.depend_file(path)?;
        }
        Ok(())
    }

    /// A fresh artifact path owned by this rule instance until commit.
    pub fn mkpath(&self, key: Option<&str>, suffix: &str) -> Result<PathBuf> {
        let path = self.inner.session.db.borrow().mkpath(
            &self.inner.id,
            &self.inner.digest,
            key,
            suffix,
        )?;
        self.inner.artifacts.borrow_mut().push(path.clone());
        Ok(path)
    }

    /// A kept temp file under the store, not tracked as an artifact.
    pub fn mktemp(&self) -> Result<PathBuf> {
        self.inner.session.db.borrow().mktemp()
    }

    /// A symlink-tree artifact.
    pub fn mktree(&self, entries: &BTreeMap<String, PathBuf>) -> Result<PathBuf> {
        let path =
            self.inner.session.db.borrow().mktree(&self.inner.id, &self.inner.digest, entries)?;
        self.inner.artifacts.borrow_mut().push(path.clone());
        Ok(path)
    }

    /// Whether `path` lies inside the artifact store.
    pub fn in_artifact_store(&self, path: &Path) -> bool {
        crate::memo::in_artifact_store(path, self.project().cache_dir())
    }

    pub async fn launch(&self, exec: &Exec) -> Result<Output> {
        self.inner.session.launch(exec).await
    }

    fn take_artifacts(&self) -> Vec<PathBuf> {
        self.inner.artifacts.borrow_mut().drain(..).collect()
    }

    fn take_post_deps(&self) -> Vec<FileDep> {
        self.inner.post_deps.borrow_mut().drain(..).collect()
    }
}
