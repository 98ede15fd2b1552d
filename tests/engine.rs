//! Engine-level laws: memoization, invalidation, deduplication and failure
//! propagation, exercised with synthetic rules on a throwaway project.

use std::{
    cell::Cell,
    fs,
    path::{Path, PathBuf},
    rc::Rc,
};
use upcxx_build::{Project, Session};

fn project_at(root: &Path) -> Project {
    fs::create_dir_all(root.join("src")).unwrap();
    Project::new(root).unwrap().set_env([("OPTLEV", "0")]).set_jobs(2)
}

/// A memoized rule that depends on one file and "compiles" it by measuring
/// its length; `runs` counts execute-phase invocations.
async fn length_rule(project: &Project, runs: Rc<Cell<u32>>, input: PathBuf) -> usize {
    let session = Session::new(project).unwrap();
    let cxt = session.ctx();
    cxt.memoized(
        "length",
        vec![],
        move |cxt| async move {
            cxt.depend_file(&input)?;
            Ok(input)
        },
        move |_ecxt, input: PathBuf| async move {
            runs.set(runs.get() + 1);
            Ok(fs::read_to_string(&input).map(|s| s.len()).unwrap_or(0))
        },
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn memo_hit_elides_execute() {
    let tmp = tempfile::tempdir().unwrap();
    let project = project_at(tmp.path());
    let input = tmp.path().join("input.txt");
    fs::write(&input, "one").unwrap();
    let runs = Rc::new(Cell::new(0));

    assert_eq!(length_rule(&project, runs.clone(), input.clone()).await, 3);
    assert_eq!(runs.get(), 1);

    // unchanged inputs: a second build re-runs the probe only
    assert_eq!(length_rule(&project, runs.clone(), input.clone()).await, 3);
    assert_eq!(runs.get(), 1);
}

#[tokio::test]
async fn file_perturbation_invalidates() {
    let tmp = tempfile::tempdir().unwrap();
    let project = project_at(tmp.path());
    let input = tmp.path().join("input.txt");
    fs::write(&input, "one").unwrap();
    let runs = Rc::new(Cell::new(0));

    assert_eq!(length_rule(&project, runs.clone(), input.clone()).await, 3);
    fs::write(&input, "three").unwrap();
    assert_eq!(length_rule(&project, runs.clone(), input.clone()).await, 5);
    assert_eq!(runs.get(), 2);

    // and back to cached behavior on a third run
    assert_eq!(length_rule(&project, runs.clone(), input.clone()).await, 5);
    assert_eq!(runs.get(), 2);
}

async fn env_rule(project: &Project, runs: Rc<Cell<u32>>) -> String {
    let session = Session::new(project).unwrap();
    let cxt = session.ctx();
    cxt.memoized(
        "knob",
        vec![],
        move |cxt| async move { cxt.env_or("KNOB", "unset") },
        move |_ecxt, knob: String| async move {
            runs.set(runs.get() + 1);
            Ok(knob)
        },
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn fact_change_invalidates() {
    let tmp = tempfile::tempdir().unwrap();
    let runs = Rc::new(Cell::new(0));

    let project = project_at(tmp.path()).env_override("KNOB", "a");
    assert_eq!(env_rule(&project, runs.clone()).await, "a");
    assert_eq!(env_rule(&project, runs.clone()).await, "a");
    assert_eq!(runs.get(), 1);

    let project = project_at(tmp.path()).env_override("KNOB", "b");
    assert_eq!(env_rule(&project, runs.clone()).await, "b");
    assert_eq!(runs.get(), 2);

    // the old fact value still has its entry
    let project = project_at(tmp.path()).env_override("KNOB", "a");
    assert_eq!(env_rule(&project, runs.clone()).await, "a");
    assert_eq!(runs.get(), 2);
}

#[tokio::test]
async fn concurrent_invocations_deduplicate() {
    let tmp = tempfile::tempdir().unwrap();
    let project = project_at(tmp.path());
    let session = Session::new(&project).unwrap();
    let cxt = session.ctx();
    let runs = Rc::new(Cell::new(0));

    let call = |cxt: upcxx_build::Ctx, runs: Rc<Cell<u32>>| async move {
        cxt.transient("ticket", vec![], move |_cxt| async move {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            runs.set(runs.get() + 1);
            Ok(runs.get())
        })
        .await
        .unwrap()
    };

    let (a, b) =
        futures::future::join(call(cxt.clone(), runs.clone()), call(cxt.clone(), runs.clone()))
            .await;
    let c = call(cxt.clone(), runs.clone()).await;
    assert_eq!(runs.get(), 1);
    assert_eq!((a, b, c), (1, 1, 1));
}

#[tokio::test]
async fn transient_results_are_not_persisted() {
    let tmp = tempfile::tempdir().unwrap();
    let project = project_at(tmp.path());
    let runs = Rc::new(Cell::new(0u32));

    for _ in 0..2 {
        let session = Session::new(&project).unwrap();
        let cxt = session.ctx();
        let runs = runs.clone();
        let n: u32 = cxt
            .transient("count", vec![], move |_cxt| async move {
                runs.set(runs.get() + 1);
                Ok(runs.get())
            })
            .await
            .unwrap();
        assert!(n >= 1);
    }
    assert_eq!(runs.get(), 2);
}

#[tokio::test]
async fn failure_is_shared_by_all_waiters() {
    let tmp = tempfile::tempdir().unwrap();
    let project = project_at(tmp.path());
    let session = Session::new(&project).unwrap();
    let cxt = session.ctx();
    let runs = Rc::new(Cell::new(0));

    let call = |cxt: upcxx_build::Ctx, runs: Rc<Cell<u32>>| async move {
        cxt.transient("doomed", vec![], move |_cxt| async move {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            runs.set(runs.get() + 1);
            Err::<u32, _>(upcxx_build::BuildError::msg("boom"))
        })
        .await
    };

    let (a, b) =
        futures::future::join(call(cxt.clone(), runs.clone()), call(cxt.clone(), runs.clone()))
            .await;
    assert_eq!(runs.get(), 1);
    assert_eq!(a.unwrap_err().to_string(), "boom");
    assert_eq!(b.unwrap_err().to_string(), "boom");

    // a dependent rule aborts with the same failure
    let outer: Result<u32, _> = cxt
        .transient("dependent", vec![], |cxt| async move {
            cxt.transient("doomed", vec![], |_cxt| async move { Ok(99) }).await
        })
        .await;
    assert_eq!(outer.unwrap_err().to_string(), "boom");
}

#[tokio::test]
async fn requires_predicates_respect_config_and_env() {
    let tmp = tempfile::tempdir().unwrap();
    let root = upcxx_build::utils::canonicalized(tmp.path());
    let src = root.join("src").join("backend.cpp");

    let project = project_at(tmp.path()).add_gasnet_source_dir(root.join("src"));
    let session = Session::new(&project).unwrap();
    let cxt = session.ctx();
    assert!(cxt.requires_gasnet(&src).unwrap());
    assert!(!cxt.requires_upcxx_backend(&src).unwrap());
    assert!(!cxt.requires_gasnet(&tmp.path().join("elsewhere.cpp")).unwrap());

    let project = project_at(tmp.path()).env_override("REQUIRES_UPCXX_BACKEND", "1");
    let session = Session::new(&project).unwrap();
    assert!(session.ctx().requires_upcxx_backend(&src).unwrap());
}

#[tokio::test]
async fn execute_phase_observations_invalidate() {
    let tmp = tempfile::tempdir().unwrap();
    let project = project_at(tmp.path());
    let runs = Rc::new(Cell::new(0));

    // `manifest` names a second file only discovered during execution, the
    // way a compiler's -MM output names headers
    let manifest = tmp.path().join("manifest.txt");
    let payload = tmp.path().join("payload.txt");
    fs::write(&manifest, "payload.txt").unwrap();
    fs::write(&payload, "v1").unwrap();

    let scan = |project: &Project, runs: Rc<Cell<u32>>| {
        let session = Session::new(project).unwrap();
        let cxt = session.ctx();
        let manifest = manifest.clone();
        let root = tmp.path().to_path_buf();
        async move {
            cxt.memoized(
                "scan",
                vec![],
                move |cxt| async move {
                    cxt.depend_file(&manifest)?;
                    Ok(manifest)
                },
                move |ecxt, manifest: PathBuf| async move {
                    runs.set(runs.get() + 1);
                    let named = root.join(fs::read_to_string(&manifest).unwrap().trim());
                    ecxt.depend_file(&named)?;
                    Ok(fs::read_to_string(&named).unwrap())
                },
            )
            .await
            .unwrap()
        }
    };

    assert_eq!(scan(&project, runs.clone()).await, "v1");
    assert_eq!(scan(&project, runs.clone()).await, "v1");
    assert_eq!(runs.get(), 1);

    // the probe's digest is unchanged; only the execute-phase observation
    // notices the edit
    fs::write(&payload, "v2").unwrap();
    assert_eq!(scan(&project, runs.clone()).await, "v2");
    assert_eq!(runs.get(), 2);
}
