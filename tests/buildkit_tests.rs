//! Driver tests against an in-memory fake solver: operation plumbing,
//! worker selection, exports, prune tallying, and error decoration.

mod support;

use chrono::Utc;
use std::sync::Arc;
use support::{exec_ops, fake_digest, FakeSolver, SharedSolver};
use thunkrun::path::{CommandPath, FileOrDirPath};
use thunkrun::platform::Platform;
use thunkrun::runtime::PruneOpts;
use thunkrun::solver::{Entitlement, UsageInfo, WorkerInfo};
use thunkrun::status::NullRecorder;
use thunkrun::thunk::{ImageRef, MountSource, Thunk, ThunkCmd, ThunkImage, ThunkPath};
use thunkrun::value::{Secret, Value};
use thunkrun::{BuildkitConfig, BuildkitRuntime, Runtime, OUTPUT_ENV};

/// Builds a runtime around the given fake, with shims for amd64 and
/// arm64 staged in a temp dir.
async fn runtime_with(solver: Arc<FakeSolver>) -> (BuildkitRuntime, tempfile::TempDir) {
    let shim_dir = tempfile::tempdir().unwrap();
    std::fs::write(shim_dir.path().join("exe.amd64"), b"elf-amd64").unwrap();
    std::fs::write(shim_dir.path().join("exe.arm64"), b"elf-arm64").unwrap();

    let runtime = BuildkitRuntime::with_client(
        Arc::new(SharedSolver(solver)),
        Arc::new(NullRecorder),
        BuildkitConfig {
            disable_cache: false,
            shim_dir: Some(shim_dir.path().to_path_buf()),
        },
    )
    .await
    .unwrap();

    (runtime, shim_dir)
}

fn echo_thunk(args: &[&str]) -> Thunk {
    Thunk::new(ThunkCmd::Command(CommandPath::new("echo").unwrap()))
        .with_image(ThunkImage::Ref(
            ImageRef::from_repository(Platform::linux(), "alpine").with_tag("3.19"),
        ))
        .with_args(args.iter().map(|a| Value::from(*a)))
}

#[tokio::test]
async fn no_workers_fails_construction() {
    let solver = Arc::new(FakeSolver::default());
    let result = BuildkitRuntime::with_client(
        Arc::new(SharedSolver(solver)),
        Arc::new(NullRecorder),
        BuildkitConfig::default(),
    )
    .await;

    assert!(matches!(result, Err(thunkrun::Error::NoWorkers)));
}

#[tokio::test]
async fn run_without_writer_solves_without_export() {
    let solver = Arc::new(FakeSolver::single_worker("linux", "amd64"));
    let (runtime, _shims) = runtime_with(solver.clone()).await;

    runtime.run(&echo_thunk(&["hi"]), None).await.unwrap();

    let solves = solver.solves.lock().unwrap();
    assert_eq!(solves.len(), 1);
    assert_eq!(solves[0].export, "none");

    // No capture requested, so the shim env stays clean.
    let def = &solves[0].def;
    assert!(!exec_ops(def).iter().any(|e| {
        e["env"]
            .as_array()
            .unwrap()
            .iter()
            .any(|p| p[0] == OUTPUT_ENV)
    }));
}

#[tokio::test]
async fn run_with_writer_captures_stdout() {
    let mut solver = FakeSolver::single_worker("linux", "amd64");
    solver.local_files.insert("out".to_string(), b"hi\n".to_vec());
    let solver = Arc::new(solver);

    let (runtime, _shims) = runtime_with(solver.clone()).await;

    let mut stdout = Vec::new();
    runtime
        .run(&echo_thunk(&["hi"]), Some(&mut stdout))
        .await
        .unwrap();
    assert_eq!(stdout, b"hi\n");

    let solves = solver.solves.lock().unwrap();
    assert_eq!(solves[0].export, "local");
}

#[tokio::test]
async fn cache_key_is_stable_across_invocations() {
    let mut solver = FakeSolver::single_worker("linux", "amd64");
    solver.local_files.insert("out".to_string(), b"hi\n".to_vec());
    let solver = Arc::new(solver);

    let (runtime, _shims) = runtime_with(solver.clone()).await;

    let mut first = Vec::new();
    runtime
        .run(&echo_thunk(&["hi"]), Some(&mut first))
        .await
        .unwrap();
    let mut second = Vec::new();
    runtime
        .run(&echo_thunk(&["hi"]), Some(&mut second))
        .await
        .unwrap();

    let solves = solver.solves.lock().unwrap();
    assert_eq!(solves.len(), 2);
    assert_eq!(solves[0].def.root, solves[1].def.root);
}

#[tokio::test]
async fn export_streams_an_oci_archive() {
    let mut solver = FakeSolver::single_worker("linux", "amd64");
    solver.archive = b"oci-archive-bytes".to_vec();
    let solver = Arc::new(solver);

    let (runtime, _shims) = runtime_with(solver.clone()).await;

    let mut archive = Vec::new();
    runtime.export(&echo_thunk(&[]), &mut archive).await.unwrap();
    assert_eq!(archive, b"oci-archive-bytes");

    assert_eq!(solver.solves.lock().unwrap()[0].export, "oci");
}

#[tokio::test]
async fn export_path_copies_and_streams_a_tar() {
    let mut solver = FakeSolver::single_worker("linux", "amd64");
    solver.archive = b"tar-bytes".to_vec();
    let solver = Arc::new(solver);

    let (runtime, _shims) = runtime_with(solver.clone()).await;

    let tp = ThunkPath::new(echo_thunk(&[]), FileOrDirPath::dir("out").unwrap()).unwrap();

    let mut tar = Vec::new();
    runtime.export_path(&tp, &mut tar).await.unwrap();
    assert_eq!(tar, b"tar-bytes");

    let solves = solver.solves.lock().unwrap();
    assert_eq!(solves[0].export, "tar");

    // The solved root is a copy out of the workdir mount, contents
    // only, since the path is a directory.
    let root = support::root_op(&solves[0].def);
    let copy = &root["file"]["actions"][0]["copy"];
    assert_eq!(copy["src"], "out");
    assert_eq!(copy["dest"], ".");
    assert_eq!(copy["dir_contents_only"], true);
}

#[tokio::test]
async fn thunk_platform_selects_a_matching_worker() {
    let mut solver = FakeSolver::default();
    solver.workers = vec![
        WorkerInfo {
            id: "w0".to_string(),
            platform: Platform::new("linux", "amd64"),
        },
        WorkerInfo {
            id: "w1".to_string(),
            platform: Platform::new("linux", "arm64"),
        },
    ];
    let solver = Arc::new(solver);

    let (runtime, _shims) = runtime_with(solver.clone()).await;

    let thunk = Thunk::new(ThunkCmd::Command(CommandPath::new("uname").unwrap())).with_image(
        ThunkImage::Ref(ImageRef::from_repository(
            Platform::new("linux", "arm64"),
            "alpine",
        )),
    );

    runtime.run(&thunk, None).await.unwrap();

    // The arm64 shim was selected for the arm64 worker.
    let solves = solver.solves.lock().unwrap();
    let rendered = serde_json::to_string(&solves[0].def).unwrap();
    assert!(rendered.contains(&base64_of(b"elf-arm64")));
    assert!(!rendered.contains(&base64_of(b"elf-amd64")));
}

fn base64_of(bytes: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

#[tokio::test]
async fn unmatched_platform_is_an_error() {
    let solver = Arc::new(FakeSolver::single_worker("linux", "amd64"));
    let (runtime, _shims) = runtime_with(solver).await;

    let thunk = Thunk::new(ThunkCmd::Command(CommandPath::new("uname").unwrap())).with_image(
        ThunkImage::Ref(ImageRef::from_repository(
            Platform::new("linux", "s390x"),
            "alpine",
        )),
    );

    assert!(matches!(
        runtime.run(&thunk, None).await,
        Err(thunkrun::Error::NoWorkerForPlatform { .. })
    ));
}

#[tokio::test]
async fn secrets_and_entitlements_reach_the_solve() {
    let solver = Arc::new(FakeSolver::single_worker("linux", "amd64"));
    let (runtime, _shims) = runtime_with(solver.clone()).await;

    let thunk = echo_thunk(&[])
        .with_mount(
            MountSource::Secret(Secret::new("tok", b"xyz".to_vec())),
            FileOrDirPath::file("/run/secrets/tok").unwrap(),
        )
        .with_insecure(true);

    runtime.run(&thunk, None).await.unwrap();

    let solves = solver.solves.lock().unwrap();
    assert_eq!(
        solves[0].secrets.get("tok").map(Vec::as_slice),
        Some(b"xyz".as_slice())
    );
    assert_eq!(solves[0].entitlements, vec![Entitlement::SecurityInsecure]);
}

#[tokio::test]
async fn resolve_pins_a_normalized_digest() {
    let solver = Arc::new(FakeSolver::single_worker("linux", "amd64"));
    let (runtime, _shims) = runtime_with(solver.clone()).await;

    let image = ImageRef::from_repository(Platform::linux(), "ubuntu");
    let resolved = runtime.resolve(image).await.unwrap();

    // Shorthand normalizes to the fully-qualified reference before the
    // gateway sees it.
    let sessions = solver.sessions.lock().unwrap();
    let asked: Vec<String> = sessions
        .iter()
        .flat_map(|s| s.resolved.lock().unwrap().clone())
        .collect();
    assert_eq!(asked, ["docker.io/library/ubuntu:latest".to_string()]);

    assert_eq!(
        resolved.digest.as_deref(),
        Some(fake_digest("docker.io/library/ubuntu:latest").as_str())
    );
}

#[tokio::test]
async fn resolve_rejects_archive_refs() {
    let solver = Arc::new(FakeSolver::single_worker("linux", "amd64"));
    let (runtime, _shims) = runtime_with(solver).await;

    let tp = ThunkPath::new(echo_thunk(&[]), FileOrDirPath::file("image.tar").unwrap()).unwrap();
    let image = ImageRef::from_archive(Platform::linux(), tp);

    assert!(matches!(
        runtime.resolve(image).await,
        Err(thunkrun::Error::NoRepository)
    ));
}

#[tokio::test]
async fn prune_streams_rows_and_tallies_a_total() {
    let mut solver = FakeSolver::single_worker("linux", "amd64");
    solver.usage = vec![
        UsageInfo {
            id: "layer-a".to_string(),
            size: 1_500,
            usage_count: 3,
            last_used_at: Some(Utc::now()),
            description: "pulled layer".to_string(),
        },
        UsageInfo {
            id: "layer-b".to_string(),
            size: 500,
            ..Default::default()
        },
    ];
    let solver = Arc::new(solver);

    let (runtime, _shims) = runtime_with(solver).await;

    let mut out = Vec::new();
    runtime.prune(&mut out, PruneOpts::default()).await.unwrap();

    let rendered = String::from_utf8(out).unwrap();
    assert!(rendered.contains("pruned layer-a"));
    assert!(rendered.contains("uses: 3"));
    assert!(rendered.contains("pruned layer-b"));
    assert!(rendered.contains("total: 2.00kB"));
}

#[tokio::test]
async fn prune_flushes_the_total_even_on_error() {
    let mut solver = FakeSolver::single_worker("linux", "amd64");
    solver.usage = vec![UsageInfo {
        id: "layer-a".to_string(),
        size: 2_000,
        ..Default::default()
    }];
    solver.fail_message = Some("prune interrupted".to_string());
    let solver = Arc::new(solver);

    let (runtime, _shims) = runtime_with(solver).await;

    let mut out = Vec::new();
    let err = runtime
        .prune(&mut out, PruneOpts::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("prune interrupted"));

    let rendered = String::from_utf8(out).unwrap();
    assert!(rendered.contains("pruned layer-a"));
    assert!(rendered.contains("total: 2.00kB"));
}

#[tokio::test]
async fn failed_solves_carry_the_last_logs() {
    let mut solver = FakeSolver::single_worker("linux", "amd64");
    solver.fail_message = Some("process exited 2".to_string());
    solver.fail_status = vec![FakeSolver::failure_status(
        "echo hi",
        "exit status 2",
        "sh: echo: not found",
    )];
    let solver = Arc::new(solver);

    let (runtime, _shims) = runtime_with(solver).await;

    let err = runtime.run(&echo_thunk(&["hi"]), None).await.unwrap_err();
    let rendered = err.to_string();
    assert!(rendered.contains("build failed"));
    assert!(rendered.contains("echo hi: exit status 2"));
    assert!(rendered.contains("sh: echo: not found"));
}
