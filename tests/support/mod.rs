//! Shared fakes for driving the execution core without a live solver.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thunkrun::graph::Definition;
use thunkrun::platform::Platform;
use thunkrun::runtime::PruneOpts;
use thunkrun::solver::{
    BuildSession, Entitlement, Export, ResolvedImage, SolveOpts, SolveStatus, SolverClient,
    StatusSender, UsageInfo, Vertex, VertexLog, WorkerInfo,
};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

/// Deterministic digest a fake resolver hands back for a reference.
pub fn fake_digest(reference: &str) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(reference.as_bytes())))
}

// =============================================================================
// Fake Gateway Session
// =============================================================================

/// Records gateway traffic and answers from canned data.
#[derive(Default)]
pub struct FakeSession {
    /// References resolved through this session.
    pub resolved: Mutex<Vec<String>>,

    /// Definitions solved for gateway file reads.
    pub read_defs: Mutex<Vec<Definition>>,

    /// Bytes returned for every `read_file`.
    pub config_json: Vec<u8>,
}

impl FakeSession {
    pub fn with_config(config_json: impl Into<Vec<u8>>) -> Self {
        Self {
            config_json: config_json.into(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl BuildSession for FakeSession {
    async fn resolve_image_config(
        &self,
        reference: &str,
        _platform: &Platform,
    ) -> thunkrun::Result<ResolvedImage> {
        self.resolved.lock().unwrap().push(reference.to_string());
        Ok(ResolvedImage {
            digest: fake_digest(reference),
        })
    }

    async fn read_file(
        &self,
        def: &Definition,
        _path: &str,
        _opts: &SolveOpts,
    ) -> thunkrun::Result<Vec<u8>> {
        self.read_defs.lock().unwrap().push(def.clone());
        Ok(self.config_json.clone())
    }

    async fn close(&self) -> thunkrun::Result<()> {
        Ok(())
    }
}

// =============================================================================
// Fake Solver
// =============================================================================

/// One recorded solve submission.
#[derive(Debug, Clone)]
pub struct RecordedSolve {
    pub def: Definition,
    pub local_dirs: BTreeMap<String, PathBuf>,
    pub entitlements: Vec<Entitlement>,
    pub secrets: BTreeMap<String, Vec<u8>>,
    pub export: &'static str,
}

/// A solver that records submissions and plays back canned results.
#[derive(Default)]
pub struct FakeSolver {
    pub workers: Vec<WorkerInfo>,

    /// Files materialized into the output dir on a local export.
    pub local_files: BTreeMap<String, Vec<u8>>,

    /// Bytes streamed for archive exports.
    pub archive: Vec<u8>,

    /// Usage records streamed by prune.
    pub usage: Vec<UsageInfo>,

    /// Config bytes sessions answer file reads with.
    pub config_json: Vec<u8>,

    /// When set, every solve fails with this message after emitting
    /// `fail_status`.
    pub fail_message: Option<String>,
    pub fail_status: Vec<SolveStatus>,

    pub solves: Mutex<Vec<RecordedSolve>>,
    pub sessions: Mutex<Vec<Arc<FakeSession>>>,
}

impl FakeSolver {
    pub fn single_worker(os: &str, arch: &str) -> Self {
        Self {
            workers: vec![WorkerInfo {
                id: "w0".to_string(),
                platform: Platform::new(os, arch),
            }],
            ..Default::default()
        }
    }

    /// A status batch with one failed vertex and a log line, for
    /// exercising error decoration.
    pub fn failure_status(vertex_name: &str, error: &str, log: &str) -> SolveStatus {
        SolveStatus {
            vertexes: vec![Vertex {
                digest: "sha256:failed".to_string(),
                name: vertex_name.to_string(),
                error: Some(error.to_string()),
                ..Default::default()
            }],
            logs: vec![VertexLog {
                vertex: "sha256:failed".to_string(),
                stream: 2,
                data: format!("{log}\n").into_bytes(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

// A shared wrapper so tests keep a handle while the runtime owns one.
pub struct SharedSolver(pub Arc<FakeSolver>);

#[async_trait]
impl SolverClient for SharedSolver {
    async fn list_workers(&self) -> thunkrun::Result<Vec<WorkerInfo>> {
        Ok(self.0.workers.clone())
    }

    async fn open_session(&self, _status: StatusSender) -> thunkrun::Result<Box<dyn BuildSession>> {
        let session = Arc::new(FakeSession::with_config(self.0.config_json.clone()));
        self.0.sessions.lock().unwrap().push(session.clone());
        Ok(Box::new(SharedSession(session)))
    }

    async fn solve(
        &self,
        def: &Definition,
        opts: &SolveOpts,
        export: Option<Export<'_>>,
        status: StatusSender,
    ) -> thunkrun::Result<()> {
        for batch in &self.0.fail_status {
            let _ = status.send(batch.clone()).await;
        }

        let export_kind = match &export {
            None => "none",
            Some(Export::Local { .. }) => "local",
            Some(Export::OciArchive { .. }) => "oci",
            Some(Export::Tar { .. }) => "tar",
        };

        self.0.solves.lock().unwrap().push(RecordedSolve {
            def: def.clone(),
            local_dirs: opts.local_dirs.clone(),
            entitlements: opts.entitlements.clone(),
            secrets: opts.secrets.clone(),
            export: export_kind,
        });

        if let Some(message) = &self.0.fail_message {
            return Err(thunkrun::Error::Solver {
                message: message.clone(),
            });
        }

        match export {
            None => {}
            Some(Export::Local { output_dir }) => {
                for (name, content) in &self.0.local_files {
                    tokio::fs::write(output_dir.join(name), content).await?;
                }
            }
            Some(Export::OciArchive { writer }) | Some(Export::Tar { writer }) => {
                writer.write_all(&self.0.archive).await?;
                writer.flush().await?;
            }
        }

        Ok(())
    }

    async fn prune(
        &self,
        _opts: &PruneOpts,
        usage: mpsc::Sender<UsageInfo>,
    ) -> thunkrun::Result<()> {
        for record in &self.0.usage {
            if usage.send(record.clone()).await.is_err() {
                break;
            }
        }

        if let Some(message) = &self.0.fail_message {
            return Err(thunkrun::Error::Solver {
                message: message.clone(),
            });
        }

        Ok(())
    }

    async fn close(&self) -> thunkrun::Result<()> {
        Ok(())
    }
}

struct SharedSession(Arc<FakeSession>);

#[async_trait]
impl BuildSession for SharedSession {
    async fn resolve_image_config(
        &self,
        reference: &str,
        platform: &Platform,
    ) -> thunkrun::Result<ResolvedImage> {
        self.0.resolve_image_config(reference, platform).await
    }

    async fn read_file(
        &self,
        def: &Definition,
        path: &str,
        opts: &SolveOpts,
    ) -> thunkrun::Result<Vec<u8>> {
        self.0.read_file(def, path, opts).await
    }

    async fn close(&self) -> thunkrun::Result<()> {
        self.0.close().await
    }
}

// =============================================================================
// Definition Helpers
// =============================================================================

/// The op a definition's root points at.
pub fn root_op(def: &Definition) -> &serde_json::Value {
    &def
        .ops
        .iter()
        .find(|o| o.digest == def.root.digest)
        .expect("root op present")
        .op
}

/// All exec ops in a definition.
pub fn exec_ops(def: &Definition) -> Vec<&serde_json::Value> {
    def.ops.iter().filter_map(|o| o.op.get("exec")).collect()
}

/// The mount on an exec op at the given target, if any.
pub fn mount_at<'a>(exec: &'a serde_json::Value, target: &str) -> Option<&'a serde_json::Value> {
    exec["mounts"]
        .as_array()
        .expect("mounts array")
        .iter()
        .find(|m| m["target"] == target)
}
