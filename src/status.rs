//! Status proxying: the bridge from solver status messages to the
//! progress recorder.
//!
//! A [`StatusProxy`] consumes a solve's status channel on its own task,
//! projects each batch into the recorder's schema, feeds an in-process
//! [`Progress`] model used to decorate errors, and records the
//! projection for UI rendering — in sender order. The proxy is joined
//! before the driving operation returns, so no status is lost.

use crate::constants::{LOG_TAIL_LINES, STATUS_CHANNEL_DEPTH};
use crate::error::Error;
use crate::solver::{SolveStatus, StatusSender};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// =============================================================================
// Recorder Seam
// =============================================================================

/// The progress UI contract: consumes projected status batches.
///
/// Implementations render progress however they like; the execution
/// core only guarantees per-solve ordering.
pub trait StatusRecorder: Send + Sync {
    fn record(&self, status: &RecordedStatus);
}

/// A recorder that discards everything.
#[derive(Debug, Default)]
pub struct NullRecorder;

impl StatusRecorder for NullRecorder {
    fn record(&self, _status: &RecordedStatus) {}
}

/// A recorder that mirrors status into structured logs.
#[derive(Debug, Default)]
pub struct TracingRecorder;

impl StatusRecorder for TracingRecorder {
    fn record(&self, status: &RecordedStatus) {
        for vertex in &status.vertexes {
            tracing::debug!(
                digest = %vertex.digest,
                name = %vertex.name,
                cached = vertex.cached,
                completed = vertex.completed.is_some(),
                "vertex"
            );
        }
        for log in &status.logs {
            tracing::debug!(
                vertex = %log.vertex,
                data = %String::from_utf8_lossy(&log.data).trim_end(),
                "log"
            );
        }
    }
}

// =============================================================================
// Recorded Schema
// =============================================================================

/// A projected status batch, in the recorder's schema.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordedStatus {
    pub vertexes: Vec<RecordedVertex>,
    pub tasks: Vec<RecordedTask>,
    pub logs: Vec<RecordedLog>,
}

/// A vertex's lifecycle snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordedVertex {
    pub digest: String,
    pub inputs: Vec<String>,
    pub name: String,
    pub started: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
    pub cached: bool,
    pub error: Option<String>,
}

/// Progress of a task within a vertex.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordedTask {
    pub vertex: String,
    pub name: String,
    pub current: u64,
    pub total: u64,
}

/// Output streams a vertex log chunk may belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// A chunk of vertex log output.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedLog {
    pub vertex: String,
    pub stream: LogStream,
    pub data: Vec<u8>,
}

fn project(status: &SolveStatus) -> RecordedStatus {
    RecordedStatus {
        vertexes: status
            .vertexes
            .iter()
            .map(|v| RecordedVertex {
                digest: v.digest.clone(),
                inputs: v.inputs.clone(),
                name: v.name.clone(),
                started: v.started,
                completed: v.completed,
                cached: v.cached,
                error: v.error.clone(),
            })
            .collect(),
        tasks: status
            .statuses
            .iter()
            .map(|s| RecordedTask {
                vertex: s.vertex.clone(),
                name: s.id.clone(),
                current: s.current,
                total: s.total,
            })
            .collect(),
        logs: status
            .logs
            .iter()
            .map(|l| RecordedLog {
                vertex: l.vertex.clone(),
                stream: if l.stream == 1 {
                    LogStream::Stdout
                } else {
                    LogStream::Stderr
                },
                data: l.data.clone(),
            })
            .collect(),
    }
}

// =============================================================================
// Progress Model
// =============================================================================

/// In-process view of a solve, kept so terminal errors can carry the
/// last-seen logs.
#[derive(Debug, Default)]
pub struct Progress {
    vertexes: HashMap<String, VertexState>,
    order: Vec<String>,
}

#[derive(Debug, Default)]
struct VertexState {
    name: String,
    error: Option<String>,
    logs: VecDeque<String>,
    partial: String,
}

impl Progress {
    fn write_status(&mut self, status: &RecordedStatus) {
        for vertex in &status.vertexes {
            let state = self.vertex(&vertex.digest);
            state.name = vertex.name.clone();
            if vertex.error.is_some() {
                state.error = vertex.error.clone();
            }
        }

        for log in &status.logs {
            let state = self.vertex(&log.vertex);
            state.partial.push_str(&String::from_utf8_lossy(&log.data));

            while let Some(idx) = state.partial.find('\n') {
                let line: String = state.partial.drain(..=idx).collect();
                if state.logs.len() == LOG_TAIL_LINES {
                    state.logs.pop_front();
                }
                state.logs.push_back(line.trim_end().to_string());
            }
        }
    }

    fn vertex(&mut self, digest: &str) -> &mut VertexState {
        if !self.vertexes.contains_key(digest) {
            self.order.push(digest.to_string());
        }
        self.vertexes.entry(digest.to_string()).or_default()
    }

    /// Renders the failed vertexes and their retained log tails.
    pub fn tail(&self) -> String {
        let mut out = String::new();

        for digest in &self.order {
            let state = &self.vertexes[digest];
            let Some(error) = &state.error else {
                continue;
            };

            if !out.is_empty() {
                out.push('\n');
            }

            out.push_str(&format!("{}: {}\n", state.name, error));
            for line in &state.logs {
                out.push_str(&format!("  {line}\n"));
            }
        }

        out
    }
}

// =============================================================================
// Proxy
// =============================================================================

/// Consumes a solve's status stream until every sender is dropped.
pub struct StatusProxy {
    recorder: Arc<dyn StatusRecorder>,
    progress: Arc<Mutex<Progress>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl StatusProxy {
    /// Spawns a proxy and returns the sender its solve streams into.
    /// Clones of the sender may serve multiple passes of one solve; the
    /// proxy drains until the last clone drops.
    pub fn forward(recorder: Arc<dyn StatusRecorder>) -> (Self, StatusSender) {
        let (tx, mut rx) = mpsc::channel::<SolveStatus>(STATUS_CHANNEL_DEPTH);

        let progress = Arc::new(Mutex::new(Progress::default()));

        let task_recorder = recorder.clone();
        let task_progress = progress.clone();
        let handle = tokio::spawn(async move {
            while let Some(status) = rx.recv().await {
                let projected = project(&status);
                task_progress
                    .lock()
                    .expect("progress lock poisoned")
                    .write_status(&projected);
                task_recorder.record(&projected);
            }
        });

        (
            Self {
                recorder,
                progress,
                handle: Mutex::new(Some(handle)),
            },
            tx,
        )
    }

    /// Joins the proxy task. Call after every sender clone is dropped.
    pub async fn wait(&self) {
        let handle = self.handle.lock().expect("proxy lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Wraps a terminal error with the last-seen logs. Cancellations
    /// pass through undecorated, as does anything when no vertex
    /// failed.
    pub fn nice_error(&self, message: &str, err: Error) -> Error {
        if err.is_canceled() {
            return err;
        }

        let logs = self.progress.lock().expect("progress lock poisoned").tail();
        if logs.is_empty() {
            return err;
        }

        Error::Nice {
            message: message.to_string(),
            logs,
            source: Box::new(err),
        }
    }

    /// The recorder this proxy records to.
    pub fn recorder(&self) -> &Arc<dyn StatusRecorder> {
        &self.recorder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::{Vertex, VertexLog};

    #[tokio::test]
    async fn proxy_projects_in_order() {
        #[derive(Default)]
        struct Capture(Mutex<Vec<RecordedStatus>>);

        impl StatusRecorder for Capture {
            fn record(&self, status: &RecordedStatus) {
                self.0.lock().unwrap().push(status.clone());
            }
        }

        let capture = Arc::new(Capture::default());
        let (proxy, tx) = StatusProxy::forward(capture.clone());

        for i in 0..3 {
            tx.send(SolveStatus {
                vertexes: vec![Vertex {
                    digest: format!("sha256:{i}"),
                    name: format!("step {i}"),
                    ..Default::default()
                }],
                ..Default::default()
            })
            .await
            .unwrap();
        }

        drop(tx);
        proxy.wait().await;

        let seen = capture.0.lock().unwrap();
        let digests: Vec<_> = seen
            .iter()
            .flat_map(|s| s.vertexes.iter().map(|v| v.digest.clone()))
            .collect();
        assert_eq!(digests, vec!["sha256:0", "sha256:1", "sha256:2"]);
    }

    #[tokio::test]
    async fn nice_error_carries_failed_vertex_logs() {
        let (proxy, tx) = StatusProxy::forward(Arc::new(NullRecorder));

        tx.send(SolveStatus {
            vertexes: vec![Vertex {
                digest: "sha256:v".to_string(),
                name: "compile".to_string(),
                error: Some("exit status 2".to_string()),
                ..Default::default()
            }],
            logs: vec![VertexLog {
                vertex: "sha256:v".to_string(),
                stream: 2,
                data: b"error: it broke\n".to_vec(),
                ..Default::default()
            }],
            ..Default::default()
        })
        .await
        .unwrap();

        drop(tx);
        proxy.wait().await;

        let err = proxy.nice_error(
            "build failed",
            Error::Solver {
                message: "solve failed".to_string(),
            },
        );

        let rendered = err.to_string();
        assert!(rendered.contains("build failed"));
        assert!(rendered.contains("compile: exit status 2"));
        assert!(rendered.contains("error: it broke"));
    }

    #[tokio::test]
    async fn cancellation_passes_through() {
        let (proxy, tx) = StatusProxy::forward(Arc::new(NullRecorder));
        drop(tx);
        proxy.wait().await;

        let err = proxy.nice_error("build failed", Error::Canceled);
        assert!(matches!(err, Error::Canceled));
    }

    #[test]
    fn progress_tail_keeps_bounded_lines() {
        let mut progress = Progress::default();

        let mut status = RecordedStatus::default();
        status.vertexes.push(RecordedVertex {
            digest: "d".to_string(),
            name: "noisy".to_string(),
            error: Some("boom".to_string()),
            ..Default::default()
        });
        for i in 0..(LOG_TAIL_LINES + 5) {
            status.logs.push(RecordedLog {
                vertex: "d".to_string(),
                stream: LogStream::Stderr,
                data: format!("line {i}\n").into_bytes(),
            });
        }

        progress.write_status(&status);

        let tail = progress.tail();
        assert!(!tail.contains("line 0"));
        assert!(tail.contains(&format!("line {}", LOG_TAIL_LINES + 4)));
    }
}
