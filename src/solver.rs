//! The solver client seam: the interface the driver speaks to the
//! remote container-build service.
//!
//! Every solve is two-pass. Pass one opens a [`BuildSession`] — a live
//! gateway used while the build graph is constructed (image config
//! resolution, result reads for OCI unpacks). Pass two submits the
//! marshaled [`Definition`](crate::graph::Definition) with the solve
//! options and at most one export. Both passes stream
//! [`SolveStatus`] messages into the same status channel, so progress
//! surfaces uniformly.
//!
//! Implementations must be safe for concurrent solves; the driver
//! shares one client across operations.

use crate::error::Result;
use crate::graph::Definition;
use crate::platform::Platform;
use crate::runtime::PruneOpts;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;

/// Channel end a solve streams status into.
pub type StatusSender = mpsc::Sender<SolveStatus>;

/// A worker advertised by the solver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,
    pub platform: Platform,
}

/// An elevated capability a solve may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Entitlement {
    #[serde(rename = "security.insecure")]
    SecurityInsecure,
}

/// Options accompanying a solve submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SolveOpts {
    /// Context-dir name → host directory, for local transfers.
    pub local_dirs: BTreeMap<String, PathBuf>,

    /// Entitlements the graph requires.
    pub entitlements: Vec<Entitlement>,

    /// The per-solve secret table backing secret mounts. Bytes stay in
    /// the session; they are never part of the definition.
    #[serde(skip)]
    pub secrets: BTreeMap<String, Vec<u8>>,
}

/// Where a solve's result goes. At most one export per solve.
pub enum Export<'a> {
    /// Write the result tree into a host directory.
    Local { output_dir: &'a Path },

    /// Stream the result as an OCI image archive.
    OciArchive {
        writer: &'a mut (dyn AsyncWrite + Send + Unpin),
    },

    /// Stream the result as a tar archive.
    Tar {
        writer: &'a mut (dyn AsyncWrite + Send + Unpin),
    },
}

// =============================================================================
// Status Messages
// =============================================================================

/// A batch of progress updates from one solve. Batches arrive in sender
/// order within a solve; concurrent solves are independent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SolveStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vertexes: Vec<Vertex>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub statuses: Vec<VertexStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<VertexLog>,
}

/// One graph vertex's lifecycle snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vertex {
    pub digest: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Progress of one task within a vertex (e.g. a layer pull).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VertexStatus {
    pub id: String,
    pub vertex: String,
    #[serde(default)]
    pub current: u64,
    #[serde(default)]
    pub total: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// A chunk of log output from a vertex.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VertexLog {
    pub vertex: String,
    /// 1 for stdout, 2 for stderr.
    pub stream: i32,
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// One reclaimed cache record from a prune.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageInfo {
    pub id: String,
    pub size: i64,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub description: String,
}

// =============================================================================
// Client Traits
// =============================================================================

/// A live gateway opened for the duration of graph construction.
#[async_trait]
pub trait BuildSession: Send + Sync {
    /// Resolves an image reference's config, pinning its digest.
    async fn resolve_image_config(
        &self,
        reference: &str,
        platform: &Platform,
    ) -> Result<ResolvedImage>;

    /// Solves a definition and reads one file from the result. The
    /// opts carry whatever local dirs, secrets, and entitlements the
    /// definition depends on so far.
    async fn read_file(&self, def: &Definition, path: &str, opts: &SolveOpts) -> Result<Vec<u8>>;

    /// Tears the session down, joining any in-flight streaming.
    async fn close(&self) -> Result<()>;
}

/// The result of resolving an image's config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedImage {
    pub digest: String,
}

/// The solver client. Shared across concurrent solves.
#[async_trait]
pub trait SolverClient: Send + Sync {
    /// Lists the solver's workers and their platforms.
    async fn list_workers(&self) -> Result<Vec<WorkerInfo>>;

    /// Opens a build session for graph construction. Status generated
    /// by session work streams into the given channel.
    async fn open_session(&self, status: StatusSender) -> Result<Box<dyn BuildSession>>;

    /// Submits a marshaled definition, streaming status and fulfilling
    /// the export.
    async fn solve(
        &self,
        def: &Definition,
        opts: &SolveOpts,
        export: Option<Export<'_>>,
        status: StatusSender,
    ) -> Result<()>;

    /// Prunes the solver cache, streaming reclaimed records.
    async fn prune(&self, opts: &PruneOpts, usage: mpsc::Sender<UsageInfo>) -> Result<()>;

    /// Releases the client.
    async fn close(&self) -> Result<()>;
}
