//! The runtime interface: what a thunk can be asked to do.
//!
//! A runtime materializes thunks through a remote solver. Every
//! operation either succeeds wholly or leaves nothing observable behind
//! (beyond cache population the solver itself commits); partial exports
//! are discarded with the operation's scratch space.

use crate::error::Result;
use crate::status::StatusRecorder;
use crate::thunk::{ImageRef, Thunk, ThunkPath};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;

/// Named service addresses a runtime dials, e.g.
/// `buildkitd → unix:///run/buildkit/buildkitd.sock`.
pub type RuntimeAddrs = BTreeMap<String, String>;

/// Configuration selecting and parameterizing a runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Registered runtime name, e.g. `buildkit`.
    pub runtime: String,

    /// Service address bindings.
    #[serde(default)]
    pub addrs: RuntimeAddrs,

    /// Nested runtime-specific configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

/// Shared context handed to runtime constructors.
pub struct RuntimePool {
    recorder: Arc<dyn StatusRecorder>,
}

impl RuntimePool {
    /// Creates a pool recording progress to the given recorder.
    pub fn new(recorder: Arc<dyn StatusRecorder>) -> Arc<Self> {
        Arc::new(Self { recorder })
    }

    /// The recorder runtimes surface progress through.
    pub fn recorder(&self) -> Arc<dyn StatusRecorder> {
        self.recorder.clone()
    }
}

/// Options for pruning the solver cache.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PruneOpts {
    /// Prune everything, not just unreferenced intermediates.
    #[serde(default)]
    pub all: bool,

    /// Keep records used within this duration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_duration: Option<Duration>,

    /// Keep at least this much cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_bytes: Option<u64>,
}

/// A thunk runtime backed by a remote solver.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Resolves an image reference to a digest-pinned one.
    async fn resolve(&self, image_ref: ImageRef) -> Result<ImageRef>;

    /// Runs a thunk. With a writer, the command's stdout is captured
    /// and copied to it once the solve completes.
    async fn run(
        &self,
        thunk: &Thunk,
        stdout: Option<&mut (dyn AsyncWrite + Send + Unpin)>,
    ) -> Result<()>;

    /// Builds a thunk and streams its full image as an OCI archive.
    async fn export(
        &self,
        thunk: &Thunk,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()>;

    /// Builds a thunk and streams a path from its output as a tar
    /// archive. Directory paths emit their contents only.
    async fn export_path(
        &self,
        path: &ThunkPath,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()>;

    /// Prunes the solver cache, streaming usage records to the writer.
    async fn prune(
        &self,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
        opts: PruneOpts,
    ) -> Result<()>;

    /// Releases the runtime's resources.
    async fn close(&self) -> Result<()>;
}
