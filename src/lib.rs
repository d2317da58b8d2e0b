//! # thunkrun
//!
//! **Content-Addressed Thunk Execution Against a Remote Build Solver**
//!
//! This crate provides the execution core for *thunks*: reproducible,
//! content-addressed specifications of command executions inside OCI
//! container images. Thunks compose — one thunk's output directory
//! becomes another's mount, one thunk's built rootfs becomes another's
//! base image — and the identity of any thunk is a deterministic hash
//! of its full, transitively-resolved specification.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                           thunkrun                                  │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                      Runtime Trait                          │    │
//! │  │   resolve(ref) │ run(thunk) │ export(thunk) │ prune(opts)   │    │
//! │  └───────────────────────────┬─────────────────────────────────┘    │
//! │                              │                                      │
//! │  ┌───────────────────────────┼───────────────────────────────┐      │
//! │  │                Build-Graph Translation                    │      │
//! │  │  Thunk → Image/Scratch/File/Exec/Copy DAG                 │      │
//! │  │  Image recursion │ Workdir threading │ Secret tables      │      │
//! │  └───────────────────────────┼───────────────────────────────┘      │
//! │                              │                                      │
//! │  ┌───────────────────────────┼───────────────────────────────┐      │
//! │  │                 Content Addressing                        │      │
//! │  │  Canonical JSON │ SHA-256 fingerprints │ Op digests       │      │
//! │  └───────────────────────────────────────────────────────────┘      │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                        Remote Solver                                │
//! │   workers │ gateway sessions │ solves │ exports │ prune             │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Two-Pass Solves
//!
//! Every operation translates under a live gateway session (pass one:
//! image config resolution, OCI-archive unpacks, side-table
//! collection), then submits the marshaled graph with its exports and
//! session attachables (pass two). A status proxy spans both passes,
//! feeding the progress recorder and decorating terminal errors with
//! the last captured logs.
//!
//! # Caching Model
//!
//! The solver caches per op digest. A thunk's fingerprint — SHA-256
//! over its canonical serialization — becomes the container hostname,
//! which is what distinguishes two otherwise-identical invocations
//! with different labels. Secrets never contribute bytes to any
//! canonical form; they identify by name alone.
//!
//! # Example
//!
//! ```rust,ignore
//! use thunkrun::{
//!     registry, CommandPath, ImageRef, Platform, RuntimeConfig,
//!     RuntimePool, Thunk, ThunkCmd, ThunkImage, TracingRecorder, Value,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> thunkrun::Result<()> {
//!     let pool = RuntimePool::new(Arc::new(TracingRecorder));
//!
//!     let runtime = registry::init(
//!         RuntimeConfig {
//!             runtime: "buildkit".to_string(),
//!             addrs: thunkrun::buildkit::default_addrs(),
//!             config: None,
//!         },
//!         pool,
//!     )
//!     .await?;
//!
//!     let thunk = Thunk::new(ThunkCmd::Command(CommandPath::new("echo")?))
//!         .with_image(ThunkImage::Ref(ImageRef::from_repository(
//!             Platform::linux(),
//!             "alpine",
//!         )))
//!         .with_args([Value::from("hi")]);
//!
//!     let mut stdout = Vec::new();
//!     runtime.run(&thunk, Some(&mut stdout)).await?;
//!
//!     Ok(())
//! }
//! ```

// =============================================================================
// Internal Modules
// =============================================================================

mod constants;
mod error;

// =============================================================================
// Public Modules
// =============================================================================

/// The buildkit solver driver.
pub mod buildkit;

/// Shim payload construction.
pub mod command;

/// The control-socket solver transport.
pub mod control;

/// Embedded filesystem registration.
pub mod embedded;

/// The build-graph DAG and its marshaled form.
pub mod graph;

/// Path algebra: files, dirs, commands, host and embedded paths.
pub mod path;

/// OCI platforms and runtime selection.
pub mod platform;

/// Wire serialization of thunks and values.
pub mod proto;

/// The runtime registry.
pub mod registry;

/// The runtime interface.
pub mod runtime;

/// Per-architecture shim executables.
pub mod shim;

/// The solver client seam.
pub mod solver;

/// Status proxying and the progress-recorder seam.
pub mod status;

/// The thunk model.
pub mod thunk;

/// Thunk → build-graph translation.
pub mod translate;

/// The value universe shared with the host language.
pub mod value;

// =============================================================================
// Facade
// =============================================================================

pub use buildkit::{BuildkitConfig, BuildkitRuntime};
pub use constants::{
    BUILDKITD_ADDR_NAME, BUILDKIT_NAME, INPUT_FILE, IO_DIR, OUTPUT_ENV, OUTPUT_FILE,
    SHIM_EXE_PATH, WORK_DIR,
};
pub use error::{Error, Result};
pub use path::{CommandPath, DirPath, FileOrDirPath, FilePath, FsPath, HostPath};
pub use platform::Platform;
pub use runtime::{PruneOpts, Runtime, RuntimeAddrs, RuntimeConfig, RuntimePool};
pub use status::{NullRecorder, StatusRecorder, TracingRecorder};
pub use thunk::{
    CachePath, ImageRef, MountSource, Thunk, ThunkCmd, ThunkImage, ThunkMount, ThunkPath,
};
pub use value::{Bindings, Secret, Value};
