//! Per-architecture shim executables.
//!
//! Every container runs the shim as its entrypoint (`shim run
//! /bass/io/in`); it reads the command payload, performs the exec, and
//! optionally captures stdout. The shim binary matching the worker's
//! architecture is copied into the graph, so the dispatching process
//! must carry one per architecture it targets.
//!
//! Binaries are loaded once at runtime construction from
//! `<data dir>/thunkrun/shims/exe.<arch>`, overridable via the runtime
//! config.

use crate::constants::{SHIM_DIR, SHIM_EXE_PREFIX};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// In-memory table of shim binaries, keyed by architecture.
#[derive(Debug, Default)]
pub struct ShimStore {
    shims: HashMap<String, Vec<u8>>,
}

impl ShimStore {
    /// An empty store, for runtimes that never reach translation.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Loads every `exe.<arch>` under the given directory (or the
    /// default data dir). A missing directory yields an empty store;
    /// the error surfaces later, per-architecture, at translation.
    pub fn load(dir: Option<&Path>) -> Result<Self> {
        let dir = match dir {
            Some(d) => d.to_path_buf(),
            None => default_dir(),
        };

        let mut shims = HashMap::new();

        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(dir = %dir.display(), "no shim directory");
                return Ok(Self { shims });
            }
            Err(err) => return Err(err.into()),
        };

        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(arch) = name
                .to_str()
                .and_then(|n| n.strip_prefix(SHIM_EXE_PREFIX))
            else {
                continue;
            };

            let content = std::fs::read(entry.path())?;
            tracing::debug!(arch, size = content.len(), "loaded shim");
            shims.insert(arch.to_string(), content);
        }

        Ok(Self { shims })
    }

    /// Inserts a shim binary directly.
    pub fn insert(&mut self, arch: impl Into<String>, content: Vec<u8>) {
        self.shims.insert(arch.into(), content);
    }

    /// The shim binary for an architecture.
    pub fn get(&self, arch: &str) -> Result<&[u8]> {
        self.shims
            .get(arch)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::NoShim {
                arch: arch.to_string(),
            })
    }
}

fn default_dir() -> PathBuf {
    let data_home = std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("/usr/lib"));

    data_home.join("thunkrun").join(SHIM_DIR)
}
