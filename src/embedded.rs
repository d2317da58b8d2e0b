//! Embedded filesystems: virtual file trees bundled with the
//! dispatching process.
//!
//! An [`FsPath`](crate::path::FsPath) names content by filesystem id plus
//! subpath; the filesystem itself never travels over the wire. Instead,
//! each process registers its embedded trees here during initialization,
//! and the translator resolves ids at build time. An unregistered id is
//! a translation error.

use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

/// Default mode for files without an explicit one.
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Mode used for synthesized parent directories.
pub const DEFAULT_DIR_MODE: u32 = 0o755;

static REGISTRY: Lazy<RwLock<HashMap<String, Arc<EmbeddedFs>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// A file inside an embedded filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEntry {
    /// Unix permission bits.
    pub mode: u32,
    /// File content.
    pub data: Vec<u8>,
}

impl FsEntry {
    /// Creates an entry with the default file mode.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            mode: DEFAULT_FILE_MODE,
            data: data.into(),
        }
    }

    /// Creates an entry with an explicit mode.
    pub fn with_mode(data: impl Into<Vec<u8>>, mode: u32) -> Self {
        Self {
            mode,
            data: data.into(),
        }
    }
}

/// An immutable in-memory file tree, identified by id.
///
/// Entries are keyed by normalized relative slash paths and kept sorted,
/// so walks are deterministic. Directories are implied by their
/// children and synthesized with [`DEFAULT_DIR_MODE`].
#[derive(Debug)]
pub struct EmbeddedFs {
    id: String,
    entries: BTreeMap<String, FsEntry>,
}

impl EmbeddedFs {
    /// Creates (but does not register) an embedded filesystem.
    pub fn new(
        id: impl Into<String>,
        entries: impl IntoIterator<Item = (String, FsEntry)>,
    ) -> Result<Arc<Self>> {
        let id = id.into();

        let mut normalized = BTreeMap::new();
        for (path, entry) in entries {
            let path = crate::path::normalize(&path)?;
            if path.is_empty() || path.starts_with('/') {
                return Err(Error::InvalidPath {
                    path,
                    reason: "embedded entries must be relative files".to_string(),
                });
            }
            normalized.insert(path, entry);
        }

        Ok(Arc::new(Self {
            id,
            entries: normalized,
        }))
    }

    /// The filesystem's registered id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Reads a single file.
    pub fn read_file(&self, path: &str) -> Result<&FsEntry> {
        self.entries
            .get(path)
            .ok_or_else(|| Error::EmbeddedPathMissing {
                id: self.id.clone(),
                path: path.to_string(),
            })
    }

    /// Walks all files under a directory prefix, in sorted order. The
    /// empty prefix walks the whole tree.
    pub fn walk<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a str, &'a FsEntry)> {
        self.entries.iter().filter_map(move |(path, entry)| {
            if prefix.is_empty()
                || path == prefix
                || path.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/'))
            {
                Some((path.as_str(), entry))
            } else {
                None
            }
        })
    }

    /// Returns true if any entry lives under the given directory prefix.
    pub fn contains_dir(&self, prefix: &str) -> bool {
        self.walk(prefix).next().is_some()
    }
}

/// Registers an embedded filesystem for id-based resolution.
///
/// Registration happens during process initialization; later
/// registrations under the same id replace earlier ones.
pub fn register(fs: Arc<EmbeddedFs>) {
    REGISTRY
        .write()
        .expect("embedded fs registry poisoned")
        .insert(fs.id.clone(), fs);
}

/// Looks up a registered filesystem by id.
pub fn lookup(id: &str) -> Result<Arc<EmbeddedFs>> {
    REGISTRY
        .read()
        .expect("embedded fs registry poisoned")
        .get(id)
        .cloned()
        .ok_or_else(|| Error::EmbeddedFsMissing { id: id.to_string() })
}
