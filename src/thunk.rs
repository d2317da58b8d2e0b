//! The thunk model: content-addressed specifications of command
//! executions inside OCI container images.
//!
//! Thunks compose by value: another thunk's output directory becomes a
//! mount source, and another thunk's built rootfs becomes a base image.
//! Every reference is by value, so cycles are impossible by construction.
//!
//! # Canonical Form and Fingerprinting
//!
//! A thunk's fingerprint is SHA-256 over its canonical JSON: struct
//! fields in declaration order, bindings sorted by name, empty or absent
//! optional fields skipped, and secrets rendered by name only. The
//! fingerprint is the solver cache key, and (truncated) the container
//! hostname, which is what distinguishes two otherwise-identical
//! invocations with different labels.

use crate::error::{Error, Result};
use crate::path::{CommandPath, DirPath, FileOrDirPath, FilePath, FsPath, HostPath};
use crate::platform::Platform;
use crate::value::{Bindings, Secret, Value};
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Length of the truncated fingerprint used as the container hostname.
/// Hostname labels cap at 63 bytes; 32 hex chars keep 128 bits.
const HOSTNAME_LEN: usize = 32;

// =============================================================================
// Thunk
// =============================================================================

/// A content-addressed specification of a command execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Thunk {
    /// The base image. Absent runs against an empty rootfs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ThunkImage>,

    /// The command to run.
    pub cmd: ThunkCmd,

    /// Command arguments; order preserved.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,

    /// Values fed to the command's stdin as a JSON stream.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stdin: Vec<Value>,

    /// Environment bindings; logically unordered, serialized sorted.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: Bindings,

    /// Working directory inside the container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<DirPath>,

    /// Mounts; order preserved, first mount wins for a shared target.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<ThunkMount>,

    /// Cache-busting tags with no runtime effect.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: Bindings,

    /// Requests elevated container entitlement.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub insecure: bool,
}

impl Thunk {
    /// Creates a thunk running the given command against an empty rootfs.
    pub fn new(cmd: ThunkCmd) -> Self {
        Self {
            image: None,
            cmd,
            args: Vec::new(),
            stdin: Vec::new(),
            env: Bindings::new(),
            dir: None,
            mounts: Vec::new(),
            labels: Bindings::new(),
            insecure: false,
        }
    }

    /// Sets the base image.
    #[must_use]
    pub fn with_image(mut self, image: ThunkImage) -> Self {
        self.image = Some(image);
        self
    }

    /// Appends command arguments.
    #[must_use]
    pub fn with_args(mut self, args: impl IntoIterator<Item = Value>) -> Self {
        self.args.extend(args);
        self
    }

    /// Sets an environment binding.
    #[must_use]
    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn with_dir(mut self, dir: DirPath) -> Self {
        self.dir = Some(dir);
        self
    }

    /// Appends a mount.
    #[must_use]
    pub fn with_mount(mut self, source: MountSource, target: FileOrDirPath) -> Self {
        self.mounts.push(ThunkMount { source, target });
        self
    }

    /// Sets a label.
    #[must_use]
    pub fn with_label(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.labels.insert(name.into(), value.into());
        self
    }

    /// Requests elevated container entitlement.
    #[must_use]
    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// The canonical serialization fingerprinting and caching key on.
    pub fn canonical_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// SHA-256 hex over the canonical serialization.
    pub fn fingerprint(&self) -> Result<String> {
        let sum = Sha256::digest(self.canonical_json()?);
        Ok(hex::encode(sum))
    }

    /// The container hostname: the fingerprint truncated to fit a
    /// hostname label. Load-bearing for caching; do not change lightly.
    pub fn hostname(&self) -> Result<String> {
        let mut fp = self.fingerprint()?;
        fp.truncate(HOSTNAME_LEN);
        Ok(fp)
    }

    /// The platform this thunk targets, threaded through its image.
    pub fn platform(&self) -> Option<&Platform> {
        self.image.as_ref().and_then(ThunkImage::platform)
    }

    /// A human rendering of the command line, for progress vertexes.
    pub fn cmdline(&self) -> String {
        let mut line = self.cmd.to_string();
        for arg in &self.args {
            line.push(' ');
            match arg {
                Value::String(s) => line.push_str(s),
                other => line.push_str(
                    &serde_json::to_string(other).unwrap_or_else(|_| other.kind().to_string()),
                ),
            }
        }
        line
    }
}

// =============================================================================
// Images
// =============================================================================

/// The base image of a thunk: a reference to be fetched, or a lower
/// thunk whose work directory becomes the rootfs after it runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThunkImage {
    Ref(ImageRef),
    Parent(Box<Thunk>),
}

impl ThunkImage {
    /// The platform the image targets, if it names one.
    pub fn platform(&self) -> Option<&Platform> {
        match self {
            ThunkImage::Ref(r) => Some(&r.platform),
            ThunkImage::Parent(t) => t.platform(),
        }
    }
}

/// An OCI image, hosted on a registry or carried as an archive produced
/// by another thunk. Exactly one of `repository` or `file` is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageRef {
    /// The platform to target; influences worker selection.
    pub platform: Platform,

    /// A reference to an image hosted on a registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,

    /// An OCI image archive tarball to load.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<ThunkPath>,

    /// The tag, from the repository or within a multi-tag archive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,

    /// An optional digest, for maximally reproducible builds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl ImageRef {
    /// Creates a registry image reference.
    pub fn from_repository(platform: Platform, repository: impl Into<String>) -> Self {
        Self {
            platform,
            repository: Some(repository.into()),
            file: None,
            tag: None,
            digest: None,
        }
    }

    /// Creates an archive image reference.
    pub fn from_archive(platform: Platform, file: ThunkPath) -> Self {
        Self {
            platform,
            repository: None,
            file: Some(file),
            tag: None,
            digest: None,
        }
    }

    /// Sets the tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Sets the digest.
    #[must_use]
    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }

    /// The tag to use, defaulting to `latest`.
    pub fn tag_or_latest(&self) -> &str {
        self.tag.as_deref().unwrap_or("latest")
    }

    /// The canonical reference string: `repo@digest` if a digest is
    /// present, else `repo:tag`, else the archive path plus tag.
    pub fn reference(&self) -> String {
        if let Some(repo) = &self.repository {
            if let Some(digest) = &self.digest {
                format!("{repo}@{digest}")
            } else {
                format!("{}:{}", repo, self.tag_or_latest())
            }
        } else if let Some(file) = &self.file {
            format!("{}:{}", file, self.tag_or_latest())
        } else {
            String::new()
        }
    }

    /// The repository reference, for registry resolution. Archive refs
    /// have no repository to resolve.
    pub fn repository_ref(&self) -> Result<String> {
        if self.repository.is_none() {
            return Err(Error::NoRepository);
        }

        Ok(self.reference())
    }
}

// =============================================================================
// Commands
// =============================================================================

/// The command a thunk runs, as a tagged variant over path kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThunkCmd {
    /// A bare name resolved via `PATH` inside the container.
    Command(CommandPath),
    /// A file relative to the work directory.
    File(FilePath),
    /// A file produced by another thunk.
    Thunk(ThunkPath),
    /// A file under a host context directory.
    Host(HostPath),
    /// A file inside an embedded filesystem.
    Fs(FsPath),
}

impl std::fmt::Display for ThunkCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThunkCmd::Command(p) => p.fmt(f),
            ThunkCmd::File(p) => p.fmt(f),
            ThunkCmd::Thunk(p) => p.fmt(f),
            ThunkCmd::Host(p) => p.fmt(f),
            ThunkCmd::Fs(p) => p.fmt(f),
        }
    }
}

// =============================================================================
// Thunk Paths
// =============================================================================

/// A path inside the output tree produced by another thunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThunkPath {
    /// The producing thunk.
    pub thunk: Box<Thunk>,

    /// The subpath within its work directory.
    pub path: FileOrDirPath,
}

impl ThunkPath {
    /// Creates a thunk-output path. The subpath must be relative.
    pub fn new(thunk: Thunk, path: FileOrDirPath) -> Result<Self> {
        if path.is_absolute() {
            return Err(Error::InvalidPath {
                path: path.slash().to_string(),
                reason: "thunk subpath must be relative".to_string(),
            });
        }

        Ok(Self {
            thunk: Box::new(thunk),
            path,
        })
    }
}

impl std::fmt::Display for ThunkPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = self
            .thunk
            .hostname()
            .unwrap_or_else(|_| "unhashable".to_string());
        write!(f, "{}/{}", name, self.path.slash())
    }
}

// =============================================================================
// Mounts
// =============================================================================

/// A mount for a thunk: a source and the target it appears at. Targets
/// may be absolute or relative to the work directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThunkMount {
    pub source: MountSource,
    pub target: FileOrDirPath,
}

/// Where a mount's content comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MountSource {
    /// Another thunk's output.
    Thunk(ThunkPath),
    /// A host directory rooted at a context dir.
    Host(HostPath),
    /// An embedded filesystem path.
    Fs(FsPath),
    /// A named secret; never part of the fingerprint's byte content.
    Secret(Secret),
    /// A named persistent cache directory shared across thunks.
    /// Probed last: its legacy form is a bare file-or-dir path.
    Cache(CachePath),
}

/// A persistent cache directory, identified by `id`. Only one solve may
/// hold a given cache at a time; others block until it is released.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CachePath {
    /// The cache identity the solver locks on.
    pub id: String,

    /// The subpath within the cache directory to mount.
    pub path: FileOrDirPath,
}

impl CachePath {
    /// Creates a cache path with an explicit id.
    pub fn new(id: impl Into<String>, path: FileOrDirPath) -> Self {
        Self {
            id: id.into(),
            path,
        }
    }

    /// Derives the legacy id for a bare-path cache source.
    fn legacy_id(path: &FileOrDirPath) -> String {
        let slash = path.slash();
        if slash.is_empty() {
            ".".to_string()
        } else {
            slash.to_string()
        }
    }
}

impl Serialize for CachePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("cache", &self.id)?;
        map.serialize_entry("path", &self.path)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for CachePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Tagged {
                cache: String,
                path: FileOrDirPath,
            },
            // Older encodings carried only the path; the id falls back to
            // its slash form.
            Legacy(FileOrDirPath),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Tagged { cache, path } => {
                if cache.is_empty() {
                    return Err(D::Error::custom("cache id cannot be empty"));
                }
                Ok(CachePath { id: cache, path })
            }
            Repr::Legacy(path) => Ok(CachePath {
                id: CachePath::legacy_id(&path),
                path,
            }),
        }
    }
}
