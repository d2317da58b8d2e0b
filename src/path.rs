//! Path algebra for thunk composition.
//!
//! Every location a thunk can name is a closed tagged variant: a file or
//! directory relative to the work directory, a bare command resolved via
//! `PATH` inside the container, a host path rooted at a context directory,
//! a path inside an embedded filesystem, or a path inside another thunk's
//! output (see [`crate::thunk::ThunkPath`]).
//!
//! All subpaths are normalized at construction and at deserialization:
//! forward slashes, `.` segments dropped, `..` resolved. Resolving past
//! the root is an error. Mount targets are the one place a leading `/` is
//! preserved; everything else is relative.
//!
//! # JSON Encoding
//!
//! Each variant is a single-key (or fixed-shape) tagged object, probed
//! arm by arm on decode:
//!
//! ```json
//! {"file": "sub/name"}
//! {"dir": "sub"}
//! {"command": "echo"}
//! {"context": "/src/app", "path": {"dir": "."}}
//! {"fs": "stdlib", "path": {"file": "init.bass"}}
//! ```

use crate::error::{Error, Result};
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::PathBuf;

/// Normalizes a slash-separated path: drops empty and `.` segments and
/// resolves `..`. A leading `/` is preserved; popping past the root is an
/// error either way.
pub(crate) fn normalize(raw: &str) -> Result<String> {
    let absolute = raw.starts_with('/');

    let mut segments: Vec<&str> = Vec::new();
    for segment in raw.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(Error::PathEscapesRoot {
                        path: raw.to_string(),
                    });
                }
            }
            s => segments.push(s),
        }
    }

    let joined = segments.join("/");
    if absolute {
        Ok(format!("/{joined}"))
    } else {
        Ok(joined)
    }
}

// =============================================================================
// File and Directory Paths
// =============================================================================

/// A file path relative to the work directory (or absolute, for mount
/// targets).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FilePath {
    path: String,
}

impl FilePath {
    /// Creates a normalized file path. Empty paths and paths escaping the
    /// root are rejected.
    pub fn new(raw: impl AsRef<str>) -> Result<Self> {
        let path = normalize(raw.as_ref())?;
        if path.is_empty() || path == "/" {
            return Err(Error::InvalidPath {
                path: raw.as_ref().to_string(),
                reason: "file path cannot be empty".to_string(),
            });
        }

        Ok(Self { path })
    }

    /// The normalized slash-separated path.
    pub fn slash(&self) -> &str {
        &self.path
    }

    /// The final path segment.
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// The path with OS separators, for host filesystem use.
    pub fn fs_path(&self) -> PathBuf {
        PathBuf::from(&self.path)
    }

    /// Returns true if the path is absolute.
    pub fn is_absolute(&self) -> bool {
        self.path.starts_with('/')
    }
}

impl std::fmt::Display for FilePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_absolute() {
            write!(f, "{}", self.path)
        } else {
            write!(f, "./{}", self.path)
        }
    }
}

impl Serialize for FilePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry("file", &self.path)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for FilePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Repr {
            file: String,
        }

        let repr = Repr::deserialize(deserializer)?;
        FilePath::new(&repr.file).map_err(D::Error::custom)
    }
}

/// A directory path relative to the work directory (or absolute, for
/// mount targets). The empty path denotes the work directory itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DirPath {
    path: String,
}

impl DirPath {
    /// Creates a normalized directory path. `.` normalizes to the root.
    pub fn new(raw: impl AsRef<str>) -> Result<Self> {
        let path = normalize(raw.as_ref())?;
        Ok(Self { path })
    }

    /// The normalized slash-separated path. Empty for the root.
    pub fn slash(&self) -> &str {
        &self.path
    }

    /// The path with OS separators, for host filesystem use.
    pub fn fs_path(&self) -> PathBuf {
        if self.path.is_empty() {
            PathBuf::from(".")
        } else {
            PathBuf::from(&self.path)
        }
    }

    /// Returns true if the path is absolute.
    pub fn is_absolute(&self) -> bool {
        self.path.starts_with('/')
    }
}

impl std::fmt::Display for DirPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_absolute() {
            write!(f, "{}/", self.path)
        } else if self.path.is_empty() {
            write!(f, "./")
        } else {
            write!(f, "./{}/", self.path)
        }
    }
}

impl Serialize for DirPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry("dir", &self.path)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for DirPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Repr {
            dir: String,
        }

        let repr = Repr::deserialize(deserializer)?;
        DirPath::new(&repr.dir).map_err(D::Error::custom)
    }
}

/// Either a file or a directory path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileOrDirPath {
    File(FilePath),
    Dir(DirPath),
}

impl FileOrDirPath {
    /// Creates a file path variant.
    pub fn file(raw: impl AsRef<str>) -> Result<Self> {
        Ok(Self::File(FilePath::new(raw)?))
    }

    /// Creates a directory path variant.
    pub fn dir(raw: impl AsRef<str>) -> Result<Self> {
        Ok(Self::Dir(DirPath::new(raw)?))
    }

    /// The normalized slash-separated path.
    pub fn slash(&self) -> &str {
        match self {
            Self::File(f) => f.slash(),
            Self::Dir(d) => d.slash(),
        }
    }

    /// The path with OS separators.
    pub fn fs_path(&self) -> PathBuf {
        match self {
            Self::File(f) => f.fs_path(),
            Self::Dir(d) => d.fs_path(),
        }
    }

    /// Returns true for the directory variant.
    pub fn is_dir(&self) -> bool {
        matches!(self, Self::Dir(_))
    }

    /// Returns true if the path is absolute.
    pub fn is_absolute(&self) -> bool {
        match self {
            Self::File(f) => f.is_absolute(),
            Self::Dir(d) => d.is_absolute(),
        }
    }
}

impl std::fmt::Display for FileOrDirPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File(p) => p.fmt(f),
            Self::Dir(p) => p.fmt(f),
        }
    }
}

// =============================================================================
// Command Paths
// =============================================================================

/// A bare executable name resolved via `PATH` inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommandPath {
    command: String,
}

impl CommandPath {
    /// Creates a command path. Names containing `/` are file paths, not
    /// commands, and are rejected.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let command = name.into();
        if command.is_empty() || command.contains('/') {
            return Err(Error::InvalidPath {
                path: command,
                reason: "command must be a bare executable name".to_string(),
            });
        }

        Ok(Self { command })
    }

    /// The executable name.
    pub fn name(&self) -> &str {
        &self.command
    }
}

impl std::fmt::Display for CommandPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.command)
    }
}

impl Serialize for CommandPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry("command", &self.command)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for CommandPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Repr {
            command: String,
        }

        let repr = Repr::deserialize(deserializer)?;
        CommandPath::new(repr.command).map_err(D::Error::custom)
    }
}

// =============================================================================
// Host Paths
// =============================================================================

/// A directory on the dispatching machine plus a subpath within it.
///
/// The context directory is the unit the solver transfers; the subpath
/// selects within it, so two host paths under the same context share one
/// local-directory registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostPath {
    /// The context directory, as a host path.
    pub context: String,

    /// The subpath within the context directory.
    pub path: FileOrDirPath,
}

impl HostPath {
    /// Creates a host path. The subpath must be relative.
    pub fn new(context: impl Into<String>, path: FileOrDirPath) -> Result<Self> {
        if path.is_absolute() {
            return Err(Error::InvalidPath {
                path: path.slash().to_string(),
                reason: "host subpath must be relative".to_string(),
            });
        }

        Ok(Self {
            context: context.into(),
            path,
        })
    }
}

impl std::fmt::Display for HostPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.context, self.path.slash())
    }
}

// =============================================================================
// Embedded-Filesystem Paths
// =============================================================================

/// A path inside a virtual filesystem bundled with the dispatching
/// process. The filesystem itself travels out-of-band, keyed by id; see
/// [`crate::embedded`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FsPath {
    /// Registered embedded-filesystem id.
    #[serde(rename = "fs")]
    pub id: String,

    /// The subpath within the filesystem.
    pub path: FileOrDirPath,
}

impl FsPath {
    /// Creates an embedded-FS path. The subpath must be relative.
    pub fn new(id: impl Into<String>, path: FileOrDirPath) -> Result<Self> {
        if path.is_absolute() {
            return Err(Error::InvalidPath {
                path: path.slash().to_string(),
                reason: "embedded subpath must be relative".to_string(),
            });
        }

        Ok(Self {
            id: id.into(),
            path,
        })
    }
}

impl std::fmt::Display for FsPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:/{}", self.id, self.path.slash())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_resolves_dots() {
        assert_eq!(FilePath::new("a/./b/../c").unwrap().slash(), "a/c");
        assert_eq!(FilePath::new("a/c").unwrap(), FilePath::new("a/./b/../c").unwrap());
        assert_eq!(DirPath::new(".").unwrap().slash(), "");
        assert_eq!(DirPath::new("x//y/").unwrap().slash(), "x/y");
    }

    #[test]
    fn normalization_rejects_escape() {
        assert!(FilePath::new("../x").is_err());
        assert!(DirPath::new("a/../../b").is_err());
    }

    #[test]
    fn absolute_paths_are_preserved() {
        let target = DirPath::new("/run/secrets").unwrap();
        assert!(target.is_absolute());
        assert_eq!(target.slash(), "/run/secrets");
    }

    #[test]
    fn command_path_rejects_slashes() {
        assert!(CommandPath::new("bin/echo").is_err());
        assert_eq!(CommandPath::new("echo").unwrap().name(), "echo");
    }

    #[test]
    fn json_round_trip() {
        let fp = FilePath::new("sub/name").unwrap();
        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json, r#"{"file":"sub/name"}"#);
        assert_eq!(serde_json::from_str::<FilePath>(&json).unwrap(), fp);

        let fod: FileOrDirPath = serde_json::from_str(r#"{"dir":"a/./b"}"#).unwrap();
        assert_eq!(fod, FileOrDirPath::dir("a/b").unwrap());
    }

    #[test]
    fn host_subpath_must_be_relative() {
        assert!(HostPath::new("/ctx", FileOrDirPath::dir("/abs").unwrap()).is_err());
    }
}
