//! Wire serialization of thunks and values.
//!
//! A hand-annotated protobuf schema mirroring the tagged-variant model:
//! every closed sum is a `oneof`, binding lists are sorted by name, and
//! arrays preserve insertion order, so encoding is deterministic and
//! `decode(encode(t)) == t` for every constructible thunk.
//!
//! Unlike the JSON encodings, the wire `Secret` carries its bytes: the
//! schema is a transport, not a canonical form, and fingerprints are
//! never computed from it.

use crate::error::{Error, Result};
use crate::path;
use crate::platform;
use crate::thunk;
use crate::value;
use prost::Message as _;

// =============================================================================
// Schema
// =============================================================================

#[derive(Clone, PartialEq, prost::Message)]
pub struct Value {
    #[prost(oneof = "value_kind::Kind", tags = "1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14")]
    pub kind: Option<value_kind::Kind>,
}

/// Oneof arms for [`Value`].
pub mod value_kind {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        Null(super::Null),
        #[prost(bool, tag = "2")]
        Bool(bool),
        #[prost(int64, tag = "3")]
        Int(i64),
        #[prost(string, tag = "4")]
        Str(String),
        #[prost(message, tag = "5")]
        Secret(super::Secret),
        #[prost(message, tag = "6")]
        File(super::FilePath),
        #[prost(message, tag = "7")]
        Dir(super::DirPath),
        #[prost(message, tag = "8")]
        Command(super::CommandPath),
        #[prost(message, tag = "9")]
        Host(super::HostPath),
        #[prost(message, tag = "10")]
        Fs(super::FsPath),
        #[prost(message, tag = "11")]
        ThunkPath(super::ThunkPath),
        #[prost(message, tag = "12")]
        Thunk(Box<super::Thunk>),
        #[prost(message, tag = "13")]
        Array(super::Array),
        #[prost(message, tag = "14")]
        Object(super::Object),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Null {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Array {
    #[prost(message, repeated, tag = "1")]
    pub values: Vec<Value>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Object {
    /// Sorted by name.
    #[prost(message, repeated, tag = "1")]
    pub bindings: Vec<Binding>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Binding {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, optional, tag = "2")]
    pub value: Option<Value>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct FilePath {
    #[prost(string, tag = "1")]
    pub path: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DirPath {
    #[prost(string, tag = "1")]
    pub path: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct FilesystemPath {
    #[prost(oneof = "filesystem_path::Path", tags = "1, 2")]
    pub path: Option<filesystem_path::Path>,
}

pub mod filesystem_path {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Path {
        #[prost(message, tag = "1")]
        File(super::FilePath),
        #[prost(message, tag = "2")]
        Dir(super::DirPath),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CommandPath {
    #[prost(string, tag = "1")]
    pub command: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HostPath {
    #[prost(string, tag = "1")]
    pub context: String,
    #[prost(message, optional, tag = "2")]
    pub path: Option<FilesystemPath>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct FsPath {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(message, optional, tag = "2")]
    pub path: Option<FilesystemPath>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ThunkPath {
    #[prost(message, optional, tag = "1")]
    pub thunk: Option<Box<Thunk>>,
    #[prost(message, optional, tag = "2")]
    pub path: Option<FilesystemPath>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CachePath {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(message, optional, tag = "2")]
    pub path: Option<FilesystemPath>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Secret {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Platform {
    #[prost(string, tag = "1")]
    pub os: String,
    /// Empty matches any architecture.
    #[prost(string, tag = "2")]
    pub arch: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ThunkImageRef {
    #[prost(message, optional, tag = "1")]
    pub platform: Option<Platform>,
    #[prost(oneof = "thunk_image_ref::Source", tags = "2, 3")]
    pub source: Option<thunk_image_ref::Source>,
    #[prost(string, optional, tag = "4")]
    pub tag: Option<String>,
    #[prost(string, optional, tag = "5")]
    pub digest: Option<String>,
}

pub mod thunk_image_ref {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Source {
        #[prost(string, tag = "2")]
        Repository(String),
        #[prost(message, tag = "3")]
        File(super::ThunkPath),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ThunkImage {
    #[prost(oneof = "thunk_image::Image", tags = "1, 2")]
    pub image: Option<thunk_image::Image>,
}

pub mod thunk_image {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Image {
        #[prost(message, tag = "1")]
        Ref(super::ThunkImageRef),
        #[prost(message, tag = "2")]
        Parent(Box<super::Thunk>),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ThunkCmd {
    #[prost(oneof = "thunk_cmd::Cmd", tags = "1, 2, 3, 4, 5")]
    pub cmd: Option<thunk_cmd::Cmd>,
}

pub mod thunk_cmd {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Cmd {
        #[prost(message, tag = "1")]
        Command(super::CommandPath),
        #[prost(message, tag = "2")]
        File(super::FilePath),
        #[prost(message, tag = "3")]
        Thunk(super::ThunkPath),
        #[prost(message, tag = "4")]
        Host(super::HostPath),
        #[prost(message, tag = "5")]
        Fs(super::FsPath),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ThunkMountSource {
    #[prost(oneof = "thunk_mount_source::Source", tags = "1, 2, 3, 4, 5")]
    pub source: Option<thunk_mount_source::Source>,
}

pub mod thunk_mount_source {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Source {
        #[prost(message, tag = "1")]
        Thunk(super::ThunkPath),
        #[prost(message, tag = "2")]
        Host(super::HostPath),
        #[prost(message, tag = "3")]
        Fs(super::FsPath),
        #[prost(message, tag = "4")]
        Cache(super::CachePath),
        #[prost(message, tag = "5")]
        Secret(super::Secret),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ThunkMount {
    #[prost(message, optional, tag = "1")]
    pub source: Option<ThunkMountSource>,
    #[prost(message, optional, tag = "2")]
    pub target: Option<FilesystemPath>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Thunk {
    #[prost(message, optional, tag = "1")]
    pub image: Option<ThunkImage>,
    #[prost(message, optional, tag = "2")]
    pub cmd: Option<ThunkCmd>,
    #[prost(message, repeated, tag = "3")]
    pub args: Vec<Value>,
    #[prost(message, repeated, tag = "4")]
    pub stdin: Vec<Value>,
    /// Sorted by name.
    #[prost(message, repeated, tag = "5")]
    pub env: Vec<Binding>,
    #[prost(message, optional, tag = "6")]
    pub dir: Option<DirPath>,
    #[prost(message, repeated, tag = "7")]
    pub mounts: Vec<ThunkMount>,
    /// Sorted by name.
    #[prost(message, repeated, tag = "8")]
    pub labels: Vec<Binding>,
    #[prost(bool, tag = "9")]
    pub insecure: bool,
}

// =============================================================================
// Encoding Entry Points
// =============================================================================

/// Encodes a thunk for the wire.
pub fn encode_thunk(thunk: &thunk::Thunk) -> Result<Vec<u8>> {
    Ok(thunk_to_proto(thunk)?.encode_to_vec())
}

/// Decodes a thunk from the wire.
pub fn decode_thunk(bytes: &[u8]) -> Result<thunk::Thunk> {
    thunk_from_proto(&Thunk::decode(bytes)?)
}

// =============================================================================
// Model → Proto
// =============================================================================

pub fn thunk_to_proto(t: &thunk::Thunk) -> Result<Thunk> {
    Ok(Thunk {
        image: t.image.as_ref().map(image_to_proto).transpose()?,
        cmd: Some(cmd_to_proto(&t.cmd)?),
        args: t.args.iter().map(value_to_proto).collect::<Result<_>>()?,
        stdin: t.stdin.iter().map(value_to_proto).collect::<Result<_>>()?,
        env: bindings_to_proto(&t.env)?,
        dir: t.dir.as_ref().map(|d| DirPath {
            path: d.slash().to_string(),
        }),
        mounts: t.mounts.iter().map(mount_to_proto).collect::<Result<_>>()?,
        labels: bindings_to_proto(&t.labels)?,
        insecure: t.insecure,
    })
}

fn bindings_to_proto(bindings: &value::Bindings) -> Result<Vec<Binding>> {
    bindings
        .iter()
        .map(|(name, v)| {
            Ok(Binding {
                name: name.clone(),
                value: Some(value_to_proto(v)?),
            })
        })
        .collect()
}

pub fn value_to_proto(v: &value::Value) -> Result<Value> {
    use value_kind::Kind;

    let kind = match v {
        value::Value::Null => Kind::Null(Null {}),
        value::Value::Bool(b) => Kind::Bool(*b),
        value::Value::Int(i) => Kind::Int(*i),
        value::Value::String(s) => Kind::Str(s.clone()),
        value::Value::Secret(s) => Kind::Secret(secret_to_proto(s)),
        value::Value::File(f) => Kind::File(FilePath {
            path: f.slash().to_string(),
        }),
        value::Value::Dir(d) => Kind::Dir(DirPath {
            path: d.slash().to_string(),
        }),
        value::Value::Command(c) => Kind::Command(CommandPath {
            command: c.name().to_string(),
        }),
        value::Value::Host(h) => Kind::Host(host_to_proto(h)),
        value::Value::Fs(f) => Kind::Fs(fs_to_proto(f)),
        value::Value::ThunkPath(tp) => Kind::ThunkPath(thunk_path_to_proto(tp)?),
        value::Value::Thunk(t) => Kind::Thunk(Box::new(thunk_to_proto(t)?)),
        value::Value::Array(items) => Kind::Array(Array {
            values: items.iter().map(value_to_proto).collect::<Result<_>>()?,
        }),
        value::Value::Object(bindings) => Kind::Object(Object {
            bindings: bindings_to_proto(bindings)?,
        }),
    };

    Ok(Value { kind: Some(kind) })
}

fn secret_to_proto(s: &value::Secret) -> Secret {
    Secret {
        name: s.name().to_string(),
        value: s.reveal().to_vec(),
    }
}

fn fod_to_proto(path: &path::FileOrDirPath) -> FilesystemPath {
    let arm = match path {
        path::FileOrDirPath::File(f) => filesystem_path::Path::File(FilePath {
            path: f.slash().to_string(),
        }),
        path::FileOrDirPath::Dir(d) => filesystem_path::Path::Dir(DirPath {
            path: d.slash().to_string(),
        }),
    };

    FilesystemPath { path: Some(arm) }
}

fn host_to_proto(h: &path::HostPath) -> HostPath {
    HostPath {
        context: h.context.clone(),
        path: Some(fod_to_proto(&h.path)),
    }
}

fn fs_to_proto(f: &path::FsPath) -> FsPath {
    FsPath {
        id: f.id.clone(),
        path: Some(fod_to_proto(&f.path)),
    }
}

fn thunk_path_to_proto(tp: &thunk::ThunkPath) -> Result<ThunkPath> {
    Ok(ThunkPath {
        thunk: Some(Box::new(thunk_to_proto(&tp.thunk)?)),
        path: Some(fod_to_proto(&tp.path)),
    })
}

fn platform_to_proto(p: &platform::Platform) -> Platform {
    Platform {
        os: p.os.clone(),
        arch: p.arch.clone().unwrap_or_default(),
    }
}

fn image_to_proto(image: &thunk::ThunkImage) -> Result<ThunkImage> {
    let arm = match image {
        thunk::ThunkImage::Ref(r) => thunk_image::Image::Ref(image_ref_to_proto(r)?),
        thunk::ThunkImage::Parent(t) => thunk_image::Image::Parent(Box::new(thunk_to_proto(t)?)),
    };

    Ok(ThunkImage { image: Some(arm) })
}

fn image_ref_to_proto(r: &thunk::ImageRef) -> Result<ThunkImageRef> {
    let source = match (&r.repository, &r.file) {
        (Some(repo), None) => thunk_image_ref::Source::Repository(repo.clone()),
        (None, Some(file)) => thunk_image_ref::Source::File(thunk_path_to_proto(file)?),
        _ => return Err(Error::WireMissing { field: "image ref source" }),
    };

    Ok(ThunkImageRef {
        platform: Some(platform_to_proto(&r.platform)),
        source: Some(source),
        tag: r.tag.clone(),
        digest: r.digest.clone(),
    })
}

fn cmd_to_proto(cmd: &thunk::ThunkCmd) -> Result<ThunkCmd> {
    use thunk_cmd::Cmd;

    let arm = match cmd {
        thunk::ThunkCmd::Command(c) => Cmd::Command(CommandPath {
            command: c.name().to_string(),
        }),
        thunk::ThunkCmd::File(f) => Cmd::File(FilePath {
            path: f.slash().to_string(),
        }),
        thunk::ThunkCmd::Thunk(tp) => Cmd::Thunk(thunk_path_to_proto(tp)?),
        thunk::ThunkCmd::Host(h) => Cmd::Host(host_to_proto(h)),
        thunk::ThunkCmd::Fs(f) => Cmd::Fs(fs_to_proto(f)),
    };

    Ok(ThunkCmd { cmd: Some(arm) })
}

fn mount_to_proto(mount: &thunk::ThunkMount) -> Result<ThunkMount> {
    use thunk_mount_source::Source;

    let source = match &mount.source {
        thunk::MountSource::Thunk(tp) => Source::Thunk(thunk_path_to_proto(tp)?),
        thunk::MountSource::Host(h) => Source::Host(host_to_proto(h)),
        thunk::MountSource::Fs(f) => Source::Fs(fs_to_proto(f)),
        thunk::MountSource::Cache(c) => Source::Cache(CachePath {
            id: c.id.clone(),
            path: Some(fod_to_proto(&c.path)),
        }),
        thunk::MountSource::Secret(s) => Source::Secret(secret_to_proto(s)),
    };

    Ok(ThunkMount {
        source: Some(ThunkMountSource {
            source: Some(source),
        }),
        target: Some(fod_to_proto(&mount.target)),
    })
}

// =============================================================================
// Proto → Model
// =============================================================================

pub fn thunk_from_proto(p: &Thunk) -> Result<thunk::Thunk> {
    let cmd = p
        .cmd
        .as_ref()
        .ok_or(Error::WireMissing { field: "thunk cmd" })?;

    Ok(thunk::Thunk {
        image: p.image.as_ref().map(image_from_proto).transpose()?,
        cmd: cmd_from_proto(cmd)?,
        args: p.args.iter().map(value_from_proto).collect::<Result<_>>()?,
        stdin: p.stdin.iter().map(value_from_proto).collect::<Result<_>>()?,
        env: bindings_from_proto(&p.env)?,
        dir: p
            .dir
            .as_ref()
            .map(|d| path::DirPath::new(&d.path))
            .transpose()?,
        mounts: p.mounts.iter().map(mount_from_proto).collect::<Result<_>>()?,
        labels: bindings_from_proto(&p.labels)?,
        insecure: p.insecure,
    })
}

fn bindings_from_proto(bindings: &[Binding]) -> Result<value::Bindings> {
    let mut out = value::Bindings::new();
    for binding in bindings {
        let v = binding
            .value
            .as_ref()
            .ok_or(Error::WireMissing { field: "binding value" })?;
        out.insert(binding.name.clone(), value_from_proto(v)?);
    }
    Ok(out)
}

pub fn value_from_proto(v: &Value) -> Result<value::Value> {
    use value_kind::Kind;

    let kind = v
        .kind
        .as_ref()
        .ok_or(Error::WireMissing { field: "value kind" })?;

    Ok(match kind {
        Kind::Null(_) => value::Value::Null,
        Kind::Bool(b) => value::Value::Bool(*b),
        Kind::Int(i) => value::Value::Int(*i),
        Kind::Str(s) => value::Value::String(s.clone()),
        Kind::Secret(s) => value::Value::Secret(secret_from_proto(s)),
        Kind::File(f) => value::Value::File(path::FilePath::new(&f.path)?),
        Kind::Dir(d) => value::Value::Dir(path::DirPath::new(&d.path)?),
        Kind::Command(c) => value::Value::Command(path::CommandPath::new(c.command.clone())?),
        Kind::Host(h) => value::Value::Host(host_from_proto(h)?),
        Kind::Fs(f) => value::Value::Fs(fs_from_proto(f)?),
        Kind::ThunkPath(tp) => value::Value::ThunkPath(thunk_path_from_proto(tp)?),
        Kind::Thunk(t) => value::Value::Thunk(Box::new(thunk_from_proto(t)?)),
        Kind::Array(a) => value::Value::Array(
            a.values
                .iter()
                .map(value_from_proto)
                .collect::<Result<_>>()?,
        ),
        Kind::Object(o) => value::Value::Object(bindings_from_proto(&o.bindings)?),
    })
}

fn secret_from_proto(s: &Secret) -> value::Secret {
    value::Secret::new(s.name.clone(), s.value.clone())
}

fn fod_from_proto(p: &FilesystemPath) -> Result<path::FileOrDirPath> {
    match p
        .path
        .as_ref()
        .ok_or(Error::WireMissing { field: "filesystem path" })?
    {
        filesystem_path::Path::File(f) => path::FileOrDirPath::file(&f.path),
        filesystem_path::Path::Dir(d) => path::FileOrDirPath::dir(&d.path),
    }
}

fn host_from_proto(h: &HostPath) -> Result<path::HostPath> {
    let fod = h
        .path
        .as_ref()
        .ok_or(Error::WireMissing { field: "host path" })?;
    path::HostPath::new(h.context.clone(), fod_from_proto(fod)?)
}

fn fs_from_proto(f: &FsPath) -> Result<path::FsPath> {
    let fod = f
        .path
        .as_ref()
        .ok_or(Error::WireMissing { field: "fs path" })?;
    path::FsPath::new(f.id.clone(), fod_from_proto(fod)?)
}

fn thunk_path_from_proto(tp: &ThunkPath) -> Result<thunk::ThunkPath> {
    let inner = tp
        .thunk
        .as_ref()
        .ok_or(Error::WireMissing { field: "thunk path thunk" })?;
    let fod = tp
        .path
        .as_ref()
        .ok_or(Error::WireMissing { field: "thunk path path" })?;

    thunk::ThunkPath::new(thunk_from_proto(inner)?, fod_from_proto(fod)?)
}

fn platform_from_proto(p: &Platform) -> platform::Platform {
    platform::Platform {
        os: p.os.clone(),
        arch: if p.arch.is_empty() {
            None
        } else {
            Some(p.arch.clone())
        },
    }
}

fn image_from_proto(image: &ThunkImage) -> Result<thunk::ThunkImage> {
    match image
        .image
        .as_ref()
        .ok_or(Error::WireMissing { field: "thunk image" })?
    {
        thunk_image::Image::Ref(r) => Ok(thunk::ThunkImage::Ref(image_ref_from_proto(r)?)),
        thunk_image::Image::Parent(t) => Ok(thunk::ThunkImage::Parent(Box::new(
            thunk_from_proto(t)?,
        ))),
    }
}

fn image_ref_from_proto(r: &ThunkImageRef) -> Result<thunk::ImageRef> {
    let platform = r
        .platform
        .as_ref()
        .map(platform_from_proto)
        .ok_or(Error::WireMissing { field: "image ref platform" })?;

    let (repository, file) = match r
        .source
        .as_ref()
        .ok_or(Error::WireMissing { field: "image ref source" })?
    {
        thunk_image_ref::Source::Repository(repo) => (Some(repo.clone()), None),
        thunk_image_ref::Source::File(tp) => (None, Some(thunk_path_from_proto(tp)?)),
    };

    Ok(thunk::ImageRef {
        platform,
        repository,
        file,
        tag: r.tag.clone(),
        digest: r.digest.clone(),
    })
}

fn cmd_from_proto(cmd: &ThunkCmd) -> Result<thunk::ThunkCmd> {
    use thunk_cmd::Cmd;

    match cmd
        .cmd
        .as_ref()
        .ok_or(Error::WireMissing { field: "thunk cmd" })?
    {
        Cmd::Command(c) => Ok(thunk::ThunkCmd::Command(path::CommandPath::new(
            c.command.clone(),
        )?)),
        Cmd::File(f) => Ok(thunk::ThunkCmd::File(path::FilePath::new(&f.path)?)),
        Cmd::Thunk(tp) => Ok(thunk::ThunkCmd::Thunk(thunk_path_from_proto(tp)?)),
        Cmd::Host(h) => Ok(thunk::ThunkCmd::Host(host_from_proto(h)?)),
        Cmd::Fs(f) => Ok(thunk::ThunkCmd::Fs(fs_from_proto(f)?)),
    }
}

fn mount_from_proto(mount: &ThunkMount) -> Result<thunk::ThunkMount> {
    use thunk_mount_source::Source;

    let source = match mount
        .source
        .as_ref()
        .and_then(|s| s.source.as_ref())
        .ok_or(Error::WireMissing { field: "mount source" })?
    {
        Source::Thunk(tp) => thunk::MountSource::Thunk(thunk_path_from_proto(tp)?),
        Source::Host(h) => thunk::MountSource::Host(host_from_proto(h)?),
        Source::Fs(f) => thunk::MountSource::Fs(fs_from_proto(f)?),
        Source::Cache(c) => {
            let fod = c
                .path
                .as_ref()
                .ok_or(Error::WireMissing { field: "cache path" })?;
            let path = fod_from_proto(fod)?;

            // The id is authoritative; older encodings carried only the
            // path.
            let id = if c.id.is_empty() {
                let slash = path.slash();
                if slash.is_empty() {
                    ".".to_string()
                } else {
                    slash.to_string()
                }
            } else {
                c.id.clone()
            };

            thunk::MountSource::Cache(thunk::CachePath::new(id, path))
        }
        Source::Secret(s) => thunk::MountSource::Secret(secret_from_proto(s)),
    };

    let target = mount
        .target
        .as_ref()
        .ok_or(Error::WireMissing { field: "mount target" })?;

    Ok(thunk::ThunkMount {
        source,
        target: fod_from_proto(target)?,
    })
}
