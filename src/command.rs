//! Shim payload construction.
//!
//! Before a thunk runs, its command, arguments, stdin, env, and mounts
//! are resolved into the JSON payload the in-container shim consumes
//! (written to the IO directory's `in` file). Path-valued inputs resolve
//! to container paths; thunk-output, host, and embedded paths induce
//! additional mounts at content-keyed targets so the resolved strings
//! stay stable across hosts.

use crate::error::{Error, Result};
use crate::path::{FileOrDirPath, FsPath, HostPath};
use crate::thunk::{MountSource, Thunk, ThunkCmd, ThunkPath};
use crate::value::Value;
use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Length of the content key prefixing induced mount targets.
const MOUNT_KEY_LEN: usize = 12;

/// The resolved form of a thunk's execution: the shim's input payload
/// plus every mount the container needs.
///
/// Serializes directly as the shim input JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command {
    /// Argv, with `args[0]` the resolved command.
    pub args: Vec<String>,

    /// Values written to the command's stdin as a JSON stream.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stdin: Vec<Value>,

    /// Resolved environment.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Working directory, relative to the work dir.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,

    /// Explicit thunk mounts followed by payload-induced ones.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<CommandMount>,
}

/// A mount descriptor in the shim payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandMount {
    /// The source, in the same tagged-variant encoding used on the wire.
    pub source: MountSource,

    /// The container target, rendered as a path string.
    #[serde(serialize_with = "serialize_target")]
    pub target: FileOrDirPath,
}

fn serialize_target<S: Serializer>(
    target: &FileOrDirPath,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&render_fod(target))
}

fn render_fod(path: &FileOrDirPath) -> String {
    let slash = path.slash();
    if path.is_absolute() {
        slash.to_string()
    } else if slash.is_empty() {
        "./".to_string()
    } else {
        format!("./{slash}")
    }
}

impl Command {
    /// Resolves a thunk into its shim payload and mount set.
    pub fn resolve(thunk: &Thunk) -> Result<Self> {
        let mut resolver = Resolver::default();

        // Explicit mounts first; induced mounts never displace them.
        for mount in &thunk.mounts {
            resolver.mounts.push(CommandMount {
                source: mount.source.clone(),
                target: mount.target.clone(),
            });
        }

        let mut args = vec![resolver.resolve_cmd(&thunk.cmd)?];
        for arg in &thunk.args {
            args.push(resolver.render(arg)?);
        }

        let mut stdin = Vec::with_capacity(thunk.stdin.len());
        for value in &thunk.stdin {
            stdin.push(resolver.resolve_value(value)?);
        }

        let mut env = BTreeMap::new();
        for (name, value) in &thunk.env {
            env.insert(name.clone(), resolver.render(value)?);
        }

        let dir = thunk.dir.as_ref().map(|d| {
            let slash = d.slash();
            if slash.is_empty() {
                "./".to_string()
            } else {
                format!("./{slash}")
            }
        });

        Ok(Command {
            args,
            stdin,
            env,
            dir,
            mounts: resolver.mounts,
        })
    }
}

/// Collects induced mounts while rendering values to container paths.
#[derive(Default)]
struct Resolver {
    mounts: Vec<CommandMount>,
}

impl Resolver {
    fn resolve_cmd(&mut self, cmd: &ThunkCmd) -> Result<String> {
        match cmd {
            ThunkCmd::Command(c) => Ok(c.name().to_string()),
            ThunkCmd::File(f) => Ok(f.to_string()),
            ThunkCmd::Thunk(tp) => {
                if tp.path.is_dir() {
                    return Err(Error::CommandNotAFile {
                        path: tp.path.slash().to_string(),
                    });
                }
                self.mount_thunk(tp)
            }
            ThunkCmd::Host(hp) => {
                if hp.path.is_dir() {
                    return Err(Error::CommandNotAFile {
                        path: hp.path.slash().to_string(),
                    });
                }
                self.mount_host(hp)
            }
            ThunkCmd::Fs(fp) => {
                if fp.path.is_dir() {
                    return Err(Error::CommandNotAFile {
                        path: fp.path.slash().to_string(),
                    });
                }
                self.mount_fs(fp)
            }
        }
    }

    /// Renders a value to its argument/env string, inducing mounts for
    /// out-of-container paths.
    fn render(&mut self, value: &Value) -> Result<String> {
        match value {
            Value::String(s) => Ok(s.clone()),
            Value::Bool(b) => Ok(b.to_string()),
            Value::Int(i) => Ok(i.to_string()),
            Value::Command(c) => Ok(c.name().to_string()),
            Value::File(f) => Ok(f.to_string()),
            Value::Dir(d) => Ok(d.to_string()),
            Value::ThunkPath(tp) => self.mount_thunk(tp),
            Value::Host(hp) => self.mount_host(hp),
            Value::Fs(fp) => self.mount_fs(fp),
            other => Err(Error::UnrenderableArg { kind: other.kind() }),
        }
    }

    /// Resolves paths nested inside stdin values, leaving structure
    /// intact.
    fn resolve_value(&mut self, value: &Value) -> Result<Value> {
        match value {
            Value::Null | Value::Bool(_) | Value::Int(_) | Value::String(_) => Ok(value.clone()),
            Value::Array(items) => {
                let resolved = items
                    .iter()
                    .map(|v| self.resolve_value(v))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Value::Array(resolved))
            }
            Value::Object(bindings) => {
                let mut resolved = BTreeMap::new();
                for (name, v) in bindings {
                    resolved.insert(name.clone(), self.resolve_value(v)?);
                }
                Ok(Value::Object(resolved))
            }
            path_like => Ok(Value::String(self.render(path_like)?)),
        }
    }

    fn mount_thunk(&mut self, tp: &ThunkPath) -> Result<String> {
        let key = mount_key(&[&tp.thunk.fingerprint()?, tp.path.slash()]);
        self.induce(MountSource::Thunk(tp.clone()), key, &tp.path)
    }

    fn mount_host(&mut self, hp: &HostPath) -> Result<String> {
        let key = mount_key(&[&hp.context, hp.path.slash()]);
        self.induce(MountSource::Host(hp.clone()), key, &hp.path)
    }

    fn mount_fs(&mut self, fp: &FsPath) -> Result<String> {
        let key = mount_key(&[&fp.id, fp.path.slash()]);
        self.induce(MountSource::Fs(fp.clone()), key, &fp.path)
    }

    fn induce(&mut self, source: MountSource, key: String, path: &FileOrDirPath) -> Result<String> {
        let sub = path.slash();
        let joined = if sub.is_empty() {
            key
        } else {
            format!("{key}/{sub}")
        };

        let target = if path.is_dir() {
            FileOrDirPath::dir(&joined)?
        } else {
            FileOrDirPath::file(&joined)?
        };

        let rendered = render_fod(&target);

        // The same path mounted twice resolves to the same target; keep
        // one descriptor.
        if !self
            .mounts
            .iter()
            .any(|m| m.source == source && m.target == target)
        {
            self.mounts.push(CommandMount { source, target });
        }

        Ok(rendered)
    }
}

/// Derives the stable 12-hex target key for an induced mount.
fn mount_key(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0]);
    }
    let mut key = hex::encode(hasher.finalize());
    key.truncate(MOUNT_KEY_LEN);
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::{CommandPath, DirPath, FilePath};
    use crate::platform::Platform;
    use crate::thunk::{ImageRef, ThunkImage};

    fn base() -> Thunk {
        Thunk::new(ThunkCmd::Command(CommandPath::new("go").unwrap())).with_image(
            ThunkImage::Ref(ImageRef::from_repository(Platform::linux(), "golang")),
        )
    }

    fn producer() -> Thunk {
        Thunk::new(ThunkCmd::Command(CommandPath::new("make").unwrap()))
    }

    #[test]
    fn strings_and_scalars_render_directly() {
        let thunk = base().with_args([Value::from("build"), Value::Int(2), Value::Bool(true)]);
        let cmd = Command::resolve(&thunk).unwrap();
        assert_eq!(cmd.args, vec!["go", "build", "2", "true"]);
        assert!(cmd.mounts.is_empty());
    }

    #[test]
    fn workdir_paths_render_relative() {
        let thunk = base().with_args([
            Value::File(FilePath::new("main.go").unwrap()),
            Value::Dir(DirPath::new("pkg").unwrap()),
        ]);
        let cmd = Command::resolve(&thunk).unwrap();
        assert_eq!(cmd.args[1], "./main.go");
        assert_eq!(cmd.args[2], "./pkg/");
    }

    #[test]
    fn thunk_paths_induce_stable_mounts() {
        let tp = ThunkPath::new(producer(), FileOrDirPath::file("out/bin").unwrap()).unwrap();
        let thunk = base().with_args([Value::ThunkPath(tp.clone())]);

        let a = Command::resolve(&thunk).unwrap();
        let b = Command::resolve(&thunk).unwrap();
        assert_eq!(a, b);

        assert_eq!(a.mounts.len(), 1);
        assert!(a.args[1].starts_with("./"));
        assert!(a.args[1].ends_with("/out/bin"));

        // Same path twice, one mount.
        let doubled = base().with_args([Value::ThunkPath(tp.clone()), Value::ThunkPath(tp)]);
        let cmd = Command::resolve(&doubled).unwrap();
        assert_eq!(cmd.mounts.len(), 1);
        assert_eq!(cmd.args[1], cmd.args[2]);
    }

    #[test]
    fn explicit_mounts_come_first() {
        let tp = ThunkPath::new(producer(), FileOrDirPath::dir("out").unwrap()).unwrap();
        let thunk = base()
            .with_mount(
                MountSource::Thunk(tp.clone()),
                FileOrDirPath::dir("deps").unwrap(),
            )
            .with_args([Value::ThunkPath(tp)]);

        let cmd = Command::resolve(&thunk).unwrap();
        assert_eq!(cmd.mounts.len(), 2);
        assert_eq!(cmd.mounts[0].target, FileOrDirPath::dir("deps").unwrap());
    }

    #[test]
    fn unrenderable_args_error() {
        let thunk = base().with_args([Value::Null]);
        assert!(Command::resolve(&thunk).is_err());
    }

    #[test]
    fn stdin_paths_resolve_in_place() {
        let mut resolver = Resolver::default();
        let value = Value::Array(vec![
            Value::from("plain"),
            Value::File(FilePath::new("f.txt").unwrap()),
        ]);
        let resolved = resolver.resolve_value(&value).unwrap();
        assert_eq!(
            resolved,
            Value::Array(vec![Value::from("plain"), Value::from("./f.txt")])
        );
    }

    #[test]
    fn payload_json_shape() {
        let thunk = base()
            .with_args([Value::from("version")])
            .with_env("CGO_ENABLED", "0")
            .with_dir(DirPath::new("src").unwrap());

        let cmd = Command::resolve(&thunk).unwrap();
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["args"][0], "go");
        assert_eq!(json["env"]["CGO_ENABLED"], "0");
        assert_eq!(json["dir"], "./src");
    }
}
