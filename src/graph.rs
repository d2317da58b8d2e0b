//! The build graph: an immutable DAG of operations the solver
//! materializes into filesystems.
//!
//! Nodes are shared behind `Arc` and never mutated after construction;
//! composition always allocates. A [`State`] addresses one output of a
//! node (an exec op has one output per bind mount besides its rootfs)
//! and may carry environment additions that apply when the state becomes
//! the root of a later exec.
//!
//! # Marshaling
//!
//! [`marshal`] flattens a state into a [`Definition`]: a topologically
//! sorted list of serialized ops, each identified by the SHA-256 of its
//! canonical serialization with inputs replaced by digests. The op
//! digest is the solver's cache key, so everything influencing execution
//! (args, env, hostname, mount shape) must appear in the serialized
//! form.

use crate::error::Result;
use crate::platform::Platform;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

// =============================================================================
// Nodes
// =============================================================================

#[derive(Debug)]
enum Node {
    Scratch,
    Image(ImageOp),
    Local(LocalOp),
    File(FileOp),
    Exec(ExecOp),
}

#[derive(Debug)]
struct ImageOp {
    reference: String,
    digest: Option<String>,
    platform: Platform,
}

/// A directory transferred from the dispatching machine, identified by
/// its context-dir name in the solve's local-directory table.
#[derive(Debug)]
struct LocalOp {
    name: String,
    excludes: Vec<String>,
    /// Compare metadata only when diffing repeat transfers.
    metadata_diff: bool,
}

#[derive(Debug)]
struct FileOp {
    base: State,
    actions: Vec<FileAction>,
    custom_name: Option<String>,
}

/// A filesystem mutation applied by a file op.
#[derive(Debug, Clone)]
pub enum FileAction {
    Mkdir {
        path: String,
        mode: u32,
        make_parents: bool,
    },
    Mkfile {
        path: String,
        mode: u32,
        data: Vec<u8>,
    },
    Copy {
        src: State,
        src_path: String,
        dest_path: String,
        dir_contents_only: bool,
        create_dest_path: bool,
    },
}

#[derive(Debug)]
struct ExecOp {
    root: State,
    args: Vec<String>,
    env: Vec<(String, String)>,
    cwd: String,
    hostname: String,
    custom_name: String,
    insecure: bool,
    cgroup_parent: Option<String>,
    ignore_cache: bool,
    mounts: Vec<ExecMount>,
}

/// A non-root mount on an exec op.
#[derive(Debug, Clone)]
pub struct ExecMount {
    pub target: String,
    pub kind: MountKind,
}

/// What backs an exec mount.
#[derive(Debug, Clone)]
pub enum MountKind {
    /// Content from another state, optionally narrowed to a subpath.
    Bind {
        input: State,
        source_sub: String,
        read_only: bool,
    },
    /// An ephemeral tmpfs.
    Tmpfs,
    /// A persistent cache directory. `locked` admits one holder at a
    /// time; other solves block until release.
    Cache { id: String, locked: bool },
    /// A secret file, materialized from the session's secret table.
    Secret { id: String },
}

// =============================================================================
// States
// =============================================================================

/// One output of a graph node, plus environment additions applied when
/// this state roots a later exec.
#[derive(Debug, Clone)]
pub struct State {
    node: Arc<Node>,
    output: usize,
    env: Vec<(String, String)>,
}

impl State {
    /// An empty filesystem.
    pub fn scratch() -> Self {
        Self::from_node(Node::Scratch)
    }

    /// A registry image, pinned to a digest when one is known.
    pub fn image(reference: impl Into<String>, digest: Option<String>, platform: Platform) -> Self {
        Self::from_node(Node::Image(ImageOp {
            reference: reference.into(),
            digest,
            platform,
        }))
    }

    /// A local directory transfer with ignore patterns.
    pub fn local(
        name: impl Into<String>,
        excludes: Vec<String>,
        metadata_diff: bool,
    ) -> Self {
        Self::from_node(Node::Local(LocalOp {
            name: name.into(),
            excludes,
            metadata_diff,
        }))
    }

    fn from_node(node: Node) -> Self {
        Self {
            node: Arc::new(node),
            output: 0,
            env: Vec::new(),
        }
    }

    /// Applies file actions, producing a new state.
    pub fn file(&self, actions: Vec<FileAction>, custom_name: Option<String>) -> Self {
        Self::from_node(Node::File(FileOp {
            base: self.clone(),
            actions,
            custom_name,
        }))
    }

    /// Shorthand for a single file action.
    pub fn file_action(&self, action: FileAction, custom_name: impl Into<String>) -> Self {
        self.file(vec![action], Some(custom_name.into()))
    }

    /// Adds an environment binding applied when this state roots an
    /// exec (e.g. env inherited from an unpacked image config).
    #[must_use]
    pub fn add_env(&self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.env.push((name.into(), value.into()));
        next
    }

    /// Starts building an exec op rooted at this state.
    pub fn exec(&self, args: Vec<String>) -> ExecBuilder {
        ExecBuilder {
            root: self.clone(),
            args,
            env: Vec::new(),
            cwd: "/".to_string(),
            hostname: String::new(),
            custom_name: String::new(),
            insecure: false,
            cgroup_parent: None,
            ignore_cache: false,
            mounts: Vec::new(),
        }
    }
}

/// Builder for exec ops, mirroring the run-option style of the solver's
/// graph API.
pub struct ExecBuilder {
    root: State,
    args: Vec<String>,
    env: Vec<(String, String)>,
    cwd: String,
    hostname: String,
    custom_name: String,
    insecure: bool,
    cgroup_parent: Option<String>,
    ignore_cache: bool,
    mounts: Vec<ExecMount>,
}

impl ExecBuilder {
    /// Adds an environment binding.
    #[must_use]
    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((name.into(), value.into()));
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn cwd(mut self, dir: impl Into<String>) -> Self {
        self.cwd = dir.into();
        self
    }

    /// Sets the container hostname. Load-bearing for caching: the
    /// hostname is part of the op's content identity.
    #[must_use]
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Sets the progress display name.
    #[must_use]
    pub fn custom_name(mut self, name: impl Into<String>) -> Self {
        self.custom_name = name.into();
        self
    }

    /// Requests insecure security mode under the given cgroup parent.
    #[must_use]
    pub fn insecure(mut self, cgroup_parent: impl Into<String>) -> Self {
        self.insecure = true;
        self.cgroup_parent = Some(cgroup_parent.into());
        self
    }

    /// Excludes this op from the solver cache.
    #[must_use]
    pub fn ignore_cache(mut self, ignore: bool) -> Self {
        self.ignore_cache = ignore;
        self
    }

    /// Adds a mount.
    #[must_use]
    pub fn mount(mut self, target: impl Into<String>, kind: MountKind) -> Self {
        self.mounts.push(ExecMount {
            target: target.into(),
            kind,
        });
        self
    }

    /// Adds a bind mount.
    #[must_use]
    pub fn bind(self, target: impl Into<String>, input: State, source_sub: impl Into<String>) -> Self {
        self.mount(
            target,
            MountKind::Bind {
                input,
                source_sub: source_sub.into(),
                read_only: false,
            },
        )
    }

    /// Adds a read-only bind mount.
    #[must_use]
    pub fn bind_ro(
        self,
        target: impl Into<String>,
        input: State,
        source_sub: impl Into<String>,
    ) -> Self {
        self.mount(
            target,
            MountKind::Bind {
                input,
                source_sub: source_sub.into(),
                read_only: true,
            },
        )
    }

    /// Finalizes the exec op. Root-state env additions precede the
    /// builder's own.
    pub fn build(self) -> ExecState {
        let mut env = self.root.env.clone();
        env.extend(self.env);

        ExecState {
            node: Arc::new(Node::Exec(ExecOp {
                root: self.root,
                args: self.args,
                env,
                cwd: self.cwd,
                hostname: self.hostname,
                custom_name: self.custom_name,
                insecure: self.insecure,
                cgroup_parent: self.cgroup_parent,
                ignore_cache: self.ignore_cache,
                mounts: self.mounts,
            })),
        }
    }
}

/// A finalized exec op; addresses its rootfs and mount outputs.
#[derive(Debug, Clone)]
pub struct ExecState {
    node: Arc<Node>,
}

impl ExecState {
    /// The rootfs after the exec runs.
    pub fn root(&self) -> State {
        State {
            node: self.node.clone(),
            output: 0,
            env: Vec::new(),
        }
    }

    /// The content of the bind mount at `target` after the exec runs.
    pub fn get_mount(&self, target: &str) -> Result<State> {
        let Node::Exec(op) = &*self.node else {
            unreachable!("exec state always wraps an exec node");
        };

        let mut output = 0;
        for mount in &op.mounts {
            if let MountKind::Bind { .. } = mount.kind {
                output += 1;
                if mount.target == target {
                    return Ok(State {
                        node: self.node.clone(),
                        output,
                        env: Vec::new(),
                    });
                }
            }
        }

        Err(crate::error::Error::InvalidPath {
            path: target.to_string(),
            reason: "no bind mount at target".to_string(),
        })
    }
}

// =============================================================================
// Marshaling
// =============================================================================

/// A marshaled build graph, ready for submission to the solver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Definition {
    /// Topologically sorted ops; inputs precede dependents.
    pub ops: Vec<MarshaledOp>,

    /// The output the solve materializes.
    pub root: OpRef,
}

/// One serialized op, identified by the digest of its serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarshaledOp {
    pub digest: String,
    pub op: serde_json::Value,
}

/// A reference to one output of a marshaled op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpRef {
    pub digest: String,
    pub output: usize,
}

/// Flattens a state into a content-addressed definition.
pub fn marshal(state: &State) -> Result<Definition> {
    let mut cx = Marshal {
        memo: HashMap::new(),
        ops: Vec::new(),
    };
    let root = cx.visit(state)?;
    Ok(Definition { ops: cx.ops, root })
}

struct Marshal {
    memo: HashMap<*const Node, String>,
    ops: Vec<MarshaledOp>,
}

impl Marshal {
    fn visit(&mut self, state: &State) -> Result<OpRef> {
        let digest = self.visit_node(&state.node)?;
        Ok(OpRef {
            digest,
            output: state.output,
        })
    }

    fn visit_node(&mut self, node: &Arc<Node>) -> Result<String> {
        let key = Arc::as_ptr(node);
        if let Some(digest) = self.memo.get(&key) {
            return Ok(digest.clone());
        }

        let op = match &**node {
            Node::Scratch => json!({ "scratch": {} }),
            Node::Image(img) => json!({
                "image": {
                    "ref": img.reference,
                    "digest": img.digest,
                    "platform": img.platform,
                }
            }),
            Node::Local(local) => json!({
                "local": {
                    "name": local.name,
                    "excludes": local.excludes,
                    "metadata_diff": local.metadata_diff,
                }
            }),
            Node::File(file) => {
                let base = self.visit(&file.base)?;
                let mut actions = Vec::with_capacity(file.actions.len());
                for action in &file.actions {
                    actions.push(self.marshal_action(action)?);
                }
                json!({
                    "file": {
                        "input": base,
                        "actions": actions,
                        "name": file.custom_name,
                    }
                })
            }
            Node::Exec(exec) => {
                let root = self.visit(&exec.root)?;
                let mut mounts = Vec::with_capacity(exec.mounts.len());
                for mount in &exec.mounts {
                    mounts.push(self.marshal_mount(mount)?);
                }
                json!({
                    "exec": {
                        "input": root,
                        "args": exec.args,
                        "env": exec.env,
                        "cwd": exec.cwd,
                        "hostname": exec.hostname,
                        "name": exec.custom_name,
                        "insecure": exec.insecure,
                        "cgroup_parent": exec.cgroup_parent,
                        "ignore_cache": exec.ignore_cache,
                        "mounts": mounts,
                    }
                })
            }
        };

        // serde_json maps are sorted, so this rendering is canonical.
        let bytes = serde_json::to_vec(&op)?;
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(&bytes)));

        self.memo.insert(key, digest.clone());
        if !self.ops.iter().any(|o| o.digest == digest) {
            self.ops.push(MarshaledOp {
                digest: digest.clone(),
                op,
            });
        }

        Ok(digest)
    }

    fn marshal_action(&mut self, action: &FileAction) -> Result<serde_json::Value> {
        Ok(match action {
            FileAction::Mkdir {
                path,
                mode,
                make_parents,
            } => json!({
                "mkdir": { "path": path, "mode": mode, "make_parents": make_parents }
            }),
            FileAction::Mkfile { path, mode, data } => json!({
                "mkfile": {
                    "path": path,
                    "mode": mode,
                    "data": BASE64_STANDARD.encode(data),
                }
            }),
            FileAction::Copy {
                src,
                src_path,
                dest_path,
                dir_contents_only,
                create_dest_path,
            } => {
                let input = self.visit(src)?;
                json!({
                    "copy": {
                        "input": input,
                        "src": src_path,
                        "dest": dest_path,
                        "dir_contents_only": dir_contents_only,
                        "create_dest_path": create_dest_path,
                    }
                })
            }
        })
    }

    fn marshal_mount(&mut self, mount: &ExecMount) -> Result<serde_json::Value> {
        Ok(match &mount.kind {
            MountKind::Bind {
                input,
                source_sub,
                read_only,
            } => {
                let input = self.visit(input)?;
                json!({
                    "target": mount.target,
                    "bind": {
                        "input": input,
                        "source_sub": source_sub,
                        "read_only": read_only,
                    }
                })
            }
            MountKind::Tmpfs => json!({ "target": mount.target, "tmpfs": {} }),
            MountKind::Cache { id, locked } => json!({
                "target": mount.target,
                "cache": { "id": id, "locked": locked }
            }),
            MountKind::Secret { id } => json!({
                "target": mount.target,
                "secret": { "id": id }
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_exec(hostname: &str) -> ExecState {
        State::image("alpine:3.19", None, Platform::new("linux", "amd64"))
            .exec(vec!["/bin/true".to_string()])
            .hostname(hostname)
            .bind("/work", State::scratch(), "")
            .mount("/tmp", MountKind::Tmpfs)
            .build()
    }

    #[test]
    fn marshal_is_deterministic() {
        let a = marshal(&simple_exec("abc").root()).unwrap();
        let b = marshal(&simple_exec("abc").root()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn hostname_is_part_of_content_identity() {
        let a = marshal(&simple_exec("one").root()).unwrap();
        let b = marshal(&simple_exec("two").root()).unwrap();
        assert_ne!(a.root.digest, b.root.digest);
    }

    #[test]
    fn mount_outputs_are_ordinal() {
        let exec = simple_exec("abc");
        let work = exec.get_mount("/work").unwrap();
        assert_eq!(work.output, 1);
        assert!(exec.get_mount("/missing").is_err());

        // Tmpfs mounts produce no outputs.
        assert!(exec.get_mount("/tmp").is_err());
    }

    #[test]
    fn shared_nodes_marshal_once() {
        let shared = State::scratch().file_action(
            FileAction::Mkfile {
                path: "f".to_string(),
                mode: 0o644,
                data: b"x".to_vec(),
            },
            "mk",
        );

        let exec = State::scratch()
            .exec(vec!["run".to_string()])
            .bind("/a", shared.clone(), "")
            .bind("/b", shared, "")
            .build();

        let def = marshal(&exec.root()).unwrap();
        let file_ops = def
            .ops
            .iter()
            .filter(|o| o.op.get("file").is_some())
            .count();
        assert_eq!(file_ops, 1);
    }

    #[test]
    fn env_additions_flow_into_exec() {
        let base = State::scratch().add_env("PATH", "/opt/bin");
        let exec = base.exec(vec!["tool".to_string()]).build();

        let def = marshal(&exec.root()).unwrap();
        let exec_op = def
            .ops
            .iter()
            .find(|o| o.op.get("exec").is_some())
            .unwrap();
        let env = &exec_op.op["exec"]["env"];
        assert_eq!(env[0][0], "PATH");
        assert_eq!(env[0][1], "/opt/bin");
    }
}
