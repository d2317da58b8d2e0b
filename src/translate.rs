//! Thunk → build-graph translation.
//!
//! The translator turns a [`Thunk`] into an exec op rooted in its
//! resolved base image, with the shim, payload, and every mount wired
//! in, while accumulating the solve's secret and local-directory side
//! tables. Base images and mount sources may themselves be thunks;
//! translation recurses by value and memoizes by fingerprint so shared
//! sub-thunks translate once per solve.

use crate::command::Command;
use crate::constants::{
    INPUT_FILE, IO_DIR, OUTPUT_ENV, OUTPUT_FILE, SHIM_EXE_PATH, WORK_DIR,
};
use crate::embedded;
use crate::error::{Error, Result};
use crate::graph::{self, ExecState, FileAction, MountKind, State};
use crate::path::{FileOrDirPath, FsPath, HostPath};
use crate::platform::Platform;
use crate::shim::ShimStore;
use crate::solver::{BuildSession, Entitlement, SolveOpts};
use crate::thunk::{MountSource, Thunk, ThunkImage, ThunkPath};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

/// The result of translating one thunk.
#[derive(Debug, Clone)]
pub struct Translated {
    /// The exec op whose work-directory mount is the thunk's output.
    pub exec: ExecState,

    /// Subpath within the work-directory mount's source that holds the
    /// content; threaded through when thunks compose.
    pub source_sub: String,

    /// True if this thunk or any transitively-referenced thunk requires
    /// the insecure entitlement.
    pub insecure: bool,
}

/// Translates thunks within one solve, owning its side tables.
pub struct Translator<'a> {
    session: &'a dyn BuildSession,
    platform: Platform,
    disable_cache: bool,
    shims: &'a ShimStore,

    /// Secret name → bytes, handed to the solve as its secret provider.
    pub secrets: BTreeMap<String, Vec<u8>>,

    /// Context-dir name → host directory, for local transfers.
    pub local_dirs: BTreeMap<String, PathBuf>,

    memo: HashMap<(String, bool), Translated>,
}

struct ImageState {
    base: State,
    run_input: State,
    source_sub: String,
    insecure: bool,
}

/// The slice of an OCI image config translation consumes.
#[derive(Debug, Deserialize)]
struct ImageConfig {
    #[serde(default, rename = "Env")]
    env: Vec<String>,
}

impl<'a> Translator<'a> {
    /// Creates a translator for one solve.
    pub fn new(
        session: &'a dyn BuildSession,
        platform: Platform,
        disable_cache: bool,
        shims: &'a ShimStore,
    ) -> Self {
        Self {
            session,
            platform,
            disable_cache,
            shims,
            secrets: BTreeMap::new(),
            local_dirs: BTreeMap::new(),
            memo: HashMap::new(),
        }
    }

    /// The solve options accumulated so far: local dirs, secrets, and
    /// the entitlements the graph requires.
    pub fn solve_opts(&self, insecure: bool) -> SolveOpts {
        SolveOpts {
            local_dirs: self.local_dirs.clone(),
            entitlements: if insecure {
                vec![Entitlement::SecurityInsecure]
            } else {
                Vec::new()
            },
            secrets: self.secrets.clone(),
        }
    }

    /// Translates a thunk into its exec op.
    pub async fn thunk(&mut self, thunk: &Thunk, capture_stdout: bool) -> Result<Translated> {
        self.thunk_boxed(thunk, capture_stdout).await
    }

    // Recursion through images and mounts needs boxing.
    fn thunk_boxed<'s>(
        &'s mut self,
        thunk: &'s Thunk,
        capture_stdout: bool,
    ) -> Pin<Box<dyn Future<Output = Result<Translated>> + Send + 's>> {
        Box::pin(async move {
            let memo_key = (thunk.fingerprint()?, capture_stdout);
            if let Some(done) = self.memo.get(&memo_key) {
                return Ok(done.clone());
            }

            let command = Command::resolve(thunk)?;
            let payload = serde_json::to_vec(&command)?;

            let image = self.image(thunk.image.as_ref()).await?;

            let hostname = thunk.hostname()?;

            let io_state = State::scratch().file_action(
                FileAction::Mkfile {
                    path: "in".to_string(),
                    mode: 0o600,
                    data: payload,
                },
                "[hide] mount command json",
            );

            let mut builder = image
                .base
                .exec(vec![
                    SHIM_EXE_PATH.to_string(),
                    "run".to_string(),
                    INPUT_FILE.to_string(),
                ])
                .custom_name(thunk.cmdline())
                .hostname(hostname.clone())
                .cwd(WORK_DIR)
                .mount("/tmp", MountKind::Tmpfs)
                .mount("/dev/shm", MountKind::Tmpfs)
                .bind(IO_DIR, io_state, "")
                .bind_ro(SHIM_EXE_PATH, self.shim_state()?, "run");

            if capture_stdout {
                builder = builder.env(OUTPUT_ENV, OUTPUT_FILE);
            }

            let mut needs_insecure = image.insecure;
            if thunk.insecure {
                needs_insecure = true;
                builder = builder.insecure(hostname);
            }

            let mut source_sub = image.source_sub;
            let mut remounted_workdir = false;
            let mut seen_targets = HashSet::new();

            for mount in &command.mounts {
                let target = resolve_target(&mount.target);

                // First mount wins for a shared target.
                if !seen_targets.insert(target.clone()) {
                    continue;
                }

                let (kind, sub, insecure) = self.initialize_mount(&mount.source).await?;

                if target == WORK_DIR {
                    remounted_workdir = true;
                    source_sub = sub;
                }

                if insecure {
                    needs_insecure = true;
                }

                builder = builder.mount(target, kind);
            }

            if !remounted_workdir {
                builder = builder.bind(WORK_DIR, image.run_input, source_sub.clone());
            }

            if self.disable_cache {
                builder = builder.ignore_cache(true);
            }

            let translated = Translated {
                exec: builder.build(),
                source_sub,
                insecure: needs_insecure,
            };

            self.memo.insert(memo_key, translated.clone());
            Ok(translated)
        })
    }

    /// Resolves a thunk's base image into a root state, the base
    /// content of the work-directory mount, and its source subpath.
    async fn image(&mut self, image: Option<&ThunkImage>) -> Result<ImageState> {
        let Some(image) = image else {
            return Ok(ImageState {
                base: State::scratch(),
                run_input: State::scratch(),
                source_sub: String::new(),
                insecure: false,
            });
        };

        match image {
            ThunkImage::Ref(image_ref) => {
                if let Some(file) = &image_ref.file {
                    return self
                        .unpack_image_archive(file, image_ref.tag_or_latest())
                        .await;
                }

                let reference = image_ref.repository_ref()?;

                let digest = match &image_ref.digest {
                    Some(digest) => digest.clone(),
                    None => {
                        self.session
                            .resolve_image_config(&reference, &self.platform)
                            .await?
                            .digest
                    }
                };

                Ok(ImageState {
                    base: State::image(reference, Some(digest), self.platform.clone()),
                    run_input: State::scratch(),
                    source_sub: String::new(),
                    insecure: false,
                })
            }

            ThunkImage::Parent(inner) => {
                let inner = self.thunk_boxed(inner, false).await?;
                Ok(ImageState {
                    base: inner.exec.root(),
                    run_input: inner.exec.get_mount(WORK_DIR)?,
                    source_sub: inner.source_sub,
                    insecure: inner.insecure,
                })
            }
        }
    }

    /// Uses an OCI archive produced by another thunk as a base image:
    /// one shim run extracts the tag's config, another materializes its
    /// rootfs, and the config's env entries carry over.
    async fn unpack_image_archive(&mut self, tp: &ThunkPath, tag: &str) -> Result<ImageState> {
        let shim_exe = self.shim_state()?;

        let archive = self.thunk_boxed(&tp.thunk, false).await?;
        let source_path = join_sub(&archive.source_sub, tp.path.slash());
        let work = archive.exec.get_mount(WORK_DIR)?;

        let config_exec = State::scratch()
            .exec(vec![
                "/shim".to_string(),
                "get-config".to_string(),
                "/image.tar".to_string(),
                tag.to_string(),
                "/config".to_string(),
            ])
            .custom_name(format!("[hide] get config for tag {tag}"))
            .bind_ro("/shim", shim_exe.clone(), "run")
            .bind("/image.tar", work.clone(), source_path.clone())
            .bind("/config", State::scratch(), "")
            .build();

        let unpack_exec = State::scratch()
            .exec(vec![
                "/shim".to_string(),
                "unpack".to_string(),
                "/image.tar".to_string(),
                tag.to_string(),
                "/rootfs".to_string(),
            ])
            .custom_name(format!("[hide] unpack tag {tag}"))
            .bind_ro("/shim", shim_exe, "run")
            .bind("/image.tar", work, source_path)
            .bind("/rootfs", State::scratch(), "")
            .build();

        let mut rootfs = unpack_exec.get_mount("/rootfs")?;

        let def = graph::marshal(&config_exec.get_mount("/config")?)?;
        let opts = self.solve_opts(archive.insecure);
        let raw = self.session.read_file(&def, "/config.json", &opts).await?;

        let config: ImageConfig = serde_json::from_slice(&raw).map_err(|err| Error::Unpack {
            reason: format!("parse config.json: {err}"),
        })?;

        for entry in &config.env {
            let mut parts = entry.splitn(2, '=');
            let name = parts.next().unwrap_or("");
            if !name.is_empty() {
                rootfs = rootfs.add_env(name, parts.next().unwrap_or(""));
            }
        }

        Ok(ImageState {
            base: rootfs,
            run_input: State::scratch(),
            source_sub: String::new(),
            insecure: archive.insecure,
        })
    }

    /// Turns a mount source into a graph mount, returning its source
    /// subpath and whether it requires the insecure entitlement.
    async fn initialize_mount(&mut self, source: &MountSource) -> Result<(MountKind, String, bool)> {
        match source {
            MountSource::Thunk(tp) => {
                let inner = self.thunk_boxed(&tp.thunk, false).await?;
                let sub = join_sub(&inner.source_sub, tp.path.slash());

                Ok((
                    MountKind::Bind {
                        input: inner.exec.get_mount(WORK_DIR)?,
                        source_sub: sub.clone(),
                        read_only: false,
                    },
                    sub,
                    inner.insecure,
                ))
            }

            MountSource::Host(hp) => {
                let (kind, sub) = self.host_mount(hp).await?;
                Ok((kind, sub, false))
            }

            MountSource::Fs(fp) => {
                let (kind, sub) = self.embedded_mount(fp)?;
                Ok((kind, sub, false))
            }

            MountSource::Cache(cache) => Ok((
                MountKind::Cache {
                    id: cache.id.clone(),
                    locked: true,
                },
                String::new(),
                false,
            )),

            MountSource::Secret(secret) => {
                self.secrets
                    .insert(secret.name().to_string(), secret.reveal().to_vec());

                Ok((
                    MountKind::Secret {
                        id: secret.name().to_string(),
                    },
                    String::new(),
                    false,
                ))
            }
        }
    }

    /// Registers the context dir for transfer and copies the subpath
    /// into a scratch root preserving it, so caching stays fine-grained
    /// on the subpath.
    async fn host_mount(&mut self, hp: &HostPath) -> Result<(MountKind, String)> {
        self.local_dirs
            .insert(hp.context.clone(), PathBuf::from(&hp.context));

        let excludes = read_ignore_file(Path::new(&hp.context)).await?;
        let sub = hp.path.slash().to_string();

        let local = State::local(&hp.context, excludes, true);
        let tree = State::scratch().file_action(
            FileAction::Copy {
                src: local,
                src_path: sub.clone(),
                dest_path: sub.clone(),
                dir_contents_only: true,
                create_dest_path: true,
            },
            format!("[hide] copy {hp}"),
        );

        Ok((
            MountKind::Bind {
                input: tree,
                source_sub: sub.clone(),
                read_only: false,
            },
            sub,
        ))
    }

    /// Synthesizes an embedded file or tree into scratch, preserving
    /// file modes.
    fn embedded_mount(&mut self, fp: &FsPath) -> Result<(MountKind, String)> {
        let fs = embedded::lookup(&fp.id)?;
        let sub = fp.path.slash().to_string();

        let mut actions = Vec::new();
        let mut made_dirs = HashSet::new();
        let mut synthesize = |path: &str, entry: &embedded::FsEntry, actions: &mut Vec<FileAction>| {
            if let Some((parent, _)) = path.rsplit_once('/') {
                if made_dirs.insert(parent.to_string()) {
                    actions.push(FileAction::Mkdir {
                        path: parent.to_string(),
                        mode: embedded::DEFAULT_DIR_MODE,
                        make_parents: true,
                    });
                }
            }
            actions.push(FileAction::Mkfile {
                path: path.to_string(),
                mode: entry.mode,
                data: entry.data.clone(),
            });
        };

        match &fp.path {
            FileOrDirPath::File(file) => {
                let entry = fs.read_file(file.slash())?;
                synthesize(file.slash(), entry, &mut actions);
            }
            FileOrDirPath::Dir(dir) => {
                if !dir.slash().is_empty() && !fs.contains_dir(dir.slash()) {
                    return Err(Error::EmbeddedPathMissing {
                        id: fp.id.clone(),
                        path: dir.slash().to_string(),
                    });
                }

                for (path, entry) in fs.walk(dir.slash()) {
                    synthesize(path, entry, &mut actions);
                }
            }
        }

        let tree = State::scratch().file(actions, Some(format!("[hide] mount {fp}")));

        Ok((
            MountKind::Bind {
                input: tree,
                source_sub: sub.clone(),
                read_only: false,
            },
            sub,
        ))
    }

    /// The shim binary for the worker platform, as a scratch file state.
    fn shim_state(&self) -> Result<State> {
        let arch = self.platform.arch.as_deref().ok_or_else(|| Error::NoShim {
            arch: "unknown".to_string(),
        })?;

        let content = self.shims.get(arch)?.to_vec();

        Ok(State::scratch().file_action(
            FileAction::Mkfile {
                path: "run".to_string(),
                mode: 0o755,
                data: content,
            },
            "[hide] load shim",
        ))
    }
}

/// Resolves a mount target to an absolute container path; relative
/// targets live under the work directory.
fn resolve_target(target: &FileOrDirPath) -> String {
    let slash = target.slash();
    if target.is_absolute() {
        slash.to_string()
    } else if slash.is_empty() {
        WORK_DIR.to_string()
    } else {
        format!("{WORK_DIR}/{slash}")
    }
}

/// Joins two slash subpaths, skipping empty halves.
pub(crate) fn join_sub(base: &str, sub: &str) -> String {
    match (base.is_empty(), sub.is_empty()) {
        (true, _) => sub.to_string(),
        (_, true) => base.to_string(),
        _ => format!("{base}/{sub}"),
    }
}

/// Reads and validates the ignore file under a host-mount context root,
/// if present: line-oriented globs, `#` comments, leading `!` negation.
async fn read_ignore_file(context: &Path) -> Result<Vec<String>> {
    let path = context.join(crate::constants::IGNORE_FILE);

    let raw = match tokio::fs::read_to_string(&path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut patterns = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let glob = line.strip_prefix('!').unwrap_or(line);
        globset::Glob::new(glob).map_err(|err| Error::IgnoreParse {
            path: path.clone(),
            reason: err.to_string(),
        })?;

        patterns.push(line.to_string());
    }

    Ok(patterns)
}
