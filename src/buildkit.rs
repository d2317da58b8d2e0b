//! The buildkit runtime: drives thunks through a remote solver.
//!
//! Every operation is a two-pass solve. Pass one opens a gateway
//! session and translates the thunk into a build graph, collecting
//! local directories, secrets, and entitlements along the way. Pass two
//! submits the marshaled graph with the required export and the
//! session attachables (auth, the collected secret table). One status
//! proxy spans both passes, so progress surfaces uniformly and terminal
//! errors carry the last-seen logs.

use crate::constants::{
    BUILDKITD_ADDR_NAME, BUILDKIT_NAME, DEFAULT_BUILDKITD_SOCK, IO_DIR, WORK_DIR,
};
use crate::control;
use crate::error::{Error, Result};
use crate::graph::{self, FileAction, State};
use crate::platform::Platform;
use crate::registry::InitFuture;
use crate::runtime::{PruneOpts, Runtime, RuntimeAddrs, RuntimePool};
use crate::shim::ShimStore;
use crate::solver::{Export, SolverClient, StatusSender, WorkerInfo};
use crate::status::{StatusProxy, StatusRecorder};
use crate::thunk::{ImageRef, Thunk, ThunkPath};
use crate::translate::{join_sub, Translated, Translator};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Buildkit runtime configuration, decoded from the nested runtime
/// config.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildkitConfig {
    /// Disables the solver cache for every exec op.
    #[serde(default)]
    pub disable_cache: bool,

    /// Overrides the shim binary directory.
    #[serde(default)]
    pub shim_dir: Option<PathBuf>,
}

/// Registry constructor for the `buildkit` runtime.
pub fn init(
    pool: Arc<RuntimePool>,
    addrs: RuntimeAddrs,
    config: Option<serde_json::Value>,
) -> InitFuture {
    Box::pin(async move {
        let runtime = BuildkitRuntime::new(pool, addrs, config).await?;
        Ok(Arc::new(runtime) as Arc<dyn Runtime>)
    })
}

/// The default address bindings for this runtime, honoring the XDG
/// runtime dir.
pub fn default_addrs() -> RuntimeAddrs {
    let mut addrs = RuntimeAddrs::new();
    addrs.insert(BUILDKITD_ADDR_NAME.to_string(), default_buildkitd_addr());
    addrs
}

fn default_buildkitd_addr() -> String {
    if let Some(dir) = std::env::var_os("XDG_RUNTIME_DIR") {
        let candidate = PathBuf::from(dir).join("buildkit/buildkitd.sock");
        if candidate.exists() {
            return format!("unix://{}", candidate.display());
        }
    }

    format!("unix://{DEFAULT_BUILDKITD_SOCK}")
}

/// A thunk runtime backed by a buildkit-style solver.
pub struct BuildkitRuntime {
    config: BuildkitConfig,
    client: Arc<dyn SolverClient>,
    workers: Vec<WorkerInfo>,
    recorder: Arc<dyn StatusRecorder>,
    shims: ShimStore,
}

impl BuildkitRuntime {
    /// Dials the configured solver and negotiates worker platforms.
    pub async fn new(
        pool: Arc<RuntimePool>,
        addrs: RuntimeAddrs,
        config: Option<serde_json::Value>,
    ) -> Result<Self> {
        let config: BuildkitConfig = match config {
            Some(value) => {
                serde_json::from_value(value).map_err(|source| Error::InvalidConfig {
                    runtime: BUILDKIT_NAME.to_string(),
                    source,
                })?
            }
            None => BuildkitConfig::default(),
        };

        let addr = addrs
            .get(BUILDKITD_ADDR_NAME)
            .cloned()
            .unwrap_or_else(default_buildkitd_addr);

        let client = control::dial(&addr).await?;
        Self::with_client(client, pool.recorder(), config).await
    }

    /// Builds a runtime around an existing solver client.
    pub async fn with_client(
        client: Arc<dyn SolverClient>,
        recorder: Arc<dyn StatusRecorder>,
        config: BuildkitConfig,
    ) -> Result<Self> {
        let workers = client.list_workers().await?;
        if workers.is_empty() {
            return Err(Error::NoWorkers);
        }

        tracing::debug!(workers = workers.len(), "connected to solver");

        let shims = ShimStore::load(config.shim_dir.as_deref())?;

        Ok(Self {
            config,
            client,
            workers,
            recorder,
            shims,
        })
    }

    /// Selects the worker platform for a thunk. Platform-less thunks
    /// take the first worker; otherwise the first matching worker wins.
    fn select_platform(&self, want: Option<&Platform>) -> Result<Platform> {
        match want {
            None => self
                .workers
                .first()
                .map(|w| w.platform.clone())
                .ok_or(Error::NoWorkers),
            Some(want) => self
                .workers
                .iter()
                .find(|w| want.can_select(&w.platform))
                .map(|w| w.platform.clone())
                .ok_or_else(|| Error::NoWorkerForPlatform {
                    platform: want.to_string(),
                }),
        }
    }

    async fn build<F>(
        &self,
        thunk: &Thunk,
        capture_stdout: bool,
        transform: F,
        export: Option<Export<'_>>,
    ) -> Result<()>
    where
        F: FnOnce(&Translated) -> Result<State> + Send,
    {
        let platform = self.select_platform(thunk.platform())?;

        let (proxy, status_tx) = StatusProxy::forward(self.recorder.clone());

        let result = self
            .build_inner(thunk, capture_stdout, platform, transform, export, status_tx)
            .await;

        proxy.wait().await;
        result.map_err(|err| proxy.nice_error("build failed", err))
    }

    async fn build_inner<F>(
        &self,
        thunk: &Thunk,
        capture_stdout: bool,
        platform: Platform,
        transform: F,
        export: Option<Export<'_>>,
        status_tx: StatusSender,
    ) -> Result<()>
    where
        F: FnOnce(&Translated) -> Result<State> + Send,
    {
        let session = self.client.open_session(status_tx.clone()).await?;

        let mut translator = Translator::new(
            &*session,
            platform,
            self.config.disable_cache,
            &self.shims,
        );

        let translated = translator.thunk(thunk, capture_stdout).await;
        let closed = session.close().await;

        let translated = translated?;
        closed?;

        let def = graph::marshal(&transform(&translated)?)?;
        let opts = translator.solve_opts(translated.insecure);

        self.client.solve(&def, &opts, export, status_tx).await
    }
}

#[async_trait]
impl Runtime for BuildkitRuntime {
    async fn resolve(&self, mut image_ref: ImageRef) -> Result<ImageRef> {
        let reference = image_ref.repository_ref()?;

        // Normalize shorthand like `ubuntu` to a fully-qualified
        // reference before asking the solver about it.
        let normalized = oci_distribution::Reference::try_from(reference.as_str())
            .map_err(|err| Error::ImageConfigResolution {
                reference: reference.clone(),
                reason: format!("normalize ref: {err}"),
            })?
            .whole();

        let platform = self.select_platform(Some(&image_ref.platform))?;

        let (proxy, status_tx) = StatusProxy::forward(self.recorder.clone());

        let result = async {
            let session = self.client.open_session(status_tx.clone()).await?;
            let resolved = session.resolve_image_config(&normalized, &platform).await;
            let closed = session.close().await;
            let resolved = resolved?;
            closed?;
            Ok(resolved)
        }
        .await;

        drop(status_tx);
        proxy.wait().await;

        match result {
            Ok(resolved) => {
                image_ref.digest = Some(resolved.digest);
                Ok(image_ref)
            }
            Err(err) => Err(proxy.nice_error("resolve failed", err)),
        }
    }

    async fn run(
        &self,
        thunk: &Thunk,
        stdout: Option<&mut (dyn AsyncWrite + Send + Unpin)>,
    ) -> Result<()> {
        let Some(writer) = stdout else {
            return self
                .build(thunk, false, |t| t.exec.get_mount(IO_DIR), None)
                .await;
        };

        // Capture via a local export into session-scoped scratch;
        // removed on any unwind, including cancellation.
        let scratch = tempfile::Builder::new()
            .prefix(&format!("thunk-{}", thunk.hostname()?))
            .tempdir()?;

        self.build(
            thunk,
            true,
            |t| t.exec.get_mount(IO_DIR),
            Some(Export::Local {
                output_dir: scratch.path(),
            }),
        )
        .await?;

        match tokio::fs::File::open(scratch.path().join("out")).await {
            Ok(mut out) => {
                tokio::io::copy(&mut out, writer).await?;
            }
            // The command produced no output.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        Ok(())
    }

    async fn export(
        &self,
        thunk: &Thunk,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        self.build(
            thunk,
            false,
            |t| Ok(t.exec.root()),
            Some(Export::OciArchive { writer }),
        )
        .await
    }

    async fn export_path(
        &self,
        path: &ThunkPath,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        let target = path.path.clone();

        self.build(
            &path.thunk,
            false,
            move |t| {
                let work = t.exec.get_mount(WORK_DIR)?;
                Ok(State::scratch().file_action(
                    FileAction::Copy {
                        src: work,
                        src_path: join_sub(&t.source_sub, target.slash()),
                        dest_path: ".".to_string(),
                        dir_contents_only: target.is_dir(),
                        create_dest_path: false,
                    },
                    format!("[hide] copy {target}"),
                ))
            },
            Some(Export::Tar { writer }),
        )
        .await
    }

    async fn prune(
        &self,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
        opts: PruneOpts,
    ) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(16);

        let prune = self.client.prune(&opts, tx);

        let drain = async {
            let mut total: i64 = 0;
            let mut write_err = None;

            while let Some(usage) = rx.recv().await {
                total += usage.size;

                if write_err.is_some() {
                    // Keep draining so the prune stream finishes.
                    continue;
                }

                let mut line = format!("pruned {}", usage.id);
                if let Some(last) = usage.last_used_at {
                    let ago = (Utc::now() - last).num_seconds().max(0);
                    line.push_str(&format!(
                        "\tuses: {}\tlast used: {} ago",
                        usage.usage_count,
                        fmt_duration(ago)
                    ));
                }
                line.push_str(&format!("\tsize: {}", fmt_bytes(usage.size)));
                if !usage.description.is_empty() {
                    line.push_str(&format!("\t{}", usage.description));
                }
                line.push('\n');

                if let Err(err) = writer.write_all(line.as_bytes()).await {
                    write_err = Some(err);
                }
            }

            (total, write_err)
        };

        let (prune_result, (total, write_err)) = tokio::join!(prune, drain);

        // The running total always flushes, even after a mid-stream
        // error.
        writer
            .write_all(format!("total: {}\n", fmt_bytes(total)).as_bytes())
            .await?;
        writer.flush().await?;

        prune_result?;
        if let Some(err) = write_err {
            return Err(err.into());
        }

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.client.close().await
    }
}

/// Renders a byte count the way the prune table expects (`1.23MB`).
fn fmt_bytes(n: i64) -> String {
    const UNITS: [&str; 5] = ["B", "kB", "MB", "GB", "TB"];

    let mut value = n as f64;
    let mut unit = 0;
    while value.abs() >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{n}B")
    } else {
        format!("{value:.2}{}", UNITS[unit])
    }
}

/// Renders a whole-second duration as `1h2m3s`.
fn fmt_duration(mut secs: i64) -> String {
    let hours = secs / 3600;
    secs %= 3600;
    let minutes = secs / 60;
    secs %= 60;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if minutes > 0 {
        out.push_str(&format!("{minutes}m"));
    }
    if secs > 0 || out.is_empty() {
        out.push_str(&format!("{secs}s"));
    }
    out
}
