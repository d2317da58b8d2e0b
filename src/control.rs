//! The control transport: a concrete [`SolverClient`] speaking
//! newline-delimited JSON over a unix or TCP socket.
//!
//! Each operation opens its own connection, sends one request line, and
//! consumes the server's response stream. Sessions stay interactive:
//! the client writes gateway requests and answers the server's secret
//! and registry-auth callbacks on the same connection. Solver-side
//! cancellation arrives as an error line flagged `canceled`.

use crate::constants::{DIAL_TIMEOUT, GATEWAY_TIMEOUT, MAX_IMAGE_CONFIG_SIZE};
use crate::error::{Error, Result};
use crate::graph::Definition;
use crate::platform::Platform;
use crate::runtime::PruneOpts;
use crate::solver::{
    BuildSession, Entitlement, Export, ResolvedImage, SolveOpts, SolveStatus, SolverClient,
    StatusSender, UsageInfo, WorkerInfo,
};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

/// Dials a solver at `unix://<path>` or `tcp://<host>:<port>`.
pub async fn dial(addr: &str) -> Result<Arc<dyn SolverClient>> {
    let parsed = parse_addr(addr)?;

    // Probe the daemon now so dial failures surface here, not at the
    // first solve.
    let client = ControlClient {
        addr: parsed,
        display_addr: addr.to_string(),
    };
    client.connect().await?;

    Ok(Arc::new(client))
}

#[derive(Debug, Clone)]
enum SolverAddr {
    Unix(PathBuf),
    Tcp(String),
}

fn parse_addr(addr: &str) -> Result<SolverAddr> {
    if let Some(path) = addr.strip_prefix("unix://") {
        if path.is_empty() {
            return Err(Error::InvalidAddr {
                addr: addr.to_string(),
                reason: "empty socket path".to_string(),
            });
        }
        return Ok(SolverAddr::Unix(PathBuf::from(path)));
    }

    if let Some(host) = addr.strip_prefix("tcp://") {
        if host.is_empty() {
            return Err(Error::InvalidAddr {
                addr: addr.to_string(),
                reason: "empty host".to_string(),
            });
        }
        return Ok(SolverAddr::Tcp(host.to_string()));
    }

    Err(Error::InvalidAddr {
        addr: addr.to_string(),
        reason: "expected unix:// or tcp:// scheme".to_string(),
    })
}

/// A solver client over one control socket.
pub struct ControlClient {
    addr: SolverAddr,
    display_addr: String,
}

impl ControlClient {
    async fn connect(&self) -> Result<Conn> {
        let dial = async {
            Ok::<Conn, std::io::Error>(match &self.addr {
                SolverAddr::Unix(path) => {
                    let stream = UnixStream::connect(path).await?;
                    let (read, write) = stream.into_split();
                    Conn::new(read, write)
                }
                SolverAddr::Tcp(host) => {
                    let stream = TcpStream::connect(host).await?;
                    let (read, write) = stream.into_split();
                    Conn::new(read, write)
                }
            })
        };

        timeout(DIAL_TIMEOUT, dial)
            .await
            .map_err(|_| Error::Canceled)?
            .map_err(|source| Error::Dial {
                addr: self.display_addr.clone(),
                source,
            })
    }
}

// =============================================================================
// Wire Messages
// =============================================================================

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request<'a> {
    ListWorkers,
    Session,
    Solve {
        def: &'a Definition,
        local_dirs: &'a BTreeMap<String, PathBuf>,
        entitlements: &'a [Entitlement],
        export: ExportKind,
    },
    Prune {
        all: bool,
        keep_duration_secs: Option<u64>,
        keep_bytes: Option<u64>,
    },
}

#[derive(Serialize, Clone, Copy)]
#[serde(rename_all = "snake_case")]
enum ExportKind {
    None,
    Local,
    Oci,
    Tar,
}

#[derive(Serialize)]
#[serde(tag = "req", rename_all = "snake_case")]
enum SessionRequest<'a> {
    ResolveImageConfig {
        reference: &'a str,
        platform: &'a Platform,
    },
    ReadFile {
        def: &'a Definition,
        path: &'a str,
        local_dirs: &'a BTreeMap<String, PathBuf>,
        entitlements: &'a [Entitlement],
    },
    End,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientReply {
    SecretResponse {
        name: String,
        found: bool,
        data: String,
    },
    AuthResponse {
        username: String,
        secret: String,
    },
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    Status(SolveStatus),
    Workers { workers: Vec<WorkerInfo> },
    SecretRequest { name: String },
    AuthRequest { host: String },
    File { path: String, mode: u32, data: String },
    Data { data: String },
    Resolved { digest: String },
    FileContents { data: String },
    Usage(UsageInfo),
    Done,
    Error {
        message: String,
        #[serde(default)]
        canceled: bool,
    },
}

// =============================================================================
// Connection
// =============================================================================

struct Conn {
    reader: BufReader<Box<dyn AsyncRead + Send + Unpin>>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl Conn {
    fn new(
        read: impl AsyncRead + Send + Unpin + 'static,
        write: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: BufReader::new(Box::new(read)),
            writer: Box::new(write),
        }
    }

    async fn send<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Reads the next message; `None` on a clean EOF.
    async fn recv(&mut self) -> Result<Option<ServerMessage>> {
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line).await? == 0 {
                return Ok(None);
            }

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            return Ok(Some(serde_json::from_str(line)?));
        }
    }
}

fn solver_error(message: String, canceled: bool) -> Error {
    if canceled {
        Error::Canceled
    } else {
        Error::Solver { message }
    }
}

fn unexpected_eof() -> Error {
    Error::Solver {
        message: "connection closed mid-stream".to_string(),
    }
}

// =============================================================================
// Shared Stream Handling
// =============================================================================

/// Answers a secret callback from the per-solve table.
async fn reply_secret(
    conn: &mut Conn,
    secrets: &BTreeMap<String, Vec<u8>>,
    name: &str,
) -> Result<()> {
    let reply = match secrets.get(name) {
        Some(bytes) => ClientReply::SecretResponse {
            name: name.to_string(),
            found: true,
            data: BASE64_STANDARD.encode(bytes),
        },
        None => ClientReply::SecretResponse {
            name: name.to_string(),
            found: false,
            data: String::new(),
        },
    };

    conn.send(&reply).await
}

/// Answers a registry-auth callback from the local docker config.
async fn reply_auth(conn: &mut Conn, host: &str) -> Result<()> {
    let (username, secret) = docker_auth(host).unwrap_or_default();
    conn.send(&ClientReply::AuthResponse { username, secret })
        .await
}

/// Looks a registry host up in the dispatching user's docker config.
fn docker_auth(host: &str) -> Option<(String, String)> {
    let config_dir = std::env::var_os("DOCKER_CONFIG")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".docker")))?;

    let raw = std::fs::read(config_dir.join("config.json")).ok()?;
    let config: serde_json::Value = serde_json::from_slice(&raw).ok()?;

    let auth = config.get("auths")?.get(host)?.get("auth")?.as_str()?;
    let decoded = BASE64_STANDARD.decode(auth).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, secret) = decoded.split_once(':')?;

    Some((username.to_string(), secret.to_string()))
}

/// Writes one locally-exported file under the output dir, rejecting
/// paths that would land outside it.
async fn write_exported_file(output_dir: &Path, path: &str, mode: u32, data: &[u8]) -> Result<()> {
    let rel = crate::path::normalize(path)?;
    if rel.is_empty() || rel.starts_with('/') {
        return Err(Error::InvalidPath {
            path: path.to_string(),
            reason: "export paths must be relative".to_string(),
        });
    }

    let dest = output_dir.join(&rel);
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    tokio::fs::write(&dest, data).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&dest, std::fs::Permissions::from_mode(mode)).await?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    Ok(())
}

// =============================================================================
// SolverClient
// =============================================================================

#[async_trait]
impl SolverClient for ControlClient {
    async fn list_workers(&self) -> Result<Vec<WorkerInfo>> {
        let mut conn = self.connect().await?;
        conn.send(&Request::ListWorkers).await?;

        loop {
            match conn.recv().await?.ok_or_else(unexpected_eof)? {
                ServerMessage::Workers { workers } => return Ok(workers),
                ServerMessage::Error { message, canceled } => {
                    return Err(solver_error(message, canceled))
                }
                _ => continue,
            }
        }
    }

    async fn open_session(&self, status: StatusSender) -> Result<Box<dyn BuildSession>> {
        let mut conn = self.connect().await?;
        conn.send(&Request::Session).await?;

        Ok(Box::new(ControlSession {
            conn: Mutex::new(conn),
            status,
        }))
    }

    async fn solve(
        &self,
        def: &Definition,
        opts: &SolveOpts,
        export: Option<Export<'_>>,
        status: StatusSender,
    ) -> Result<()> {
        let mut conn = self.connect().await?;

        let (kind, mut sink) = match export {
            None => (ExportKind::None, ExportSink::None),
            Some(Export::Local { output_dir }) => {
                (ExportKind::Local, ExportSink::Local { output_dir })
            }
            Some(Export::OciArchive { writer }) => (ExportKind::Oci, ExportSink::Stream(writer)),
            Some(Export::Tar { writer }) => (ExportKind::Tar, ExportSink::Stream(writer)),
        };

        conn.send(&Request::Solve {
            def,
            local_dirs: &opts.local_dirs,
            entitlements: &opts.entitlements,
            export: kind,
        })
        .await?;

        loop {
            match conn.recv().await?.ok_or_else(unexpected_eof)? {
                ServerMessage::Status(s) => {
                    let _ = status.send(s).await;
                }
                ServerMessage::SecretRequest { name } => {
                    reply_secret(&mut conn, &opts.secrets, &name).await?;
                }
                ServerMessage::AuthRequest { host } => {
                    reply_auth(&mut conn, &host).await?;
                }
                ServerMessage::File { path, mode, data } => {
                    let ExportSink::Local { output_dir } = &sink else {
                        continue;
                    };
                    let bytes = BASE64_STANDARD.decode(&data).map_err(|err| Error::Solver {
                        message: format!("malformed export chunk: {err}"),
                    })?;
                    write_exported_file(output_dir, &path, mode, &bytes).await?;
                }
                ServerMessage::Data { data } => {
                    let ExportSink::Stream(writer) = &mut sink else {
                        continue;
                    };
                    let bytes = BASE64_STANDARD.decode(&data).map_err(|err| Error::Solver {
                        message: format!("malformed export chunk: {err}"),
                    })?;
                    writer.write_all(&bytes).await?;
                }
                ServerMessage::Done => {
                    if let ExportSink::Stream(writer) = &mut sink {
                        writer.flush().await?;
                    }
                    return Ok(());
                }
                ServerMessage::Error { message, canceled } => {
                    return Err(solver_error(message, canceled));
                }
                _ => continue,
            }
        }
    }

    async fn prune(&self, opts: &PruneOpts, usage: mpsc::Sender<UsageInfo>) -> Result<()> {
        let mut conn = self.connect().await?;
        conn.send(&Request::Prune {
            all: opts.all,
            keep_duration_secs: opts.keep_duration.map(|d| d.as_secs()),
            keep_bytes: opts.keep_bytes,
        })
        .await?;

        loop {
            match conn.recv().await?.ok_or_else(unexpected_eof)? {
                ServerMessage::Usage(info) => {
                    if usage.send(info).await.is_err() {
                        // Receiver gone; drain the rest quietly.
                        continue;
                    }
                }
                ServerMessage::Done => return Ok(()),
                ServerMessage::Error { message, canceled } => {
                    return Err(solver_error(message, canceled));
                }
                _ => continue,
            }
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

enum ExportSink<'a> {
    None,
    Local {
        output_dir: &'a Path,
    },
    Stream(&'a mut (dyn AsyncWrite + Send + Unpin)),
}

// =============================================================================
// Session
// =============================================================================

/// One interactive gateway connection.
struct ControlSession {
    conn: Mutex<Conn>,
    status: StatusSender,
}

impl ControlSession {
    /// Sends one gateway request and waits for its terminal message,
    /// forwarding status and answering callbacks along the way.
    async fn round_trip(
        &self,
        request: &SessionRequest<'_>,
        secrets: &BTreeMap<String, Vec<u8>>,
    ) -> Result<ServerMessage> {
        let mut conn = self.conn.lock().await;
        conn.send(request).await?;

        let exchange = async {
            loop {
                match conn.recv().await?.ok_or_else(unexpected_eof)? {
                    ServerMessage::Status(s) => {
                        let _ = self.status.send(s).await;
                    }
                    ServerMessage::SecretRequest { name } => {
                        reply_secret(&mut conn, secrets, &name).await?;
                    }
                    ServerMessage::AuthRequest { host } => {
                        reply_auth(&mut conn, &host).await?;
                    }
                    ServerMessage::Error { message, canceled } => {
                        return Err(solver_error(message, canceled));
                    }
                    terminal => return Ok(terminal),
                }
            }
        };

        timeout(GATEWAY_TIMEOUT, exchange)
            .await
            .map_err(|_| Error::Canceled)?
    }
}

#[async_trait]
impl BuildSession for ControlSession {
    async fn resolve_image_config(
        &self,
        reference: &str,
        platform: &Platform,
    ) -> Result<ResolvedImage> {
        let no_secrets = BTreeMap::new();
        let reply = self
            .round_trip(
                &SessionRequest::ResolveImageConfig {
                    reference,
                    platform,
                },
                &no_secrets,
            )
            .await?;

        match reply {
            ServerMessage::Resolved { digest } => Ok(ResolvedImage { digest }),
            _ => Err(Error::ImageConfigResolution {
                reference: reference.to_string(),
                reason: "unexpected gateway reply".to_string(),
            }),
        }
    }

    async fn read_file(&self, def: &Definition, path: &str, opts: &SolveOpts) -> Result<Vec<u8>> {
        let reply = self
            .round_trip(
                &SessionRequest::ReadFile {
                    def,
                    path,
                    local_dirs: &opts.local_dirs,
                    entitlements: &opts.entitlements,
                },
                &opts.secrets,
            )
            .await?;

        match reply {
            ServerMessage::FileContents { data } => {
                let bytes = BASE64_STANDARD.decode(&data).map_err(|err| Error::Solver {
                    message: format!("malformed file contents: {err}"),
                })?;

                if bytes.len() > MAX_IMAGE_CONFIG_SIZE {
                    return Err(Error::Solver {
                        message: format!(
                            "gateway file exceeds {MAX_IMAGE_CONFIG_SIZE} byte limit"
                        ),
                    });
                }

                Ok(bytes)
            }
            _ => Err(Error::Solver {
                message: "unexpected gateway reply".to_string(),
            }),
        }
    }

    async fn close(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        conn.send(&SessionRequest::End).await?;

        // Drain until the server acknowledges or hangs up.
        loop {
            match conn.recv().await? {
                None | Some(ServerMessage::Done) => return Ok(()),
                Some(ServerMessage::Status(s)) => {
                    let _ = self.status.send(s).await;
                }
                Some(ServerMessage::Error { message, canceled }) => {
                    return Err(solver_error(message, canceled));
                }
                Some(_) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_parsing() {
        assert!(matches!(
            parse_addr("unix:///run/buildkit/buildkitd.sock").unwrap(),
            SolverAddr::Unix(_)
        ));
        assert!(matches!(
            parse_addr("tcp://127.0.0.1:1234").unwrap(),
            SolverAddr::Tcp(_)
        ));
        assert!(parse_addr("http://nope").is_err());
        assert!(parse_addr("unix://").is_err());
    }

    #[tokio::test]
    async fn exported_files_stay_under_output_dir() {
        let dir = tempfile::tempdir().unwrap();

        write_exported_file(dir.path(), "out", 0o644, b"hi").await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("out")).unwrap(), b"hi");

        assert!(
            write_exported_file(dir.path(), "../escape", 0o644, b"x")
                .await
                .is_err()
        );
        assert!(
            write_exported_file(dir.path(), "/abs", 0o644, b"x")
                .await
                .is_err()
        );
    }

    #[test]
    fn server_messages_parse() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"type":"resolved","digest":"sha256:abc"}"#).unwrap();
        assert!(matches!(msg, ServerMessage::Resolved { .. }));

        let msg: ServerMessage = serde_json::from_str(
            r#"{"type":"status","vertexes":[{"digest":"sha256:v","name":"step"}]}"#,
        )
        .unwrap();
        let ServerMessage::Status(status) = msg else {
            panic!("expected status");
        };
        assert_eq!(status.vertexes[0].name, "step");

        let msg: ServerMessage =
            serde_json::from_str(r#"{"type":"error","message":"ctx","canceled":true}"#).unwrap();
        let ServerMessage::Error { canceled, .. } = msg else {
            panic!("expected error");
        };
        assert!(canceled);
    }
}
