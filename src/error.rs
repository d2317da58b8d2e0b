//! Error types for the thunk execution layer.

use std::path::PathBuf;

/// Result type alias for thunk execution operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while composing, translating, or solving thunks.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// No runtime is registered under the requested name.
    #[error("unknown runtime: {name}")]
    UnknownRuntime { name: String },

    /// A required address binding is missing from the runtime config.
    #[error("service not configured: {name}")]
    ServiceNotConfigured { name: String },

    /// The nested runtime config did not decode into the expected shape.
    #[error("invalid {runtime} config: {source}")]
    InvalidConfig {
        runtime: String,
        #[source]
        source: serde_json::Error,
    },

    /// A solver address could not be parsed.
    #[error("invalid solver address '{addr}': {reason}")]
    InvalidAddr { addr: String, reason: String },

    // =========================================================================
    // Solver Errors
    // =========================================================================
    /// Dialing the solver daemon failed.
    #[error("dial solver at {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The solver reported no workers.
    #[error("solver has no workers")]
    NoWorkers,

    /// No worker matches the platform a thunk requires.
    #[error("no worker for platform {platform}")]
    NoWorkerForPlatform { platform: String },

    /// The solver rejected or failed a request.
    #[error("solver: {message}")]
    Solver { message: String },

    /// Resolving an image's config through the gateway failed.
    #[error("resolve image config for {reference}: {reason}")]
    ImageConfigResolution { reference: String, reason: String },

    /// Unpacking an OCI archive inside the solver failed.
    #[error("unpack OCI archive: {reason}")]
    Unpack { reason: String },

    /// A terminal solve error, decorated with the last captured logs.
    #[error("{message}\n{logs}")]
    Nice {
        message: String,
        logs: String,
        #[source]
        source: Box<Error>,
    },

    // =========================================================================
    // Translation Errors
    // =========================================================================
    /// A reference names neither a repository nor an archive file.
    #[error("image ref does not refer to a repository")]
    NoRepository,

    /// No shim binary is available for the worker architecture.
    #[error("no shim found for architecture {arch}")]
    NoShim { arch: String },

    /// A value cannot be rendered as a command argument.
    #[error("cannot use {kind} as a command argument")]
    UnrenderableArg { kind: &'static str },

    /// An embedded filesystem id is not registered in this process.
    #[error("embedded filesystem not registered: {id}")]
    EmbeddedFsMissing { id: String },

    /// A path inside an embedded filesystem does not exist.
    #[error("embedded path not found: {id}:{path}")]
    EmbeddedPathMissing { id: String, path: String },

    /// Path normalization escaped the root via `..`.
    #[error("path escapes root: {path}")]
    PathEscapesRoot { path: String },

    /// A path value is malformed.
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    /// The thunk path used as a command must point to a file.
    #[error("thunk command path must be a file: {path}")]
    CommandNotAFile { path: String },

    // =========================================================================
    // IO Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An ignore file at a host-mount context root failed to parse.
    #[error("parse {path}: {reason}")]
    IgnoreParse { path: PathBuf, reason: String },

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Wire decoding failed.
    #[error("wire decode error: {0}")]
    WireDecode(#[from] prost::DecodeError),

    /// A wire message is missing a required field or arm.
    #[error("wire message missing {field}")]
    WireMissing { field: &'static str },

    // =========================================================================
    // Cancellation
    // =========================================================================
    /// The operation was canceled or timed out.
    #[error("operation canceled")]
    Canceled,
}

impl Error {
    /// Returns true if this error (or its decorated source) is a cancellation.
    pub fn is_canceled(&self) -> bool {
        match self {
            Error::Canceled => true,
            Error::Nice { source, .. } => source.is_canceled(),
            _ => false,
        }
    }
}
