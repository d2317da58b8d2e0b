//! Constants for the thunk execution layer.
//!
//! All fixed container paths, wire names, and limits are defined here to
//! ensure consistency and prevent magic strings throughout the codebase.

use std::time::Duration;

// =============================================================================
// Fixed Container Paths (shim contract)
// =============================================================================

/// Path the shim executable is mounted at inside every container.
pub const SHIM_EXE_PATH: &str = "/bass/shim";

/// The distinguished work directory; its contents are the thunk's output.
pub const WORK_DIR: &str = "/bass/work";

/// Directory holding the shim's input and output files.
pub const IO_DIR: &str = "/bass/io";

/// Path the command payload JSON is written to.
pub const INPUT_FILE: &str = "/bass/io/in";

/// Path the shim writes captured stdout to when requested.
pub const OUTPUT_FILE: &str = "/bass/io/out";

/// Environment variable whose presence tells the shim to capture stdout.
pub const OUTPUT_ENV: &str = "_BASS_OUTPUT";

// =============================================================================
// Runtime / Solver Names
// =============================================================================

/// Name the buildkit runtime registers under.
pub const BUILDKIT_NAME: &str = "buildkit";

/// Address binding name for the buildkit daemon socket.
pub const BUILDKITD_ADDR_NAME: &str = "buildkitd";

/// Product name reported to the solver with every build.
pub const BUILDKIT_PRODUCT: &str = "thunkrun";

/// Fallback daemon socket when no runtime dir is configured.
pub const DEFAULT_BUILDKITD_SOCK: &str = "/run/buildkit/buildkitd.sock";

// =============================================================================
// Host-Mount Handling
// =============================================================================

/// Optional ignore file honored at a host-mount context root.
pub const IGNORE_FILE: &str = ".bassignore";

// =============================================================================
// Shim Executables
// =============================================================================

/// File-name prefix for per-architecture shim binaries (`exe.<arch>`).
pub const SHIM_EXE_PREFIX: &str = "exe.";

/// Subdirectory (under the data dir) holding shim binaries.
pub const SHIM_DIR: &str = "shims";

// =============================================================================
// Limits and Timeouts
// =============================================================================

/// Timeout for dialing the solver daemon.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for gateway calls (image config resolution, result reads).
pub const GATEWAY_TIMEOUT: Duration = Duration::from_secs(120);

/// Maximum size of an image config blob read back through the gateway (1 MiB).
pub const MAX_IMAGE_CONFIG_SIZE: usize = 1024 * 1024;

/// Number of log lines retained per vertex for error decoration.
pub const LOG_TAIL_LINES: usize = 20;

/// Buffered capacity of a solve's status channel.
pub const STATUS_CHANNEL_DEPTH: usize = 64;
