//! OCI image platforms and runtime selection.
//!
//! A thunk's image carries the platform it targets; the solver's workers
//! each report theirs. A worker is selectable for a thunk iff the
//! platforms match, where an absent `arch` matches any architecture.

use serde::{Deserialize, Serialize};

/// An OCI image platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    /// Operating system, e.g. `linux`.
    pub os: String,

    /// CPU architecture, e.g. `amd64`. Absent matches any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
}

impl Platform {
    /// The minimum configuration to select a Linux runtime.
    pub fn linux() -> Self {
        Self {
            os: "linux".to_string(),
            arch: None,
        }
    }

    /// Creates a fully-specified platform.
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: Some(arch.into()),
        }
    }

    /// Returns true if a runtime with the `given` platform can run images
    /// targeting this platform.
    pub fn can_select(&self, given: &Platform) -> bool {
        if self.os != given.os {
            return false;
        }

        match &self.arch {
            None => true,
            Some(arch) => Some(arch) == given.arch.as_ref(),
        }
    }

    /// Returns the OCI platform string (e.g. `linux/amd64`).
    pub fn oci_platform(&self) -> String {
        match &self.arch {
            Some(arch) => format!("{}/{}", self.os, arch),
            None => self.os.clone(),
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.arch {
            Some(arch) => write!(f, "os={}, arch={}", self.os, arch),
            None => write!(f, "os={}, arch=any", self.os),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archless_platform_selects_any_arch() {
        let want = Platform::linux();
        assert!(want.can_select(&Platform::new("linux", "amd64")));
        assert!(want.can_select(&Platform::new("linux", "arm64")));
        assert!(!want.can_select(&Platform::new("darwin", "arm64")));
    }

    #[test]
    fn arch_must_match_when_present() {
        let want = Platform::new("linux", "arm64");
        assert!(want.can_select(&Platform::new("linux", "arm64")));
        assert!(!want.can_select(&Platform::new("linux", "amd64")));
    }

    #[test]
    fn display_renders_any_arch() {
        assert_eq!(Platform::linux().to_string(), "os=linux, arch=any");
        assert_eq!(
            Platform::new("linux", "amd64").to_string(),
            "os=linux, arch=amd64"
        );
    }
}
