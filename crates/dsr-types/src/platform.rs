//! Target platforms as `os/arch` pairs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Operating systems dsr can build for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Os {
    Linux,
    Darwin,
    Windows,
}

impl Os {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::Darwin => "darwin",
            Self::Windows => "windows",
        }
    }

    /// Default archive extension for assets on this OS.
    #[must_use]
    pub fn default_archive_format(self) -> &'static str {
        match self {
            Self::Windows => "zip",
            Self::Linux | Self::Darwin => "tar.gz",
        }
    }

    /// Executable suffix for raw binaries on this OS.
    #[must_use]
    pub fn exe_suffix(self) -> &'static str {
        match self {
            Self::Windows => ".exe",
            Self::Linux | Self::Darwin => "",
        }
    }
}

/// One `os/arch` pair, e.g. `linux/amd64` or `darwin/arm64`.
///
/// Arch is open-ended; aliasing (e.g. `amd64` → `x86_64`) is applied by the
/// naming resolver, not here.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Platform {
    pub os: Os,
    pub arch: String,
}

impl Platform {
    #[must_use]
    pub fn new(os: Os, arch: impl Into<String>) -> Self {
        Self {
            os,
            arch: arch.into(),
        }
    }
}

/// Error parsing an `os/arch` string.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PlatformParseError {
    #[error("platform '{0}' is not of the form os/arch")]
    Malformed(String),
    #[error("unknown os '{0}' (expected linux, darwin, or windows)")]
    UnknownOs(String),
    #[error("platform '{0}' has an empty arch")]
    EmptyArch(String),
}

impl FromStr for Platform {
    type Err = PlatformParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (os, arch) = s
            .split_once('/')
            .ok_or_else(|| PlatformParseError::Malformed(s.to_string()))?;
        let os = match os {
            "linux" => Os::Linux,
            "darwin" | "macos" => Os::Darwin,
            "windows" => Os::Windows,
            other => return Err(PlatformParseError::UnknownOs(other.to_string())),
        };
        if arch.is_empty() {
            return Err(PlatformParseError::EmptyArch(s.to_string()));
        }
        Ok(Platform::new(os, arch))
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os.as_str(), self.arch)
    }
}

impl Serialize for Platform {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Platform {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
