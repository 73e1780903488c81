//! Tool descriptors and build targets.

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::platform::Platform;

/// Upstream repository coordinates, `owner/name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoCoords {
    pub owner: String,
    pub name: String,
}

impl FromStr for RepoCoords {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() => Ok(Self {
                owner: owner.to_string(),
                name: name.to_string(),
            }),
            _ => Err(format!("repo '{s}' is not of the form owner/name")),
        }
    }
}

impl fmt::Display for RepoCoords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl Serialize for RepoCoords {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RepoCoords {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn default_workflow_path() -> Utf8PathBuf {
    Utf8PathBuf::from(".github/workflows/release.yml")
}

/// One tool descriptor, read from `repos.yaml` or a `repos.d/` file.
///
/// Immutable per run. The config layer validates that every requested
/// platform resolves via naming + job map + host registry before any build
/// starts; unresolved platforms are configuration errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolSpec {
    /// Short tool identifier, used in asset names and staging paths.
    pub tool: String,

    /// Upstream repository the release is published to.
    pub repo: RepoCoords,

    /// Local checkout of the project source.
    pub source_path: Utf8PathBuf,

    /// Declared language, informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    /// Platforms to build, in declared order.
    pub platforms: Vec<Platform>,

    /// CI workflow file within the repo.
    #[serde(default = "default_workflow_path")]
    pub workflow: Utf8PathBuf,

    /// Per-platform host override (`platform` → host id).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub host_overrides: BTreeMap<String, String>,

    /// Versioned artifact naming pattern, e.g.
    /// `${name}-v${version}-${os}-${arch}${ext}`.
    pub asset_pattern: String,

    /// Explicit compat naming pattern for install-script consumption.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_script_compat: Option<String>,

    /// Install script to parse a compat pattern from when no explicit
    /// pattern is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_script_path: Option<Utf8PathBuf>,

    /// Archive format override per OS (`linux`/`darwin`/`windows` → ext).
    /// An empty string means "raw binary, no archive".
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub archive_format: BTreeMap<String, String>,

    /// Target-triple override per platform.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub target_triples: BTreeMap<String, String>,

    /// Architecture aliases applied before substitution, e.g.
    /// `amd64` → `x86_64`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub arch_aliases: BTreeMap<String, String>,

    /// Workflow job per platform. The value `"none"` means the platform has
    /// no hosted job and requires a native host.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub job_map: BTreeMap<String, String>,

    /// Matrix filters per platform, passed to the container runner as
    /// key/value pairs.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub matrix_filters: BTreeMap<String, BTreeMap<String, String>>,

    /// Cross-compile recipe per platform (argv). The analyzer never invents
    /// one; only declared recipes produce a cross-compile strategy.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cross_compile: BTreeMap<String, Vec<String>>,

    /// Build command run on SSH hosts, in a clean working copy at the
    /// target revision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_build_command: Option<String>,

    /// Ceiling for one target's build execution, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_timeout_secs: Option<u64>,
}

impl ToolSpec {
    /// Archive extension for a platform: per-OS override, else the OS
    /// default. `None` means raw binary.
    #[must_use]
    pub fn archive_format_for(&self, platform: &Platform) -> Option<String> {
        match self.archive_format.get(platform.os.as_str()) {
            Some(ext) if ext.is_empty() => None,
            Some(ext) => Some(ext.clone()),
            None => Some(platform.os.default_archive_format().to_string()),
        }
    }

    /// Job-map entry for a platform, if any.
    #[must_use]
    pub fn job_for(&self, platform: &Platform) -> Option<&str> {
        self.job_map.get(&platform.to_string()).map(String::as_str)
    }
}

/// The concrete mechanism used to build one platform.
///
/// The dispatcher consumes the strategy, never a concrete implementation;
/// adding a strategy is a new variant plus an executor case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BuildStrategy {
    /// Run the project's own workflow job in the container emulator.
    ContainerRunner {
        job: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        matrix: BTreeMap<String, String>,
    },
    /// Build natively over SSH on a macOS/Windows host.
    NativeSsh {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job: Option<String>,
    },
    /// Run a declared cross-compile recipe locally.
    CrossCompile { recipe: Vec<String> },
}

impl BuildStrategy {
    /// Short name used in manifests and host-status records.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ContainerRunner { .. } => "container-runner",
            Self::NativeSsh { .. } => "native-ssh",
            Self::CrossCompile { .. } => "cross-compile",
        }
    }
}

/// One `(platform, strategy, host)` tuple, produced by the dispatcher
/// before execution. Exactly one per requested platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTarget {
    pub platform: Platform,
    pub strategy: BuildStrategy,
    pub host: String,
}
