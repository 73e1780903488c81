//! Serde models for the three configuration documents.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use dsr_types::{HostSpec, Platform, ToolSpec};

fn default_schema_version() -> u32 {
    1
}

fn default_threshold() -> u64 {
    600
}

fn default_concurrency() -> usize {
    4
}

fn default_build_timeout() -> u64 {
    3600
}

fn default_watch_interval() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_sbom_format() -> String {
    "spdx-json".to_string()
}

/// `config.yaml`: top-level behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,

    /// Queue age past which a repo counts as throttled, seconds.
    #[serde(default = "default_threshold")]
    pub threshold_secs: u64,

    /// Platforms assumed when a tool descriptor lists none.
    #[serde(default)]
    pub default_platforms: Vec<Platform>,

    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,

    #[serde(default = "default_watch_interval")]
    pub watch_interval_secs: u64,

    #[serde(default)]
    pub signing: SigningConfig,

    #[serde(default)]
    pub sbom: SbomConfig,

    #[serde(default)]
    pub release: ReleaseConfig,

    #[serde(default)]
    pub log_level: Option<String>,

    /// Self-hosted runner label classification
    /// (label → `container-runner` | `darwin` | `windows`).
    #[serde(default)]
    pub runner_labels: BTreeMap<String, String>,
}

impl Default for ConfigFile {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty config deserializes")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SigningConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub key_path: Option<Utf8PathBuf>,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SbomConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_sbom_format")]
    pub format: String,
}

impl Default for SbomConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            format: default_sbom_format(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReleaseConfig {
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub prerelease: bool,
}

/// `hosts.yaml`: the host registry document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostsFile {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub hosts: Vec<HostSpec>,
}

/// `repos.yaml`: tool descriptors in one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReposFile {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
}

/// Effective settings after flag/env/file/default merging.
#[derive(Debug, Clone)]
pub struct Settings {
    pub threshold_secs: u64,
    pub default_platforms: Vec<Platform>,
    pub concurrency: usize,
    pub build_timeout_secs: u64,
    pub watch_interval_secs: u64,
    pub signing_enabled: bool,
    pub signing_key: Option<Utf8PathBuf>,
    pub sbom_enabled: bool,
    pub sbom_format: String,
    pub release_draft: bool,
    pub release_prerelease: bool,
    pub log_level: Option<String>,
    pub runner_labels: BTreeMap<String, String>,
}

impl Settings {
    #[must_use]
    pub fn from_file(file: &ConfigFile) -> Self {
        Self {
            threshold_secs: file.threshold_secs,
            default_platforms: file.default_platforms.clone(),
            concurrency: file.concurrency,
            build_timeout_secs: file.build_timeout_secs,
            watch_interval_secs: file.watch_interval_secs,
            signing_enabled: file.signing.enabled,
            signing_key: file.signing.key_path.clone(),
            sbom_enabled: file.sbom.enabled,
            sbom_format: file.sbom.format.clone(),
            release_draft: file.release.draft,
            release_prerelease: file.release.prerelease,
            log_level: file.log_level.clone(),
            runner_labels: file.runner_labels.clone(),
        }
    }
}

pub(crate) const STARTER_CONFIG: &str = r#"# dsr configuration
schema_version: 1

# Hosted-CI queue age (seconds) past which a repo counts as throttled.
threshold_secs: 600

# Parallel build targets.
concurrency: 4

# Ceiling for one target's build (seconds).
build_timeout_secs: 3600

# Watch-mode polling interval (seconds); each sleep is jittered +/-20%.
watch_interval_secs: 300

signing:
  enabled: true
  # key_path: ~/.minisign/minisign.key

sbom:
  enabled: true
  format: spdx-json

release:
  draft: false
  prerelease: false
"#;

pub(crate) const STARTER_HOSTS: &str = r#"# dsr host registry
schema_version: 1

hosts:
  - id: local-linux
    platform: linux/amd64
    kind: container-runner
  # - id: mac-mini
  #   platform: darwin/arm64
  #   kind: ssh
  #   ssh_alias: mac-mini.local
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let file = ConfigFile::default();
        assert_eq!(file.schema_version, 1);
        assert_eq!(file.threshold_secs, 600);
        assert_eq!(file.concurrency, 4);
        assert_eq!(file.build_timeout_secs, 3600);
        assert_eq!(file.watch_interval_secs, 300);
        assert!(file.signing.enabled);
        assert!(file.sbom.enabled);
        assert!(!file.release.draft);
    }

    #[test]
    fn starter_documents_parse() {
        let config: ConfigFile = serde_yaml::from_str(STARTER_CONFIG).unwrap();
        assert_eq!(config.threshold_secs, 600);
        let hosts: HostsFile = serde_yaml::from_str(STARTER_HOSTS).unwrap();
        assert_eq!(hosts.hosts.len(), 1);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = serde_yaml::from_str::<ConfigFile>("schema_version: 1\nbogus: 1\n");
        assert!(err.is_err());
    }
}
