//! The per-build manifest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::Artifact;
use crate::platform::Platform;

/// Manifest schema version. Bumped on breaking changes to the JSON shape.
pub const MANIFEST_SCHEMA_VERSION: &str = "1";

/// Terminal status of one build target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Success,
    Error,
    Timeout,
}

/// Per-host status record. The manifest holds exactly one per requested
/// platform, in declared platform order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostStatus {
    pub host: String,
    pub platform: Platform,
    pub strategy: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<String>,
    pub status: TargetStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Identity of the builder that produced a manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderInfo {
    /// Always `"dsr"`.
    pub name: String,
    /// dsr version that ran the build.
    pub version: String,
    /// What fired the run: `manual`, `watch`, or `fallback`.
    pub trigger: String,
}

/// Schema-versioned summary of one build.
///
/// Invariants: one entry per artifact; digests match file contents; the
/// host-status set equals the requested platform set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: String,
    pub tool: String,
    pub version: String,
    pub run_id: String,
    /// Upstream revision the artifacts were built from.
    pub revision: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub builder: BuilderInfo,
    pub artifacts: Vec<Artifact>,
    pub hosts: Vec<HostStatus>,
    pub checksums_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sbom_file: Option<String>,
    /// `"signed"` or `"skipped"`.
    pub signing: String,
}

impl Manifest {
    /// Check the host-status-per-platform invariant against a requested
    /// platform list.
    #[must_use]
    pub fn covers_platforms(&self, platforms: &[Platform]) -> bool {
        platforms.len() == self.hosts.len()
            && platforms
                .iter()
                .all(|p| self.hosts.iter().filter(|h| &h.platform == p).count() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::Os;

    fn status(platform: Platform) -> HostStatus {
        HostStatus {
            host: "local".into(),
            platform,
            strategy: "container-runner".into(),
            duration_ms: 100,
            job: Some("build".into()),
            status: TargetStatus::Success,
            error: None,
        }
    }

    fn manifest(hosts: Vec<HostStatus>) -> Manifest {
        Manifest {
            schema_version: MANIFEST_SCHEMA_VERSION.into(),
            tool: "cass".into(),
            version: "0.1.64".into(),
            run_id: "run".into(),
            revision: "abc123".into(),
            started_at: Utc::now(),
            duration_ms: 1000,
            builder: BuilderInfo {
                name: "dsr".into(),
                version: "0.3.0".into(),
                trigger: "manual".into(),
            },
            artifacts: vec![],
            hosts,
            checksums_file: "cass-0.1.64-checksums.sha256".into(),
            signature_file: None,
            sbom_file: None,
            signing: "skipped".into(),
        }
    }

    #[test]
    fn covers_platforms_requires_exactly_one_record_each() {
        let linux = Platform::new(Os::Linux, "amd64");
        let darwin = Platform::new(Os::Darwin, "arm64");

        let m = manifest(vec![status(linux.clone()), status(darwin.clone())]);
        assert!(m.covers_platforms(&[linux.clone(), darwin.clone()]));
        assert!(!m.covers_platforms(&[linux.clone()]));

        let m = manifest(vec![status(linux.clone()), status(linux.clone())]);
        assert!(!m.covers_platforms(&[linux, darwin]));
    }

    #[test]
    fn target_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&TargetStatus::Timeout).unwrap(),
            r#""timeout""#
        );
    }
}
