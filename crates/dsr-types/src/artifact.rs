//! Build artifacts.

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::platform::Platform;

/// One release artifact.
///
/// Created by a host executor (raw binary or pre-archived), mutated once by
/// the post-processor (renamed, possibly archived, signed), then frozen and
/// referenced by the manifest and publisher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Versioned logical name, e.g. `cass-0.1.64-darwin_arm64.tar.gz`.
    pub name: String,

    /// Compat alias emitted for install-script consumption. Points at the
    /// same bytes as `name` (or at the raw binary when the compat pattern
    /// carries no extension).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compat_alias: Option<String>,

    /// Staged path of the final artifact file.
    pub path: Utf8PathBuf,

    /// Target platform this artifact was built for.
    pub platform: Platform,

    /// Archive format, `None` for a raw binary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_format: Option<String>,

    /// Size in bytes of the final file.
    pub size: u64,

    /// Hex SHA-256 digest of the final file.
    pub sha256: String,

    /// Sidecar signature path when signing is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Utf8PathBuf>,
}
