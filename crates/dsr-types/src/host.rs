//! Build host descriptors.

use serde::{Deserialize, Serialize};

use crate::platform::Platform;

/// How a host is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionKind {
    /// The machine dsr itself runs on.
    Local,
    /// Linux builds through the container workflow emulator.
    ContainerRunner,
    /// A remote builder reached over SSH.
    Ssh,
}

/// One entry of the host registry, read once at run start and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostSpec {
    /// Host id, referenced by overrides and manifests.
    pub id: String,

    /// The platform this host builds.
    pub platform: Platform,

    /// Connection kind.
    pub kind: ConnectionKind,

    /// SSH alias from the user's ssh config, required when `kind` is `ssh`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_alias: Option<String>,
}
