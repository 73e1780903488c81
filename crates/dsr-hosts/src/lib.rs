//! Host registry.
//!
//! A plain immutable lookup from platform to host descriptor, read once at
//! run start. Reachability is not tested here; that is the executor's job.

use std::collections::BTreeMap;

use dsr_types::{HostSpec, Platform, ToolSpec};
use dsr_utils::{ConfigError, DsrError};

/// Lookup failures are configuration errors: every requested platform must
/// resolve to a host before any build starts.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no host registered for platform '{platform}'")]
    NoHostForPlatform { platform: String },

    #[error("host override '{host}' for platform '{platform}' is not in hosts.yaml")]
    UnknownOverride { host: String, platform: String },

    #[error("duplicate host id '{id}' in hosts.yaml")]
    DuplicateHost { id: String },
}

impl From<RegistryError> for DsrError {
    fn from(err: RegistryError) -> Self {
        DsrError::Config(ConfigError::Invalid {
            key: "hosts".to_string(),
            reason: err.to_string(),
        })
    }
}

/// Immutable host registry built from `hosts.yaml`.
#[derive(Debug, Clone)]
pub struct HostRegistry {
    by_id: BTreeMap<String, HostSpec>,
    by_platform: BTreeMap<Platform, String>,
}

impl HostRegistry {
    /// Build a registry from host descriptors. The first host declared for a
    /// platform is that platform's default.
    pub fn new(hosts: Vec<HostSpec>) -> Result<Self, RegistryError> {
        let mut by_id = BTreeMap::new();
        let mut by_platform = BTreeMap::new();
        for host in hosts {
            if by_id.contains_key(&host.id) {
                return Err(RegistryError::DuplicateHost { id: host.id });
            }
            by_platform
                .entry(host.platform.clone())
                .or_insert_with(|| host.id.clone());
            by_id.insert(host.id.clone(), host);
        }
        Ok(Self { by_id, by_platform })
    }

    /// Look up a host by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&HostSpec> {
        self.by_id.get(id)
    }

    /// All registered hosts, in id order.
    pub fn iter(&self) -> impl Iterator<Item = &HostSpec> {
        self.by_id.values()
    }

    /// Resolve the host for a platform, honoring the tool's per-platform
    /// override.
    pub fn resolve(
        &self,
        tool: &ToolSpec,
        platform: &Platform,
    ) -> Result<&HostSpec, RegistryError> {
        if let Some(override_id) = tool.host_overrides.get(&platform.to_string()) {
            return self
                .by_id
                .get(override_id)
                .ok_or_else(|| RegistryError::UnknownOverride {
                    host: override_id.clone(),
                    platform: platform.to_string(),
                });
        }
        let id = self
            .by_platform
            .get(platform)
            .ok_or_else(|| RegistryError::NoHostForPlatform {
                platform: platform.to_string(),
            })?;
        Ok(&self.by_id[id])
    }
}
