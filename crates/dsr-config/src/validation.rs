//! Configuration validation.
//!
//! Every requested platform must resolve via naming + job map + host
//! registry to a concrete strategy before any build starts; what cannot
//! resolve is reported here as a configuration issue.

use dsr_hosts::HostRegistry;
use dsr_types::{Os, ToolSpec};

use crate::ConfigSet;

/// One validation finding, attributed to a tool (or the shared documents).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub tool: Option<String>,
    pub message: String,
}

impl ValidationIssue {
    fn global(message: impl Into<String>) -> Self {
        Self {
            tool: None,
            message: message.into(),
        }
    }

    fn for_tool(tool: &ToolSpec, message: impl Into<String>) -> Self {
        Self {
            tool: Some(tool.tool.clone()),
            message: message.into(),
        }
    }
}

/// Validate a loaded configuration. Empty result means valid.
#[must_use]
pub fn validate(config: &ConfigSet) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    let registry = match HostRegistry::new(config.hosts.clone()) {
        Ok(registry) => registry,
        Err(err) => {
            issues.push(ValidationIssue::global(err.to_string()));
            return issues;
        }
    };

    for tool in &config.tools {
        if tool.platforms.is_empty() && config.settings.default_platforms.is_empty() {
            issues.push(ValidationIssue::for_tool(
                tool,
                "no platforms requested and no default_platforms configured",
            ));
        }

        let mut needs_native_recipe = false;
        for platform in &tool.platforms {
            // Naming must resolve for every platform before any build.
            if let Err(err) = dsr_naming::resolve(tool, "0.0.0", platform) {
                issues.push(ValidationIssue::for_tool(
                    tool,
                    format!("{platform}: {err}"),
                ));
            }

            // Cross-compiled platforms run locally and need no host entry.
            if tool.cross_compile.contains_key(&platform.to_string()) {
                continue;
            }
            if let Err(err) = registry.resolve(tool, platform) {
                issues.push(ValidationIssue::for_tool(tool, err.to_string()));
            }
            let null_mapped = tool.job_for(platform) == Some("none");
            if matches!(platform.os, Os::Darwin | Os::Windows) || null_mapped {
                needs_native_recipe = true;
            }
        }

        if needs_native_recipe && tool.native_build_command.is_none() {
            issues.push(ValidationIssue::for_tool(
                tool,
                "native_build_command is required for SSH-built platforms",
            ));
        }
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CliOverrides, EnvSource, load};
    use camino::Utf8PathBuf;

    fn loaded(dir: &tempfile::TempDir, hosts: &str, tool: &str) -> ConfigSet {
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        std::fs::write(root.join("hosts.yaml").as_std_path(), hosts).unwrap();
        std::fs::create_dir_all(root.join("repos.d").as_std_path()).unwrap();
        std::fs::write(root.join("repos.d/tool.yaml").as_std_path(), tool).unwrap();
        load(&root, &CliOverrides::default(), &EnvSource::default()).unwrap()
    }

    const HOSTS: &str = r#"
schema_version: 1
hosts:
  - id: local-linux
    platform: linux/amd64
    kind: container-runner
  - id: mac-mini
    platform: darwin/arm64
    kind: ssh
    ssh_alias: mac-mini.local
"#;

    #[test]
    fn complete_descriptor_validates_clean() {
        let dir = tempfile::tempdir().unwrap();
        let config = loaded(
            &dir,
            HOSTS,
            r#"
tool: cass
repo: someuser/cass
source_path: /src/cass
platforms: [linux/amd64, darwin/arm64]
asset_pattern: "${name}-${version}-${target}${ext}"
native_build_command: "make release"
"#,
        );
        assert!(validate(&config).is_empty());
    }

    #[test]
    fn unmapped_platform_is_reported_before_build() {
        let dir = tempfile::tempdir().unwrap();
        let config = loaded(
            &dir,
            HOSTS,
            r#"
tool: cass
repo: someuser/cass
source_path: /src/cass
platforms: [windows/amd64]
asset_pattern: "${name}-${version}-${target}${ext}"
native_build_command: "make release"
"#,
        );
        let issues = validate(&config);
        assert_eq!(issues.len(), 1);
        assert!(issues[0].message.contains("windows/amd64"));
    }

    #[test]
    fn bad_pattern_variable_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config = loaded(
            &dir,
            HOSTS,
            r#"
tool: cass
repo: someuser/cass
source_path: /src/cass
platforms: [linux/amd64]
asset_pattern: "${name}-${flavor}"
"#,
        );
        let issues = validate(&config);
        assert_eq!(issues.len(), 1);
        assert!(issues[0].message.contains("flavor"));
    }

    #[test]
    fn ssh_platforms_require_native_recipe() {
        let dir = tempfile::tempdir().unwrap();
        let config = loaded(
            &dir,
            HOSTS,
            r#"
tool: cass
repo: someuser/cass
source_path: /src/cass
platforms: [darwin/arm64]
asset_pattern: "${name}-${version}-${target}${ext}"
"#,
        );
        let issues = validate(&config);
        assert_eq!(issues.len(), 1);
        assert!(issues[0].message.contains("native_build_command"));
    }

    #[test]
    fn cross_compiled_platform_needs_no_host() {
        let dir = tempfile::tempdir().unwrap();
        let config = loaded(
            &dir,
            HOSTS,
            r#"
tool: cass
repo: someuser/cass
source_path: /src/cass
platforms: [linux/arm64]
asset_pattern: "${name}-${version}-${target}${ext}"
cross_compile:
  linux/arm64: [make, cross-arm64]
"#,
        );
        assert!(validate(&config).is_empty());
    }
}
