//! Configuration loading and validation.
//!
//! Three schema-versioned YAML documents live in the config directory:
//! `config.yaml` (behavior), `hosts.yaml` (the host registry), and
//! `repos.yaml` or a `repos.d/` directory of per-tool files (tool
//! descriptors).
//!
//! Precedence for every effective setting: explicit flag > `DSR_<KEY>`
//! environment variable > config file > built-in default.

mod model;
mod validation;

pub use model::{ConfigFile, HostsFile, ReposFile, Settings};
pub use validation::{ValidationIssue, validate};

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use dsr_types::{HostSpec, ToolSpec};
use dsr_utils::{ConfigError, DsrError};

/// Supported schema version for all three documents.
pub const CONFIG_SCHEMA_VERSION: u32 = 1;

/// Flag-level overrides, filled by the CLI from explicit flags only.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub threshold_secs: Option<u64>,
    pub concurrency: Option<usize>,
    pub build_timeout_secs: Option<u64>,
    pub watch_interval_secs: Option<u64>,
    pub log_level: Option<String>,
}

/// Environment snapshot, so precedence stays testable without touching
/// process globals.
#[derive(Debug, Clone, Default)]
pub struct EnvSource {
    vars: BTreeMap<String, String>,
}

impl EnvSource {
    /// Capture `DSR_*` variables from the process environment.
    #[must_use]
    pub fn from_process() -> Self {
        let vars = std::env::vars()
            .filter(|(k, _)| k.starts_with("DSR_"))
            .collect();
        Self { vars }
    }

    #[must_use]
    pub fn from_map(vars: BTreeMap<String, String>) -> Self {
        Self { vars }
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, DsrError> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| {
                ConfigError::Invalid {
                    key: key.to_string(),
                    reason: format!("cannot parse '{raw}'"),
                }
                .into()
            }),
        }
    }
}

/// The fully loaded configuration: effective settings, host registry input,
/// and every tool descriptor.
#[derive(Debug, Clone)]
pub struct ConfigSet {
    pub settings: Settings,
    pub hosts: Vec<HostSpec>,
    pub tools: Vec<ToolSpec>,
}

impl ConfigSet {
    #[must_use]
    pub fn tool(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|t| t.tool == name)
    }
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Utf8Path) -> Result<Option<T>, DsrError> {
    match std::fs::read_to_string(path.as_std_path()) {
        Err(_) => Ok(None),
        Ok(content) => serde_yaml::from_str(&content).map(Some).map_err(|e| {
            ConfigError::Invalid {
                key: path.to_string(),
                reason: e.to_string(),
            }
            .into()
        }),
    }
}

fn check_schema(version: u32, path: &Utf8Path) -> Result<(), DsrError> {
    if version != CONFIG_SCHEMA_VERSION {
        return Err(ConfigError::Invalid {
            key: path.to_string(),
            reason: format!(
                "schema_version {version} is not supported (expected {CONFIG_SCHEMA_VERSION})"
            ),
        }
        .into());
    }
    Ok(())
}

/// Load the configuration from a config directory.
pub fn load(
    config_dir: &Utf8Path,
    overrides: &CliOverrides,
    env: &EnvSource,
) -> Result<ConfigSet, DsrError> {
    // config.yaml
    let config_file: ConfigFile = match read_yaml(&config_dir.join("config.yaml"))? {
        Some(file) => file,
        None => ConfigFile::default(),
    };
    check_schema(config_file.schema_version, &config_dir.join("config.yaml"))?;

    let settings = merge_settings(&config_file, overrides, env)?;

    // hosts.yaml
    let hosts = match read_yaml::<HostsFile>(&config_dir.join("hosts.yaml"))? {
        Some(file) => {
            check_schema(file.schema_version, &config_dir.join("hosts.yaml"))?;
            file.hosts
        }
        None => Vec::new(),
    };

    // repos.yaml and/or repos.d/*.yaml
    let mut tools = Vec::new();
    if let Some(file) = read_yaml::<ReposFile>(&config_dir.join("repos.yaml"))? {
        check_schema(file.schema_version, &config_dir.join("repos.yaml"))?;
        tools.extend(file.tools);
    }
    let repos_d = config_dir.join("repos.d");
    if repos_d.as_std_path().is_dir() {
        let mut entries: Vec<_> = std::fs::read_dir(repos_d.as_std_path())
            .map_err(DsrError::Io)?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| {
                p.extension()
                    .is_some_and(|ext| ext == "yaml" || ext == "yml")
            })
            .collect();
        entries.sort();
        for entry in entries {
            let path = Utf8PathBuf::from_path_buf(entry)
                .map_err(|p| ConfigError::Invalid {
                    key: "repos.d".to_string(),
                    reason: format!("non-UTF-8 path: {}", p.display()),
                })?;
            if let Some(tool) = read_yaml::<ToolSpec>(&path)? {
                tools.push(tool);
            }
        }
    }

    for tool in &tools {
        if tools.iter().filter(|t| t.tool == tool.tool).count() > 1 {
            return Err(ConfigError::Invalid {
                key: "repos".to_string(),
                reason: format!("duplicate tool descriptor '{}'", tool.tool),
            }
            .into());
        }
    }

    debug!(tools = tools.len(), hosts = hosts.len(), "configuration loaded");
    Ok(ConfigSet {
        settings,
        hosts,
        tools,
    })
}

fn merge_settings(
    file: &ConfigFile,
    overrides: &CliOverrides,
    env: &EnvSource,
) -> Result<Settings, DsrError> {
    let mut settings = Settings::from_file(file);

    if let Some(v) = env.parsed::<u64>("DSR_THRESHOLD")? {
        settings.threshold_secs = v;
    }
    if let Some(v) = env.parsed::<usize>("DSR_CONCURRENCY")? {
        settings.concurrency = v;
    }
    if let Some(v) = env.parsed::<u64>("DSR_BUILD_TIMEOUT")? {
        settings.build_timeout_secs = v;
    }
    if let Some(v) = env.parsed::<u64>("DSR_WATCH_INTERVAL")? {
        settings.watch_interval_secs = v;
    }
    if let Some(v) = env.get("DSR_LOG_LEVEL") {
        settings.log_level = Some(v.to_string());
    }

    if let Some(v) = overrides.threshold_secs {
        settings.threshold_secs = v;
    }
    if let Some(v) = overrides.concurrency {
        settings.concurrency = v;
    }
    if let Some(v) = overrides.build_timeout_secs {
        settings.build_timeout_secs = v;
    }
    if let Some(v) = overrides.watch_interval_secs {
        settings.watch_interval_secs = v;
    }
    if let Some(v) = &overrides.log_level {
        settings.log_level = Some(v.clone());
    }

    if settings.concurrency == 0 {
        return Err(ConfigError::Invalid {
            key: "concurrency".to_string(),
            reason: "must be at least 1".to_string(),
        }
        .into());
    }
    Ok(settings)
}

/// Write starter `config.yaml` and `hosts.yaml` files for `config init`.
pub fn write_starter_config(config_dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, DsrError> {
    dsr_utils::paths::ensure_dir_all(&config_dir.to_owned())?;
    let mut written = Vec::new();

    let config_path = config_dir.join("config.yaml");
    if !config_path.as_std_path().exists() {
        dsr_utils::paths::atomic_write(&config_path, model::STARTER_CONFIG)?;
        written.push(config_path);
    }
    let hosts_path = config_dir.join("hosts.yaml");
    if !hosts_path.as_std_path().exists() {
        dsr_utils::paths::atomic_write(&hosts_path, model::STARTER_HOSTS)?;
        written.push(hosts_path);
    }
    dsr_utils::paths::ensure_dir_all(&config_dir.join("repos.d"))?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_dir(dir: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
    }

    #[test]
    fn empty_directory_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let set = load(
            &config_dir(&dir),
            &CliOverrides::default(),
            &EnvSource::default(),
        )
        .unwrap();
        assert_eq!(set.settings.threshold_secs, 600);
        assert!(set.hosts.is_empty());
        assert!(set.tools.is_empty());
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let root = config_dir(&dir);
        std::fs::write(
            root.join("config.yaml").as_std_path(),
            "schema_version: 1\nthreshold_secs: 120\nconcurrency: 8\n",
        )
        .unwrap();

        let set = load(&root, &CliOverrides::default(), &EnvSource::default()).unwrap();
        assert_eq!(set.settings.threshold_secs, 120);
        assert_eq!(set.settings.concurrency, 8);
    }

    #[test]
    fn env_beats_file_and_flag_beats_env() {
        let dir = tempfile::tempdir().unwrap();
        let root = config_dir(&dir);
        std::fs::write(
            root.join("config.yaml").as_std_path(),
            "schema_version: 1\nthreshold_secs: 120\n",
        )
        .unwrap();

        let env = EnvSource::from_map(BTreeMap::from([(
            "DSR_THRESHOLD".to_string(),
            "300".to_string(),
        )]));
        let set = load(&root, &CliOverrides::default(), &env).unwrap();
        assert_eq!(set.settings.threshold_secs, 300);

        let overrides = CliOverrides {
            threshold_secs: Some(45),
            ..CliOverrides::default()
        };
        let set = load(&root, &overrides, &env).unwrap();
        assert_eq!(set.settings.threshold_secs, 45);
    }

    #[test]
    fn unparseable_env_value_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let env = EnvSource::from_map(BTreeMap::from([(
            "DSR_THRESHOLD".to_string(),
            "soon".to_string(),
        )]));
        let err = load(&config_dir(&dir), &CliOverrides::default(), &env).unwrap_err();
        assert_eq!(err.code(), "E030");
    }

    #[test]
    fn loads_hosts_and_repos_d() {
        let dir = tempfile::tempdir().unwrap();
        let root = config_dir(&dir);
        std::fs::write(
            root.join("hosts.yaml").as_std_path(),
            r#"
schema_version: 1
hosts:
  - id: local-linux
    platform: linux/amd64
    kind: container-runner
"#,
        )
        .unwrap();
        std::fs::create_dir_all(root.join("repos.d").as_std_path()).unwrap();
        std::fs::write(
            root.join("repos.d/cass.yaml").as_std_path(),
            r#"
tool: cass
repo: someuser/cass
source_path: /src/cass
platforms: [linux/amd64]
asset_pattern: "${name}-${version}-${target}${ext}"
"#,
        )
        .unwrap();

        let set = load(&root, &CliOverrides::default(), &EnvSource::default()).unwrap();
        assert_eq!(set.hosts.len(), 1);
        assert_eq!(set.tools.len(), 1);
        assert!(set.tool("cass").is_some());
        assert!(set.tool("ghost").is_none());
    }

    #[test]
    fn duplicate_tools_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let root = config_dir(&dir);
        let descriptor = r#"
tool: cass
repo: someuser/cass
source_path: /src/cass
platforms: [linux/amd64]
asset_pattern: "${name}-${version}-${target}${ext}"
"#;
        std::fs::create_dir_all(root.join("repos.d").as_std_path()).unwrap();
        std::fs::write(root.join("repos.d/a.yaml").as_std_path(), descriptor).unwrap();
        std::fs::write(root.join("repos.d/b.yaml").as_std_path(), descriptor).unwrap();

        let err = load(&root, &CliOverrides::default(), &EnvSource::default()).unwrap_err();
        assert_eq!(err.code(), "E030");
    }

    #[test]
    fn unsupported_schema_version_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let root = config_dir(&dir);
        std::fs::write(
            root.join("config.yaml").as_std_path(),
            "schema_version: 99\n",
        )
        .unwrap();
        let err = load(&root, &CliOverrides::default(), &EnvSource::default()).unwrap_err();
        assert_eq!(err.code(), "E030");
    }

    #[test]
    fn starter_config_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let root = config_dir(&dir);
        let written = write_starter_config(&root).unwrap();
        assert_eq!(written.len(), 2);

        // Second call writes nothing and clobbers nothing.
        std::fs::write(root.join("config.yaml").as_std_path(), "# edited\nschema_version: 1\n")
            .unwrap();
        let written = write_starter_config(&root).unwrap();
        assert!(written.is_empty());
        let content = std::fs::read_to_string(root.join("config.yaml").as_std_path()).unwrap();
        assert!(content.starts_with("# edited"));
    }
}
