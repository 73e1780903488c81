//! Operational surface: `prune`, `repos`, and `config` subcommands.

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};

use dsr_config::{ConfigFile, validate};
use dsr_types::{ErrorEntry, RunStatus, envelope::EnvelopeBuilder};
use dsr_utils::{ConfigError, DsrError, ExitCode};

use crate::cli::{CommandOutput, ConfigCommands, ReposCommands};
use crate::cli::commands::App;

fn unsupported(command: &str, subcommand: &str) -> CommandOutput {
    let err = DsrError::Config(ConfigError::Invalid {
        key: format!("{command} {subcommand}"),
        reason: "not supported in this build".to_string(),
    });
    CommandOutput::from_error(command, "", &err)
}

fn success(builder: EnvelopeBuilder, stdout_lines: Vec<String>) -> CommandOutput {
    CommandOutput {
        envelope: builder.finish(RunStatus::Success, ExitCode::SUCCESS),
        stdout_lines,
    }
}

// ---- prune ----

/// Delete staged run trees and archived manifests older than the retention
/// window. Honors `--dry-run`.
pub fn prune(app: &App, older_than_days: i64) -> CommandOutput {
    let mut builder = EnvelopeBuilder::begin("prune", "", "");
    let cutoff = Utc::now() - chrono::Duration::days(older_than_days);
    let mut removed = Vec::new();

    let runs_dir = dsr_utils::paths::state_dir().join("runs");
    collect_old_dirs(&runs_dir, 3, cutoff, &mut removed);

    let manifest_dir = dsr_utils::paths::state_dir().join("manifests");
    if let Ok(entries) = std::fs::read_dir(manifest_dir.as_std_path()) {
        for entry in entries.filter_map(Result::ok) {
            if is_older_than(&entry.path(), cutoff) {
                removed.push(entry.path());
            }
        }
    }

    if !app.dry_run {
        for path in &removed {
            let result = if path.is_dir() {
                std::fs::remove_dir_all(path)
            } else {
                std::fs::remove_file(path)
            };
            if let Err(e) = result {
                tracing::warn!(path = %path.display(), error = %e, "prune failed");
            }
        }
    }

    let stdout_lines: Vec<String> = removed
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    builder.insert_detail(
        "pruned",
        serde_json::json!({
            "count": removed.len(),
            "dry_run": app.dry_run,
            "older_than_days": older_than_days,
        }),
    );
    success(builder, stdout_lines)
}

/// Walk `depth` directory levels (tool/version/run), collecting leaves
/// whose mtime precedes the cutoff.
fn collect_old_dirs(
    dir: &Utf8PathBuf,
    depth: usize,
    cutoff: DateTime<Utc>,
    out: &mut Vec<std::path::PathBuf>,
) {
    let Ok(entries) = std::fs::read_dir(dir.as_std_path()) else {
        return;
    };
    for entry in entries.filter_map(Result::ok) {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if depth == 1 {
            if is_older_than(&path, cutoff) {
                out.push(path);
            }
        } else if let Ok(p) = Utf8PathBuf::from_path_buf(path) {
            collect_old_dirs(&p, depth - 1, cutoff, out);
        }
    }
}

fn is_older_than(path: &std::path::Path, cutoff: DateTime<Utc>) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .is_ok_and(|mtime| mtime < cutoff)
}

// ---- repos ----

pub fn repos(app: &App, command: ReposCommands) -> CommandOutput {
    match command {
        ReposCommands::List => {
            let builder = EnvelopeBuilder::begin("repos", "", "");
            let stdout_lines = app
                .config
                .tools
                .iter()
                .map(|t| {
                    format!(
                        "{} {} [{}]",
                        t.tool,
                        t.repo,
                        t.platforms
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join(", ")
                    )
                })
                .collect();
            success(builder, stdout_lines)
        }

        ReposCommands::Info { tool } => {
            let Some(spec) = app.config.tool(&tool) else {
                let err = DsrError::Config(ConfigError::MissingRequired {
                    key: format!("repos.d: no descriptor for tool '{tool}'"),
                });
                return CommandOutput::from_error("repos", &tool, &err);
            };
            let mut builder = EnvelopeBuilder::begin("repos", &tool, "");
            builder.insert_detail(
                "descriptor",
                serde_json::to_value(spec).unwrap_or_default(),
            );
            let yaml = serde_yaml::to_string(spec).unwrap_or_default();
            success(builder, yaml.lines().map(String::from).collect())
        }

        ReposCommands::Add {
            tool,
            repo,
            source_path,
        } => {
            if app.config.tool(&tool).is_some() {
                let err = DsrError::Config(ConfigError::Invalid {
                    key: "repos".to_string(),
                    reason: format!("tool '{tool}' already exists"),
                });
                return CommandOutput::from_error("repos", &tool, &err);
            }
            if repo.parse::<dsr_types::RepoCoords>().is_err() {
                let err = DsrError::Config(ConfigError::Invalid {
                    key: "repo".to_string(),
                    reason: format!("'{repo}' is not of the form owner/name"),
                });
                return CommandOutput::from_error("repos", &tool, &err);
            }

            let descriptor = format!(
                r#"tool: {tool}
repo: {repo}
source_path: {}
platforms:
  - linux/amd64
asset_pattern: "${{name}}-v${{version}}-${{os}}-${{arch}}${{ext}}"
"#,
                source_path.display()
            );
            let path = app.config_dir.join("repos.d").join(format!("{tool}.yaml"));
            if app.dry_run {
                let builder = EnvelopeBuilder::begin("repos", &tool, "");
                return success(builder, vec![path.to_string()]);
            }
            if let Err(e) = dsr_utils::paths::atomic_write(&path, &descriptor) {
                return CommandOutput::from_error("repos", &tool, &e.into());
            }
            let builder = EnvelopeBuilder::begin("repos", &tool, "");
            success(builder, vec![path.to_string()])
        }

        ReposCommands::Remove { tool } => {
            let path = app.config_dir.join("repos.d").join(format!("{tool}.yaml"));
            if !path.as_std_path().exists() {
                let err = DsrError::Config(ConfigError::MissingRequired {
                    key: format!("repos.d/{tool}.yaml"),
                });
                return CommandOutput::from_error("repos", &tool, &err);
            }
            if !app.dry_run {
                if let Err(e) = std::fs::remove_file(path.as_std_path()) {
                    return CommandOutput::from_error("repos", &tool, &e.into());
                }
            }
            let builder = EnvelopeBuilder::begin("repos", &tool, "");
            success(builder, vec![path.to_string()])
        }

        ReposCommands::Validate => {
            let mut builder = EnvelopeBuilder::begin("repos", "", "");
            let issues = validate(&app.config);
            if issues.is_empty() {
                return success(builder, vec!["valid".to_string()]);
            }
            for issue in &issues {
                builder.push_error(ErrorEntry {
                    code: "E030".to_string(),
                    message: issue.message.clone(),
                    target: issue.tool.clone(),
                });
            }
            CommandOutput {
                envelope: builder.finish(RunStatus::Error, ExitCode::INVALID_CONFIG),
                stdout_lines: Vec::new(),
            }
        }

        ReposCommands::Discover => unsupported("repos", "discover"),
        ReposCommands::Sync => unsupported("repos", "sync"),
    }
}

// ---- config ----

pub fn config_cmd(app: &App, command: ConfigCommands) -> CommandOutput {
    match command {
        ConfigCommands::Show => {
            let settings = &app.config.settings;
            let lines = vec![
                format!("config_dir: {}", app.config_dir),
                format!("state_dir: {}", dsr_utils::paths::state_dir()),
                format!("cache_dir: {}", dsr_utils::paths::cache_dir()),
                format!("threshold_secs: {}", settings.threshold_secs),
                format!("concurrency: {}", settings.concurrency),
                format!("build_timeout_secs: {}", settings.build_timeout_secs),
                format!("watch_interval_secs: {}", settings.watch_interval_secs),
                format!("signing.enabled: {}", settings.signing_enabled),
                format!(
                    "signing.key_path: {}",
                    settings
                        .signing_key
                        .as_ref()
                        .map_or("(none)", |p| p.as_str())
                ),
                format!("sbom.enabled: {}", settings.sbom_enabled),
                format!("sbom.format: {}", settings.sbom_format),
                format!("release.draft: {}", settings.release_draft),
                format!("release.prerelease: {}", settings.release_prerelease),
            ];
            let mut builder = EnvelopeBuilder::begin("config", "", "");
            builder.insert_detail(
                "settings",
                serde_json::json!({
                    "threshold_secs": settings.threshold_secs,
                    "concurrency": settings.concurrency,
                    "build_timeout_secs": settings.build_timeout_secs,
                    "watch_interval_secs": settings.watch_interval_secs,
                    "signing_enabled": settings.signing_enabled,
                    "sbom_enabled": settings.sbom_enabled,
                }),
            );
            success(builder, lines)
        }

        ConfigCommands::Get { key } => {
            let settings = &app.config.settings;
            let value = match key.as_str() {
                "threshold_secs" => settings.threshold_secs.to_string(),
                "concurrency" => settings.concurrency.to_string(),
                "build_timeout_secs" => settings.build_timeout_secs.to_string(),
                "watch_interval_secs" => settings.watch_interval_secs.to_string(),
                "signing.enabled" => settings.signing_enabled.to_string(),
                "sbom.enabled" => settings.sbom_enabled.to_string(),
                "sbom.format" => settings.sbom_format.clone(),
                "release.draft" => settings.release_draft.to_string(),
                "release.prerelease" => settings.release_prerelease.to_string(),
                other => {
                    let err = DsrError::Config(ConfigError::Invalid {
                        key: other.to_string(),
                        reason: "unknown configuration key".to_string(),
                    });
                    return CommandOutput::from_error("config", "", &err);
                }
            };
            let builder = EnvelopeBuilder::begin("config", "", "");
            success(builder, vec![value])
        }

        ConfigCommands::Set { key, value } => match set_config_key(app, &key, &value) {
            Ok(path) => {
                let builder = EnvelopeBuilder::begin("config", "", "");
                success(builder, vec![path.to_string()])
            }
            Err(err) => CommandOutput::from_error("config", "", &err),
        },

        ConfigCommands::Init => match dsr_config::write_starter_config(&app.config_dir) {
            Ok(written) => {
                let builder = EnvelopeBuilder::begin("config", "", "");
                success(
                    builder,
                    written.iter().map(ToString::to_string).collect(),
                )
            }
            Err(err) => CommandOutput::from_error("config", "", &err),
        },

        ConfigCommands::Validate => {
            let mut builder = EnvelopeBuilder::begin("config", "", "");
            let issues = validate(&app.config);
            if issues.is_empty() {
                return success(builder, vec!["valid".to_string()]);
            }
            for issue in &issues {
                builder.push_error(ErrorEntry {
                    code: "E030".to_string(),
                    message: issue.message.clone(),
                    target: issue.tool.clone(),
                });
            }
            CommandOutput {
                envelope: builder.finish(RunStatus::Error, ExitCode::INVALID_CONFIG),
                stdout_lines: Vec::new(),
            }
        }

        ConfigCommands::Migrate => unsupported("config", "migrate"),
        ConfigCommands::Edit => unsupported("config", "edit"),
    }
}

/// Apply one `config set` to config.yaml, preserving everything else.
fn set_config_key(app: &App, key: &str, value: &str) -> Result<Utf8PathBuf, DsrError> {
    let path = app.config_dir.join("config.yaml");
    let mut file: ConfigFile = match std::fs::read_to_string(path.as_std_path()) {
        Ok(content) => serde_yaml::from_str(&content).map_err(|e| ConfigError::Invalid {
            key: path.to_string(),
            reason: e.to_string(),
        })?,
        Err(_) => ConfigFile::default(),
    };

    let parse_err = |reason: String| {
        DsrError::Config(ConfigError::Invalid {
            key: key.to_string(),
            reason,
        })
    };
    match key {
        "threshold_secs" => {
            file.threshold_secs = value.parse().map_err(|_| parse_err(format!("'{value}' is not a number")))?;
        }
        "concurrency" => {
            file.concurrency = value.parse().map_err(|_| parse_err(format!("'{value}' is not a number")))?;
        }
        "build_timeout_secs" => {
            file.build_timeout_secs = value.parse().map_err(|_| parse_err(format!("'{value}' is not a number")))?;
        }
        "watch_interval_secs" => {
            file.watch_interval_secs = value.parse().map_err(|_| parse_err(format!("'{value}' is not a number")))?;
        }
        "signing.enabled" => {
            file.signing.enabled = value.parse().map_err(|_| parse_err(format!("'{value}' is not a bool")))?;
        }
        "signing.key_path" => {
            file.signing.key_path = Some(Utf8PathBuf::from(value));
        }
        "sbom.enabled" => {
            file.sbom.enabled = value.parse().map_err(|_| parse_err(format!("'{value}' is not a bool")))?;
        }
        "sbom.format" => {
            file.sbom.format = value.to_string();
        }
        "release.draft" => {
            file.release.draft = value.parse().map_err(|_| parse_err(format!("'{value}' is not a bool")))?;
        }
        "release.prerelease" => {
            file.release.prerelease = value.parse().map_err(|_| parse_err(format!("'{value}' is not a bool")))?;
        }
        other => return Err(parse_err(format!("unknown configuration key '{other}'"))),
    }

    let yaml = serde_yaml::to_string(&file).map_err(|e| ConfigError::Invalid {
        key: path.to_string(),
        reason: e.to_string(),
    })?;
    if !app.dry_run {
        dsr_utils::paths::atomic_write(&path, &yaml)?;
    }
    Ok(path)
}
