//! Command handlers for the core surface: check, watch, build, release,
//! fallback. The operational surface (status, doctor, prune, repos,
//! config) lives in its own modules.

use std::time::Duration;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use tracing::info;

use dsr_artifacts::PostProcessOptions;
use dsr_config::ConfigSet;
use dsr_engine::{
    Pipeline, PipelineConfig, PipelineDriver, PipelineOutcome, PipelinePlan, TriggeredSet,
    WatchConfig, WatchLoop,
};
use dsr_hosts::HostRegistry;
use dsr_probe::{ProbeReport, RepoHealth};
use dsr_release::PublishOptions;
use dsr_runner::{CommandSpec, ProcessRunner, TokioRunner};
use dsr_types::{
    ErrorEntry, Platform, RunStatus, ToolSpec, envelope::EnvelopeBuilder,
};
use dsr_utils::{ConfigError, DsrError, ExitCode};

use crate::cli::{Commands, CommandOutput, ConfigCommands, ReposCommands};

/// Shared handler state for one invocation.
pub struct App {
    pub config: ConfigSet,
    pub config_dir: Utf8PathBuf,
    pub dry_run: bool,
    pub non_interactive: bool,
}

impl App {
    pub async fn dispatch(&self, command: Commands) -> CommandOutput {
        match command {
            Commands::Check { tool, threshold } => self.check(&tool, threshold).await,
            Commands::Watch {
                interval,
                threshold,
                tools,
            } => self.watch(interval, threshold, &tools).await,
            Commands::Build {
                tool,
                version,
                platform,
            } => {
                self.pipeline_command("build", &tool, version, &platform, PipelinePlan::BUILD)
                    .await
            }
            Commands::Release {
                tool,
                version,
                platform,
            } => {
                self.pipeline_command("release", &tool, version, &platform, PipelinePlan::RELEASE)
                    .await
            }
            Commands::Fallback { tool, version } => {
                self.pipeline_command("fallback", &tool, version, &[], PipelinePlan::FALLBACK)
                    .await
            }
            Commands::Status { tool, limit } => crate::status::show(self, tool.as_deref(), limit),
            Commands::Doctor => crate::doctor::run(self).await,
            Commands::Prune { older_than_days } => crate::maintenance::prune(self, older_than_days),
            Commands::Repos(command) => self.repos(command),
            Commands::Config(command) => self.config_cmd(command),
        }
    }

    fn tool_spec(&self, name: &str) -> Result<ToolSpec, DsrError> {
        self.config
            .tool(name)
            .cloned()
            .ok_or_else(|| {
                ConfigError::MissingRequired {
                    key: format!("repos.d: no descriptor for tool '{name}'"),
                }
                .into()
            })
    }

    fn effective_threshold(&self, flag: Option<u64>) -> u64 {
        flag.unwrap_or(self.config.settings.threshold_secs)
    }

    fn pipeline_config(&self, trigger: &str) -> PipelineConfig {
        let settings = &self.config.settings;
        PipelineConfig {
            threshold_secs: settings.threshold_secs,
            concurrency: settings.concurrency,
            build_timeout: Duration::from_secs(settings.build_timeout_secs),
            label_strategies: settings.runner_labels.clone(),
            post: PostProcessOptions {
                sign: settings.signing_enabled,
                minisign_key: settings.signing_key.clone(),
                sbom: settings.sbom_enabled,
                sbom_format: settings.sbom_format.clone(),
            },
            publish: PublishOptions {
                draft: settings.release_draft,
                prerelease: settings.release_prerelease,
                ..PublishOptions::default()
            },
            trigger: trigger.to_string(),
        }
    }

    // ---- check ----

    async fn check(&self, tool_name: &str, threshold: Option<u64>) -> CommandOutput {
        let tool = match self.tool_spec(tool_name) {
            Ok(tool) => tool,
            Err(err) => return CommandOutput::from_error("check", tool_name, &err),
        };
        let threshold = self.effective_threshold(threshold);

        let pipeline = Pipeline::new(TokioRunner);
        let mut builder = EnvelopeBuilder::begin("check", tool_name, "");
        match pipeline.check(&tool, threshold).await {
            Err(err) => CommandOutput::from_error("check", tool_name, &err),
            Ok(report) => {
                let throttled = report.health == RepoHealth::Throttled;
                let mut stdout_lines = vec![if throttled {
                    "throttled".to_string()
                } else {
                    "healthy".to_string()
                }];
                for run in report.overdue_runs() {
                    stdout_lines.push(run.id.to_string());
                }
                builder.insert_detail(
                    "probe",
                    serde_json::to_value(&report).unwrap_or_default(),
                );

                let envelope = if throttled {
                    builder.finish(RunStatus::Partial, ExitCode::PARTIAL)
                } else {
                    builder.finish(RunStatus::Success, ExitCode::SUCCESS)
                };
                CommandOutput {
                    envelope,
                    stdout_lines,
                }
            }
        }
    }

    // ---- build / release / fallback ----

    async fn pipeline_command(
        &self,
        command: &str,
        tool_name: &str,
        version: Option<String>,
        platforms: &[String],
        plan: PipelinePlan,
    ) -> CommandOutput {
        let mut tool = match self.tool_spec(tool_name) {
            Ok(tool) => tool,
            Err(err) => return CommandOutput::from_error(command, tool_name, &err),
        };
        if tool.platforms.is_empty() {
            tool.platforms = self.config.settings.default_platforms.clone();
        }
        if let Err(err) = restrict_platforms(&mut tool, platforms) {
            return CommandOutput::from_error(command, tool_name, &err);
        }

        // Unresolved platforms are configuration errors before any build.
        let scoped = ConfigSet {
            settings: self.config.settings.clone(),
            hosts: self.config.hosts.clone(),
            tools: vec![tool.clone()],
        };
        let issues = dsr_config::validate(&scoped);
        if !issues.is_empty() {
            let err = DsrError::Config(ConfigError::Invalid {
                key: tool_name.to_string(),
                reason: issues
                    .iter()
                    .map(|i| i.message.clone())
                    .collect::<Vec<_>>()
                    .join("; "),
            });
            return CommandOutput::from_error(command, tool_name, &err);
        }

        let registry = match HostRegistry::new(self.config.hosts.clone()) {
            Ok(registry) => registry,
            Err(err) => return CommandOutput::from_error(command, tool_name, &err.into()),
        };

        let runner = TokioRunner;
        let version = match resolve_version(&runner, &tool, version).await {
            Ok(version) => version,
            Err(err) => return CommandOutput::from_error(command, tool_name, &err),
        };

        if self.dry_run {
            return self.plan_only(command, &tool, &registry, &version);
        }

        let pipeline = Pipeline::new(runner);
        let cfg = self.pipeline_config(if command == "fallback" { "fallback" } else { "manual" });
        let builder = EnvelopeBuilder::begin(command, tool_name, &version);
        let run_id = builder.run_id().to_string();
        info!(tool = tool_name, %version, %run_id, "pipeline starting");

        let outcome = pipeline
            .run(&tool, &registry, &version, &run_id, &cfg, plan)
            .await;
        envelope_from_outcome(builder, outcome)
    }

    /// `--dry-run`: resolve and print the plan, execute nothing.
    fn plan_only(
        &self,
        command: &str,
        tool: &ToolSpec,
        registry: &HostRegistry,
        version: &str,
    ) -> CommandOutput {
        let mut builder = EnvelopeBuilder::begin(command, &tool.tool, version);
        let workflow_path = tool.source_path.join(&tool.workflow);
        let workflow = match dsr_workflow::WorkflowDoc::load(&workflow_path) {
            Ok(doc) => doc,
            Err(err) => return CommandOutput::from_error(command, &tool.tool, &err.into()),
        };

        let mut stdout_lines = Vec::new();
        let mut plan = Vec::new();
        for platform in &tool.platforms {
            let routed = dsr_workflow::route_platform(
                &workflow,
                tool,
                platform,
                &self.config.settings.runner_labels,
            );
            let host = registry
                .resolve(tool, platform)
                .map(|h| h.id.clone())
                .unwrap_or_else(|_| "local".to_string());
            let line = format!("{platform} {:?} on {host}", routed.route);
            stdout_lines.push(line.clone());
            plan.push(serde_json::json!({
                "platform": platform.to_string(),
                "host": host,
                "route": format!("{:?}", routed.route),
            }));
        }
        builder.insert_detail("plan", serde_json::Value::Array(plan));
        builder.insert_detail("dry_run", serde_json::Value::Bool(true));
        CommandOutput {
            envelope: builder.finish(RunStatus::Success, ExitCode::SUCCESS),
            stdout_lines,
        }
    }

    // ---- watch ----

    async fn watch(
        &self,
        interval: Option<u64>,
        threshold: Option<u64>,
        tool_names: &[String],
    ) -> CommandOutput {
        let tools: Vec<ToolSpec> = if tool_names.is_empty() {
            self.config.tools.clone()
        } else {
            let mut selected = Vec::new();
            for name in tool_names {
                match self.tool_spec(name) {
                    Ok(tool) => selected.push(tool),
                    Err(err) => return CommandOutput::from_error("watch", name, &err),
                }
            }
            selected
        };
        if tools.is_empty() {
            let err = DsrError::Config(ConfigError::MissingRequired {
                key: "repos.d: no tools configured to watch".to_string(),
            });
            return CommandOutput::from_error("watch", "", &err);
        }

        let registry = match HostRegistry::new(self.config.hosts.clone()) {
            Ok(registry) => registry,
            Err(err) => return CommandOutput::from_error("watch", "", &err.into()),
        };

        // Single-instance guard. The triggered set has one writer by
        // construction only while this lock is held.
        let lock_dir = dsr_utils::paths::state_dir().join("watch");
        if let Err(err) = dsr_utils::paths::ensure_dir_all(&lock_dir) {
            return CommandOutput::from_error("watch", "", &err.into());
        }
        let lock_file = match std::fs::File::create(lock_dir.join("watch.lock").as_std_path()) {
            Ok(file) => file,
            Err(err) => return CommandOutput::from_error("watch", "", &err.into()),
        };
        let mut lock = fd_lock::RwLock::new(lock_file);
        let guard = lock.try_write();
        if guard.is_err() {
            let err = DsrError::LockHeld {
                scope: "watch".to_string(),
                pid: std::process::id(),
            };
            return CommandOutput::from_error("watch", "", &err);
        }

        let cfg = WatchConfig {
            interval: Duration::from_secs(
                interval.unwrap_or(self.config.settings.watch_interval_secs),
            ),
            threshold_secs: self.effective_threshold(threshold),
        };
        info!(
            interval_secs = cfg.interval.as_secs(),
            threshold_secs = cfg.threshold_secs,
            "watch loop starting"
        );

        // A dry-run iteration must not pollute the real triggered set, so
        // it works against a throwaway copy.
        let triggered_path = if self.dry_run {
            let tmp = std::env::temp_dir().join(format!("dsr-dryrun-{}.json", std::process::id()));
            let _ = std::fs::copy(
                dsr_utils::paths::triggered_set_path().as_std_path(),
                &tmp,
            );
            Utf8PathBuf::from_path_buf(tmp).expect("temp dir is UTF-8")
        } else {
            dsr_utils::paths::triggered_set_path()
        };
        let triggered = TriggeredSet::load(triggered_path);
        let driver = EngineDriver {
            pipeline: Pipeline::new(TokioRunner),
            registry,
            cfg: self.pipeline_config("watch"),
            fire_for_real: !self.dry_run,
        };
        let mut watch = WatchLoop::new(tools, cfg, driver, triggered);

        if self.dry_run {
            // One iteration, nothing fired for real.
            let outcome = watch.run_once(Utc::now()).await;
            let mut builder = EnvelopeBuilder::begin("watch", "", "");
            builder.insert_detail(
                "iteration",
                serde_json::json!({
                    "would_fire": outcome.fired.clone(),
                    "duplicates": outcome.duplicates,
                    "failures": outcome.failures,
                }),
            );
            builder.insert_detail("dry_run", serde_json::Value::Bool(true));
            let stdout_lines = outcome.fired.iter().map(u64::to_string).collect();
            return CommandOutput {
                envelope: builder.finish(RunStatus::Success, ExitCode::SUCCESS),
                stdout_lines,
            };
        }

        watch.run().await;
        unreachable!("the watch loop only ends with the process")
    }

    fn repos(&self, command: ReposCommands) -> CommandOutput {
        crate::maintenance::repos(self, command)
    }

    fn config_cmd(&self, command: ConfigCommands) -> CommandOutput {
        crate::maintenance::config_cmd(self, command)
    }
}

/// Restrict a tool to a `--platform` subset; unknown platforms are
/// configuration errors.
fn restrict_platforms(tool: &mut ToolSpec, requested: &[String]) -> Result<(), DsrError> {
    if requested.is_empty() {
        return Ok(());
    }
    let mut keep = Vec::new();
    for raw in requested {
        let platform: Platform = raw.parse().map_err(|e| {
            DsrError::Config(ConfigError::Invalid {
                key: "platform".to_string(),
                reason: format!("{e}"),
            })
        })?;
        if !tool.platforms.contains(&platform) {
            return Err(ConfigError::Invalid {
                key: "platform".to_string(),
                reason: format!("'{platform}' is not declared by tool '{}'", tool.tool),
            }
            .into());
        }
        keep.push(platform);
    }
    tool.platforms = keep;
    Ok(())
}

/// Resolve the version to build: the explicit flag, or the latest tag of
/// the local checkout.
async fn resolve_version(
    runner: &dyn ProcessRunner,
    tool: &ToolSpec,
    version: Option<String>,
) -> Result<String, DsrError> {
    if let Some(version) = version {
        return Ok(version);
    }
    let cmd = CommandSpec::new("git")
        .args(["-C", tool.source_path.as_str()])
        .args(["describe", "--tags", "--abbrev=0"]);
    let output = runner
        .run(&cmd, Duration::from_secs(30))
        .await
        .map_err(|e| {
            DsrError::Config(ConfigError::MissingRequired {
                key: format!("version (git describe failed: {e})"),
            })
        })?;
    if !output.success() {
        return Err(ConfigError::MissingRequired {
            key: format!(
                "version (no tags in '{}'; pass --version)",
                tool.source_path
            ),
        }
        .into());
    }
    Ok(output.stdout_string().trim().to_string())
}

/// Fold a pipeline outcome into the run envelope.
fn envelope_from_outcome(mut builder: EnvelopeBuilder, outcome: PipelineOutcome) -> CommandOutput {
    let mut stdout_lines = Vec::new();

    for warning in outcome.warnings {
        builder.push_warning(warning);
    }
    for error in &outcome.errors {
        builder.push_error(error.clone());
    }
    builder.insert_detail(
        "steps",
        serde_json::to_value(&outcome.steps).unwrap_or_default(),
    );
    if let Some(probe) = &outcome.probe {
        builder.insert_detail("probe", serde_json::to_value(probe).unwrap_or_default());
    }
    for artifact in &outcome.artifacts {
        builder.push_artifact(artifact.name.clone());
        stdout_lines.push(artifact.path.to_string());
    }
    if let Some(manifest) = &outcome.manifest {
        builder.insert_detail(
            "manifest",
            serde_json::json!({
                "run_id": manifest.run_id,
                "revision": manifest.revision,
                "checksums_file": manifest.checksums_file,
                "signing": manifest.signing,
                "hosts": manifest.hosts,
            }),
        );
    }
    if let Some(url) = &outcome.release_url {
        builder.insert_detail("release_url", serde_json::Value::String(url.clone()));
        stdout_lines.push(url.clone());
    }

    CommandOutput {
        envelope: builder.finish(outcome.status, outcome.exit_code),
        stdout_lines,
    }
}

/// Production watch driver on top of the pipeline.
struct EngineDriver {
    pipeline: Pipeline<TokioRunner>,
    registry: HostRegistry,
    cfg: PipelineConfig,
    fire_for_real: bool,
}

#[async_trait]
impl PipelineDriver for EngineDriver {
    async fn probe(
        &self,
        tool: &ToolSpec,
        threshold_secs: u64,
        _now: DateTime<Utc>,
    ) -> Result<ProbeReport, DsrError> {
        self.pipeline.check(tool, threshold_secs).await
    }

    async fn fire(&self, tool: &ToolSpec, hosted_run_id: u64) -> Result<(), DsrError> {
        if !self.fire_for_real {
            info!(tool = %tool.tool, hosted_run_id, "dry run: would fire fallback");
            return Ok(());
        }
        let runner = TokioRunner;
        let version = resolve_version(&runner, tool, None).await?;
        let run_id = uuid::Uuid::new_v4().to_string();
        let outcome = self
            .pipeline
            .run(tool, &self.registry, &version, &run_id, &self.cfg, PipelinePlan::RELEASE)
            .await;

        match outcome.status {
            RunStatus::Success | RunStatus::Partial => Ok(()),
            RunStatus::Error => {
                let reason = outcome
                    .errors
                    .first()
                    .map_or_else(|| "pipeline failed".to_string(), entry_summary);
                Err(dsr_utils::BuildError::Compilation {
                    platform: tool.tool.clone(),
                    reason,
                }
                .into())
            }
        }
    }
}

fn entry_summary(entry: &ErrorEntry) -> String {
    format!("[{}] {}", entry.code, entry.message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restrict_platforms_keeps_declared_subset() {
        let mut tool: ToolSpec = serde_yaml::from_str(
            r#"
tool: cass
repo: someuser/cass
source_path: /src/cass
platforms: [linux/amd64, darwin/arm64, windows/amd64]
asset_pattern: "${name}-${version}-${target}${ext}"
"#,
        )
        .unwrap();
        restrict_platforms(&mut tool, &["darwin/arm64".to_string()]).unwrap();
        assert_eq!(tool.platforms.len(), 1);
        assert_eq!(tool.platforms[0].to_string(), "darwin/arm64");
    }

    #[test]
    fn restrict_platforms_rejects_undeclared() {
        let mut tool: ToolSpec = serde_yaml::from_str(
            r#"
tool: cass
repo: someuser/cass
source_path: /src/cass
platforms: [linux/amd64]
asset_pattern: "${name}-${version}-${target}${ext}"
"#,
        )
        .unwrap();
        let err = restrict_platforms(&mut tool, &["windows/amd64".to_string()]).unwrap_err();
        assert_eq!(err.code(), "E030");
    }

    #[tokio::test]
    async fn explicit_version_flag_wins() {
        let tool: ToolSpec = serde_yaml::from_str(
            r#"
tool: cass
repo: someuser/cass
source_path: /src/cass
platforms: [linux/amd64]
asset_pattern: "${name}-${version}-${target}${ext}"
"#,
        )
        .unwrap();
        let version = resolve_version(&TokioRunner, &tool, Some("v9.9.9".into()))
            .await
            .unwrap();
        assert_eq!(version, "v9.9.9");
    }
}
