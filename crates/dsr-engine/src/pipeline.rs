//! Pipeline orchestrator: `check → build → sign → release`.
//!
//! Stages are strictly ordered; stage N never starts before stage N−1
//! completes. A fatal stage aborts the pipeline and subsequent stages are
//! not recorded. A partial stage is non-fatal: the pipeline continues and
//! the terminal status is `partial` unless a later stage is fatal.
//! Authentication, configuration and system errors are fatal; build and
//! release errors are stage-terminal but still reported in the outcome.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use chrono::Utc;
use tracing::info;

use dsr_artifacts::{PostProcessOptions, PostProcessed, post_process};
use dsr_dispatch::{AggregateStatus, dispatch};
use dsr_hosts::HostRegistry;
use dsr_probe::{ProbeReport, RepoHealth, probe};
use dsr_release::{PublishOptions, publish};
use dsr_runner::{CommandSpec, ExecutionContext, HostExecutor, ProcessRunner};
use dsr_types::{
    Artifact, ErrorEntry, Manifest, RunStatus, StageRecord, TargetStatus, ToolSpec, WarningEntry,
    manifest::{BuilderInfo, MANIFEST_SCHEMA_VERSION},
};
use dsr_utils::{ConfigError, DsrError, ExitCode, NetworkError};

/// Per-run pipeline configuration, assembled from `config.yaml` and flags.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Queue-age threshold for the throttle probe.
    pub threshold_secs: u64,
    /// Concurrency ceiling for build targets.
    pub concurrency: usize,
    /// Ceiling for one target's build execution.
    pub build_timeout: Duration,
    /// Self-hosted runner label classification.
    pub label_strategies: BTreeMap<String, String>,
    pub post: PostProcessOptions,
    pub publish: PublishOptions,
    /// What fired the run: `manual`, `watch`, or `fallback`.
    pub trigger: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            threshold_secs: 600,
            concurrency: dsr_dispatch::DEFAULT_CONCURRENCY,
            build_timeout: Duration::from_secs(3600),
            label_strategies: BTreeMap::new(),
            post: PostProcessOptions::default(),
            publish: PublishOptions::default(),
            trigger: "manual".to_string(),
        }
    }
}

/// Which stages a command wants.
///
/// `fallback` gates on the throttle probe and releases; `build` skips both
/// the gate and the release; `release` skips only the gate.
#[derive(Debug, Clone, Copy)]
pub struct PipelinePlan {
    /// Probe first and stop (successfully) when the hosted CI is healthy.
    pub gate_on_throttle: bool,
    /// Run the release stage after signing.
    pub release: bool,
}

impl PipelinePlan {
    /// check + build + sign + release.
    pub const FALLBACK: Self = Self {
        gate_on_throttle: true,
        release: true,
    };
    /// build + sign.
    pub const BUILD: Self = Self {
        gate_on_throttle: false,
        release: false,
    };
    /// build + sign + release.
    pub const RELEASE: Self = Self {
        gate_on_throttle: false,
        release: true,
    };
}

/// Terminal result of one pipeline run.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub status: RunStatus,
    pub exit_code: ExitCode,
    pub steps: Vec<StageRecord>,
    pub probe: Option<ProbeReport>,
    pub manifest: Option<Manifest>,
    pub artifacts: Vec<Artifact>,
    pub release_url: Option<String>,
    pub errors: Vec<ErrorEntry>,
    pub warnings: Vec<WarningEntry>,
}

impl PipelineOutcome {
    fn new() -> Self {
        Self {
            status: RunStatus::Success,
            exit_code: ExitCode::SUCCESS,
            steps: Vec::new(),
            probe: None,
            manifest: None,
            artifacts: Vec::new(),
            release_url: None,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn fail(&mut self, stage: &str, started: Instant, err: &DsrError) {
        self.steps.push(StageRecord {
            name: stage.to_string(),
            status: RunStatus::Error,
            exit_code: err.to_exit_code().as_i32(),
            duration_ms: started.elapsed().as_millis() as u64,
            error: Some(ErrorEntry::from_error(err, None)),
        });
        self.errors.push(ErrorEntry::from_error(err, None));
        self.status = RunStatus::Error;
        self.exit_code = err.to_exit_code();
    }

    fn pass(&mut self, stage: &str, started: Instant, status: RunStatus) {
        self.steps.push(StageRecord {
            name: stage.to_string(),
            status,
            exit_code: if status == RunStatus::Success { 0 } else { 1 },
            duration_ms: started.elapsed().as_millis() as u64,
            error: None,
        });
    }
}

/// The orchestration engine for one command invocation.
pub struct Pipeline<R: ProcessRunner + 'static> {
    runner: Arc<R>,
    executor: Arc<HostExecutor<R>>,
}

impl<R: ProcessRunner + 'static> Pipeline<R> {
    #[must_use]
    pub fn new(runner: R) -> Self {
        let runner = Arc::new(runner);
        let executor = Arc::new(HostExecutor::from_arc(Arc::clone(&runner)));
        Self { runner, executor }
    }

    /// Probe one repo. Exposed for the `check` command and the watch loop.
    pub async fn check(&self, tool: &ToolSpec, threshold_secs: u64) -> Result<ProbeReport, DsrError> {
        probe(self.runner.as_ref(), &tool.repo, threshold_secs, Utc::now()).await
    }

    /// Resolve the revision the build will pin: HEAD of the local checkout.
    async fn resolve_revision(&self, tool: &ToolSpec) -> Result<String, DsrError> {
        let cmd = CommandSpec::new("git")
            .args(["-C", tool.source_path.as_str()])
            .args(["rev-parse", "HEAD"]);
        let output = self
            .runner
            .run(&cmd, Duration::from_secs(30))
            .await
            .map_err(|e| {
                DsrError::Network(NetworkError::Unreachable {
                    host: "local git".to_string(),
                    reason: e.to_string(),
                })
            })?;
        if !output.success() {
            return Err(ConfigError::Invalid {
                key: format!("{}.source_path", tool.tool),
                reason: format!(
                    "'{}' is not a git checkout: {}",
                    tool.source_path,
                    output.stderr_tail(1)
                ),
            }
            .into());
        }
        Ok(output.stdout_string().trim().to_string())
    }

    /// Run the pipeline for one tool and version.
    ///
    /// When the plan gates on the throttle probe (the `fallback` command),
    /// a healthy repo short-circuits to success without building: the
    /// hosted run is preferred whenever it is healthy. Watch mode and the
    /// `build`/`release` commands skip the gate.
    pub async fn run(
        &self,
        tool: &ToolSpec,
        registry: &HostRegistry,
        version: &str,
        run_id: &str,
        cfg: &PipelineConfig,
        plan: PipelinePlan,
    ) -> PipelineOutcome {
        let mut outcome = PipelineOutcome::new();
        let run_started = Utc::now();

        // ---- check ----
        if plan.gate_on_throttle {
            let stage_started = Instant::now();
            match self.check(tool, cfg.threshold_secs).await {
                Err(err) => {
                    outcome.fail("check", stage_started, &err);
                    return outcome;
                }
                Ok(report) => {
                    let healthy = report.health == RepoHealth::Healthy;
                    outcome.probe = Some(report);
                    outcome.pass("check", stage_started, RunStatus::Success);
                    if healthy {
                        info!(tool = %tool.tool, "hosted CI healthy, nothing to do");
                        return outcome;
                    }
                }
            }
        }

        // ---- build ----
        let stage_started = Instant::now();
        let revision = match self.resolve_revision(tool).await {
            Ok(revision) => revision,
            Err(err) => {
                outcome.fail("build", stage_started, &err);
                return outcome;
            }
        };
        let workflow_path = tool.source_path.join(&tool.workflow);
        let workflow = match dsr_workflow::WorkflowDoc::load(&workflow_path) {
            Ok(doc) => doc,
            Err(err) => {
                outcome.fail("build", stage_started, &err.into());
                return outcome;
            }
        };

        let plain_version = dsr_naming::strip_version_prefix(version);
        let staging_dir = dsr_utils::paths::staging_dir(&tool.tool, plain_version, run_id);
        if let Err(err) = dsr_utils::paths::ensure_dir_all(&staging_dir) {
            outcome.fail("build", stage_started, &err.into());
            return outcome;
        }

        let ctx = ExecutionContext {
            tool: tool.clone(),
            version: plain_version.to_string(),
            revision: revision.clone(),
            staging_dir: staging_dir.clone(),
            build_timeout: cfg.build_timeout,
        };
        let dispatched = match dispatch(
            Arc::clone(&self.executor),
            registry,
            &workflow,
            &cfg.label_strategies,
            &ctx,
            cfg.concurrency,
        )
        .await
        {
            Ok(result) => result,
            Err(err) => {
                outcome.fail("build", stage_started, &err);
                return outcome;
            }
        };

        for warning in &dispatched.warnings {
            outcome.warnings.push(WarningEntry {
                code: "W001".to_string(),
                message: warning.clone(),
                target: None,
            });
        }
        for result in &dispatched.results {
            if let Some(error) = &result.error {
                outcome.errors.push(error.clone());
            }
        }

        match dispatched.status {
            AggregateStatus::Error => {
                outcome.steps.push(StageRecord {
                    name: "build".to_string(),
                    status: RunStatus::Error,
                    exit_code: ExitCode::BUILD_FAILED.as_i32(),
                    duration_ms: stage_started.elapsed().as_millis() as u64,
                    error: None,
                });
                outcome.status = RunStatus::Error;
                outcome.exit_code = ExitCode::BUILD_FAILED;
                return outcome;
            }
            AggregateStatus::Partial => {
                outcome.pass("build", stage_started, RunStatus::Partial);
                outcome.status = RunStatus::Partial;
                outcome.exit_code = ExitCode::PARTIAL;
            }
            AggregateStatus::Success => {
                outcome.pass("build", stage_started, RunStatus::Success);
            }
        }

        // ---- sign ----
        let stage_started = Instant::now();
        let raw: Vec<_> = dispatched
            .results
            .iter()
            .filter(|r| r.status == TargetStatus::Success)
            .map(|r| (r.platform.clone(), r.artifacts.clone()))
            .collect();
        let processed = match post_process(
            self.runner.as_ref(),
            tool,
            version,
            &raw,
            &staging_dir,
            &cfg.post,
        )
        .await
        {
            Ok(processed) => processed,
            Err(err) => {
                outcome.fail("sign", stage_started, &err);
                return outcome;
            }
        };
        outcome.pass("sign", stage_started, RunStatus::Success);
        outcome.artifacts = processed.artifacts.clone();

        // ---- release ----
        if plan.release {
            let stage_started = Instant::now();
            let files = upload_set(&staging_dir, &processed);
            match publish(
                self.runner.as_ref(),
                tool,
                version,
                &revision,
                &files,
                &cfg.publish,
            )
            .await
            {
                Ok(published) => {
                    outcome.pass("release", stage_started, RunStatus::Success);
                    outcome.release_url = Some(published.release_url);
                }
                Err(err) => {
                    outcome.fail("release", stage_started, &err);
                    return outcome;
                }
            }
        }

        // ---- manifest ----
        let duration_ms = (Utc::now() - run_started).num_milliseconds().max(0) as u64;
        let manifest = Manifest {
            schema_version: MANIFEST_SCHEMA_VERSION.to_string(),
            tool: tool.tool.clone(),
            version: plain_version.to_string(),
            run_id: run_id.to_string(),
            revision,
            started_at: run_started,
            duration_ms,
            builder: BuilderInfo {
                name: "dsr".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                trigger: cfg.trigger.clone(),
            },
            artifacts: processed.artifacts,
            hosts: dispatched.results.iter().map(|r| r.to_host_status()).collect(),
            checksums_file: processed
                .checksums_file
                .file_name()
                .unwrap_or_default()
                .to_string(),
            signature_file: processed
                .checksums_signature
                .as_ref()
                .and_then(|p| p.file_name())
                .map(String::from),
            sbom_file: processed
                .sbom_file
                .as_ref()
                .and_then(|p| p.file_name())
                .map(String::from),
            signing: processed.signing,
        };
        if let Err(err) = persist_manifest(&staging_dir, &manifest) {
            outcome.warnings.push(WarningEntry {
                code: "W002".to_string(),
                message: format!("manifest not persisted: {err}"),
                target: None,
            });
        }
        outcome.manifest = Some(manifest);
        outcome
    }
}

/// Everything the publisher uploads: artifacts, compat copies, signatures,
/// the checksums file and its signature, and the SBOM.
fn upload_set(staging_dir: &camino::Utf8Path, processed: &PostProcessed) -> Vec<Utf8PathBuf> {
    let mut files = Vec::new();
    for artifact in &processed.artifacts {
        files.push(artifact.path.clone());
        if let Some(alias) = &artifact.compat_alias {
            files.push(staging_dir.join(alias));
        }
        if let Some(signature) = &artifact.signature {
            files.push(signature.clone());
        }
    }
    files.push(processed.checksums_file.clone());
    if let Some(signature) = &processed.checksums_signature {
        files.push(signature.clone());
    }
    if let Some(sbom) = &processed.sbom_file {
        files.push(sbom.clone());
    }
    files
}

fn persist_manifest(staging_dir: &camino::Utf8Path, manifest: &Manifest) -> Result<(), std::io::Error> {
    let json = serde_json::to_string_pretty(manifest)
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    dsr_utils::paths::atomic_write(&staging_dir.join("manifest.json"), &json)?;
    // Second copy in the flat manifest archive for `status` and `prune`.
    let archive_dir = dsr_utils::paths::state_dir().join("manifests");
    dsr_utils::paths::atomic_write(
        &archive_dir.join(format!(
            "{}-{}-{}.json",
            manifest.tool, manifest.version, manifest.run_id
        )),
        &json,
    )
}
