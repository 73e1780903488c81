//! Build dispatcher.
//!
//! Per platform: selects the strategy (workflow analyzer), selects the host
//! (registry), invokes the executor, and aggregates partial results.
//!
//! Scheduling model: targets are initiated in declared platform order and
//! run in parallel up to a configured concurrency ceiling. Targets sharing a
//! host serialize on the executor's per-host mutex. Failures of one target
//! never cancel peers. Completion order is non-deterministic; results are
//! reported in declared order.

use std::collections::BTreeMap;
use std::sync::Arc;

use camino::Utf8PathBuf;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use dsr_hosts::HostRegistry;
use dsr_runner::{ExecutionContext, HostExecutor, ProcessRunner};
use dsr_types::{
    BuildStrategy, BuildTarget, ErrorEntry, HostStatus, Platform, TargetStatus, ToolSpec,
};
use dsr_utils::DsrError;
use dsr_workflow::{JobRoute, WorkflowDoc, route_platform};

/// Default ceiling on concurrently running targets.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Aggregate status of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateStatus {
    /// Every target succeeded.
    Success,
    /// At least one target succeeded and at least one failed.
    Partial,
    /// No target succeeded.
    Error,
}

/// Result of one target, success or failure.
#[derive(Debug, Clone)]
pub struct TargetResult {
    pub platform: Platform,
    pub host: String,
    pub strategy: String,
    pub job: Option<String>,
    pub duration_ms: u64,
    pub artifacts: Vec<Utf8PathBuf>,
    pub status: TargetStatus,
    pub error: Option<ErrorEntry>,
}

impl TargetResult {
    /// Host-status record for the manifest.
    #[must_use]
    pub fn to_host_status(&self) -> HostStatus {
        HostStatus {
            host: self.host.clone(),
            platform: self.platform.clone(),
            strategy: self.strategy.clone(),
            duration_ms: self.duration_ms,
            job: self.job.clone(),
            status: self.status,
            error: self.error.as_ref().map(|e| e.message.clone()),
        }
    }
}

/// Everything one dispatch produced, in declared platform order.
#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub results: Vec<TargetResult>,
    pub warnings: Vec<String>,
    pub status: AggregateStatus,
}

impl DispatchResult {
    #[must_use]
    pub fn succeeded(&self) -> Vec<&TargetResult> {
        self.results
            .iter()
            .filter(|r| r.status == TargetStatus::Success)
            .collect()
    }
}

/// One platform's resolution: a concrete target, or a reason it cannot run.
#[derive(Debug, Clone)]
enum Resolution {
    Target(BuildTarget),
    Unresolvable { reason: String },
}

/// Resolve every requested platform to a target (or an unresolvable
/// record), in declared order.
///
/// Host-registry failures are configuration errors and abort resolution;
/// an unclassifiable workflow runner only downgrades its own platform.
fn resolve_targets(
    tool: &ToolSpec,
    registry: &HostRegistry,
    workflow: &WorkflowDoc,
    label_strategies: &BTreeMap<String, String>,
    warnings: &mut Vec<String>,
) -> Result<Vec<Resolution>, DsrError> {
    let mut resolutions = Vec::with_capacity(tool.platforms.len());
    for platform in &tool.platforms {
        let routed = route_platform(workflow, tool, platform, label_strategies);
        warnings.extend(routed.warnings);

        let resolution = match routed.route {
            JobRoute::ContainerRunner { job } => {
                let host = registry.resolve(tool, platform)?;
                let matrix = tool
                    .matrix_filters
                    .get(&platform.to_string())
                    .cloned()
                    .unwrap_or_default();
                Resolution::Target(BuildTarget {
                    platform: platform.clone(),
                    strategy: BuildStrategy::ContainerRunner { job, matrix },
                    host: host.id.clone(),
                })
            }
            JobRoute::NativeSsh { job } => {
                let host = registry.resolve(tool, platform)?;
                Resolution::Target(BuildTarget {
                    platform: platform.clone(),
                    strategy: BuildStrategy::NativeSsh { job },
                    host: host.id.clone(),
                })
            }
            // Job map said "none": no hosted job exists, so fall back to a
            // native build even though the workflow has nothing to offer.
            JobRoute::NullPlatform => {
                let host = registry.resolve(tool, platform)?;
                Resolution::Target(BuildTarget {
                    platform: platform.clone(),
                    strategy: BuildStrategy::NativeSsh { job: None },
                    host: host.id.clone(),
                })
            }
            JobRoute::CrossCompile { recipe } => Resolution::Target(BuildTarget {
                platform: platform.clone(),
                strategy: BuildStrategy::CrossCompile { recipe },
                host: "local".to_string(),
            }),
            JobRoute::Unresolvable { reason } => Resolution::Unresolvable { reason },
        };
        resolutions.push(resolution);
    }
    Ok(resolutions)
}

/// Dispatch a build across all of the tool's requested platforms.
pub async fn dispatch<R: ProcessRunner + 'static>(
    executor: Arc<HostExecutor<R>>,
    registry: &HostRegistry,
    workflow: &WorkflowDoc,
    label_strategies: &BTreeMap<String, String>,
    ctx: &ExecutionContext,
    concurrency: usize,
) -> Result<DispatchResult, DsrError> {
    let mut warnings = Vec::new();
    let resolutions = resolve_targets(&ctx.tool, registry, workflow, label_strategies, &mut warnings)?;

    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut handles: Vec<Option<tokio::task::JoinHandle<TargetResult>>> = Vec::new();
    let mut results: Vec<Option<TargetResult>> = Vec::new();

    for resolution in resolutions {
        match resolution {
            Resolution::Unresolvable { reason } => {
                // Downgraded to a per-target failure, not an abort.
                warn!(%reason, "platform unresolvable");
                let platform = ctx.tool.platforms[results.len()].clone();
                results.push(Some(TargetResult {
                    platform,
                    host: String::new(),
                    strategy: "unresolved".to_string(),
                    job: None,
                    duration_ms: 0,
                    artifacts: Vec::new(),
                    status: TargetStatus::Error,
                    error: Some(ErrorEntry {
                        code: "E030".to_string(),
                        message: reason,
                        target: None,
                    }),
                }));
                handles.push(None);
            }
            Resolution::Target(target) => {
                let executor = Arc::clone(&executor);
                let semaphore = Arc::clone(&semaphore);
                let ctx = ctx.clone();
                let host = registry.get(&target.host).cloned();
                results.push(None);
                handles.push(Some(tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.expect("semaphore open");
                    run_target(&executor, host, target, &ctx).await
                })));
            }
        }
    }

    let mut final_results = Vec::with_capacity(results.len());
    for (slot, handle) in results.into_iter().zip(handles) {
        match (slot, handle) {
            (Some(result), _) => final_results.push(result),
            (None, Some(handle)) => {
                final_results.push(handle.await.expect("target task panicked"));
            }
            (None, None) => unreachable!("resolution produced neither result nor task"),
        }
    }

    let ok = final_results
        .iter()
        .filter(|r| r.status == TargetStatus::Success)
        .count();
    let status = if ok == final_results.len() && !final_results.is_empty() {
        AggregateStatus::Success
    } else if ok > 0 {
        AggregateStatus::Partial
    } else {
        AggregateStatus::Error
    };
    info!(total = final_results.len(), ok, ?status, "dispatch complete");

    Ok(DispatchResult {
        results: final_results,
        warnings,
        status,
    })
}

async fn run_target<R: ProcessRunner>(
    executor: &HostExecutor<R>,
    host: Option<dsr_types::HostSpec>,
    target: BuildTarget,
    ctx: &ExecutionContext,
) -> TargetResult {
    // Cross-compile targets run locally and need no registry entry.
    let host_spec = match host {
        Some(h) => h,
        None => dsr_types::HostSpec {
            id: target.host.clone(),
            platform: target.platform.clone(),
            kind: dsr_types::ConnectionKind::Local,
            ssh_alias: None,
        },
    };

    let started = std::time::Instant::now();
    match executor.execute(&host_spec, &target, ctx).await {
        Ok(outcome) => TargetResult {
            platform: target.platform.clone(),
            host: host_spec.id,
            strategy: target.strategy.kind().to_string(),
            job: outcome.job,
            duration_ms: outcome.duration.as_millis() as u64,
            artifacts: outcome.artifacts,
            status: TargetStatus::Success,
            error: None,
        },
        Err(err) => {
            let status = match err {
                DsrError::TargetTimeout { .. } => TargetStatus::Timeout,
                _ => TargetStatus::Error,
            };
            TargetResult {
                platform: target.platform.clone(),
                host: host_spec.id,
                strategy: target.strategy.kind().to_string(),
                job: None,
                duration_ms: started.elapsed().as_millis() as u64,
                artifacts: Vec::new(),
                status,
                error: Some(ErrorEntry::from_error(
                    &err,
                    Some(target.platform.to_string()),
                )),
            }
        }
    }
}
