//! Throttle probe.
//!
//! Lists the repo's current workflow runs through the hosted-CI CLI and
//! classifies the repo as healthy or throttled. A repo is throttled iff at
//! least one queued or in-progress run has been waiting strictly longer
//! than the threshold; age equal to the threshold does not throttle.
//!
//! The probe never silently returns healthy: authentication failures
//! surface as the dependency-error class, connectivity failures as the
//! network-error class.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use dsr_runner::{CommandSpec, ProcessRunner, RunnerError};
use dsr_types::RepoCoords;
use dsr_utils::{AuthError, DsrError, NetworkError};

/// Ceiling for one hosted-CI API call.
pub const API_TIMEOUT: Duration = Duration::from_secs(30);

/// Health classification of one repo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoHealth {
    Healthy,
    Throttled,
}

/// One queued or in-progress hosted-CI run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueuedRun {
    pub id: u64,
    pub status: String,
    pub workflow: String,
    pub created_at: DateTime<Utc>,
    pub age_secs: i64,
}

/// Probe result for one repo.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProbeReport {
    pub repo: String,
    pub health: RepoHealth,
    pub threshold_secs: u64,
    pub queued_runs: Vec<QueuedRun>,
}

impl ProbeReport {
    /// Runs whose queue age exceeds the threshold. These are the runs the
    /// watch loop dedupes on.
    #[must_use]
    pub fn overdue_runs(&self) -> Vec<&QueuedRun> {
        self.queued_runs
            .iter()
            .filter(|r| r.age_secs > self.threshold_secs as i64)
            .collect()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhRun {
    database_id: u64,
    status: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    workflow_name: String,
}

/// Probe one repo against a threshold, evaluating ages at `now`.
pub async fn probe(
    runner: &dyn ProcessRunner,
    repo: &RepoCoords,
    threshold_secs: u64,
    now: DateTime<Utc>,
) -> Result<ProbeReport, DsrError> {
    let cmd = CommandSpec::new("gh")
        .args(["run", "list"])
        .args(["--repo", &repo.to_string()])
        .args(["--json", "databaseId,status,createdAt,workflowName"])
        .args(["--limit", "100"]);

    let output = match runner.run(&cmd, API_TIMEOUT).await {
        Ok(output) => output,
        Err(RunnerError::Timeout { timeout_secs }) => {
            return Err(NetworkError::Timeout {
                operation: format!("gh run list for {repo}"),
                timeout_secs,
            }
            .into());
        }
        Err(e) => {
            return Err(NetworkError::Unreachable {
                host: "hosted CI".to_string(),
                reason: e.to_string(),
            }
            .into());
        }
    };

    if !output.success() {
        let stderr = output.stderr_string();
        if stderr.contains("auth") || stderr.contains("HTTP 401") || stderr.contains("HTTP 403") {
            return Err(AuthError::HostedCi {
                reason: output.stderr_tail(1),
            }
            .into());
        }
        return Err(NetworkError::Unreachable {
            host: "hosted CI".to_string(),
            reason: output.stderr_tail(1),
        }
        .into());
    }

    let runs: Vec<GhRun> =
        serde_json::from_slice(&output.stdout).map_err(|e| NetworkError::Unreachable {
            host: "hosted CI".to_string(),
            reason: format!("unparseable run listing: {e}"),
        })?;

    let queued_runs: Vec<QueuedRun> = runs
        .into_iter()
        .filter(|r| r.status == "queued" || r.status == "in_progress")
        .map(|r| QueuedRun {
            id: r.database_id,
            status: r.status,
            workflow: r.workflow_name,
            age_secs: (now - r.created_at).num_seconds(),
            created_at: r.created_at,
        })
        .collect();

    // Strictly greater than the threshold, never greater-or-equal.
    let throttled = queued_runs
        .iter()
        .any(|r| r.age_secs > threshold_secs as i64);
    debug!(repo = %repo, queued = queued_runs.len(), throttled, "probe complete");

    Ok(ProbeReport {
        repo: repo.to_string(),
        health: if throttled {
            RepoHealth::Throttled
        } else {
            RepoHealth::Healthy
        },
        threshold_secs,
        queued_runs,
    })
}
