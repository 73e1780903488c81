//! The run envelope: the uniform result record every top-level invocation
//! produces, and the sole machine-readable output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use dsr_utils::{DsrError, ExitCode};

/// Envelope schema version.
pub const ENVELOPE_SCHEMA_VERSION: &str = "1";

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Partial,
    Error,
}

/// One structured error entry with a stable code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl ErrorEntry {
    #[must_use]
    pub fn from_error(err: &DsrError, target: Option<String>) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            target,
        }
    }
}

/// One structured warning entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarningEntry {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// Stage record appended to `details.steps` by the pipeline orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub name: String,
    pub status: RunStatus,
    pub exit_code: i32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorEntry>,
}

/// The uniform result record for one top-level invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEnvelope {
    pub command: String,
    pub status: RunStatus,
    pub exit_code: i32,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub tool: String,
    pub version: String,
    pub schema_version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<WarningEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ErrorEntry>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub details: serde_json::Map<String, serde_json::Value>,
}

/// In-progress envelope. Owned by the orchestrator; the dispatcher and
/// publisher populate `details` through it.
#[derive(Debug)]
pub struct EnvelopeBuilder {
    command: String,
    run_id: String,
    started_at: DateTime<Utc>,
    tool: String,
    version: String,
    artifacts: Vec<String>,
    warnings: Vec<WarningEntry>,
    errors: Vec<ErrorEntry>,
    details: serde_json::Map<String, serde_json::Value>,
}

impl EnvelopeBuilder {
    /// Start an envelope now, with a fresh v4 run id.
    #[must_use]
    pub fn begin(command: &str, tool: &str, version: &str) -> Self {
        Self::begin_at(command, tool, version, Utc::now())
    }

    /// Start an envelope at an explicit instant. Tests use this to freeze
    /// the wall-clock.
    #[must_use]
    pub fn begin_at(command: &str, tool: &str, version: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            command: command.to_string(),
            run_id: Uuid::new_v4().to_string(),
            started_at,
            tool: tool.to_string(),
            version: version.to_string(),
            artifacts: Vec::new(),
            warnings: Vec::new(),
            errors: Vec::new(),
            details: serde_json::Map::new(),
        }
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn push_artifact(&mut self, name: impl Into<String>) {
        self.artifacts.push(name.into());
    }

    pub fn push_warning(&mut self, warning: WarningEntry) {
        self.warnings.push(warning);
    }

    pub fn push_error(&mut self, error: ErrorEntry) {
        self.errors.push(error);
    }

    pub fn insert_detail(&mut self, key: &str, value: serde_json::Value) {
        self.details.insert(key.to_string(), value);
    }

    /// Freeze the envelope with the given terminal status and exit code.
    ///
    /// Enforces `(exit_code == 0) ⇔ (status == success)`: a success with a
    /// nonzero code or a non-success with code zero is normalized toward the
    /// exit code, which is the contract the shell sees.
    #[must_use]
    pub fn finish(self, status: RunStatus, exit_code: ExitCode) -> RunEnvelope {
        self.finish_at(status, exit_code, Utc::now())
    }

    /// Freeze at an explicit instant (clamped so `completed_at` never
    /// precedes `started_at`).
    #[must_use]
    pub fn finish_at(
        self,
        status: RunStatus,
        exit_code: ExitCode,
        completed_at: DateTime<Utc>,
    ) -> RunEnvelope {
        let completed_at = completed_at.max(self.started_at);
        let duration_ms = (completed_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64;

        let code = exit_code.as_i32();
        let status = match (status, code) {
            (RunStatus::Success, 0) => RunStatus::Success,
            (RunStatus::Success, _) => RunStatus::Error,
            (_, 0) => RunStatus::Success,
            (other, _) => other,
        };

        RunEnvelope {
            command: self.command,
            status,
            exit_code: code,
            run_id: self.run_id,
            started_at: self.started_at,
            completed_at,
            duration_ms,
            tool: self.tool,
            version: self.version,
            schema_version: ENVELOPE_SCHEMA_VERSION.to_string(),
            artifacts: self.artifacts,
            warnings: self.warnings,
            errors: self.errors,
            details: self.details,
        }
    }
}
