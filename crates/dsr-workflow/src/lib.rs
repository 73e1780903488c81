//! Workflow analyzer.
//!
//! Reads the project's CI workflow file, enumerates its jobs, and maps each
//! requested platform to a build route:
//!
//! - `ubuntu-*` runners (and `self-hosted` runners whose labels the
//!   configuration maps to the container runner) route to the container
//!   workflow emulator.
//! - `macos-*` and `windows-*` runners route to native SSH builds.
//! - A declared cross-compile recipe routes locally; the analyzer never
//!   invents one.
//! - A job-map value of `"none"` is the null-platform route: the dispatcher
//!   falls back to native SSH even though no job matches.
//!
//! A runner label set the analyzer cannot classify produces a warning and an
//! unresolvable route; the dispatcher downgrades that platform to a partial
//! failure rather than aborting the run.

use std::collections::BTreeMap;

use dsr_types::{Os, Platform, ToolSpec};
use dsr_utils::{ConfigError, DsrError};

/// Workflow file failures.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("cannot read workflow '{path}': {reason}")]
    Unreadable { path: String, reason: String },

    #[error("workflow '{path}' is not valid YAML: {reason}")]
    InvalidYaml { path: String, reason: String },

    #[error("workflow '{path}' declares no jobs")]
    NoJobs { path: String },
}

impl From<WorkflowError> for DsrError {
    fn from(err: WorkflowError) -> Self {
        DsrError::Config(ConfigError::Invalid {
            key: "workflow".to_string(),
            reason: err.to_string(),
        })
    }
}

/// One job extracted from the workflow file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowJob {
    pub id: String,
    /// The `runs-on` labels, normalized to a list.
    pub runs_on: Vec<String>,
    /// Matrix axes, when the job declares a strategy matrix. Values are
    /// stringified scalars; dsr only passes them through as filters.
    pub matrix: BTreeMap<String, Vec<String>>,
}

/// Ordered job list extracted from one workflow file.
#[derive(Debug, Clone)]
pub struct WorkflowDoc {
    pub path: String,
    pub jobs: Vec<WorkflowJob>,
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl WorkflowDoc {
    /// Parse a workflow document from YAML text.
    pub fn parse(path: &str, content: &str) -> Result<Self, WorkflowError> {
        let value: serde_yaml::Value =
            serde_yaml::from_str(content).map_err(|e| WorkflowError::InvalidYaml {
                path: path.to_string(),
                reason: e.to_string(),
            })?;

        let jobs_value = value
            .get("jobs")
            .and_then(serde_yaml::Value::as_mapping)
            .ok_or_else(|| WorkflowError::NoJobs {
                path: path.to_string(),
            })?;

        let mut jobs = Vec::new();
        for (key, body) in jobs_value {
            let Some(id) = key.as_str() else { continue };

            let runs_on = match body.get("runs-on") {
                Some(serde_yaml::Value::String(s)) => vec![s.clone()],
                Some(serde_yaml::Value::Sequence(seq)) => {
                    seq.iter().filter_map(scalar_to_string).collect()
                }
                _ => Vec::new(),
            };

            let mut matrix = BTreeMap::new();
            if let Some(axes) = body
                .get("strategy")
                .and_then(|s| s.get("matrix"))
                .and_then(serde_yaml::Value::as_mapping)
            {
                for (axis, values) in axes {
                    let Some(axis) = axis.as_str() else { continue };
                    if axis == "include" || axis == "exclude" {
                        continue;
                    }
                    let values = match values {
                        serde_yaml::Value::Sequence(seq) => {
                            seq.iter().filter_map(scalar_to_string).collect()
                        }
                        scalar => scalar_to_string(scalar).into_iter().collect(),
                    };
                    matrix.insert(axis.to_string(), values);
                }
            }

            jobs.push(WorkflowJob {
                id: id.to_string(),
                runs_on,
                matrix,
            });
        }

        if jobs.is_empty() {
            return Err(WorkflowError::NoJobs {
                path: path.to_string(),
            });
        }

        Ok(Self {
            path: path.to_string(),
            jobs,
        })
    }

    /// Load and parse a workflow file from disk.
    pub fn load(path: &camino::Utf8Path) -> Result<Self, WorkflowError> {
        let content =
            std::fs::read_to_string(path.as_std_path()).map_err(|e| WorkflowError::Unreadable {
                path: path.to_string(),
                reason: e.to_string(),
            })?;
        Self::parse(path.as_str(), &content)
    }

    #[must_use]
    pub fn job(&self, id: &str) -> Option<&WorkflowJob> {
        self.jobs.iter().find(|j| j.id == id)
    }
}

/// The analyzer's routing decision for one platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobRoute {
    /// Run the named job in the container workflow emulator.
    ContainerRunner { job: String },
    /// Build natively over SSH, optionally guided by a workflow job.
    NativeSsh { job: Option<String> },
    /// Run the tool's declared cross-compile recipe locally.
    CrossCompile { recipe: Vec<String> },
    /// Job map says `"none"`: no hosted job, native host required.
    NullPlatform,
    /// The runner label set cannot be classified.
    Unresolvable { reason: String },
}

/// Route plus any warnings the analyzer produced on the way.
#[derive(Debug, Clone)]
pub struct Routed {
    pub route: JobRoute,
    pub warnings: Vec<String>,
}

/// How a runner label set classifies, independent of any platform.
fn classify_runner(
    runs_on: &[String],
    label_strategies: &BTreeMap<String, String>,
) -> Option<Os> {
    for label in runs_on {
        if label.starts_with("ubuntu-") {
            return Some(Os::Linux);
        }
        if label.starts_with("macos-") {
            return Some(Os::Darwin);
        }
        if label.starts_with("windows-") {
            return Some(Os::Windows);
        }
    }
    // self-hosted: classify by the configured label map.
    if runs_on.iter().any(|l| l == "self-hosted") {
        for label in runs_on {
            match label_strategies.get(label).map(String::as_str) {
                Some("container-runner") => return Some(Os::Linux),
                Some("darwin") => return Some(Os::Darwin),
                Some("windows") => return Some(Os::Windows),
                _ => {}
            }
        }
    }
    None
}

/// Map a requested platform to its build route.
///
/// `label_strategies` comes from `config.yaml` and classifies self-hosted
/// runner labels (label → `container-runner` | `darwin` | `windows`).
#[must_use]
pub fn route_platform(
    doc: &WorkflowDoc,
    tool: &ToolSpec,
    platform: &Platform,
    label_strategies: &BTreeMap<String, String>,
) -> Routed {
    let mut warnings = Vec::new();

    // Declared cross-compile recipes win; the workflow is not consulted.
    if let Some(recipe) = tool.cross_compile.get(&platform.to_string()) {
        return Routed {
            route: JobRoute::CrossCompile {
                recipe: recipe.clone(),
            },
            warnings,
        };
    }

    // Explicit job map.
    if let Some(job_id) = tool.job_for(platform) {
        if job_id == "none" {
            return Routed {
                route: JobRoute::NullPlatform,
                warnings,
            };
        }
        let Some(job) = doc.job(job_id) else {
            return Routed {
                route: JobRoute::Unresolvable {
                    reason: format!("job '{job_id}' not found in {}", doc.path),
                },
                warnings,
            };
        };
        return match classify_runner(&job.runs_on, label_strategies) {
            Some(Os::Linux) => Routed {
                route: JobRoute::ContainerRunner {
                    job: job.id.clone(),
                },
                warnings,
            },
            Some(Os::Darwin | Os::Windows) => Routed {
                route: JobRoute::NativeSsh {
                    job: Some(job.id.clone()),
                },
                warnings,
            },
            None => {
                warnings.push(format!(
                    "job '{}' has unclassifiable runner labels {:?}",
                    job.id, job.runs_on
                ));
                Routed {
                    route: JobRoute::Unresolvable {
                        reason: format!("unclassifiable runner labels on job '{}'", job.id),
                    },
                    warnings,
                }
            }
        };
    }

    // No job map: first job whose runner matches the platform OS.
    for job in &doc.jobs {
        if classify_runner(&job.runs_on, label_strategies) == Some(platform.os) {
            let route = match platform.os {
                Os::Linux => JobRoute::ContainerRunner {
                    job: job.id.clone(),
                },
                Os::Darwin | Os::Windows => JobRoute::NativeSsh {
                    job: Some(job.id.clone()),
                },
            };
            return Routed { route, warnings };
        }
    }

    // Nothing matched. Darwin/Windows can still build natively over SSH;
    // Linux without a container job is unresolvable.
    match platform.os {
        Os::Darwin | Os::Windows => {
            warnings.push(format!(
                "no workflow job matches {platform}; falling back to a native build"
            ));
            Routed {
                route: JobRoute::NativeSsh { job: None },
                warnings,
            }
        }
        Os::Linux => Routed {
            route: JobRoute::Unresolvable {
                reason: format!("no workflow job matches {platform}"),
            },
            warnings,
        },
    }
}
