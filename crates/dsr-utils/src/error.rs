//! Error taxonomy for dsr.
//!
//! Every failure class carries a stable string code (`E001`..`E041`). The
//! codes are part of the machine-readable contract: they appear verbatim in
//! the run envelope's `errors[]` entries and drive the exit-code mapper in
//! [`crate::exit_codes`]. Codes never change meaning within a release line.
//!
//! | Codes | Class |
//! |-------|-------|
//! | E001/E002 | authentication (hosted CI / SSH) |
//! | E003/E004 | network (timeout / unreachable host) |
//! | E010–E012 | build (compilation / dependency / workflow emulator) |
//! | E020–E022 | release (upload / tag conflict / signing) |
//! | E030–E031 | configuration (invalid / missing required) |
//! | E040–E041 | system (container daemon / required tool) |

use std::io;

/// Authentication failures against the hosted CI or an SSH builder.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The hosted-CI CLI rejected or lacked credentials (E001).
    #[error("hosted CI authentication failed: {reason}")]
    HostedCi { reason: String },

    /// An SSH builder rejected our key or identity (E002).
    #[error("SSH authentication to host '{host}' failed: {reason}")]
    Ssh { host: String, reason: String },
}

impl AuthError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::HostedCi { .. } => "E001",
            Self::Ssh { .. } => "E002",
        }
    }
}

/// Network failures: timed-out remote calls and unreachable hosts.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// A remote call exceeded its per-class timeout (E003).
    #[error("network operation '{operation}' timed out after {timeout_secs}s")]
    Timeout {
        operation: String,
        timeout_secs: u64,
    },

    /// A build host did not answer its reachability probe (E004).
    #[error("host '{host}' is unreachable: {reason}")]
    Unreachable { host: String, reason: String },
}

impl NetworkError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "E003",
            Self::Unreachable { .. } => "E004",
        }
    }
}

/// Build failures reported by an executor.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// The project's own build failed on the host (E010).
    #[error("build failed for {platform}: {reason}")]
    Compilation { platform: String, reason: String },

    /// A toolchain or project dependency was missing on the host (E011).
    #[error("build dependency missing on host '{host}': {dependency}")]
    Dependency { host: String, dependency: String },

    /// The container workflow emulator itself failed (E012).
    #[error("workflow emulator failed for job '{job}': {reason}")]
    Emulator { job: String, reason: String },
}

impl BuildError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Compilation { .. } => "E010",
            Self::Dependency { .. } => "E011",
            Self::Emulator { .. } => "E012",
        }
    }
}

/// Release-stage failures: uploads, tags, signing.
#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    /// An asset upload failed permanently, or retries were exhausted (E020).
    #[error("upload of '{asset}' failed: {reason}")]
    Upload { asset: String, reason: String },

    /// The release tag exists at a different revision (E021).
    #[error("tag '{tag}' conflicts with existing revision {existing}")]
    TagConflict { tag: String, existing: String },

    /// The out-of-process signer failed (E022).
    #[error("signing '{path}' failed: {reason}")]
    Signing { path: String, reason: String },
}

impl ReleaseError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Upload { .. } => "E020",
            Self::TagConflict { .. } => "E021",
            Self::Signing { .. } => "E022",
        }
    }
}

/// Configuration errors, surfaced before any build starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A config value is present but invalid (E030).
    #[error("invalid configuration for '{key}': {reason}")]
    Invalid { key: String, reason: String },

    /// A required key or file is missing (E031).
    #[error("missing required configuration: {key}")]
    MissingRequired { key: String },
}

impl ConfigError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Invalid { .. } => "E030",
            Self::MissingRequired { .. } => "E031",
        }
    }
}

/// Local system prerequisites: the container daemon and required tools.
#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    /// The container daemon is not running or not reachable (E040).
    #[error("container daemon unavailable: {reason}")]
    ContainerDaemon { reason: String },

    /// A required external tool is not installed or not on PATH (E041).
    #[error("required tool '{tool}' not found: {remedy}")]
    MissingTool { tool: String, remedy: String },
}

impl SystemError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::ContainerDaemon { .. } => "E040",
            Self::MissingTool { .. } => "E041",
        }
    }
}

/// Top-level error sum for dsr.
///
/// Workers never panic across a stage boundary; they return one of these and
/// the stage aggregates. The orchestrator decides continuation per class:
/// authentication, configuration and system errors are fatal, build and
/// release errors are stage-terminal, network errors are retried by the
/// publisher before demotion to a release error.
#[derive(Debug, thiserror::Error)]
pub enum DsrError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Release(#[from] ReleaseError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    System(#[from] SystemError),

    /// Another dsr process holds the lock for the same scope.
    #[error("another dsr process is already running for '{scope}' (pid {pid})")]
    LockHeld { scope: String, pid: u32 },

    /// The run was cancelled by the user.
    #[error("interrupted by user")]
    Cancelled,

    /// A build target exceeded its execution ceiling. Counts as a build
    /// failure for status purposes, but keeps its own exit class.
    #[error("target '{target}' timed out after {timeout_secs}s")]
    TargetTimeout { target: String, timeout_secs: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DsrError {
    /// Stable error code for envelope entries.
    ///
    /// Codes for the lock, cancellation, timeout and I/O variants fall
    /// outside the E0xx taxonomy; they use reserved identifiers that are
    /// equally stable.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Auth(e) => e.code(),
            Self::Network(e) => e.code(),
            Self::Build(e) => e.code(),
            Self::Release(e) => e.code(),
            Self::Config(e) => e.code(),
            Self::System(e) => e.code(),
            Self::LockHeld { .. } => "E050",
            Self::Cancelled => "E051",
            Self::TargetTimeout { .. } => "E052",
            Self::Io(_) => "E099",
        }
    }

    /// One-sentence remedy shown in human mode next to the error line.
    #[must_use]
    pub fn remedy(&self) -> Option<&'static str> {
        match self {
            Self::Auth(AuthError::HostedCi { .. }) => {
                Some("run `gh auth login` and retry")
            }
            Self::Auth(AuthError::Ssh { .. }) => {
                Some("check the host's ssh alias and key in hosts.yaml")
            }
            Self::Network(NetworkError::Unreachable { .. }) => {
                Some("verify the host is powered on and reachable over ssh")
            }
            Self::System(SystemError::ContainerDaemon { .. }) => {
                Some("start the container daemon and run `dsr doctor`")
            }
            Self::System(SystemError::MissingTool { .. }) => Some("run `dsr doctor` for details"),
            Self::LockHeld { .. } => Some("wait for the other run or remove a stale lock"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_codes_are_stable() {
        let hosted = AuthError::HostedCi {
            reason: "no token".into(),
        };
        let ssh = AuthError::Ssh {
            host: "mac-mini".into(),
            reason: "publickey".into(),
        };
        assert_eq!(hosted.code(), "E001");
        assert_eq!(ssh.code(), "E002");
    }

    #[test]
    fn network_codes_are_stable() {
        let timeout = NetworkError::Timeout {
            operation: "gh run list".into(),
            timeout_secs: 10,
        };
        let unreachable = NetworkError::Unreachable {
            host: "win-box".into(),
            reason: "connection refused".into(),
        };
        assert_eq!(timeout.code(), "E003");
        assert_eq!(unreachable.code(), "E004");
    }

    #[test]
    fn build_release_config_system_codes() {
        assert_eq!(
            BuildError::Compilation {
                platform: "linux/amd64".into(),
                reason: "cc failed".into()
            }
            .code(),
            "E010"
        );
        assert_eq!(
            BuildError::Dependency {
                host: "local".into(),
                dependency: "zig".into()
            }
            .code(),
            "E011"
        );
        assert_eq!(
            BuildError::Emulator {
                job: "build-linux".into(),
                reason: "image pull failed".into()
            }
            .code(),
            "E012"
        );
        assert_eq!(
            ReleaseError::Upload {
                asset: "a.tar.gz".into(),
                reason: "500".into()
            }
            .code(),
            "E020"
        );
        assert_eq!(
            ReleaseError::TagConflict {
                tag: "v1.0.0".into(),
                existing: "abc123".into()
            }
            .code(),
            "E021"
        );
        assert_eq!(
            ReleaseError::Signing {
                path: "a.tar.gz".into(),
                reason: "key not found".into()
            }
            .code(),
            "E022"
        );
        assert_eq!(
            ConfigError::Invalid {
                key: "asset_pattern".into(),
                reason: "undefined variable".into()
            }
            .code(),
            "E030"
        );
        assert_eq!(
            ConfigError::MissingRequired {
                key: "repo".into()
            }
            .code(),
            "E031"
        );
        assert_eq!(
            SystemError::ContainerDaemon {
                reason: "socket missing".into()
            }
            .code(),
            "E040"
        );
        assert_eq!(
            SystemError::MissingTool {
                tool: "minisign".into(),
                remedy: "install minisign".into()
            }
            .code(),
            "E041"
        );
    }

    #[test]
    fn top_level_code_delegates_to_class() {
        let err = DsrError::Auth(AuthError::HostedCi {
            reason: "expired".into(),
        });
        assert_eq!(err.code(), "E001");

        let err = DsrError::TargetTimeout {
            target: "darwin/arm64".into(),
            timeout_secs: 3600,
        };
        assert_eq!(err.code(), "E052");
    }

    #[test]
    fn io_errors_convert() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "missing");
        let err: DsrError = io_err.into();
        assert_eq!(err.code(), "E099");
    }

    #[test]
    fn remedies_exist_for_dependency_classes() {
        let err = DsrError::Auth(AuthError::HostedCi {
            reason: "expired".into(),
        });
        assert!(err.remedy().is_some());

        let err = DsrError::Build(BuildError::Compilation {
            platform: "linux/amd64".into(),
            reason: "cc".into(),
        });
        assert!(err.remedy().is_none());
    }
}
