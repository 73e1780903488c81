//! Host reachability probes.
//!
//! Run before any build is dispatched to a host, so an unreachable builder
//! fails its targets immediately without consuming compute.

use std::time::Duration;

use dsr_types::{ConnectionKind, HostSpec};
use dsr_utils::{AuthError, DsrError, NetworkError, SystemError};

use crate::process::{ProcessRunner, RunnerError};
use crate::CommandSpec;

/// Short ceiling for the probe itself; this is not the build timeout.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Probe one host.
///
/// - `local` hosts are trivially reachable.
/// - `ssh` hosts run a no-op command in batch mode; a permission failure is
///   an authentication error, anything else is unreachable.
/// - `container-runner` hosts ping the container daemon.
pub async fn check_reachable(runner: &dyn ProcessRunner, host: &HostSpec) -> Result<(), DsrError> {
    match host.kind {
        ConnectionKind::Local => Ok(()),
        ConnectionKind::Ssh => {
            let alias = host.ssh_alias.as_deref().unwrap_or(&host.id);
            let cmd = CommandSpec::new("ssh")
                .args(["-o", "BatchMode=yes", "-o", "ConnectTimeout=5"])
                .arg(alias)
                .arg("true");
            match runner.run(&cmd, PROBE_TIMEOUT).await {
                Ok(output) if output.success() => Ok(()),
                Ok(output) => {
                    let stderr = output.stderr_string();
                    if stderr.contains("Permission denied") {
                        Err(AuthError::Ssh {
                            host: host.id.clone(),
                            reason: stderr.lines().last().unwrap_or("").to_string(),
                        }
                        .into())
                    } else {
                        Err(NetworkError::Unreachable {
                            host: host.id.clone(),
                            reason: output.stderr_tail(1),
                        }
                        .into())
                    }
                }
                Err(RunnerError::Timeout { timeout_secs }) => Err(NetworkError::Timeout {
                    operation: format!("ssh probe of '{}'", host.id),
                    timeout_secs,
                }
                .into()),
                Err(e) => Err(NetworkError::Unreachable {
                    host: host.id.clone(),
                    reason: e.to_string(),
                }
                .into()),
            }
        }
        ConnectionKind::ContainerRunner => {
            let cmd = CommandSpec::new("docker").args(["info", "--format", "{{.ServerVersion}}"]);
            match runner.run(&cmd, PROBE_TIMEOUT).await {
                Ok(output) if output.success() => Ok(()),
                Ok(output) => Err(SystemError::ContainerDaemon {
                    reason: output.stderr_tail(1),
                }
                .into()),
                Err(e) => Err(SystemError::ContainerDaemon {
                    reason: e.to_string(),
                }
                .into()),
            }
        }
    }
}
