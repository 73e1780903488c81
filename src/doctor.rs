//! `doctor`: verify external dependencies, authentication, the container
//! daemon, the emulator's user-mapping support, and SSH host reachability.

use std::time::Duration;

use serde::Serialize;

use dsr_runner::{CommandSpec, ProcessRunner, TokioRunner, check_reachable};
use dsr_types::{ConnectionKind, RunStatus, envelope::EnvelopeBuilder};
use dsr_utils::ExitCode;

use crate::cli::CommandOutput;
use crate::cli::commands::App;

const CHECK_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Serialize)]
struct CheckResult {
    name: String,
    ok: bool,
    required: bool,
    detail: String,
}

fn tool_on_path(name: &str, required: bool) -> CheckResult {
    match which::which(name) {
        Ok(path) => CheckResult {
            name: format!("tool:{name}"),
            ok: true,
            required,
            detail: path.display().to_string(),
        },
        Err(_) => CheckResult {
            name: format!("tool:{name}"),
            ok: false,
            required,
            detail: format!("'{name}' not found on PATH"),
        },
    }
}

async fn exec_check(
    runner: &dyn ProcessRunner,
    name: &str,
    cmd: CommandSpec,
    required: bool,
) -> CheckResult {
    match runner.run(&cmd, CHECK_TIMEOUT).await {
        Ok(output) if output.success() => CheckResult {
            name: name.to_string(),
            ok: true,
            required,
            detail: "ok".to_string(),
        },
        Ok(output) => CheckResult {
            name: name.to_string(),
            ok: false,
            required,
            detail: output.stderr_tail(1),
        },
        Err(e) => CheckResult {
            name: name.to_string(),
            ok: false,
            required,
            detail: e.to_string(),
        },
    }
}

/// Run every check and report.
pub async fn run(app: &App) -> CommandOutput {
    let runner = TokioRunner;
    let settings = &app.config.settings;
    let mut checks = Vec::new();

    // External binaries. Signing and SBOM tools are only required when the
    // corresponding features are on.
    for name in ["gh", "git", "act", "docker", "ssh", "scp", "tar", "zip"] {
        checks.push(tool_on_path(name, true));
    }
    checks.push(tool_on_path("minisign", settings.signing_enabled));
    checks.push(tool_on_path("syft", settings.sbom_enabled));

    // Hosted-CI authentication.
    checks.push(
        exec_check(
            &runner,
            "gh-auth",
            CommandSpec::new("gh").args(["auth", "status"]),
            true,
        )
        .await,
    );

    // Container daemon.
    checks.push(
        exec_check(
            &runner,
            "container-daemon",
            CommandSpec::new("docker").args(["info", "--format", "{{.ServerVersion}}"]),
            true,
        )
        .await,
    );

    // The workflow emulator must support per-container user mapping, or
    // artifacts come back owned by the builder user instead of the invoking
    // one.
    let act_help = runner
        .run(&CommandSpec::new("act").arg("--help"), CHECK_TIMEOUT)
        .await;
    checks.push(match act_help {
        Ok(output) if output.stdout_string().contains("--container-options") => CheckResult {
            name: "act-user-mapping".to_string(),
            ok: true,
            required: true,
            detail: format!("uid/gid mapping available (uid {})", dsr_runner::invoking_user().0),
        },
        Ok(_) => CheckResult {
            name: "act-user-mapping".to_string(),
            ok: false,
            required: true,
            detail: "act lacks --container-options; artifacts would not be writable".to_string(),
        },
        Err(e) => CheckResult {
            name: "act-user-mapping".to_string(),
            ok: false,
            required: true,
            detail: e.to_string(),
        },
    });

    // SSH builder reachability.
    for host in &app.config.hosts {
        if host.kind != ConnectionKind::Ssh {
            continue;
        }
        let result = check_reachable(&runner, host).await;
        checks.push(CheckResult {
            name: format!("host:{}", host.id),
            ok: result.is_ok(),
            required: false,
            detail: match result {
                Ok(()) => "reachable".to_string(),
                Err(e) => e.to_string(),
            },
        });
    }

    let failed_required = checks.iter().filter(|c| !c.ok && c.required).count();
    let mut builder = EnvelopeBuilder::begin("doctor", "", "");
    builder.insert_detail("checks", serde_json::to_value(&checks).unwrap_or_default());

    let stdout_lines = checks
        .iter()
        .map(|c| {
            format!(
                "{} {} - {}",
                if c.ok {
                    "ok  "
                } else if c.required {
                    "FAIL"
                } else {
                    "warn"
                },
                c.name,
                c.detail
            )
        })
        .collect();

    let envelope = if failed_required > 0 {
        builder.finish(RunStatus::Error, ExitCode::DEPENDENCY)
    } else {
        builder.finish(RunStatus::Success, ExitCode::SUCCESS)
    };
    CommandOutput {
        envelope,
        stdout_lines,
    }
}
