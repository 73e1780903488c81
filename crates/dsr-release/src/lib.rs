//! Release publisher.
//!
//! Ensures the tag and upstream release object exist, then uploads the
//! artifact set. Uploads are idempotent: re-running against an existing
//! release replaces assets with matching names (`--clobber`). Transient
//! failures (network, HTTP 5xx) are retried with exponential backoff;
//! exhaustion demotes to a release error. Permanent failures (HTTP 4xx
//! other than the idempotent-replace 409) surface immediately.

use std::time::Duration;

use camino::Utf8PathBuf;
use tracing::{debug, info, warn};

use dsr_runner::{CommandSpec, ProcessOutput, ProcessRunner, RunnerError};
use dsr_types::ToolSpec;
use dsr_utils::{AuthError, DsrError, NetworkError, ReleaseError};

/// Ceiling for one `gh`/`git` invocation.
const CALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Publisher options from `config.yaml`.
#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub draft: bool,
    pub prerelease: bool,
    /// Retry attempts per asset on transient failures.
    pub max_retries: u32,
    /// First backoff delay; doubles per attempt. Tests shrink this.
    pub retry_base_delay: Duration,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            draft: false,
            prerelease: false,
            max_retries: 3,
            retry_base_delay: Duration::from_secs(2),
        }
    }
}

/// What a publish produced.
#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub release_url: String,
    pub uploaded: usize,
    /// True when the release object already existed.
    pub reused_release: bool,
}

fn is_transient(output: &ProcessOutput) -> bool {
    let stderr = output.stderr_string();
    stderr.contains("HTTP 5")
        || stderr.contains("timeout")
        || stderr.contains("connection reset")
        || stderr.contains("unexpected EOF")
}

fn is_auth_failure(output: &ProcessOutput) -> bool {
    let stderr = output.stderr_string();
    stderr.contains("HTTP 401") || stderr.contains("auth login")
}

async fn run(
    runner: &dyn ProcessRunner,
    cmd: &CommandSpec,
) -> Result<ProcessOutput, DsrError> {
    runner.run(cmd, CALL_TIMEOUT).await.map_err(|e| match e {
        RunnerError::Timeout { timeout_secs } => NetworkError::Timeout {
            operation: cmd.display(),
            timeout_secs,
        }
        .into(),
        other => DsrError::Release(ReleaseError::Upload {
            asset: cmd.display(),
            reason: other.to_string(),
        }),
    })
}

/// Ensure a tag exists at the build revision; create and push it if absent.
async fn ensure_tag(
    runner: &dyn ProcessRunner,
    tool: &ToolSpec,
    tag: &str,
    revision: &str,
) -> Result<(), DsrError> {
    let resolve = CommandSpec::new("git")
        .args(["-C", tool.source_path.as_str()])
        .args(["rev-parse", &format!("{tag}^{{commit}}")]);
    let output = run(runner, &resolve).await?;

    if output.success() {
        let existing = output.stdout_string().trim().to_string();
        if !existing.is_empty() && !existing.starts_with(revision) && !revision.starts_with(&existing)
        {
            return Err(ReleaseError::TagConflict {
                tag: tag.to_string(),
                existing,
            }
            .into());
        }
        return Ok(());
    }

    debug!(%tag, %revision, "tag missing, creating");
    let create = CommandSpec::new("git")
        .args(["-C", tool.source_path.as_str()])
        .args(["tag", tag, revision]);
    let output = run(runner, &create).await?;
    if !output.success() {
        return Err(ReleaseError::TagConflict {
            tag: tag.to_string(),
            existing: output.stderr_tail(1),
        }
        .into());
    }

    let push = CommandSpec::new("git")
        .args(["-C", tool.source_path.as_str()])
        .args(["push", "origin", tag]);
    let output = run(runner, &push).await?;
    if !output.success() {
        return Err(ReleaseError::Upload {
            asset: format!("tag {tag}"),
            reason: output.stderr_tail(2),
        }
        .into());
    }
    Ok(())
}

/// Ensure the upstream release object exists; returns its URL and whether
/// it already existed.
async fn ensure_release(
    runner: &dyn ProcessRunner,
    tool: &ToolSpec,
    tag: &str,
    opts: &PublishOptions,
) -> Result<(String, bool), DsrError> {
    let repo = tool.repo.to_string();
    let view = CommandSpec::new("gh")
        .args(["release", "view", tag])
        .args(["--repo", &repo])
        .args(["--json", "url"]);
    let output = run(runner, &view).await?;
    if output.success() {
        let url = parse_release_url(&output.stdout_string())
            .unwrap_or_else(|| format!("https://github.com/{repo}/releases/tag/{tag}"));
        return Ok((url, true));
    }
    if is_auth_failure(&output) {
        return Err(AuthError::HostedCi {
            reason: output.stderr_tail(1),
        }
        .into());
    }

    let mut create = CommandSpec::new("gh")
        .args(["release", "create", tag])
        .args(["--repo", &repo])
        .args(["--title", tag])
        .args(["--notes", &format!("Release {tag} (built by dsr)")]);
    if opts.draft {
        create = create.arg("--draft");
    }
    if opts.prerelease {
        create = create.arg("--prerelease");
    }
    let output = run(runner, &create).await?;
    if !output.success() {
        return Err(ReleaseError::Upload {
            asset: format!("release {tag}"),
            reason: output.stderr_tail(2),
        }
        .into());
    }
    let url = output.stdout_string().trim().to_string();
    let url = if url.is_empty() {
        format!("https://github.com/{repo}/releases/tag/{tag}")
    } else {
        url
    };
    Ok((url, false))
}

fn parse_release_url(json: &str) -> Option<String> {
    // {"url":"https://..."} without pulling a JSON dependency in here.
    let idx = json.find("\"url\"")?;
    let rest = &json[idx + 5..];
    let start = rest.find('"')? + 1;
    let end = rest[start..].find('"')? + start;
    Some(rest[start..end].to_string())
}

/// Upload one asset with retry on transient failures.
async fn upload_asset(
    runner: &dyn ProcessRunner,
    tool: &ToolSpec,
    tag: &str,
    file: &Utf8PathBuf,
    opts: &PublishOptions,
) -> Result<(), DsrError> {
    let repo = tool.repo.to_string();
    let cmd = CommandSpec::new("gh")
        .args(["release", "upload", tag])
        .arg(file.as_str())
        .arg("--clobber")
        .args(["--repo", &repo]);

    let mut delay = opts.retry_base_delay;
    let mut attempt = 0;
    loop {
        let output = run(runner, &cmd).await?;
        if output.success() {
            return Ok(());
        }
        let stderr = output.stderr_string();
        // 409 on an idempotent replace is not a failure mode; retry once
        // more and the clobber wins.
        let permanent = stderr.contains("HTTP 4") && !stderr.contains("HTTP 409");
        if permanent {
            return Err(ReleaseError::Upload {
                asset: file.to_string(),
                reason: output.stderr_tail(2),
            }
            .into());
        }
        attempt += 1;
        if attempt > opts.max_retries || !(is_transient(&output) || stderr.contains("HTTP 409")) {
            // Retries exhausted (or unclassifiable): demote to a release
            // error rather than a network error.
            return Err(ReleaseError::Upload {
                asset: file.to_string(),
                reason: format!("after {attempt} attempts: {}", output.stderr_tail(2)),
            }
            .into());
        }
        warn!(asset = %file, attempt, "transient upload failure, backing off");
        tokio::time::sleep(delay).await;
        delay *= 2;
    }
}

/// Publish the artifact set for one version.
pub async fn publish(
    runner: &dyn ProcessRunner,
    tool: &ToolSpec,
    version: &str,
    revision: &str,
    files: &[Utf8PathBuf],
    opts: &PublishOptions,
) -> Result<PublishOutcome, DsrError> {
    let tag = if version.starts_with('v') {
        version.to_string()
    } else {
        format!("v{version}")
    };

    ensure_tag(runner, tool, &tag, revision).await?;
    let (release_url, reused_release) = ensure_release(runner, tool, &tag, opts).await?;

    let mut uploaded = 0;
    for file in files {
        upload_asset(runner, tool, &tag, file, opts).await?;
        uploaded += 1;
    }
    info!(%release_url, uploaded, "release published");

    Ok(PublishOutcome {
        release_url,
        uploaded,
        reused_release,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedRunner<F>(F, Mutex<Vec<String>>);

    #[async_trait]
    impl<F> ProcessRunner for ScriptedRunner<F>
    where
        F: Fn(usize, &CommandSpec) -> Result<ProcessOutput, RunnerError> + Send + Sync,
    {
        async fn run(
            &self,
            cmd: &CommandSpec,
            _timeout: Duration,
        ) -> Result<ProcessOutput, RunnerError> {
            let mut log = self.1.lock().unwrap();
            let n = log.len();
            log.push(cmd.display());
            (self.0)(n, cmd)
        }
    }

    fn output(code: i32, stdout: &str, stderr: &str) -> ProcessOutput {
        ProcessOutput {
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
            exit_code: Some(code),
            duration: Duration::from_millis(1),
        }
    }

    fn tool() -> ToolSpec {
        serde_yaml::from_str(
            r#"
tool: cass
repo: someuser/cass
source_path: /src/cass
platforms: [linux/amd64]
asset_pattern: "${name}-${version}-${target}${ext}"
"#,
        )
        .unwrap()
    }

    fn fast_opts() -> PublishOptions {
        PublishOptions {
            retry_base_delay: Duration::from_millis(1),
            ..PublishOptions::default()
        }
    }

    #[tokio::test]
    async fn publishes_to_existing_tag_and_release() {
        let runner = ScriptedRunner(
            |_n, cmd: &CommandSpec| {
                let display = cmd.display();
                if display.contains("rev-parse") {
                    Ok(output(0, "abc1234def\n", ""))
                } else if display.contains("release view") {
                    Ok(output(
                        0,
                        r#"{"url":"https://github.com/someuser/cass/releases/tag/v1.2.3"}"#,
                        "",
                    ))
                } else {
                    Ok(output(0, "", ""))
                }
            },
            Mutex::new(Vec::new()),
        );

        let files = vec![
            Utf8PathBuf::from("/staging/cass-1.2.3-linux-amd64.tar.gz"),
            Utf8PathBuf::from("/staging/cass-1.2.3-checksums.sha256"),
        ];
        let outcome = publish(&runner, &tool(), "1.2.3", "abc1234", &files, &fast_opts())
            .await
            .unwrap();

        assert_eq!(outcome.uploaded, 2);
        assert!(outcome.reused_release);
        assert_eq!(
            outcome.release_url,
            "https://github.com/someuser/cass/releases/tag/v1.2.3"
        );

        let commands = runner.1.lock().unwrap().clone();
        assert!(commands.iter().any(|c| c.contains("release upload v1.2.3")
            && c.contains("--clobber")));
        // No tag creation happened.
        assert!(!commands.iter().any(|c| c.contains("git") && c.contains("push")));
    }

    #[tokio::test]
    async fn creates_missing_tag_and_release() {
        let runner = ScriptedRunner(
            |_n, cmd: &CommandSpec| {
                let display = cmd.display();
                if display.contains("rev-parse") {
                    Ok(output(128, "", "fatal: unknown revision"))
                } else if display.contains("release view") {
                    Ok(output(1, "", "release not found"))
                } else if display.contains("release create") {
                    Ok(output(
                        0,
                        "https://github.com/someuser/cass/releases/tag/v2.0.0\n",
                        "",
                    ))
                } else {
                    Ok(output(0, "", ""))
                }
            },
            Mutex::new(Vec::new()),
        );

        let outcome = publish(&runner, &tool(), "v2.0.0", "abc1234", &[], &fast_opts())
            .await
            .unwrap();
        assert!(!outcome.reused_release);

        let commands = runner.1.lock().unwrap().clone();
        assert!(commands.iter().any(|c| c.contains("tag v2.0.0 abc1234")));
        assert!(commands.iter().any(|c| c.contains("push origin v2.0.0")));
        assert!(commands.iter().any(|c| c.contains("release create v2.0.0")));
    }

    #[tokio::test]
    async fn tag_at_different_revision_is_conflict() {
        let runner = ScriptedRunner(
            |_n, cmd: &CommandSpec| {
                if cmd.display().contains("rev-parse") {
                    Ok(output(0, "fffffff\n", ""))
                } else {
                    Ok(output(0, "", ""))
                }
            },
            Mutex::new(Vec::new()),
        );
        let err = publish(&runner, &tool(), "1.2.3", "abc1234", &[], &fast_opts())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "E021");
    }

    #[tokio::test]
    async fn transient_upload_failure_retries_then_succeeds() {
        let runner = ScriptedRunner(
            |n, cmd: &CommandSpec| {
                let display = cmd.display();
                if display.contains("rev-parse") || display.contains("release view") {
                    Ok(output(0, "abc1234\n", ""))
                } else if display.contains("release upload") {
                    // First upload attempt fails transiently (call index 2),
                    // second succeeds.
                    if n == 2 {
                        Ok(output(1, "", "HTTP 502 bad gateway"))
                    } else {
                        Ok(output(0, "", ""))
                    }
                } else {
                    Ok(output(0, "", ""))
                }
            },
            Mutex::new(Vec::new()),
        );

        let files = vec![Utf8PathBuf::from("/staging/a.tar.gz")];
        let outcome = publish(&runner, &tool(), "1.2.3", "abc1234", &files, &fast_opts())
            .await
            .unwrap();
        assert_eq!(outcome.uploaded, 1);

        let commands = runner.1.lock().unwrap().clone();
        let uploads = commands.iter().filter(|c| c.contains("release upload")).count();
        assert_eq!(uploads, 2);
    }

    #[tokio::test]
    async fn permanent_4xx_fails_without_retry() {
        let runner = ScriptedRunner(
            |_n, cmd: &CommandSpec| {
                let display = cmd.display();
                if display.contains("release upload") {
                    Ok(output(1, "", "HTTP 422 validation failed"))
                } else {
                    Ok(output(0, "abc1234\n", ""))
                }
            },
            Mutex::new(Vec::new()),
        );
        let files = vec![Utf8PathBuf::from("/staging/a.tar.gz")];
        let err = publish(&runner, &tool(), "1.2.3", "abc1234", &files, &fast_opts())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "E020");

        let commands = runner.1.lock().unwrap().clone();
        let uploads = commands.iter().filter(|c| c.contains("release upload")).count();
        assert_eq!(uploads, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_demote_to_release_error() {
        let runner = ScriptedRunner(
            |_n, cmd: &CommandSpec| {
                if cmd.display().contains("release upload") {
                    Ok(output(1, "", "HTTP 503 unavailable"))
                } else {
                    Ok(output(0, "abc1234\n", ""))
                }
            },
            Mutex::new(Vec::new()),
        );
        let files = vec![Utf8PathBuf::from("/staging/a.tar.gz")];
        let err = publish(&runner, &tool(), "1.2.3", "abc1234", &files, &fast_opts())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "E020");

        let commands = runner.1.lock().unwrap().clone();
        let uploads = commands.iter().filter(|c| c.contains("release upload")).count();
        // Initial attempt plus max_retries.
        assert_eq!(uploads, 4);
    }

    #[tokio::test]
    async fn auth_failure_on_view_is_dependency_class() {
        let runner = ScriptedRunner(
            |_n, cmd: &CommandSpec| {
                let display = cmd.display();
                if display.contains("rev-parse") {
                    Ok(output(0, "abc1234\n", ""))
                } else if display.contains("release view") {
                    Ok(output(1, "", "HTTP 401: authentication required"))
                } else {
                    Ok(output(0, "", ""))
                }
            },
            Mutex::new(Vec::new()),
        );
        let err = publish(&runner, &tool(), "1.2.3", "abc1234", &[], &fast_opts())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "E001");
    }
}
