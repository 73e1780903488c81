//! Host executor: dispatch one build target to one host.
//!
//! Contracts per strategy:
//!
//! - **container-runner**: invoke the `act` workflow emulator against the
//!   project's workflow file, targeting the named job, passing matrix
//!   filters, collecting emitted artifacts into the target's staging
//!   directory. The invoking user's numeric uid/gid is passed into the
//!   container so artifacts come back writable.
//! - **native-ssh**: clone a clean working copy at the target revision on
//!   the remote host, run the tool's build recipe, and fetch `dist/` back
//!   into staging.
//! - **cross-compile**: run the declared recipe locally with `DSR_OUT`
//!   pointing at the staging directory.
//!
//! The reachability probe runs first; an unreachable host fails the target
//! immediately without consuming compute. A per-host mutex guarantees the
//! executor never runs two builds concurrently on the same host.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

use dsr_types::{BuildStrategy, BuildTarget, HostSpec, ToolSpec};
use dsr_utils::{BuildError, ConfigError, DsrError, SystemError};

use crate::process::{ProcessRunner, RunnerError};
use crate::reachability::check_reachable;
use crate::CommandSpec;

/// Numeric uid/gid of the invoking user, passed into the container runner
/// so emitted artifacts are writable outside it.
#[must_use]
pub fn invoking_user() -> (u32, u32) {
    #[cfg(unix)]
    // SAFETY: getuid/getgid cannot fail and have no preconditions.
    unsafe {
        (libc::getuid(), libc::getgid())
    }
    #[cfg(not(unix))]
    (1000, 1000)
}

/// Per-run inputs shared by every target.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub tool: ToolSpec,
    pub version: String,
    /// Upstream revision to build.
    pub revision: String,
    /// Per-run staging root; each target stages under its platform subdir.
    pub staging_dir: Utf8PathBuf,
    /// Ceiling for one build execution.
    pub build_timeout: Duration,
}

impl ExecutionContext {
    /// Staging subdirectory for one target.
    #[must_use]
    pub fn target_dir(&self, target: &BuildTarget) -> Utf8PathBuf {
        self.staging_dir
            .join(format!("{}-{}", target.platform.os.as_str(), target.platform.arch))
    }
}

/// What one target execution produced.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// Files emitted into the target's staging directory.
    pub artifacts: Vec<Utf8PathBuf>,
    pub duration: Duration,
    /// Workflow job that ran, when the strategy had one.
    pub job: Option<String>,
}

/// Dispatches single build targets to hosts.
pub struct HostExecutor<R> {
    runner: Arc<R>,
    host_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<R: ProcessRunner> HostExecutor<R> {
    #[must_use]
    pub fn new(runner: R) -> Self {
        Self::from_arc(Arc::new(runner))
    }

    /// Build an executor sharing an existing runner.
    #[must_use]
    pub fn from_arc(runner: Arc<R>) -> Self {
        Self {
            runner,
            host_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, host_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.host_locks.lock().await;
        locks
            .entry(host_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Execute one target on its host.
    pub async fn execute(
        &self,
        host: &HostSpec,
        target: &BuildTarget,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionOutcome, DsrError> {
        let lock = self.lock_for(&host.id).await;
        let _guard = lock.lock().await;

        check_reachable(self.runner.as_ref(), host).await?;

        let target_dir = ctx.target_dir(target);
        dsr_utils::paths::ensure_dir_all(&target_dir)?;

        let started = std::time::Instant::now();
        let job = match &target.strategy {
            BuildStrategy::ContainerRunner { job, matrix } => {
                self.run_container(host, target, ctx, &target_dir, job, matrix)
                    .await?;
                Some(job.clone())
            }
            BuildStrategy::NativeSsh { job } => {
                self.run_ssh(host, target, ctx, &target_dir).await?;
                job.clone()
            }
            BuildStrategy::CrossCompile { recipe } => {
                self.run_cross(target, ctx, &target_dir, recipe).await?;
                None
            }
        };

        let artifacts = collect_artifacts(&target_dir)?;
        info!(
            platform = %target.platform,
            host = %host.id,
            artifacts = artifacts.len(),
            "target build finished"
        );
        Ok(ExecutionOutcome {
            artifacts,
            duration: started.elapsed(),
            job,
        })
    }

    async fn run_container(
        &self,
        _host: &HostSpec,
        target: &BuildTarget,
        ctx: &ExecutionContext,
        target_dir: &Utf8Path,
        job: &str,
        matrix: &std::collections::BTreeMap<String, String>,
    ) -> Result<(), DsrError> {
        let (uid, gid) = invoking_user();
        let mut cmd = CommandSpec::new("act")
            .args(["--workflows", ctx.tool.workflow.as_str()])
            .args(["--job", job])
            .args(["--artifact-server-path", target_dir.as_str()])
            .args([
                "--container-options",
                &format!("--user {uid}:{gid}"),
            ])
            .cwd(ctx.tool.source_path.as_std_path());
        for (key, value) in matrix {
            cmd = cmd.args(["--matrix", &format!("{key}:{value}")]);
        }

        let output = self
            .runner
            .run(&cmd, ctx.build_timeout)
            .await
            .map_err(|e| self.map_runner_error(e, target, "act"))?;

        if output.success() {
            return Ok(());
        }
        let tail = output.stderr_tail(5);
        // The emulator failing to stage the workflow is a different class
        // than the project's build failing inside it.
        if tail.contains("Could not find any stages")
            || tail.contains("unable to pull")
            || tail.contains("workflow is not valid")
        {
            Err(BuildError::Emulator {
                job: job.to_string(),
                reason: tail,
            }
            .into())
        } else {
            Err(BuildError::Compilation {
                platform: target.platform.to_string(),
                reason: tail,
            }
            .into())
        }
    }

    async fn run_ssh(
        &self,
        host: &HostSpec,
        target: &BuildTarget,
        ctx: &ExecutionContext,
        target_dir: &Utf8Path,
    ) -> Result<(), DsrError> {
        let recipe = ctx.tool.native_build_command.as_deref().ok_or_else(|| {
            DsrError::Config(ConfigError::MissingRequired {
                key: format!("{}.native_build_command", ctx.tool.tool),
            })
        })?;
        let alias = host.ssh_alias.as_deref().unwrap_or(&host.id);
        let remote_dir = format!("dsr-build/{}-{}", ctx.tool.tool, ctx.version);
        let clone_url = format!(
            "https://github.com/{}/{}.git",
            ctx.tool.repo.owner, ctx.tool.repo.name
        );

        // Clean working copy at the target revision, then the recipe.
        // Artifacts land in dist/ by contract.
        let script = format!(
            "set -e; rm -rf {remote_dir}; git clone --quiet {clone_url} {remote_dir}; \
             cd {remote_dir}; git checkout --quiet {rev}; mkdir -p dist; {recipe}",
            rev = ctx.revision,
        );
        let build = CommandSpec::new("ssh").arg(alias).arg(script);
        let output = self
            .runner
            .run(&build, ctx.build_timeout)
            .await
            .map_err(|e| self.map_runner_error(e, target, "ssh"))?;
        if !output.success() {
            return Err(BuildError::Compilation {
                platform: target.platform.to_string(),
                reason: output.stderr_tail(5),
            }
            .into());
        }

        // Stream the artifacts back into staging.
        let fetch = CommandSpec::new("scp")
            .arg("-r")
            .arg(format!("{alias}:{remote_dir}/dist/."))
            .arg(target_dir.as_str());
        let output = self
            .runner
            .run(&fetch, ctx.build_timeout)
            .await
            .map_err(|e| self.map_runner_error(e, target, "scp"))?;
        if !output.success() {
            return Err(BuildError::Compilation {
                platform: target.platform.to_string(),
                reason: format!("artifact fetch failed: {}", output.stderr_tail(3)),
            }
            .into());
        }
        Ok(())
    }

    async fn run_cross(
        &self,
        target: &BuildTarget,
        ctx: &ExecutionContext,
        target_dir: &Utf8Path,
        recipe: &[String],
    ) -> Result<(), DsrError> {
        let Some((program, args)) = recipe.split_first() else {
            return Err(ConfigError::Invalid {
                key: "cross_compile".to_string(),
                reason: format!("empty recipe for {}", target.platform),
            }
            .into());
        };
        let cmd = CommandSpec::new(program)
            .args(args.iter().map(String::as_str))
            .env("DSR_OUT", target_dir.as_str())
            .cwd(ctx.tool.source_path.as_std_path());

        let output = self
            .runner
            .run(&cmd, ctx.build_timeout)
            .await
            .map_err(|e| self.map_runner_error(e, target, program))?;
        if !output.success() {
            return Err(BuildError::Compilation {
                platform: target.platform.to_string(),
                reason: output.stderr_tail(5),
            }
            .into());
        }
        Ok(())
    }

    fn map_runner_error(&self, err: RunnerError, target: &BuildTarget, program: &str) -> DsrError {
        match err {
            RunnerError::Timeout { timeout_secs } => DsrError::TargetTimeout {
                target: target.platform.to_string(),
                timeout_secs,
            },
            RunnerError::SpawnFailed { program: p, reason } => {
                debug!(program = %p, %reason, "spawn failed");
                SystemError::MissingTool {
                    tool: program.to_string(),
                    remedy: format!("install '{program}' and re-run `dsr doctor`"),
                }
                .into()
            }
            RunnerError::Io(e) => e.into(),
        }
    }
}

/// Recursively collect staged files, sorted for stable ordering.
fn collect_artifacts(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, std::io::Error> {
    fn walk(dir: &Utf8Path, out: &mut Vec<Utf8PathBuf>) -> Result<(), std::io::Error> {
        for entry in std::fs::read_dir(dir.as_std_path())? {
            let entry = entry?;
            let path = Utf8PathBuf::from_path_buf(entry.path())
                .map_err(|p| std::io::Error::other(format!("non-UTF-8 path: {}", p.display())))?;
            if entry.file_type()?.is_dir() {
                walk(&path, out)?;
            } else {
                out.push(path);
            }
        }
        Ok(())
    }
    let mut out = Vec::new();
    walk(dir, &mut out)?;
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dsr_types::{ConnectionKind, Platform};
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;

    use crate::process::ProcessOutput;

    /// Mock runner that answers every command with a scripted result and
    /// records what was asked of it.
    struct ScriptedRunner {
        outputs: StdMutex<Vec<Result<ProcessOutput, RunnerError>>>,
        commands: StdMutex<Vec<String>>,
    }

    impl ScriptedRunner {
        fn new(outputs: Vec<Result<ProcessOutput, RunnerError>>) -> Self {
            Self {
                outputs: StdMutex::new(outputs),
                commands: StdMutex::new(Vec::new()),
            }
        }

        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProcessRunner for ScriptedRunner {
        async fn run(
            &self,
            cmd: &CommandSpec,
            _timeout: Duration,
        ) -> Result<ProcessOutput, RunnerError> {
            self.commands.lock().unwrap().push(cmd.display());
            let mut outputs = self.outputs.lock().unwrap();
            if outputs.is_empty() {
                Ok(ok_output())
            } else {
                outputs.remove(0)
            }
        }
    }

    fn ok_output() -> ProcessOutput {
        ProcessOutput {
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: Some(0),
            duration: Duration::from_millis(1),
        }
    }

    fn tool(source: &Utf8Path) -> ToolSpec {
        let yaml = format!(
            r#"
tool: cass
repo: someuser/cass
source_path: {source}
platforms: [linux/amd64, darwin/arm64]
asset_pattern: "${{name}}-${{version}}-${{target}}${{ext}}"
native_build_command: "make release"
"#
        );
        serde_yaml::from_str(&yaml).unwrap()
    }

    fn ctx(dir: &tempfile::TempDir) -> ExecutionContext {
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        ExecutionContext {
            tool: tool(&root.join("src")),
            version: "0.1.64".into(),
            revision: "abc1234".into(),
            staging_dir: root.join("staging"),
            build_timeout: Duration::from_secs(60),
        }
    }

    fn container_host() -> HostSpec {
        HostSpec {
            id: "local-linux".into(),
            platform: "linux/amd64".parse::<Platform>().unwrap(),
            kind: ConnectionKind::ContainerRunner,
            ssh_alias: None,
        }
    }

    fn ssh_host() -> HostSpec {
        HostSpec {
            id: "mac-mini".into(),
            platform: "darwin/arm64".parse::<Platform>().unwrap(),
            kind: ConnectionKind::Ssh,
            ssh_alias: Some("mac-mini.local".into()),
        }
    }

    #[tokio::test]
    async fn container_run_passes_uid_gid_and_matrix() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(&dir);
        std::fs::create_dir_all(ctx.tool.source_path.as_std_path()).unwrap();

        let runner = ScriptedRunner::new(vec![]);
        let executor = HostExecutor::new(runner);

        let mut matrix = BTreeMap::new();
        matrix.insert("arch".to_string(), "amd64".to_string());
        let target = BuildTarget {
            platform: "linux/amd64".parse().unwrap(),
            strategy: BuildStrategy::ContainerRunner {
                job: "build-linux".into(),
                matrix,
            },
            host: "local-linux".into(),
        };

        executor
            .execute(&container_host(), &target, &ctx)
            .await
            .unwrap();

        let commands = executor.runner.as_ref().commands();
        // [0] docker daemon probe, [1] act invocation
        let act = &commands[1];
        let (uid, gid) = invoking_user();
        assert!(act.starts_with("act --workflows"));
        assert!(act.contains("--job build-linux"));
        assert!(act.contains(&format!("--user {uid}:{gid}")));
        assert!(act.contains("--matrix arch:amd64"));
    }

    #[tokio::test]
    async fn unreachable_host_fails_before_any_build_command() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(&dir);

        let refused = ProcessOutput {
            stdout: Vec::new(),
            stderr: b"Connection refused".to_vec(),
            exit_code: Some(255),
            duration: Duration::from_millis(1),
        };
        let runner = ScriptedRunner::new(vec![Ok(refused)]);
        let executor = HostExecutor::new(runner);

        let target = BuildTarget {
            platform: "darwin/arm64".parse().unwrap(),
            strategy: BuildStrategy::NativeSsh { job: None },
            host: "mac-mini".into(),
        };
        let err = executor
            .execute(&ssh_host(), &target, &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "E004");
        // Only the probe ran.
        assert_eq!(executor.runner.as_ref().commands().len(), 1);
    }

    #[tokio::test]
    async fn ssh_build_clones_at_revision_then_fetches_dist() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(&dir);

        let runner = ScriptedRunner::new(vec![]);
        let executor = HostExecutor::new(runner);
        let target = BuildTarget {
            platform: "darwin/arm64".parse().unwrap(),
            strategy: BuildStrategy::NativeSsh {
                job: Some("build-macos".into()),
            },
            host: "mac-mini".into(),
        };

        let outcome = executor.execute(&ssh_host(), &target, &ctx).await.unwrap();
        assert_eq!(outcome.job.as_deref(), Some("build-macos"));

        let commands = executor.runner.as_ref().commands();
        // [0] probe, [1] remote build, [2] scp fetch
        assert!(commands[1].contains("git clone --quiet https://github.com/someuser/cass.git"));
        assert!(commands[1].contains("git checkout --quiet abc1234"));
        assert!(commands[1].contains("make release"));
        assert!(commands[2].starts_with("scp -r mac-mini.local:"));
    }

    #[tokio::test]
    async fn build_timeout_maps_to_target_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(&dir);
        std::fs::create_dir_all(ctx.tool.source_path.as_std_path()).unwrap();

        let runner = ScriptedRunner::new(vec![
            Ok(ok_output()),
            Err(RunnerError::Timeout { timeout_secs: 60 }),
        ]);
        let executor = HostExecutor::new(runner);
        let target = BuildTarget {
            platform: "linux/amd64".parse().unwrap(),
            strategy: BuildStrategy::ContainerRunner {
                job: "build".into(),
                matrix: BTreeMap::new(),
            },
            host: "local-linux".into(),
        };
        let err = executor
            .execute(&container_host(), &target, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, DsrError::TargetTimeout { .. }));
    }

    #[tokio::test]
    async fn cross_compile_sets_output_env() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(&dir);
        std::fs::create_dir_all(ctx.tool.source_path.as_std_path()).unwrap();

        let runner = ScriptedRunner::new(vec![]);
        let executor = HostExecutor::new(runner);
        let target = BuildTarget {
            platform: "linux/amd64".parse().unwrap(),
            strategy: BuildStrategy::CrossCompile {
                recipe: vec!["make".into(), "cross".into()],
            },
            host: "local".into(),
        };
        let local = HostSpec {
            id: "local".into(),
            platform: "linux/amd64".parse().unwrap(),
            kind: ConnectionKind::Local,
            ssh_alias: None,
        };
        executor.execute(&local, &target, &ctx).await.unwrap();
        let commands = executor.runner.as_ref().commands();
        assert_eq!(commands[0], "make cross");
    }

    #[tokio::test]
    async fn collects_staged_artifacts_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        std::fs::create_dir_all(root.join("nested").as_std_path()).unwrap();
        std::fs::write(root.join("b.bin").as_std_path(), b"b").unwrap();
        std::fs::write(root.join("nested/a.bin").as_std_path(), b"a").unwrap();

        let files = collect_artifacts(&root).unwrap();
        let names: Vec<_> = files.iter().map(|p| p.file_name().unwrap()).collect();
        assert_eq!(names, ["b.bin", "a.bin"]);
    }
}
