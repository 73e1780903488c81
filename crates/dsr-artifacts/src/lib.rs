//! Artifact post-processor.
//!
//! Takes raw executor outputs and produces the release set: versioned
//! names, archives, SHA-256 digests, the checksums file, compat aliases,
//! sidecar signatures, and the bill-of-materials. Archiving, signing and
//! SBOM generation run out of process (`tar`/`zip`, `minisign`, `syft`);
//! digests are computed in process.
//!
//! Invariants on completion: every artifact file has a checksum line; every
//! signed artifact has a signature file; versioned and compat variants of
//! the same bytes share a digest. A compat pattern with no extension aliases
//! the extracted binary, not the archive, and is recorded as its own
//! artifact entry.

mod checksum;

pub use checksum::sha256_file;

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info};

use dsr_naming::resolve;
use dsr_runner::{CommandSpec, ProcessRunner};
use dsr_types::{Artifact, Platform, ToolSpec};
use dsr_utils::{ConfigError, DsrError, ReleaseError, SystemError};

/// Ceiling for one external archiving/signing/SBOM invocation.
const TOOL_TIMEOUT: Duration = Duration::from_secs(300);

/// Post-processing options from `config.yaml`.
#[derive(Debug, Clone)]
pub struct PostProcessOptions {
    /// Sign artifacts and the checksums file with minisign.
    pub sign: bool,
    /// Secret key path handed to the signer.
    pub minisign_key: Option<Utf8PathBuf>,
    /// Generate a bill-of-materials for the source tree.
    pub sbom: bool,
    /// SBOM output format passed to the scanner.
    pub sbom_format: String,
}

impl Default for PostProcessOptions {
    fn default() -> Self {
        Self {
            sign: true,
            minisign_key: None,
            sbom: true,
            sbom_format: "spdx-json".to_string(),
        }
    }
}

/// Everything post-processing produced for one build.
#[derive(Debug, Clone)]
pub struct PostProcessed {
    /// Final artifacts, frozen. Includes raw compat copies as their own
    /// entries.
    pub artifacts: Vec<Artifact>,
    pub checksums_file: Utf8PathBuf,
    /// Signature over the checksums file, when signing ran.
    pub checksums_signature: Option<Utf8PathBuf>,
    pub sbom_file: Option<Utf8PathBuf>,
    /// `"signed"` or `"skipped"`, recorded in the manifest.
    pub signing: String,
}

fn known_archive_suffix(name: &str) -> Option<&'static str> {
    for ext in ["tar.gz", "tar.xz", "tar.bz2", "tgz", "zip"] {
        if name.ends_with(&format!(".{ext}")) {
            return Some(ext);
        }
    }
    None
}

/// Post-process the raw outputs of all successful targets.
///
/// `raw` holds, per platform in declared order, the files the executor
/// staged for that platform.
pub async fn post_process(
    runner: &dyn ProcessRunner,
    tool: &ToolSpec,
    version: &str,
    raw: &[(Platform, Vec<Utf8PathBuf>)],
    staging_dir: &Utf8Path,
    opts: &PostProcessOptions,
) -> Result<PostProcessed, DsrError> {
    let mut artifacts = Vec::new();

    for (platform, files) in raw {
        let names = resolve(tool, version, platform)?;
        let source = pick_primary(tool, files).ok_or_else(|| {
            DsrError::Build(dsr_utils::BuildError::Compilation {
                platform: platform.to_string(),
                reason: "target produced no artifact file".to_string(),
            })
        })?;

        let final_path = staging_dir.join(&names.versioned);
        let mut raw_binary: Option<Utf8PathBuf> = None;

        match (known_archive_suffix(source.as_str()), &names.archive_ext) {
            // Executor emitted an archive: the extension must match the
            // expected format; the bytes are left intact.
            (Some(actual), Some(expected)) => {
                if actual != expected {
                    return Err(ConfigError::Invalid {
                        key: "archive_format".to_string(),
                        reason: format!(
                            "{platform}: executor produced .{actual} but .{expected} is configured"
                        ),
                    }
                    .into());
                }
                std::fs::rename(source.as_std_path(), final_path.as_std_path())?;
            }
            (Some(actual), None) => {
                return Err(ConfigError::Invalid {
                    key: "archive_format".to_string(),
                    reason: format!(
                        "{platform}: executor produced .{actual} but a raw binary is configured"
                    ),
                }
                .into());
            }
            // Raw binary with an archive format: archive it under the
            // tool's binary name.
            (None, Some(ext)) => {
                let binary_name = format!("{}{}", tool.tool, platform.os.exe_suffix());
                let binary_path = staging_dir.join(&binary_name);
                if source != &binary_path {
                    std::fs::copy(source.as_std_path(), binary_path.as_std_path())?;
                }
                archive(runner, &binary_path, &final_path, ext).await?;
                raw_binary = Some(binary_path);
            }
            // Raw binary, raw contract: just the versioned rename.
            (None, None) => {
                std::fs::rename(source.as_std_path(), final_path.as_std_path())?;
                raw_binary = Some(final_path.clone());
            }
        }

        let digest = sha256_file(&final_path)?;
        let size = std::fs::metadata(final_path.as_std_path())?.len();

        if names.compat_is_raw {
            // The alias is a byte-identical copy of the extracted binary.
            let binary = raw_binary.as_ref().ok_or_else(|| {
                DsrError::Config(ConfigError::Invalid {
                    key: "install_script_compat".to_string(),
                    reason: format!(
                        "{platform}: raw compat alias requires the extracted binary"
                    ),
                })
            })?;
            let compat_path = staging_dir.join(&names.compat);
            if binary != &compat_path {
                std::fs::copy(binary.as_std_path(), compat_path.as_std_path())?;
            }
            let compat_digest = sha256_file(&compat_path)?;
            let compat_size = std::fs::metadata(compat_path.as_std_path())?.len();

            artifacts.push(Artifact {
                name: names.versioned.clone(),
                compat_alias: None,
                path: final_path,
                platform: platform.clone(),
                archive_format: names.archive_ext.clone(),
                size,
                sha256: digest,
                signature: None,
            });
            artifacts.push(Artifact {
                name: names.compat.clone(),
                compat_alias: None,
                path: compat_path,
                platform: platform.clone(),
                archive_format: None,
                size: compat_size,
                sha256: compat_digest,
                signature: None,
            });
        } else {
            // Same bytes under a second name.
            let compat_path = staging_dir.join(&names.compat);
            std::fs::copy(final_path.as_std_path(), compat_path.as_std_path())?;
            artifacts.push(Artifact {
                name: names.versioned.clone(),
                compat_alias: Some(names.compat.clone()),
                path: final_path,
                platform: platform.clone(),
                archive_format: names.archive_ext.clone(),
                size,
                sha256: digest,
                signature: None,
            });
        }
    }

    // Checksums file: digest-then-filename, one line per artifact,
    // including compat aliases pointing at the same bytes.
    let checksums_name = format!(
        "{}-{}-checksums.sha256",
        tool.tool,
        dsr_naming::strip_version_prefix(version)
    );
    let checksums_file = staging_dir.join(&checksums_name);
    let mut lines = String::new();
    for artifact in &artifacts {
        lines.push_str(&format!("{}  {}\n", artifact.sha256, artifact.name));
        if let Some(alias) = &artifact.compat_alias {
            lines.push_str(&format!("{}  {}\n", artifact.sha256, alias));
        }
    }
    std::fs::write(checksums_file.as_std_path(), &lines)?;
    info!(artifacts = artifacts.len(), "checksums written");

    // Signatures.
    let mut checksums_signature = None;
    let signing = if opts.sign {
        for artifact in &mut artifacts {
            artifact.signature = Some(sign(runner, &artifact.path, opts).await?);
        }
        checksums_signature = Some(sign(runner, &checksums_file, opts).await?);
        "signed".to_string()
    } else {
        debug!("signing disabled by configuration");
        "skipped".to_string()
    };

    // Bill-of-materials.
    let sbom_file = if opts.sbom {
        Some(generate_sbom(runner, tool, version, staging_dir, &opts.sbom_format).await?)
    } else {
        None
    };

    Ok(PostProcessed {
        artifacts,
        checksums_file,
        checksums_signature,
        sbom_file,
        signing,
    })
}

/// Pick the primary output among the files a target staged: a single file,
/// or the one named after the tool.
fn pick_primary<'a>(tool: &ToolSpec, files: &'a [Utf8PathBuf]) -> Option<&'a Utf8PathBuf> {
    match files {
        [] => None,
        [single] => Some(single),
        many => many
            .iter()
            .find(|f| {
                f.file_name()
                    .is_some_and(|name| name.starts_with(tool.tool.as_str()))
            })
            .or(many.first()),
    }
}

async fn archive(
    runner: &dyn ProcessRunner,
    binary: &Utf8Path,
    out: &Utf8Path,
    ext: &str,
) -> Result<(), DsrError> {
    let dir = binary.parent().expect("staged binary has a parent");
    let name = binary.file_name().expect("staged binary has a name");
    let cmd = match ext {
        "zip" => CommandSpec::new("zip")
            .arg("-j")
            .arg("-q")
            .arg(out.as_str())
            .arg(binary.as_str()),
        // tar handles gz/xz/bz2 via -a from the output name.
        _ => CommandSpec::new("tar")
            .arg("-caf")
            .arg(out.as_str())
            .args(["-C", dir.as_str()])
            .arg(name),
    };
    let output = run_tool(runner, &cmd).await?;
    if !output.success() {
        return Err(ReleaseError::Upload {
            asset: out.to_string(),
            reason: format!("archiving failed: {}", output.stderr_tail(3)),
        }
        .into());
    }
    Ok(())
}

async fn sign(
    runner: &dyn ProcessRunner,
    path: &Utf8Path,
    opts: &PostProcessOptions,
) -> Result<Utf8PathBuf, DsrError> {
    let sig_path = Utf8PathBuf::from(format!("{path}.minisig"));
    let mut cmd = CommandSpec::new("minisign").arg("-S");
    if let Some(key) = &opts.minisign_key {
        cmd = cmd.args(["-s", key.as_str()]);
    }
    cmd = cmd
        .args(["-m", path.as_str()])
        .args(["-x", sig_path.as_str()]);

    let output = run_tool(runner, &cmd).await?;
    if !output.success() {
        return Err(ReleaseError::Signing {
            path: path.to_string(),
            reason: output.stderr_tail(2),
        }
        .into());
    }
    Ok(sig_path)
}

async fn generate_sbom(
    runner: &dyn ProcessRunner,
    tool: &ToolSpec,
    version: &str,
    staging_dir: &Utf8Path,
    format: &str,
) -> Result<Utf8PathBuf, DsrError> {
    let sbom_name = format!(
        "{}-{}-sbom.{}.json",
        tool.tool,
        dsr_naming::strip_version_prefix(version),
        format.trim_end_matches("-json")
    );
    let sbom_path = staging_dir.join(&sbom_name);
    let cmd = CommandSpec::new("syft")
        .arg(format!("dir:{}", tool.source_path))
        .args(["-o", &format!("{format}={sbom_path}")])
        .arg("--quiet");

    let output = run_tool(runner, &cmd).await?;
    if !output.success() {
        return Err(SystemError::MissingTool {
            tool: "syft".to_string(),
            remedy: format!("SBOM generation failed: {}", output.stderr_tail(2)),
        }
        .into());
    }
    Ok(sbom_path)
}

async fn run_tool(
    runner: &dyn ProcessRunner,
    cmd: &CommandSpec,
) -> Result<dsr_runner::ProcessOutput, DsrError> {
    runner.run(cmd, TOOL_TIMEOUT).await.map_err(|e| match e {
        dsr_runner::RunnerError::SpawnFailed { program, reason } => SystemError::MissingTool {
            tool: program,
            remedy: reason,
        }
        .into(),
        dsr_runner::RunnerError::Timeout { timeout_secs } => {
            DsrError::Network(dsr_utils::NetworkError::Timeout {
                operation: cmd.display(),
                timeout_secs,
            })
        }
        dsr_runner::RunnerError::Io(e) => e.into(),
    })
}
