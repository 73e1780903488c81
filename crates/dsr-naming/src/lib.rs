//! Asset naming resolver.
//!
//! Given a tool descriptor, a version and a target platform, produces the
//! versioned asset name, the compat asset name, the archive extension and
//! the target-triple expansions.
//!
//! Substitution variables: `name`, `version` (leading `v` stripped), `os`,
//! `arch` (post-alias), `target` (`os-arch` after alias), `target_triple`,
//! `ext` (archive extension with leading dot, or empty for raw binaries).
//!
//! Compat precedence is strict: an explicit `install_script_compat` pattern
//! wins over a pattern parsed from the install script, which wins over the
//! heuristic (version token stripped from the versioned pattern). A present
//! but malformed explicit source is a configuration error, never a silent
//! fall-through to the heuristic.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

use dsr_types::{Platform, ToolSpec};
use dsr_utils::{ConfigError, DsrError};

/// Naming failures. All map to the configuration error class.
#[derive(Debug, thiserror::Error)]
pub enum NamingError {
    #[error("undefined variable '${{{var}}}' in pattern '{pattern}'")]
    UndefinedVariable { var: String, pattern: String },

    #[error("conflicting arch aliases: '{from}' -> '{to}' but '{to}' is itself aliased")]
    ConflictingAlias { from: String, to: String },

    #[error("install script '{path}' does not yield a compat pattern")]
    MalformedInstallScript { path: String },

    #[error("cannot read install script '{path}': {reason}")]
    UnreadableInstallScript { path: String, reason: String },
}

impl From<NamingError> for DsrError {
    fn from(err: NamingError) -> Self {
        DsrError::Config(ConfigError::Invalid {
            key: "naming".to_string(),
            reason: err.to_string(),
        })
    }
}

/// Fully resolved names for one `(tool, version, platform)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedNames {
    /// Versioned asset name, e.g. `cass-0.1.64-darwin_arm64.tar.gz`.
    pub versioned: String,
    /// Compat alias for install-script consumption.
    pub compat: String,
    /// True when the compat alias is a raw-binary copy of the extracted
    /// binary rather than a second name for the archive.
    pub compat_is_raw: bool,
    /// Archive extension without the leading dot; `None` for raw binaries.
    pub archive_ext: Option<String>,
    /// Target-triple expansions. Default is one entry: the configured
    /// triple, or `os-arch` when none is configured.
    pub target_triples: Vec<String>,
}

fn var_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([a-z_]+)\}").expect("static regex"))
}

/// Strip a leading `v` from a version string: `v0.1.64` → `0.1.64`.
#[must_use]
pub fn strip_version_prefix(version: &str) -> &str {
    version.strip_prefix('v').unwrap_or(version)
}

/// Substitute `${var}` tokens from the map. Unknown variables are errors.
fn substitute(pattern: &str, vars: &BTreeMap<&str, String>) -> Result<String, NamingError> {
    let mut out = String::with_capacity(pattern.len());
    let mut last = 0;
    for caps in var_regex().captures_iter(pattern) {
        let whole = caps.get(0).expect("capture 0");
        let var = &caps[1];
        out.push_str(&pattern[last..whole.start()]);
        match vars.get(var) {
            Some(value) => out.push_str(value),
            None => {
                return Err(NamingError::UndefinedVariable {
                    var: var.to_string(),
                    pattern: pattern.to_string(),
                });
            }
        }
        last = whole.end();
    }
    out.push_str(&pattern[last..]);
    Ok(out)
}

/// Apply the tool's arch aliases. An alias whose target is itself aliased to
/// something different is a configuration error.
fn apply_alias<'a>(spec: &'a ToolSpec, arch: &'a str) -> Result<&'a str, NamingError> {
    match spec.arch_aliases.get(arch) {
        None => Ok(arch),
        Some(target) => match spec.arch_aliases.get(target) {
            Some(next) if next != target => Err(NamingError::ConflictingAlias {
                from: arch.to_string(),
                to: target.to_string(),
            }),
            _ => Ok(target),
        },
    }
}

fn known_archive_suffix(name: &str) -> bool {
    ["tar.gz", "tar.xz", "tar.bz2", "tgz", "zip"]
        .iter()
        .any(|ext| name.ends_with(&format!(".{ext}")))
}

/// Where a compat pattern came from. Parsed and heuristic sources with no
/// extension denote a raw-binary alias; an explicit configured pattern
/// without one inherits the platform archive extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompatSource {
    Explicit,
    ParsedScript,
    Heuristic,
}

/// Resolve the compat pattern text per the strict precedence.
fn compat_pattern(spec: &ToolSpec) -> Result<(String, CompatSource), NamingError> {
    if let Some(pattern) = &spec.install_script_compat {
        return Ok((pattern.clone(), CompatSource::Explicit));
    }
    if let Some(path) = &spec.install_script_path {
        let content = std::fs::read_to_string(path.as_std_path()).map_err(|e| {
            NamingError::UnreadableInstallScript {
                path: path.to_string(),
                reason: e.to_string(),
            }
        })?;
        let pattern = parse_install_script(&spec.tool, &content).ok_or_else(|| {
            NamingError::MalformedInstallScript {
                path: path.to_string(),
            }
        })?;
        return Ok((pattern, CompatSource::ParsedScript));
    }
    Ok((strip_version_token(&spec.asset_pattern), CompatSource::Heuristic))
}

/// Extract the asset pattern an install script downloads.
///
/// Looks for the first shell word that starts with the tool name and embeds
/// `$OS`/`$ARCH`-style expansions, then normalizes those to `${os}`/`${arch}`
/// tokens. Returns `None` when the script names no such asset.
#[must_use]
pub fn parse_install_script(tool: &str, script: &str) -> Option<String> {
    let word_re = Regex::new(&format!(
        r#"{}[A-Za-z0-9_.\-]*(?:\$\{{?[A-Za-z_]+\}}?[A-Za-z0-9_.\-]*)+"#,
        regex::escape(tool)
    ))
    .ok()?;

    for line in script.lines() {
        let line = line.trim();
        if line.starts_with('#') {
            continue;
        }
        if let Some(m) = word_re.find(line) {
            let mut pattern = m.as_str().to_string();
            for (shell, var) in [
                ("${VERSION}", "${version}"),
                ("$VERSION", "${version}"),
                ("${OS}", "${os}"),
                ("$OS", "${os}"),
                ("${ARCH}", "${arch}"),
                ("$ARCH", "${arch}"),
                ("${TARGET}", "${target}"),
                ("$TARGET", "${target}"),
            ] {
                pattern = pattern.replace(shell, var);
            }
            // A word still holding unknown shell expansions is not a usable
            // pattern.
            if pattern.contains('$')
                && var_regex().replace_all(&pattern, "").contains('$')
            {
                continue;
            }
            return Some(pattern);
        }
    }
    None
}

/// Heuristic compat pattern: strip the version token (and one adjacent
/// separator) from the versioned pattern.
#[must_use]
pub fn strip_version_token(pattern: &str) -> String {
    for token in ["-v${version}", "_v${version}", "-${version}", "_${version}", "v${version}", "${version}"] {
        if pattern.contains(token) {
            return pattern.replacen(token, "", 1);
        }
    }
    pattern.to_string()
}

/// Resolve all names for one `(tool, version, platform)`.
pub fn resolve(
    spec: &ToolSpec,
    version: &str,
    platform: &Platform,
) -> Result<ResolvedNames, NamingError> {
    let version = strip_version_prefix(version);
    let arch = apply_alias(spec, &platform.arch)?;
    let os = platform.os.as_str();
    let target = format!("{os}-{arch}");
    let target_triple = spec
        .target_triples
        .get(&platform.to_string())
        .cloned()
        .unwrap_or_else(|| target.clone());

    let archive_ext = spec.archive_format_for(platform);
    let ext_var = archive_ext
        .as_ref()
        .map_or_else(String::new, |ext| format!(".{ext}"));

    let mut vars: BTreeMap<&str, String> = BTreeMap::new();
    vars.insert("name", spec.tool.clone());
    vars.insert("version", version.to_string());
    vars.insert("os", os.to_string());
    vars.insert("arch", arch.to_string());
    vars.insert("target", target.clone());
    vars.insert("target_triple", target_triple.clone());
    vars.insert("ext", ext_var.clone());

    let mut versioned = substitute(&spec.asset_pattern, &vars)?;
    if !spec.asset_pattern.contains("${ext}")
        && !known_archive_suffix(&versioned)
        && !ext_var.is_empty()
    {
        versioned.push_str(&ext_var);
    }

    let (pattern, source) = compat_pattern(spec)?;
    let mut compat = substitute(&pattern, &vars)?;
    let compat_has_ext = pattern.contains("${ext}") || known_archive_suffix(&compat);
    let compat_is_raw = match source {
        // An explicit pattern without an extension inherits the platform
        // archive extension; the alias names the same archive bytes.
        CompatSource::Explicit => false,
        // A script-derived or heuristic pattern without an extension means
        // the installer fetches the raw binary.
        CompatSource::ParsedScript | CompatSource::Heuristic => !compat_has_ext,
    };
    if !compat_has_ext && !compat_is_raw && !ext_var.is_empty() {
        compat.push_str(&ext_var);
    }
    if compat_is_raw && platform.os == dsr_types::Os::Windows && !compat.ends_with(".exe") {
        compat.push_str(".exe");
    }

    Ok(ResolvedNames {
        versioned,
        compat,
        compat_is_raw,
        archive_ext,
        target_triples: vec![target_triple],
    })
}
