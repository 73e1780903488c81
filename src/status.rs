//! `status`: render recent runs from the manifest archive.

use dsr_types::{RunStatus, TargetStatus, envelope::EnvelopeBuilder};
use dsr_types::Manifest;
use dsr_utils::ExitCode;

use crate::cli::CommandOutput;
use crate::cli::commands::App;

/// Load, filter and render the newest manifests.
pub fn show(_app: &App, tool: Option<&str>, limit: usize) -> CommandOutput {
    let mut builder = EnvelopeBuilder::begin("status", tool.unwrap_or(""), "");
    let archive_dir = dsr_utils::paths::state_dir().join("manifests");

    let mut manifests: Vec<Manifest> = Vec::new();
    if let Ok(entries) = std::fs::read_dir(archive_dir.as_std_path()) {
        for entry in entries.filter_map(Result::ok) {
            let Ok(content) = std::fs::read_to_string(entry.path()) else {
                continue;
            };
            let Ok(manifest) = serde_json::from_str::<Manifest>(&content) else {
                continue;
            };
            if tool.is_none_or(|t| manifest.tool == t) {
                manifests.push(manifest);
            }
        }
    }
    manifests.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    manifests.truncate(limit);

    let mut stdout_lines = Vec::new();
    for manifest in &manifests {
        let ok = manifest
            .hosts
            .iter()
            .filter(|h| h.status == TargetStatus::Success)
            .count();
        stdout_lines.push(format!(
            "{} {} {} {}/{} hosts {} artifacts {}",
            manifest.tool,
            manifest.version,
            manifest.run_id,
            ok,
            manifest.hosts.len(),
            manifest.artifacts.len(),
            manifest.signing,
        ));
    }

    builder.insert_detail(
        "runs",
        serde_json::to_value(&manifests).unwrap_or_default(),
    );
    CommandOutput {
        envelope: builder.finish(RunStatus::Success, ExitCode::SUCCESS),
        stdout_lines,
    }
}
