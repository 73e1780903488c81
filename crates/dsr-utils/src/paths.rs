//! State, cache and config directory resolution.
//!
//! Resolution order is override flag (handled by the CLI), `DSR_*`
//! environment variable, then the platform default. Tests use a thread-local
//! override to avoid process-global environment races.

use camino::Utf8PathBuf;
use std::cell::RefCell;
use std::fs;
use std::io;

thread_local! {
    static THREAD_STATE_DIR: RefCell<Option<Utf8PathBuf>> = const { RefCell::new(None) };
}

/// Root of the persisted state: per-run artifact trees, run logs, the watch
/// triggered-set, and the manifest archive.
#[must_use]
pub fn state_dir() -> Utf8PathBuf {
    if let Some(tl) = THREAD_STATE_DIR.with(|tl| tl.borrow().clone()) {
        return tl;
    }
    if let Ok(p) = std::env::var("DSR_STATE_DIR") {
        return Utf8PathBuf::from(p);
    }
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .and_then(|p| Utf8PathBuf::from_path_buf(p).ok())
        .map_or_else(|| Utf8PathBuf::from(".dsr/state"), |p| p.join("dsr"))
}

/// Root of the cache: builder working trees and the workflow emulator's
/// image/layer cache.
#[must_use]
pub fn cache_dir() -> Utf8PathBuf {
    if let Ok(p) = std::env::var("DSR_CACHE_DIR") {
        return Utf8PathBuf::from(p);
    }
    dirs::cache_dir()
        .and_then(|p| Utf8PathBuf::from_path_buf(p).ok())
        .map_or_else(|| Utf8PathBuf::from(".dsr/cache"), |p| p.join("dsr"))
}

/// Directory holding `config.yaml`, `hosts.yaml` and `repos.d/`.
#[must_use]
pub fn config_dir() -> Utf8PathBuf {
    if let Ok(p) = std::env::var("DSR_CONFIG_DIR") {
        return Utf8PathBuf::from(p);
    }
    dirs::config_dir()
        .and_then(|p| Utf8PathBuf::from_path_buf(p).ok())
        .map_or_else(|| Utf8PathBuf::from(".dsr"), |p| p.join("dsr"))
}

/// Artifact staging tree for one run, partitioned so no two runs share a
/// subtree.
#[must_use]
pub fn staging_dir(tool: &str, version: &str, run_id: &str) -> Utf8PathBuf {
    state_dir()
        .join("runs")
        .join(tool)
        .join(version)
        .join(run_id)
}

/// Path of the watch triggered-set file.
#[must_use]
pub fn triggered_set_path() -> Utf8PathBuf {
    state_dir().join("watch").join("triggered.json")
}

/// Ensure a directory exists.
pub fn ensure_dir_all(path: &Utf8PathBuf) -> Result<(), io::Error> {
    if !path.as_std_path().exists() {
        fs::create_dir_all(path.as_std_path())?;
    }
    Ok(())
}

/// Write a file atomically via a temporary sibling and rename.
///
/// Readers observe either the old or the new content, never a torn write.
pub fn atomic_write(path: &Utf8PathBuf, content: &str) -> Result<(), io::Error> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no parent directory"))?;
    fs::create_dir_all(parent)?;

    let temp_path = parent.join(format!(".{}.tmp", path.file_name().unwrap_or("file")));
    fs::write(&temp_path, content)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Thread-local state-dir override for tests.
pub fn set_thread_state_dir_for_tests(path: Utf8PathBuf) {
    THREAD_STATE_DIR.with(|tl| *tl.borrow_mut() = Some(path));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn isolated_state() -> tempfile::TempDir {
        let td = tempfile::TempDir::new().expect("tempdir");
        let p = Utf8PathBuf::from_path_buf(td.path().to_path_buf()).unwrap();
        set_thread_state_dir_for_tests(p);
        td
    }

    #[test]
    fn staging_dir_partitions_by_tool_version_run() {
        let _td = isolated_state();
        let a = staging_dir("cass", "0.1.64", "run-a");
        let b = staging_dir("cass", "0.1.64", "run-b");
        assert_ne!(a, b);
        assert!(a.as_str().ends_with("runs/cass/0.1.64/run-a"));
    }

    #[test]
    fn atomic_write_replaces_content() {
        let td = isolated_state();
        let path = Utf8PathBuf::from_path_buf(td.path().join("nested/file.json")).unwrap();

        atomic_write(&path, "first").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "first");

        atomic_write(&path, "second").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
    }

    #[test]
    fn atomic_write_leaves_no_temp_file() {
        let td = isolated_state();
        let path = Utf8PathBuf::from_path_buf(td.path().join("out.json")).unwrap();
        atomic_write(&path, "{}").unwrap();

        let leftovers: Vec<_> = fs::read_dir(td.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn triggered_set_lives_under_watch() {
        let _td = isolated_state();
        assert!(triggered_set_path().as_str().ends_with("watch/triggered.json"));
    }
}
