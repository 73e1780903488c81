//! The watch triggered-set: persisted dedupe state keyed by hosted-CI run
//! id.
//!
//! Only the watch loop touches this file, and iterations are serialized, so
//! a single-writer model with atomic replacement is enough. A corrupted
//! file is treated as empty (fail-open toward "not triggered") and is
//! overwritten on the next successful mark; the parse failure is logged at
//! WARN rather than swallowed.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use dsr_utils::paths::atomic_write;

/// Entries older than this are garbage-collected.
const RETENTION_HOURS: i64 = 24;

#[derive(Debug, Default, Serialize, Deserialize)]
struct TriggeredFile {
    #[serde(default)]
    last_check: Option<DateTime<Utc>>,
    #[serde(default)]
    triggered: BTreeMap<String, DateTime<Utc>>,
}

/// Persistent mapping from hosted-CI run id to the instant dsr last fired
/// for it.
#[derive(Debug)]
pub struct TriggeredSet {
    path: Utf8PathBuf,
    state: TriggeredFile,
}

impl TriggeredSet {
    /// Load the set, treating a missing or corrupted file as empty.
    #[must_use]
    pub fn load(path: Utf8PathBuf) -> Self {
        let state = match std::fs::read_to_string(path.as_std_path()) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(state) => state,
                Err(e) => {
                    warn!(path = %path, error = %e, "triggered-set file corrupted, starting empty");
                    TriggeredFile::default()
                }
            },
            Err(_) => TriggeredFile::default(),
        };
        Self { path, state }
    }

    /// Whether a hosted-CI run id has already fired a build.
    #[must_use]
    pub fn contains(&self, run_id: u64) -> bool {
        self.state.triggered.contains_key(&run_id.to_string())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.triggered.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.triggered.is_empty()
    }

    /// Mark a run id as triggered at `now` and persist.
    pub fn mark(&mut self, run_id: u64, now: DateTime<Utc>) -> Result<(), std::io::Error> {
        self.state.triggered.insert(run_id.to_string(), now);
        self.state.last_check = Some(now);
        self.persist()
    }

    /// Record an iteration without a trigger.
    pub fn touch(&mut self, now: DateTime<Utc>) -> Result<(), std::io::Error> {
        self.state.last_check = Some(now);
        self.persist()
    }

    /// Drop entries strictly older than 24 hours before `now`; an entry at
    /// exactly 24 hours survives. Returns the number removed.
    pub fn gc(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::hours(RETENTION_HOURS);
        let before = self.state.triggered.len();
        self.state.triggered.retain(|_, at| *at >= cutoff);
        let removed = before - self.state.triggered.len();
        if removed > 0 {
            debug!(removed, "triggered-set entries garbage-collected");
        }
        removed
    }

    /// Write the state out via atomic replacement.
    pub fn persist(&self) -> Result<(), std::io::Error> {
        let json = serde_json::to_string_pretty(&self.state)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        atomic_write(&self.path, &json)
    }
}
