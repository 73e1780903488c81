//! Watch loop: long-running monitor with jittered polling, strict per-run
//! dedupe, and exponential backoff on pipeline failure.
//!
//! Single-threaded and cooperative: iterations are strictly serialized, and
//! the triggered set is mutated only here. A hosted-CI run id fires a build
//! at most once; the id is marked as triggered *before* the pipeline runs,
//! so a crash mid-fire errs toward not re-triggering an expensive build.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::{error, info, warn};

use dsr_probe::ProbeReport;
use dsr_types::ToolSpec;
use dsr_utils::DsrError;

use crate::backoff::Backoff;
use crate::triggered::TriggeredSet;

/// Jitter proportion applied to every sleep.
const JITTER_P: f64 = 0.20;
/// Floor for any sleep.
const MIN_SLEEP: Duration = Duration::from_secs(10);

/// `base + U(−p·base, +p·base)`, clamped to at least 10 seconds.
#[must_use]
pub fn jittered_sleep(base: Duration, rng: &mut impl Rng) -> Duration {
    let base_secs = base.as_secs_f64();
    let offset = rng.gen_range(-JITTER_P..=JITTER_P) * base_secs;
    let slept = Duration::from_secs_f64((base_secs + offset).max(0.0));
    slept.max(MIN_SLEEP)
}

/// What the watch loop drives. The production implementation wraps the
/// pipeline; tests script it.
#[async_trait]
pub trait PipelineDriver: Send + Sync {
    /// Probe one repo at `now`.
    async fn probe(
        &self,
        tool: &ToolSpec,
        threshold_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<ProbeReport, DsrError>;

    /// Run the fallback pipeline for one overdue hosted-CI run.
    async fn fire(&self, tool: &ToolSpec, hosted_run_id: u64) -> Result<(), DsrError>;
}

/// Watch configuration.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Base polling interval.
    pub interval: Duration,
    /// Queue-age threshold handed to the probe.
    pub threshold_secs: u64,
}

/// What one iteration did, and how long to sleep before the next
/// (pre-jitter; the loop applies jitter on top).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationOutcome {
    pub fired: Vec<u64>,
    pub duplicates: usize,
    pub failures: usize,
    pub sleep_base: Duration,
}

/// The watch-mode state machine.
pub struct WatchLoop<D> {
    tools: Vec<ToolSpec>,
    cfg: WatchConfig,
    driver: D,
    triggered: TriggeredSet,
    backoff: Backoff,
}

impl<D: PipelineDriver> WatchLoop<D> {
    #[must_use]
    pub fn new(tools: Vec<ToolSpec>, cfg: WatchConfig, driver: D, triggered: TriggeredSet) -> Self {
        Self {
            tools,
            cfg,
            driver,
            triggered,
            backoff: Backoff::new(),
        }
    }

    #[must_use]
    pub fn triggered(&self) -> &TriggeredSet {
        &self.triggered
    }

    /// One iteration: GC, probe every repo, dedupe, fire new overdue runs.
    pub async fn run_once(&mut self, now: DateTime<Utc>) -> IterationOutcome {
        self.triggered.gc(now);

        let mut fired = Vec::new();
        let mut duplicates = 0;
        let mut failures = 0;

        for tool in &self.tools {
            let report = match self.driver.probe(tool, self.cfg.threshold_secs, now).await {
                Ok(report) => report,
                Err(err) => {
                    error!(tool = %tool.tool, code = err.code(), %err, "probe failed");
                    failures += 1;
                    continue;
                }
            };

            for run in report.overdue_runs() {
                if self.triggered.contains(run.id) {
                    duplicates += 1;
                    continue;
                }
                // Mark first: at-most-once wins over retry-on-crash.
                if let Err(err) = self.triggered.mark(run.id, now) {
                    warn!(run_id = run.id, %err, "could not persist triggered mark");
                }
                info!(tool = %tool.tool, run_id = run.id, "hosted run overdue, firing fallback");
                match self.driver.fire(tool, run.id).await {
                    Ok(()) => fired.push(run.id),
                    Err(err) => {
                        error!(tool = %tool.tool, run_id = run.id, code = err.code(), %err, "pipeline failed");
                        failures += 1;
                    }
                }
            }
        }

        if let Err(err) = self.triggered.touch(now) {
            warn!(%err, "could not persist last_check");
        }

        if failures > 0 {
            self.backoff.advance();
        } else if !fired.is_empty() {
            self.backoff.reset();
        }

        let sleep_base = if failures > 0 {
            self.backoff.delay().unwrap_or(self.cfg.interval)
        } else {
            self.cfg.interval
        };

        IterationOutcome {
            fired,
            duplicates,
            failures,
            sleep_base,
        }
    }

    /// Drive iterations until the process is terminated; never returns.
    pub async fn run(&mut self) {
        let mut rng = rand::thread_rng();
        loop {
            let outcome = self.run_once(Utc::now()).await;
            let sleep = jittered_sleep(outcome.sleep_base, &mut rng);
            info!(
                fired = outcome.fired.len(),
                duplicates = outcome.duplicates,
                failures = outcome.failures,
                sleep_secs = sleep.as_secs(),
                "iteration complete"
            );
            tokio::time::sleep(sleep).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use chrono::TimeZone;
    use dsr_probe::{QueuedRun, RepoHealth};
    use proptest::prelude::*;
    use std::sync::Mutex;

    fn frozen() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 30, 12, 0, 0).unwrap()
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

    fn report_with_overdue(ids: &[u64]) -> ProbeReport {
        ProbeReport {
            repo: "someuser/cass".into(),
            health: if ids.is_empty() {
                RepoHealth::Healthy
            } else {
                RepoHealth::Throttled
            },
            threshold_secs: 600,
            queued_runs: ids
                .iter()
                .map(|id| QueuedRun {
                    id: *id,
                    status: "queued".into(),
                    workflow: "release".into(),
                    created_at: frozen() - chrono::Duration::seconds(900),
                    age_secs: 900,
                })
                .collect(),
        }
    }

    /// Driver with a scripted probe per iteration and scripted fire results.
    struct ScriptedDriver {
        probes: Mutex<Vec<Result<ProbeReport, DsrError>>>,
        fire_results: Mutex<Vec<Result<(), DsrError>>>,
        fired: Mutex<Vec<u64>>,
    }

    impl ScriptedDriver {
        fn new(
            probes: Vec<Result<ProbeReport, DsrError>>,
            fire_results: Vec<Result<(), DsrError>>,
        ) -> Self {
            Self {
                probes: Mutex::new(probes),
                fire_results: Mutex::new(fire_results),
                fired: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PipelineDriver for ScriptedDriver {
        async fn probe(
            &self,
            _tool: &ToolSpec,
            _threshold_secs: u64,
            _now: DateTime<Utc>,
        ) -> Result<ProbeReport, DsrError> {
            self.probes.lock().unwrap().remove(0)
        }

        async fn fire(&self, _tool: &ToolSpec, hosted_run_id: u64) -> Result<(), DsrError> {
            self.fired.lock().unwrap().push(hosted_run_id);
            let mut results = self.fire_results.lock().unwrap();
            if results.is_empty() {
                Ok(())
            } else {
                results.remove(0)
            }
        }
    }

    fn watch_in(dir: &tempfile::TempDir, driver: ScriptedDriver) -> WatchLoop<ScriptedDriver> {
        let path = Utf8PathBuf::from_path_buf(dir.path().join("triggered.json")).unwrap();
        WatchLoop::new(
            vec![tool()],
            WatchConfig {
                interval: Duration::from_secs(300),
                threshold_secs: 600,
            },
            driver,
            TriggeredSet::load(path),
        )
    }

    #[tokio::test]
    async fn same_hosted_run_fires_at_most_once() {
        let dir = tempfile::tempdir().unwrap();
        let driver = ScriptedDriver::new(
            vec![
                Ok(report_with_overdue(&[12345])),
                Ok(report_with_overdue(&[12345])),
            ],
            vec![],
        );
        let mut watch = watch_in(&dir, driver);

        let first = watch.run_once(frozen()).await;
        assert_eq!(first.fired, vec![12345]);
        assert_eq!(first.duplicates, 0);

        let second = watch
            .run_once(frozen() + chrono::Duration::seconds(300))
            .await;
        assert!(second.fired.is_empty());
        assert_eq!(second.duplicates, 1);

        assert_eq!(watch.triggered().len(), 1);
        assert_eq!(watch.driver.fired.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn nothing_throttled_sleeps_base_interval() {
        let dir = tempfile::tempdir().unwrap();
        let driver = ScriptedDriver::new(vec![Ok(report_with_overdue(&[]))], vec![]);
        let mut watch = watch_in(&dir, driver);

        let outcome = watch.run_once(frozen()).await;
        assert!(outcome.fired.is_empty());
        assert_eq!(outcome.sleep_base, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn consecutive_failures_walk_the_backoff_ladder() {
        let dir = tempfile::tempdir().unwrap();
        let fail = || {
            Err(DsrError::Build(dsr_utils::BuildError::Compilation {
                platform: "linux/amd64".into(),
                reason: "boom".into(),
            }))
        };
        let driver = ScriptedDriver::new(
            vec![
                Ok(report_with_overdue(&[1])),
                Ok(report_with_overdue(&[2])),
                Ok(report_with_overdue(&[3])),
                Ok(report_with_overdue(&[4])),
            ],
            vec![fail(), fail(), fail()],
        );
        let mut watch = watch_in(&dir, driver);

        let mut now = frozen();
        let mut sleeps = Vec::new();
        for _ in 0..3 {
            let outcome = watch.run_once(now).await;
            sleeps.push(outcome.sleep_base.as_secs());
            now += chrono::Duration::seconds(60);
        }
        assert_eq!(sleeps, vec![60, 120, 240]);

        // A success resets the next sleep to the base interval.
        let outcome = watch.run_once(now).await;
        assert_eq!(outcome.failures, 0);
        assert_eq!(outcome.sleep_base, Duration::from_secs(300));
        assert_eq!(watch.backoff.delay(), None);
    }

    #[tokio::test]
    async fn probe_failure_advances_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let driver = ScriptedDriver::new(
            vec![Err(DsrError::Network(dsr_utils::NetworkError::Timeout {
                operation: "gh run list".into(),
                timeout_secs: 30,
            }))],
            vec![],
        );
        let mut watch = watch_in(&dir, driver);
        let outcome = watch.run_once(frozen()).await;
        assert_eq!(outcome.failures, 1);
        assert_eq!(outcome.sleep_base, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn triggered_entries_age_out_after_24_hours() {
        let dir = tempfile::tempdir().unwrap();
        let driver = ScriptedDriver::new(
            vec![
                Ok(report_with_overdue(&[12345])),
                Ok(report_with_overdue(&[])),
            ],
            vec![],
        );
        let mut watch = watch_in(&dir, driver);

        watch.run_once(frozen()).await;
        assert_eq!(watch.triggered().len(), 1);

        // 25 hours later the entry is gone and the run could fire again.
        watch
            .run_once(frozen() + chrono::Duration::hours(25))
            .await;
        assert_eq!(watch.triggered().len(), 0);
    }

    proptest! {
        #[test]
        fn jitter_stays_within_bounds(base_secs in 1u64..86_400) {
            let base = Duration::from_secs(base_secs);
            let mut rng = rand::thread_rng();
            let slept = jittered_sleep(base, &mut rng);

            let lower = (base_secs as f64 * 0.8).max(10.0);
            let upper = (base_secs as f64 * 1.2).max(10.0);
            prop_assert!(slept.as_secs_f64() >= lower - 1e-6);
            prop_assert!(slept.as_secs_f64() <= upper + 1e-6);
        }
    }
}
