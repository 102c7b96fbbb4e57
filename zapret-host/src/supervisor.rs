//! Supervised runs of "test zapret.ps1"
//!
//! A run races three signals:
//! - the report watcher finding a parseable test_results_*.txt
//! - the harness process exiting
//! - the 12 minute deadline
//!
//! The harness often blocks on a final ReadKey after writing its report, so a
//! parsed report ends the run and the harness tree is killed.

use crate::catalog::{HARNESS_SCRIPT, REPORT_DIR};
use crate::config::ConfigStore;
use crate::error::{HostError, Result};
use crate::execution::{apply_console_flags, kill_process_tree};
use crate::report::{latest_report_file, parse_latest_report, ParsedReport};
use crate::settings::{ScriptHost, Settings};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command as AsyncCommand};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const TEST_DEADLINE: Duration = Duration::from_secs(12 * 60);
const POLL_INTERVAL: Duration = Duration::from_secs(1);
const EXIT_GRACE: Duration = Duration::from_millis(500);
const REAP_TIMEOUT: Duration = Duration::from_secs(5);
/// Canned answers: standard tests, all configurations
const HARNESS_INPUT: &[u8] = b"1\n1\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Launching,
    Running,
    Resolved,
    TimedOut,
    LaunchFailed,
}

/// Result of one supervised run. `error` is set whenever no report was parsed.
#[derive(Debug)]
pub struct TestOutcome {
    pub phase: RunPhase,
    pub report: Option<ParsedReport>,
    pub error: Option<HostError>,
    pub log_path: PathBuf,
    pub harness_pid: Option<u32>,
}

pub struct TestSupervisor {
    deadline: Duration,
    poll_interval: Duration,
    exit_grace: Duration,
    hidden: bool,
    script_host: ScriptHost,
}

impl TestSupervisor {
    pub fn new(settings: &Settings) -> Self {
        Self {
            deadline: TEST_DEADLINE,
            poll_interval: POLL_INTERVAL,
            exit_grace: EXIT_GRACE,
            hidden: settings.hide_processes,
            script_host: settings.script_host,
        }
    }

    pub fn with_timing(mut self, deadline: Duration, poll_interval: Duration, exit_grace: Duration) -> Self {
        self.deadline = deadline;
        self.poll_interval = poll_interval;
        self.exit_grace = exit_grace;
        self
    }

    /// Run the harness once and reconcile the persisted results.
    /// `Err` only for unmet preconditions; everything later lands in `TestOutcome`.
    pub async fn run(&self, store: &ConfigStore) -> Result<TestOutcome> {
        let current = store
            .current_release_path()?
            .ok_or_else(|| HostError::NotFound("no current release".to_string()))?;
        let script = current.join(HARNESS_SCRIPT);
        if !tokio::fs::try_exists(&script).await.unwrap_or(false) {
            return Err(HostError::NotFound(format!("test script {}", script.display())));
        }

        // stale reports must never be mistaken for this run's output
        let report_dir = current.join(REPORT_DIR);
        match tokio::fs::remove_dir_all(&report_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(&report_dir).await?;

        store.update(|cfg| {
            cfg.test_results.clear();
            cfg.best_strategy.clear();
            cfg.test_in_progress = true;
            cfg.last_test_at = Some(Utc::now());
        })?;

        let log_path = store
            .logs_dir()
            .join(format!("test_{}.log", Utc::now().timestamp()));
        let mut phase = RunPhase::Launching;
        info!(phase = ?phase, script = %script.display(), log = %log_path.display(), "starting test run");

        let cancel = CancellationToken::new();
        let watcher = tokio::spawn(watch_reports(
            report_dir.clone(),
            self.poll_interval,
            cancel.child_token(),
        ));

        let mut child = match self.spawn_harness(&script, &current, &log_path) {
            Ok(child) => child,
            Err(e) => {
                warn!("test harness failed to start: {}", e);
                cancel.cancel();
                watcher.abort();
                self.reconcile(store, None, &log_path)?;
                return Ok(TestOutcome {
                    phase: RunPhase::LaunchFailed,
                    report: None,
                    error: Some(e),
                    log_path,
                    harness_pid: None,
                });
            }
        };
        phase = RunPhase::Running;
        debug!(phase = ?phase, pid = ?child.id(), "test harness started");

        let harness_pid = child.id();
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(HARNESS_INPUT).await {
                debug!("harness stdin closed early: {}", e);
            }
        }
        let exit: JoinHandle<std::io::Result<ExitStatus>> =
            tokio::spawn(async move { child.wait().await });

        let race = self.race(watcher, exit, &cancel).await;
        cancel.cancel();

        // a Unix process group outlives its leader; a dead Windows PID may be reused
        let reachable = !race.exited || cfg!(unix);
        if let Some(pid) = harness_pid.filter(|_| reachable) {
            debug!(pid, exited = race.exited, "killing test harness tree");
            if let Err(e) = kill_process_tree(pid, self.hidden).await {
                debug!("kill of harness tree failed: {}", e);
            }
        }
        if let Some(exit) = race.exit {
            let _ = tokio::time::timeout(REAP_TIMEOUT, exit).await;
        }

        phase = race.phase;
        self.reconcile(store, race.report.as_ref(), &log_path)?;

        let error = if race.report.is_some() {
            None
        } else {
            Some(
                race.watch_error
                    .or(race.process_error)
                    .unwrap_or_else(|| HostError::NotFound("test results file not found".to_string())),
            )
        };

        match &error {
            None => info!(
                strategies = race.report.as_ref().map(|r| r.results.len()).unwrap_or(0),
                "test run finished"
            ),
            Some(e) => warn!(phase = ?phase, "test run finished without results: {}", e),
        }

        Ok(TestOutcome {
            phase,
            report: race.report,
            error,
            log_path,
            harness_pid,
        })
    }

    async fn race(
        &self,
        mut watcher: JoinHandle<Result<ParsedReport>>,
        mut exit: JoinHandle<std::io::Result<ExitStatus>>,
        cancel: &CancellationToken,
    ) -> RaceOutcome {
        let deadline = tokio::time::sleep(self.deadline);
        tokio::pin!(deadline);

        let mut outcome = RaceOutcome::new();

        loop {
            tokio::select! {
                watched = &mut watcher => {
                    match flatten_join(watched) {
                        Ok(report) => outcome.report = Some(report),
                        Err(e) => outcome.watch_error = Some(e),
                    }
                    break;
                }
                status = &mut exit, if !outcome.exited => {
                    outcome.exited = true;
                    let failure = match status {
                        Ok(Ok(status)) if status.success() => None,
                        Ok(Ok(status)) => Some(HostError::Launch(format!("test harness exited with {}", status))),
                        Ok(Err(e)) => Some(HostError::Io(e)),
                        Err(e) => Some(HostError::Launch(format!("harness wait task failed: {}", e))),
                    };
                    let Some(failure) = failure else {
                        debug!("test harness exited cleanly, still watching for the report");
                        continue;
                    };

                    outcome.process_error = Some(failure);
                    // a report written right before the crash is still accepted
                    match tokio::time::timeout(self.exit_grace, &mut watcher).await {
                        Ok(watched) => match flatten_join(watched) {
                            Ok(report) => outcome.report = Some(report),
                            Err(e) => outcome.watch_error = Some(e),
                        },
                        Err(_) => cancel.cancel(),
                    }
                    break;
                }
                _ = &mut deadline => {
                    outcome.phase = RunPhase::TimedOut;
                    outcome.watch_error = Some(HostError::Timeout(format!(
                        "test run exceeded {}s",
                        self.deadline.as_secs()
                    )));
                    break;
                }
            }
        }

        if !outcome.exited {
            outcome.exit = Some(exit);
        }
        outcome
    }

    fn reconcile(&self, store: &ConfigStore, report: Option<&ParsedReport>, log_path: &Path) -> Result<()> {
        let now = Utc::now();
        store.update(|cfg| {
            match report {
                Some(report) => {
                    cfg.test_results = report
                        .results
                        .iter()
                        .map(|(name, result)| {
                            let mut result = result.clone();
                            result.last_tested_at = Some(now);
                            (name.clone(), result)
                        })
                        .collect();
                    cfg.best_strategy = report.best.clone();
                }
                None => {
                    cfg.test_results.clear();
                    cfg.best_strategy.clear();
                }
            }
            cfg.test_in_progress = false;
            cfg.last_test_at = Some(now);
            cfg.last_test_log = log_path.to_string_lossy().into_owned();
        })
    }

    fn spawn_harness(&self, script: &Path, workdir: &Path, log_path: &Path) -> Result<Child> {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| HostError::Launch(format!("log dir {}: {}", parent.display(), e)))?;
        }
        let log = std::fs::File::create(log_path)
            .map_err(|e| HostError::Launch(format!("log file {}: {}", log_path.display(), e)))?;
        let log_err = log
            .try_clone()
            .map_err(|e| HostError::Launch(format!("log file {}: {}", log_path.display(), e)))?;

        let mut cmd = match self.script_host {
            ScriptHost::PowerShell => {
                let mut cmd = AsyncCommand::new("powershell");
                cmd.args(["-NoProfile", "-ExecutionPolicy", "Bypass"]);
                if self.hidden {
                    cmd.args(["-WindowStyle", "Hidden"]);
                }
                cmd.arg("-File").arg(script);
                cmd
            }
            ScriptHost::Shell => {
                let mut cmd = AsyncCommand::new("sh");
                cmd.arg(script);
                cmd
            }
        };
        cmd.current_dir(workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        apply_console_flags(&mut cmd, self.hidden, true);

        cmd.spawn()
            .map_err(|e| HostError::Launch(format!("failed to start test harness: {}", e)))
    }
}

struct RaceOutcome {
    phase: RunPhase,
    report: Option<ParsedReport>,
    watch_error: Option<HostError>,
    process_error: Option<HostError>,
    exited: bool,
    exit: Option<JoinHandle<std::io::Result<ExitStatus>>>,
}

impl RaceOutcome {
    fn new() -> Self {
        Self {
            phase: RunPhase::Resolved,
            report: None,
            watch_error: None,
            process_error: None,
            exited: false,
            exit: None,
        }
    }
}

fn flatten_join(joined: std::result::Result<Result<ParsedReport>, tokio::task::JoinError>) -> Result<ParsedReport> {
    joined.map_err(|e| HostError::NotFound(format!("report watcher stopped: {}", e)))?
}

/// Poll `dir` until a report file parses. Parse failures mean "not written yet".
async fn watch_reports(dir: PathBuf, interval: Duration, cancel: CancellationToken) -> Result<ParsedReport> {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(HostError::Timeout("report watch cancelled".to_string()));
            }
            _ = ticker.tick() => {
                if latest_report_file(&dir)?.is_none() {
                    continue;
                }
                match parse_latest_report(&dir) {
                    Ok(report) => return Ok(report),
                    Err(e) => debug!("report not ready yet: {}", e),
                }
            }
        }
    }
}
