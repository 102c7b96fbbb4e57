/**
 * SERVICE - Zapret strategy host facade
 *
 * ROLE: composes the config store, release updater, catalog, test supervisor
 * and process manager into the operations the front end calls.
 *
 * Every operation returns a fresh State snapshot. Mutating operations
 * (update, tests, run) serialize on one async lock; stop does not, so it can
 * abort a test run in flight.
 */

use crate::catalog::{list_strategies, REPORT_DIR};
use crate::config::ConfigStore;
use crate::error::{HostError, Result};
use crate::execution::{is_process_alive, ProcessManager};
use crate::models::{State, Strategy};
use crate::report::parse_latest_report;
use crate::settings::Settings;
use crate::supervisor::TestSupervisor;
use crate::updater::ReleaseUpdater;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct Service {
    store: Arc<ConfigStore>,
    updater: ReleaseUpdater,
    supervisor: TestSupervisor,
    processes: ProcessManager,
    mutation: Mutex<()>,
}

impl Service {
    pub fn new(settings: &Settings) -> Result<Self> {
        Ok(Self {
            store: Arc::new(ConfigStore::new(settings)),
            updater: ReleaseUpdater::new(settings)?,
            supervisor: TestSupervisor::new(settings),
            processes: ProcessManager::new(settings),
            mutation: Mutex::new(()),
        })
    }

    /// Shorter deadline and polling for the test harness
    pub fn with_test_timing(mut self, deadline: Duration, poll_interval: Duration, exit_grace: Duration) -> Self {
        self.supervisor = self.supervisor.with_timing(deadline, poll_interval, exit_grace);
        self
    }

    pub fn store(&self) -> Arc<ConfigStore> {
        self.store.clone()
    }

    /// Snapshot for the front end. The remote tag is best-effort: any
    /// failure reads as "" and `has_update` stays false.
    pub async fn state(&self) -> Result<State> {
        let latest_tag = match self.updater.latest_tag().await {
            Ok(tag) => tag,
            Err(e) => {
                debug!("latest tag unavailable: {}", e);
                String::new()
            }
        };
        self.refreshed(latest_tag)
    }

    /// Download the latest release when it differs from the recorded version
    pub async fn check_and_update(&self) -> Result<State> {
        let _guard = self.mutation.lock().await;

        let latest = self.updater.latest_tag().await?;
        let version = self.store.read(|cfg| cfg.version.clone())?;
        if !latest.is_empty() && latest == version {
            debug!(version = %version, "release already current");
            return self.refreshed(latest);
        }

        let outcome = self.updater.download_and_unpack(&latest).await?;
        self.store.update(|cfg| cfg.version = latest.clone())?;
        info!(tag = %latest, outcome = ?outcome, "active release switched");

        self.refreshed(latest)
    }

    /// Run the harness once. Precondition failures are `Err`; failures after
    /// launch come back beside the snapshot.
    pub async fn run_tests(&self) -> Result<(State, Option<HostError>)> {
        let _guard = self.mutation.lock().await;

        let outcome = self.supervisor.run(&self.store).await?;
        debug!(phase = ?outcome.phase, log = %outcome.log_path.display(), "test run reconciled");

        let state = self.state().await?;
        Ok((state, outcome.error))
    }

    pub async fn run_strategy(&self, file: &str) -> Result<State> {
        let _guard = self.mutation.lock().await;

        self.processes.run_strategy(&self.store, file).await?;
        self.state().await
    }

    pub async fn stop_strategy(&self) -> Result<State> {
        self.processes.stop_running(&self.store).await?;
        self.state().await
    }

    /// Shutdown cleanup; never fails
    pub async fn stop_all(&self) {
        if let Err(e) = self.processes.stop_running(&self.store).await {
            warn!("cleanup on shutdown failed: {}", e);
        }
    }

    /// Clear the in-progress flag of a run that will never reconcile,
    /// e.g. when the front end is interrupted mid-test
    pub fn abandon_test_run(&self) -> Result<()> {
        let was_running = self
            .store
            .update(|cfg| std::mem::replace(&mut cfg.test_in_progress, false))?;
        if was_running {
            warn!("test run abandoned before its results were reconciled");
        }
        Ok(())
    }

    fn refreshed(&self, latest_tag: String) -> Result<State> {
        self.rehydrate()?;
        self.heal_running()?;
        self.snapshot(latest_tag)
    }

    /// Reload results from the newest report on disk when nothing is cached
    fn rehydrate(&self) -> Result<()> {
        let idle_and_empty = self
            .store
            .read(|cfg| cfg.test_results.is_empty() && !cfg.test_in_progress)?;
        if !idle_and_empty {
            return Ok(());
        }
        let Some(current) = self.store.current_release_path()? else {
            return Ok(());
        };

        let report = match parse_latest_report(&current.join(REPORT_DIR)) {
            Ok(report) => report,
            Err(e) => {
                debug!("no report to rehydrate from: {}", e);
                return Ok(());
            }
        };

        let restored = self.store.update(|cfg| {
            if !cfg.test_results.is_empty() || cfg.test_in_progress {
                return false;
            }
            cfg.test_results = report.results;
            cfg.best_strategy = report.best;
            true
        })?;
        if restored {
            info!("Restored test results from the last report");
        }
        Ok(())
    }

    /// Drop `running` when its PID no longer exists
    fn heal_running(&self) -> Result<()> {
        let stale = self.store.read(|cfg| {
            cfg.running
                .as_ref()
                .map(|r| r.pid)
                .filter(|pid| !is_process_alive(*pid))
        })?;
        let Some(pid) = stale else {
            return Ok(());
        };

        self.store.update(|cfg| {
            if cfg.running.as_ref().map(|r| r.pid) == Some(pid) {
                cfg.running = None;
            }
        })?;
        info!(pid, "tracked strategy process is gone, cleared");
        Ok(())
    }

    fn snapshot(&self, latest_tag: String) -> Result<State> {
        let config = self.store.load()?;
        let current = self.store.current_release_path()?;

        let files = match list_strategies(current.as_deref()) {
            Ok(files) => files,
            Err(e) => {
                warn!("cannot list strategies: {}", e);
                Vec::new()
            }
        };
        let strategies = files
            .into_iter()
            .map(|file| Strategy {
                result: config.test_results.get(&file.name).cloned(),
                best: !config.best_strategy.is_empty() && config.best_strategy == file.name,
                name: file.name,
                file: file.path,
            })
            .collect();

        let has_update = !latest_tag.is_empty() && latest_tag != config.version;
        Ok(State {
            strategies,
            has_update,
            latest_tag,
            current_path: current
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default(),
            last_test_log: config.last_test_log.clone(),
            running: config.running.clone(),
            config,
        })
    }
}
