//! Top-level control loop shared by both front-ends.
//!
//! Each cycle reloads settings, resolves the queue, and runs one batch only
//! if this front-end can take its lease while the opposing front-end is idle.
//! A conflict is never an error: the cycle is skipped and retried next poll.

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use strum::Display;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::models::job::BatchResult;
use crate::models::settings::Settings;
use crate::services::batch::{BatchCoordinator, CycleError};
use crate::services::lease::LeaseManager;
use crate::services::ocr::OcrEngine;
use crate::services::resolver;
use crate::services::shutdown::Shutdown;

/// The two independent processes that share one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum FrontEnd {
    Interactive,
    Background,
}

impl FrontEnd {
    pub fn lease_name(self) -> &'static str {
        match self {
            FrontEnd::Interactive => "interactive_app",
            FrontEnd::Background => "background_worker",
        }
    }

    pub fn opposing(self) -> FrontEnd {
        match self {
            FrontEnd::Interactive => FrontEnd::Background,
            FrontEnd::Background => FrontEnd::Interactive,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Checking,
    RunningBatch,
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum SkipReason {
    AutoStartDisabled,
    /// Another process of the same front-end holds our lease.
    OwnLeaseHeld,
    OpposingLeaseHeld(FrontEnd),
}

#[derive(Debug)]
pub enum CycleOutcome {
    NoWork,
    Skipped(SkipReason),
    Completed(BatchResult),
}

impl CycleOutcome {
    /// Whether the cycle changed folder contents, so the queue is worth
    /// checking again right away.
    pub fn made_progress(&self) -> bool {
        matches!(self, CycleOutcome::Completed(result) if result.touched() > 0)
    }
}

pub struct Scheduler<E> {
    coordinator: BatchCoordinator<E>,
    leases: LeaseManager,
    front_end: FrontEnd,
    settings_path: PathBuf,
    max_workers: usize,
    poll_interval: Duration,
    state: watch::Sender<SchedulerState>,
}

impl<E: OcrEngine + 'static> Scheduler<E> {
    pub fn new(
        coordinator: BatchCoordinator<E>,
        leases: LeaseManager,
        front_end: FrontEnd,
        settings_path: impl Into<PathBuf>,
        max_workers: usize,
        poll_interval: Duration,
    ) -> Self {
        let (state, _) = watch::channel(SchedulerState::Idle);
        Self {
            coordinator,
            leases,
            front_end,
            settings_path: settings_path.into(),
            max_workers: max_workers.max(1),
            poll_interval,
            state,
        }
    }

    pub fn from_config(config: &AppConfig, engine: Arc<E>, front_end: FrontEnd) -> Self {
        let coordinator = BatchCoordinator::new(
            config.folders(),
            engine,
            config.retry_policy(),
            config.worker_ceiling(),
        );
        Self::new(
            coordinator,
            config.leases(),
            front_end,
            config.settings_path(),
            config.worker_ceiling(),
            config.poll_interval(),
        )
    }

    pub fn front_end(&self) -> FrontEnd {
        self.front_end
    }

    pub fn coordinator(&self) -> &BatchCoordinator<E> {
        &self.coordinator
    }

    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    fn set_state(&self, state: SchedulerState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!(from = %current, to = %state, "Scheduler state change");
            *current = state;
            true
        });
    }

    /// Fresh settings snapshot; never fails.
    pub fn load_settings(&self) -> Settings {
        Settings::load(&self.settings_path, self.max_workers)
    }

    /// One cycle with a freshly loaded settings snapshot.
    ///
    /// Runs regardless of `auto_start`; an explicit request to process is its
    /// own permission.
    pub async fn run_one_cycle(&self, shutdown: &Shutdown) -> Result<CycleOutcome, CycleError> {
        let settings = self.load_settings();
        let outcome = self.cycle(&settings, shutdown).await;
        self.set_state(SchedulerState::Idle);
        outcome
    }

    async fn cycle(&self, settings: &Settings, shutdown: &Shutdown) -> Result<CycleOutcome, CycleError> {
        self.set_state(SchedulerState::Checking);

        let snapshot = resolver::resolve(self.coordinator.folders())?;
        metrics::gauge!("ocr_pending_files").set(snapshot.pending.len() as f64);
        if snapshot.is_empty() {
            debug!(front_end = %self.front_end, "No pending files");
            return Ok(CycleOutcome::NoWork);
        }

        let own = self.front_end.lease_name();
        let opposing = self.front_end.opposing();

        if self.leases.is_locked(opposing.lease_name())? {
            return Ok(self.conflict(opposing));
        }

        let Some(guard) = self.leases.acquire(own)? else {
            metrics::counter!("ocr_lease_conflicts_total").increment(1);
            info!(lease = own, "Own lease held by another process, skipping cycle");
            return Ok(CycleOutcome::Skipped(SkipReason::OwnLeaseHeld));
        };

        // The opposing side may have acquired between our check and our
        // acquire. Whoever sees the other afterwards backs off.
        if self.leases.is_locked(opposing.lease_name())? {
            if let Err(e) = guard.release() {
                warn!(lease = own, error = %e, "Failed to release lease after conflict");
            }
            return Ok(self.conflict(opposing));
        }

        self.set_state(SchedulerState::RunningBatch);
        info!(
            front_end = %self.front_end,
            pending = snapshot.pending.len(),
            stranded = snapshot.stranded.len(),
            workers = settings.workers,
            language = %settings.language,
            "Batch started"
        );

        let heartbeat = guard.heartbeat((self.leases.ttl() / 3).max(Duration::from_secs(1)));
        let batch = self.coordinator.run_batch(settings, shutdown).await;
        drop(heartbeat);
        if let Err(e) = guard.release() {
            warn!(lease = own, error = %e, "Failed to release lease after batch");
        }

        let result = batch?;
        info!(
            front_end = %self.front_end,
            succeeded = result.succeeded,
            failed = result.failed,
            duplicates = result.duplicates,
            deferred = result.deferred,
            "Batch finished"
        );
        Ok(CycleOutcome::Completed(result))
    }

    fn conflict(&self, holder: FrontEnd) -> CycleOutcome {
        metrics::counter!("ocr_lease_conflicts_total").increment(1);
        info!(
            front_end = %self.front_end,
            holder = %holder,
            lease = holder.lease_name(),
            "Opposing front-end is processing, deferring"
        );
        CycleOutcome::Skipped(SkipReason::OpposingLeaseHeld(holder))
    }

    /// Poll until shutdown is requested.
    ///
    /// Shutdown never interrupts a running batch: the batch drains, then the
    /// loop exits instead of starting another. Errors and panics inside a
    /// cycle are logged and the loop carries on after the poll interval.
    pub async fn run_forever(&self, shutdown: Shutdown) {
        let mut watcher = shutdown.clone();
        info!(
            front_end = %self.front_end,
            poll_secs = self.poll_interval.as_secs(),
            "Scheduler loop started"
        );

        while !shutdown.is_requested() {
            let settings = self.load_settings();

            let outcome = if settings.auto_start {
                let cycle = AssertUnwindSafe(self.cycle(&settings, &shutdown)).catch_unwind();
                tokio::pin!(cycle);
                let mut draining = false;
                loop {
                    tokio::select! {
                        finished = &mut cycle => break finished,
                        _ = watcher.requested(), if !draining => {
                            draining = true;
                            self.set_state(SchedulerState::ShuttingDown);
                            info!("Shutdown requested, draining current batch");
                        }
                    }
                }
            } else {
                debug!("Auto-start disabled, not processing");
                Ok(Ok(CycleOutcome::Skipped(SkipReason::AutoStartDisabled)))
            };

            let progressed = match outcome {
                Ok(Ok(outcome)) => outcome.made_progress(),
                Ok(Err(e)) => {
                    error!(front_end = %self.front_end, error = %e, "Processing cycle failed");
                    false
                }
                Err(panic) => {
                    let e = CycleError::Panicked(panic_message(panic.as_ref()));
                    error!(front_end = %self.front_end, error = %e, "Processing cycle failed");
                    false
                }
            };

            if shutdown.is_requested() {
                break;
            }
            self.set_state(SchedulerState::Idle);
            if progressed {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = watcher.requested() => {}
            }
        }

        self.set_state(SchedulerState::ShuttingDown);
        info!(front_end = %self.front_end, "Scheduler loop stopped");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
