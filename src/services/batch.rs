//! One processing cycle: claim eligible jobs sequentially, then run them on a
//! bounded worker pool.
//!
//! Claiming is a single-threaded loop of no-clobber moves from Input into
//! Processing, so no two workers can ever race for the same file. Only files
//! this cycle actually moved are handed to the pool, and no name is handed
//! out twice.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::models::folders::{FolderError, FolderSet, Partition};
use crate::models::job::{BatchResult, Job, JobOutcome, JobStatus};
use crate::models::settings::Settings;
use crate::services::lease::LeaseError;
use crate::services::ocr::{OcrAdapter, OcrEngine};
use crate::services::resolver;
use crate::services::retry::{self, RetryDecision, RetryPolicy};
use crate::services::shutdown::Shutdown;

pub struct BatchCoordinator<E> {
    folders: FolderSet,
    adapter: OcrAdapter<E>,
    policy: RetryPolicy,
    max_workers: usize,
    /// Lower-cased names whose retries ran out but which could not be moved
    /// to Error. They are never dispatched again by this process.
    given_up: Arc<Mutex<HashSet<String>>>,
}

impl<E: OcrEngine + 'static> BatchCoordinator<E> {
    pub fn new(folders: FolderSet, engine: Arc<E>, policy: RetryPolicy, max_workers: usize) -> Self {
        Self {
            adapter: OcrAdapter::new(engine, folders.clone()),
            folders,
            policy,
            max_workers: max_workers.max(1),
            given_up: Arc::default(),
        }
    }

    pub fn folders(&self) -> &FolderSet {
        &self.folders
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run one batch. The caller must hold the queue lease.
    ///
    /// Routes duplicates, reclaims anything stranded in Processing, claims
    /// pending Input files, then dispatches every claimed file.
    pub async fn run_batch(&self, settings: &Settings, shutdown: &Shutdown) -> Result<BatchResult, CycleError> {
        let snapshot = resolver::resolve(&self.folders)?;
        let mut result = BatchResult::default();

        self.route_duplicates(&snapshot.duplicates, &mut result);
        let mut claimed = self.recover_stranded(&snapshot.stranded, &mut result)?;
        let fresh = self.claim(&snapshot.pending, &claimed, shutdown);
        claimed.extend(fresh);

        if claimed.is_empty() {
            return Ok(result);
        }
        self.dispatch(claimed, settings, shutdown, &mut result).await;
        Ok(result)
    }

    /// Move Input files that already have an output to Duplicate.
    pub fn route_duplicates(&self, names: &[String], result: &mut BatchResult) {
        for name in names {
            match self.folders.transfer_unique(name, Partition::Input, Partition::Duplicate) {
                Ok(path) => {
                    info!(file = %name, path = %path.display(), "Output already exists, moved input to Duplicate");
                    metrics::counter!("ocr_jobs_duplicate_total").increment(1);
                    result.record(duplicate_outcome(name));
                }
                Err(e) if e.is_not_found() => debug!(file = %name, "Duplicate vanished before routing"),
                Err(e) => warn!(file = %name, error = %e, "Could not route duplicate"),
            }
        }
    }

    /// Take over documents a previous batch left in Processing.
    ///
    /// Only called under the lease with the opposing front-end idle, so
    /// nothing in Processing can belong to a live batch. Leftover staging
    /// artifacts are deleted. Documents already given up on only get their
    /// move to Error retried; documents whose output exists go to Duplicate;
    /// the rest are returned for dispatch.
    pub fn recover_stranded(&self, stranded: &[String], result: &mut BatchResult) -> Result<Vec<String>, CycleError> {
        self.clear_staging();
        if stranded.is_empty() {
            return Ok(Vec::new());
        }
        warn!(count = stranded.len(), "Reclaiming documents stranded in Processing");

        let finished = self.folders.name_index(Partition::Output)?;
        let mut reclaimed = Vec::with_capacity(stranded.len());
        for name in stranded {
            let key = name.to_lowercase();
            if self.is_given_up(&key) || retry::is_quarantined(&self.folders, name) {
                match retry::finish_quarantine(&self.folders, name) {
                    Ok(path) => {
                        self.lock_given_up().remove(&key);
                        info!(file = %name, path = %path.display(), "Moved previously failed document to Error");
                    }
                    Err(e) => warn!(file = %name, error = %e, "Failed document still cannot be moved to Error"),
                }
                continue;
            }
            if !finished.contains(&key) {
                reclaimed.push(name.clone());
                continue;
            }
            match self.folders.transfer_unique(name, Partition::Processing, Partition::Duplicate) {
                Ok(_) => {
                    info!(file = %name, "Stranded document already has output, moved to Duplicate");
                    result.record(duplicate_outcome(name));
                }
                Err(e) => warn!(file = %name, error = %e, "Could not route stranded duplicate"),
            }
        }
        Ok(reclaimed)
    }

    fn lock_given_up(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.given_up.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_given_up(&self, key: &str) -> bool {
        self.lock_given_up().contains(key)
    }

    fn clear_staging(&self) {
        let staging = self.folders.staging_dir();
        let Ok(entries) = fs::read_dir(&staging) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "Could not remove leftover staging file");
            } else {
                debug!(path = %path.display(), "Removed leftover staging file");
            }
        }
    }

    /// Claim phase: move each pending file into Processing, one at a time.
    ///
    /// `taken` holds names already in this cycle's dispatch set. A name that
    /// matches one of them, or a file already in Processing, case-insensitively,
    /// stays in Input for a later cycle. A file that cannot be moved is skipped
    /// for this cycle; if it is still in Input it is offered again next cycle.
    pub fn claim(&self, pending: &[String], taken: &[String], shutdown: &Shutdown) -> Vec<String> {
        let mut names: HashSet<String> = taken.iter().map(|name| name.to_lowercase()).collect();
        let mut claimed = Vec::with_capacity(pending.len());
        for (index, name) in pending.iter().enumerate() {
            if shutdown.is_requested() {
                info!(remaining = pending.len() - index, "Shutdown requested, claim phase stopped");
                break;
            }
            if !names.insert(name.to_lowercase()) {
                info!(file = %name, "A document of the same name is already being processed, leaving it in Input");
                continue;
            }
            match self.folders.transfer(name, Partition::Input, Partition::Processing) {
                Ok(_) => {
                    retry::clear_note(&self.folders, name);
                    claimed.push(name.clone());
                }
                Err(FolderError::Io { source, .. }) if source.kind() == io::ErrorKind::AlreadyExists => {
                    info!(file = %name, "Processing already holds this name, leaving it in Input");
                }
                Err(e) => warn!(file = %name, error = %e, "Claim failed, skipping this cycle"),
            }
        }
        claimed
    }

    async fn dispatch(&self, claimed: Vec<String>, settings: &Settings, shutdown: &Shutdown, result: &mut BatchResult) {
        let workers = settings.workers.clamp(1, self.max_workers);
        info!(files = claimed.len(), workers, "Dispatching batch");

        let permits = Arc::new(Semaphore::new(workers));
        let settings = Arc::new(settings.clone());
        let mut tasks = JoinSet::new();

        for file_name in claimed {
            let permits = Arc::clone(&permits);
            let worker = JobWorker {
                adapter: self.adapter.clone(),
                folders: self.folders.clone(),
                policy: self.policy,
                settings: Arc::clone(&settings),
                shutdown: shutdown.clone(),
                given_up: Arc::clone(&self.given_up),
            };
            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return JobOutcome::from_job(&Job::claimed(file_name), Duration::ZERO);
                };
                worker.process(file_name).await
            });
        }

        // Completion order is whatever the tool gives us.
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => result.record(outcome),
                Err(e) => error!(error = %e, "OCR worker task died, its document stays in Processing"),
            }
        }
    }
}

fn duplicate_outcome(name: &str) -> JobOutcome {
    let mut job = Job::claimed(name);
    job.status = JobStatus::Duplicate;
    let mut outcome = JobOutcome::from_job(&job, Duration::ZERO);
    outcome.attempts = 0;
    outcome
}

/// Everything one pool task needs; shares nothing mutable with its siblings.
struct JobWorker<E> {
    adapter: OcrAdapter<E>,
    folders: FolderSet,
    policy: RetryPolicy,
    settings: Arc<Settings>,
    shutdown: Shutdown,
    given_up: Arc<Mutex<HashSet<String>>>,
}

impl<E: OcrEngine> JobWorker<E> {
    /// Attempt the job until it succeeds or its retry budget is spent.
    async fn process(self, file_name: String) -> JobOutcome {
        let started = Instant::now();
        let mut job = Job::claimed(file_name);

        if self.shutdown.is_requested() {
            info!(file = %job.file_name, "Shutdown requested, leaving job in Processing");
            return JobOutcome::from_job(&job, started.elapsed());
        }

        loop {
            let attempt = job.attempts();
            info!(
                file = %job.file_name,
                attempt,
                max_attempts = self.policy.max_attempts(),
                "Starting OCR"
            );
            let attempt_started = Instant::now();

            let error = match self.adapter.run(&job.file_name, &self.settings).await {
                Ok(done) => {
                    self.policy.on_success(&mut job);
                    let elapsed = started.elapsed();
                    metrics::counter!("ocr_jobs_completed_total").increment(1);
                    metrics::histogram!("ocr_job_duration_seconds").record(elapsed.as_secs_f64());
                    info!(
                        file = %job.file_name,
                        attempt,
                        duration_ms = elapsed.as_millis() as u64,
                        output = %done.output.display(),
                        already_present = done.already_present,
                        "OCR succeeded"
                    );
                    return JobOutcome::from_job(&job, elapsed);
                }
                Err(e) => e,
            };

            warn!(
                file = %job.file_name,
                attempt,
                duration_ms = attempt_started.elapsed().as_millis() as u64,
                error = %error,
                "OCR attempt failed"
            );

            match self.policy.on_failure(&mut job, error.to_string()) {
                RetryDecision::Retry => {
                    metrics::counter!("ocr_jobs_retried_total").increment(1);
                    if self.shutdown.is_requested() {
                        info!(file = %job.file_name, "Shutdown requested, retry left for the next run");
                        job.status = JobStatus::Processing;
                        return JobOutcome::from_job(&job, started.elapsed());
                    }
                    if !self.policy.delay.is_zero() {
                        tokio::time::sleep(self.policy.delay).await;
                    }
                }
                RetryDecision::Quarantine => {
                    metrics::counter!("ocr_jobs_failed_total").increment(1);
                    match retry::quarantine(&self.folders, &job) {
                        Ok(path) => error!(
                            file = %job.file_name,
                            attempts = job.attempts(),
                            error = job.last_error.as_deref().unwrap_or_default(),
                            path = %path.display(),
                            "Retries exhausted, moved to Error"
                        ),
                        Err(e) => {
                            error!(
                                file = %job.file_name,
                                error = %e,
                                "Retries exhausted but the move to Error failed, job stays in Processing"
                            );
                            self.given_up
                                .lock()
                                .unwrap_or_else(|poisoned| poisoned.into_inner())
                                .insert(job.file_name.to_lowercase());
                        }
                    }
                    return JobOutcome::from_job(&job, started.elapsed());
                }
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error(transparent)]
    Folder(#[from] FolderError),

    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error("Processing cycle panicked: {0}")]
    Panicked(String),
}
