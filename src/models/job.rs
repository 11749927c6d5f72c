use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::models::folders::Partition;

/// Where a job stands in the retry/quarantine state machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Duplicate,
}

impl JobStatus {
    /// Folder a job with this status is found in.
    pub fn partition(self) -> Partition {
        match self {
            JobStatus::Pending => Partition::Input,
            JobStatus::Processing => Partition::Processing,
            JobStatus::Completed => Partition::Output,
            JobStatus::Failed => Partition::Error,
            JobStatus::Duplicate => Partition::Duplicate,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.partition().is_terminal()
    }
}

/// One document tracked through the queue by file name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub file_name: String,
    pub status: JobStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub claimed_at: DateTime<Utc>,
}

impl Job {
    /// A job that has just been moved into Processing.
    pub fn claimed(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            status: JobStatus::Processing,
            retry_count: 0,
            last_error: None,
            claimed_at: Utc::now(),
        }
    }

    /// Attempts made so far, counting the one in progress.
    pub fn attempts(&self) -> u32 {
        self.retry_count + 1
    }
}

/// What happened to one job during a batch.
#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub file_name: String,
    pub success: bool,
    pub status: JobStatus,
    pub attempts: u32,
    pub error: Option<String>,
    #[serde(skip)]
    pub duration: Duration,
}

impl JobOutcome {
    pub fn from_job(job: &Job, duration: Duration) -> Self {
        Self {
            file_name: job.file_name.clone(),
            success: job.status == JobStatus::Completed,
            status: job.status,
            attempts: job.attempts(),
            error: job.last_error.clone(),
            duration,
        }
    }
}

/// Aggregate of one batch cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchResult {
    pub succeeded: usize,
    pub failed: usize,
    /// Inputs routed to Duplicate without processing.
    pub duplicates: usize,
    /// Jobs left in Processing because shutdown interrupted their retries.
    pub deferred: usize,
    pub outcomes: Vec<JobOutcome>,
}

impl BatchResult {
    pub fn record(&mut self, outcome: JobOutcome) {
        match outcome.status {
            JobStatus::Completed => self.succeeded += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Duplicate => self.duplicates += 1,
            JobStatus::Pending | JobStatus::Processing => self.deferred += 1,
        }
        self.outcomes.push(outcome);
    }

    /// `(success, failure)` counts.
    pub fn counts(&self) -> (usize, usize) {
        (self.succeeded, self.failed)
    }

    /// Number of documents this batch moved or attempted.
    pub fn touched(&self) -> usize {
        self.succeeded + self.failed + self.duplicates + self.deferred
    }

    pub fn outcome(&self, file_name: &str) -> Option<&JobOutcome> {
        self.outcomes.iter().find(|o| o.file_name == file_name)
    }
}
