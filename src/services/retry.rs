use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::models::folders::{FolderError, FolderSet, Partition};
use crate::models::job::{Job, JobStatus};

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again; the job stays in Processing.
    Retry,
    /// Budget spent; move the job to Error.
    Quarantine,
}

/// Per-job retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Pause before each retry.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            delay: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    pub fn on_success(&self, job: &mut Job) {
        job.status = JobStatus::Completed;
    }

    /// Record a failed attempt and decide whether another one is allowed.
    pub fn on_failure(&self, job: &mut Job, error: impl Into<String>) -> RetryDecision {
        job.last_error = Some(error.into());
        if job.retry_count >= self.max_retries {
            job.status = JobStatus::Failed;
            RetryDecision::Quarantine
        } else {
            job.retry_count += 1;
            job.status = JobStatus::Pending;
            RetryDecision::Retry
        }
    }
}

/// Path of the `<name>.error.txt` note kept next to a quarantined job.
pub fn error_note_path(folders: &FolderSet, file_name: &str) -> PathBuf {
    folders.error.join(format!("{file_name}.error.txt"))
}

/// Whether `file_name` was given up on, even if its move into Error has not
/// happened yet. The note is written before the move, so it is the marker.
pub fn is_quarantined(folders: &FolderSet, file_name: &str) -> bool {
    error_note_path(folders, file_name).is_file()
}

/// Move a permanently failed job from Processing into Error.
///
/// A `<name>.error.txt` note with the last error is written first; the
/// resolver ignores it because of its extension. If Error already holds a
/// file of that name the job lands as `<stem>-<n>.<ext>` instead.
pub fn quarantine(folders: &FolderSet, job: &Job) -> Result<PathBuf, FolderError> {
    let note_path = error_note_path(folders, &job.file_name);
    let note = format!(
        "file: {}\nattempts: {}\nquarantined_at: {}\nlast_error: {}\n",
        job.file_name,
        job.attempts(),
        Utc::now().to_rfc3339(),
        job.last_error.as_deref().unwrap_or("unknown"),
    );
    let written = fs::create_dir_all(&folders.error).and_then(|_| fs::write(&note_path, note));
    if let Err(e) = written {
        warn!(file = %job.file_name, error = %e, "Could not write error note");
    }

    finish_quarantine(folders, &job.file_name)
}

/// The move half of [`quarantine`], for a job whose note already exists.
pub fn finish_quarantine(folders: &FolderSet, file_name: &str) -> Result<PathBuf, FolderError> {
    folders.transfer_unique(file_name, Partition::Processing, Partition::Error)
}

/// Drop the note of an earlier quarantine so a re-submitted document of the
/// same name is not taken for given up.
pub fn clear_note(folders: &FolderSet, file_name: &str) {
    let note_path = error_note_path(folders, file_name);
    match fs::remove_file(&note_path) {
        Ok(()) => debug!(file = file_name, "Removed error note of an earlier attempt"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(file = file_name, error = %e, "Could not remove old error note"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_retries_means_three_attempts() {
        let policy = RetryPolicy::default();
        let mut job = Job::claimed("d.pdf");

        assert_eq!(policy.on_failure(&mut job, "exit 1"), RetryDecision::Retry);
        assert_eq!(job.attempts(), 2);
        assert_eq!(policy.on_failure(&mut job, "exit 1"), RetryDecision::Retry);
        assert_eq!(job.attempts(), 3);
        assert_eq!(policy.on_failure(&mut job, "timeout"), RetryDecision::Quarantine);
        assert_eq!(job.attempts(), policy.max_attempts());
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_zero_retries_quarantines_first_failure() {
        let policy = RetryPolicy {
            max_retries: 0,
            delay: Duration::ZERO,
        };
        let mut job = Job::claimed("x.pdf");
        assert_eq!(policy.on_failure(&mut job, "boom"), RetryDecision::Quarantine);
        assert_eq!(job.attempts(), 1);
    }

    #[test]
    fn test_quarantine_moves_file_and_writes_note() {
        let root = tempfile::tempdir().unwrap();
        let folders = FolderSet::under(root.path());
        folders.ensure_all().unwrap();
        fs::write(folders.processing.join("d.pdf"), b"scan").unwrap();

        let mut job = Job::claimed("d.pdf");
        job.retry_count = 2;
        job.last_error = Some("OCR tool exited with status Some(1)".to_string());
        job.status = JobStatus::Failed;

        let moved = quarantine(&folders, &job).unwrap();
        assert_eq!(moved, folders.error.join("d.pdf"));
        assert!(!folders.processing.join("d.pdf").exists());
        let note = fs::read_to_string(folders.error.join("d.pdf.error.txt")).unwrap();
        assert!(note.contains("attempts: 3"));
        assert!(note.contains("status Some(1)"));
        assert_eq!(folders.list(Partition::Error).unwrap(), vec!["d.pdf"]);
        assert!(is_quarantined(&folders, "d.pdf"));
    }

    #[test]
    fn test_note_is_written_before_the_move() {
        let root = tempfile::tempdir().unwrap();
        let folders = FolderSet::under(root.path());
        folders.ensure_all().unwrap();

        // Nothing in Processing, so the move fails after the note is down.
        let mut job = Job::claimed("d.pdf");
        job.last_error = Some("timeout".to_string());
        job.status = JobStatus::Failed;
        assert!(quarantine(&folders, &job).unwrap_err().is_not_found());
        assert!(is_quarantined(&folders, "d.pdf"));

        clear_note(&folders, "d.pdf");
        assert!(!is_quarantined(&folders, "d.pdf"));
    }

    #[test]
    fn test_quarantine_keeps_earlier_file_of_same_name() {
        let root = tempfile::tempdir().unwrap();
        let folders = FolderSet::under(root.path());
        folders.ensure_all().unwrap();
        fs::write(folders.error.join("d.pdf"), b"first").unwrap();
        fs::write(folders.processing.join("d.pdf"), b"second").unwrap();

        let mut job = Job::claimed("d.pdf");
        job.status = JobStatus::Failed;
        let moved = quarantine(&folders, &job).unwrap();

        assert_eq!(moved, folders.error.join("d-1.pdf"));
        assert_eq!(fs::read(folders.error.join("d.pdf")).unwrap(), b"first");
        assert_eq!(fs::read(&moved).unwrap(), b"second");
    }
}
