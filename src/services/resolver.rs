//! Derives the queue's work from folder contents alone.
//!
//! Nothing here mutates the filesystem, so resolving twice over unchanged
//! folders yields the same answer, and a restart after a crash sees exactly
//! the work that was still outstanding.

use serde::Serialize;

use crate::models::folders::{FolderError, FolderSet, Partition};

/// Work visible in the folders at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    /// Input documents with no counterpart in Output, Duplicate or Error.
    pub pending: Vec<String>,
    /// Input documents whose name already exists in Output.
    pub duplicates: Vec<String>,
    /// Documents left in Processing, e.g. by a crashed batch.
    pub stranded: Vec<String>,
}

impl QueueSnapshot {
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.duplicates.is_empty() && self.stranded.is_empty()
    }
}

/// Input documents that still need OCR, sorted by name.
///
/// Names are compared case-insensitively against Output, Duplicate and Error.
pub fn pending_files(folders: &FolderSet) -> Result<Vec<String>, FolderError> {
    let mut finished = folders.name_index(Partition::Output)?;
    finished.extend(folders.name_index(Partition::Duplicate)?);
    finished.extend(folders.name_index(Partition::Error)?);

    Ok(folders
        .list(Partition::Input)?
        .into_iter()
        .filter(|name| !finished.contains(&name.to_lowercase()))
        .collect())
}

pub fn resolve(folders: &FolderSet) -> Result<QueueSnapshot, FolderError> {
    let output = folders.name_index(Partition::Output)?;
    let duplicates = folders
        .list(Partition::Input)?
        .into_iter()
        .filter(|name| output.contains(&name.to_lowercase()))
        .collect();

    Ok(QueueSnapshot {
        pending: pending_files(folders)?,
        duplicates,
        stranded: folders.list(Partition::Processing)?,
    })
}
