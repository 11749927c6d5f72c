use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, IntoEnumIterator};
use tracing::warn;
use uuid::Uuid;

const STAGING_DIR: &str = ".staging";

/// Queue partitions. A job lives in exactly one of them at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Partition {
    Input,
    Processing,
    Output,
    Error,
    Duplicate,
}

impl Partition {
    /// Partitions a job never leaves once it arrives there.
    pub fn is_terminal(self) -> bool {
        matches!(self, Partition::Output | Partition::Error | Partition::Duplicate)
    }
}

/// On-disk layout of the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderSet {
    pub input: PathBuf,
    pub processing: PathBuf,
    pub output: PathBuf,
    pub error: PathBuf,
    pub duplicate: PathBuf,
    /// Where sources go after success when they are not deleted. Not a queue partition.
    pub archive: PathBuf,
    /// Lower-case document extension without the dot.
    pub extension: String,
}

/// Document count and size of one folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FolderStats {
    pub exists: bool,
    pub count: usize,
    pub size_bytes: u64,
}

impl FolderStats {
    pub fn size_mib(&self) -> f64 {
        (self.size_bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0
    }
}

impl FolderSet {
    /// Standard layout (`Input`, `Processing`, ...) below `root`, for PDF documents.
    pub fn under(root: &Path) -> Self {
        Self {
            input: root.join("Input"),
            processing: root.join("Processing"),
            output: root.join("Output"),
            error: root.join("Error"),
            duplicate: root.join("Duplicate"),
            archive: root.join("Originals"),
            extension: "pdf".to_string(),
        }
    }

    pub fn path(&self, partition: Partition) -> &Path {
        match partition {
            Partition::Input => &self.input,
            Partition::Processing => &self.processing,
            Partition::Output => &self.output,
            Partition::Error => &self.error,
            Partition::Duplicate => &self.duplicate,
        }
    }

    /// Scratch area inside Processing where the OCR tool writes before placement.
    pub fn staging_dir(&self) -> PathBuf {
        self.processing.join(STAGING_DIR)
    }

    /// Create every folder of the layout that does not exist yet.
    pub fn ensure_all(&self) -> Result<(), FolderError> {
        let staging = self.staging_dir();
        let dirs = Partition::iter()
            .map(|p| self.path(p))
            .chain([self.archive.as_path(), staging.as_path()]);
        for dir in dirs {
            fs::create_dir_all(dir).map_err(|e| FolderError::io(dir, e))?;
        }
        Ok(())
    }

    /// Whether `name` is a queue document: matching extension, not a hidden file.
    pub fn is_document(&self, name: &str) -> bool {
        if name.starts_with('.') {
            return false;
        }
        Path::new(name)
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(&self.extension))
    }

    /// Sorted document names in a partition. A missing folder is empty.
    pub fn list(&self, partition: Partition) -> Result<Vec<String>, FolderError> {
        let dir = self.path(partition);
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(FolderError::io(dir, e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| FolderError::io(dir, e))?;
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }
            let file_name = entry.file_name();
            match file_name.to_str() {
                Some(name) if self.is_document(name) => names.push(name.to_string()),
                Some(_) => {}
                None => warn!(
                    partition = %partition,
                    name = %file_name.to_string_lossy(),
                    "Skipping file whose name is not valid UTF-8; rename it to queue it"
                ),
            }
        }
        names.sort();
        Ok(names)
    }

    /// Lower-cased document names, for case-insensitive membership checks.
    pub fn name_index(&self, partition: Partition) -> Result<HashSet<String>, FolderError> {
        Ok(self
            .list(partition)?
            .into_iter()
            .map(|name| name.to_lowercase())
            .collect())
    }

    pub fn contains(&self, partition: Partition, name: &str) -> Result<bool, FolderError> {
        Ok(self.name_index(partition)?.contains(&name.to_lowercase()))
    }

    pub fn stats(&self, partition: Partition) -> Result<FolderStats, FolderError> {
        let dir = self.path(partition);
        if !dir.is_dir() {
            return Ok(FolderStats {
                exists: false,
                count: 0,
                size_bytes: 0,
            });
        }
        let names = self.list(partition)?;
        let mut size_bytes = 0;
        for name in &names {
            // A file may leave the folder while we count.
            if let Ok(meta) = fs::metadata(dir.join(name)) {
                size_bytes += meta.len();
            }
        }
        Ok(FolderStats {
            exists: true,
            count: names.len(),
            size_bytes,
        })
    }

    /// Move one job between partitions. Never replaces a file already in
    /// the target partition; that case fails with `AlreadyExists`.
    pub fn transfer(&self, name: &str, from: Partition, to: Partition) -> Result<PathBuf, FolderError> {
        let source = self.path(from).join(name);
        let target = self.path(to).join(name);
        place_atomically(&source, &target).map_err(|e| FolderError::io(&source, e))?;
        Ok(target)
    }

    /// Like [`transfer`](Self::transfer), but picks `<stem>-<n>.<ext>` in the
    /// target when the name is taken. Used for terminal dumps where keeping
    /// every copy matters more than the exact name.
    pub fn transfer_unique(&self, name: &str, from: Partition, to: Partition) -> Result<PathBuf, FolderError> {
        let source = self.path(from).join(name);
        place_unique(&source, self.path(to), name).map_err(|e| FolderError::io(&source, e))
    }
}

/// Place `source` in `dir` as `name`, or as `<stem>-<n>.<ext>` when that
/// name is taken. Returns the path used.
pub fn place_unique(source: &Path, dir: &Path, name: &str) -> io::Result<PathBuf> {
    let path = Path::new(name);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(name);
    let ext = path.extension().and_then(|e| e.to_str());

    for n in 0..1000u32 {
        let candidate = match (n, ext) {
            (0, _) => name.to_string(),
            (n, Some(ext)) => format!("{stem}-{n}.{ext}"),
            (n, None) => format!("{stem}-{n}"),
        };
        let target = dir.join(candidate);
        match place_atomically(source, &target) {
            Ok(()) => return Ok(target),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(io::ErrorKind::AlreadyExists, "no free name in target folder"))
}

/// Make `source` appear at `target` in one step, never replacing `target`.
///
/// A hard link publishes the file under its new name or fails with
/// `AlreadyExists`; the old name is removed afterwards. Where hard links are
/// unavailable (another filesystem, or no support) the file is copied to a
/// hidden temp name next to `target` and linked or renamed from there, so a
/// half-copied file is never visible under its real name.
pub fn place_atomically(source: &Path, target: &Path) -> io::Result<()> {
    match fs::hard_link(source, target) {
        Ok(()) => return finish_move(source, target),
        Err(e) if matches!(e.kind(), io::ErrorKind::AlreadyExists | io::ErrorKind::NotFound) => return Err(e),
        Err(_) => {}
    }

    if fs::symlink_metadata(target).is_ok() {
        return Err(io::Error::new(io::ErrorKind::AlreadyExists, "target exists"));
    }
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let temp = dir.join(format!(".{}.tmp", Uuid::new_v4()));
    if let Err(e) = fs::copy(source, &temp) {
        let _ = fs::remove_file(&temp);
        return Err(e);
    }
    let published = match fs::hard_link(&temp, target) {
        Ok(()) => fs::remove_file(&temp),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(e),
        // No hard links at the target either; the existence check above is
        // the best we can do.
        Err(_) if fs::symlink_metadata(target).is_ok() => {
            Err(io::Error::new(io::ErrorKind::AlreadyExists, "target exists"))
        }
        Err(_) => fs::rename(&temp, target),
    };
    if let Err(e) = published {
        let _ = fs::remove_file(&temp);
        return Err(e);
    }
    finish_move(source, target)
}

/// Drop the source name once `target` holds the file; undo on failure so the
/// job is never in two partitions.
fn finish_move(source: &Path, target: &Path) -> io::Result<()> {
    if let Err(e) = fs::remove_file(source) {
        let _ = fs::remove_file(target);
        return Err(e);
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum FolderError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FolderError {
    pub fn io(path: &Path, source: io::Error) -> Self {
        FolderError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// True when the file involved no longer exists.
    pub fn is_not_found(&self) -> bool {
        match self {
            FolderError::Io { source, .. } => source.kind() == io::ErrorKind::NotFound,
        }
    }
}
