use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::models::folders::{place_atomically, place_unique, FolderError, FolderSet, Partition};
use crate::models::settings::Settings;

/// One invocation of the external tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcrRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    pub language: String,
    pub deskew: bool,
}

/// Diagnostics captured from a finished tool run.
#[derive(Debug, Clone, Default)]
pub struct ToolReport {
    pub stdout: String,
    pub stderr: String,
}

impl ToolReport {
    /// Most useful text to show for a failed run.
    pub fn summary(&self) -> String {
        let stderr = self.stderr.trim();
        let stdout = self.stdout.trim();
        if !stderr.is_empty() {
            stderr.to_string()
        } else if !stdout.is_empty() {
            stdout.to_string()
        } else {
            "no diagnostics".to_string()
        }
    }
}

/// Something that turns one input document into one OCR'd output file.
///
/// `Ok` means the tool exited cleanly; whether it actually produced output is
/// checked by [`OcrAdapter`].
#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn recognize(&self, request: &OcrRequest) -> Result<ToolReport, OcrError>;
}

/// PDF24's command line OCR tool (`pdf24-Ocr`).
#[derive(Debug, Clone)]
pub struct Pdf24Cli {
    tool_path: PathBuf,
    dpi: u32,
    remove_background: bool,
    timeout: Duration,
}

impl Pdf24Cli {
    pub fn new(tool_path: impl Into<PathBuf>, dpi: u32, remove_background: bool, timeout: Duration) -> Self {
        Self {
            tool_path: tool_path.into(),
            dpi,
            remove_background,
            timeout,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            &config.ocr_tool_path,
            config.ocr_dpi,
            config.ocr_remove_background,
            config.ocr_timeout(),
        )
    }

    pub fn tool_path(&self) -> &Path {
        &self.tool_path
    }

    /// Whether the configured executable exists.
    pub fn is_installed(&self) -> bool {
        self.tool_path.is_file()
    }

    /// `<tool> -outputFile <out> -language <lang> -dpi <dpi> [-deskew] [-removeBackground] <input>`
    pub fn args(&self, request: &OcrRequest) -> Vec<String> {
        let mut args = vec![
            "-outputFile".to_string(),
            request.output.display().to_string(),
            "-language".to_string(),
            request.language.clone(),
            "-dpi".to_string(),
            self.dpi.to_string(),
        ];
        if request.deskew {
            args.push("-deskew".to_string());
        }
        if self.remove_background {
            args.push("-removeBackground".to_string());
        }
        // Input goes last.
        args.push(request.input.display().to_string());
        args
    }
}

#[async_trait]
impl OcrEngine for Pdf24Cli {
    async fn recognize(&self, request: &OcrRequest) -> Result<ToolReport, OcrError> {
        let args = self.args(request);
        debug!(tool = %self.tool_path.display(), ?args, "Spawning OCR tool");

        let mut command = Command::new(&self.tool_path);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // The tool may fork helpers; give it its own group so a timeout can
        // take the whole tree down.
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn().map_err(OcrError::Spawn)?;
        let pid = child.id();

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output.map_err(OcrError::Spawn)?,
            Err(_) => {
                // The direct child is killed on drop; this gets its descendants.
                if let Some(pid) = pid {
                    kill_process_tree(pid);
                }
                warn!(tool = %self.tool_path.display(), pid, secs = self.timeout.as_secs(), "OCR tool timed out, killed");
                return Err(OcrError::Timeout {
                    secs: self.timeout.as_secs(),
                });
            }
        };

        let report = ToolReport {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !report.stdout.trim().is_empty() {
            debug!(stdout = %report.stdout.trim(), "OCR tool stdout");
        }
        if !report.stderr.trim().is_empty() {
            debug!(stderr = %report.stderr.trim(), "OCR tool stderr");
        }

        if output.status.success() {
            Ok(report)
        } else {
            Err(OcrError::ExitStatus {
                code: output.status.code(),
                detail: report.summary(),
            })
        }
    }
}

#[cfg(unix)]
fn kill_process_tree(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) takes plain integers. A negative pid addresses the
    // process group the tool leads, created by `process_group(0)`.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!(pid, error = %io::Error::last_os_error(), "Could not signal OCR tool process group");
    }
}

#[cfg(windows)]
fn kill_process_tree(pid: u32) {
    let killed = std::process::Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(e) = killed {
        debug!(pid, error = %e, "Could not run taskkill for OCR tool");
    }
}

#[cfg(not(any(unix, windows)))]
fn kill_process_tree(_pid: u32) {}

/// How a successful job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcrSuccess {
    pub output: PathBuf,
    /// Output was already present, the tool was not run.
    pub already_present: bool,
}

/// Runs one claimed job through an [`OcrEngine`] and places the result.
///
/// The tool writes into the staging area; only a verified, non-empty artifact
/// is renamed into Output. Any failure removes the partial artifact before
/// returning.
pub struct OcrAdapter<E> {
    engine: Arc<E>,
    folders: FolderSet,
}

impl<E> Clone for OcrAdapter<E> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            folders: self.folders.clone(),
        }
    }
}

impl<E: OcrEngine> OcrAdapter<E> {
    pub fn new(engine: Arc<E>, folders: FolderSet) -> Self {
        Self { engine, folders }
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    /// Process `file_name`, which must currently sit in Processing.
    pub async fn run(&self, file_name: &str, settings: &Settings) -> Result<OcrSuccess, OcrError> {
        let source = self.folders.processing.join(file_name);
        let target = self.folders.output.join(file_name);

        if self.folders.contains(Partition::Output, file_name)? {
            info!(file = file_name, "Output already exists, skipping OCR");
            self.dispose_source(file_name, &source, settings);
            return Ok(OcrSuccess {
                output: target,
                already_present: true,
            });
        }

        let staging_dir = self.folders.staging_dir();
        fs::create_dir_all(&staging_dir).map_err(|e| OcrError::Placement {
            path: staging_dir.clone(),
            source: e,
        })?;
        // Unique per attempt, so a tool left over from an earlier attempt can
        // never write into this one's artifact.
        let staged = staging_dir.join(format!("{}-{file_name}", Uuid::new_v4().simple()));

        let request = OcrRequest {
            input: source.clone(),
            output: staged.clone(),
            language: settings.language.clone(),
            deskew: settings.deskew,
        };

        let report = match self.engine.recognize(&request).await {
            Ok(report) => report,
            Err(e) => {
                discard(&staged);
                return Err(e);
            }
        };

        let size = fs::metadata(&staged).map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            discard(&staged);
            return Err(OcrError::MissingOutput {
                detail: report.summary(),
            });
        }

        if let Err(e) = place_atomically(&staged, &target) {
            discard(&staged);
            return Err(OcrError::Placement { path: target, source: e });
        }

        self.dispose_source(file_name, &source, settings);
        Ok(OcrSuccess {
            output: target,
            already_present: false,
        })
    }

    /// Delete or archive the processed source. Failures are logged only;
    /// the job already succeeded.
    fn dispose_source(&self, file_name: &str, source: &Path, settings: &Settings) {
        if settings.delete_input {
            match fs::remove_file(source) {
                Ok(()) => debug!(file = file_name, "Deleted input file"),
                Err(e) => warn!(file = file_name, error = %e, "Could not delete input file"),
            }
            return;
        }
        let archived = self.folders.archive.join(file_name);
        let moved = fs::create_dir_all(&self.folders.archive)
            .and_then(|_| place_unique(source, &self.folders.archive, file_name));
        match moved {
            Ok(path) => debug!(file = file_name, path = %path.display(), "Archived input file"),
            Err(e) => warn!(file = file_name, path = %archived.display(), error = %e, "Could not archive input file"),
        }
    }
}

fn discard(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed partial OCR output"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Could not remove partial OCR output"),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OcrError {
    #[error("Failed to run OCR tool: {0}")]
    Spawn(#[source] io::Error),

    #[error("OCR tool timed out after {secs}s and was killed")]
    Timeout { secs: u64 },

    #[error("OCR tool exited with status {code:?}: {detail}")]
    ExitStatus { code: Option<i32>, detail: String },

    #[error("OCR tool produced no output: {detail}")]
    MissingOutput { detail: String },

    #[error("Could not place OCR output at {}: {source}", path.display())]
    Placement {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Folder(#[from] FolderError),
}
