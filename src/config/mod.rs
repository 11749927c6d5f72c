use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::models::folders::FolderSet;
use crate::services::lease::LeaseManager;
use crate::services::retry::RetryPolicy;

/// Process-wide configuration, read once at startup from `OCRQ_*` variables.
///
/// Everything the operator tunes between cycles lives in
/// [`Settings`](crate::models::settings::Settings) instead.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Root under which the default queue folders are created.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Newly arrived, unclaimed documents. Defaults to `<work_dir>/Input`.
    pub input_dir: Option<PathBuf>,

    /// Claimed, in-flight documents. Defaults to `<work_dir>/Processing`.
    pub processing_dir: Option<PathBuf>,

    /// OCR'd results. Defaults to `<work_dir>/Output`.
    pub output_dir: Option<PathBuf>,

    /// Permanently failed documents. Defaults to `<work_dir>/Error`.
    pub error_dir: Option<PathBuf>,

    /// Inputs whose output already existed. Defaults to `<work_dir>/Duplicate`.
    pub duplicate_dir: Option<PathBuf>,

    /// Untouched sources kept when `delete_input` is off. Defaults to `<work_dir>/Originals`.
    pub archive_dir: Option<PathBuf>,

    /// Lease files shared by both front-ends. Defaults to `<work_dir>/.locks`.
    pub lock_dir: Option<PathBuf>,

    /// JSON settings file re-read every cycle. Defaults to `<work_dir>/settings.json`.
    pub settings_path: Option<PathBuf>,

    /// External single-file OCR executable
    #[serde(default = "default_ocr_tool_path")]
    pub ocr_tool_path: PathBuf,

    #[serde(default = "default_ocr_dpi")]
    pub ocr_dpi: u32,

    #[serde(default)]
    pub ocr_remove_background: bool,

    /// Hard limit for one tool invocation before it is killed.
    #[serde(default = "default_ocr_timeout_secs")]
    pub ocr_timeout_secs: u64,

    /// Upper bound for `Settings::workers`.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Retries after the first attempt (2 means 3 attempts in total).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default)]
    pub retry_delay_ms: u64,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Age after which a lease whose holder is gone may be reclaimed.
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,

    /// File extension (without dot) of queue documents, matched case-insensitively.
    #[serde(default = "default_document_extension")]
    pub document_extension: String,

    /// Prometheus scrape listener, disabled when unset.
    pub metrics_addr: Option<SocketAddr>,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("ocr-work")
}

fn default_ocr_tool_path() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(r"C:\Program Files\PDF24\pdf24-Ocr.exe")
    } else {
        PathBuf::from("/usr/local/bin/pdf24-ocr")
    }
}

fn default_ocr_dpi() -> u32 {
    300
}

fn default_ocr_timeout_secs() -> u64 {
    600
}

fn default_max_workers() -> usize {
    22
}

fn default_max_retries() -> u32 {
    2
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_lease_ttl_secs() -> u64 {
    900
}

fn default_document_extension() -> String {
    "pdf".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::rooted_at(default_work_dir())
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::prefixed("OCRQ_").from_env()
    }

    /// Default configuration with every folder placed under `work_dir`.
    pub fn rooted_at(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            input_dir: None,
            processing_dir: None,
            output_dir: None,
            error_dir: None,
            duplicate_dir: None,
            archive_dir: None,
            lock_dir: None,
            settings_path: None,
            ocr_tool_path: default_ocr_tool_path(),
            ocr_dpi: default_ocr_dpi(),
            ocr_remove_background: false,
            ocr_timeout_secs: default_ocr_timeout_secs(),
            max_workers: default_max_workers(),
            max_retries: default_max_retries(),
            retry_delay_ms: 0,
            poll_interval_secs: default_poll_interval_secs(),
            lease_ttl_secs: default_lease_ttl_secs(),
            document_extension: default_document_extension(),
            metrics_addr: None,
        }
    }

    pub fn folders(&self) -> FolderSet {
        let under = |dir: &Option<PathBuf>, name: &str| {
            dir.clone().unwrap_or_else(|| self.work_dir.join(name))
        };
        FolderSet {
            input: under(&self.input_dir, "Input"),
            processing: under(&self.processing_dir, "Processing"),
            output: under(&self.output_dir, "Output"),
            error: under(&self.error_dir, "Error"),
            duplicate: under(&self.duplicate_dir, "Duplicate"),
            archive: under(&self.archive_dir, "Originals"),
            extension: self.document_extension.trim_start_matches('.').to_lowercase(),
        }
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.lock_dir
            .clone()
            .unwrap_or_else(|| self.work_dir.join(".locks"))
    }

    pub fn settings_path(&self) -> PathBuf {
        self.settings_path
            .clone()
            .unwrap_or_else(|| self.work_dir.join("settings.json"))
    }

    pub fn leases(&self) -> LeaseManager {
        LeaseManager::new(self.lock_dir(), Duration::from_secs(self.lease_ttl_secs))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            delay: Duration::from_millis(self.retry_delay_ms),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn ocr_timeout(&self) -> Duration {
        Duration::from_secs(self.ocr_timeout_secs)
    }

    /// Worker-count ceiling, never below one.
    pub fn worker_ceiling(&self) -> usize {
        self.max_workers.max(1)
    }
}
