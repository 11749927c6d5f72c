//! Shared harness for queue tests: a temporary queue root and a scripted
//! OCR engine whose failures are planned per file.

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ocr_folder_queue::{
    config::AppConfig,
    models::{
        folders::{FolderSet, Partition},
        settings::Settings,
    },
    services::{
        ocr::{OcrEngine, OcrError, OcrRequest, ToolReport},
        scheduler::{FrontEnd, Scheduler},
    },
};
use tempfile::TempDir;

/// Fail this many times, then succeed.
pub const ALWAYS_FAIL: usize = usize::MAX;

/// Engine that copies input to output, failing according to a per-file plan.
#[derive(Default)]
pub struct ScriptedEngine {
    failures: Mutex<HashMap<String, usize>>,
    attempts: Mutex<HashMap<String, usize>>,
    languages: Mutex<Vec<String>>,
    delay: Duration,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every call for `delay` so overlapping calls become observable.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn fail_times(self, file_name: &str, times: usize) -> Self {
        self.failures.lock().unwrap().insert(file_name.to_string(), times);
        self
    }

    pub fn attempts(&self, file_name: &str) -> usize {
        self.attempts.lock().unwrap().get(file_name).copied().unwrap_or(0)
    }

    pub fn total_attempts(&self) -> usize {
        self.attempts.lock().unwrap().values().sum()
    }

    /// Language tag of every call, in call order.
    pub fn languages(&self) -> Vec<String> {
        self.languages.lock().unwrap().clone()
    }

    /// Highest number of calls seen in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OcrEngine for ScriptedEngine {
    async fn recognize(&self, request: &OcrRequest) -> Result<ToolReport, OcrError> {
        let name = request
            .input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        self.languages.lock().unwrap().push(request.language.clone());
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);

        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let count = attempts.entry(name.clone()).or_insert(0);
            *count += 1;
            *count
        };
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        let planned = self.failures.lock().unwrap().get(&name).copied().unwrap_or(0);
        if attempt <= planned {
            // A crashing tool may leave a partial file behind.
            fs::write(&request.output, b"partial").map_err(OcrError::Spawn)?;
            return Err(OcrError::ExitStatus {
                code: Some(1),
                detail: format!("simulated failure {attempt} for {name}"),
            });
        }
        fs::copy(&request.input, &request.output).map_err(OcrError::Spawn)?;
        Ok(ToolReport::default())
    }
}

/// A queue rooted in a fresh temporary directory.
pub struct TestQueue {
    pub root: TempDir,
    pub config: AppConfig,
    pub folders: FolderSet,
}

impl TestQueue {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let mut config = AppConfig::rooted_at(root.path());
        config.poll_interval_secs = 1;
        config.max_workers = 8;
        let folders = config.folders();
        folders.ensure_all().unwrap();
        Self { root, config, folders }
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    pub fn drop_input(&self, name: &str) -> PathBuf {
        self.put(Partition::Input, name)
    }

    pub fn put(&self, partition: Partition, name: &str) -> PathBuf {
        let path = self.folders.path(partition).join(name);
        fs::write(&path, format!("%PDF-1.7 {name}")).unwrap();
        path
    }

    pub fn list(&self, partition: Partition) -> Vec<String> {
        self.folders.list(partition).unwrap()
    }

    pub fn save_settings(&self, settings: &Settings) {
        settings.save(&self.config.settings_path()).unwrap();
    }

    pub fn scheduler(&self, engine: &Arc<ScriptedEngine>, front_end: FrontEnd) -> Scheduler<ScriptedEngine> {
        Scheduler::from_config(&self.config, Arc::clone(engine), front_end)
    }
}

/// Poll `check` until it holds or a few seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    check()
}
