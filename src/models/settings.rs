use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use garde::Validate;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

const DEFAULT_WORKERS: usize = 10;
const DEFAULT_LANGUAGE: &str = "eng+kan";

/// Operator-tunable settings, snapshotted at the start of every cycle.
///
/// The interactive front-end writes this file; the background loop picks the
/// change up on its next cycle without a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Settings {
    #[garde(skip)]
    pub auto_start: bool,

    #[garde(skip)]
    pub workers: usize,

    /// Tesseract-style language tag, e.g. `eng` or `eng+kan`.
    #[garde(length(min = 1, max = 64), custom(language_tag))]
    pub language: String,

    #[garde(skip)]
    pub deskew: bool,

    /// Remove the source once its output is placed; otherwise archive it.
    #[garde(skip)]
    pub delete_input: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_start: false,
            workers: DEFAULT_WORKERS,
            language: DEFAULT_LANGUAGE.to_string(),
            deskew: true,
            delete_input: true,
        }
    }
}

fn language_tag(value: &str, _ctx: &()) -> garde::Result {
    if value
        .split('+')
        .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_alphabetic() || c == '_'))
    {
        Ok(())
    } else {
        Err(garde::Error::new("expected language codes joined by '+'"))
    }
}

impl Settings {
    /// Read a snapshot from `path`, never failing.
    ///
    /// A missing file yields defaults. Unreadable or malformed data is logged
    /// and replaced by defaults. Missing fields take their default, an invalid
    /// language falls back to the default language, and `workers` is clamped
    /// into `1..=max_workers`.
    pub fn load(path: &Path, max_workers: usize) -> Self {
        let settings = match Self::read(path) {
            Ok(Some(settings)) => settings,
            Ok(None) => {
                debug!(path = %path.display(), "No settings file, using defaults");
                Self::default()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Settings unreadable, using defaults");
                Self::default()
            }
        };
        settings.sanitized(max_workers)
    }

    fn read(path: &Path) -> Result<Option<Self>, SettingsError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SettingsError::io(path, e)),
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    fn sanitized(mut self, max_workers: usize) -> Self {
        if let Err(report) = self.validate() {
            warn!(
                language = %self.language,
                error = %report,
                "Invalid OCR language in settings, using default"
            );
            self.language = DEFAULT_LANGUAGE.to_string();
        }
        let ceiling = max_workers.max(1);
        if self.workers == 0 || self.workers > ceiling {
            warn!(requested = self.workers, ceiling, "Worker count out of range, clamping");
            self.workers = self.workers.clamp(1, ceiling);
        }
        self
    }

    /// Persist as pretty JSON, replacing the previous file in one rename.
    ///
    /// Each save writes its own temp file, so concurrent saves never mix
    /// their bodies; the last rename wins.
    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| SettingsError::io(dir, e))?;
        }
        let body = serde_json::to_string_pretty(self)?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "settings.json".to_string());
        let temp = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4()));
        fs::write(&temp, body).map_err(|e| SettingsError::io(&temp, e))?;
        if let Err(e) = fs::rename(&temp, path) {
            let _ = fs::remove_file(&temp);
            return Err(SettingsError::io(path, e));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Settings I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed settings: {0}")]
    Parse(#[from] serde_json::Error),
}

impl SettingsError {
    fn io(path: &Path, source: io::Error) -> Self {
        SettingsError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("settings.json"), 22);
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"auto_start": true, "workers": 4, "theme": "dark"}"#).unwrap();

        let settings = Settings::load(&path, 22);
        assert!(settings.auto_start);
        assert_eq!(settings.workers, 4);
        assert_eq!(settings.language, "eng+kan");
        assert!(settings.deskew);
    }

    #[test]
    fn test_malformed_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(Settings::load(&path, 22), Settings::default());
    }

    #[test]
    fn test_workers_clamped_and_language_checked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"workers": 64, "language": "eng; rm -rf"}"#).unwrap();
        let settings = Settings::load(&path, 8);
        assert_eq!(settings.workers, 8);
        assert_eq!(settings.language, "eng+kan");

        fs::write(&path, r#"{"workers": 0, "language": "deu+chi_sim"}"#).unwrap();
        let settings = Settings::load(&path, 8);
        assert_eq!(settings.workers, 1);
        assert_eq!(settings.language, "deu+chi_sim");
    }

    #[test]
    fn test_save_then_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let settings = Settings {
            auto_start: true,
            workers: 3,
            language: "eng".to_string(),
            deskew: false,
            delete_input: false,
        };
        settings.save(&path).unwrap();
        assert_eq!(Settings::load(&path, 22), settings);
    }

    #[test]
    fn test_concurrent_saves_leave_one_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let writers: Vec<_> = (1..=8)
            .map(|workers| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let settings = Settings {
                        workers,
                        language: "eng".repeat(workers),
                        ..Settings::default()
                    };
                    for _ in 0..20 {
                        settings.save(&path).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let body = fs::read_to_string(&path).unwrap();
        let saved: Settings = serde_json::from_str(&body).unwrap();
        assert_eq!(saved.language, "eng".repeat(saved.workers));
        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}
