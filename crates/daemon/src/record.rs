//! Persisted identity of a running daemon.
//!
//! The record file holds `Key=Value` lines:
//!
//! ```text
//! ProcessId=4242
//! ListenFolder=/var/spool/labels
//! Width=100
//! Height=150
//! Unit=mm
//! Dpi=203
//! StartedAt=2026-03-01T08:00:00+00:00
//! ```
//!
//! A file holding only a bare process id is also accepted. Writes go through
//! a temp file and rename so readers never see a partial record.

use crate::config::{Config, Unit};
use crate::convert::write_atomic;
use crate::process;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

pub const RECORD_FILE_NAME: &str = "label-pdf-daemon.pid";
pub const LOG_FILE_NAME: &str = "label-pdf-daemon.log";

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed daemon record: {0}")]
    Parse(String),
}

/// What a running daemon writes about itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DaemonRecord {
    pub process_id: u32,
    pub listen_folder: PathBuf,
    /// Fixed width in `unit`, absent in per-label mode
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub unit: Unit,
    pub density_dpi: u32,
    pub started_at: Option<DateTime<Utc>>,
}

impl DaemonRecord {
    /// Record for this process running with `cfg`.
    pub fn for_current_process(cfg: &Config, listen_folder: &Path) -> Self {
        Self {
            process_id: std::process::id(),
            listen_folder: listen_folder.to_path_buf(),
            width: cfg.label.width,
            height: cfg.label.height,
            unit: cfg.label.unit,
            density_dpi: cfg.label.dpi,
            started_at: Some(Utc::now()),
        }
    }

    pub fn to_file_contents(&self) -> String {
        let opt = |v: Option<f64>| v.map(|v| v.to_string()).unwrap_or_default();
        format!(
            "ProcessId={}\nListenFolder={}\nWidth={}\nHeight={}\nUnit={}\nDpi={}\nStartedAt={}\n",
            self.process_id,
            self.listen_folder.display(),
            opt(self.width),
            opt(self.height),
            self.unit,
            self.density_dpi,
            self.started_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
        )
    }

    pub fn parse(contents: &str) -> Result<Self, RecordError> {
        let trimmed = contents.trim();
        if let Ok(pid) = trimmed.parse::<u32>() {
            return Self::bare(pid);
        }

        let mut process_id = None;
        let mut record = Self {
            process_id: 0,
            listen_folder: PathBuf::new(),
            width: None,
            height: None,
            unit: Unit::Mm,
            density_dpi: 0,
            started_at: None,
        };

        for line in trimmed.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "ProcessId" => {
                    process_id = Some(value.parse::<u32>().map_err(|_| {
                        RecordError::Parse(format!("invalid ProcessId {:?}", value))
                    })?)
                }
                "ListenFolder" => record.listen_folder = PathBuf::from(value),
                "Width" => record.width = value.parse().ok(),
                "Height" => record.height = value.parse().ok(),
                "Unit" => record.unit = Unit::parse_lossy(value),
                "Dpi" => record.density_dpi = value.parse().unwrap_or(0),
                "StartedAt" => {
                    record.started_at = DateTime::parse_from_rfc3339(value)
                        .ok()
                        .map(|t| t.with_timezone(&Utc))
                }
                _ => {}
            }
        }

        match process_id {
            Some(pid) if pid > 0 => Ok(Self {
                process_id: pid,
                ..record
            }),
            Some(_) => Err(RecordError::Parse("ProcessId must be positive".into())),
            None => Err(RecordError::Parse("missing ProcessId".into())),
        }
    }

    fn bare(pid: u32) -> Result<Self, RecordError> {
        if pid == 0 {
            return Err(RecordError::Parse("ProcessId must be positive".into()));
        }
        Ok(Self {
            process_id: pid,
            listen_folder: PathBuf::new(),
            width: None,
            height: None,
            unit: Unit::Mm,
            density_dpi: 0,
            started_at: None,
        })
    }
}

impl std::fmt::Display for DaemonRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "PID:        {}", self.process_id)?;
        writeln!(f, "Folder:     {}", self.listen_folder.display())?;
        match (self.width, self.height) {
            (Some(w), Some(h)) => writeln!(f, "Dimensions: {} x {} {}", w, h, self.unit)?,
            _ => writeln!(f, "Dimensions: per label")?,
        }
        writeln!(f, "DPI:        {}", self.density_dpi)?;
        match self.started_at {
            Some(t) => write!(f, "Started:    {}", t.to_rfc3339()),
            None => write!(f, "Started:    unknown"),
        }
    }
}

/// Default directory for the record and log file.
///
/// `$XDG_RUNTIME_DIR/label-pdf-daemon` or `/var/run/label-pdf-daemon` on
/// Unix-like systems, falling back to the temp dir when neither is usable;
/// the temp dir elsewhere.
pub fn default_record_dir() -> PathBuf {
    #[cfg(unix)]
    {
        let candidates = std::env::var_os("XDG_RUNTIME_DIR")
            .map(|d| PathBuf::from(d).join("label-pdf-daemon"))
            .into_iter()
            .chain(std::iter::once(PathBuf::from("/var/run/label-pdf-daemon")));
        for dir in candidates {
            if std::fs::create_dir_all(&dir).is_ok() {
                return dir;
            }
        }
    }
    std::env::temp_dir().join("label-pdf-daemon")
}

/// Location of the record file and the operations on it.
#[derive(Debug, Clone)]
pub struct RecordStore {
    dir: PathBuf,
}

impl RecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store in the configured `pid_dir`, or the platform default.
    pub fn from_config(cfg: &Config) -> Self {
        Self::new(
            cfg.daemon
                .pid_dir
                .clone()
                .unwrap_or_else(default_record_dir),
        )
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(RECORD_FILE_NAME)
    }

    /// Log file of the background process, beside the record.
    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE_NAME)
    }

    pub fn write(&self, record: &DaemonRecord) -> Result<(), RecordError> {
        let path = self.path();
        std::fs::create_dir_all(&self.dir).map_err(|source| RecordError::Io {
            path: self.dir.clone(),
            source,
        })?;
        write_atomic(&path, record.to_file_contents().as_bytes())
            .map_err(|source| RecordError::Io { path, source })
    }

    /// Read the record as stored, without checking the process.
    pub fn read(&self) -> Result<Option<DaemonRecord>, RecordError> {
        let path = self.path();
        match std::fs::read_to_string(&path) {
            Ok(contents) => DaemonRecord::parse(&contents).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(RecordError::Io { path, source }),
        }
    }

    /// The record, if it names a live process.
    ///
    /// Unreadable records and records of dead processes are removed and
    /// reported as absent.
    pub fn load_live(&self) -> Option<DaemonRecord> {
        match self.read() {
            Ok(Some(record)) if process::is_alive(record.process_id) => Some(record),
            Ok(Some(record)) => {
                info!(pid = record.process_id, "removing stale daemon record");
                self.discard();
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!("discarding unreadable daemon record: {}", e);
                self.discard();
                None
            }
        }
    }

    pub fn remove(&self) -> Result<(), RecordError> {
        let path = self.path();
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(RecordError::Io { path, source }),
        }
    }

    /// Remove the record only if it still names `pid`.
    pub fn remove_if_owned(&self, pid: u32) -> Result<bool, RecordError> {
        match self.read() {
            Ok(Some(record)) if record.process_id == pid => self.remove().map(|_| true),
            Ok(_) => Ok(false),
            Err(RecordError::Parse(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn discard(&self) {
        if let Err(e) = self.remove() {
            warn!("could not remove daemon record: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample(pid: u32) -> DaemonRecord {
        DaemonRecord {
            process_id: pid,
            listen_folder: PathBuf::from("/var/spool/labels"),
            width: Some(4.0),
            height: Some(6.0),
            unit: Unit::In,
            density_dpi: 300,
            started_at: DateTime::parse_from_rfc3339("2026-03-01T08:00:00+00:00")
                .ok()
                .map(|t| t.with_timezone(&Utc)),
        }
    }

    #[test]
    fn test_file_format() {
        let text = sample(4242).to_file_contents();
        assert!(text.starts_with("ProcessId=4242\n"));
        assert!(text.contains("ListenFolder=/var/spool/labels\n"));
        assert!(text.contains("Unit=in\n"));
        assert!(text.contains("Dpi=300\n"));
        assert_eq!(DaemonRecord::parse(&text).unwrap(), sample(4242));
    }

    #[test]
    fn test_parse_bare_pid() {
        let record = DaemonRecord::parse("  1234\n").unwrap();
        assert_eq!(record.process_id, 1234);
        assert_eq!(record.listen_folder, PathBuf::new());
    }

    #[test]
    fn test_parse_rejects_bad_records() {
        assert!(DaemonRecord::parse("").is_err());
        assert!(DaemonRecord::parse("0").is_err());
        assert!(DaemonRecord::parse("ProcessId=abc").is_err());
        assert!(DaemonRecord::parse("ListenFolder=/x\n").is_err());
        assert!(DaemonRecord::parse("ProcessId=-5").is_err());
    }

    #[test]
    fn test_per_label_record_roundtrip() {
        let mut record = sample(77);
        record.width = None;
        record.height = None;
        let back = DaemonRecord::parse(&record.to_file_contents()).unwrap();
        assert_eq!(back.width, None);
        assert!(back.to_string().contains("per label"));
    }

    #[test]
    fn test_store_write_read_remove() {
        let temp_dir = TempDir::new().unwrap();
        let store = RecordStore::new(temp_dir.path().join("run"));
        assert!(store.read().unwrap().is_none());

        store.write(&sample(99)).unwrap();
        assert_eq!(store.read().unwrap(), Some(sample(99)));

        store.remove().unwrap();
        store.remove().unwrap();
        assert!(!store.path().exists());
    }

    #[test]
    fn test_load_live_keeps_record_of_live_process() {
        let temp_dir = TempDir::new().unwrap();
        let store = RecordStore::new(temp_dir.path());
        store.write(&sample(std::process::id())).unwrap();

        let live = store.load_live().unwrap();
        assert_eq!(live.process_id, std::process::id());
        assert!(store.path().exists());
    }

    #[test]
    fn test_load_live_removes_stale_record() {
        let temp_dir = TempDir::new().unwrap();
        let store = RecordStore::new(temp_dir.path());
        store.write(&sample(4_000_000_000)).unwrap();

        assert!(store.load_live().is_none());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_load_live_removes_garbage() {
        let temp_dir = TempDir::new().unwrap();
        let store = RecordStore::new(temp_dir.path());
        std::fs::write(store.path(), "not a record").unwrap();

        assert!(store.load_live().is_none());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_remove_if_owned() {
        let temp_dir = TempDir::new().unwrap();
        let store = RecordStore::new(temp_dir.path());
        store.write(&sample(10)).unwrap();

        assert!(!store.remove_if_owned(11).unwrap());
        assert!(store.path().exists());
        assert!(store.remove_if_owned(10).unwrap());
        assert!(!store.path().exists());
    }
}
