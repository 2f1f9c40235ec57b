//! Compute log capture.
//!
//! A capture is a scoped acquisition: [`ComputeLogManager::capture_logs`] returns a
//! [`LogCaptureGuard`] and the capture is marked complete when the guard drops,
//! whether the step finished, failed or was interrupted.

use parking_lot::Mutex;
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

use super::{StorageError, StorageResult};

/// A chunk of captured output starting at the requested cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedLogData {
    pub log_key: Vec<String>,
    pub data: Vec<u8>,
    /// Byte offset to pass as the cursor of the next read
    pub cursor: u64,
}

impl CapturedLogData {
    pub fn as_text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Cloneable handle for writing into an active capture.
#[derive(Clone)]
pub struct LogWriter {
    inner: SharedWriter,
}

impl LogWriter {
    pub fn write_line(&self, line: &str) {
        let mut writer = self.inner.lock();
        if let Err(err) = writeln!(writer, "{line}") {
            warn!(error = %err, "Failed to write captured log line");
        }
    }
}

impl std::fmt::Debug for LogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogWriter").finish_non_exhaustive()
    }
}

/// Active capture; completes on drop.
pub struct LogCaptureGuard {
    log_key: Vec<String>,
    writer: SharedWriter,
    on_complete: Option<Box<dyn FnOnce() + Send>>,
}

impl LogCaptureGuard {
    fn new(
        log_key: Vec<String>,
        writer: Box<dyn Write + Send>,
        on_complete: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        Self {
            log_key,
            writer: Arc::new(Mutex::new(writer)),
            on_complete,
        }
    }

    pub fn log_key(&self) -> &[String] {
        &self.log_key
    }

    pub fn writer(&self) -> LogWriter {
        LogWriter {
            inner: Arc::clone(&self.writer),
        }
    }
}

impl Drop for LogCaptureGuard {
    fn drop(&mut self) {
        if let Err(err) = self.writer.lock().flush() {
            warn!(log_key = ?self.log_key, error = %err, "Failed to flush captured logs");
        }
        if let Some(on_complete) = self.on_complete.take() {
            on_complete();
        }
    }
}

pub trait ComputeLogManager: Send + Sync {
    fn capture_logs(&self, log_key: &[String]) -> StorageResult<LogCaptureGuard>;

    fn get_log_data(
        &self,
        log_key: &[String],
        cursor: u64,
        max_bytes: Option<usize>,
    ) -> StorageResult<CapturedLogData>;

    fn is_capture_complete(&self, log_key: &[String]) -> bool;
}

/// Writes captures to `<base_dir>/<key...>.log` with a `.complete` marker.
#[derive(Debug, Clone)]
pub struct LocalComputeLogManager {
    base_dir: PathBuf,
}

impl LocalComputeLogManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn key_path(&self, log_key: &[String], extension: &str) -> PathBuf {
        let mut path = self.base_dir.clone();
        for part in log_key {
            path.push(part);
        }
        path.set_extension(extension);
        path
    }

    fn log_path(&self, log_key: &[String]) -> PathBuf {
        self.key_path(log_key, "log")
    }

    fn complete_marker_path(&self, log_key: &[String]) -> PathBuf {
        self.key_path(log_key, "complete")
    }
}

fn io_error(path: &Path, err: io::Error) -> StorageError {
    StorageError::io(path.display().to_string(), err)
}

impl ComputeLogManager for LocalComputeLogManager {
    fn capture_logs(&self, log_key: &[String]) -> StorageResult<LogCaptureGuard> {
        let log_path = self.log_path(log_key);
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
        }

        let marker = self.complete_marker_path(log_key);
        if marker.exists() {
            fs::remove_file(&marker).map_err(|e| io_error(&marker, e))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| io_error(&log_path, e))?;

        let on_complete = Box::new(move || {
            if let Err(err) = fs::write(&marker, b"") {
                warn!(marker = %marker.display(), error = %err, "Failed to mark capture complete");
            }
        });

        Ok(LogCaptureGuard::new(
            log_key.to_vec(),
            Box::new(file),
            Some(on_complete),
        ))
    }

    fn get_log_data(
        &self,
        log_key: &[String],
        cursor: u64,
        max_bytes: Option<usize>,
    ) -> StorageResult<CapturedLogData> {
        let log_path = self.log_path(log_key);
        let mut file = match fs::File::open(&log_path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(CapturedLogData {
                    log_key: log_key.to_vec(),
                    data: Vec::new(),
                    cursor,
                })
            }
            Err(err) => return Err(io_error(&log_path, err)),
        };

        file.seek(SeekFrom::Start(cursor))
            .map_err(|e| io_error(&log_path, e))?;
        let mut data = Vec::new();
        match max_bytes {
            Some(max) => file
                .take(max as u64)
                .read_to_end(&mut data)
                .map_err(|e| io_error(&log_path, e))?,
            None => file
                .read_to_end(&mut data)
                .map_err(|e| io_error(&log_path, e))?,
        };

        Ok(CapturedLogData {
            log_key: log_key.to_vec(),
            cursor: cursor + data.len() as u64,
            data,
        })
    }

    fn is_capture_complete(&self, log_key: &[String]) -> bool {
        self.complete_marker_path(log_key).exists()
    }
}

/// Discards captured output.
#[derive(Debug, Clone, Default)]
pub struct NoOpComputeLogManager;

impl ComputeLogManager for NoOpComputeLogManager {
    fn capture_logs(&self, log_key: &[String]) -> StorageResult<LogCaptureGuard> {
        Ok(LogCaptureGuard::new(
            log_key.to_vec(),
            Box::new(io::sink()),
            None,
        ))
    }

    fn get_log_data(
        &self,
        log_key: &[String],
        cursor: u64,
        _max_bytes: Option<usize>,
    ) -> StorageResult<CapturedLogData> {
        Ok(CapturedLogData {
            log_key: log_key.to_vec(),
            data: Vec::new(),
            cursor,
        })
    }

    fn is_capture_complete(&self, _log_key: &[String]) -> bool {
        true
    }
}
