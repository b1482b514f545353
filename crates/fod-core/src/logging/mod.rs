//! Size-rotating log file writer.
//!
//! The daemon logs through `tracing`; when a log path is configured, this
//! writer backs the subscriber's file layer and rotates the file once it
//! crosses the configured size, keeping a bounded number of numbered
//! siblings (`daemon.log.1` is the most recent rotation).

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;

use crate::config::LoggingConfig;

/// Cloneable handle to a size-rotating log file.
///
/// Implements [`MakeWriter`] so it can back a `tracing_subscriber` fmt
/// layer directly.
#[derive(Debug, Clone)]
pub struct RotatingWriter {
    inner: Arc<Mutex<RotatingFile>>,
}

impl RotatingWriter {
    /// Open (or create) the log file at `path` with the given rotation
    /// settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(path: PathBuf, config: &LoggingConfig) -> io::Result<Self> {
        let file = RotatingFile::open(path, config.max_size, config.max_files)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(file)),
        })
    }
}

impl Write for RotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| io::Error::other("log writer lock poisoned"))?;
        inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| io::Error::other("log writer lock poisoned"))?;
        inner.file.flush()
    }
}

impl<'a> MakeWriter<'a> for RotatingWriter {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[derive(Debug)]
struct RotatingFile {
    path: PathBuf,
    file: File,
    written: u64,
    max_size: u64,
    max_files: u32,
}

impl RotatingFile {
    fn open(path: PathBuf, max_size: u64, max_files: u32) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            file,
            written,
            max_size,
            max_files,
        })
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_size {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn sibling(&self, index: u32) -> PathBuf {
        PathBuf::from(format!("{}.{index}", self.path.display()))
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;

        let oldest = self.sibling(self.max_files);
        if oldest.exists() {
            std::fs::remove_file(&oldest)?;
        }
        for index in (1..self.max_files).rev() {
            let from = self.sibling(index);
            if from.exists() {
                std::fs::rename(&from, self.sibling(index + 1))?;
            }
        }
        std::fs::rename(&self.path, self.sibling(1))?;

        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}
