use chrono::Utc;
use log::{error, info, warn};
use serde::{Serialize, de::DeserializeOwned};
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::RigError;
use crate::record::DataRecord;
use crate::sink::DataSink;

/// Buffered JSON-lines writer.
///
/// Transient flush failures are tolerated (data stays buffered) until
/// `max_flush_failures` happen in a row.
#[derive(Debug)]
pub struct Logger<T>
where
    T: Serialize + DeserializeOwned,
{
    buffer: Vec<T>,
    buffer_size: usize,
    file_path: PathBuf,
    final_format_json: bool,
    flush_failures: usize,
    max_flush_failures: usize,
    finalized: bool,
}

impl<T> Logger<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new<P: Into<PathBuf>>(file_path: P, buffer_size: usize, final_format_json: bool) -> Self {
        let mut path = file_path.into();
        let extension = if final_format_json { "json" } else { "jsonl" };
        if path.extension() != Some(std::ffi::OsStr::new(extension)) {
            path.set_extension(extension);
        }

        Self {
            buffer: Vec::with_capacity(buffer_size),
            buffer_size: buffer_size.max(1),
            file_path: path,
            final_format_json,
            flush_failures: 0,
            max_flush_failures: 10,
            finalized: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    pub fn add(&mut self, data: T) -> Result<(), RigError> {
        self.buffer.push(data);
        if self.buffer.len() >= self.buffer_size {
            self.flush()?;
        }
        Ok(())
    }

    fn write_buffer(&self) -> Result<(), RigError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)?;
        let mut writer = BufWriter::new(file);
        for data in &self.buffer {
            writeln!(writer, "{}", serde_json::to_string(data)?)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), RigError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        match self.write_buffer() {
            Ok(()) => {
                self.flush_failures = 0;
                self.buffer.clear();
                info!("Flushed records to {}", self.file_path.display());
                Ok(())
            }
            Err(e) => {
                self.flush_failures += 1;
                error!(
                    "Flush failure {}/{}: {}",
                    self.flush_failures, self.max_flush_failures, e
                );
                if self.flush_failures % 3 == 0 {
                    warn!(
                        "Experiencing intermittent flush failures ({}/{})",
                        self.flush_failures, self.max_flush_failures
                    );
                }
                if self.flush_failures >= self.max_flush_failures {
                    return Err(RigError::Sink(format!(
                        "{} consecutive flush failures for {}: {}",
                        self.flush_failures,
                        self.file_path.display(),
                        e
                    )));
                }
                Ok(())
            }
        }
    }

    /// Rewrite the JSONL file as one pretty-printed JSON array
    pub fn finalize_as_json(&mut self) -> Result<(), RigError> {
        if !self.final_format_json || self.finalized {
            return Ok(());
        }
        self.flush()?;
        if !self.file_path.exists() {
            return Ok(());
        }

        let content = fs::read_to_string(&self.file_path)?;
        let entries = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str)
            .collect::<Result<Vec<T>, _>>()?;

        fs::write(&self.file_path, serde_json::to_string_pretty(&entries)?)?;
        self.finalized = true;
        info!("Converted {} entries from JSONL to JSON format", entries.len());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// [`DataSink`] writing one file per Z-plane/run into a directory
pub struct ExperimentLogger {
    directory: PathBuf,
    buffer_size: usize,
    final_format_json: bool,
    current: Option<Logger<DataRecord>>,
}

impl ExperimentLogger {
    pub fn new(directory: impl Into<PathBuf>, buffer_size: usize, final_format_json: bool) -> Self {
        Self {
            directory: directory.into(),
            buffer_size,
            final_format_json,
            current: None,
        }
    }

    /// File of the experiment in progress
    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(Logger::path)
    }

    fn close_current(&mut self) -> Result<(), RigError> {
        if let Some(mut logger) = self.current.take() {
            logger.flush()?;
            if !logger.is_empty() {
                return Err(RigError::Sink(format!(
                    "{} records could not be written to {}",
                    logger.len(),
                    logger.path().display()
                )));
            }
            logger.finalize_as_json()?;
        }
        Ok(())
    }
}

impl DataSink for ExperimentLogger {
    fn create_experiment(&mut self, z_plane: f64, run_number: u32) -> Result<(), RigError> {
        self.close_current()?;
        fs::create_dir_all(&self.directory)
            .map_err(|e| RigError::Sink(format!("{}: {}", self.directory.display(), e)))?;

        let name = format!(
            "flume_z{:.2}_run{:03}_{}.{}",
            z_plane,
            run_number,
            Utc::now().format("%Y%m%d_%H%M%S"),
            if self.final_format_json { "json" } else { "jsonl" }
        );
        let logger = Logger::new(self.directory.join(name), self.buffer_size, self.final_format_json);
        info!("Logging experiment to {}", logger.path().display());
        self.current = Some(logger);
        Ok(())
    }

    fn append(&mut self, record: &DataRecord) -> Result<(), RigError> {
        let logger = self
            .current
            .as_mut()
            .ok_or_else(|| RigError::Sink("no experiment open".to_string()))?;
        logger.add(record.clone())
    }

    fn finish(&mut self) -> Result<(), RigError> {
        self.close_current()
    }
}

impl<T> Drop for Logger<T>
where
    T: Serialize + DeserializeOwned,
{
    fn drop(&mut self) {
        let _ = self.flush();
        let _ = self.finalize_as_json();
    }
}
