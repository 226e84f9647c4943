use log::{debug, info};
use serde::{Serialize, de::DeserializeOwned};
use std::{io::Write, path::PathBuf};

use crate::error::ScanError;

/// Buffered JSONL record log.
///
/// Records are appended one JSON object per line whenever the buffer fills,
/// on [`Logger::flush`], and on drop. With `final_format_json` the file is
/// rewritten as a pretty JSON array when the logger is finalised.
#[derive(Debug)]
pub struct Logger<T>
where
    T: Serialize + DeserializeOwned,
{
    buffer: Vec<T>,
    buffer_size: usize,
    file_path: PathBuf,
    final_format_json: bool,
    finalized: bool,
    flush_failures: usize,
    max_flush_failures: usize,
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
            finalized: false,
            flush_failures: 0,
            max_flush_failures: 10,
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.file_path
    }

    pub fn add(&mut self, data: T) -> Result<(), ScanError> {
        self.buffer.push(data);

        if self.buffer.len() >= self.buffer_size {
            self.flush()?;
        }

        Ok(())
    }

    /// Append the buffered records.
    ///
    /// A failed flush keeps the records buffered and is only reported once
    /// `max_flush_failures` consecutive attempts have failed.
    pub fn flush(&mut self) -> Result<(), ScanError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let result = self.write_buffer();
        match result {
            Ok(()) => {
                debug!(
                    "Flushed {} records to {:?}",
                    self.buffer.len(),
                    self.file_path
                );
                self.flush_failures = 0;
                self.buffer.clear();
                Ok(())
            }
            Err(e) => {
                self.flush_failures += 1;
                log::error!(
                    "Flush failure {}/{}: {}",
                    self.flush_failures,
                    self.max_flush_failures,
                    e
                );

                if self.flush_failures >= self.max_flush_failures {
                    return Err(ScanError::Io {
                        source: std::io::Error::other(e.to_string()),
                        context: format!(
                            "Too many consecutive flush failures ({}) for {:?}",
                            self.max_flush_failures, self.file_path
                        ),
                    });
                }

                // A scan is not aborted for a transient logging problem
                Ok(())
            }
        }
    }

    fn write_buffer(&self) -> Result<(), ScanError> {
        if let Some(parent) = self.file_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| ScanError::Io {
                    source,
                    context: format!("Could not create log directory {:?}", parent),
                })?;
            }
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)
            .map_err(|source| ScanError::Io {
                source,
                context: format!("Failed to open log file {:?}", self.file_path),
            })?;

        let mut writer = std::io::BufWriter::new(file);
        for data in &self.buffer {
            let json_line = serde_json::to_string(data)?;
            writeln!(writer, "{}", json_line)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Flush, then rewrite the JSONL file as a pretty JSON array if the
    /// logger was created with `final_format_json`
    pub fn finalize_as_json(&mut self) -> Result<(), ScanError> {
        self.flush()?;
        if !self.final_format_json || self.finalized {
            return Ok(());
        }
        if !self.file_path.exists() {
            return Ok(());
        }

        let content = std::fs::read_to_string(&self.file_path).map_err(|source| ScanError::Io {
            source,
            context: format!("Could not read JSONL file at {:?}", self.file_path),
        })?;

        let mut entries = Vec::new();
        for line in content.lines() {
            if !line.trim().is_empty() {
                let data: T = serde_json::from_str(line)?;
                entries.push(data);
            }
        }

        let json_output = serde_json::to_string_pretty(&entries)?;
        std::fs::write(&self.file_path, json_output).map_err(|source| ScanError::Io {
            source,
            context: format!("Could not write JSON file at {:?}", self.file_path),
        })?;

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

impl<T> Drop for Logger<T>
where
    T: Serialize + DeserializeOwned,
{
    fn drop(&mut self) {
        let _ = self.finalize_as_json();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PixelSample, SampleRecord};
    use chrono::Utc;

    fn record(col: i32, count: u32) -> SampleRecord {
        SampleRecord {
            timestamp: Utc::now(),
            frame: 0,
            sample: PixelSample::new(col, 0, count),
        }
    }

    #[test]
    fn test_flushes_when_buffer_fills() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = Logger::new(dir.path().join("samples"), 2, false);
        assert_eq!(logger.path().extension().unwrap(), "jsonl");

        logger.add(record(0, 5)).unwrap();
        assert_eq!(logger.len(), 1);
        logger.add(record(1, 6)).unwrap();
        assert!(logger.is_empty());

        let content = std::fs::read_to_string(logger.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: SampleRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.sample.count, 5);
        // Flattened pixel fields
        assert!(lines[1].contains("\"col\":1"));
    }

    #[test]
    fn test_drop_finalizes_json_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("samples.json");
        {
            let mut logger = Logger::new(&path, 100, true);
            for i in 0..3 {
                logger.add(record(i, i as u32 * 10)).unwrap();
            }
        }
        let content = std::fs::read_to_string(&path).unwrap();
        let records: Vec<SampleRecord> = serde_json::from_str(&content).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].sample.count, 20);
    }
}
