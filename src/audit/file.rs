//! Rotating JSON Lines audit writer
//!
//! One event per line. `daily` rotation writes `<prefix>-YYYY-MM-DD.jsonl`;
//! `size` rotation writes `<prefix>-YYYY-MM-DD-NNNN.jsonl` and moves to the
//! next number once a file reaches the size limit.

use super::AuditWriter;
use crate::config::{AuditConfig, RotationStrategy};
use crate::error::{DbError, Result};
use crate::types::AuditEvent;
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

struct OpenFile {
    path: PathBuf,
    date: String,
    file: File,
    size: u64,
}

/// Appends audit events to rotating files in one directory
pub struct FileAuditWriter {
    directory: PathBuf,
    prefix: String,
    rotation: RotationStrategy,
    max_file_size: u64,
    current: Mutex<Option<OpenFile>>,
}

impl FileAuditWriter {
    /// Create a writer for `directory`; the directory is created on first write
    pub fn new(directory: impl Into<PathBuf>, config: &AuditConfig) -> Self {
        Self {
            directory: directory.into(),
            prefix: config.file_prefix.clone(),
            rotation: config.rotation_strategy,
            max_file_size: config.max_file_size_bytes().max(1),
            current: Mutex::new(None),
        }
    }

    /// Writer for one schema's subdirectory of `config.log_directory`
    pub fn for_schema(config: &AuditConfig, schema_key: &str) -> Self {
        Self::new(config.schema_directory(schema_key), config)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Path of the file currently open for appends
    pub async fn current_path(&self) -> Option<PathBuf> {
        self.current.lock().await.as_ref().map(|f| f.path.clone())
    }

    fn daily_path(&self, date: &str) -> PathBuf {
        self.directory.join(format!("{}-{}.jsonl", self.prefix, date))
    }

    fn numbered_path(&self, date: &str, counter: u32) -> PathBuf {
        self.directory
            .join(format!("{}-{}-{:04}.jsonl", self.prefix, date, counter))
    }

    async fn file_size(path: &Path) -> u64 {
        tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
    }

    /// First numbered file for `date` that is still below the size limit
    async fn next_sized_path(&self, date: &str) -> PathBuf {
        let mut counter = 1;
        loop {
            let path = self.numbered_path(date, counter);
            if Self::file_size(&path).await < self.max_file_size {
                return path;
            }
            counter += 1;
        }
    }

    fn io_error(&self, path: &Path, e: std::io::Error) -> DbError {
        DbError::AuditWrite {
            writer: self.name().to_string(),
            reason: format!("{}: {}", path.display(), e),
        }
    }

    async fn open(&self, path: PathBuf, date: String) -> Result<OpenFile> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| self.io_error(&path, e))?;
        let size = Self::file_size(&path).await;
        tracing::debug!(path = %path.display(), size, "Audit file opened");
        Ok(OpenFile {
            path,
            date,
            file,
            size,
        })
    }

    /// Make sure `slot` holds the right file for today and for `incoming` bytes
    async fn rotate_if_needed(&self, slot: &mut Option<OpenFile>, incoming: u64) -> Result<()> {
        let date = Utc::now().format("%Y-%m-%d").to_string();

        let stale = match (slot.as_ref(), self.rotation) {
            (None, _) => true,
            (Some(f), _) if f.date != date => true,
            (Some(f), RotationStrategy::Size) => f.size > 0 && f.size + incoming > self.max_file_size,
            (Some(_), RotationStrategy::Daily) => false,
        };
        if !stale {
            return Ok(());
        }

        if let Some(mut old) = slot.take() {
            if let Err(e) = old.file.flush().await {
                tracing::warn!(path = %old.path.display(), error = %e, "Failed to flush rotated audit file");
            }
        }

        let path = match self.rotation {
            RotationStrategy::Daily => self.daily_path(&date),
            RotationStrategy::Size => self.next_sized_path(&date).await,
        };
        *slot = Some(self.open(path, date).await?);
        Ok(())
    }
}

#[async_trait]
impl AuditWriter for FileAuditWriter {
    async fn write_batch(&self, events: &[AuditEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| self.io_error(&self.directory, e))?;

        let mut current = self.current.lock().await;
        for event in events {
            let mut line = serde_json::to_vec(event)?;
            line.push(b'\n');

            self.rotate_if_needed(&mut current, line.len() as u64).await?;
            if let Some(open) = current.as_mut() {
                open.file
                    .write_all(&line)
                    .await
                    .map_err(|e| self.io_error(&open.path, e))?;
                open.size += line.len() as u64;
            }
        }

        if let Some(open) = current.as_mut() {
            open.file
                .flush()
                .await
                .map_err(|e| self.io_error(&open.path, e))?;
        }

        tracing::debug!(
            directory = %self.directory.display(),
            count = events.len(),
            "Audit batch written to file"
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(mut open) = self.current.lock().await.take() {
            open.file
                .flush()
                .await
                .map_err(|e| self.io_error(&open.path, e))?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "file"
    }
}
