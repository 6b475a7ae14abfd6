//! Result sinks: where verified proxies go as soon as they are confirmed

use crate::proxy::models::ValidationResult;
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Receives verified endpoints one at a time
#[async_trait]
pub trait ResultSink: Send {
    /// Accept one endpoint in canonical `transport://host:port` form
    async fn accept(&mut self, proxy: &str) -> Result<()>;

    /// Accept a full result; sinks that store more than the endpoint override this
    async fn accept_result(&mut self, result: &ValidationResult) -> Result<()> {
        self.accept(&result.endpoint.to_string()).await
    }

    /// Called once after the last result of a run
    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

fn create_truncated(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    Ok(file)
}

/// Appends one canonical proxy per line; the file is emptied when opened
pub struct LineFileSink {
    path: PathBuf,
    writer: BufWriter<File>,
    written: usize,
}

impl LineFileSink {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let writer = BufWriter::new(create_truncated(&path)?);
        Ok(Self {
            path,
            writer,
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn written(&self) -> usize {
        self.written
    }
}

#[async_trait]
impl ResultSink for LineFileSink {
    async fn accept(&mut self, proxy: &str) -> Result<()> {
        writeln!(self.writer, "{}", proxy)?;
        // Flush per line so a crash mid-run keeps what was verified so far
        self.writer.flush()?;
        self.written += 1;
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct JsonRecord<'a> {
    proxy: &'a str,
    reported_ip: Option<&'a str>,
    latency_ms: Option<u64>,
    checked_at: String,
    run_id: String,
}

/// One JSON object per line with the exit IP and latency of each proxy
pub struct JsonlSink {
    path: PathBuf,
    writer: BufWriter<File>,
    run_id: Uuid,
}

impl JsonlSink {
    pub fn create<P: AsRef<Path>>(path: P, run_id: Uuid) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let writer = BufWriter::new(create_truncated(&path)?);
        Ok(Self {
            path,
            writer,
            run_id,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_record(&mut self, record: &JsonRecord<'_>) -> Result<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

#[async_trait]
impl ResultSink for JsonlSink {
    async fn accept(&mut self, proxy: &str) -> Result<()> {
        let record = JsonRecord {
            proxy,
            reported_ip: None,
            latency_ms: None,
            checked_at: Utc::now().to_rfc3339(),
            run_id: self.run_id.to_string(),
        };
        self.write_record(&record)
    }

    async fn accept_result(&mut self, result: &ValidationResult) -> Result<()> {
        let proxy = result.endpoint.to_string();
        let record = JsonRecord {
            proxy: &proxy,
            reported_ip: result.reported_ip.as_deref(),
            latency_ms: result.latency_ms(),
            checked_at: Utc::now().to_rfc3339(),
            run_id: self.run_id.to_string(),
        };
        self.write_record(&record)
    }

    async fn finish(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Keeps accepted proxies in memory
#[derive(Debug, Default, Clone)]
pub struct VecSink {
    pub accepted: Vec<String>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultSink for VecSink {
    async fn accept(&mut self, proxy: &str) -> Result<()> {
        self.accepted.push(proxy.to_string());
        Ok(())
    }
}
