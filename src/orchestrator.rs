//! Run cycle: collect candidates, validate them, stream the survivors to a sink

use crate::proxy::checker::Probe;
use crate::proxy::coordinator::{BatchCoordinator, BatchSummary};
use crate::proxy::crawler::{load_sources, ProxyCrawler};
use crate::proxy::models::{CandidateBatch, Transport, VerifiedSet};
use crate::proxy::parser::ProxyParser;
use crate::sink::ResultSink;
use crate::Result;
use futures::StreamExt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// What one check produced
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub candidates: usize,
    pub verified: usize,
    pub summary: BatchSummary,
    pub elapsed: Duration,
}

impl CycleReport {
    pub fn success_rate(&self) -> f64 {
        if self.candidates == 0 {
            0.0
        } else {
            self.verified as f64 / self.candidates as f64 * 100.0
        }
    }
}

/// Where a cycle reads and writes its files
#[derive(Debug, Clone)]
pub struct CyclePaths {
    pub sources_dir: PathBuf,
    pub unchecked_file: PathBuf,
}

/// Ties the candidate source, the coordinator and a result sink together
pub struct Orchestrator<P: Probe> {
    coordinator: BatchCoordinator<P>,
    crawler: ProxyCrawler,
    paths: CyclePaths,
    double_check: bool,
}

impl<P: Probe> Orchestrator<P> {
    pub fn new(coordinator: BatchCoordinator<P>, crawler: ProxyCrawler, paths: CyclePaths) -> Self {
        Self {
            coordinator,
            crawler,
            paths,
            double_check: false,
        }
    }

    pub fn with_double_check(mut self, double_check: bool) -> Self {
        self.double_check = double_check;
        self
    }

    pub fn coordinator(&self) -> &BatchCoordinator<P> {
        &self.coordinator
    }

    /// Crawl the configured sources and write the unchecked candidate list
    pub async fn collect(&self) -> Result<CandidateBatch> {
        let sources = load_sources(&self.paths.sources_dir)?;
        if sources.is_empty() {
            warn!("no sources found in {}", self.paths.sources_dir.display());
            return Ok(CandidateBatch::new());
        }

        let batch = self.crawler.collect(&sources).await;
        if batch.is_empty() {
            warn!("⚠️ no proxies found in this cycle");
            return Ok(batch);
        }

        let written = ProxyParser::save_to_file(batch.iter(), &self.paths.unchecked_file)?;
        info!(
            "💾 saved {} unchecked proxies to {}",
            written,
            self.paths.unchecked_file.display()
        );
        Ok(batch)
    }

    /// Validate a candidate list file
    pub async fn check_file<F, Fut>(
        &self,
        path: &Path,
        default_transport: Transport,
        open_sink: F,
    ) -> Result<CycleReport>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Box<dyn ResultSink>>>,
    {
        if !path.exists() {
            warn!("⚠️ no unchecked proxies at {}", path.display());
            return Ok(CycleReport::default());
        }
        let batch = ProxyParser::parse_file(path, default_transport)?;
        info!("📂 loaded {} candidates from {}", batch.len(), path.display());
        self.check(batch, open_sink).await
    }

    /// Validate `batch` into a sink opened by `open_sink`.
    ///
    /// An empty batch leaves the previous results alone: the sink is only
    /// opened, and so emptied, once there is something to validate.
    pub async fn check<F, Fut>(&self, batch: CandidateBatch, open_sink: F) -> Result<CycleReport>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Box<dyn ResultSink>>>,
    {
        if batch.is_empty() {
            info!("nothing to validate, keeping previous results");
            return Ok(CycleReport::default());
        }
        let mut sink = open_sink().await?;
        self.check_into(batch, sink.as_mut()).await
    }

    /// Validate `batch`, handing each newly verified endpoint to `sink` as it arrives
    pub async fn check_into(
        &self,
        batch: CandidateBatch,
        sink: &mut dyn ResultSink,
    ) -> Result<CycleReport> {
        let start = Instant::now();
        let candidates = batch.len();

        let mut stream = if self.double_check {
            self.coordinator.double_check(batch).await
        } else {
            self.coordinator.validate(batch)
        };

        let mut verified = VerifiedSet::new();
        while let Some(result) = stream.next().await {
            if verified.record(&result) {
                sink.accept_result(&result).await?;
            }
        }
        let summary = stream.summary().await;
        sink.finish().await?;

        let report = CycleReport {
            candidates,
            verified: verified.len(),
            summary,
            elapsed: start.elapsed(),
        };
        info!(
            "📊 {}/{} working ({:.1}% success rate) in {:.2}s",
            report.verified,
            report.candidates,
            report.success_rate(),
            report.elapsed.as_secs_f64()
        );
        Ok(report)
    }

    /// Collect then check. Zero candidates is a successful, empty cycle that
    /// keeps the previous output.
    pub async fn run_cycle<F, Fut>(&self, open_sink: F) -> Result<CycleReport>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Box<dyn ResultSink>>>,
    {
        let start = Instant::now();
        info!("🚀 starting proxy cycle");
        let batch = self.collect().await?;
        let mut report = self.check(batch, open_sink).await?;
        report.elapsed = start.elapsed();
        info!("🎉 cycle finished in {:.2}s", report.elapsed.as_secs_f64());
        Ok(report)
    }

    /// Run cycles until `cancel` fires or Ctrl-C is pressed.
    ///
    /// `make_sink` opens a fresh sink for every cycle that has candidates to
    /// validate. A failed cycle is logged and retried after the interval.
    pub async fn run_forever<F, Fut>(
        &self,
        interval: Duration,
        cancel: CancellationToken,
        mut make_sink: F,
    ) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Box<dyn ResultSink>>>,
    {
        let ctrl_c = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("🛑 interrupt received, stopping");
                ctrl_c.cancel();
            }
        });

        let mut cycle = 0u64;
        loop {
            cycle += 1;
            info!("🔄 cycle #{}", cycle);

            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = self.run_cycle(&mut make_sink) => outcome,
            };
            if let Err(e) = outcome {
                error!("❌ cycle #{} failed: {:#}", cycle, e);
            }

            info!("⏳ next cycle in {}s", interval.as_secs());
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        Ok(())
    }
}
