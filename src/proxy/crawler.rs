//! Proxy crawler module: the candidate source.
//!
//! A sources directory holds one `<transport>.txt` file per transport
//! (`http.txt`, `https.txt`, `socks4.txt`, `socks5.txt`). Each line is the URL
//! of a raw proxy list. The crawler downloads every list, extracts endpoints
//! and tags them with the transport named by the file.

use crate::proxy::extractor::extract_endpoints;
use crate::proxy::models::{CandidateBatch, Transport};
use crate::Result;
use futures::stream::{self, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, COOKIE};
use reqwest::{Client, StatusCode};
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default timeout for HTTP requests in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Default number of lists fetched at once
const DEFAULT_CONCURRENCY: usize = 64;

/// Default user agent for HTTP requests
pub const DEFAULT_USER_AGENT: &str = concat!(
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 ",
    "(KHTML, like Gecko) Chrome/114.0.0.0 Safari/537.36"
);

/// Result of crawling a single source
#[derive(Debug, Clone)]
pub struct CrawlResult {
    /// The source that was crawled
    pub source: String,
    /// Endpoints extracted from the source
    pub endpoints: CandidateBatch,
    /// Error message if crawling failed
    pub error: Option<String>,
}

impl CrawlResult {
    /// Create a successful crawl result
    pub fn success(source: String, endpoints: CandidateBatch) -> Self {
        Self {
            source,
            endpoints,
            error: None,
        }
    }

    /// Create a failed crawl result
    pub fn failure(source: String, error: String) -> Self {
        Self {
            source,
            endpoints: CandidateBatch::new(),
            error: Some(error),
        }
    }

    /// Check if the crawl was successful
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Configuration for proxy crawler
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    /// Timeout for HTTP requests
    pub timeout: Duration,
    /// User agent for HTTP requests
    pub user_agent: String,
    /// Cookie header sent with every request, if any
    pub cookie: Option<String>,
    /// Lists fetched at once
    pub concurrency: usize,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            cookie: None,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl CrawlerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = user_agent;
        self
    }

    pub fn with_cookie(mut self, cookie: Option<String>) -> Self {
        self.cookie = cookie;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }
}

/// A proxy list URL and the transport of the proxies it contains
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySource {
    pub url: String,
    pub transport: Transport,
}

impl ProxySource {
    pub fn new(url: &str, transport: Transport) -> Self {
        Self {
            url: url.to_string(),
            transport,
        }
    }
}

/// Read every `<transport>.txt` file of `dir` into a list of sources.
///
/// Blank lines and `#` comments are skipped, files named after an unknown
/// transport are ignored with a warning. A missing directory yields no
/// sources.
pub fn load_sources<P: AsRef<Path>>(dir: P) -> Result<Vec<ProxySource>> {
    let dir = dir.as_ref();
    if !dir.exists() {
        warn!("sources directory {} does not exist", dir.display());
        return Ok(Vec::new());
    }

    let mut files: Vec<_> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "txt"))
        .collect();
    files.sort();

    let mut sources = Vec::new();
    for file in files {
        let Some(stem) = file.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let transport = match stem.parse::<Transport>() {
            Ok(transport) => transport,
            Err(e) => {
                warn!("skipping {}: {}", file.display(), e);
                continue;
            }
        };
        let content = fs::read_to_string(&file)?;
        let before = sources.len();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let source = ProxySource::new(line, transport);
            if !sources.contains(&source) {
                sources.push(source);
            }
        }
        debug!("loaded {} {} sources from {}", sources.len() - before, transport, file.display());
    }
    Ok(sources)
}

/// Proxy crawler for fetching candidate lists
pub struct ProxyCrawler {
    config: CrawlerConfig,
    client: Client,
}

impl ProxyCrawler {
    /// Create a new proxy crawler with default configuration
    pub fn new() -> Result<Self> {
        Self::with_config(CrawlerConfig::default())
    }

    /// Create a new proxy crawler with custom configuration
    pub fn with_config(config: CrawlerConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(cookie) = &config.cookie {
            let mut value = HeaderValue::from_str(cookie)?;
            value.set_sensitive(true);
            headers.insert(COOKIE, value);
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .default_headers(headers)
            .build()?;

        Ok(Self { config, client })
    }

    /// Fetch one list and extract its endpoints
    pub async fn crawl_source(&self, source: &ProxySource) -> Result<CandidateBatch> {
        let response = self.client.get(&source.url).send().await?;
        let status = response.status();
        if status != StatusCode::OK {
            anyhow::bail!("HTTP status: {}", status);
        }
        let content = response.text().await?;
        Ok(extract_endpoints(&content, source.transport))
    }

    /// Fetch many lists concurrently, returning results for each
    pub async fn crawl_sources_with_results(&self, sources: &[ProxySource]) -> Vec<CrawlResult> {
        stream::iter(sources)
            .map(|source| async move {
                let start = Instant::now();
                match self.crawl_source(source).await {
                    Ok(endpoints) => {
                        debug!(
                            "✓ {} endpoints from {} in {:.2}s",
                            endpoints.len(),
                            source.url,
                            start.elapsed().as_secs_f64()
                        );
                        CrawlResult::success(source.url.clone(), endpoints)
                    }
                    Err(e) => {
                        warn!("✗ {}: {}", source.url, e);
                        CrawlResult::failure(source.url.clone(), e.to_string())
                    }
                }
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await
    }

    /// Fetch every source and merge what they yield into one batch
    pub async fn collect(&self, sources: &[ProxySource]) -> CandidateBatch {
        let start = Instant::now();
        let results = self.crawl_sources_with_results(sources).await;

        let failed = results.iter().filter(|r| !r.is_success()).count();
        let mut batch = CandidateBatch::new();
        for result in results {
            batch.extend(result.endpoints);
        }

        info!(
            "collected {} candidates from {} sources ({} failed) in {:.2}s",
            batch.len(),
            sources.len(),
            failed,
            start.elapsed().as_secs_f64()
        );
        batch
    }
}
