//! Application settings: defaults, then an optional TOML file, then
//! `PROXY_SIEVE_*` environment variables.

use crate::proxy::checker::{CheckerConfig, DEFAULT_VERIFICATION_URL};
use crate::proxy::coordinator::CoordinatorOptions;
use crate::proxy::crawler::{CrawlerConfig, DEFAULT_USER_AGENT};
use crate::proxy::governor::{DEFAULT_MAX_CONNECTIONS, MAX_CONNECTIONS_WARN_THRESHOLD};
use crate::Result;
use anyhow::Context;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// File looked up in the working directory when no `--config` is given
pub const DEFAULT_CONFIG_FILE: &str = "proxy-sieve.toml";

const ENV_PREFIX: &str = "PROXY_SIEVE";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub checker: CheckerSettings,
    pub crawler: CrawlerSettings,
    pub paths: PathSettings,
    pub sink: SinkSettings,
    pub schedule: ScheduleSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CheckerSettings {
    pub max_connections: usize,
    pub timeout_secs: f64,
    pub batch_deadline_secs: Option<f64>,
    pub verification_url: String,
    pub double_check: bool,
    pub working_only: bool,
}

impl Default for CheckerSettings {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            timeout_secs: 10.0,
            batch_deadline_secs: None,
            verification_url: DEFAULT_VERIFICATION_URL.to_string(),
            double_check: false,
            working_only: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CrawlerSettings {
    pub timeout_secs: u64,
    pub user_agent: String,
    pub cookie: Option<String>,
    pub max_connections: usize,
}

impl Default for CrawlerSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            cookie: None,
            max_connections: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PathSettings {
    pub sources_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            sources_dir: PathBuf::from("sources"),
            output_dir: PathBuf::from("proxies"),
        }
    }
}

impl PathSettings {
    pub fn unchecked_file(&self) -> PathBuf {
        self.output_dir.join("unchecked_proxies.txt")
    }

    pub fn verified_file(&self, format: SinkFormat) -> PathBuf {
        match format {
            SinkFormat::Jsonl => self.output_dir.join("parsed.jsonl"),
            SinkFormat::Lines | SinkFormat::Sqlite => self.output_dir.join("parsed.txt"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SinkFormat {
    #[default]
    Lines,
    Jsonl,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SinkSettings {
    pub format: SinkFormat,
    pub database_url: String,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            format: SinkFormat::Lines,
            database_url: "sqlite://proxies.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScheduleSettings {
    pub interval_secs: u64,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self { interval_secs: 240 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Settings {
    /// Load settings. An explicit `path` must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path.to_path_buf()).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let settings: Settings = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Reject values the pipeline cannot run with; warn on risky ones
    pub fn validate(&self) -> Result<()> {
        let checker = &self.checker;
        if checker.max_connections == 0 {
            anyhow::bail!("checker.max_connections must be at least 1");
        }
        positive_secs("checker.timeout_secs", checker.timeout_secs)?;
        if let Some(deadline) = checker.batch_deadline_secs {
            positive_secs("checker.batch_deadline_secs", deadline)?;
        }
        Url::parse(&checker.verification_url).with_context(|| {
            format!("checker.verification_url `{}` is not a URL", checker.verification_url)
        })?;
        if self.crawler.timeout_secs == 0 {
            anyhow::bail!("crawler.timeout_secs must be at least 1");
        }
        if checker.max_connections > MAX_CONNECTIONS_WARN_THRESHOLD {
            warn!(
                "checker.max_connections = {} may exhaust the socket/file descriptor \
                 limit of this host",
                checker.max_connections
            );
        }
        Ok(())
    }

    pub fn checker_config(&self) -> Result<CheckerConfig> {
        Ok(CheckerConfig::new()
            .with_timeout(positive_secs("checker.timeout_secs", self.checker.timeout_secs)?)
            .with_verification_url(self.checker.verification_url.clone()))
    }

    pub fn coordinator_options(&self) -> Result<CoordinatorOptions> {
        let deadline = self
            .checker
            .batch_deadline_secs
            .map(|secs| positive_secs("checker.batch_deadline_secs", secs))
            .transpose()?;
        Ok(CoordinatorOptions::new()
            .with_deadline(deadline)
            .with_working_only(self.checker.working_only))
    }

    pub fn crawler_config(&self) -> CrawlerConfig {
        CrawlerConfig::new()
            .with_timeout(Duration::from_secs(self.crawler.timeout_secs))
            .with_user_agent(self.crawler.user_agent.clone())
            .with_cookie(self.crawler.cookie.clone())
            .with_concurrency(self.crawler.max_connections)
    }
}

/// A strictly positive number of seconds that fits in a `Duration`
fn positive_secs(key: &str, secs: f64) -> Result<Duration> {
    match Duration::try_from_secs_f64(secs) {
        Ok(duration) if !duration.is_zero() => Ok(duration),
        _ => anyhow::bail!("{} must be a positive number of seconds, got {}", key, secs),
    }
}
