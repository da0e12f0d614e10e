use crate::models::{Interval, Schema};
use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub scraper: ScraperConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// Browser session and retry configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScraperConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_navigation_timeout_secs")]
    pub navigation_timeout_secs: u64,

    #[serde(default = "default_table_timeout_secs")]
    pub table_timeout_secs: u64,

    #[serde(default = "default_table_selector")]
    pub table_selector: String,

    #[serde(default = "default_consent_selectors")]
    pub consent_selectors: Vec<String>,

    /// How long to watch for a late consent overlay before the table wait.
    #[serde(default = "default_consent_timeout_ms")]
    pub consent_timeout_ms: u64,

    #[serde(default = "default_true")]
    pub headless: bool,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Total attempts per target.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,

    #[serde(default)]
    pub jitter_ms: u64,
}

/// Batch configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub interval: Interval,

    #[serde(default)]
    pub schema: Schema,

    /// Defaults to Jan 1 of the current year.
    #[serde(default)]
    pub start: Option<NaiveDate>,

    /// Defaults to today.
    #[serde(default)]
    pub end: Option<NaiveDate>,

    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default)]
    pub run_timeout_secs: Option<u64>,
}

/// Output file configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_dataset_file")]
    pub dataset_file: String,

    #[serde(default = "default_failed_file")]
    pub failed_file: String,

    #[serde(default = "default_report_file")]
    pub report_file: String,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_base_url() -> String {
    "https://finance.yahoo.com".to_string()
}
fn default_navigation_timeout_secs() -> u64 {
    30
}
fn default_table_timeout_secs() -> u64 {
    10
}
fn default_table_selector() -> String {
    "table".to_string()
}
fn default_consent_selectors() -> Vec<String> {
    [
        r#"button[name="agree"]"#,
        r#"button[aria-label="Agree"]"#,
        "button.accept-all",
        r#"form[action*="consent"] button[type="submit"]"#,
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
fn default_consent_timeout_ms() -> u64 {
    3000
}
fn default_user_agent() -> String {
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
        .to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    2000
}
fn default_request_delay_ms() -> u64 {
    1000
}
fn default_true() -> bool {
    true
}
fn default_concurrency() -> usize {
    3
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data/raw")
}
fn default_dataset_file() -> String {
    "history.csv".to_string()
}
fn default_failed_file() -> String {
    "failed_tickers.csv".to_string()
}
fn default_report_file() -> String {
    "run_report.json".to_string()
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            navigation_timeout_secs: default_navigation_timeout_secs(),
            table_timeout_secs: default_table_timeout_secs(),
            table_selector: default_table_selector(),
            consent_selectors: default_consent_selectors(),
            consent_timeout_ms: default_consent_timeout_ms(),
            headless: true,
            user_agent: default_user_agent(),
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            request_delay_ms: default_request_delay_ms(),
            jitter_ms: 0,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            interval: Interval::default(),
            schema: Schema::default(),
            start: None,
            end: None,
            concurrency: default_concurrency(),
            run_timeout_secs: None,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            dataset_file: default_dataset_file(),
            failed_file: default_failed_file(),
            report_file: default_report_file(),
        }
    }
}

// ── Derived values ───────────────────────────────────────────────────────────

impl ScraperConfig {
    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_secs(self.navigation_timeout_secs)
    }

    pub fn table_timeout(&self) -> Duration {
        Duration::from_secs(self.table_timeout_secs)
    }

    pub fn consent_timeout(&self) -> Duration {
        Duration::from_millis(self.consent_timeout_ms)
    }
}

impl PipelineConfig {
    /// Configured range, falling back to year-to-date (UTC).
    pub fn date_range(&self) -> Result<(NaiveDate, NaiveDate)> {
        let today = Utc::now().date_naive();
        let start = match self.start {
            Some(d) => d,
            None => NaiveDate::from_ymd_opt(today.year(), 1, 1).context("Invalid year start")?,
        };
        let end = self.end.unwrap_or(today);
        anyhow::ensure!(start <= end, "Range start {} is after end {}", start, end);
        Ok((start, end))
    }
}

impl OutputConfig {
    pub fn dataset_path(&self) -> PathBuf {
        self.data_dir.join(&self.dataset_file)
    }

    pub fn failed_path(&self) -> PathBuf {
        self.data_dir.join(&self.failed_file)
    }

    pub fn report_path(&self) -> PathBuf {
        self.data_dir.join(&self.report_file)
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::Environment::with_prefix("HISTORY")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("scraper.consent_selectors")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?;

        cfg.try_deserialize().context("Invalid configuration")
    }
}
