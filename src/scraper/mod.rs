pub mod browser;
pub mod cleaner;
pub mod parsers;

use crate::models::Target;
use async_trait::async_trait;
use thiserror::Error;
use url::Url;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Why one fetch attempt (or a whole target) failed.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("navigation failed: {0}")]
    NavigationFailed(String),

    #[error("timed out after {secs}s waiting for {what}")]
    Timeout { what: String, secs: u64 },

    #[error("page crashed: {0}")]
    PageCrashed(String),

    #[error("no table found in page")]
    NoTableFound,

    #[error("table contained no valid rows")]
    EmptyResult,

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("browser unavailable: {0}")]
    BrowserUnavailable(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchError::Cancelled(_) | FetchError::BrowserUnavailable(_))
    }

    /// Only losing the automation engine itself ends the run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FetchError::BrowserUnavailable(_))
    }
}

// ── Source trait ──────────────────────────────────────────────────────────────

/// Anything able to hand back the rendered markup of a target's history page.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_markup(&self, target: &Target) -> Result<String, FetchError>;
}

// ── URL ───────────────────────────────────────────────────────────────────────

/// History page URL for a target, e.g.
/// `https://finance.yahoo.com/quote/%5EGSPC/history/?period1=..&period2=..&interval=1d&...`
pub fn history_url(base_url: &str, target: &Target) -> Result<Url, url::ParseError> {
    let symbol: String = url::form_urlencoded::byte_serialize(target.symbol().as_bytes()).collect();
    let mut url = Url::parse(&format!(
        "{}/quote/{}/history/",
        base_url.trim_end_matches('/'),
        symbol
    ))?;

    url.query_pairs_mut()
        .append_pair("period1", &target.period1().to_string())
        .append_pair("period2", &target.period2().to_string())
        .append_pair("interval", target.interval().code())
        .append_pair("filter", "history")
        .append_pair("frequency", target.interval().code());

    Ok(url)
}
