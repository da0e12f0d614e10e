use chrono::{Days, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::scraper::FetchError;

// ── Interval / schema ─────────────────────────────────────────────────────────

/// Sampling interval of the history table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    #[default]
    Daily,
    Weekly,
}

impl Interval {
    /// Code used in the history page query string.
    pub fn code(self) -> &'static str {
        match self {
            Interval::Daily => "1d",
            Interval::Weekly => "1wk",
        }
    }
}

/// Which cells of the 7-column history table a row must carry.
///
/// Both variants read the same table layout:
/// Date | Open | High | Low | Close | Adj Close | Volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Schema {
    /// Indices such as ^VIX publish "-" for adj close / volume.
    Ohlc,
    #[default]
    Ohlcv,
}

impl Schema {
    pub fn width(self) -> usize {
        HISTORY_COLUMNS
    }

    /// CSV header for a dataset written in this schema.
    pub fn headers(self) -> &'static [&'static str] {
        match self {
            Schema::Ohlc => &["Date", "Open", "High", "Low", "Close", "Ticker"],
            Schema::Ohlcv => &[
                "Date", "Open", "High", "Low", "Close", "Adj Close", "Volume", "Ticker",
            ],
        }
    }

    /// Infer the schema of a dataset from its header row.
    pub fn from_headers<'a>(headers: impl IntoIterator<Item = &'a str>) -> Schema {
        let headers: Vec<&str> = headers.into_iter().map(str::trim).collect();
        if headers.contains(&"Adj Close") && headers.contains(&"Volume") {
            Schema::Ohlcv
        } else {
            Schema::Ohlc
        }
    }
}

pub const HISTORY_COLUMNS: usize = 7;

// ── Price row ─────────────────────────────────────────────────────────────────

/// One parsed history row. Numeric fields are finite and non-negative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRow {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub adj_close: Option<f64>,
    pub volume: Option<f64>,
}

/// A price row tagged with the symbol it was fetched for.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedRow {
    pub symbol: String,
    pub row: PriceRow,
}

impl TaggedRow {
    pub fn key(&self) -> (&str, NaiveDate) {
        (self.symbol.as_str(), self.row.date)
    }
}

// ── Target ────────────────────────────────────────────────────────────────────

/// One symbol plus the range and interval to fetch. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    symbol: String,
    start: NaiveDate,
    end: NaiveDate,
    interval: Interval,
}

impl Target {
    pub fn new(symbol: impl Into<String>, start: NaiveDate, end: NaiveDate, interval: Interval) -> Self {
        Self {
            symbol: normalise_symbol(&symbol.into()),
            start,
            end,
            interval,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    /// Range start as seconds since the epoch (UTC midnight).
    pub fn period1(&self) -> i64 {
        midnight_epoch(self.start)
    }

    /// Exclusive range end: UTC midnight of the day after `end`, so the
    /// session on `end` itself is part of the range.
    pub fn period2(&self) -> i64 {
        let after = self.end.checked_add_days(Days::new(1)).unwrap_or(self.end);
        midnight_epoch(after)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{} → {}, {}]", self.symbol, self.start, self.end, self.interval.code())
    }
}

fn midnight_epoch(date: NaiveDate) -> i64 {
    date.and_time(NaiveTime::MIN).and_utc().timestamp()
}

pub fn normalise_symbol(s: &str) -> String {
    s.trim().to_uppercase()
}

// ── Fetch outcome ─────────────────────────────────────────────────────────────

/// Terminal result of the attempt chain for one target.
#[derive(Debug)]
pub enum FetchOutcome {
    Success(Vec<PriceRow>),
    Failure { reason: FetchError, attempts: u32 },
}
