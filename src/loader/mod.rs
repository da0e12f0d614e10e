//! CSV readers: symbol lists and previously written datasets.

use crate::models::{PriceRow, Schema, TaggedRow, normalise_symbol};
use crate::scraper::cleaner::is_valid_amount;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct SymbolRecord {
    #[serde(rename = "Symbol")]
    symbol: String,
}

/// Read a symbol list: header row with at least a `Symbol` column.
/// Blank symbols are dropped; order and duplicates are kept as given.
pub fn load_symbols(path: &Path) -> Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open symbol list {:?}", path))?;

    let mut symbols = Vec::new();
    for (i, result) in reader.deserialize::<SymbolRecord>().enumerate() {
        let record = result.with_context(|| format!("Row {} in {:?}", i + 1, path))?;
        let symbol = normalise_symbol(&record.symbol);
        if !symbol.is_empty() {
            symbols.push(symbol);
        }
    }

    info!("Loaded {} symbols from {:?}", symbols.len(), path);
    Ok(symbols)
}

/// One dataset line as written by `storage::write_dataset`.
#[derive(Debug, Deserialize)]
struct DatasetRecord {
    #[serde(rename = "Date")]
    date: NaiveDate,
    #[serde(rename = "Open")]
    open: f64,
    #[serde(rename = "High")]
    high: f64,
    #[serde(rename = "Low")]
    low: f64,
    #[serde(rename = "Close")]
    close: f64,
    #[serde(rename = "Adj Close", default)]
    adj_close: Option<f64>,
    #[serde(rename = "Volume", default)]
    volume: Option<f64>,
    #[serde(rename = "Ticker")]
    ticker: String,
}

impl DatasetRecord {
    /// Same range rule the row parser applies to scraped cells.
    fn in_range(&self) -> bool {
        [self.open, self.high, self.low, self.close]
            .into_iter()
            .chain(self.adj_close)
            .chain(self.volume)
            .all(is_valid_amount)
    }
}

/// Load a dataset file in file order, together with the schema its header implies.
/// Lines that fail to deserialize, or carry a negative or non-finite number,
/// are skipped with a warning.
pub fn load_dataset(path: &Path) -> Result<(Schema, Vec<TaggedRow>)> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open dataset {:?}", path))?;

    let headers = reader.headers()?.clone();
    anyhow::ensure!(
        headers.iter().any(|h| h == "Ticker"),
        "Dataset {:?} has no Ticker column",
        path
    );
    let schema = Schema::from_headers(headers.iter());

    let mut rows = Vec::new();
    for (i, result) in reader.deserialize::<DatasetRecord>().enumerate() {
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                warn!("Row {} in {:?}: {}", i + 1, path, e);
                continue;
            }
        };
        if !record.in_range() {
            warn!("Row {} in {:?}: value out of range", i + 1, path);
            continue;
        }
        rows.push(TaggedRow {
            symbol: normalise_symbol(&record.ticker),
            row: PriceRow {
                date: record.date,
                open: record.open,
                high: record.high,
                low: record.low,
                close: record.close,
                adj_close: record.adj_close,
                volume: record.volume,
            },
        });
    }

    debug!("{:?}: {} rows ({:?})", path, rows.len(), schema);
    Ok((schema, rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_symbols() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "sp500_tickers.csv",
            "Symbol,Weight\naapl,7.1\n MSFT ,6.5\n,0.1\nBRK-B,1.7\n",
        );
        let symbols = load_symbols(&path).unwrap();
        assert_eq!(symbols, vec!["AAPL", "MSFT", "BRK-B"]);
    }

    #[test]
    fn test_load_symbols_requires_symbol_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "bad.csv", "Ticker\nAAPL\n");
        assert!(load_symbols(&path).is_err());
    }

    #[test]
    fn test_load_dataset_ohlc() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "vix.csv",
            "Date,Open,High,Low,Close,Ticker\n\
             2025-10-16,20.5,26.0,19.9,25.31,^VIX\n\
             not-a-date,1,1,1,1,^VIX\n",
        );
        let (schema, rows) = load_dataset(&path).unwrap();
        assert_eq!(schema, Schema::Ohlc);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].symbol, "^VIX");
        assert_eq!(rows[0].row.adj_close, None);
    }

    #[test]
    fn test_load_dataset_drops_out_of_range_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "aapl.csv",
            "Date,Open,High,Low,Close,Adj Close,Volume,Ticker\n\
             2024-01-02,187.15,188.44,183.89,185.64,184.53,82488700,AAPL\n\
             2024-01-03,NaN,188.44,183.89,185.64,184.53,1000,AAPL\n\
             2024-01-04,-5,188.44,183.89,185.64,184.53,1000,AAPL\n\
             2024-01-05,187.15,188.44,183.89,inf,184.53,1000,AAPL\n\
             2024-01-08,187.15,188.44,183.89,185.64,184.53,-1,AAPL\n\
             2024-01-09,182.09,183.13,180.93,181.18,180.08,1234.5,AAPL\n",
        );
        let (schema, rows) = load_dataset(&path).unwrap();
        assert_eq!(schema, Schema::Ohlcv);
        let dates: Vec<String> = rows.iter().map(|r| r.row.date.to_string()).collect();
        assert_eq!(dates, vec!["2024-01-02", "2024-01-09"]);
        assert_eq!(rows[1].row.volume, Some(1_234.5));
    }

    #[test]
    fn test_load_dataset_requires_ticker() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "gspc.csv", "Date,Open,High,Low,Close\n2025-01-02,1,1,1,1\n");
        assert!(load_dataset(&path).is_err());
    }
}
