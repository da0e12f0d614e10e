//! Merge several partial datasets into one canonical dataset.
//!
//! Inputs are taken in precedence order: when two inputs carry the same
//! (ticker, date), the row from the earlier input survives. With
//! `[main, retry]` the main run wins; pass `[retry, main]` to let a retry run
//! correct the main one.

use crate::loader::load_dataset;
use crate::models::{Schema, TaggedRow};
use crate::storage::write_dataset;
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub input_rows: usize,
    pub output_rows: usize,
    pub duplicates: usize,
}

/// Concatenate in input order, keep the first row per (ticker, date), then
/// sort by (ticker, date).
pub fn reconcile<I>(inputs: I) -> (Vec<TaggedRow>, ReconcileStats)
where
    I: IntoIterator<Item = Vec<TaggedRow>>,
{
    let mut input_rows = 0usize;
    let mut seen = HashSet::new();
    let mut merged = Vec::new();

    for row in inputs.into_iter().flatten() {
        input_rows += 1;
        if seen.insert((row.symbol.clone(), row.row.date)) {
            merged.push(row);
        }
    }

    merged.sort_by(|a, b| a.key().cmp(&b.key()));

    let stats = ReconcileStats {
        input_rows,
        output_rows: merged.len(),
        duplicates: input_rows - merged.len(),
    };
    (merged, stats)
}

/// Load each dataset file, reconcile, and write the result to `out`.
/// All inputs must share one schema.
pub fn reconcile_files(inputs: &[PathBuf], out: &Path) -> Result<ReconcileStats> {
    anyhow::ensure!(inputs.len() >= 2, "Need at least two datasets to reconcile");

    let mut schema: Option<Schema> = None;
    let mut datasets = Vec::with_capacity(inputs.len());
    for path in inputs {
        let (file_schema, rows) =
            load_dataset(path).with_context(|| format!("Failed to load {:?}", path))?;
        match schema {
            None => schema = Some(file_schema),
            Some(s) => anyhow::ensure!(
                s == file_schema,
                "{:?} is {:?} but earlier inputs are {:?}",
                path,
                file_schema,
                s
            ),
        }
        info!("{:?}: {} rows", path, rows.len());
        datasets.push(rows);
    }

    let (rows, stats) = reconcile(datasets);
    write_dataset(out, schema.unwrap_or_default(), &rows)?;

    info!(
        "Reconciled {} rows → {} rows ({} duplicates dropped)",
        stats.input_rows, stats.output_rows, stats.duplicates
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PriceRow;
    use chrono::NaiveDate;

    fn row(symbol: &str, date: &str, close: f64) -> TaggedRow {
        TaggedRow {
            symbol: symbol.to_string(),
            row: PriceRow {
                date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
                open: close,
                high: close,
                low: close,
                close,
                adj_close: Some(close),
                volume: Some(10.0),
            },
        }
    }

    #[test]
    fn test_first_input_wins() {
        let a = vec![row("T", "2024-01-02", 100.0)];
        let b = vec![row("T", "2024-01-02", 999.0)];

        let (ab, stats) = reconcile([a.clone(), b.clone()]);
        assert_eq!(ab.len(), 1);
        assert_eq!(ab[0].row.close, 100.0);
        assert_eq!(stats, ReconcileStats { input_rows: 2, output_rows: 1, duplicates: 1 });

        let (ba, _) = reconcile([b, a]);
        assert_eq!(ba[0].row.close, 999.0);
    }

    #[test]
    fn test_output_sorted_by_ticker_then_date() {
        let main = vec![
            row("MSFT", "2024-01-03", 1.0),
            row("AAPL", "2024-01-03", 2.0),
            row("MSFT", "2024-01-02", 3.0),
        ];
        let retry = vec![
            row("AAPL", "2024-01-02", 4.0),
            row("AAPL", "2024-01-03", 5.0),
            row("GOOG", "2024-01-05", 6.0),
        ];
        let (out, stats) = reconcile([main, retry]);

        for pair in out.windows(2) {
            assert!(pair[0].key() <= pair[1].key());
        }
        let keys: Vec<(&str, String)> = out.iter().map(|r| (r.symbol.as_str(), r.row.date.to_string())).collect();
        assert_eq!(
            keys,
            vec![
                ("AAPL", "2024-01-02".to_string()),
                ("AAPL", "2024-01-03".to_string()),
                ("GOOG", "2024-01-05".to_string()),
                ("MSFT", "2024-01-02".to_string()),
                ("MSFT", "2024-01-03".to_string()),
            ]
        );
        assert_eq!(out[1].row.close, 2.0);
        assert_eq!(stats.duplicates, 1);
    }

    #[test]
    fn test_duplicates_within_one_input() {
        let (out, stats) = reconcile([vec![row("T", "2024-01-02", 1.0), row("T", "2024-01-02", 2.0)]]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].row.close, 1.0);
        assert_eq!(stats.duplicates, 1);
    }

    #[test]
    fn test_reconcile_files() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("main.csv");
        let retry = dir.path().join("retry.csv");
        let out = dir.path().join("full.csv");

        write_dataset(&main, Schema::Ohlcv, &[row("AAPL", "2024-01-03", 1.0)]).unwrap();
        write_dataset(
            &retry,
            Schema::Ohlcv,
            &[row("AAPL", "2024-01-03", 9.0), row("AAPL", "2024-01-02", 2.0)],
        )
        .unwrap();

        let stats = reconcile_files(&[main, retry], &out).unwrap();
        assert_eq!(stats, ReconcileStats { input_rows: 3, output_rows: 2, duplicates: 1 });

        let (_, rows) = load_dataset(&out).unwrap();
        assert_eq!(rows[0].row.date.to_string(), "2024-01-02");
        assert_eq!(rows[1].row.close, 1.0);
    }

    #[test]
    fn test_reconcile_files_rejects_mixed_schemas() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.csv");
        let b = dir.path().join("b.csv");
        write_dataset(&a, Schema::Ohlcv, &[]).unwrap();
        write_dataset(&b, Schema::Ohlc, &[]).unwrap();
        assert!(reconcile_files(&[a, b], &dir.path().join("out.csv")).is_err());
    }
}
