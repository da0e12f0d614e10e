use crate::models::{Schema, TaggedRow};
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::File;
use std::path::Path;
use tracing::info;

fn create(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Could not create dir {:?}", parent))?;
    }
    File::create(path).with_context(|| format!("Could not create {:?}", path))
}

// ── Dataset ───────────────────────────────────────────────────────────────────

/// Write rows in the given order under `schema`'s header. The header is
/// written even when there are no rows.
pub fn write_dataset(path: &Path, schema: Schema, rows: &[TaggedRow]) -> Result<usize> {
    let mut writer = csv::Writer::from_writer(create(path)?);
    writer.write_record(schema.headers())?;

    let opt = |v: Option<String>| v.unwrap_or_default();
    for tagged in rows {
        let r = &tagged.row;
        let mut record = vec![
            r.date.format("%Y-%m-%d").to_string(),
            r.open.to_string(),
            r.high.to_string(),
            r.low.to_string(),
            r.close.to_string(),
        ];
        if schema == Schema::Ohlcv {
            record.push(opt(r.adj_close.map(|v| v.to_string())));
            record.push(opt(r.volume.map(|v| v.to_string())));
        }
        record.push(tagged.symbol.clone());
        writer
            .write_record(&record)
            .with_context(|| format!("write {} {}", tagged.symbol, r.date))?;
    }

    writer.flush()?;
    info!("Wrote {} rows to {:?}", rows.len(), path);
    Ok(rows.len())
}

// ── Failed targets ────────────────────────────────────────────────────────────

/// Single `Symbol` column, readable back by `loader::load_symbols`.
pub fn write_failed(path: &Path, symbols: &[String]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(create(path)?);
    writer.write_record(["Symbol"])?;
    for symbol in symbols {
        writer.write_record([symbol])?;
    }
    writer.flush()?;
    Ok(())
}

// ── Run report ────────────────────────────────────────────────────────────────

pub fn write_report<T: Serialize>(path: &Path, report: &T) -> Result<()> {
    let file = create(path)?;
    serde_json::to_writer_pretty(file, report)
        .with_context(|| format!("Could not write report {:?}", path))?;
    Ok(())
}
