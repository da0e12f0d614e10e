use crate::models::{PriceRow, Schema};
use crate::scraper::FetchError;
use crate::scraper::cleaner::parse_row;
use scraper::{Html, Selector};
use std::sync::LazyLock;
use tracing::{Level, debug};

static TABLE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("table").expect("table selector"));
static ROW: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").expect("tr selector"));
static CELL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("td").expect("td selector"));

// ── History table ─────────────────────────────────────────────────────────────

/// A rendered page known to contain at least one `<table>`.
/// The first table in document order is the price history.
pub struct HistoryTable {
    doc: Html,
}

impl HistoryTable {
    pub fn parse(markup: &str) -> Result<Self, FetchError> {
        let doc = Html::parse_document(markup);
        if doc.select(&TABLE).next().is_none() {
            return Err(FetchError::NoTableFound);
        }
        Ok(Self { doc })
    }

    /// Cell texts of every row after the header, in document order.
    pub fn raw_rows(&self) -> impl Iterator<Item = Vec<String>> + '_ {
        self.doc
            .select(&TABLE)
            .next()
            .into_iter()
            .flat_map(|table| table.select(&ROW).skip(1))
            .map(|tr| {
                tr.select(&CELL)
                    .map(|td| td.text().collect::<String>())
                    .collect()
            })
    }

    /// Single pass over the table yielding only rows that parse under `schema`.
    pub fn rows(&self, schema: Schema) -> impl Iterator<Item = PriceRow> + '_ {
        self.raw_rows().filter_map(move |cells| parse_row(&cells, schema))
    }
}

/// Parse markup and materialise its history rows, preserving table order.
/// `NoTableFound` when the page has no table; an empty vec when it has one
/// but no row survives parsing.
pub fn extract_rows(markup: &str, schema: Schema) -> Result<Vec<PriceRow>, FetchError> {
    let table = HistoryTable::parse(markup)?;
    let rows: Vec<PriceRow> = table.rows(schema).collect();

    if tracing::enabled!(Level::DEBUG) {
        let seen = table.raw_rows().count();
        if seen > rows.len() {
            debug!("Skipped {} of {} table rows", seen - rows.len(), seen);
        }
    }
    Ok(rows)
}
