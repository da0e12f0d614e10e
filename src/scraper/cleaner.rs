use crate::models::{PriceRow, Schema};
use chrono::NaiveDate;

// ── Cell parsers ──────────────────────────────────────────────────────────────

/// Markers the history table uses for a missing value.
const NO_VALUE: [&str; 3] = ["-", "—", "N/A"];

/// Trim and drop thousands separators. `None` for an empty or "no value" cell.
/// "1,234.56" → "1234.56" | " - " → None
pub fn clean_cell(s: &str) -> Option<String> {
    let s = s.trim().replace(',', "");
    if s.is_empty() || NO_VALUE.contains(&s.as_str()) {
        return None;
    }
    Some(s)
}

/// Range check shared by every numeric field of a row, scraped or loaded.
pub fn is_valid_amount(v: f64) -> bool {
    v.is_finite() && v >= 0.0
}

/// Finite, non-negative price.
pub fn parse_price(s: &str) -> Option<f64> {
    let v: f64 = clean_cell(s)?.parse().ok()?;
    is_valid_amount(v).then_some(v)
}

/// Volume; "12,345,600" → 12345600. Some feeds publish fractional volume
/// ("1,234.5"), so decimals are accepted under the same range check as prices.
pub fn parse_volume(s: &str) -> Option<f64> {
    parse_price(s)
}

/// History dates: "Oct 17, 2025" or "October 17, 2025".
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    ["%b %d, %Y", "%B %d, %Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
}

// ── Row → PriceRow ────────────────────────────────────────────────────────────

/// Turn one table row's cell texts into a `PriceRow`, or `None` when the row
/// should be skipped (wrong width, dividend/split annotation, missing or
/// unparseable required cell).
pub fn parse_row<S: AsRef<str>>(cells: &[S], schema: Schema) -> Option<PriceRow> {
    if cells.len() != schema.width() {
        return None;
    }
    let cell = |i: usize| cells[i].as_ref();

    let date = parse_date(cell(0))?;
    let open = parse_price(cell(1))?;
    let high = parse_price(cell(2))?;
    let low = parse_price(cell(3))?;
    let close = parse_price(cell(4))?;

    let (adj_close, volume) = match schema {
        Schema::Ohlcv => (Some(parse_price(cell(5))?), Some(parse_volume(cell(6))?)),
        Schema::Ohlc => (parse_price(cell(5)), parse_volume(cell(6))),
    };

    Some(PriceRow {
        date,
        open,
        high,
        low,
        close,
        adj_close,
        volume,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: [&str; 7] = [
        "Oct 17, 2025",
        "248.02",
        "253.38",
        "247.27",
        "252.29",
        "252.29",
        "49,147,000",
    ];

    #[test]
    fn test_parse_full_row() {
        let row = parse_row(&FULL, Schema::Ohlcv).unwrap();
        assert_eq!(row.date, NaiveDate::from_ymd_opt(2025, 10, 17).unwrap());
        assert_eq!(row.open, 248.02);
        assert_eq!(row.close, 252.29);
        assert_eq!(row.adj_close, Some(252.29));
        assert_eq!(row.volume, Some(49_147_000.0));
    }

    #[test]
    fn test_thousands_separator_in_price() {
        let cells = ["Jan 2, 2024", "4,745.20", "4,754.33", "4,722.67", "4,742.83", "4,742.83", "3,743,050,000"];
        let row = parse_row(&cells, Schema::Ohlcv).unwrap();
        assert_eq!(row.open, 4745.20);
        assert_eq!(row.volume, Some(3_743_050_000.0));
    }

    #[test]
    fn test_empty_required_cell_is_skipped() {
        for i in 0..FULL.len() {
            for blank in ["", "  ", "-", "—"] {
                let mut cells = FULL;
                cells[i] = blank;
                assert_eq!(parse_row(&cells, Schema::Ohlcv), None, "cell {} = {:?}", i, blank);
            }
        }
    }

    #[test]
    fn test_width_mismatch_is_skipped() {
        let dividend = ["Aug 11, 2025", "0.26 Dividend"];
        assert_eq!(parse_row(&dividend, Schema::Ohlcv), None);
        assert_eq!(parse_row(&FULL[..5], Schema::Ohlc), None);

        let mut wide = FULL.to_vec();
        wide.push("extra");
        assert_eq!(parse_row(&wide, Schema::Ohlcv), None);
    }

    #[test]
    fn test_ohlc_tolerates_missing_tail() {
        let vix = ["Oct 17, 2025", "25.31", "25.98", "20.62", "20.78", "-", "-"];
        let row = parse_row(&vix, Schema::Ohlc).unwrap();
        assert_eq!(row.close, 20.78);
        assert_eq!(row.adj_close, None);
        assert_eq!(row.volume, None);
        assert_eq!(parse_row(&vix, Schema::Ohlcv), None);
    }

    #[test]
    fn test_bad_date_and_numbers() {
        let mut cells = FULL;
        cells[0] = "2025-10-17";
        assert_eq!(parse_row(&cells, Schema::Ohlcv), None);

        let mut cells = FULL;
        cells[2] = "abc";
        assert_eq!(parse_row(&cells, Schema::Ohlcv), None);

        let mut cells = FULL;
        cells[3] = "-1.5";
        assert_eq!(parse_row(&cells, Schema::Ohlcv), None);

        let mut cells = FULL;
        cells[4] = "inf";
        assert_eq!(parse_row(&cells, Schema::Ohlcv), None);
    }

    #[test]
    fn test_decimal_volume_is_kept() {
        let mut cells = FULL;
        cells[6] = "1,234.5";
        let row = parse_row(&cells, Schema::Ohlcv).unwrap();
        assert_eq!(row.volume, Some(1_234.5));

        for bad in ["-3", "NaN", "1e999"] {
            let mut cells = FULL;
            cells[6] = bad;
            assert_eq!(parse_row(&cells, Schema::Ohlcv), None, "volume {:?}", bad);
        }
    }

    #[test]
    fn test_parse_is_idempotent() {
        let first = parse_row(&FULL, Schema::Ohlcv);
        let second = parse_row(&FULL, Schema::Ohlcv);
        assert_eq!(first, second);
    }

    #[test]
    fn test_parse_date_long_month() {
        assert_eq!(parse_date("January 2, 2024"), NaiveDate::from_ymd_opt(2024, 1, 2));
        assert_eq!(parse_date(" Jan 2, 2024 "), NaiveDate::from_ymd_opt(2024, 1, 2));
        assert_eq!(parse_date("Dividend"), None);
    }
}
