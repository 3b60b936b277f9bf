//! CSV artifacts: the staging files written by fetch and read by load.
//!
//! Columns: `Date, Open, High, Low, Close, Volume, Dividends, Stock Splits`.
//! The reader is header-driven, so column order does not matter and extra
//! columns (`Adj Close`, a provider index column) are ignored.

use crate::data::PriceSeries;
use crate::domain::{PriceRecord, Ticker};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, Utc};
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CSV_HEADER: [&str; 8] = [
    "Date",
    "Open",
    "High",
    "Low",
    "Close",
    "Volume",
    "Dividends",
    "Stock Splits",
];

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%:z";

/// A row that cannot become a price record. Never coerced to a default.
#[derive(Debug, Error, PartialEq)]
#[error("{}: line {line}: column '{column}': {reason}", path.display())]
pub struct ParseError {
    pub path: PathBuf,
    pub line: u64,
    pub column: String,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("cannot open {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error in {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Write a series to `path`, replacing any previous file. Returns rows written.
pub fn write_series(path: &Path, series: &PriceSeries, delimiter: u8) -> Result<usize, ArtifactError> {
    let csv_err = |source| ArtifactError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let file = File::create(path).map_err(|source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut wtr = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .from_writer(file);

    wtr.write_record(CSV_HEADER).map_err(csv_err)?;
    for bar in &series.bars {
        wtr.write_record([
            bar.timestamp.format(DATE_FORMAT).to_string(),
            bar.open.to_string(),
            bar.high.to_string(),
            bar.low.to_string(),
            bar.close.to_string(),
            bar.volume.to_string(),
            bar.dividends.to_string(),
            bar.stock_splits.to_string(),
        ])
        .map_err(csv_err)?;
    }

    wtr.flush().map_err(|source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(series.len())
}

/// Read every row of a ticker's artifact into staging records.
///
/// Fails on the first missing column, empty field, unparseable date or
/// non-numeric value. `NaN` and infinities count as non-numeric.
pub fn read_records(
    path: &Path,
    ticker: &Ticker,
    delimiter: u8,
) -> Result<Vec<PriceRecord>, ArtifactError> {
    let csv_err = |source| ArtifactError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).map_err(|source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(file);

    let headers = rdr.headers().map_err(csv_err)?.clone();
    let mut columns = [0usize; 8];
    for (slot, name) in columns.iter_mut().zip(CSV_HEADER) {
        *slot = headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| ParseError {
                path: path.to_path_buf(),
                line: 1,
                column: name.to_string(),
                reason: "missing from header".into(),
            })?;
    }
    let [date_col, open_col, high_col, low_col, close_col, volume_col, div_col, split_col] =
        columns;

    let mut records = Vec::new();
    for row in rdr.records() {
        let row = row.map_err(csv_err)?;
        let line = row.position().map(|p| p.line()).unwrap_or(0);

        let field = |idx: usize, name: &str| -> Result<String, ParseError> {
            match row.get(idx) {
                Some(v) if !v.is_empty() => Ok(v.to_string()),
                _ => Err(ParseError {
                    path: path.to_path_buf(),
                    line,
                    column: name.to_string(),
                    reason: "missing value".into(),
                }),
            }
        };
        let number = |idx: usize, name: &str| -> Result<f64, ParseError> {
            let raw = field(idx, name)?;
            let invalid = |reason: String| ParseError {
                path: path.to_path_buf(),
                line,
                column: name.to_string(),
                reason,
            };
            match raw.parse::<f64>() {
                Ok(v) if v.is_finite() => Ok(v),
                Ok(_) => Err(invalid(format!("'{raw}' is not a finite number"))),
                Err(_) => Err(invalid(format!("'{raw}' is not a number"))),
            }
        };

        let raw_date = field(date_col, "Date")?;
        let dt = parse_timestamp(&raw_date).ok_or_else(|| ParseError {
            path: path.to_path_buf(),
            line,
            column: "Date".into(),
            reason: format!("'{raw_date}' is not a timestamp"),
        })?;

        records.push(PriceRecord {
            ticker: ticker.clone(),
            dt,
            open: number(open_col, "Open")?,
            high: number(high_col, "High")?,
            low: number(low_col, "Low")?,
            close: number(close_col, "Close")?,
            volume: number(volume_col, "Volume")?,
            dividends: number(div_col, "Dividends")?,
            stock_splits: number(split_col, "Stock Splits")?,
        });
    }

    Ok(records)
}

/// Accepts `2024-01-02 00:00:00-05:00`, RFC 3339, or a bare date (midnight UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::<FixedOffset>::parse_from_str(raw, DATE_FORMAT) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .map(|d| d.and_time(NaiveTime::MIN).and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PriceBar;
    use chrono::TimeZone;

    fn gspc() -> Ticker {
        Ticker::new("^GSPC").unwrap()
    }

    fn bar(day: u32, close: f64) -> PriceBar {
        let est = FixedOffset::west_opt(5 * 3600).unwrap();
        PriceBar {
            timestamp: est.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap(),
            open: close - 1.0,
            high: close + 2.0,
            low: close - 3.0,
            close,
            volume: 3_743_050_000.0,
            dividends: 0.0,
            stock_splits: 0.0,
        }
    }

    fn write(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("GSPC.csv");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn written_file_has_header_and_one_line_per_bar() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("GSPC.csv");
        let series = PriceSeries {
            ticker: gspc(),
            bars: vec![bar(2, 4742.83), bar(3, 4704.81), bar(4, 4688.68)],
        };

        let rows = write_series(&path, &series, b',').unwrap();
        assert_eq!(rows, 3);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "Date,Open,High,Low,Close,Volume,Dividends,Stock Splits");
        assert_eq!(
            lines[1],
            "2024-01-02 00:00:00-05:00,4741.83,4744.83,4739.83,4742.83,3743050000,0,0"
        );
    }

    #[test]
    fn reads_records_back_in_utc() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("GSPC.csv");
        let series = PriceSeries {
            ticker: gspc(),
            bars: vec![bar(2, 4742.83), bar(3, 4704.81)],
        };
        write_series(&path, &series, b',').unwrap();

        let records = read_records(&path, &gspc(), b',').unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].ticker, gspc());
        assert_eq!(records[0].dt, Utc.with_ymd_and_hms(2024, 1, 2, 5, 0, 0).unwrap());
        assert_eq!(records[1].close, 4704.81);
        assert_eq!(records[1].volume, 3_743_050_000.0);
    }

    #[test]
    fn column_order_and_extra_columns_do_not_matter() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write(
            tmp.path(),
            "Stock Splits,Dividends,Volume,Adj Close,Close,Low,High,Open,Date\n\
             0.0,0.5,1000,9.9,10.0,9.0,11.0,9.5,2024-01-02\n",
        );
        let records = read_records(&path, &gspc(), b',').unwrap();
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!((r.open, r.high, r.low, r.close), (9.5, 11.0, 9.0, 10.0));
        assert_eq!(r.dividends, 0.5);
        assert_eq!(r.dt, Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap());
    }

    #[test]
    fn semicolon_delimited_files_are_supported() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write(
            tmp.path(),
            "Date;Open;High;Low;Close;Volume;Dividends;Stock Splits\n\
             2024-01-02T14:30:00Z;1;2;0.5;1.5;100;0;0\n",
        );
        let records = read_records(&path, &gspc(), b';').unwrap();
        assert_eq!(records[0].dt, Utc.with_ymd_and_hms(2024, 1, 2, 14, 30, 0).unwrap());
    }

    #[test]
    fn non_numeric_price_is_a_parse_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write(
            tmp.path(),
            "Date,Open,High,Low,Close,Volume,Dividends,Stock Splits\n\
             2024-01-02,1,2,0.5,1.5,100,0,0\n\
             2024-01-03,1,abc,0.5,1.5,100,0,0\n",
        );
        let err = read_records(&path, &gspc(), b',').unwrap_err();
        match err {
            ArtifactError::Parse(e) => {
                assert_eq!(e.line, 3);
                assert_eq!(e.column, "High");
                assert!(e.reason.contains("abc"));
            }
            other => panic!("expected parse error, got {other}"),
        }
    }

    #[test]
    fn nan_and_infinite_values_are_parse_errors() {
        let tmp = tempfile::tempdir().unwrap();
        for (cell, column) in [("NaN", "Open"), ("inf", "Low"), ("-infinity", "Volume")] {
            let mut row = ["2024-01-02", "1", "2", "0.5", "1.5", "100", "0", "0"];
            let idx = CSV_HEADER.iter().position(|h| *h == column).unwrap();
            row[idx] = cell;
            let path = write(
                tmp.path(),
                &format!("{}\n{}\n", CSV_HEADER.join(","), row.join(",")),
            );
            match read_records(&path, &gspc(), b',').unwrap_err() {
                ArtifactError::Parse(e) => {
                    assert_eq!(e.line, 2);
                    assert_eq!(e.column, column);
                    assert!(e.reason.contains("not a finite number"), "{}", e.reason);
                }
                other => panic!("expected parse error for {cell}, got {other}"),
            }
        }
    }

    #[test]
    fn empty_or_short_rows_are_parse_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write(
            tmp.path(),
            "Date,Open,High,Low,Close,Volume,Dividends,Stock Splits\n\
             2024-01-02,1,2,0.5,,100,0,0\n",
        );
        let err = read_records(&path, &gspc(), b',').unwrap_err();
        assert!(matches!(err, ArtifactError::Parse(ref e) if e.column == "Close"));

        let path = write(
            tmp.path(),
            "Date,Open,High,Low,Close,Volume,Dividends,Stock Splits\n\
             2024-01-02,1,2,0.5,1.5,100\n",
        );
        let err = read_records(&path, &gspc(), b',').unwrap_err();
        assert!(matches!(err, ArtifactError::Parse(ref e) if e.column == "Dividends"));
    }

    #[test]
    fn missing_header_column_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write(tmp.path(), "Date,Open,High,Low,Close,Volume\n");
        let err = read_records(&path, &gspc(), b',').unwrap_err();
        assert!(matches!(err, ArtifactError::Parse(ref e) if e.line == 1 && e.column == "Dividends"));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = read_records(&tmp.path().join("NOPE.csv"), &gspc(), b',').unwrap_err();
        assert!(matches!(err, ArtifactError::Io { .. }));
    }

    #[test]
    fn timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 2, 5, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2024-01-02 00:00:00-05:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-02T00:00:00-05:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-02T05:00:00Z"), Some(expected));
        assert!(parse_timestamp("02/01/2024").is_none());
    }
}
