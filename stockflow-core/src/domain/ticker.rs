//! Ticker symbols and their staging file names.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A provider ticker symbol such as `^GSPC` or `AAPL`.
///
/// Index symbols carry characters (`^`, `=`) that do not belong in a file
/// name, so the staging CSV is named after [`Ticker::file_stem`] rather than
/// the raw symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ticker(String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TickerError {
    #[error("ticker symbol is empty")]
    Empty,

    #[error("ticker '{0}' has no characters usable in a file name")]
    NoFileStem(String),
}

impl Ticker {
    pub fn new(symbol: impl AsRef<str>) -> Result<Self, TickerError> {
        let symbol = symbol.as_ref().trim();
        if symbol.is_empty() {
            return Err(TickerError::Empty);
        }
        if sanitize_stem(symbol).is_empty() {
            return Err(TickerError::NoFileStem(symbol.to_string()));
        }
        Ok(Self(symbol.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Symbol reduced to `[A-Za-z0-9._-]`: `^GSPC` becomes `GSPC`.
    pub fn file_stem(&self) -> String {
        sanitize_stem(&self.0)
    }

    /// Name of this ticker's staging artifact, e.g. `GSPC.csv`.
    pub fn csv_file_name(&self) -> String {
        format!("{}.csv", self.file_stem())
    }
}

fn sanitize_stem(symbol: &str) -> String {
    symbol
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect()
}

impl fmt::Display for Ticker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Ticker {
    type Err = TickerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Ticker {
    type Error = TickerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Ticker> for String {
    fn from(value: Ticker) -> Self {
        value.0
    }
}

/// Parse a list of raw symbols, failing on the first invalid one.
pub fn parse_tickers<I, S>(symbols: I) -> Result<Vec<Ticker>, TickerError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    symbols.into_iter().map(Ticker::new).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn index_symbols_drop_caret_in_file_name() {
        let t = Ticker::new("^GSPC").unwrap();
        assert_eq!(t.as_str(), "^GSPC");
        assert_eq!(t.file_stem(), "GSPC");
        assert_eq!(t.csv_file_name(), "GSPC.csv");
    }

    #[test]
    fn plain_and_dotted_symbols_keep_their_name() {
        assert_eq!(Ticker::new("BRK-B").unwrap().file_stem(), "BRK-B");
        assert_eq!(Ticker::new("7203.T").unwrap().file_stem(), "7203.T");
    }

    #[test]
    fn surrounding_whitespace_is_trimmed() {
        assert_eq!(Ticker::new("  AAPL ").unwrap().as_str(), "AAPL");
    }

    #[test]
    fn empty_and_unnameable_symbols_are_rejected() {
        assert_eq!(Ticker::new("   "), Err(TickerError::Empty));
        assert_eq!(
            Ticker::new("^^"),
            Err(TickerError::NoFileStem("^^".to_string()))
        );
    }

    #[test]
    fn deserializes_from_json_list() {
        let tickers: Vec<Ticker> = serde_json::from_str(r#"["^GSPC","^IXIC","^DJI"]"#).unwrap();
        let stems: Vec<String> = tickers.iter().map(Ticker::file_stem).collect();
        assert_eq!(stems, vec!["GSPC", "IXIC", "DJI"]);
        assert!(serde_json::from_str::<Vec<Ticker>>(r#"[""]"#).is_err());
    }

    proptest! {
        #[test]
        fn file_stem_is_filesystem_safe(symbol in "[ -~]{1,12}") {
            if let Ok(t) = Ticker::new(&symbol) {
                let stem = t.file_stem();
                prop_assert!(!stem.is_empty());
                prop_assert!(stem
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')));
                prop_assert!(!stem.contains('/'));
            }
        }
    }
}
