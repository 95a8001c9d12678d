//! Canonical cache keys for `(symbol, granularity, range)` entries.
//!
//! Keys look like `AAPL|5m|1700000000|1700003000`. Symbols are validated by
//! [`normalize_symbol`](super::types::normalize_symbol) before they reach the
//! codec, so the separator never appears inside a field.

use crate::market::types::{Granularity, TimeRange};

const SEPARATOR: char = '|';
const FIELD_COUNT: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RangeKey {
    pub symbol: String,
    pub granularity: Granularity,
    pub start: i64,
    pub end: i64,
}

impl RangeKey {
    pub fn range(&self) -> TimeRange {
        TimeRange {
            start: self.start,
            end: self.end,
        }
    }

    pub fn same_series(&self, symbol: &str, granularity: Granularity) -> bool {
        self.symbol == symbol && self.granularity == granularity
    }
}

pub fn encode(symbol: &str, granularity: Granularity, start: i64, end: i64) -> String {
    format!(
        "{symbol}{SEPARATOR}{}{SEPARATOR}{start}{SEPARATOR}{end}",
        granularity.as_str()
    )
}

pub fn encode_range(symbol: &str, granularity: Granularity, range: TimeRange) -> String {
    encode(symbol, granularity, range.start, range.end)
}

pub fn decode(key: &str) -> Option<RangeKey> {
    let fields: Vec<&str> = key.split(SEPARATOR).collect();
    if fields.len() != FIELD_COUNT || fields[0].is_empty() {
        return None;
    }

    Some(RangeKey {
        symbol: fields[0].to_string(),
        granularity: Granularity::parse_str(fields[1]).ok()?,
        start: fields[2].parse().ok()?,
        end: fields[3].parse().ok()?,
    })
}
