use crate::market::types::{Bar, BarWire};
use std::collections::BTreeMap;

/// Folds `incoming` over `existing` keyed by bar time and returns the result in
/// ascending time order. A time present in both keeps the incoming bar, and
/// within one slice the last occurrence of a time wins.
///
/// Callers pass the cached sequence as `existing` and the network result as
/// `incoming`, never reversed.
pub fn merge_bars(existing: &[Bar], incoming: &[Bar]) -> Vec<Bar> {
    let mut by_time: BTreeMap<i64, Bar> = BTreeMap::new();
    for bar in existing.iter().chain(incoming) {
        by_time.insert(bar.time, *bar);
    }
    by_time.into_values().collect()
}

/// Converts wire bars to normalized bars, dropping any whose time cannot be
/// parsed.
pub fn normalize_bars(raw: Vec<BarWire>) -> Vec<Bar> {
    let mut bars = Vec::with_capacity(raw.len());
    for wire in raw {
        match Bar::try_from(wire) {
            Ok(bar) => bars.push(bar),
            Err(error) => tracing::warn!("skipping bar: {error}"),
        }
    }
    merge_bars(&[], &bars)
}
