use crate::error::AppError;
use crate::market::lru::BoundedCache;
use crate::market::merge::merge_bars;
use crate::market::range::{contains, missing_window, overlap};
use crate::market::range_key::{decode, encode_range, RangeKey};
use crate::market::types::{normalize_symbol, Bar, Granularity, LiveTick, TimeRange};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

/// Source of historical bars for one `(symbol, granularity, range)` window.
pub trait BarFetcher: Send + Sync + 'static {
    fn request_bars(
        &self,
        symbol: &str,
        granularity: Granularity,
        range: TimeRange,
    ) -> impl Future<Output = Result<Vec<Bar>, AppError>> + Send;
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub range: TimeRange,
    /// Ascending by time, unique times.
    pub bars: Vec<Bar>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    Cached(Vec<Bar>),
    Fetched(Vec<Bar>),
    /// The pipeline was torn down while the fetch was in flight.
    Discarded,
}

impl LoadOutcome {
    pub fn bars(&self) -> &[Bar] {
        match self {
            LoadOutcome::Cached(bars) | LoadOutcome::Fetched(bars) => bars,
            LoadOutcome::Discarded => &[],
        }
    }

    pub fn source(&self) -> &'static str {
        match self {
            LoadOutcome::Cached(_) => "cache",
            LoadOutcome::Fetched(_) => "network",
            LoadOutcome::Discarded => "discarded",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickOutcome {
    pub bar: Bar,
    pub opened_new_bar: bool,
}

/// Range-keyed bar cache in front of a [`BarFetcher`].
///
/// The cache lock is never held across a fetch. Completions merge in the
/// order they finish, with cached bars as `existing` and network bars as
/// `incoming`.
pub struct ChartDataPipeline<F> {
    fetcher: F,
    cache: Mutex<BoundedCache<String, CacheEntry>>,
    generation: AtomicU64,
}

impl<F: BarFetcher> ChartDataPipeline<F> {
    pub fn new(fetcher: F, capacity: usize) -> Self {
        Self {
            fetcher,
            cache: Mutex::new(BoundedCache::new(capacity)),
            generation: AtomicU64::new(0),
        }
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Serves `range` from cache when one entry covers it, otherwise fetches
    /// what is missing and folds it into the series. A neighbour that was
    /// evicted while a narrowed fetch was in flight leaves a hole; the load
    /// then fetches the whole range once more.
    pub async fn load_range(
        &self,
        symbol: &str,
        granularity: Granularity,
        range: TimeRange,
    ) -> Result<LoadOutcome, AppError> {
        let symbol = normalize_symbol(symbol)?;
        let symbol = symbol.as_str();
        let generation = self.generation();
        let mut narrow = true;

        loop {
            let window = {
                let mut cache = self.cache.lock();
                let series = series_keys(&cache, symbol, granularity);

                let covering = series
                    .iter()
                    .find(|(_, key)| contains(key.range(), range))
                    .map(|(raw, _)| raw.clone());
                if let Some(raw) = covering {
                    if let Some(entry) = cache.get(&raw) {
                        tracing::debug!(symbol, granularity = granularity.as_str(), key = %raw, "bar cache hit");
                        return Ok(LoadOutcome::Cached(slice_bars(&entry.bars, range)));
                    }
                }

                if narrow {
                    // Most recently used neighbour first.
                    series
                        .iter()
                        .rev()
                        .filter(|(_, key)| overlap(key.range(), range).is_some())
                        .find_map(|(_, key)| missing_window(key.range(), range))
                        .unwrap_or(range)
                } else {
                    range
                }
            };

            tracing::debug!(
                symbol,
                granularity = granularity.as_str(),
                start = window.start,
                end = window.end,
                "bar cache miss, fetching"
            );

            let fetched = match self.fetcher.request_bars(symbol, granularity, window).await {
                Ok(bars) => bars,
                Err(error) => {
                    tracing::warn!(symbol, granularity = granularity.as_str(), "bar fetch failed: {error}");
                    return Err(error);
                }
            };
            let fetched: Vec<Bar> = fetched
                .into_iter()
                .filter(|bar| window.includes(bar.time))
                .collect();

            let mut cache = self.cache.lock();
            if self.generation() != generation {
                tracing::debug!(symbol, "discarding bars fetched before teardown");
                return Ok(LoadOutcome::Discarded);
            }

            let (merged_range, existing) =
                absorb_neighbours(&mut cache, symbol, granularity, window);
            let merged = merge_bars(&existing, &fetched);
            let result = slice_bars(&merged, range);
            store_entry(&mut cache, symbol, granularity, merged_range, merged);

            if contains(merged_range, range) {
                return Ok(LoadOutcome::Fetched(result));
            }
            tracing::debug!(
                symbol,
                granularity = granularity.as_str(),
                "cached neighbour vanished during fetch, refetching whole range"
            );
            narrow = false;
        }
    }

    /// Folds a live tick into the newest cached entry of its series. Returns
    /// `None` when nothing for the series is loaded yet, or the tick falls
    /// before the cached range or beyond the bar right after it.
    pub fn apply_tick(&self, granularity: Granularity, tick: &LiveTick) -> Option<TickOutcome> {
        let symbol = normalize_symbol(&tick.symbol).ok()?;
        let bucket = granularity.bucket_open_time(tick.time);

        let mut cache = self.cache.lock();
        let (raw, key) = series_keys(&cache, &symbol, granularity)
            .into_iter()
            .max_by_key(|(_, key)| key.end)?;
        if bucket < key.start || bucket > key.end {
            return None;
        }

        let mut entry = cache.delete(&raw)?;
        let previous_last = entry.bars.last().map(|bar| bar.time);
        let outcome = match entry.bars.binary_search_by_key(&bucket, |bar| bar.time) {
            Ok(index) => {
                entry.bars[index].apply_tick(tick.price);
                TickOutcome {
                    bar: entry.bars[index],
                    opened_new_bar: false,
                }
            }
            Err(_) => {
                let bar = Bar::from_tick(bucket, tick.price);
                entry.bars = merge_bars(&entry.bars, &[bar]);
                TickOutcome {
                    bar,
                    opened_new_bar: previous_last.is_none_or(|last| bucket > last),
                }
            }
        };

        let range = TimeRange {
            start: entry.range.start,
            end: entry.range.end.max(bucket + granularity.duration_secs()),
        };
        store_entry(&mut cache, &symbol, granularity, range, entry.bars);
        Some(outcome)
    }

    pub fn latest_bar(&self, symbol: &str, granularity: Granularity) -> Option<Bar> {
        let symbol = normalize_symbol(symbol).ok()?;
        let cache = self.cache.lock();
        let (raw, _) = series_keys(&cache, &symbol, granularity)
            .into_iter()
            .max_by_key(|(_, key)| key.end)?;
        cache.peek(&raw)?.bars.last().copied()
    }

    /// Decoded keys from least to most recently used.
    pub fn cached_entries(&self) -> Vec<RangeKey> {
        self.cache.lock().keys().filter_map(|raw| decode(raw)).collect()
    }

    pub fn cache_size(&self) -> usize {
        self.cache.lock().size()
    }

    /// Clears the cache and invalidates every load still in flight.
    pub fn teardown(&self) {
        let mut cache = self.cache.lock();
        self.generation.fetch_add(1, Ordering::SeqCst);
        cache.clear();
        tracing::debug!("chart pipeline torn down");
    }
}

fn series_keys(
    cache: &BoundedCache<String, CacheEntry>,
    symbol: &str,
    granularity: Granularity,
) -> Vec<(String, RangeKey)> {
    cache
        .keys()
        .filter_map(|raw| decode(raw).map(|key| (raw.clone(), key)))
        .filter(|(_, key)| key.same_series(symbol, granularity))
        .collect()
}

fn touches_or_overlaps(a: TimeRange, b: TimeRange) -> bool {
    a.start <= b.end && b.start <= a.end
}

/// Removes every entry of the series that overlaps or abuts `window`,
/// repeating until the grown range reaches no further entries.
fn absorb_neighbours(
    cache: &mut BoundedCache<String, CacheEntry>,
    symbol: &str,
    granularity: Granularity,
    window: TimeRange,
) -> (TimeRange, Vec<Bar>) {
    let mut merged_range = window;
    let mut existing: Vec<Bar> = Vec::new();

    loop {
        let neighbour = series_keys(cache, symbol, granularity)
            .into_iter()
            .find(|(_, key)| touches_or_overlaps(key.range(), merged_range));
        let Some((raw, _)) = neighbour else {
            break;
        };
        let Some(entry) = cache.delete(&raw) else {
            break;
        };
        merged_range = merged_range.union(&entry.range);
        existing = merge_bars(&existing, &entry.bars);
    }

    (merged_range, existing)
}

fn store_entry(
    cache: &mut BoundedCache<String, CacheEntry>,
    symbol: &str,
    granularity: Granularity,
    range: TimeRange,
    bars: Vec<Bar>,
) {
    let key = encode_range(symbol, granularity, range);
    if let Some((evicted, _)) = cache.set(key, CacheEntry { range, bars }) {
        tracing::debug!(key = %evicted, "evicted least recently used bar range");
    }
}

fn slice_bars(bars: &[Bar], range: TimeRange) -> Vec<Bar> {
    bars.iter()
        .filter(|bar| range.includes(bar.time))
        .copied()
        .collect()
}
