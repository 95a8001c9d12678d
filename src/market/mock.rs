use crate::error::AppError;
use crate::market::countdown::Clock;
use crate::market::feed::{stock_channel, RecordingFeed};
use crate::market::pipeline::BarFetcher;
use crate::market::types::{Bar, Granularity, LiveTick, ThrottleTier, TimeRange};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const MOCK_BASE_PRICE: f64 = 180.0;

/// Synthetic bars for every aligned slot inside `range`. Prices are a pure
/// function of the slot time so overlapping requests agree bar for bar.
pub fn build_mock_bars(granularity: Granularity, range: TimeRange) -> Vec<Bar> {
    let step = granularity.duration_secs();
    let mut open_time = granularity.bucket_open_time(range.start);
    if open_time < range.start {
        open_time += step;
    }

    let mut bars = Vec::new();
    while open_time < range.end {
        let slot = open_time.div_euclid(step);
        let open = MOCK_BASE_PRICE + (slot % 11) as f64 * 0.35;
        let drift = ((slot % 7) as f64 - 3.0) * 0.4;
        let close = (open + drift).max(1.0);
        bars.push(Bar {
            time: open_time,
            open,
            high: open.max(close) + 0.25,
            low: open.min(close) - 0.2,
            close,
        });
        open_time += step;
    }
    bars
}

/// Offline [`BarFetcher`] serving [`build_mock_bars`]. Counts requests and
/// can be switched into a failing state.
#[derive(Debug, Default)]
pub struct MockBarFetcher {
    latency_ms: AtomicU64,
    failing: AtomicBool,
    request_count: AtomicUsize,
    windows: Mutex<Vec<TimeRange>>,
}

impl MockBarFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(latency);
        self
    }

    /// Applies to requests issued after the call; requests already waiting
    /// keep their delay.
    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(millis, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn request_count(&self) -> usize {
        self.request_count.load(Ordering::SeqCst)
    }

    pub fn requested_windows(&self) -> Vec<TimeRange> {
        self.windows.lock().clone()
    }
}

impl BarFetcher for MockBarFetcher {
    async fn request_bars(
        &self,
        _symbol: &str,
        granularity: Granularity,
        range: TimeRange,
    ) -> Result<Vec<Bar>, AppError> {
        self.request_count.fetch_add(1, Ordering::SeqCst);
        self.windows.lock().push(range);

        let latency_ms = self.latency_ms.load(Ordering::SeqCst);
        if latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(latency_ms)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::Fetch {
                status: 503,
                reason: "mock fetcher offline".to_string(),
            });
        }
        Ok(build_mock_bars(granularity, range))
    }
}

/// Publishes a deterministic random walk for `symbol` into `feed` while its
/// channel is subscribed, pacing itself by the throttle last requested of the
/// feed.
pub async fn run_mock_ticks(
    feed: Arc<RecordingFeed>,
    symbol: String,
    clock: Arc<dyn Clock>,
    cancel_token: CancellationToken,
) {
    let channel = stock_channel(&symbol);
    let mut sequence = 0_u64;
    let mut price = MOCK_BASE_PRICE;

    loop {
        let interval_ms = feed
            .throttle_ms()
            .unwrap_or_else(|| ThrottleTier::Normal.interval_ms());

        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_millis(interval_ms)) => {
                if !feed.channels().contains(&channel) {
                    continue;
                }
                sequence = sequence.saturating_add(1);
                price += if sequence.is_multiple_of(3) { -0.3 } else { 0.2 };
                feed.publish(LiveTick {
                    symbol: symbol.clone(),
                    price,
                    volume: 1.0 + (sequence % 4) as f64 * 0.5,
                    time: clock.now_unix_secs(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::countdown::test_clock::ManualClock;
    use crate::market::feed::LiveFeed;

    const T: i64 = 1_700_000_040;

    #[test]
    fn mock_bars_are_aligned_and_bounded() {
        let bars = build_mock_bars(Granularity::M1, TimeRange { start: T + 10, end: T + 200 });
        let times: Vec<i64> = bars.iter().map(|bar| bar.time).collect();
        assert_eq!(times, vec![T + 60, T + 120, T + 180]);
        assert!(bars.iter().all(|bar| bar.low <= bar.open && bar.high >= bar.close));
    }

    #[test]
    fn overlapping_requests_agree() {
        let wide = build_mock_bars(Granularity::M5, TimeRange { start: T, end: T + 6_000 });
        let narrow = build_mock_bars(Granularity::M5, TimeRange { start: T + 3_000, end: T + 6_000 });
        assert_eq!(&wide[wide.len() - narrow.len()..], narrow.as_slice());
    }

    #[tokio::test]
    async fn failing_fetcher_reports_status() {
        let fetcher = MockBarFetcher::new();
        fetcher.set_failing(true);
        let result = fetcher
            .request_bars("AAPL", Granularity::M1, TimeRange { start: T, end: T + 60 })
            .await;
        assert!(matches!(result, Err(AppError::Fetch { status: 503, .. })));
        assert_eq!(fetcher.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn mock_ticks_follow_subscription_and_throttle() {
        let feed = Arc::new(RecordingFeed::new());
        let mut ticks = feed.ticks();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_mock_ticks(
            Arc::clone(&feed),
            "AAPL".to_string(),
            Arc::new(ManualClock::at(T)),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert!(ticks.try_recv().is_err(), "no ticks before subscribing");

        feed.subscribe("stock:AAPL").expect("subscribe");
        feed.set_throttle(250).expect("throttle");
        let tick = ticks.recv().await.expect("tick after subscribing");
        assert_eq!(tick.symbol, "AAPL");
        assert_eq!(tick.time, T);

        cancel.cancel();
        task.await.expect("mock task joins");
    }
}
