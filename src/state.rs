use crate::market::countdown::{
    Clock, CountdownEvent, CountdownHandle, CountdownScheduler, SystemClock,
};
use crate::market::feed::LiveFeed;
use crate::market::pipeline::{BarFetcher, ChartDataPipeline};
use crate::market::push::AdaptivePushController;
use crate::market::types::{Granularity, SessionConfig};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;

const COUNTDOWN_EVENT_CAPACITY: usize = 64;

/// The series currently on screen; live ticks for anything else are not
/// folded into the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartFocus {
    pub symbol: String,
    pub granularity: Granularity,
}

/// Everything one chart session owns. Built per session and torn down with
/// [`AppState::shutdown`].
pub struct AppState<F, L: LiveFeed> {
    pub started_at: Instant,
    pub config: SessionConfig,
    pub pipeline: ChartDataPipeline<F>,
    pub feed: Arc<L>,
    pub push: Mutex<AdaptivePushController<L>>,
    pub countdown: Arc<Mutex<CountdownScheduler>>,
    pub countdown_driver: tokio::sync::Mutex<Option<CountdownHandle>>,
    pub countdown_events: broadcast::Sender<CountdownEvent>,
    pub clock: Arc<dyn Clock>,
    pub chart_focus: Mutex<Option<ChartFocus>>,
}

impl<F: BarFetcher, L: LiveFeed> AppState<F, L> {
    pub fn new(config: SessionConfig, fetcher: F, feed: Arc<L>) -> Self {
        Self::with_clock(config, fetcher, feed, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: SessionConfig,
        fetcher: F,
        feed: Arc<L>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (countdown_events, _) = broadcast::channel(COUNTDOWN_EVENT_CAPACITY);
        let push = AdaptivePushController::new(Arc::clone(&feed), config.auto_throttle);

        Self {
            started_at: Instant::now(),
            pipeline: ChartDataPipeline::new(fetcher, config.cache_capacity),
            feed,
            push: Mutex::new(push),
            countdown: Arc::new(Mutex::new(CountdownScheduler::new())),
            countdown_driver: tokio::sync::Mutex::new(None),
            countdown_events,
            clock,
            chart_focus: Mutex::new(None),
            config,
        }
    }

    pub fn focus(&self) -> Option<ChartFocus> {
        self.chart_focus.lock().clone()
    }

    /// Stops the countdown driver and drops every cached range. Loads still in
    /// flight resolve as discarded.
    pub async fn shutdown(&self) {
        let existing_handle = {
            let mut driver_slot = self.countdown_driver.lock().await;
            driver_slot.take()
        };
        if let Some(mut handle) = existing_handle {
            handle.stop().await;
        }

        self.countdown.lock().disable();
        self.pipeline.teardown();
        *self.chart_focus.lock() = None;
        tracing::info!("chart session shut down");
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::AppState;
    use crate::market::countdown::test_clock::ManualClock;
    use crate::market::feed::RecordingFeed;
    use crate::market::mock::MockBarFetcher;
    use crate::market::types::SessionArgs;
    use std::sync::Arc;

    pub type TestState = AppState<MockBarFetcher, RecordingFeed>;

    pub fn test_state(now: i64) -> (TestState, Arc<RecordingFeed>, ManualClock) {
        let config = SessionArgs::default()
            .normalize()
            .expect("default session config");
        let feed = Arc::new(RecordingFeed::new());
        let clock = ManualClock::at(now);
        let state = AppState::with_clock(
            config,
            MockBarFetcher::new(),
            Arc::clone(&feed),
            Arc::new(clock.clone()),
        );
        (state, feed, clock)
    }
}
