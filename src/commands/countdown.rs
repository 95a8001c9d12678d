use crate::error::AppError;
use crate::market::countdown::{countdown_state, spawn_countdown_driver, CountdownPhase};
use crate::market::feed::LiveFeed;
use crate::market::pipeline::BarFetcher;
use crate::market::types::{normalize_symbol, CountdownState, Granularity};
use crate::state::AppState;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartCountdownArgs {
    pub symbol: Option<String>,
    pub granularity: Option<Granularity>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CountdownStatus {
    pub phase: CountdownPhase,
    pub granularity: Granularity,
    pub last_bar_time: i64,
    pub state: Option<CountdownState>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CountdownStopResult {
    pub stopped: bool,
}

/// Arms the countdown for the newest bar of the requested series, falling back
/// to the chart focus and then the session defaults. The bar open time comes
/// from the cache when the series is loaded, otherwise from the clock.
pub async fn start_countdown<F: BarFetcher, L: LiveFeed>(
    state: &AppState<F, L>,
    args: Option<StartCountdownArgs>,
) -> Result<CountdownStatus, AppError> {
    let args = args.unwrap_or_default();
    let focus = state.focus();
    let symbol = match args.symbol {
        Some(raw) => normalize_symbol(&raw)?,
        None => focus
            .as_ref()
            .map(|focus| focus.symbol.clone())
            .unwrap_or_else(|| state.config.symbol.clone()),
    };
    let granularity = args
        .granularity
        .or(focus.map(|focus| focus.granularity))
        .unwrap_or(state.config.granularity);

    let last_bar_time = state
        .pipeline
        .latest_bar(&symbol, granularity)
        .map(|bar| bar.time)
        .unwrap_or_else(|| granularity.bucket_open_time(state.clock.now_unix_secs()));

    let existing_handle = {
        let mut driver_slot = state.countdown_driver.lock().await;
        driver_slot.take()
    };
    if let Some(mut handle) = existing_handle {
        handle.stop().await;
    }

    state.countdown.lock().reset(granularity, last_bar_time);
    let handle = spawn_countdown_driver(
        Arc::clone(&state.countdown),
        Arc::clone(&state.clock),
        Duration::from_millis(state.config.countdown_frame_ms),
        state.countdown_events.clone(),
    );

    {
        let mut driver_slot = state.countdown_driver.lock().await;
        *driver_slot = Some(handle);
    }

    tracing::info!(
        %symbol,
        granularity = granularity.as_str(),
        last_bar_time,
        "countdown started"
    );
    Ok(countdown_status(state))
}

pub async fn stop_countdown<F: BarFetcher, L: LiveFeed>(
    state: &AppState<F, L>,
) -> Result<CountdownStopResult, AppError> {
    let existing_handle = {
        let mut driver_slot = state.countdown_driver.lock().await;
        driver_slot.take()
    };

    let stopped = if let Some(mut handle) = existing_handle {
        handle.stop().await;
        true
    } else {
        false
    };
    state.countdown.lock().disable();

    Ok(CountdownStopResult { stopped })
}

pub fn countdown_status<F: BarFetcher, L: LiveFeed>(state: &AppState<F, L>) -> CountdownStatus {
    let (phase, granularity, last_bar_time) = {
        let readable = state.countdown.lock();
        (
            readable.phase(),
            readable.granularity(),
            readable.last_bar_time(),
        )
    };

    let live_state = (phase != CountdownPhase::Idle).then(|| {
        countdown_state(granularity, last_bar_time, state.clock.now_unix_secs())
    });

    CountdownStatus {
        phase,
        granularity,
        last_bar_time,
        state: live_state,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::countdown::CountdownEvent;
    use crate::market::types::TimeRange;
    use crate::state::test_support::test_state;

    const T: i64 = 1_700_000_040;

    #[tokio::test(start_paused = true)]
    async fn starts_from_latest_cached_bar() {
        let (state, _, _) = test_state(T + 30);
        state
            .pipeline
            .load_range("AAPL", Granularity::M1, TimeRange { start: T - 300, end: T + 60 })
            .await
            .expect("load");
        let mut events = state.countdown_events.subscribe();

        let status = start_countdown(
            &state,
            Some(StartCountdownArgs {
                symbol: Some("aapl".to_string()),
                granularity: Some(Granularity::M1),
            }),
        )
        .await
        .expect("start");

        assert_eq!(status.phase, CountdownPhase::Running);
        assert_eq!(status.last_bar_time, T);
        assert_eq!(status.state.map(|s| s.remaining_seconds), Some(30));

        let event = events.recv().await.expect("driver tick");
        assert!(matches!(event, CountdownEvent::Tick(ref s) if s.label == "00:30"));

        stop_countdown(&state).await.expect("stop");
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_to_clock_aligned_bar() {
        let (state, _, _) = test_state(T + 100);

        let status = start_countdown(&state, None).await.expect("start");

        assert_eq!(status.granularity, Granularity::M5);
        assert_eq!(status.last_bar_time, Granularity::M5.bucket_open_time(T + 100));
        stop_countdown(&state).await.expect("stop");
    }

    #[tokio::test(start_paused = true)]
    async fn restarting_replaces_the_driver() {
        let (state, _, _) = test_state(T);

        start_countdown(&state, None).await.expect("first start");
        start_countdown(&state, None).await.expect("second start");
        assert!(state
            .countdown_driver
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| handle.is_running()));

        assert!(stop_countdown(&state).await.expect("stop").stopped);
        assert!(!stop_countdown(&state).await.expect("second stop").stopped);
        let status = countdown_status(&state);
        assert_eq!(status.phase, CountdownPhase::Idle);
        assert!(status.state.is_none());
    }
}
