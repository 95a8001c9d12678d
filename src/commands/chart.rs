use crate::error::AppError;
use crate::market::countdown::CountdownPhase;
use crate::market::feed::LiveFeed;
use crate::market::pipeline::{BarFetcher, LoadOutcome, TickOutcome};
use crate::market::types::{Bar, ChartBarsArgs, Granularity, LiveTick};
use crate::state::{AppState, ChartFocus};
use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartBarsResponse {
    pub symbol: String,
    pub granularity: Granularity,
    pub start: i64,
    pub end: i64,
    pub source: &'static str,
    pub bars: Vec<Bar>,
}

/// Loads a window of bars and makes its series the chart focus. Moving the
/// focus to another series restarts an armed countdown on that series.
pub async fn chart_bars<F: BarFetcher, L: LiveFeed>(
    state: &AppState<F, L>,
    args: ChartBarsArgs,
) -> Result<ChartBarsResponse, AppError> {
    let request = args.normalize()?;
    let focus = ChartFocus {
        symbol: request.symbol.clone(),
        granularity: request.granularity,
    };
    let previous_focus = state.chart_focus.lock().replace(focus.clone());

    let outcome = state
        .pipeline
        .load_range(&request.symbol, request.granularity, request.range)
        .await?;
    if previous_focus.as_ref() != Some(&focus) {
        restart_countdown_for_focus(state, &focus);
    }
    let source = outcome.source();
    let bars = match outcome {
        LoadOutcome::Cached(bars) | LoadOutcome::Fetched(bars) => bars,
        LoadOutcome::Discarded => Vec::new(),
    };

    Ok(ChartBarsResponse {
        symbol: request.symbol,
        granularity: request.granularity,
        start: request.range.start,
        end: request.range.end,
        source,
        bars,
    })
}

fn restart_countdown_for_focus<F: BarFetcher, L: LiveFeed>(
    state: &AppState<F, L>,
    focus: &ChartFocus,
) {
    let last_bar_time = state
        .pipeline
        .latest_bar(&focus.symbol, focus.granularity)
        .map(|bar| bar.time)
        .unwrap_or_else(|| focus.granularity.bucket_open_time(state.clock.now_unix_secs()));

    let mut countdown = state.countdown.lock();
    if countdown.phase() == CountdownPhase::Idle {
        return;
    }
    countdown.reset(focus.granularity, last_bar_time);
    tracing::debug!(
        symbol = %focus.symbol,
        granularity = focus.granularity.as_str(),
        last_bar_time,
        "chart focus changed, countdown restarted"
    );
}

/// Folds a live tick into the focused series. When the tick opens a new bar
/// and the countdown is armed, the countdown restarts for that bar.
pub fn apply_live_tick<F: BarFetcher, L: LiveFeed>(
    state: &AppState<F, L>,
    tick: &LiveTick,
) -> Option<TickOutcome> {
    let focus = state.focus()?;
    if !tick.symbol.eq_ignore_ascii_case(&focus.symbol) {
        return None;
    }

    let outcome = state.pipeline.apply_tick(focus.granularity, tick)?;
    if outcome.opened_new_bar {
        let mut countdown = state.countdown.lock();
        if countdown.phase() != CountdownPhase::Idle {
            countdown.reset(focus.granularity, outcome.bar.time);
            tracing::debug!(
                symbol = %focus.symbol,
                bar_time = outcome.bar.time,
                "new bar opened, countdown restarted"
            );
        }
    }
    Some(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::countdown::{start_countdown, stop_countdown};
    use crate::market::types::BarTime;
    use crate::state::test_support::test_state;

    const T: i64 = 1_700_000_040;

    fn args(symbol: &str, start: i64, end: i64) -> ChartBarsArgs {
        ChartBarsArgs {
            symbol: symbol.to_string(),
            granularity: Granularity::M1,
            start: BarTime::Seconds(start),
            end: BarTime::Seconds(end),
        }
    }

    fn tick(symbol: &str, price: f64, time: i64) -> LiveTick {
        LiveTick {
            symbol: symbol.to_string(),
            price,
            volume: 1.0,
            time,
        }
    }

    #[tokio::test]
    async fn chart_bars_reports_source_and_focus() {
        let (state, _, _) = test_state(T);

        let first = chart_bars(&state, args("aapl", T, T + 600))
            .await
            .expect("first load");
        assert_eq!(first.symbol, "AAPL");
        assert_eq!(first.source, "network");
        assert_eq!(first.bars.len(), 10);

        let second = chart_bars(&state, args("AAPL", T + 120, T + 300))
            .await
            .expect("second load");
        assert_eq!(second.source, "cache");
        assert_eq!(second.bars.len(), 3);
        assert_eq!(
            state.focus(),
            Some(ChartFocus {
                symbol: "AAPL".to_string(),
                granularity: Granularity::M1,
            })
        );
    }

    #[tokio::test]
    async fn chart_bars_rejects_inverted_range() {
        let (state, _, _) = test_state(T);
        let result = chart_bars(&state, args("AAPL", T + 600, T)).await;
        assert!(matches!(result, Err(AppError::InvalidArgument(_))));
        assert_eq!(state.pipeline.fetcher().request_count(), 0);
    }

    #[tokio::test]
    async fn new_bar_from_tick_restarts_armed_countdown() {
        let (state, _, _) = test_state(T);
        chart_bars(&state, args("AAPL", T, T + 600))
            .await
            .expect("load");
        state.countdown.lock().reset(Granularity::M1, T + 540);

        let outcome = apply_live_tick(&state, &tick("AAPL", 99.0, T + 610)).expect("applied");
        assert!(outcome.opened_new_bar);

        let countdown = state.countdown.lock();
        assert_eq!(countdown.phase(), CountdownPhase::Running);
        assert_eq!(countdown.last_bar_time(), T + 600);
    }

    #[tokio::test(start_paused = true)]
    async fn focus_change_moves_running_countdown_to_new_series() {
        let (state, _, _) = test_state(T);
        chart_bars(&state, args("AAPL", T, T + 600))
            .await
            .expect("minute load");
        start_countdown(&state, None).await.expect("start");
        assert_eq!(state.countdown.lock().granularity(), Granularity::M1);

        let day = Granularity::D1.duration_secs();
        chart_bars(
            &state,
            ChartBarsArgs {
                symbol: "AAPL".to_string(),
                granularity: Granularity::D1,
                start: BarTime::Seconds(T - 10 * day),
                end: BarTime::Seconds(T + day),
            },
        )
        .await
        .expect("daily load");

        let latest_daily = state
            .pipeline
            .latest_bar("AAPL", Granularity::D1)
            .expect("daily bars cached");
        {
            let countdown = state.countdown.lock();
            assert_eq!(countdown.phase(), CountdownPhase::Running);
            assert_eq!(countdown.granularity(), Granularity::D1);
            assert_eq!(countdown.last_bar_time(), latest_daily.time);
        }

        stop_countdown(&state).await.expect("stop");
    }

    #[tokio::test]
    async fn focus_change_leaves_idle_countdown_alone() {
        let (state, _, _) = test_state(T);
        chart_bars(&state, args("AAPL", T, T + 600))
            .await
            .expect("load");
        chart_bars(&state, args("MSFT", T, T + 600))
            .await
            .expect("other symbol");
        assert_eq!(state.countdown.lock().phase(), CountdownPhase::Idle);
    }

    #[tokio::test]
    async fn ticks_for_other_symbols_are_ignored() {
        let (state, _, _) = test_state(T);
        chart_bars(&state, args("AAPL", T, T + 600))
            .await
            .expect("load");

        assert!(apply_live_tick(&state, &tick("MSFT", 10.0, T + 610)).is_none());
        assert_eq!(state.countdown.lock().phase(), CountdownPhase::Idle);
    }
}
