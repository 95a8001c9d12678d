pub mod commands;
pub mod config;
pub mod error;
pub mod market;
pub mod state;

use commands::{
    app_info::app_info,
    chart::{apply_live_tick, chart_bars},
    countdown::{start_countdown, stop_countdown},
    health::health,
    navigation::{route_changed, subscribe_symbol, unsubscribe_symbol},
};
use error::AppError;
use market::countdown::CountdownEvent;
use market::feed::{LiveFeed, RecordingFeed, WsLiveFeed};
use market::mock::{run_mock_ticks, MockBarFetcher};
use market::pipeline::BarFetcher;
use market::rest::RestBarFetcher;
use market::types::{BarTime, ChartBarsArgs, SessionConfig};
use state::AppState;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const INITIAL_WINDOW_BARS: i64 = 120;

/// Installs the global `tracing` subscriber. `RUST_LOG` overrides the default
/// `info` filter. A second call is a no-op.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}

/// Runs one chart session configured from the environment until ctrl-c.
pub async fn run() -> Result<(), AppError> {
    let config = config::args_from_env()?.normalize()?;
    let info = app_info();
    tracing::info!(
        version = %info.version,
        symbol = %config.symbol,
        granularity = config.granularity.as_str(),
        mock_mode = config.mock_mode,
        "starting {}",
        info.product_name
    );

    if config.mock_mode {
        run_mock_session(config).await
    } else {
        run_live_session(config).await
    }
}

async fn run_mock_session(config: SessionConfig) -> Result<(), AppError> {
    let feed = Arc::new(RecordingFeed::new());
    let state = AppState::new(config, MockBarFetcher::new(), Arc::clone(&feed));

    let cancel_token = CancellationToken::new();
    let producer = tokio::spawn(run_mock_ticks(
        Arc::clone(&feed),
        state.config.symbol.clone(),
        Arc::clone(&state.clock),
        cancel_token.clone(),
    ));

    let result = drive_session(&state).await;

    cancel_token.cancel();
    let _ = producer.await;
    state.shutdown().await;
    result
}

async fn run_live_session(config: SessionConfig) -> Result<(), AppError> {
    let fetcher = RestBarFetcher::new(config.rest_base_url.clone())?;
    let feed = Arc::new(WsLiveFeed::connect(config.feed_url.clone()));
    let state = AppState::new(config, fetcher, Arc::clone(&feed));

    let result = drive_session(&state).await;

    state.shutdown().await;
    feed.shutdown().await;
    result
}

/// Subscribes the configured symbol, shows its chart, arms the countdown and
/// folds live ticks into the cache until ctrl-c or the feed closes.
async fn drive_session<F: BarFetcher, L: LiveFeed>(state: &AppState<F, L>) -> Result<(), AppError> {
    let symbol = state.config.symbol.clone();
    let granularity = state.config.granularity;

    let mut ticks = state.feed.ticks();
    let mut countdown_events = state.countdown_events.subscribe();

    subscribe_symbol(state, &symbol)?;
    route_changed(state, &format!("/chart/{symbol}"))?;

    let now = state.clock.now_unix_secs();
    let end = granularity.bucket_open_time(now) + granularity.duration_secs();
    let start = end - granularity.duration_secs() * INITIAL_WINDOW_BARS;
    let response = chart_bars(
        state,
        ChartBarsArgs {
            symbol: symbol.clone(),
            granularity,
            start: BarTime::Seconds(start),
            end: BarTime::Seconds(end),
        },
    )
    .await?;
    tracing::info!(
        bars = response.bars.len(),
        source = response.source,
        "initial chart window loaded"
    );

    start_countdown(state, None).await?;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("shutdown requested");
                break;
            }
            tick = ticks.recv() => match tick {
                Ok(tick) => {
                    if let Some(outcome) = apply_live_tick(state, &tick) {
                        tracing::debug!(
                            bar_time = outcome.bar.time,
                            close = outcome.bar.close,
                            opened = outcome.opened_new_bar,
                            "live tick applied"
                        );
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "live tick receiver lagged");
                }
                Err(RecvError::Closed) => {
                    tracing::warn!("live feed closed");
                    break;
                }
            },
            event = countdown_events.recv() => match event {
                Ok(CountdownEvent::Expired { granularity, last_bar_time }) => {
                    tracing::info!(
                        granularity = granularity.as_str(),
                        last_bar_time,
                        "bar countdown expired"
                    );
                }
                Ok(CountdownEvent::Tick(countdown)) => {
                    tracing::trace!(label = %countdown.label, "countdown");
                }
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }

    let report = health(state);
    tracing::info!(
        cached_ranges = report.cached_ranges,
        throttle_tier = report.throttle_tier.as_str(),
        uptime_ms = u64::try_from(report.uptime_ms).unwrap_or(u64::MAX),
        "session summary"
    );

    stop_countdown(state).await?;
    unsubscribe_symbol(state, &symbol)?;
    Ok(())
}
