use crate::market::countdown::CountdownPhase;
use crate::market::feed::LiveFeed;
use crate::market::pipeline::BarFetcher;
use crate::market::types::ThrottleTier;
use crate::state::AppState;
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub cached_ranges: usize,
    pub cache_capacity: usize,
    pub throttle_tier: ThrottleTier,
    pub countdown: CountdownPhase,
    pub mock_mode: bool,
}

pub fn build_health_response<F: BarFetcher, L: LiveFeed>(
    started_at: Instant,
    state: &AppState<F, L>,
) -> HealthResponse {
    HealthResponse {
        status: "ok",
        uptime_ms: started_at.elapsed().as_millis(),
        cached_ranges: state.pipeline.cache_size(),
        cache_capacity: state.config.cache_capacity,
        throttle_tier: state.push.lock().active_tier(),
        countdown: state.countdown.lock().phase(),
        mock_mode: state.config.mock_mode,
    }
}

pub fn health<F: BarFetcher, L: LiveFeed>(state: &AppState<F, L>) -> HealthResponse {
    build_health_response(state.started_at, state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::types::{Granularity, TimeRange};
    use crate::state::test_support::test_state;

    #[tokio::test]
    async fn health_reports_session_state() {
        let (state, _, _) = test_state(1_700_000_040);
        state
            .pipeline
            .load_range(
                "AAPL",
                Granularity::M1,
                TimeRange {
                    start: 1_700_000_040,
                    end: 1_700_000_340,
                },
            )
            .await
            .expect("load");

        let response = build_health_response(Instant::now(), &state);

        assert_eq!(response.status, "ok");
        assert_eq!(response.cached_ranges, 1);
        assert_eq!(response.cache_capacity, 10);
        assert_eq!(response.throttle_tier, ThrottleTier::Normal);
        assert_eq!(response.countdown, CountdownPhase::Idle);
        assert!(response.uptime_ms <= 1_000);
    }
}
