use crate::error::AppError;
use crate::market::feed::LiveFeed;
use crate::market::pipeline::BarFetcher;
use crate::market::push::ThrottleChange;
use crate::market::types::ThrottleTier;
use crate::state::AppState;
use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ThrottleStatus {
    pub tier: ThrottleTier,
    pub interval_ms: u64,
    pub auto_adjust: bool,
}

pub fn route_changed<F: BarFetcher, L: LiveFeed>(
    state: &AppState<F, L>,
    path: &str,
) -> Result<Option<ThrottleChange>, AppError> {
    state.push.lock().on_route_change(path)
}

pub fn set_auto_throttle<F: BarFetcher, L: LiveFeed>(
    state: &AppState<F, L>,
    enabled: bool,
) -> Result<Option<ThrottleChange>, AppError> {
    state.push.lock().set_auto_adjust(enabled)
}

pub fn subscribe_symbol<F: BarFetcher, L: LiveFeed>(
    state: &AppState<F, L>,
    symbol: &str,
) -> Result<String, AppError> {
    state.push.lock().subscribe_symbol(symbol)
}

pub fn unsubscribe_symbol<F: BarFetcher, L: LiveFeed>(
    state: &AppState<F, L>,
    symbol: &str,
) -> Result<String, AppError> {
    state.push.lock().unsubscribe_symbol(symbol)
}

pub fn throttle_status<F: BarFetcher, L: LiveFeed>(state: &AppState<F, L>) -> ThrottleStatus {
    let push = state.push.lock();
    ThrottleStatus {
        tier: push.active_tier(),
        interval_ms: push.active_tier().interval_ms(),
        auto_adjust: push.auto_adjust(),
    }
}
