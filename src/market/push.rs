use crate::error::AppError;
use crate::market::feed::{stock_channel, LiveFeed};
use crate::market::types::{normalize_symbol, ThrottleTier};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

const CHANGE_CHANNEL_CAPACITY: usize = 32;

struct RouteRule {
    pattern: &'static str,
    tier: ThrottleTier,
}

/// Evaluated top to bottom; the first substring hit decides the tier.
const ROUTE_RULES: [RouteRule; 7] = [
    RouteRule {
        pattern: "trading",
        tier: ThrottleTier::Realtime,
    },
    RouteRule {
        pattern: "order",
        tier: ThrottleTier::Realtime,
    },
    RouteRule {
        pattern: "virtual-market",
        tier: ThrottleTier::Realtime,
    },
    RouteRule {
        pattern: "market",
        tier: ThrottleTier::Realtime,
    },
    RouteRule {
        pattern: "quote",
        tier: ThrottleTier::Realtime,
    },
    RouteRule {
        pattern: "chart",
        tier: ThrottleTier::Slow,
    },
    RouteRule {
        pattern: "detail",
        tier: ThrottleTier::Slow,
    },
];

pub fn tier_for_route(path: &str) -> ThrottleTier {
    let path = path.to_ascii_lowercase();
    ROUTE_RULES
        .iter()
        .find(|rule| path.contains(rule.pattern))
        .map(|rule| rule.tier)
        .unwrap_or(ThrottleTier::Lazy)
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ThrottleChange {
    pub from: ThrottleTier,
    pub to: ThrottleTier,
    pub interval_ms: u64,
    pub route: Option<String>,
}

/// Negotiates live tick cadence with the feed based on the active screen.
pub struct AdaptivePushController<L: LiveFeed> {
    feed: Arc<L>,
    auto_adjust: bool,
    active_tier: ThrottleTier,
    last_route: Option<String>,
    changes: broadcast::Sender<ThrottleChange>,
}

impl<L: LiveFeed> AdaptivePushController<L> {
    /// Starts at `Normal`, the feed's own default cadence, without issuing a
    /// request.
    pub fn new(feed: Arc<L>, auto_adjust: bool) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            feed,
            auto_adjust,
            active_tier: ThrottleTier::Normal,
            last_route: None,
            changes,
        }
    }

    pub fn active_tier(&self) -> ThrottleTier {
        self.active_tier
    }

    pub fn auto_adjust(&self) -> bool {
        self.auto_adjust
    }

    pub fn changes(&self) -> broadcast::Receiver<ThrottleChange> {
        self.changes.subscribe()
    }

    pub fn on_route_change(&mut self, path: &str) -> Result<Option<ThrottleChange>, AppError> {
        self.last_route = Some(path.to_string());
        if !self.auto_adjust {
            return Ok(None);
        }
        self.apply_tier(tier_for_route(path))
    }

    /// Disabling pins the feed to `Normal`; enabling re-evaluates the last
    /// route seen.
    pub fn set_auto_adjust(&mut self, enabled: bool) -> Result<Option<ThrottleChange>, AppError> {
        self.auto_adjust = enabled;
        let target = match (enabled, self.last_route.as_deref()) {
            (false, _) => ThrottleTier::Normal,
            (true, Some(path)) => tier_for_route(path),
            (true, None) => return Ok(None),
        };
        self.apply_tier(target)
    }

    pub fn subscribe_symbol(&self, symbol: &str) -> Result<String, AppError> {
        let channel = stock_channel(&normalize_symbol(symbol)?);
        self.feed.subscribe(&channel)?;
        Ok(channel)
    }

    pub fn unsubscribe_symbol(&self, symbol: &str) -> Result<String, AppError> {
        let channel = stock_channel(&normalize_symbol(symbol)?);
        self.feed.unsubscribe(&channel)?;
        Ok(channel)
    }

    fn apply_tier(&mut self, tier: ThrottleTier) -> Result<Option<ThrottleChange>, AppError> {
        if tier == self.active_tier {
            return Ok(None);
        }

        self.feed.set_throttle(tier.interval_ms())?;
        let change = ThrottleChange {
            from: self.active_tier,
            to: tier,
            interval_ms: tier.interval_ms(),
            route: self.last_route.clone(),
        };
        self.active_tier = tier;

        tracing::info!(
            from = change.from.as_str(),
            to = change.to.as_str(),
            interval_ms = change.interval_ms,
            "live feed throttle changed"
        );
        let _ = self.changes.send(change.clone());
        Ok(Some(change))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::feed::{FeedRequest, RecordingFeed};

    fn controller(auto_adjust: bool) -> (Arc<RecordingFeed>, AdaptivePushController<RecordingFeed>) {
        let feed = Arc::new(RecordingFeed::new());
        let controller = AdaptivePushController::new(Arc::clone(&feed), auto_adjust);
        (feed, controller)
    }

    #[test]
    fn maps_routes_to_tiers() {
        assert_eq!(tier_for_route("/virtual-market/AAPL"), ThrottleTier::Realtime);
        assert_eq!(tier_for_route("/trading/orders"), ThrottleTier::Realtime);
        assert_eq!(tier_for_route("/quote/MSFT"), ThrottleTier::Realtime);
        assert_eq!(tier_for_route("/chart/AAPL"), ThrottleTier::Slow);
        assert_eq!(tier_for_route("/stock/AAPL/detail"), ThrottleTier::Slow);
        assert_eq!(tier_for_route("/settings/profile"), ThrottleTier::Lazy);
        assert_eq!(tier_for_route("/"), ThrottleTier::Lazy);
    }

    #[test]
    fn market_rules_take_precedence_over_chart() {
        assert_eq!(tier_for_route("/market/chart/AAPL"), ThrottleTier::Realtime);
    }

    #[test]
    fn same_tier_issues_no_duplicate_request() {
        let (feed, mut controller) = controller(true);

        let change = controller
            .on_route_change("/virtual-market/AAPL")
            .expect("route change")
            .expect("tier should change");
        assert_eq!(change.to, ThrottleTier::Realtime);

        let repeat = controller
            .on_route_change("/virtual-market/MSFT")
            .expect("route change");
        assert!(repeat.is_none());
        assert_eq!(feed.requests(), vec![FeedRequest::Throttle(250)]);
    }

    #[test]
    fn route_changes_walk_through_tiers() {
        let (feed, mut controller) = controller(true);
        let mut changes = controller.changes();

        let _ = controller.on_route_change("/chart/AAPL").expect("chart");
        let _ = controller.on_route_change("/settings").expect("settings");

        assert_eq!(controller.active_tier(), ThrottleTier::Lazy);
        assert_eq!(
            feed.requests(),
            vec![FeedRequest::Throttle(3_000), FeedRequest::Throttle(10_000)]
        );
        let first = changes.try_recv().expect("first change published");
        assert_eq!(first.from, ThrottleTier::Normal);
        assert_eq!(first.to, ThrottleTier::Slow);
        assert_eq!(first.route.as_deref(), Some("/chart/AAPL"));
    }

    #[test]
    fn disabled_auto_adjust_stays_normal() {
        let (feed, mut controller) = controller(false);

        assert!(controller
            .on_route_change("/virtual-market/AAPL")
            .expect("route change")
            .is_none());
        assert_eq!(controller.active_tier(), ThrottleTier::Normal);
        assert!(feed.requests().is_empty());

        let change = controller
            .set_auto_adjust(true)
            .expect("enable")
            .expect("re-evaluates last route");
        assert_eq!(change.to, ThrottleTier::Realtime);

        let change = controller
            .set_auto_adjust(false)
            .expect("disable")
            .expect("reverts to normal");
        assert_eq!(change.to, ThrottleTier::Normal);
        assert_eq!(
            feed.requests(),
            vec![FeedRequest::Throttle(250), FeedRequest::Throttle(1_000)]
        );
    }

    #[test]
    fn symbol_subscriptions_use_stock_channels() {
        let (feed, controller) = controller(true);

        assert_eq!(
            controller.subscribe_symbol("aapl").expect("subscribe"),
            "stock:AAPL"
        );
        controller.subscribe_symbol("AAPL").expect("duplicate subscribe");
        controller.unsubscribe_symbol("AAPL").expect("unsubscribe");

        assert_eq!(
            feed.requests(),
            vec![
                FeedRequest::Subscribe("stock:AAPL".to_string()),
                FeedRequest::Unsubscribe("stock:AAPL".to_string()),
            ]
        );
        assert!(controller.subscribe_symbol("AA|PL").is_err());
    }
}
