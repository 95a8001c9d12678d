use crate::market::types::{CountdownState, Granularity};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub trait Clock: Send + Sync + 'static {
    fn now_unix_secs(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix_secs(&self) -> i64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(duration) => duration.as_secs().min(i64::MAX as u64) as i64,
            Err(_) => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CountdownPhase {
    Idle,
    Running,
    Expired,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CountdownEvent {
    Tick(CountdownState),
    #[serde(rename_all = "camelCase")]
    Expired {
        granularity: Granularity,
        last_bar_time: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountdownUpdate {
    pub state: CountdownState,
    /// Set only on the tick that moved the scheduler into `Expired`.
    pub expired_now: bool,
}

/// Seconds left in the bar opened at `last_bar_time`, clamped at zero once a
/// full slot has elapsed. Clock skew that puts `now` before the bar counts as
/// zero elapsed.
pub fn remaining_seconds(granularity: Granularity, last_bar_time: i64, now: i64) -> u64 {
    let interval = granularity.duration_secs();
    let elapsed = now.saturating_sub(last_bar_time).max(0);
    if elapsed >= interval {
        return 0;
    }
    (interval - elapsed) as u64
}

pub fn format_countdown(remaining_seconds: u64, granularity: Granularity) -> String {
    if granularity.is_intraday() {
        format!("{:02}:{:02}", remaining_seconds / 60, remaining_seconds % 60)
    } else {
        format!(
            "{:02}:{:02}:{:02}",
            remaining_seconds / 3_600,
            (remaining_seconds % 3_600) / 60,
            remaining_seconds % 60
        )
    }
}

pub fn countdown_state(granularity: Granularity, last_bar_time: i64, now: i64) -> CountdownState {
    let remaining = remaining_seconds(granularity, last_bar_time, now);
    CountdownState {
        remaining_seconds: remaining,
        is_expired: remaining == 0,
        label: format_countdown(remaining, granularity),
    }
}

#[derive(Debug)]
pub struct CountdownScheduler {
    phase: CountdownPhase,
    granularity: Granularity,
    last_bar_time: i64,
    last_evaluated_second: Option<i64>,
}

impl Default for CountdownScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl CountdownScheduler {
    pub fn new() -> Self {
        Self {
            phase: CountdownPhase::Idle,
            granularity: Granularity::M1,
            last_bar_time: 0,
            last_evaluated_second: None,
        }
    }

    pub fn phase(&self) -> CountdownPhase {
        self.phase
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn last_bar_time(&self) -> i64 {
        self.last_bar_time
    }

    /// Arms the countdown for a new bar; the next tick recomputes immediately.
    pub fn reset(&mut self, granularity: Granularity, last_bar_time: i64) {
        self.granularity = granularity;
        self.last_bar_time = last_bar_time;
        self.last_evaluated_second = None;
        self.phase = CountdownPhase::Running;
    }

    pub fn disable(&mut self) {
        self.phase = CountdownPhase::Idle;
        self.last_evaluated_second = None;
    }

    /// Recomputes the countdown at most once per wall-clock second.
    pub fn tick(&mut self, now: i64) -> Option<CountdownUpdate> {
        if self.phase == CountdownPhase::Idle || self.last_evaluated_second == Some(now) {
            return None;
        }
        self.last_evaluated_second = Some(now);

        let state = countdown_state(self.granularity, self.last_bar_time, now);
        let expired_now = state.is_expired && self.phase == CountdownPhase::Running;
        if expired_now {
            self.phase = CountdownPhase::Expired;
        }

        Some(CountdownUpdate { state, expired_now })
    }
}

pub struct CountdownHandle {
    cancellation_token: CancellationToken,
    join_handle: Option<JoinHandle<()>>,
}

impl CountdownHandle {
    pub fn is_running(&self) -> bool {
        self.join_handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Halts the driver and waits for it. Calling it again is a no-op.
    pub async fn stop(&mut self) {
        self.cancellation_token.cancel();
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for CountdownHandle {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

pub fn spawn_countdown_driver(
    scheduler: Arc<Mutex<CountdownScheduler>>,
    clock: Arc<dyn Clock>,
    frame: Duration,
    events: broadcast::Sender<CountdownEvent>,
) -> CountdownHandle {
    let cancellation_token = CancellationToken::new();
    let task_token = cancellation_token.clone();

    let join_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(frame);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = task_token.cancelled() => break,
                _ = ticker.tick() => {
                    let now = clock.now_unix_secs();
                    let (update, granularity, last_bar_time) = {
                        let mut writable = scheduler.lock();
                        (writable.tick(now), writable.granularity(), writable.last_bar_time())
                    };

                    let Some(update) = update else {
                        continue;
                    };

                    let _ = events.send(CountdownEvent::Tick(update.state));
                    if update.expired_now {
                        tracing::debug!(
                            granularity = granularity.as_str(),
                            last_bar_time,
                            "bar countdown expired"
                        );
                        let _ = events.send(CountdownEvent::Expired {
                            granularity,
                            last_bar_time,
                        });
                    }
                }
            }
        }
    });

    CountdownHandle {
        cancellation_token,
        join_handle: Some(join_handle),
    }
}
