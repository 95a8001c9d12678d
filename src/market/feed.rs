use crate::error::AppError;
use crate::market::types::{parse_live_tick_payload, LiveTick};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

pub const STOCK_CHANNEL_PREFIX: &str = "stock:";
const TICK_CHANNEL_CAPACITY: usize = 256;

pub fn stock_channel(symbol: &str) -> String {
    format!("{STOCK_CHANNEL_PREFIX}{symbol}")
}

/// Upstream live tick source. Requests are fire-and-forget; the feed owns
/// delivery, connection and retry.
pub trait LiveFeed: Send + Sync + 'static {
    fn subscribe(&self, channel: &str) -> Result<(), AppError>;
    fn unsubscribe(&self, channel: &str) -> Result<(), AppError>;
    fn set_throttle(&self, interval_ms: u64) -> Result<(), AppError>;
    fn ticks(&self) -> broadcast::Receiver<LiveTick>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedRequest {
    Subscribe(String),
    Unsubscribe(String),
    Throttle(u64),
}

#[derive(Debug, Default)]
struct FeedLedger {
    channels: BTreeSet<String>,
    throttle_ms: Option<u64>,
    requests: Vec<FeedRequest>,
}

/// In-process feed used in mock mode: records what was asked of it and lets
/// the caller inject ticks.
pub struct RecordingFeed {
    ledger: Mutex<FeedLedger>,
    tick_tx: broadcast::Sender<LiveTick>,
}

impl Default for RecordingFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingFeed {
    pub fn new() -> Self {
        let (tick_tx, _) = broadcast::channel(TICK_CHANNEL_CAPACITY);
        Self {
            ledger: Mutex::new(FeedLedger::default()),
            tick_tx,
        }
    }

    pub fn publish(&self, tick: LiveTick) -> usize {
        self.tick_tx.send(tick).unwrap_or(0)
    }

    pub fn requests(&self) -> Vec<FeedRequest> {
        self.ledger.lock().requests.clone()
    }

    pub fn channels(&self) -> Vec<String> {
        self.ledger.lock().channels.iter().cloned().collect()
    }

    pub fn throttle_ms(&self) -> Option<u64> {
        self.ledger.lock().throttle_ms
    }
}

impl LiveFeed for RecordingFeed {
    fn subscribe(&self, channel: &str) -> Result<(), AppError> {
        let mut ledger = self.ledger.lock();
        if ledger.channels.insert(channel.to_string()) {
            ledger
                .requests
                .push(FeedRequest::Subscribe(channel.to_string()));
        }
        Ok(())
    }

    fn unsubscribe(&self, channel: &str) -> Result<(), AppError> {
        let mut ledger = self.ledger.lock();
        if ledger.channels.remove(channel) {
            ledger
                .requests
                .push(FeedRequest::Unsubscribe(channel.to_string()));
        }
        Ok(())
    }

    fn set_throttle(&self, interval_ms: u64) -> Result<(), AppError> {
        let mut ledger = self.ledger.lock();
        ledger.throttle_ms = Some(interval_ms);
        ledger.requests.push(FeedRequest::Throttle(interval_ms));
        Ok(())
    }

    fn ticks(&self) -> broadcast::Receiver<LiveTick> {
        self.tick_tx.subscribe()
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum FeedFrame<'a> {
    Subscribe {
        channel: &'a str,
    },
    Unsubscribe {
        channel: &'a str,
    },
    Throttle {
        #[serde(rename = "intervalMs")]
        interval_ms: u64,
    },
}

fn encode_frame(frame: &FeedFrame<'_>) -> Result<String, AppError> {
    Ok(simd_json::to_string(frame)?)
}

/// Websocket feed. A background task owns the socket; requests travel over an
/// unbounded command channel so callers never block.
pub struct WsLiveFeed {
    commands: mpsc::UnboundedSender<FeedRequest>,
    tick_tx: broadcast::Sender<LiveTick>,
    cancellation_token: CancellationToken,
    join_handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl WsLiveFeed {
    pub fn connect(url: String) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (tick_tx, _) = broadcast::channel(TICK_CHANNEL_CAPACITY);
        let cancellation_token = CancellationToken::new();

        let task_ticks = tick_tx.clone();
        let task_token = cancellation_token.clone();
        let join_handle = tokio::spawn(async move {
            run_feed_loop(url, command_rx, task_ticks, task_token).await;
        });

        Self {
            commands,
            tick_tx,
            cancellation_token,
            join_handle: tokio::sync::Mutex::new(Some(join_handle)),
        }
    }

    pub async fn shutdown(&self) {
        self.cancellation_token.cancel();
        let handle = self.join_handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn enqueue(&self, request: FeedRequest) -> Result<(), AppError> {
        self.commands
            .send(request)
            .map_err(|_| AppError::FeedClosed)
    }
}

impl Drop for WsLiveFeed {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

impl LiveFeed for WsLiveFeed {
    fn subscribe(&self, channel: &str) -> Result<(), AppError> {
        self.enqueue(FeedRequest::Subscribe(channel.to_string()))
    }

    fn unsubscribe(&self, channel: &str) -> Result<(), AppError> {
        self.enqueue(FeedRequest::Unsubscribe(channel.to_string()))
    }

    fn set_throttle(&self, interval_ms: u64) -> Result<(), AppError> {
        self.enqueue(FeedRequest::Throttle(interval_ms))
    }

    fn ticks(&self) -> broadcast::Receiver<LiveTick> {
        self.tick_tx.subscribe()
    }
}

/// Desired feed state that survives reconnects.
#[derive(Debug, Default)]
struct DesiredFeedState {
    channels: BTreeSet<String>,
    throttle_ms: Option<u64>,
}

impl DesiredFeedState {
    /// Folds a request into the desired state and returns the frame to send
    /// now, if the request changed anything.
    fn apply(&mut self, request: &FeedRequest) -> Option<String> {
        let frame = match request {
            FeedRequest::Subscribe(channel) => {
                if !self.channels.insert(channel.clone()) {
                    return None;
                }
                FeedFrame::Subscribe { channel }
            }
            FeedRequest::Unsubscribe(channel) => {
                if !self.channels.remove(channel) {
                    return None;
                }
                FeedFrame::Unsubscribe { channel }
            }
            FeedRequest::Throttle(interval_ms) => {
                if self.throttle_ms == Some(*interval_ms) {
                    return None;
                }
                self.throttle_ms = Some(*interval_ms);
                FeedFrame::Throttle {
                    interval_ms: *interval_ms,
                }
            }
        };

        match encode_frame(&frame) {
            Ok(text) => Some(text),
            Err(error) => {
                tracing::warn!("failed to encode feed frame: {error}");
                None
            }
        }
    }

    fn replay_frames(&self) -> Vec<String> {
        let mut frames: Vec<String> = self
            .channels
            .iter()
            .filter_map(|channel| encode_frame(&FeedFrame::Subscribe { channel }).ok())
            .collect();
        if let Some(interval_ms) = self.throttle_ms {
            if let Ok(text) = encode_frame(&FeedFrame::Throttle { interval_ms }) {
                frames.push(text);
            }
        }
        frames
    }
}

type FeedStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect_feed(url: &str) -> Result<FeedStream, AppError> {
    let (stream, _) = tokio_tungstenite::connect_async(url).await?;
    Ok(stream)
}

async fn send_frame(
    writer: &mut SplitSink<FeedStream, Message>,
    frame: String,
) -> Result<(), AppError> {
    writer.send(Message::Text(frame)).await?;
    Ok(())
}

enum ConnectionExit {
    Reconnect,
    Shutdown,
}

async fn run_feed_loop(
    url: String,
    mut command_rx: mpsc::UnboundedReceiver<FeedRequest>,
    tick_tx: broadcast::Sender<LiveTick>,
    cancel_token: CancellationToken,
) {
    let mut desired = DesiredFeedState::default();
    let mut reconnect_attempt = 0_u32;

    while !cancel_token.is_cancelled() {
        tracing::info!(url = %url, attempt = reconnect_attempt, "connecting live feed");

        let connect = tokio::select! {
            _ = cancel_token.cancelled() => break,
            result = connect_feed(&url) => result,
        };

        match connect {
            Ok(stream) => {
                reconnect_attempt = 0;
                tracing::info!(url = %url, "live feed connected");

                while let Ok(request) = command_rx.try_recv() {
                    let _ = desired.apply(&request);
                }

                let (mut writer, mut reader) = stream.split();
                let mut exit = ConnectionExit::Reconnect;
                for frame in desired.replay_frames() {
                    if let Err(error) = send_frame(&mut writer, frame).await {
                        tracing::warn!("live feed replay failed: {error}");
                        break;
                    }
                }

                loop {
                    tokio::select! {
                        _ = cancel_token.cancelled() => {
                            let _ = writer.send(Message::Close(None)).await;
                            exit = ConnectionExit::Shutdown;
                            break;
                        }
                        request = command_rx.recv() => {
                            let Some(request) = request else {
                                exit = ConnectionExit::Shutdown;
                                break;
                            };
                            if let Some(frame) = desired.apply(&request) {
                                if let Err(error) = send_frame(&mut writer, frame).await {
                                    tracing::warn!("live feed send failed: {error}");
                                    break;
                                }
                            }
                        }
                        message = reader.next() => {
                            match message {
                                Some(Ok(Message::Text(text))) => {
                                    publish_tick(&tick_tx, text.into_bytes());
                                }
                                Some(Ok(Message::Binary(payload))) => {
                                    publish_tick(&tick_tx, payload);
                                }
                                Some(Ok(Message::Ping(payload))) => {
                                    let _ = writer.send(Message::Pong(payload)).await;
                                }
                                Some(Ok(Message::Close(_))) | None => break,
                                Some(Ok(_)) => {}
                                Some(Err(error)) => {
                                    tracing::warn!("live feed read error: {error}");
                                    break;
                                }
                            }
                        }
                    }
                }

                if matches!(exit, ConnectionExit::Shutdown) {
                    break;
                }
            }
            Err(error) => {
                tracing::warn!("live feed connect error: {error}");
            }
        }

        reconnect_attempt = reconnect_attempt.saturating_add(1);
        let delay = reconnect_delay(reconnect_attempt);
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    tracing::info!(url = %url, "live feed stopped");
}

fn publish_tick(tick_tx: &broadcast::Sender<LiveTick>, mut payload: Vec<u8>) {
    match parse_live_tick_payload(payload.as_mut_slice()) {
        Ok(tick) => {
            let _ = tick_tx.send(tick);
        }
        Err(error) => tracing::debug!("ignoring live feed payload: {error}"),
    }
}

fn reconnect_delay(attempt: u32) -> Duration {
    let exponent = attempt.min(6);
    let base_ms = 200_u64.saturating_mul(1_u64 << exponent);
    let jitter_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::from(elapsed.subsec_millis()) % 250)
        .unwrap_or(0);
    Duration::from_millis((base_ms + jitter_ms).min(5_000))
}
