use crate::error::AppError;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const DEFAULT_SYMBOL: &str = "AAPL";
pub const DEFAULT_GRANULARITY: Granularity = Granularity::M5;
pub const DEFAULT_CACHE_CAPACITY: usize = 10;
pub const DEFAULT_COUNTDOWN_FRAME_MS: u64 = 250;
pub const DEFAULT_AUTO_THROTTLE: bool = true;
pub const DEFAULT_MOCK_MODE: bool = true;
pub const DEFAULT_REST_BASE_URL: &str = "http://127.0.0.1:8080";
pub const DEFAULT_FEED_URL: &str = "ws://127.0.0.1:8080/ws";
pub const MIN_CACHE_CAPACITY: usize = 1;
pub const MAX_CACHE_CAPACITY: usize = 256;
pub const MIN_COUNTDOWN_FRAME_MS: u64 = 16;
pub const MAX_COUNTDOWN_FRAME_MS: u64 = 1_000;
pub const MAX_SYMBOL_LEN: usize = 16;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Granularity {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "1w")]
    W1,
    #[serde(rename = "1M")]
    Mo1,
}

impl Granularity {
    pub const ALL: [Granularity; 9] = [
        Self::M1,
        Self::M5,
        Self::M15,
        Self::M30,
        Self::H1,
        Self::H4,
        Self::D1,
        Self::W1,
        Self::Mo1,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
            Self::W1 => "1w",
            Self::Mo1 => "1M",
        }
    }

    /// Slot width in seconds. A month is a fixed 30 days; calendar months are
    /// not modeled.
    pub fn duration_secs(self) -> i64 {
        match self {
            Self::M1 => 60,
            Self::M5 => 300,
            Self::M15 => 900,
            Self::M30 => 1_800,
            Self::H1 => 3_600,
            Self::H4 => 14_400,
            Self::D1 => 86_400,
            Self::W1 => 604_800,
            Self::Mo1 => 2_592_000,
        }
    }

    pub fn is_intraday(self) -> bool {
        self.duration_secs() < Self::D1.duration_secs()
    }

    pub fn parse_str(raw: &str) -> Result<Self, AppError> {
        Self::ALL
            .into_iter()
            .find(|granularity| granularity.as_str() == raw)
            .ok_or_else(|| AppError::InvalidArgument(format!("unknown granularity '{raw}'")))
    }

    pub fn bucket_open_time(self, time: i64) -> i64 {
        time - time.rem_euclid(self.duration_secs())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Bar {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Bar {
    pub fn from_tick(bucket_open_time: i64, price: f64) -> Self {
        Self {
            time: bucket_open_time,
            open: price,
            high: price,
            low: price,
            close: price,
        }
    }

    pub fn apply_tick(&mut self, price: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
    }
}

/// Bar time as it arrives from collaborators: epoch seconds or a calendar day.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum BarTime {
    Seconds(i64),
    Text(String),
}

impl BarTime {
    pub fn to_seconds(&self) -> Result<i64, AppError> {
        match self {
            Self::Seconds(seconds) => Ok(*seconds),
            Self::Text(raw) => parse_time_text(raw),
        }
    }
}

fn parse_time_text(raw: &str) -> Result<i64, AppError> {
    let trimmed = raw.trim();
    if let Ok(seconds) = trimmed.parse::<i64>() {
        return Ok(seconds);
    }

    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|midnight| midnight.and_utc().timestamp())
        .ok_or_else(|| AppError::InvalidBarTime(raw.to_string()))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BarWire {
    pub time: BarTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl TryFrom<BarWire> for Bar {
    type Error = AppError;

    fn try_from(value: BarWire) -> Result<Self, Self::Error> {
        Ok(Self {
            time: value.time.to_seconds()?,
            open: value.open,
            high: value.high,
            low: value.low,
            close: value.close,
        })
    }
}

/// Half-open interval `[start, end)` in epoch seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

impl TimeRange {
    pub fn new(start: i64, end: i64) -> Result<Self, AppError> {
        if start >= end {
            return Err(AppError::InvalidArgument(format!(
                "time range start {start} must be before end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn includes(&self, time: i64) -> bool {
        self.start <= time && time < self.end
    }

    pub fn union(&self, other: &TimeRange) -> TimeRange {
        TimeRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ThrottleTier {
    Realtime,
    Normal,
    Slow,
    Lazy,
}

impl ThrottleTier {
    pub fn interval_ms(self) -> u64 {
        match self {
            Self::Realtime => 250,
            Self::Normal => 1_000,
            Self::Slow => 3_000,
            Self::Lazy => 10_000,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Realtime => "realtime",
            Self::Normal => "normal",
            Self::Slow => "slow",
            Self::Lazy => "lazy",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CountdownState {
    pub remaining_seconds: u64,
    pub is_expired: bool,
    pub label: String,
}

#[derive(Debug, Deserialize)]
pub struct LiveTickWire {
    pub symbol: String,
    pub price: f64,
    #[serde(default)]
    pub volume: f64,
    pub time: BarTime,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LiveTick {
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    pub time: i64,
}

impl TryFrom<LiveTickWire> for LiveTick {
    type Error = AppError;

    fn try_from(value: LiveTickWire) -> Result<Self, Self::Error> {
        if !value.price.is_finite() || !value.volume.is_finite() || value.volume < 0.0 {
            return Err(AppError::InvalidArgument(
                "tick price/volume must be finite and volume non-negative".to_string(),
            ));
        }

        Ok(Self {
            symbol: normalize_symbol(&value.symbol)?,
            price: value.price,
            volume: value.volume,
            time: value.time.to_seconds()?,
        })
    }
}

pub fn parse_live_tick_payload(payload: &mut [u8]) -> Result<LiveTick, AppError> {
    let wire: LiveTickWire = simd_json::serde::from_slice(payload)?;
    wire.try_into()
}

/// Uppercases and validates a ticker. `|` and other punctuation are refused so
/// symbols can never collide with the cache key separator.
pub fn normalize_symbol(raw: &str) -> Result<String, AppError> {
    let symbol = raw.trim().to_ascii_uppercase();
    let valid_chars = symbol
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '.' || ch == '-');

    if symbol.is_empty() || symbol.len() > MAX_SYMBOL_LEN || !valid_chars {
        return Err(AppError::InvalidArgument(format!(
            "symbol must be 1-{MAX_SYMBOL_LEN} ASCII alphanumerics, '.' or '-'"
        )));
    }
    Ok(symbol)
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionArgs {
    pub symbol: Option<String>,
    pub granularity: Option<Granularity>,
    pub cache_capacity: Option<usize>,
    pub countdown_frame_ms: Option<u64>,
    pub auto_throttle: Option<bool>,
    pub mock_mode: Option<bool>,
    pub rest_base_url: Option<String>,
    pub feed_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub symbol: String,
    pub granularity: Granularity,
    pub cache_capacity: usize,
    pub countdown_frame_ms: u64,
    pub auto_throttle: bool,
    pub mock_mode: bool,
    pub rest_base_url: String,
    pub feed_url: String,
}

impl SessionArgs {
    pub fn normalize(self) -> Result<SessionConfig, AppError> {
        let symbol = normalize_symbol(self.symbol.as_deref().unwrap_or(DEFAULT_SYMBOL))?;
        let granularity = self.granularity.unwrap_or(DEFAULT_GRANULARITY);

        let cache_capacity = self.cache_capacity.unwrap_or(DEFAULT_CACHE_CAPACITY);
        if !(MIN_CACHE_CAPACITY..=MAX_CACHE_CAPACITY).contains(&cache_capacity) {
            return Err(AppError::InvalidArgument(format!(
                "cacheCapacity must be between {MIN_CACHE_CAPACITY} and {MAX_CACHE_CAPACITY}"
            )));
        }

        let countdown_frame_ms = self
            .countdown_frame_ms
            .unwrap_or(DEFAULT_COUNTDOWN_FRAME_MS);
        if !(MIN_COUNTDOWN_FRAME_MS..=MAX_COUNTDOWN_FRAME_MS).contains(&countdown_frame_ms) {
            return Err(AppError::InvalidArgument(format!(
                "countdownFrameMs must be between {MIN_COUNTDOWN_FRAME_MS} and {MAX_COUNTDOWN_FRAME_MS}"
            )));
        }

        let auto_throttle = self.auto_throttle.unwrap_or(DEFAULT_AUTO_THROTTLE);
        let mock_mode = self.mock_mode.unwrap_or(DEFAULT_MOCK_MODE);

        let rest_base_url = normalize_url(
            self.rest_base_url,
            DEFAULT_REST_BASE_URL,
            &["http://", "https://"],
        )?;
        let feed_url = normalize_url(self.feed_url, DEFAULT_FEED_URL, &["ws://", "wss://"])?;

        Ok(SessionConfig {
            symbol,
            granularity,
            cache_capacity,
            countdown_frame_ms,
            auto_throttle,
            mock_mode,
            rest_base_url,
            feed_url,
        })
    }
}

fn normalize_url(
    value: Option<String>,
    default: &str,
    schemes: &[&str],
) -> Result<String, AppError> {
    let url = value
        .map(|raw| raw.trim().trim_end_matches('/').to_string())
        .filter(|raw| !raw.is_empty())
        .unwrap_or_else(|| default.to_string());

    if !schemes.iter().any(|scheme| url.starts_with(scheme)) {
        return Err(AppError::InvalidArgument(format!(
            "url '{url}' must start with one of {}",
            schemes.join(", ")
        )));
    }
    Ok(url)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartBarsArgs {
    pub symbol: String,
    pub granularity: Granularity,
    pub start: BarTime,
    pub end: BarTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChartBarsRequest {
    pub symbol: String,
    pub granularity: Granularity,
    pub range: TimeRange,
}

impl ChartBarsArgs {
    pub fn normalize(self) -> Result<ChartBarsRequest, AppError> {
        Ok(ChartBarsRequest {
            symbol: normalize_symbol(&self.symbol)?,
            granularity: self.granularity,
            range: TimeRange::new(self.start.to_seconds()?, self.end.to_seconds()?)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_calendar_day_to_midnight_utc() {
        let time = BarTime::Text("2024-01-02".to_string());
        assert_eq!(time.to_seconds().expect("date should parse"), 1_704_153_600);
    }

    #[test]
    fn accepts_numeric_text_and_integer_seconds() {
        let numeric_text = BarTime::Text(" 1700000000 ".to_string());
        assert_eq!(numeric_text.to_seconds().ok(), Some(1_700_000_000));
        assert_eq!(BarTime::Seconds(42).to_seconds().ok(), Some(42));
    }

    #[test]
    fn rejects_unparseable_bar_time() {
        let result = BarTime::Text("yesterday".to_string()).to_seconds();
        assert!(matches!(result, Err(AppError::InvalidBarTime(_))));
    }

    #[test]
    fn decodes_bar_wire_with_either_time_form() {
        let mut payload = br#"[{"time":"2024-01-02","open":1.0,"high":2.0,"low":0.5,"close":1.5},{"time":1704240000,"open":1.5,"high":2.5,"low":1.0,"close":2.0}]"#.to_vec();
        let wire: Vec<BarWire> =
            simd_json::serde::from_slice(&mut payload).expect("bar payload should decode");
        let bars: Vec<Bar> = wire
            .into_iter()
            .map(Bar::try_from)
            .collect::<Result<_, _>>()
            .expect("bars should convert");

        assert_eq!(bars[0].time, 1_704_153_600);
        assert_eq!(bars[1].time, 1_704_240_000);
        assert_eq!(bars[1].close, 2.0);
    }

    #[test]
    fn granularity_table_is_fixed() {
        assert_eq!(Granularity::M5.duration_secs(), 300);
        assert_eq!(Granularity::Mo1.duration_secs(), 30 * 86_400);
        assert!(Granularity::H4.is_intraday());
        assert!(!Granularity::D1.is_intraday());
        assert_eq!(Granularity::parse_str("1w").ok(), Some(Granularity::W1));
        assert!(Granularity::parse_str("2w").is_err());
    }

    #[test]
    fn buckets_time_to_granularity_open() {
        assert_eq!(Granularity::M5.bucket_open_time(1_000), 900);
        assert_eq!(Granularity::M5.bucket_open_time(900), 900);
    }

    #[test]
    fn time_range_requires_start_before_end() {
        assert!(TimeRange::new(10, 10).is_err());
        assert!(TimeRange::new(11, 10).is_err());
        let range = TimeRange::new(0, 10).expect("valid range");
        assert!(range.includes(0));
        assert!(!range.includes(10));
    }

    #[test]
    fn parses_live_tick_payload() {
        let mut payload =
            br#"{"symbol":"aapl","price":191.25,"volume":3.0,"time":1700000123}"#.to_vec();
        let tick = parse_live_tick_payload(&mut payload).expect("tick should parse");

        assert_eq!(tick.symbol, "AAPL");
        assert_eq!(tick.price, 191.25);
        assert_eq!(tick.time, 1_700_000_123);
    }

    #[test]
    fn rejects_tick_with_negative_volume() {
        let mut payload = br#"{"symbol":"AAPL","price":1.0,"volume":-1.0,"time":1}"#.to_vec();
        assert!(parse_live_tick_payload(&mut payload).is_err());
    }

    #[test]
    fn normalizes_symbols() {
        assert_eq!(normalize_symbol(" brk.b ").ok().as_deref(), Some("BRK.B"));
        assert!(normalize_symbol("AA|PL").is_err());
        assert!(normalize_symbol("").is_err());
    }

    #[test]
    fn normalizes_session_args_defaults() {
        let config = SessionArgs::default()
            .normalize()
            .expect("defaults should be valid");

        assert_eq!(config.symbol, DEFAULT_SYMBOL);
        assert_eq!(config.granularity, DEFAULT_GRANULARITY);
        assert_eq!(config.cache_capacity, DEFAULT_CACHE_CAPACITY);
        assert_eq!(config.countdown_frame_ms, DEFAULT_COUNTDOWN_FRAME_MS);
        assert_eq!(config.auto_throttle, DEFAULT_AUTO_THROTTLE);
        assert_eq!(config.mock_mode, DEFAULT_MOCK_MODE);
        assert_eq!(config.rest_base_url, DEFAULT_REST_BASE_URL);
        assert_eq!(config.feed_url, DEFAULT_FEED_URL);
    }

    #[test]
    fn validates_cache_capacity_range() {
        let result = SessionArgs {
            cache_capacity: Some(0),
            ..SessionArgs::default()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn validates_countdown_frame_range() {
        let result = SessionArgs {
            countdown_frame_ms: Some(5_000),
            ..SessionArgs::default()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn validates_url_schemes() {
        let result = SessionArgs {
            feed_url: Some("http://example.com/ws".to_string()),
            ..SessionArgs::default()
        }
        .normalize();
        assert!(result.is_err());

        let config = SessionArgs {
            rest_base_url: Some("https://example.com/".to_string()),
            ..SessionArgs::default()
        }
        .normalize()
        .expect("https base url should be valid");
        assert_eq!(config.rest_base_url, "https://example.com");
    }

    #[test]
    fn normalizes_chart_bars_args() {
        let request = ChartBarsArgs {
            symbol: "msft".to_string(),
            granularity: Granularity::D1,
            start: BarTime::Text("2024-01-01".to_string()),
            end: BarTime::Seconds(1_704_240_000),
        }
        .normalize()
        .expect("args should normalize");

        assert_eq!(request.symbol, "MSFT");
        assert_eq!(request.range.start, 1_704_067_200);
        assert_eq!(request.range.end, 1_704_240_000);
    }
}
