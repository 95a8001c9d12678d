use crate::error::AppError;
use crate::market::types::{Granularity, SessionArgs};
use std::env;
use std::str::FromStr;

pub const ENV_SYMBOL: &str = "CHART_SYMBOL";
pub const ENV_GRANULARITY: &str = "CHART_GRANULARITY";
pub const ENV_CACHE_CAPACITY: &str = "CHART_CACHE_CAPACITY";
pub const ENV_COUNTDOWN_FRAME_MS: &str = "CHART_COUNTDOWN_FRAME_MS";
pub const ENV_AUTO_THROTTLE: &str = "CHART_AUTO_THROTTLE";
pub const ENV_MOCK_MODE: &str = "CHART_MOCK_MODE";
pub const ENV_REST_BASE_URL: &str = "CHART_REST_BASE_URL";
pub const ENV_FEED_URL: &str = "CHART_FEED_URL";

/// Session arguments from `CHART_*` environment variables. Unset or blank
/// variables fall through to the defaults applied by
/// [`SessionArgs::normalize`].
pub fn args_from_env() -> Result<SessionArgs, AppError> {
    args_from_lookup(|name| env::var(name).ok())
}

pub fn args_from_lookup(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<SessionArgs, AppError> {
    let read = |name: &str| {
        lookup(name)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };

    Ok(SessionArgs {
        symbol: read(ENV_SYMBOL),
        granularity: read(ENV_GRANULARITY)
            .map(|raw| Granularity::parse_str(&raw))
            .transpose()?,
        cache_capacity: parse_number(ENV_CACHE_CAPACITY, read(ENV_CACHE_CAPACITY))?,
        countdown_frame_ms: parse_number(ENV_COUNTDOWN_FRAME_MS, read(ENV_COUNTDOWN_FRAME_MS))?,
        auto_throttle: parse_bool(ENV_AUTO_THROTTLE, read(ENV_AUTO_THROTTLE))?,
        mock_mode: parse_bool(ENV_MOCK_MODE, read(ENV_MOCK_MODE))?,
        rest_base_url: read(ENV_REST_BASE_URL),
        feed_url: read(ENV_FEED_URL),
    })
}

fn parse_number<T: FromStr>(name: &str, value: Option<String>) -> Result<Option<T>, AppError> {
    value
        .map(|raw| {
            raw.parse()
                .map_err(|_| AppError::InvalidArgument(format!("{name} must be a number, got '{raw}'")))
        })
        .transpose()
}

fn parse_bool(name: &str, value: Option<String>) -> Result<Option<bool>, AppError> {
    let Some(raw) = value else {
        return Ok(None);
    };
    match raw.to_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "n" | "off" => Ok(Some(false)),
        _ => Err(AppError::InvalidArgument(format!(
            "{name} must be a boolean, got '{raw}'"
        ))),
    }
}
