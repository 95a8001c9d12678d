use crate::error::AppError;
use crate::market::merge::normalize_bars;
use crate::market::pipeline::BarFetcher;
use crate::market::types::{Bar, BarWire, Granularity, TimeRange};
use reqwest::Client;
use std::time::Duration;

const BARS_PATH: &str = "/api/v1/bars";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

fn bars_endpoint(base_url: &str, symbol: &str, granularity: Granularity, range: TimeRange) -> String {
    format!(
        "{base_url}{BARS_PATH}?symbol={}&interval={}&start={}&end={}",
        symbol.to_ascii_uppercase(),
        granularity.as_str(),
        range.start,
        range.end
    )
}

/// Decodes a bars response body and keeps only bars inside `range`.
pub fn decode_bars_payload(payload: &mut [u8], range: TimeRange) -> Result<Vec<Bar>, AppError> {
    let wire: Vec<BarWire> = simd_json::serde::from_slice(payload)?;
    Ok(normalize_bars(wire)
        .into_iter()
        .filter(|bar| range.includes(bar.time))
        .collect())
}

/// Historical bars over HTTP.
pub struct RestBarFetcher {
    client: Client,
    base_url: String,
}

impl RestBarFetcher {
    pub fn new(base_url: impl Into<String>) -> Result<Self, AppError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

impl BarFetcher for RestBarFetcher {
    async fn request_bars(
        &self,
        symbol: &str,
        granularity: Granularity,
        range: TimeRange,
    ) -> Result<Vec<Bar>, AppError> {
        let endpoint = bars_endpoint(&self.base_url, symbol, granularity, range);
        let response = self.client.get(endpoint).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Fetch {
                status: status.as_u16(),
                reason: status
                    .canonical_reason()
                    .unwrap_or("unexpected status")
                    .to_string(),
            });
        }

        let mut payload = response.bytes().await?.to_vec();
        decode_bars_payload(&mut payload, range)
    }
}
