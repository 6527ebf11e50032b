//! Read-only market data over the exchange info endpoint.
//!
//! Used to keep the paper market priced and to learn per-coin size
//! decimals. Order placement never goes through here.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use relay_core::Price;

use crate::error::{ExchangeError, ExchangeResult};

/// Default timeout for API requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Public Hyperliquid info endpoint.
pub const DEFAULT_INFO_URL: &str = "https://api.hyperliquid.xyz/info";

#[derive(Debug, Serialize)]
struct InfoRequest {
    #[serde(rename = "type")]
    request_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct MetaResponse {
    universe: Vec<AssetMeta>,
}

#[derive(Debug, Deserialize)]
struct AssetMeta {
    name: String,
    #[serde(rename = "szDecimals")]
    sz_decimals: u32,
}

/// Client for the info endpoint.
pub struct InfoClient {
    client: Client,
    info_url: String,
}

impl InfoClient {
    /// # Errors
    /// `ExchangeError::Http` if the HTTP client cannot be built.
    pub fn new(info_url: impl Into<String>) -> ExchangeResult<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| ExchangeError::Http(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            info_url: info_url.into(),
        })
    }

    pub fn info_url(&self) -> &str {
        &self.info_url
    }

    async fn post(&self, request_type: &'static str) -> ExchangeResult<serde_json::Value> {
        let response = self
            .client
            .post(&self.info_url)
            .json(&InfoRequest { request_type })
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ExchangeError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExchangeError::Http(format!("HTTP {status}: {body}")));
        }

        response
            .json()
            .await
            .map_err(|e| ExchangeError::Parse(format!("{request_type}: {e}")))
    }

    /// Mid price for every listed coin.
    pub async fn all_mids(&self) -> ExchangeResult<HashMap<String, Price>> {
        let body = self.post("allMids").await?;
        let mids = parse_mids(&body)?;
        debug!(count = mids.len(), "Fetched allMids");
        Ok(mids)
    }

    /// Size decimals for every listed coin.
    pub async fn sz_decimals(&self) -> ExchangeResult<HashMap<String, u32>> {
        let body = self.post("meta").await?;
        let meta: MetaResponse = serde_json::from_value(body)
            .map_err(|e| ExchangeError::Parse(format!("meta: {e}")))?;
        Ok(meta
            .universe
            .into_iter()
            .map(|asset| (asset.name, asset.sz_decimals))
            .collect())
    }
}

/// `allMids` maps coin to a decimal string. Unparseable entries are skipped.
fn parse_mids(body: &serde_json::Value) -> ExchangeResult<HashMap<String, Price>> {
    let object = body
        .as_object()
        .ok_or_else(|| ExchangeError::Parse("allMids response is not an object".to_string()))?;

    let mut mids = HashMap::with_capacity(object.len());
    for (coin, value) in object {
        match value.as_str().map(str::parse::<Price>) {
            Some(Ok(px)) => {
                mids.insert(coin.clone(), px);
            }
            _ => warn!(coin = %coin, value = %value, "Skipping unparseable mid"),
        }
    }
    Ok(mids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_mids_skips_garbage() {
        let body = serde_json::json!({
            "BTC": "43250.5",
            "ADA": "0.5012",
            "@107": 12,
        });
        let mids = parse_mids(&body).unwrap();

        assert_eq!(mids.len(), 2);
        assert_eq!(mids["ADA"], Price::new(dec!(0.5012)));
    }

    #[test]
    fn test_parse_mids_rejects_non_object() {
        assert!(matches!(
            parse_mids(&serde_json::json!([])),
            Err(ExchangeError::Parse(_))
        ));
    }

    #[test]
    fn test_meta_deserialize() {
        let body = serde_json::json!({
            "universe": [
                {"name": "BTC", "szDecimals": 5, "maxLeverage": 50},
                {"name": "ADA", "szDecimals": 0, "maxLeverage": 10}
            ]
        });
        let meta: MetaResponse = serde_json::from_value(body).unwrap();
        assert_eq!(meta.universe[1].name, "ADA");
        assert_eq!(meta.universe[1].sz_decimals, 0);
    }
}
