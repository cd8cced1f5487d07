use crate::error::VenueError;
use crate::models::{AccountId, Candle};
use crate::venue::{CandleProvider, MarketData, SymbolConstraints};
use async_trait::async_trait;
use chrono::DateTime;
use governor::{Quota, RateLimiter};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;

pub const BINANCE_API_BASE: &str = "https://api.binance.com";
const DEFAULT_REQUESTS_PER_MINUTE: u32 = 600;
const MAX_KLINES: usize = 1000;

type BinanceRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Public (unsigned) Binance spot market data
///
/// Cloneable; clones share the rate limiter and the constraints cache.
#[derive(Clone)]
pub struct BinanceMarketData {
    client: Client,
    base_url: String,
    rate_limiter: Arc<BinanceRateLimiter>,
    constraints: Arc<RwLock<HashMap<String, SymbolConstraints>>>,
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    symbol: String,
    filters: Vec<serde_json::Value>,
}

impl BinanceMarketData {
    pub fn new(base_url: impl Into<String>, requests_per_minute: u32) -> Self {
        let rpm = NonZeroU32::new(requests_per_minute)
            .or(NonZeroU32::new(DEFAULT_REQUESTS_PER_MINUTE))
            .unwrap_or(NonZeroU32::MIN);

        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            rate_limiter: Arc::new(RateLimiter::direct(Quota::per_minute(rpm))),
            constraints: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, VenueError> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}{}", self.base_url, path);
        tracing::debug!("GET {} {:?}", url, query);

        let response = self.client.get(&url).query(query).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(VenueError::Http {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json::<T>().await?)
    }

    fn parse_decimal(raw: &str, field: &str) -> Result<Decimal, VenueError> {
        Decimal::from_str(raw.trim())
            .map(|d| d.normalize())
            .map_err(|e| VenueError::Decode(format!("{} '{}': {}", field, raw, e)))
    }

    fn parse_f64(value: &serde_json::Value, field: &str) -> Result<f64, VenueError> {
        value
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .or_else(|| value.as_f64())
            .ok_or_else(|| VenueError::Decode(format!("kline field {}: {}", field, value)))
    }

    fn parse_constraints(info: &SymbolInfo) -> Result<SymbolConstraints, VenueError> {
        let mut step_size = None;
        let mut min_qty = None;
        let mut min_notional = Decimal::ZERO;

        for filter in &info.filters {
            let field = |name: &str| filter.get(name).and_then(|v| v.as_str());
            match filter.get("filterType").and_then(|v| v.as_str()) {
                Some("LOT_SIZE") => {
                    if let Some(raw) = field("stepSize") {
                        step_size = Some(Self::parse_decimal(raw, "stepSize")?);
                    }
                    if let Some(raw) = field("minQty") {
                        min_qty = Some(Self::parse_decimal(raw, "minQty")?);
                    }
                }
                Some("NOTIONAL") | Some("MIN_NOTIONAL") => {
                    if let Some(raw) = field("minNotional") {
                        min_notional = Self::parse_decimal(raw, "minNotional")?;
                    }
                }
                _ => {}
            }
        }

        match (step_size, min_qty) {
            (Some(step_size), Some(min_qty)) => Ok(SymbolConstraints {
                step_size,
                min_qty,
                min_notional,
            }),
            _ => Err(VenueError::Decode(format!(
                "{} has no LOT_SIZE filter",
                info.symbol
            ))),
        }
    }
}

impl Default for BinanceMarketData {
    fn default() -> Self {
        Self::new(BINANCE_API_BASE, DEFAULT_REQUESTS_PER_MINUTE)
    }
}

#[async_trait]
impl MarketData for BinanceMarketData {
    async fn get_price(&self, symbol: &str) -> Result<Decimal, VenueError> {
        let ticker: TickerPrice = self
            .get_json("/api/v3/ticker/price", &[("symbol", symbol.to_string())])
            .await?;
        Self::parse_decimal(&ticker.price, "price")
    }

    async fn get_symbol_constraints(&self, symbol: &str) -> Result<SymbolConstraints, VenueError> {
        if let Some(cached) = self.constraints.read().await.get(symbol) {
            return Ok(*cached);
        }

        let info: ExchangeInfo = self
            .get_json("/api/v3/exchangeInfo", &[("symbol", symbol.to_string())])
            .await?;

        let symbol_info = info
            .symbols
            .iter()
            .find(|s| s.symbol == symbol)
            .ok_or_else(|| VenueError::UnknownSymbol(symbol.to_string()))?;
        let constraints = Self::parse_constraints(symbol_info)?;

        self.constraints
            .write()
            .await
            .insert(symbol.to_string(), constraints);

        tracing::info!(
            "{} constraints: step {} min qty {} min notional {}",
            symbol,
            constraints.step_size,
            constraints.min_qty,
            constraints.min_notional
        );

        Ok(constraints)
    }
}

#[async_trait]
impl CandleProvider for BinanceMarketData {
    async fn get_candles(
        &self,
        _account_id: AccountId,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, VenueError> {
        let limit = limit.clamp(1, MAX_KLINES);
        let rows: Vec<Vec<serde_json::Value>> = self
            .get_json(
                "/api/v3/klines",
                &[
                    ("symbol", symbol.to_string()),
                    ("interval", timeframe.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            if row.len() < 6 {
                return Err(VenueError::Decode(format!(
                    "kline row has {} fields",
                    row.len()
                )));
            }

            let open_time = row[0]
                .as_i64()
                .and_then(DateTime::from_timestamp_millis)
                .ok_or_else(|| VenueError::Decode(format!("kline open time: {}", row[0])))?;

            candles.push(Candle {
                symbol: symbol.to_string(),
                open_time,
                open: Self::parse_f64(&row[1], "open")?,
                high: Self::parse_f64(&row[2], "high")?,
                low: Self::parse_f64(&row[3], "low")?,
                close: Self::parse_f64(&row[4], "close")?,
                volume: Self::parse_f64(&row[5], "volume")?,
            });
        }

        candles.sort_by_key(|c| c.open_time);
        Ok(candles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_get_price() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v3/ticker/price")
            .match_query(Matcher::UrlEncoded("symbol".into(), "BTCUSDT".into()))
            .with_status(200)
            .with_body(r#"{"symbol":"BTCUSDT","price":"65000.01000000"}"#)
            .create_async()
            .await;

        let client = BinanceMarketData::new(server.url(), 600);
        let price = client.get_price("BTCUSDT").await.unwrap();

        assert_eq!(price, dec!(65000.01));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_error_is_reported() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v3/ticker/price")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body(r#"{"code":-1121,"msg":"Invalid symbol."}"#)
            .create_async()
            .await;

        let client = BinanceMarketData::new(server.url(), 600);
        let err = client.get_price("NOPE").await.unwrap_err();

        assert!(matches!(err, VenueError::Http { status: 400, .. }));
    }

    #[tokio::test]
    async fn test_constraints_are_parsed_and_cached() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v3/exchangeInfo")
            .match_query(Matcher::UrlEncoded("symbol".into(), "BTCUSDT".into()))
            .with_status(200)
            .with_body(
                r#"{"symbols":[{"symbol":"BTCUSDT","filters":[
                    {"filterType":"PRICE_FILTER","tickSize":"0.01000000"},
                    {"filterType":"LOT_SIZE","minQty":"0.00001000","maxQty":"9000.00000000","stepSize":"0.00001000"},
                    {"filterType":"NOTIONAL","minNotional":"5.00000000"}
                ]}]}"#,
            )
            .expect(1)
            .create_async()
            .await;

        let client = BinanceMarketData::new(server.url(), 600);
        let first = client.get_symbol_constraints("BTCUSDT").await.unwrap();
        let second = client.get_symbol_constraints("BTCUSDT").await.unwrap();

        assert_eq!(first.step_size, dec!(0.00001));
        assert_eq!(first.min_qty, dec!(0.00001));
        assert_eq!(first.min_notional, dec!(5));
        assert_eq!(first, second);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_klines_are_parsed_ascending() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v3/klines")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("symbol".into(), "BTCUSDT".into()),
                Matcher::UrlEncoded("interval".into(), "1m".into()),
                Matcher::UrlEncoded("limit".into(), "2".into()),
            ]))
            .with_status(200)
            .with_body(
                r#"[
                    [1700000060000,"101.0","102.0","100.5","101.5","12.5",1700000119999,"0",1,"0","0","0"],
                    [1700000000000,"100.0","101.0","99.5","101.0","10.0",1700000059999,"0",1,"0","0","0"]
                ]"#,
            )
            .create_async()
            .await;

        let client = BinanceMarketData::new(server.url(), 600);
        let candles = client.get_candles(1, "BTCUSDT", "1m", 2).await.unwrap();

        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].close, 101.0);
        assert_eq!(candles[1].close, 101.5);
        assert_eq!(candles[1].volume, 12.5);
    }
}
