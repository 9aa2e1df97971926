// =============================================================================
// Binance USDM Futures client — HMAC-SHA256 signed requests.
// =============================================================================
//
// Adapted from the teacher's `binance/client.rs` spot-market client:
// same signing scheme (`timestamp` + `recvWindow` + HMAC-SHA256 query
// signature, `X-MBX-APIKEY` header), same `anyhow`/`tracing::instrument`
// texture, re-pointed at the USDM futures REST surface (`fapi`) and kline
// WS stream (`fstream`) with the order types this strategy actually needs:
// LIMIT entries/closes and STOP_MARKET full-position closes.
//
// SECURITY: the secret key is never logged, never `Debug`-printed, and
// never placed in a URL path — only in the signed query string sent over
// TLS.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures_util::StreamExt;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use rust_decimal::Decimal;
use sha2::Sha256;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, instrument, warn};

use crate::types::{OrderSide, PositionSide, VenueError};
use crate::venue::{
    shrink_retry, ClosedBar, VenueClient, VenueOpenOrder, VenueOrderId, VenueOrderType, VenuePosition,
    MARGIN_FLOOR_FRAC, MARGIN_SHRINK_STEP, REDUCE_ONLY_FLOOR_FRAC, REDUCE_ONLY_SHRINK_STEP,
};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW: u64 = 5000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Signed REST + WS client for Binance USDM perpetual futures.
#[derive(Clone)]
pub struct BinanceFuturesClient {
    api_key: String,
    secret: String,
    base_url: String,
    ws_base_url: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for BinanceFuturesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceFuturesClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl BinanceFuturesClient {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key,
            secret,
            base_url: "https://fapi.binance.com".to_string(),
            ws_base_url: "wss://fstream.binance.com".to_string(),
            client,
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    /// Classify a non-2xx Binance response into the closed venue-error
    /// taxonomy (spec §9 redesign note: "replace exception-driven control
    /// flow ... with a closed error enum").
    fn classify_error(status: reqwest::StatusCode, body: &serde_json::Value) -> VenueError {
        let code = body["code"].as_i64().unwrap_or(0);
        let msg = body["msg"].as_str().unwrap_or("").to_string();
        match code {
            -2019 => VenueError::MarginInsufficient,
            -2022 => VenueError::ReduceOnlyRejected,
            -1003 | -1015 => VenueError::RateLimited,
            _ if status.is_server_error() => VenueError::Transient(format!("{status}: {msg}")),
            _ if status == reqwest::StatusCode::REQUEST_TIMEOUT => VenueError::Transient(msg),
            _ => VenueError::Fatal(format!("{status} (code {code}): {msg}")),
        }
    }

    async fn request_json(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &str,
    ) -> Result<serde_json::Value, VenueError> {
        let qs = self.signed_query(query);
        let url = format!("{}{}?{}", self.base_url, path, qs);

        let resp = self
            .client
            .request(method, &url)
            .send()
            .await
            .map_err(|e| VenueError::Transient(e.to_string()))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| VenueError::Fatal(format!("unparseable response body: {e}")))?;

        if !status.is_success() {
            return Err(Self::classify_error(status, &body));
        }
        Ok(body)
    }

    #[instrument(skip(self), name = "binance_futures::place_order_raw")]
    async fn place_order_raw(
        &self,
        symbol: &str,
        side: OrderSide,
        order_type: &str,
        price: Option<Decimal>,
        qty: Option<Decimal>,
        stop_price: Option<Decimal>,
        reduce_only: bool,
        close_position: bool,
    ) -> Result<VenueOrderId, VenueError> {
        let mut params = format!("symbol={symbol}&side={side}&type={order_type}");
        if let Some(p) = price {
            params.push_str(&format!("&price={p}&timeInForce=GTC"));
        }
        if let Some(q) = qty {
            params.push_str(&format!("&quantity={q}"));
        }
        if let Some(sp) = stop_price {
            params.push_str(&format!("&stopPrice={sp}"));
        }
        if reduce_only {
            params.push_str("&reduceOnly=true");
        }
        if close_position {
            params.push_str("&closePosition=true");
        }

        let body = self.request_json(reqwest::Method::POST, "/fapi/v1/order", &params).await?;
        let id = body["orderId"]
            .as_i64()
            .map(|i| i.to_string())
            .ok_or_else(|| VenueError::Fatal("order response missing orderId".into()))?;
        Ok(VenueOrderId(id))
    }

    /// Subscribe to the 1-minute kline stream and call `on_bar` for every
    /// *closed* bar (spec §4.3 "emits closed-bar events"). Reconnects on a
    /// 90 s silence timeout (spec §5).
    pub async fn run_kline_stream<F>(&self, symbol: &str, mut on_bar: F) -> anyhow::Result<()>
    where
        F: FnMut(ClosedBar) + Send,
    {
        let stream_name = format!("{}@kline_1m", symbol.to_lowercase());
        let url = format!("{}/ws/{}", self.ws_base_url, stream_name);

        loop {
            debug!(%url, "connecting kline stream");
            let (ws_stream, _) = match tokio_tungstenite::connect_async(&url).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "kline stream connect failed, retrying in 3s");
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    continue;
                }
            };
            let (_, mut read) = ws_stream.split();

            loop {
                let next = tokio::time::timeout(Duration::from_secs(90), read.next()).await;
                let msg = match next {
                    Ok(Some(Ok(m))) => m,
                    Ok(Some(Err(e))) => {
                        warn!(error = %e, "kline stream read error, reconnecting");
                        break;
                    }
                    Ok(None) => {
                        warn!("kline stream closed, reconnecting");
                        break;
                    }
                    Err(_) => {
                        warn!("kline stream silent for 90s, reconnecting");
                        break;
                    }
                };

                if let Message::Text(text) = msg {
                    if let Some(bar) = parse_kline_message(&text) {
                        on_bar(bar);
                    }
                }
            }
        }
    }
}

fn parse_decimal(v: &serde_json::Value) -> Decimal {
    v.as_str().and_then(|s| s.parse().ok()).unwrap_or(Decimal::ZERO)
}

fn parse_kline_message(text: &str) -> Option<ClosedBar> {
    let v: serde_json::Value = serde_json::from_str(text).ok()?;
    let k = &v["k"];
    if !k["x"].as_bool().unwrap_or(false) {
        return None; // bar not yet closed
    }
    Some(ClosedBar {
        open_time_ms: k["t"].as_i64().unwrap_or(0),
        open: parse_decimal(&k["o"]),
        high: parse_decimal(&k["h"]),
        low: parse_decimal(&k["l"]),
        close: parse_decimal(&k["c"]),
        volume: parse_decimal(&k["v"]),
        close_time_ms: k["T"].as_i64().unwrap_or(0),
    })
}

#[async_trait]
impl VenueClient for BinanceFuturesClient {
    #[instrument(skip(self), name = "binance_futures::place_limit_entry")]
    async fn place_limit_entry(
        &self,
        symbol: &str,
        side: OrderSide,
        price: Decimal,
        qty: Decimal,
        qty_step: Decimal,
    ) -> Result<(VenueOrderId, Decimal), VenueError> {
        shrink_retry(
            qty,
            qty_step,
            MARGIN_SHRINK_STEP,
            MARGIN_FLOOR_FRAC,
            VenueError::is_retryable_shrink,
            |shrunk_qty| self.place_order_raw(symbol, side, "LIMIT", Some(price), Some(shrunk_qty), None, false, false),
        )
        .await
    }

    #[instrument(skip(self), name = "binance_futures::place_limit_close")]
    async fn place_limit_close(
        &self,
        symbol: &str,
        side: OrderSide,
        price: Decimal,
        qty: Decimal,
        qty_step: Decimal,
    ) -> Result<(VenueOrderId, Decimal), VenueError> {
        shrink_retry(
            qty,
            qty_step,
            REDUCE_ONLY_SHRINK_STEP,
            REDUCE_ONLY_FLOOR_FRAC,
            VenueError::is_retryable_shrink,
            |shrunk_qty| self.place_order_raw(symbol, side, "LIMIT", Some(price), Some(shrunk_qty), None, true, false),
        )
        .await
    }

    #[instrument(skip(self), name = "binance_futures::place_stop_market")]
    async fn place_stop_market(&self, symbol: &str, side: OrderSide, stop_price: Decimal) -> Result<VenueOrderId, VenueError> {
        // Spec §6 binding contract: closePosition=true sends no quantity
        // and no reduceOnly field.
        self.place_order_raw(symbol, side, "STOP_MARKET", None, None, Some(stop_price), false, true)
            .await
    }

    #[instrument(skip(self), name = "binance_futures::cancel_all_open_orders")]
    async fn cancel_all_open_orders(&self, symbol: &str) -> Result<(), VenueError> {
        let params = format!("symbol={symbol}");
        self.request_json(reqwest::Method::DELETE, "/fapi/v1/allOpenOrders", &params).await?;
        Ok(())
    }

    #[instrument(skip(self), name = "binance_futures::get_position")]
    async fn get_position(&self, symbol: &str) -> Result<VenuePosition, VenueError> {
        let params = format!("symbol={symbol}");
        let mut last_err = VenueError::Transient("get_position never attempted".into());

        for attempt in 0..crate::venue::GET_POSITION_MAX_RETRIES {
            match self.request_json(reqwest::Method::GET, "/fapi/v2/positionRisk", &params).await {
                Ok(body) => {
                    let entry = body.as_array().and_then(|a| a.first()).cloned().unwrap_or(body);
                    let amt = parse_decimal(&entry["positionAmt"]);
                    let avg_price = parse_decimal(&entry["entryPrice"]);
                    let unrealized_pnl = parse_decimal(&entry["unRealizedProfit"]);
                    let side = if amt.is_sign_positive() && !amt.is_zero() {
                        PositionSide::Long
                    } else if amt.is_sign_negative() {
                        PositionSide::Short
                    } else {
                        PositionSide::None
                    };
                    return Ok(VenuePosition {
                        side,
                        qty: amt.abs(),
                        avg_price,
                        unrealized_pnl,
                    });
                }
                Err(e) if e.is_transient() => {
                    last_err = e;
                    tokio::time::sleep(Duration::from_millis(200 * (attempt as u64 + 1))).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    #[instrument(skip(self), name = "binance_futures::get_open_orders")]
    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<VenueOpenOrder>, VenueError> {
        let params = format!("symbol={symbol}");
        let body = self.request_json(reqwest::Method::GET, "/fapi/v1/openOrders", &params).await?;
        let raw = body.as_array().cloned().unwrap_or_default();

        Ok(raw
            .into_iter()
            .map(|o| {
                let order_type = match o["type"].as_str() {
                    Some("STOP_MARKET") => VenueOrderType::StopMarket,
                    _ => VenueOrderType::Limit,
                };
                let side = match o["side"].as_str() {
                    Some("SELL") => OrderSide::Sell,
                    _ => OrderSide::Buy,
                };
                VenueOpenOrder {
                    id: VenueOrderId(o["orderId"].as_i64().map(|i| i.to_string()).unwrap_or_default()),
                    side,
                    order_type,
                    price: o.get("price").map(parse_decimal).filter(|p| !p.is_zero()),
                    stop_price: o.get("stopPrice").map(parse_decimal).filter(|p| !p.is_zero()),
                    qty: o.get("origQty").map(parse_decimal),
                    reduce_only: o["reduceOnly"].as_bool().unwrap_or(false),
                }
            })
            .collect())
    }

    #[instrument(skip(self), name = "binance_futures::set_margin_mode_isolated")]
    async fn set_margin_mode_isolated(&self, symbol: &str) -> Result<(), VenueError> {
        let params = format!("symbol={symbol}&marginType=ISOLATED");
        match self.request_json(reqwest::Method::POST, "/fapi/v1/marginType", &params).await {
            Ok(_) => Ok(()),
            // -4046 "No need to change margin type" is not an error for us.
            Err(VenueError::Fatal(msg)) if msg.contains("-4046") => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), name = "binance_futures::set_leverage")]
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), VenueError> {
        let params = format!("symbol={symbol}&leverage={leverage}");
        self.request_json(reqwest::Method::POST, "/fapi/v1/leverage", &params).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_error_maps_known_binance_codes() {
        let body = serde_json::json!({"code": -2019, "msg": "Margin is insufficient"});
        assert!(matches!(
            BinanceFuturesClient::classify_error(reqwest::StatusCode::BAD_REQUEST, &body),
            VenueError::MarginInsufficient
        ));

        let body = serde_json::json!({"code": -2022, "msg": "ReduceOnly Order is rejected"});
        assert!(matches!(
            BinanceFuturesClient::classify_error(reqwest::StatusCode::BAD_REQUEST, &body),
            VenueError::ReduceOnlyRejected
        ));

        let body = serde_json::json!({"code": -1003, "msg": "Too many requests"});
        assert!(matches!(
            BinanceFuturesClient::classify_error(reqwest::StatusCode::TOO_MANY_REQUESTS, &body),
            VenueError::RateLimited
        ));
    }

    #[test]
    fn parse_kline_message_only_emits_closed_bars() {
        let open_bar = r#"{"k":{"t":1,"T":2,"o":"1","h":"2","l":"0.5","c":"1.5","v":"10","x":false}}"#;
        assert!(parse_kline_message(open_bar).is_none());

        let closed_bar = r#"{"k":{"t":1,"T":2,"o":"1","h":"2","l":"0.5","c":"1.5","v":"10","x":true}}"#;
        let bar = parse_kline_message(closed_bar).unwrap();
        assert_eq!(bar.close, Decimal::new(15, 1));
    }
}
