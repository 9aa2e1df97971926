// =============================================================================
// Venue Client (C3) — typed exchange operations, retries encapsulated.
// =============================================================================
//
// The teacher talks to Binance through a concrete `BinanceClient` struct
// with no trait boundary. Spec §4.3 requires C6 (the reconciler) to be
// testable against a deterministic venue, so this module introduces a
// `VenueClient` trait — grounded on `aibysid-HyperLiquidMM`'s
// `ExchangeClient` trait plus its in-memory `SimExchange` test double,
// since the teacher itself has no equivalent abstraction.

pub mod binance;
pub mod sim;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::types::{OrderSide, VenueError};

/// Venue-assigned identifier for a placed order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VenueOrderId(pub String);

/// `get_position` response (spec §4.3).
#[derive(Debug, Clone, PartialEq)]
pub struct VenuePosition {
    pub side: crate::types::PositionSide,
    pub qty: Decimal,
    pub avg_price: Decimal,
    pub unrealized_pnl: Decimal,
}

impl VenuePosition {
    pub fn flat() -> Self {
        Self {
            side: crate::types::PositionSide::None,
            qty: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
        }
    }
}

/// Resting-order kinds the venue reports back (spec §4.3 `get_open_orders`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VenueOrderType {
    Limit,
    StopMarket,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VenueOpenOrder {
    pub id: VenueOrderId,
    pub side: OrderSide,
    pub order_type: VenueOrderType,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub qty: Option<Decimal>,
    pub reduce_only: bool,
}

/// A closed 1-minute bar from the kline stream (spec §4.3 "Subscribe").
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClosedBar {
    pub open_time_ms: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub close_time_ms: i64,
}

/// Retry policy constants (spec §4.3 "Retry policy", B3).
pub const MARGIN_SHRINK_STEP: Decimal = Decimal::from_parts(1, 0, 0, false, 3); // 0.1%
pub const MARGIN_FLOOR_FRAC: Decimal = Decimal::from_parts(3, 0, 0, false, 1); // 30%
pub const REDUCE_ONLY_SHRINK_STEP: Decimal = Decimal::from_parts(1, 0, 0, false, 3); // 0.1%
pub const REDUCE_ONLY_FLOOR_FRAC: Decimal = Decimal::from_parts(5, 0, 0, false, 1); // 50%
pub const GET_POSITION_MAX_RETRIES: u32 = 10;

/// The typed venue surface C5/C6 drive (spec §4.3). Every operation that
/// can be venue-rejected retries/shrinks internally and surfaces only the
/// closed `VenueError` taxonomy — callers never see raw HTTP status codes.
#[async_trait]
pub trait VenueClient: Send + Sync {
    /// `place_limit_entry` — internally shrinks notional by
    /// [`MARGIN_SHRINK_STEP`] on `MARGIN_INSUFFICIENT`, down to
    /// [`MARGIN_FLOOR_FRAC`] of the requested notional (B3). Returns the
    /// order id and the notional fraction actually accepted (1.0 if
    /// accepted at full size).
    async fn place_limit_entry(
        &self,
        symbol: &str,
        side: OrderSide,
        price: Decimal,
        qty: Decimal,
        qty_step: Decimal,
    ) -> Result<(VenueOrderId, Decimal), VenueError>;

    /// `place_limit_close` — internally shrinks qty by
    /// [`REDUCE_ONLY_SHRINK_STEP`] on `REDUCE_ONLY_REJECTED`, down to
    /// [`REDUCE_ONLY_FLOOR_FRAC`] of the requested quantity (B3).
    async fn place_limit_close(
        &self,
        symbol: &str,
        side: OrderSide,
        price: Decimal,
        qty: Decimal,
        qty_step: Decimal,
    ) -> Result<(VenueOrderId, Decimal), VenueError>;

    /// `place_stop_market` with `closePosition=true` — no quantity, no
    /// reduceOnly field (spec §6 binding contract point).
    async fn place_stop_market(
        &self,
        symbol: &str,
        side: OrderSide,
        stop_price: Decimal,
    ) -> Result<VenueOrderId, VenueError>;

    async fn cancel_all_open_orders(&self, symbol: &str) -> Result<(), VenueError>;

    /// Retries up to [`GET_POSITION_MAX_RETRIES`] times with small backoff
    /// on transient failure; persistent failure is fatal (spec §4.3).
    async fn get_position(&self, symbol: &str) -> Result<VenuePosition, VenueError>;

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<VenueOpenOrder>, VenueError>;

    async fn set_margin_mode_isolated(&self, symbol: &str) -> Result<(), VenueError>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), VenueError>;
}

/// Round `qty` down to `step` (never exceed the smaller rounded size).
pub fn round_qty_down(qty: Decimal, step: Decimal) -> Decimal {
    if step.is_zero() {
        return qty;
    }
    (qty / step).floor() * step
}

/// Shared shrink-and-retry loop for margin/reduce-only rejections (spec
/// §4.3 "Retry policy", B3). `attempt` is called with the current
/// (possibly shrunk) quantity; on a retryable error the quantity is
/// shrunk by `shrink_step` of the *original* quantity and retried until
/// `floor_frac` of the original is reached. Returns the order id plus the
/// fraction of the originally requested quantity that was actually
/// accepted.
pub async fn shrink_retry<F, Fut>(
    original_qty: Decimal,
    qty_step: Decimal,
    shrink_step: Decimal,
    floor_frac: Decimal,
    is_retryable: impl Fn(&VenueError) -> bool,
    mut attempt: F,
) -> Result<(VenueOrderId, Decimal), VenueError>
where
    F: FnMut(Decimal) -> Fut,
    Fut: std::future::Future<Output = Result<VenueOrderId, VenueError>>,
{
    let mut frac = Decimal::ONE;
    loop {
        let qty = round_qty_down(original_qty * frac, qty_step);
        match attempt(qty).await {
            Ok(id) => return Ok((id, frac)),
            Err(e) if is_retryable(&e) && frac > floor_frac => {
                frac = (frac - shrink_step).max(floor_frac);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_constants_match_spec_floors() {
        assert_eq!(MARGIN_FLOOR_FRAC, Decimal::new(3, 1));
        assert_eq!(REDUCE_ONLY_FLOOR_FRAC, Decimal::new(5, 1));
    }

    #[tokio::test]
    async fn b3_shrink_retry_stops_at_floor_then_fails() {
        use rust_decimal_macros::dec;
        use std::sync::atomic::{AtomicU32, Ordering};

        let attempts = AtomicU32::new(0);
        let result = shrink_retry(
            dec!(500),
            dec!(0.001),
            MARGIN_SHRINK_STEP,
            MARGIN_FLOOR_FRAC,
            |e| matches!(e, VenueError::MarginInsufficient),
            |_qty| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(VenueError::MarginInsufficient) }
            },
        )
        .await;

        assert!(result.is_err());
        // frac walks 1.00 -> 0.999 -> ... -> floor 0.300, then one final
        // attempt at the floor before giving up.
        assert!(attempts.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn shrink_retry_accepts_when_underlying_succeeds_before_floor() {
        use rust_decimal_macros::dec;

        let (id, frac) = shrink_retry(
            dec!(500),
            dec!(0.001),
            MARGIN_SHRINK_STEP,
            MARGIN_FLOOR_FRAC,
            |e| matches!(e, VenueError::MarginInsufficient),
            |qty| async move {
                if qty < dec!(499) {
                    Ok(VenueOrderId("ok".into()))
                } else {
                    Err(VenueError::MarginInsufficient)
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(id, VenueOrderId("ok".into()));
        assert!(frac < Decimal::ONE);
    }
}
