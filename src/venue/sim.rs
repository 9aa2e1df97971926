// =============================================================================
// In-memory venue double for reconciler/event-loop tests.
// =============================================================================
//
// Grounded on `aibysid-HyperLiquidMM`'s `SimExchange` (backend/mm-engine-rs/
// src/exchange.rs) — a plain in-memory struct behind the same trait the
// real client implements, mutated under a single lock since tests only
// ever drive it from one task at a time.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::types::{OrderSide, PositionSide, VenueError};
use crate::venue::{VenueClient, VenueOpenOrder, VenueOrderId, VenueOrderType, VenuePosition};

#[derive(Debug, Clone)]
pub struct SimOpenOrder {
    pub id: String,
    pub side: OrderSide,
    pub order_type: VenueOrderType,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub qty: Option<Decimal>,
    pub reduce_only: bool,
}

#[derive(Default)]
struct SimVenueInner {
    position: VenuePositionState,
    orders: Vec<SimOpenOrder>,
}

#[derive(Clone)]
struct VenuePositionState {
    side: PositionSide,
    qty: Decimal,
    avg_price: Decimal,
}

impl Default for VenuePositionState {
    fn default() -> Self {
        Self {
            side: PositionSide::None,
            qty: Decimal::ZERO,
            avg_price: Decimal::ZERO,
        }
    }
}

/// A fully in-memory `VenueClient`. Always accepts orders at requested
/// size (no margin/reduce-only rejection simulation) unless configured to
/// reject the next N placements via [`SimVenue::reject_next_margin`].
pub struct SimVenue {
    inner: Mutex<SimVenueInner>,
    next_id: AtomicU64,
    reject_margin_remaining: AtomicU64,
    reject_reduce_only_remaining: AtomicU64,
}

impl SimVenue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SimVenueInner::default()),
            next_id: AtomicU64::new(1),
            reject_margin_remaining: AtomicU64::new(0),
            reject_reduce_only_remaining: AtomicU64::new(0),
        }
    }

    pub fn set_position(&self, side: PositionSide, qty: Decimal, avg_price: Decimal) {
        let mut inner = self.inner.lock();
        inner.position = VenuePositionState { side, qty, avg_price };
    }

    pub fn open_orders_snapshot(&self) -> Vec<SimOpenOrder> {
        self.inner.lock().orders.clone()
    }

    /// Cause the next `n` entry placements to fail with MARGIN_INSUFFICIENT.
    pub fn reject_next_margin(&self, n: u64) {
        self.reject_margin_remaining.store(n, Ordering::SeqCst);
    }

    pub fn reject_next_reduce_only(&self, n: u64) {
        self.reject_reduce_only_remaining.store(n, Ordering::SeqCst);
    }

    fn next_order_id(&self) -> String {
        format!("sim-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for SimVenue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VenueClient for SimVenue {
    async fn place_limit_entry(
        &self,
        _symbol: &str,
        side: OrderSide,
        price: Decimal,
        qty: Decimal,
        _qty_step: Decimal,
    ) -> Result<(VenueOrderId, Decimal), VenueError> {
        if self
            .reject_margin_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| if n > 0 { Some(n - 1) } else { None })
            .is_ok()
        {
            return Err(VenueError::MarginInsufficient);
        }
        let id = self.next_order_id();
        self.inner.lock().orders.push(SimOpenOrder {
            id: id.clone(),
            side,
            order_type: VenueOrderType::Limit,
            price: Some(price),
            stop_price: None,
            qty: Some(qty),
            reduce_only: false,
        });
        Ok((VenueOrderId(id), Decimal::ONE))
    }

    async fn place_limit_close(
        &self,
        _symbol: &str,
        side: OrderSide,
        price: Decimal,
        qty: Decimal,
        _qty_step: Decimal,
    ) -> Result<(VenueOrderId, Decimal), VenueError> {
        if self
            .reject_reduce_only_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| if n > 0 { Some(n - 1) } else { None })
            .is_ok()
        {
            return Err(VenueError::ReduceOnlyRejected);
        }
        let id = self.next_order_id();
        self.inner.lock().orders.push(SimOpenOrder {
            id: id.clone(),
            side,
            order_type: VenueOrderType::Limit,
            price: Some(price),
            stop_price: None,
            qty: Some(qty),
            reduce_only: true,
        });
        Ok((VenueOrderId(id), Decimal::ONE))
    }

    async fn place_stop_market(
        &self,
        _symbol: &str,
        side: OrderSide,
        stop_price: Decimal,
    ) -> Result<VenueOrderId, VenueError> {
        let id = self.next_order_id();
        self.inner.lock().orders.push(SimOpenOrder {
            id: id.clone(),
            side,
            order_type: VenueOrderType::StopMarket,
            price: None,
            stop_price: Some(stop_price),
            qty: None,
            reduce_only: false,
        });
        Ok(VenueOrderId(id))
    }

    async fn cancel_all_open_orders(&self, _symbol: &str) -> Result<(), VenueError> {
        self.inner.lock().orders.clear();
        Ok(())
    }

    async fn get_position(&self, _symbol: &str) -> Result<VenuePosition, VenueError> {
        let p = self.inner.lock().position.clone();
        Ok(VenuePosition {
            side: p.side,
            qty: p.qty,
            avg_price: p.avg_price,
            unrealized_pnl: Decimal::ZERO,
        })
    }

    async fn get_open_orders(&self, _symbol: &str) -> Result<Vec<VenueOpenOrder>, VenueError> {
        Ok(self
            .inner
            .lock()
            .orders
            .iter()
            .map(|o| VenueOpenOrder {
                id: VenueOrderId(o.id.clone()),
                side: o.side,
                order_type: o.order_type,
                price: o.price,
                stop_price: o.stop_price,
                qty: o.qty,
                reduce_only: o.reduce_only,
            })
            .collect())
    }

    async fn set_margin_mode_isolated(&self, _symbol: &str) -> Result<(), VenueError> {
        Ok(())
    }

    async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> Result<(), VenueError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn margin_rejection_surfaces_once_then_accepts() {
        let venue = SimVenue::new();
        venue.reject_next_margin(1);
        let err = venue
            .place_limit_entry("BTCUSDT", OrderSide::Buy, dec!(100), dec!(1), dec!(0.001))
            .await
            .unwrap_err();
        assert!(matches!(err, VenueError::MarginInsufficient));

        let (_, frac) = venue
            .place_limit_entry("BTCUSDT", OrderSide::Buy, dec!(100), dec!(1), dec!(0.001))
            .await
            .unwrap();
        assert_eq!(frac, Decimal::ONE);
    }

    #[tokio::test]
    async fn cancel_all_clears_resting_orders() {
        let venue = SimVenue::new();
        venue
            .place_limit_entry("BTCUSDT", OrderSide::Buy, dec!(100), dec!(1), dec!(0.001))
            .await
            .unwrap();
        assert_eq!(venue.get_open_orders("BTCUSDT").await.unwrap().len(), 1);
        venue.cancel_all_open_orders("BTCUSDT").await.unwrap();
        assert!(venue.get_open_orders("BTCUSDT").await.unwrap().is_empty());
    }
}
