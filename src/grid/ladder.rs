// =============================================================================
// Price/quantity ladder math (spec §4.5.1, §4.5.4) — the only place that
// touches tick/step rounding.
// =============================================================================
//
// Grounded on `guribe94-bog`'s decimal-first numerics: every price and
// quantity here is a `rust_decimal::Decimal`, never `f64`, so "a printed
// level is always reachable" is an exact guarantee rather than an
// epsilon-fuzzy one.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{OrderSide, PositionSide};

/// Resting-order type a venue can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Limit,
    StopMarket,
}

/// A single order the grid state machine wants to see resting at the venue
/// (spec §3 `desired_orders`, §4.5.2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredOrder {
    pub kind: crate::types::OrderKind,
    pub order_type: OrderType,
    pub side: OrderSide,
    /// Limit price, or stop-trigger price for `StopMarket`.
    pub price: Decimal,
    /// `None` for a `StopMarket` with `closePosition=true` — the venue
    /// determines quantity at trigger (spec §4.3/§6).
    pub qty: Option<Decimal>,
    pub reduce_only: bool,
}

/// Round `price` to `tick`, toward the worse side of the trade: down for a
/// LONG-side price, up for a SHORT-side price (spec §4.5.1).
pub fn round_price(price: Decimal, tick: Decimal, side: PositionSide) -> Decimal {
    if tick.is_zero() {
        return price;
    }
    let ticks = price / tick;
    let rounded_ticks = match side {
        PositionSide::Long => ticks.floor(),
        PositionSide::Short => ticks.ceil(),
        PositionSide::None => ticks.round(),
    };
    rounded_ticks * tick
}

/// Round `qty` down to the venue step (spec §4.5.4: "truncated toward
/// smaller size to avoid reduce-only rejections").
pub fn round_qty_down(qty: Decimal, step: Decimal) -> Decimal {
    if step.is_zero() {
        return qty;
    }
    (qty / step).floor() * step
}

/// `level_price(i, d)` (spec §4.5.1), 1-indexed `level` into
/// `level_distances`.
pub fn level_price(
    grid_center: Decimal,
    level_distance: Decimal,
    side: PositionSide,
    tick: Decimal,
) -> Decimal {
    let raw = match side {
        PositionSide::Long => grid_center * (Decimal::ONE - level_distance),
        PositionSide::Short => grid_center * (Decimal::ONE + level_distance),
        PositionSide::None => grid_center,
    };
    round_price(raw, tick, side)
}

/// `sl_price(d)` (spec §4.5.1).
pub fn sl_price(grid_center: Decimal, sl_distance: Decimal, side: PositionSide, tick: Decimal) -> Decimal {
    let raw = match side {
        PositionSide::Long => grid_center * (Decimal::ONE - sl_distance),
        PositionSide::Short => grid_center * (Decimal::ONE + sl_distance),
        PositionSide::None => grid_center,
    };
    round_price(raw, tick, side)
}

/// `avg_price·(1 + tp_pct)` (LONG) / `·(1 − tp_pct)` (SHORT).
pub fn tp_price(avg_price: Decimal, tp_pct: Decimal, side: PositionSide, tick: Decimal) -> Decimal {
    let raw = match side {
        PositionSide::Long => avg_price * (Decimal::ONE + tp_pct),
        PositionSide::Short => avg_price * (Decimal::ONE - tp_pct),
        PositionSide::None => avg_price,
    };
    // TP/BE are closing orders: the worse side for a close is the
    // opposite of the worse side for an entry on the same position.
    round_price(raw, tick, opposite(side))
}

/// `avg_price·(1 + be_pct)` (LONG) / `·(1 − be_pct)` (SHORT).
pub fn be_price(avg_price: Decimal, be_pct: Decimal, side: PositionSide, tick: Decimal) -> Decimal {
    let raw = match side {
        PositionSide::Long => avg_price * (Decimal::ONE + be_pct),
        PositionSide::Short => avg_price * (Decimal::ONE - be_pct),
        PositionSide::None => avg_price,
    };
    round_price(raw, tick, opposite(side))
}

fn opposite(side: PositionSide) -> PositionSide {
    match side {
        PositionSide::Long => PositionSide::Short,
        PositionSide::Short => PositionSide::Long,
        PositionSide::None => PositionSide::None,
    }
}

/// `capital·entry_ratios[i]·leverage / level_price(i)`, step-rounded down.
pub fn entry_qty(
    capital: Decimal,
    entry_ratio: Decimal,
    leverage: u32,
    price: Decimal,
    step: Decimal,
) -> Decimal {
    let notional = capital * entry_ratio * Decimal::from(leverage);
    round_qty_down(notional / price, step)
}

/// The order side that *opens* a position on `side`.
pub fn entry_order_side(side: PositionSide) -> OrderSide {
    match side {
        PositionSide::Long => OrderSide::Buy,
        PositionSide::Short => OrderSide::Sell,
        PositionSide::None => OrderSide::Buy,
    }
}

/// The order side that *closes* a position on `side`.
pub fn close_order_side(side: PositionSide) -> OrderSide {
    match side {
        PositionSide::Long => OrderSide::Sell,
        PositionSide::Short => OrderSide::Buy,
        PositionSide::None => OrderSide::Sell,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn long_entry_prices_round_down() {
        // tick = 0.5, raw price 99500.3 -> floor to 99500.0
        let px = level_price(dec!(100000), dec!(0.005), PositionSide::Long, dec!(0.5));
        assert_eq!(px, dec!(99500.0));
    }

    #[test]
    fn short_entry_prices_round_up() {
        let px = level_price(dec!(100000), dec!(0.005), PositionSide::Short, dec!(0.5));
        assert_eq!(px, dec!(100500.0));
    }

    #[test]
    fn s1_level1_price_and_qty_match_scenario() {
        let tick = dec!(0.01);
        let px = level_price(dec!(100000), dec!(0.005), PositionSide::Long, tick);
        assert_eq!(px, dec!(99500.00));
        let qty = entry_qty(dec!(1000), dec!(0.05), 15, px, dec!(0.00001));
        // 1000*0.05*15 / 99500 = 0.00753768...
        assert!((qty - dec!(0.00753)).abs() < dec!(0.00001));
    }

    #[test]
    fn s1_tp_price_matches_scenario() {
        let tp = tp_price(dec!(99500), dec!(0.005), PositionSide::Long, dec!(0.01));
        assert_eq!(tp, dec!(99997.50));
    }

    #[test]
    fn qty_rounding_truncates_toward_smaller_size() {
        let q = round_qty_down(dec!(1.2399), dec!(0.01));
        assert_eq!(q, dec!(1.23));
    }

    #[test]
    fn level_prices_strictly_decrease_for_long_ladder() {
        // I2: for LONG, level_price(i) strictly decreasing with i.
        let tick = dec!(0.01);
        let distances = [dec!(0.005), dec!(0.010), dec!(0.040), dec!(0.045)];
        let prices: Vec<Decimal> = distances
            .iter()
            .map(|d| level_price(dec!(100000), *d, PositionSide::Long, tick))
            .collect();
        for w in prices.windows(2) {
            assert!(w[0] > w[1]);
        }
    }
}
