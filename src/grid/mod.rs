// =============================================================================
// Grid State Machine (C5) — the pure decision core.
// =============================================================================
//
// Every function in this module is a pure `(StrategyState, GridConfig,
// PerpetualSymbol, event) -> (StrategyState, journal entries)` transform.
// No I/O, no clocks, no venue calls — those live in C3/C4/C6/C7. This split
// is the redesign spec §9 calls for ("shared-mutable strategy object ...
// replace with an explicit value-typed StrategyState plus pure transition
// functions; side effects confined to C3/C2/C4 called by C6").

pub mod ladder;

use anyhow::{bail, Result};
use rust_decimal::Decimal;

use crate::config::GridConfig;
use crate::state::{FilledEntry, StrategyState};
use crate::types::{OrderKind, PerpetualSymbol, PositionSide};
use ladder::{
    be_price, close_order_side, entry_order_side, entry_qty, level_price, round_qty_down, sl_price,
    tp_price, DesiredOrder, OrderType,
};

/// Relative tolerance for the BE venue-quantity reconciliation (spec §9 Q1,
/// §4.5.3 step 3: "if position_qty ≈ level1_qty within tolerance, accept").
const BE_QTY_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 3); // 0.001 = 0.1%

/// Inputs the reconciler (C6) feeds into the state machine.
#[derive(Debug, Clone)]
pub enum GridEvent {
    /// A 1-minute bar closed at `close_price` (spec §4.5.3, §4.7).
    BarClose { close_price: Decimal },
    /// An entry order filled at ladder level `level` (1-indexed).
    EntryFill {
        side: PositionSide,
        level: u8,
        fill_price: Decimal,
        fill_qty: Decimal,
    },
    /// The take-profit order filled (position was at level 1).
    TakeProfitFill { fill_price: Decimal },
    /// The break-even order filled (position was at level ≥ 2).
    /// `venue_position_qty_after` is the venue's authoritative remaining
    /// position size after C6 cancels all orders and polls (spec §4.5.3
    /// step 3).
    BreakEvenFill {
        fill_price: Decimal,
        venue_position_qty_after: Decimal,
    },
    /// The stop-loss order filled (position was at level N).
    StopLossFill { fill_price: Decimal },
}

/// One line destined for the trade journal (C4); see spec §4.4 columns.
#[derive(Debug, Clone, PartialEq)]
pub enum JournalEventKind {
    EntryLevel(u8),
    TakeProfit,
    PartialBreakEven,
    /// Added per spec §9 Q1 resolution: a BE-fill venue-quantity mismatch
    /// beyond tolerance is audited as its own journal line, in addition to
    /// a `tracing::warn!`.
    PartialBreakEvenMismatch,
    StopLoss,
    CancelAll,
}

#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub event: JournalEventKind,
    pub price: Decimal,
    pub qty: Decimal,
    pub realized_pnl: Decimal,
    pub running_capital: Decimal,
    pub grid_center_at_event: Decimal,
    pub start_grid_center: Option<Decimal>,
}

/// The result of applying one `GridEvent` to a `StrategyState`.
#[derive(Debug, Clone)]
pub struct Transition {
    pub state: StrategyState,
    pub journal: Vec<JournalEntry>,
}

/// Compute `level_price`/`sl_price` pairs for every *unfilled* level
/// `from_level..=N` on `side` (spec §4.5.2 "remaining entries").
fn remaining_entry_orders(
    state: &StrategyState,
    config: &GridConfig,
    symbol: &PerpetualSymbol,
    side: PositionSide,
    grid_center: Decimal,
    from_level: usize,
) -> Vec<DesiredOrder> {
    let mut out = Vec::new();
    for i in from_level..config.max_entry_level {
        let distance = config.level_distances[i];
        let price = level_price(grid_center, distance, side, symbol.tick_size);
        let leverage = match side {
            PositionSide::Long => config.leverage_long,
            PositionSide::Short => config.leverage_short,
            PositionSide::None => 0,
        };
        let qty = entry_qty(
            state.capital,
            config.entry_ratios[i],
            leverage,
            price,
            symbol.qty_step,
        );
        out.push(DesiredOrder {
            kind: OrderKind::Entry((i + 1) as u8),
            order_type: OrderType::Limit,
            side: entry_order_side(side),
            price,
            qty: Some(qty),
            reduce_only: false,
        });
    }
    out
}

/// The full flat-state entry ladder on every armed side (spec §4.5.2, B1).
fn flat_entry_ladder(state: &StrategyState, config: &GridConfig, symbol: &PerpetualSymbol) -> Vec<DesiredOrder> {
    let grid_center = match state.grid_center {
        Some(g) => g,
        None => return Vec::new(),
    };
    let mut out = Vec::new();
    if config.trade_direction.arms_long() {
        out.extend(remaining_entry_orders(
            state,
            config,
            symbol,
            PositionSide::Long,
            grid_center,
            0,
        ));
    }
    if config.trade_direction.arms_short() {
        out.extend(remaining_entry_orders(
            state,
            config,
            symbol,
            PositionSide::Short,
            grid_center,
            0,
        ));
    }
    out
}

/// Deterministic desired-orders-set function of `(position_side,
/// current_level, avg_price, grid_center)` (spec §4.5.2 table).
pub fn desired_orders_for(state: &StrategyState, config: &GridConfig, symbol: &PerpetualSymbol) -> Vec<DesiredOrder> {
    let side = state.position_side;
    if side == PositionSide::None {
        return flat_entry_ladder(state, config, symbol);
    }

    let grid_center = match state.grid_center {
        Some(g) => g,
        None => return Vec::new(),
    };
    let avg_price = match state.avg_price {
        Some(a) => a,
        None => return Vec::new(),
    };
    let level = state.current_level as usize;
    let n = config.max_entry_level;

    let mut out = Vec::new();

    if level == 1 {
        out.push(DesiredOrder {
            kind: OrderKind::TakeProfit,
            order_type: OrderType::Limit,
            side: close_order_side(side),
            price: tp_price(avg_price, config.tp_pct, side, symbol.tick_size),
            qty: Some(round_qty_down(state.total_size, symbol.qty_step)),
            reduce_only: true,
        });
        out.extend(remaining_entry_orders(state, config, symbol, side, grid_center, 1));
    } else {
        // 2 <= level <= N: BE always resting.
        let close_qty = round_qty_down(state.total_size - state.level1_qty, symbol.qty_step);
        out.push(DesiredOrder {
            kind: OrderKind::BreakEven,
            order_type: OrderType::Limit,
            side: close_order_side(side),
            price: be_price(avg_price, config.be_pct, side, symbol.tick_size),
            qty: Some(close_qty),
            reduce_only: true,
        });
        if level < n {
            out.extend(remaining_entry_orders(state, config, symbol, side, grid_center, level));
        } else {
            out.push(DesiredOrder {
                kind: OrderKind::StopLoss,
                order_type: OrderType::StopMarket,
                side: close_order_side(side),
                price: sl_price(grid_center, config.sl_distance, side, symbol.tick_size),
                qty: None,
                reduce_only: false,
            });
        }
    }

    out
}

/// `|last_close − grid_center| / grid_center > grid_range_pct / 2` on the
/// out-of-armed-direction side (spec §4.5.3 "Flat-state range breach", B2).
/// Only meaningful while flat; callers must not invoke this with a position
/// open.
fn range_breached(grid_center: Decimal, last_close: Decimal, config: &GridConfig) -> bool {
    let half = config.grid_range_pct / Decimal::from(2);
    let upward = last_close > grid_center && (last_close - grid_center) / grid_center > half;
    let downward = last_close < grid_center && (grid_center - last_close) / grid_center > half;

    match config.trade_direction {
        crate::types::TradeDirection::Long => upward,
        crate::types::TradeDirection::Short => downward,
        crate::types::TradeDirection::Both => upward || downward,
    }
}

fn weighted_avg(entries: &[FilledEntry]) -> Decimal {
    let total_qty: Decimal = entries.iter().map(|e| e.base_qty).sum();
    if total_qty.is_zero() {
        return Decimal::ZERO;
    }
    let weighted: Decimal = entries.iter().map(|e| e.fill_price * e.base_qty).sum();
    weighted / total_qty
}

/// Apply one event to `state`, producing the next `StrategyState` plus any
/// journal lines C6 should append via C4 (spec §4.5.3).
pub fn apply_event(
    state: &StrategyState,
    config: &GridConfig,
    symbol: &PerpetualSymbol,
    event: GridEvent,
) -> Result<Transition> {
    match event {
        GridEvent::BarClose { close_price } => Ok(on_bar_close(state, config, symbol, close_price)),
        GridEvent::EntryFill {
            side,
            level,
            fill_price,
            fill_qty,
        } => on_entry_fill(state, config, symbol, side, level, fill_price, fill_qty),
        GridEvent::TakeProfitFill { fill_price } => on_take_profit_fill(state, config, symbol, fill_price),
        GridEvent::BreakEvenFill {
            fill_price,
            venue_position_qty_after,
        } => on_break_even_fill(state, config, symbol, fill_price, venue_position_qty_after),
        GridEvent::StopLossFill { fill_price } => on_stop_loss_fill(state, config, symbol, fill_price),
    }
}

fn on_bar_close(state: &StrategyState, config: &GridConfig, symbol: &PerpetualSymbol, close_price: Decimal) -> Transition {
    let mut next = state.clone();

    if next.grid_center.is_none() {
        // B1: first bar close after start.
        next.grid_center = Some(close_price);
        next.desired_orders = desired_orders_for(&next, config, symbol);
        return Transition { state: next, journal: Vec::new() };
    }

    if next.position_side == PositionSide::None {
        let grid_center = next.grid_center.expect("checked above");
        if range_breached(grid_center, close_price, config) {
            next.grid_center = Some(close_price);
            next.desired_orders = desired_orders_for(&next, config, symbol);
            let journal = vec![JournalEntry {
                event: JournalEventKind::CancelAll,
                price: close_price,
                qty: Decimal::ZERO,
                realized_pnl: Decimal::ZERO,
                running_capital: next.capital,
                grid_center_at_event: close_price,
                start_grid_center: next.start_grid_center,
            }];
            return Transition { state: next, journal };
        }
    }

    Transition { state: next, journal: Vec::new() }
}

fn on_entry_fill(
    state: &StrategyState,
    config: &GridConfig,
    symbol: &PerpetualSymbol,
    side: PositionSide,
    level: u8,
    fill_price: Decimal,
    fill_qty: Decimal,
) -> Result<Transition> {
    if level == 0 || level as usize > config.max_entry_level {
        bail!("entry fill at out-of-range level {level}");
    }

    let mut next = state.clone();
    let notional = fill_price * fill_qty;
    let fee = notional * config.maker_fee;

    if next.position_side == PositionSide::None {
        next.position_side = side;
        next.start_grid_center = next.grid_center;
    }

    next.entries.push(FilledEntry {
        level_index: level,
        fill_price,
        base_qty: fill_qty,
        notional,
    });
    next.current_level = level;
    if level == 1 {
        next.level1_qty = fill_qty;
    }
    next.total_size = next.entries.iter().map(|e| e.base_qty).sum();
    next.avg_price = Some(weighted_avg(&next.entries));
    next.entry_fees += fee;
    next.desired_orders = desired_orders_for(&next, config, symbol);

    let journal = vec![JournalEntry {
        event: JournalEventKind::EntryLevel(level),
        price: fill_price,
        qty: fill_qty,
        realized_pnl: Decimal::ZERO,
        running_capital: next.capital,
        grid_center_at_event: next.grid_center.unwrap_or(fill_price),
        start_grid_center: next.start_grid_center,
    }];

    Ok(Transition { state: next, journal })
}

fn on_take_profit_fill(
    state: &StrategyState,
    config: &GridConfig,
    symbol: &PerpetualSymbol,
    fill_price: Decimal,
) -> Result<Transition> {
    let avg_price = state
        .avg_price
        .ok_or_else(|| anyhow::anyhow!("TP fill with no avg_price — not in a position"))?;
    let side = state.position_side;
    let qty = state.total_size;

    let gross = match side {
        PositionSide::Long => (fill_price - avg_price) * qty,
        PositionSide::Short => (avg_price - fill_price) * qty,
        PositionSide::None => bail!("TP fill while flat"),
    };
    let exit_fee = fill_price * qty * config.maker_fee;
    let net = gross - exit_fee - state.entry_fees;

    let mut next = state.clone();
    next.capital += net;
    next.entries.clear();
    next.total_size = Decimal::ZERO;
    next.level1_qty = Decimal::ZERO;
    next.entry_fees = Decimal::ZERO;
    next.current_level = 0;
    next.avg_price = None;
    next.position_side = PositionSide::None;
    next.start_grid_center = None;
    next.grid_center = Some(fill_price);
    next.desired_orders = desired_orders_for(&next, config, symbol);

    let journal = vec![JournalEntry {
        event: JournalEventKind::TakeProfit,
        price: fill_price,
        qty,
        realized_pnl: net,
        running_capital: next.capital,
        grid_center_at_event: fill_price,
        start_grid_center: state.start_grid_center,
    }];

    Ok(Transition { state: next, journal })
}

fn on_break_even_fill(
    state: &StrategyState,
    config: &GridConfig,
    symbol: &PerpetualSymbol,
    fill_price: Decimal,
    venue_position_qty_after: Decimal,
) -> Result<Transition> {
    let avg_price_before = state
        .avg_price
        .ok_or_else(|| anyhow::anyhow!("BE fill with no avg_price — not in a position"))?;
    let side = state.position_side;
    if side == PositionSide::None {
        bail!("BE fill while flat");
    }
    if state.total_size.is_zero() {
        bail!("BE fill with zero total_size");
    }

    let close_qty = state.total_size - state.level1_qty;
    let gross = match side {
        PositionSide::Long => (fill_price - avg_price_before) * close_qty,
        PositionSide::Short => (avg_price_before - fill_price) * close_qty,
        PositionSide::None => unreachable!(),
    };
    let exit_fee = fill_price * close_qty * config.maker_fee;
    let entry_fee_portion = state.entry_fees * (close_qty / state.total_size);
    let net = gross - exit_fee - entry_fee_portion;

    // Spec §4.5.3 step 3 / §9 Q1: venue values are authoritative; a
    // mismatch beyond tolerance is warned and audited, not silently
    // swallowed.
    let diff = (venue_position_qty_after - state.level1_qty).abs();
    let mismatch = if state.level1_qty.is_zero() {
        !venue_position_qty_after.is_zero()
    } else {
        diff / state.level1_qty > BE_QTY_TOLERANCE
    };
    if mismatch {
        tracing::warn!(
            expected = %state.level1_qty,
            actual = %venue_position_qty_after,
            "BE fill: venue position qty diverges from level1_qty beyond tolerance; adopting venue value"
        );
    }
    let level1_qty_after_sync = venue_position_qty_after;

    let mut next = state.clone();
    next.capital += net;
    next.entries = vec![FilledEntry {
        level_index: 1,
        fill_price: avg_price_before,
        base_qty: level1_qty_after_sync,
        notional: avg_price_before * level1_qty_after_sync,
    }];
    next.current_level = 1;
    next.total_size = level1_qty_after_sync;
    next.level1_qty = level1_qty_after_sync;
    next.avg_price = Some(avg_price_before);
    next.entry_fees = state.entry_fees - entry_fee_portion;

    let level_distance_1 = config.level_distances[0];
    let new_grid_center = match side {
        PositionSide::Long => avg_price_before / (Decimal::ONE - level_distance_1),
        PositionSide::Short => avg_price_before / (Decimal::ONE + level_distance_1),
        PositionSide::None => unreachable!(),
    };
    next.grid_center = Some(new_grid_center);
    next.desired_orders = desired_orders_for(&next, config, symbol);

    let mut journal = vec![JournalEntry {
        event: JournalEventKind::PartialBreakEven,
        price: fill_price,
        qty: close_qty,
        realized_pnl: net,
        running_capital: next.capital,
        grid_center_at_event: new_grid_center,
        start_grid_center: state.start_grid_center,
    }];
    if mismatch {
        journal.push(JournalEntry {
            event: JournalEventKind::PartialBreakEvenMismatch,
            price: fill_price,
            qty: venue_position_qty_after,
            realized_pnl: Decimal::ZERO,
            running_capital: next.capital,
            grid_center_at_event: new_grid_center,
            start_grid_center: state.start_grid_center,
        });
    }

    Ok(Transition { state: next, journal })
}

fn on_stop_loss_fill(
    state: &StrategyState,
    config: &GridConfig,
    symbol: &PerpetualSymbol,
    fill_price: Decimal,
) -> Result<Transition> {
    let avg_price = state
        .avg_price
        .ok_or_else(|| anyhow::anyhow!("SL fill with no avg_price — not in a position"))?;
    let side = state.position_side;
    let qty = state.total_size;

    let gross = match side {
        PositionSide::Long => (fill_price - avg_price) * qty,
        PositionSide::Short => (avg_price - fill_price) * qty,
        PositionSide::None => bail!("SL fill while flat"),
    };
    let exit_fee = fill_price * qty * config.taker_fee;
    let net = gross - exit_fee - state.entry_fees;

    let mut next = state.clone();
    next.capital += net;
    next.entries.clear();
    next.total_size = Decimal::ZERO;
    next.level1_qty = Decimal::ZERO;
    next.entry_fees = Decimal::ZERO;
    next.current_level = 0;
    next.avg_price = None;
    next.position_side = PositionSide::None;
    next.start_grid_center = None;
    next.grid_center = Some(fill_price);
    next.desired_orders = desired_orders_for(&next, config, symbol);

    let journal = vec![JournalEntry {
        event: JournalEventKind::StopLoss,
        price: fill_price,
        qty,
        realized_pnl: net,
        running_capital: next.capital,
        grid_center_at_event: fill_price,
        start_grid_center: state.start_grid_center,
    }];

    Ok(Transition { state: next, journal })
}
