// =============================================================================
// Shared types used across the Aurora grid engine
// =============================================================================

use serde::{Deserialize, Serialize};
use std::fmt;

/// Venue identifier for a single perpetual-futures contract, plus the two
/// precision constants the ladder math must respect. Constant for the
/// lifetime of a process — each symbol runs as its own process (spec §1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerpetualSymbol {
    /// Venue symbol, e.g. "BTCUSDT".
    pub name: String,
    /// Smallest price increment the venue accepts.
    pub tick_size: rust_decimal::Decimal,
    /// Smallest quantity increment the venue accepts.
    pub qty_step: rust_decimal::Decimal,
}

impl PerpetualSymbol {
    pub fn new(
        name: impl Into<String>,
        tick_size: rust_decimal::Decimal,
        qty_step: rust_decimal::Decimal,
    ) -> Self {
        Self {
            name: name.into(),
            tick_size,
            qty_step,
        }
    }
}

impl fmt::Display for PerpetualSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Which side(s) of the ladder are armed for entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeDirection {
    Long,
    Short,
    Both,
}

impl TradeDirection {
    pub fn arms_long(self) -> bool {
        matches!(self, Self::Long | Self::Both)
    }

    pub fn arms_short(self) -> bool {
        matches!(self, Self::Short | Self::Both)
    }
}

impl fmt::Display for TradeDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
            Self::Both => write!(f, "BOTH"),
        }
    }
}

impl std::str::FromStr for TradeDirection {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LONG" => Ok(Self::Long),
            "SHORT" => Ok(Self::Short),
            "BOTH" => Ok(Self::Both),
            other => anyhow::bail!("invalid TRADE_DIRECTION: {other}"),
        }
    }
}

/// Which side of the market the current position (if any) sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    None,
    Long,
    Short,
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "NONE"),
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// "BUY" / "SELL" as sent to the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// The kind of resting order the grid state machine can want at the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Entry(u8),
    TakeProfit,
    BreakEven,
    StopLoss,
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entry(level) => write!(f, "ENTRY_L{level}"),
            Self::TakeProfit => write!(f, "TP"),
            Self::BreakEven => write!(f, "BE"),
            Self::StopLoss => write!(f, "SL"),
        }
    }
}

/// Closed taxonomy of venue call outcomes (spec §4.3, §9 redesign note).
///
/// Every venue operation that can fail maps its response onto one of these
/// variants at the call site; nothing upstream matches on raw HTTP status
/// codes or provider error strings.
#[derive(Debug, thiserror::Error)]
pub enum VenueError {
    #[error("margin insufficient for requested notional")]
    MarginInsufficient,
    #[error("reduce-only order rejected by venue")]
    ReduceOnlyRejected,
    #[error("rate limited by venue")]
    RateLimited,
    #[error("transient venue error: {0}")]
    Transient(String),
    #[error("fatal venue error: {0}")]
    Fatal(String),
}

impl VenueError {
    pub fn is_retryable_shrink(&self) -> bool {
        matches!(self, Self::MarginInsufficient | Self::ReduceOnlyRejected)
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn trade_direction_arms_correct_sides() {
        assert!(TradeDirection::Long.arms_long());
        assert!(!TradeDirection::Long.arms_short());
        assert!(TradeDirection::Both.arms_long());
        assert!(TradeDirection::Both.arms_short());
    }

    #[test]
    fn trade_direction_parses_case_insensitively() {
        assert_eq!(TradeDirection::from_str("long").unwrap(), TradeDirection::Long);
        assert_eq!(TradeDirection::from_str("BOTH").unwrap(), TradeDirection::Both);
        assert!(TradeDirection::from_str("sideways").is_err());
    }

    #[test]
    fn venue_error_classification() {
        assert!(VenueError::MarginInsufficient.is_retryable_shrink());
        assert!(VenueError::ReduceOnlyRejected.is_retryable_shrink());
        assert!(!VenueError::Fatal("x".into()).is_retryable_shrink());
        assert!(VenueError::RateLimited.is_transient());
        assert!(VenueError::Transient("timeout".into()).is_transient());
    }
}
