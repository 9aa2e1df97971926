// =============================================================================
// Config Watcher (C1) — hot-reloadable KEY=VALUE strategy configuration
// =============================================================================
//
// Reads the text file described in spec §6. Re-parses at a fixed cadence
// (see event_loop.rs's config-reload task) and hands out an immutable
// snapshot; a parse or validation failure keeps the previous good snapshot
// in place and reports the error through `tracing::warn!` — the watcher
// never blocks the event loop and the core never reads global state
// directly (§9 redesign note: "replace a global config module re-imported
// at runtime with a watcher that hands a read-only snapshot").
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::types::TradeDirection;

/// Maximum supported ladder levels (spec §3: "design allows N"; current use
/// fixes N = 4).
pub const MAX_LEVELS: usize = 8;

/// Hot-reloadable strategy configuration (spec §3 `GridConfig`).
#[derive(Debug, Clone, PartialEq)]
pub struct GridConfig {
    pub initial_capital: Decimal,
    pub leverage_long: u32,
    pub leverage_short: u32,
    pub trade_direction: TradeDirection,
    pub grid_range_pct: Decimal,
    pub max_entry_level: usize,
    pub entry_ratios: Vec<Decimal>,
    pub level_distances: Vec<Decimal>,
    pub sl_distance: Decimal,
    pub tp_pct: Decimal,
    pub be_pct: Decimal,
    pub maker_fee: Decimal,
    pub taker_fee: Decimal,
}

impl GridConfig {
    /// Parse and validate a `KEY=VALUE` text file per spec §6/§4.1.
    ///
    /// Unknown keys are ignored with a `warn!`; any missing required key or
    /// out-of-range value rejects the whole snapshot (the caller keeps the
    /// previous good one).
    pub fn parse(text: &str) -> Result<Self> {
        let mut kv: HashMap<String, String> = HashMap::new();
        for (lineno, raw_line) in text.lines().enumerate() {
            let line = raw_line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .with_context(|| format!("malformed line {}: {raw_line:?}", lineno + 1))?;
            kv.insert(key.trim().to_ascii_uppercase(), value.trim().to_string());
        }

        let get = |k: &str| -> Result<&String> {
            kv.get(k).with_context(|| format!("missing required key {k}"))
        };

        let decimal = |k: &str| -> Result<Decimal> {
            get(k)?
                .parse::<Decimal>()
                .with_context(|| format!("key {k} is not a valid decimal"))
        };

        let initial_capital = decimal("INITIAL_CAPITAL")?;
        let leverage_long: u32 = get("LEVERAGE_LONG")?
            .parse()
            .context("LEVERAGE_LONG is not a valid integer")?;
        let leverage_short: u32 = get("LEVERAGE_SHORT")?
            .parse()
            .context("LEVERAGE_SHORT is not a valid integer")?;
        let trade_direction: TradeDirection = get("TRADE_DIRECTION")?.parse()?;
        let grid_range_pct = decimal("GRID_RANGE_PCT")?;
        let max_entry_level: usize = get("MAX_ENTRY_LEVEL")?
            .parse()
            .context("MAX_ENTRY_LEVEL is not a valid integer")?;

        let parse_list = |k: &str| -> Result<Vec<Decimal>> {
            get(k)?
                .split(',')
                .map(|s| {
                    s.trim()
                        .parse::<Decimal>()
                        .with_context(|| format!("key {k} has a non-decimal entry: {s:?}"))
                })
                .collect()
        };

        let entry_ratios = parse_list("ENTRY_RATIOS")?;
        let level_distances = parse_list("LEVEL_DISTANCES")?;
        let sl_distance = decimal("SL_DISTANCE")?;
        let tp_pct = decimal("TP_PCT")?;
        let be_pct = decimal("BE_PCT")?;
        let maker_fee = decimal("MAKER_FEE")?;
        let taker_fee = decimal("TAKER_FEE")?;

        for (k, v) in &kv {
            let known = [
                "INITIAL_CAPITAL",
                "LEVERAGE_LONG",
                "LEVERAGE_SHORT",
                "TRADE_DIRECTION",
                "GRID_RANGE_PCT",
                "MAX_ENTRY_LEVEL",
                "ENTRY_RATIOS",
                "LEVEL_DISTANCES",
                "SL_DISTANCE",
                "TP_PCT",
                "BE_PCT",
                "MAKER_FEE",
                "TAKER_FEE",
            ];
            if !known.contains(&k.as_str()) {
                warn!(key = %k, value = %v, "unknown config key ignored");
            }
        }

        let cfg = Self {
            initial_capital,
            leverage_long,
            leverage_short,
            trade_direction,
            grid_range_pct,
            max_entry_level,
            entry_ratios,
            level_distances,
            sl_distance,
            tp_pct,
            be_pct,
            maker_fee,
            taker_fee,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Range/consistency checks from spec §4.1 and invariant I2.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.leverage_long > 0, "LEVERAGE_LONG must be positive");
        anyhow::ensure!(self.leverage_short > 0, "LEVERAGE_SHORT must be positive");
        anyhow::ensure!(
            self.grid_range_pct > Decimal::ZERO,
            "GRID_RANGE_PCT must be positive"
        );
        anyhow::ensure!(
            self.max_entry_level >= 1 && self.max_entry_level <= MAX_LEVELS,
            "MAX_ENTRY_LEVEL out of supported range"
        );
        anyhow::ensure!(
            self.entry_ratios.len() == self.max_entry_level,
            "ENTRY_RATIOS length must equal MAX_ENTRY_LEVEL"
        );
        anyhow::ensure!(
            self.level_distances.len() == self.max_entry_level,
            "LEVEL_DISTANCES length must equal MAX_ENTRY_LEVEL"
        );
        anyhow::ensure!(
            self.entry_ratios.iter().all(|r| *r > Decimal::ZERO),
            "ENTRY_RATIOS must all be positive"
        );
        let ratio_sum: Decimal = self.entry_ratios.iter().sum();
        anyhow::ensure!(
            ratio_sum <= Decimal::ONE,
            "ENTRY_RATIOS must sum to <= 1, got {ratio_sum}"
        );
        anyhow::ensure!(
            self.level_distances.iter().all(|d| *d > Decimal::ZERO),
            "LEVEL_DISTANCES must all be positive"
        );
        for pair in self.level_distances.windows(2) {
            anyhow::ensure!(
                pair[1] > pair[0],
                "LEVEL_DISTANCES must be strictly increasing"
            );
        }
        let last_distance = *self
            .level_distances
            .last()
            .context("LEVEL_DISTANCES must not be empty")?;
        anyhow::ensure!(
            self.sl_distance > last_distance,
            "SL_DISTANCE must exceed the last LEVEL_DISTANCES entry"
        );
        anyhow::ensure!(self.tp_pct > Decimal::ZERO, "TP_PCT must be positive");
        anyhow::ensure!(self.be_pct > Decimal::ZERO, "BE_PCT must be positive");
        anyhow::ensure!(
            self.be_pct < self.tp_pct,
            "BE_PCT must be strictly less than TP_PCT"
        );
        anyhow::ensure!(
            self.maker_fee >= Decimal::ZERO && self.taker_fee >= Decimal::ZERO,
            "fees must be non-negative"
        );
        Ok(())
    }
}

/// Reload cadence floor — recomputed at most once per this interval (spec §4.1).
pub const RELOAD_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

/// Owns the on-disk config path and the current good snapshot.
///
/// Cheap to clone (wraps an `Arc<RwLock<..>>`); every reconciliation tick
/// reads `current()` once and works off that immutable `Arc<GridConfig>`
/// for the rest of the tick, per §9's redesign note that "the core never
/// reads global state".
#[derive(Clone)]
pub struct ConfigWatcher {
    path: PathBuf,
    current: Arc<RwLock<Arc<GridConfig>>>,
}

impl ConfigWatcher {
    /// Load the initial snapshot. A parse failure here is fatal — there is
    /// no previous good snapshot to fall back to (spec §6: exit code 1).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let cfg = GridConfig::parse(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        info!(path = %path.display(), "grid config loaded");
        Ok(Self {
            path,
            current: Arc::new(RwLock::new(Arc::new(cfg))),
        })
    }

    /// Current immutable snapshot.
    pub fn current(&self) -> Arc<GridConfig> {
        self.current.read().clone()
    }

    /// Re-read the file from disk. On success, swaps in the new snapshot
    /// and returns `Ok(true)` if it differs from the previous one. On
    /// failure, logs a `warn!` and leaves the previous snapshot in place
    /// (last-good-wins), returning `Ok(false)`.
    pub fn reload(&self) -> Result<bool> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "config reload: read failed, keeping last-good snapshot");
                return Ok(false);
            }
        };

        match GridConfig::parse(&text) {
            Ok(new_cfg) => {
                let changed = *self.current.read() != Arc::new(new_cfg.clone());
                if changed {
                    info!(path = %self.path.display(), "grid config reloaded with changes");
                    *self.current.write() = Arc::new(new_cfg);
                }
                Ok(changed)
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "config reload: parse/validate failed, keeping last-good snapshot");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_text() -> &'static str {
        "INITIAL_CAPITAL=1000\n\
         LEVERAGE_LONG=15\n\
         LEVERAGE_SHORT=15\n\
         TRADE_DIRECTION=LONG\n\
         GRID_RANGE_PCT=0.04\n\
         MAX_ENTRY_LEVEL=4\n\
         ENTRY_RATIOS=0.05,0.20,0.25,0.50\n\
         LEVEL_DISTANCES=0.005,0.010,0.040,0.045\n\
         SL_DISTANCE=0.05\n\
         TP_PCT=0.005\n\
         BE_PCT=0.001\n\
         MAKER_FEE=0.0002\n\
         TAKER_FEE=0.0005\n"
    }

    #[test]
    fn parses_valid_config() {
        let cfg = GridConfig::parse(sample_text()).unwrap();
        assert_eq!(cfg.max_entry_level, 4);
        assert_eq!(cfg.entry_ratios.len(), 4);
        assert_eq!(cfg.trade_direction, TradeDirection::Long);
    }

    #[test]
    fn ignores_comments_and_blank_lines() {
        let text = format!("# a comment\n\n{}\n# trailing\n", sample_text());
        assert!(GridConfig::parse(&text).is_ok());
    }

    #[test]
    fn unknown_key_is_ignored_not_rejected() {
        let text = format!("{}\nSOME_FUTURE_KEY=123\n", sample_text());
        assert!(GridConfig::parse(&text).is_ok());
    }

    #[test]
    fn missing_required_key_rejected() {
        let text = sample_text().replace("TP_PCT=0.005\n", "");
        assert!(GridConfig::parse(&text).is_err());
    }

    #[test]
    fn sl_distance_must_exceed_last_level_distance() {
        let text = sample_text().replace("SL_DISTANCE=0.05", "SL_DISTANCE=0.04");
        assert!(GridConfig::parse(&text).is_err());
    }

    #[test]
    fn entry_ratios_must_not_exceed_one() {
        let text = sample_text().replace(
            "ENTRY_RATIOS=0.05,0.20,0.25,0.50",
            "ENTRY_RATIOS=0.50,0.50,0.50,0.50",
        );
        assert!(GridConfig::parse(&text).is_err());
    }

    #[test]
    fn level_distances_must_be_strictly_increasing() {
        let text = sample_text().replace(
            "LEVEL_DISTANCES=0.005,0.010,0.040,0.045",
            "LEVEL_DISTANCES=0.005,0.005,0.040,0.045",
        );
        assert!(GridConfig::parse(&text).is_err());
    }

    #[test]
    fn be_pct_must_be_less_than_tp_pct() {
        let text = sample_text().replace("BE_PCT=0.001", "BE_PCT=0.01");
        assert!(GridConfig::parse(&text).is_err());
    }

    #[test]
    fn watcher_keeps_last_good_on_reload_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strategy.conf");
        std::fs::write(&path, sample_text()).unwrap();

        let watcher = ConfigWatcher::load(&path).unwrap();
        let good = watcher.current();

        std::fs::write(&path, "INITIAL_CAPITAL=not_a_number\n").unwrap();
        let changed = watcher.reload().unwrap();
        assert!(!changed);
        assert_eq!(watcher.current(), good);
    }

    #[test]
    fn watcher_reloads_on_valid_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strategy.conf");
        std::fs::write(&path, sample_text()).unwrap();

        let watcher = ConfigWatcher::load(&path).unwrap();
        let updated = sample_text().replace("INITIAL_CAPITAL=1000", "INITIAL_CAPITAL=2000");
        std::fs::write(&path, updated).unwrap();

        let changed = watcher.reload().unwrap();
        assert!(changed);
        assert_eq!(watcher.current().initial_capital, Decimal::new(2000, 0));
    }
}
