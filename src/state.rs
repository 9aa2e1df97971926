// =============================================================================
// State Store (C2) — crash-safe snapshot of one symbol's StrategyState
// =============================================================================
//
// Persistence follows the teacher's `RuntimeConfig::save` pattern exactly:
// serialize to a `.tmp` sibling, then `rename` over the destination. Unlike
// the teacher's config save, spec §4.2/§5 require an `fsync` before the
// rename so the write is crash-atomic even across a host power loss, not
// just a process crash — invariant I6.
// =============================================================================

use std::fs::{self, File};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::grid::ladder::DesiredOrder;
use crate::types::PositionSide;

/// Current on-disk schema version (spec §6: "Schema versioned by an
/// integer field to permit migration").
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// A single filled ladder entry (spec §3 `entries`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilledEntry {
    pub level_index: u8,
    pub fill_price: Decimal,
    pub base_qty: Decimal,
    pub notional: Decimal,
}

/// The full persisted strategy state for one symbol (spec §3 `StrategyState`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyState {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,

    pub grid_center: Option<Decimal>,
    pub start_grid_center: Option<Decimal>,
    pub position_side: PositionSide,
    pub current_level: u8,
    pub entries: Vec<FilledEntry>,
    pub avg_price: Option<Decimal>,
    pub total_size: Decimal,
    pub level1_qty: Decimal,
    pub entry_fees: Decimal,
    pub capital: Decimal,
    pub desired_orders: Vec<DesiredOrder>,
    pub last_synced_at: Option<chrono::DateTime<chrono::Utc>>,
}

fn default_schema_version() -> u32 {
    STATE_SCHEMA_VERSION
}

impl StrategyState {
    /// The empty/default state for a freshly started process with no prior
    /// snapshot (spec §4.2: "a parse failure is fatal... reads on startup
    /// return either the parsed state or an empty default").
    pub fn empty(initial_capital: Decimal) -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            grid_center: None,
            start_grid_center: None,
            position_side: PositionSide::None,
            current_level: 0,
            entries: Vec::new(),
            avg_price: None,
            total_size: Decimal::ZERO,
            level1_qty: Decimal::ZERO,
            entry_fees: Decimal::ZERO,
            capital: initial_capital,
            desired_orders: Vec::new(),
            last_synced_at: None,
        }
    }

    /// Invariant 1: `position_side = NONE ⇔ current_level = 0 ⇔ entries is
    /// empty ⇔ total_size = 0`.
    pub fn check_invariant_flat_consistency(&self) -> bool {
        let flat = self.position_side == PositionSide::None;
        flat == (self.current_level == 0)
            && flat == self.entries.is_empty()
            && flat == self.total_size.is_zero()
    }

    /// Invariant 2: `current_level = len(entries)`.
    pub fn check_invariant_level_matches_entries(&self) -> bool {
        self.current_level as usize == self.entries.len()
    }

    /// Invariant 6: `level1_qty = entries[0].base_qty` while the position
    /// has not been fully closed.
    pub fn check_invariant_level1_qty(&self) -> bool {
        match self.entries.first() {
            Some(e) => self.level1_qty == e.base_qty,
            None => true,
        }
    }
}

/// Single-writer, atomic-rename persistence for one `StrategyState` per
/// symbol (spec §4.2). No locking: each symbol has exactly one process.
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load the persisted state, or an empty default if no file exists yet.
    /// A parse failure on an *existing* file is fatal (spec §4.2/§7: "the
    /// operator must inspect, not silently reset") — the caller should map
    /// this error onto exit code 3.
    pub fn load(&self, initial_capital: Decimal) -> Result<StrategyState> {
        if !self.path.exists() {
            return Ok(StrategyState::empty(initial_capital));
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read state file {}", self.path.display()))?;
        let state: StrategyState = serde_json::from_str(&content).with_context(|| {
            format!(
                "state file {} is corrupt — refusing to silently reset (operator must inspect)",
                self.path.display()
            )
        })?;
        Ok(state)
    }

    /// Persist `state` atomically: write to a `.tmp` sibling, `fsync`, then
    /// `rename` over the destination (spec §4.2, invariant I6).
    pub fn save(&self, state: &StrategyState) -> Result<()> {
        let content = serde_json::to_string_pretty(state)
            .context("failed to serialize StrategyState to JSON")?;

        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut f = File::create(&tmp_path)
                .with_context(|| format!("failed to create tmp state file {}", tmp_path.display()))?;
            f.write_all(content.as_bytes())
                .context("failed to write tmp state file")?;
            f.sync_all().context("failed to fsync tmp state file")?;
        }

        fs::rename(&tmp_path, &self.path).with_context(|| {
            format!(
                "failed to rename tmp state file {} to {}",
                tmp_path.display(),
                self.path.display()
            )
        })?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn load_missing_file_returns_empty_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let state = store.load(dec!(1000)).unwrap();
        assert_eq!(state.position_side, PositionSide::None);
        assert_eq!(state.capital, dec!(1000));
        assert!(state.check_invariant_flat_consistency());
    }

    #[test]
    fn save_then_load_roundtrips_byte_identical_after_reparse() {
        // R1: loading a snapshot and immediately saving it produces a
        // byte-identical file.
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let state = StrategyState::empty(dec!(1000));
        store.save(&state).unwrap();

        let bytes_before = fs::read(store.path()).unwrap();
        let loaded = store.load(dec!(1000)).unwrap();
        store.save(&loaded).unwrap();
        let bytes_after = fs::read(store.path()).unwrap();

        assert_eq!(bytes_before, bytes_after);
    }

    #[test]
    fn corrupt_state_file_is_a_load_error_not_silent_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"{ not json").unwrap();
        let store = StateStore::new(path);
        assert!(store.load(dec!(1000)).is_err());
    }

    #[test]
    fn atomic_save_leaves_no_tmp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        store.save(&StrategyState::empty(dec!(1000))).unwrap();
        assert!(!dir.path().join("state.json.tmp").exists());
        assert!(dir.path().join("state.json").exists());
    }

    #[test]
    fn invariant_helpers_detect_violations() {
        let mut state = StrategyState::empty(dec!(1000));
        assert!(state.check_invariant_flat_consistency());

        state.current_level = 1;
        assert!(!state.check_invariant_flat_consistency());
        assert!(!state.check_invariant_level_matches_entries());

        state.entries.push(FilledEntry {
            level_index: 1,
            fill_price: dec!(100),
            base_qty: dec!(1),
            notional: dec!(100),
        });
        assert!(state.check_invariant_level_matches_entries());
        assert!(!state.check_invariant_level1_qty());

        state.level1_qty = dec!(1);
        assert!(state.check_invariant_level1_qty());
    }
}
