// =============================================================================
// Trade Journal (C4) — append-only CSV record of realized fills.
// =============================================================================
//
// Grounded on `guribe94-bog`'s `execution/journal.rs` (`OpenOptions::new()
// .create(true).append(true)`, flush on every write) but CSV instead of
// JSON-lines per spec §4.4/§6, and synchronous rather than a background
// writer thread — the engine's single-threaded cooperative model (spec
// §5) means C6 already calls this from the one task that owns the tick,
// so there is nothing to decouple from.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rust_decimal::Decimal;

use crate::grid::{JournalEntry, JournalEventKind};

const HEADER: &str = "timestamp,symbol,event,price,qty,realized_pnl,running_capital,grid_center_at_event,start_grid_center";

fn event_label(kind: &JournalEventKind) -> String {
    match kind {
        JournalEventKind::EntryLevel(level) => format!("ENTRY_L{level}"),
        JournalEventKind::TakeProfit => "TP".to_string(),
        JournalEventKind::PartialBreakEven => "PARTIAL_BE".to_string(),
        JournalEventKind::PartialBreakEvenMismatch => "PARTIAL_BE_MISMATCH".to_string(),
        JournalEventKind::StopLoss => "SL".to_string(),
        JournalEventKind::CancelAll => "CANCEL_ALL".to_string(),
    }
}

fn fmt_optional(d: Option<Decimal>) -> String {
    d.map(|v| v.to_string()).unwrap_or_default()
}

/// Append-only CSV trade journal, one file per symbol (spec §4.4, §6).
pub struct TradeJournal {
    path: PathBuf,
    symbol: String,
}

impl TradeJournal {
    /// Open (creating with a header if necessary) the journal file for
    /// `symbol` at `path`.
    pub fn open(path: impl Into<PathBuf>, symbol: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let needs_header = !path.exists() || std::fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);

        if needs_header {
            let mut f = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("failed to create journal file {}", path.display()))?;
            writeln!(f, "{HEADER}").context("failed to write journal header")?;
            f.flush().context("failed to flush journal header")?;
        }

        Ok(Self { path, symbol: symbol.into() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line and flush immediately (spec §4.4: "flushed on every
    /// append; loss of the last line is acceptable only on power
    /// failure").
    pub fn append(&self, timestamp: chrono::DateTime<chrono::Utc>, entry: &JournalEntry) -> Result<()> {
        let mut f = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open journal file {}", self.path.display()))?;

        writeln!(
            f,
            "{},{},{},{},{},{},{},{},{}",
            timestamp.to_rfc3339(),
            self.symbol,
            event_label(&entry.event),
            entry.price,
            entry.qty,
            entry.realized_pnl,
            entry.running_capital,
            entry.grid_center_at_event,
            fmt_optional(entry.start_grid_center),
        )
        .context("failed to append journal line")?;
        f.flush().context("failed to flush journal append")?;
        Ok(())
    }

    pub fn append_all(&self, timestamp: chrono::DateTime<chrono::Utc>, entries: &[JournalEntry]) -> Result<()> {
        for entry in entries {
            self.append(timestamp, entry)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_entry() -> JournalEntry {
        JournalEntry {
            event: JournalEventKind::EntryLevel(1),
            price: dec!(99500),
            qty: dec!(0.00754),
            realized_pnl: Decimal::ZERO,
            running_capital: dec!(1000),
            grid_center_at_event: dec!(100000),
            start_grid_center: Some(dec!(100000)),
        }
    }

    #[test]
    fn open_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("BTCUSDT.csv");
        let journal = TradeJournal::open(&path, "BTCUSDT").unwrap();
        journal.append(chrono::Utc::now(), &sample_entry()).unwrap();
        drop(journal);

        // Reopening an existing non-empty file must not duplicate the header.
        let journal2 = TradeJournal::open(&path, "BTCUSDT").unwrap();
        journal2.append(chrono::Utc::now(), &sample_entry()).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let header_count = content.lines().filter(|l| l.starts_with("timestamp,")).count();
        assert_eq!(header_count, 1);
        assert_eq!(content.lines().count(), 3); // header + 2 entries
    }

    #[test]
    fn entry_label_matches_event_kind() {
        assert_eq!(event_label(&JournalEventKind::EntryLevel(4)), "ENTRY_L4");
        assert_eq!(event_label(&JournalEventKind::TakeProfit), "TP");
        assert_eq!(event_label(&JournalEventKind::PartialBreakEven), "PARTIAL_BE");
        assert_eq!(event_label(&JournalEventKind::StopLoss), "SL");
        assert_eq!(event_label(&JournalEventKind::CancelAll), "CANCEL_ALL");
    }

    #[test]
    fn appended_line_has_expected_column_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("BTCUSDT.csv");
        let journal = TradeJournal::open(&path, "BTCUSDT").unwrap();
        journal.append(chrono::Utc::now(), &sample_entry()).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let data_line = content.lines().nth(1).unwrap();
        assert_eq!(data_line.split(',').count(), 9);
    }
}
