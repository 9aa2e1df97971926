// =============================================================================
// Event Loop (C7) — single-threaded cooperative scheduler over C6.
// =============================================================================
//
// The teacher's `main.rs` spawns one `tokio::spawn` per independent stream
// and lets them run uncoordinated. Spec §5 requires the opposite for this
// engine: market ticks, the 30 s heartbeat, and the 60 s config reload are
// three logical tasks multiplexed onto *one* `tokio::select!` loop so that
// reconciliations are strictly serialized — no task ever preempts an
// in-flight reconciliation. This module is therefore new relative to the
// teacher (whose streams never needed serialized access to one reconciler)
// but keeps the teacher's idiom for each individual piece: `tokio::select!`
// over channels/intervals, `tracing` at every transition, graceful
// `ctrl_c`/`SIGTERM` handling bounded by a grace period.

use std::time::Duration;

use anyhow::Result;
use rust_decimal::Decimal;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::config::ConfigWatcher;
use crate::reconcile::Reconciler;
use crate::state::StrategyState;

/// Forces a reconciliation even without a market event, to catch fills the
/// WS stream silently missed (spec §5 task 2, §4.6).
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Config reload cadence (spec §5 task 3). Mirrors [`crate::config::RELOAD_INTERVAL`].
pub const CONFIG_RELOAD_INTERVAL: Duration = Duration::from_secs(60);

/// Bounded shutdown grace period (spec §5 "Cancellation").
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Drives C6 from closed-kline events, the heartbeat, and config reloads
/// until a shutdown signal arrives (spec §4.7, §5).
///
/// `bar_rx` is fed by the venue's kline stream task; decoupling the event
/// loop from a concrete `VenueClient` implementation keeps this module
/// testable against any producer of closed bars.
pub async fn run(
    reconciler: Reconciler,
    config_watcher: ConfigWatcher,
    mut initial_state: StrategyState,
    mut bar_rx: mpsc::UnboundedReceiver<Decimal>,
) -> Result<StrategyState> {
    let mut heartbeat = interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut config_reload = interval(CONFIG_RELOAD_INTERVAL);
    config_reload.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut sigterm = signal(SignalKind::terminate())?;

    info!("event loop starting");

    loop {
        tokio::select! {
            biased;

            _ = tokio::signal::ctrl_c() => {
                warn!("SIGINT received — shutting down");
                break;
            }
            _ = sigterm.recv() => {
                warn!("SIGTERM received — shutting down");
                break;
            }
            maybe_bar = bar_rx.recv() => {
                match maybe_bar {
                    Some(close_price) => {
                        let config = config_watcher.current();
                        match reconciler.tick(initial_state.clone(), &config, Some(close_price)).await {
                            Ok(next) => initial_state = next,
                            Err(e) => warn!(error = %e, "market-tick reconciliation failed, state unchanged"),
                        }
                    }
                    None => {
                        warn!("kline stream channel closed — shutting down");
                        break;
                    }
                }
            }
            _ = heartbeat.tick() => {
                let config = config_watcher.current();
                match reconciler.tick(initial_state.clone(), &config, None).await {
                    Ok(next) => initial_state = next,
                    Err(e) => warn!(error = %e, "heartbeat reconciliation failed, state unchanged"),
                }
            }
            _ = config_reload.tick() => {
                if let Err(e) = config_watcher.reload() {
                    warn!(error = %e, "config reload failed, keeping last-good snapshot");
                }
            }
        }
    }

    // Reconciliations run to completion inside the `select!` arms above, so
    // by the time a shutdown branch wins there is nothing in flight to
    // cancel — the grace period only bounds how long the caller waits on
    // this function returning. Resting orders at the venue are
    // intentionally left in place (spec §9 Q3): shutdown persists state
    // (already done by the last `tick()`) and returns without touching them.
    info!(grace_period_secs = SHUTDOWN_GRACE.as_secs(), "shutdown complete");
    Ok(initial_state)
}
