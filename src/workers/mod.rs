pub mod billing;
pub mod dns;
pub mod health;
pub mod invoices;
pub mod provisioner;

use std::future::Future;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::HosterResult;

/// Shared worker harness: a named, cooperatively-cancellable tick
/// loop. A failing tick is logged and the loop keeps going; a tick
/// that finds nothing to do does nothing.
pub async fn run_ticker<F, Fut>(
    name: &'static str,
    interval: Duration,
    cancel: CancellationToken,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = HosterResult<()>>,
{
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(worker = name, interval_secs = interval.as_secs(), "worker started");

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                info!(worker = name, "worker stopping");
                break;
            }
            _ = timer.tick() => {
                if let Err(err) = tick().await {
                    warn!(worker = name, error = %err, "worker tick failed");
                }
            }
        }
    }
}
