//! Background TTL cleanup for the side channel and execution records.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::execution_log::ExecutionLog;
use super::side_channel::SideChannelStore;

/// Sweep both stores every `every` until `cancel` fires.
///
/// Side-channel entries and uncommitted execution records older than `ttl`
/// are removed. Committed records are kept.
pub fn spawn_sweeper(
    side_channel: SideChannelStore,
    executions: ExecutionLog,
    ttl: Duration,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let entries = side_channel.sweep(ttl);
                    let records = executions.sweep(ttl);
                    if entries + records > 0 {
                        debug!(entries, records, "Swept stale session data");
                    }
                }
            }
        }
    })
}
