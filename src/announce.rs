//! The periodic announce loop: one background task per network
//! instance, and the sole source of election liveness, transaction
//! eviction, and redelivery flushing. Masters (and idle nodes) wake on
//! a timer; clients are reactive and only wake when kicked.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::types::Role;
use crate::NetworkCore;

pub fn spawn_announce_loop(
    core: Arc<NetworkCore>,
    kick: Arc<Notify>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_millis(core.config().announce_period_ms);
        loop {
            let reactive = core.role() == Role::Client;
            if reactive {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = kick.notified() => {}
                }
            } else {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = kick.notified() => {}
                    _ = tokio::time::sleep(period) => {}
                }
            }

            core.transport().flush_redeliveries();
            core.transport().prune_expired();
            core.do_announce();
        }
        tracing::debug!("announce loop stopped");
    })
}
