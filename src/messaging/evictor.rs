use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use super::connection::ConnectionManager;

const CHECK_PERIOD: Duration = Duration::from_millis(500);

/// Spawns the idle-eviction loop for a freshly connected link. The task
/// holds only a weak reference to the manager and is aborted on disconnect,
/// so it never outlives the link it watches.
pub(crate) fn spawn(manager: &Arc<ConnectionManager>) -> JoinHandle<()> {
    let weak: Weak<ConnectionManager> = Arc::downgrade(manager);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CHECK_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(manager) = weak.upgrade() else {
                break;
            };
            if manager.idle_expired() {
                info!("Idle timeout exceeded, evicting RabbitMQ connection");
                // Disconnect runs on its own task: it aborts this loop's
                // handle, and aborting the task it runs on would cut the
                // close calls short.
                tokio::spawn(async move {
                    if let Err(e) = manager.disconnect().await {
                        warn!(error = %e, "Idle eviction disconnect failed");
                    }
                });
                break;
            }
        }
    })
}
