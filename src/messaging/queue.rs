use std::sync::Arc;

use futures::future::FutureExt;
use tracing::debug;

use super::connection::{
    AssertError, ConnectionManager, ConnectionState, QueueAssertState,
};
use super::transport::TransportChannel;

/// Tracks whether the target queue has been declared on the current channel
/// and single-flights the declare call. The cached state lives inside the
/// connection manager so it resets together with the link.
pub struct QueueAssertionCache {
    manager: Arc<ConnectionManager>,
    queue: String,
}

impl QueueAssertionCache {
    pub fn new(manager: Arc<ConnectionManager>, queue: String) -> Self {
        Self { manager, queue }
    }

    /// Returns once the queue is declared on the current link. Fails
    /// immediately when not connected; never issues a second declare while
    /// one is already in flight.
    pub async fn ensure_asserted(&self) -> Result<(), AssertError> {
        let pending = {
            let mut inner = self.manager.lock_inner();
            if inner.state != ConnectionState::Connected {
                return Err(AssertError::NotConnected);
            }
            if inner.assert_state == QueueAssertState::Asserted {
                return Ok(());
            }
            if let Some(pending) = inner.pending_assert.clone() {
                pending
            } else {
                let Some(channel) = inner.channel.clone() else {
                    return Err(AssertError::NotConnected);
                };
                inner.assert_state = QueueAssertState::Asserting;
                let epoch = inner.epoch;
                let manager = Arc::clone(&self.manager);
                let queue = self.queue.clone();
                let pending =
                    async move { run_assert(manager, channel, queue, epoch).await }
                        .boxed()
                        .shared();
                inner.pending_assert = Some(pending.clone());
                pending
            }
        };
        pending.await
    }
}

/// Runs one declare attempt and finalizes the cached state. The pending slot
/// is cleared before any waiter resumes; if the link was reset while the
/// declare was in flight, the outcome is discarded because the channel that
/// served it is stale.
async fn run_assert(
    manager: Arc<ConnectionManager>,
    channel: Arc<dyn TransportChannel>,
    queue: String,
    epoch: u64,
) -> Result<(), AssertError> {
    debug!(queue = %queue, "Asserting queue");
    let result = channel.assert_queue(&queue).await;

    let mut inner = manager.lock_inner();
    if inner.epoch != epoch {
        // The slot was already cleared when the link went down.
        return Err(AssertError::LinkReset);
    }
    inner.pending_assert = None;
    match result {
        Ok(()) => {
            inner.assert_state = QueueAssertState::Asserted;
            Ok(())
        }
        Err(e) => {
            inner.assert_state = QueueAssertState::NotAsserted;
            Err(AssertError::DeclareFailed(e.to_string()))
        }
    }
}
