use std::sync::Arc;

use async_trait::async_trait;

/// Callback invoked when the broker reports an asynchronous error or close
/// on a connection or channel.
pub type ErrorCallback = Box<dyn FnMut(String) + Send>;

#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Broker client seam. The production implementation wraps lapin; tests
/// substitute a mock to drive the lifecycle state machine deterministically.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        uri: &str,
        heartbeat: u16,
    ) -> Result<Arc<dyn TransportConnection>, TransportError>;
}

#[async_trait]
pub trait TransportConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn TransportChannel>, TransportError>;

    /// Registers a callback for asynchronous error/close notifications.
    fn on_error(&self, callback: ErrorCallback);

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait TransportChannel: Send + Sync {
    async fn assert_queue(&self, name: &str) -> Result<(), TransportError>;

    /// Best-effort publish to the default exchange with the queue name as
    /// routing key. Publisher confirms are not awaited.
    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), TransportError>;

    /// Registers a callback for asynchronous error/close notifications.
    fn on_error(&self, callback: ErrorCallback);

    async fn close(&self) -> Result<(), TransportError>;
}
