use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::{ConfigError, PublisherConfig};
use crate::messaging::amqp::AmqpTransport;
use crate::messaging::connection::{
    AssertError, ConnectionError, ConnectionManager, ConnectionState, QueueAssertState,
};
use crate::messaging::queue::QueueAssertionCache;
use crate::messaging::transport::Transport;
use crate::reporter::{ErrorReporter, ThrottledReporter, TracingReporter};

const TIMESTAMP_FIELD: &str = "@timestamp";
const REPORT_WINDOW: Duration = Duration::from_secs(1);

/// Fire-and-forget publisher for structured log events.
///
/// Connects lazily on the first `push`, caches the queue declaration for the
/// lifetime of the link, and disconnects automatically after the configured
/// idle window. Pipeline failures never reach the caller; they are routed to
/// the error reporter, throttled to one report per second.
pub struct LogPublisher {
    manager: Arc<ConnectionManager>,
    queue_cache: Arc<QueueAssertionCache>,
    reporter: Arc<ThrottledReporter>,
    queue: String,
    base_payload: Map<String, Value>,
}

impl LogPublisher {
    pub fn new(config: PublisherConfig) -> Result<Self, ConfigError> {
        Self::with_transport(config, Arc::new(AmqpTransport))
    }

    /// Builds a publisher on a custom broker transport. Performs no I/O;
    /// the connection is established by the first `push`.
    pub fn with_transport(
        config: PublisherConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let manager = ConnectionManager::new(
            config.server.clone(),
            config.evict_timeout(),
            transport,
        );
        let queue_cache = Arc::new(QueueAssertionCache::new(
            Arc::clone(&manager),
            config.queue.clone(),
        ));

        Ok(Self {
            manager,
            queue_cache,
            reporter: Arc::new(ThrottledReporter::new(
                Arc::new(TracingReporter),
                REPORT_WINDOW,
            )),
            queue: config.queue,
            base_payload: config.payload.unwrap_or_default(),
        })
    }

    /// Replaces the default tracing-based error reporter. Throttling still
    /// applies.
    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = Arc::new(ThrottledReporter::new(reporter, REPORT_WINDOW));
        self
    }

    /// Publishes one record to the configured queue, fire-and-forget.
    ///
    /// The outbound record merges the configured base payload, an injected
    /// `@timestamp` field, and the caller payload, with caller keys winning
    /// on collision. The caller never observes failure; sustained broker
    /// unavailability shows up only as throttled error reports.
    ///
    /// Must be called from within a tokio runtime.
    pub fn push(&self, payload: Map<String, Value>) {
        let record = self.compose(payload);
        let body = match serde_json::to_vec(&record) {
            Ok(body) => body,
            Err(e) => {
                self.reporter
                    .report(&format!("Failed to serialize payload: {e}"));
                return;
            }
        };

        self.manager.touch();

        let manager = Arc::clone(&self.manager);
        let queue_cache = Arc::clone(&self.queue_cache);
        let reporter = Arc::clone(&self.reporter);
        let queue = self.queue.clone();
        tokio::spawn(async move {
            let outcome: Result<(), PublishError> = async {
                manager.ensure_connected().await?;
                queue_cache.ensure_asserted().await?;
                send(&manager, &queue, &body).await?;
                Ok(())
            }
            .await;

            match outcome {
                Ok(()) => {
                    manager.touch();
                    debug!(queue = %queue, bytes = body.len(), "Payload enqueued");
                }
                Err(e) => {
                    reporter.report(&format!(
                        "Error sending payload to queue \"{queue}\": {e}"
                    ));
                }
            }
        });
    }

    fn compose(&self, payload: Map<String, Value>) -> Map<String, Value> {
        let mut record = self.base_payload.clone();
        record.insert(
            TIMESTAMP_FIELD.to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        for (key, value) in payload {
            record.insert(key, value);
        }
        record
    }
}

/// Sends one serialized record. Link state is re-read at the moment of call:
/// if an asynchronous error/close notification flipped it since the assert
/// step, this fails fast instead of touching a stale channel.
async fn send(manager: &ConnectionManager, queue: &str, body: &[u8]) -> Result<(), SendError> {
    let channel = {
        let inner = manager.lock_inner();
        if inner.state != ConnectionState::Connected {
            return Err(SendError::NotConnected);
        }
        if inner.assert_state != QueueAssertState::Asserted {
            return Err(SendError::NotAsserted);
        }
        match inner.channel.clone() {
            Some(channel) => channel,
            None => return Err(SendError::NotConnected),
        }
    };

    channel
        .publish(queue, body)
        .await
        .map_err(|e| SendError::PublishFailed(e.to_string()))
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SendError {
    #[error("Cannot send while not connected")]
    NotConnected,

    #[error("Queue is no longer asserted at send time")]
    NotAsserted,

    #[error("Failed to publish payload: {0}")]
    PublishFailed(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PublishError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Assert(#[from] AssertError),

    #[error(transparent)]
    Send(#[from] SendError),
}
