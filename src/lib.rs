//! Publisher-side client for shipping structured log events to RabbitMQ.
//!
//! The publisher connects lazily on the first `push`, caches the queue
//! declaration for the lifetime of the link, and closes the connection
//! automatically after a configurable idle window. Callers never manage
//! connection state: `push` is fire-and-forget, and every pipeline failure
//! is routed to a throttled error reporter instead of the caller.

pub mod config;
pub mod messaging;
pub mod publisher;
pub mod reporter;

pub use config::{ConfigError, PublisherConfig};
pub use publisher::{LogPublisher, PublishError, SendError};
pub use reporter::{ErrorReporter, TracingReporter};
