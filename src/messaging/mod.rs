pub mod amqp;
pub mod connection;
pub(crate) mod evictor;
pub mod queue;
pub mod transport;

#[cfg(test)]
pub(crate) mod mock;

pub use connection::{
    AssertError, ConnectionError, ConnectionManager, ConnectionState, QueueAssertState,
};
pub use queue::QueueAssertionCache;
pub use transport::{Transport, TransportChannel, TransportConnection, TransportError};
