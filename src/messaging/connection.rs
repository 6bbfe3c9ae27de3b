use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::evictor;
use super::transport::{Transport, TransportChannel, TransportConnection};

const HEARTBEAT_SECS: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueAssertState {
    NotAsserted,
    Asserting,
    Asserted,
}

/// Shared handle to one in-flight connect or assert attempt. Concurrent
/// callers clone it and await the same outcome.
pub(crate) type PendingConnect = Shared<BoxFuture<'static, Result<(), ConnectionError>>>;
pub(crate) type PendingAssert = Shared<BoxFuture<'static, Result<(), AssertError>>>;

pub(crate) struct Inner {
    pub(crate) state: ConnectionState,
    pub(crate) assert_state: QueueAssertState,
    pub(crate) connection: Option<Arc<dyn TransportConnection>>,
    pub(crate) channel: Option<Arc<dyn TransportChannel>>,
    pub(crate) pending_connect: Option<PendingConnect>,
    pub(crate) pending_assert: Option<PendingAssert>,
    pub(crate) last_access: Instant,
    /// Generation counter for the broker link. Bumped on every transition
    /// into Connecting and on every exit from Connected, so notifications
    /// and in-flight attempts belonging to a superseded link can be told
    /// apart from current ones.
    pub(crate) epoch: u64,
    pub(crate) evictor: Option<JoinHandle<()>>,
}

/// Owns the broker connection and channel, single-flights connect attempts,
/// and keeps link state in sync with asynchronous broker notifications.
pub struct ConnectionManager {
    server: String,
    evict_timeout: Duration,
    transport: Arc<dyn Transport>,
    /// Self-reference handed to spawned attempts, the evictor, and broker
    /// observers so none of them keep the manager alive.
    weak: Weak<ConnectionManager>,
    inner: Mutex<Inner>,
}

impl ConnectionManager {
    pub fn new(
        server: String,
        evict_timeout: Duration,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            server,
            evict_timeout,
            transport,
            weak: weak.clone(),
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                assert_state: QueueAssertState::NotAsserted,
                connection: None,
                channel: None,
                pending_connect: None,
                pending_assert: None,
                last_access: Instant::now(),
                epoch: 0,
                evictor: None,
            }),
        })
    }

    /// The inner mutex is only ever held between suspension points, never
    /// across an await.
    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn strong(&self) -> Arc<Self> {
        // `&self` only exists while the Arc built in `new` is alive, so the
        // upgrade cannot fail.
        self.weak.upgrade().expect("manager arc is alive")
    }

    pub fn state(&self) -> ConnectionState {
        self.lock_inner().state
    }

    pub fn assert_state(&self) -> QueueAssertState {
        self.lock_inner().assert_state
    }

    /// Marks the link as recently used so the idle evictor leaves it alone.
    pub(crate) fn touch(&self) {
        self.lock_inner().last_access = Instant::now();
    }

    pub(crate) fn idle_expired(&self) -> bool {
        let inner = self.lock_inner();
        inner.state == ConnectionState::Connected
            && inner.last_access.elapsed() > self.evict_timeout
    }

    /// Returns once the broker link is up. If a connect attempt is already
    /// in flight, awaits that attempt instead of starting a second one.
    pub async fn ensure_connected(&self) -> Result<(), ConnectionError> {
        let pending = {
            let mut inner = self.lock_inner();
            if inner.state == ConnectionState::Connected {
                return Ok(());
            }
            if let Some(pending) = inner.pending_connect.clone() {
                pending
            } else {
                inner.state = ConnectionState::Connecting;
                inner.epoch += 1;
                let epoch = inner.epoch;
                let manager = self.strong();
                let pending = async move { manager.run_connect(epoch).await }
                    .boxed()
                    .shared();
                inner.pending_connect = Some(pending.clone());
                pending
            }
        };
        pending.await
    }

    /// Runs one connect attempt and finalizes the state machine. The pending
    /// slot is cleared here, before any waiter on the shared future resumes,
    /// whatever the outcome.
    async fn run_connect(self: Arc<Self>, epoch: u64) -> Result<(), ConnectionError> {
        let result = self.connect_once().await;

        let (connection, channel) = {
            let mut inner = self.lock_inner();
            inner.pending_connect = None;
            match result {
                Ok((connection, channel)) => {
                    if inner.epoch != epoch {
                        // The link was torn down while this attempt was in
                        // flight; the fresh handles are dropped rather than
                        // adopted.
                        return Err(ConnectionError::Superseded);
                    }
                    inner.state = ConnectionState::Connected;
                    inner.assert_state = QueueAssertState::NotAsserted;
                    inner.connection = Some(Arc::clone(&connection));
                    inner.channel = Some(Arc::clone(&channel));
                    inner.last_access = Instant::now();
                    inner.evictor = Some(evictor::spawn(&self));
                    (connection, channel)
                }
                Err(e) => {
                    inner.state = ConnectionState::Disconnected;
                    return Err(e);
                }
            }
        };

        // Registered outside the lock: a transport may invoke the callback
        // synchronously if the link already died.
        self.register_observers(&connection, &channel, epoch);

        info!(server = %self.server, "RabbitMQ link established");
        Ok(())
    }

    async fn connect_once(
        &self,
    ) -> Result<(Arc<dyn TransportConnection>, Arc<dyn TransportChannel>), ConnectionError> {
        info!(server = %self.server, "Connecting to RabbitMQ");

        let connection = self
            .transport
            .connect(&self.server, HEARTBEAT_SECS)
            .await
            .map_err(|e| {
                error!(error = %e, server = %self.server, "Failed to connect to RabbitMQ");
                ConnectionError::ConnectionFailed(e.to_string())
            })?;

        let channel = connection.create_channel().await.map_err(|e| {
            error!(error = %e, server = %self.server, "Failed to create RabbitMQ channel");
            ConnectionError::ChannelFailed(e.to_string())
        })?;

        Ok((connection, channel))
    }

    fn register_observers(
        &self,
        connection: &Arc<dyn TransportConnection>,
        channel: &Arc<dyn TransportChannel>,
        epoch: u64,
    ) {
        let weak = self.weak.clone();
        connection.on_error(Box::new(move |reason| {
            if let Some(manager) = weak.upgrade() {
                manager.on_link_failure(epoch, "connection", &reason);
            }
        }));

        let weak = self.weak.clone();
        channel.on_error(Box::new(move |reason| {
            if let Some(manager) = weak.upgrade() {
                manager.on_link_failure(epoch, "channel", &reason);
            }
        }));
    }

    /// Asynchronous error/close notification from the broker. Forces the
    /// state machine back to Disconnected immediately, independent of any
    /// operation currently in flight. Notifications from a superseded link
    /// are ignored.
    fn on_link_failure(&self, epoch: u64, source: &str, reason: &str) {
        let mut inner = self.lock_inner();
        if inner.epoch != epoch {
            return;
        }
        warn!(source, reason, server = %self.server, "RabbitMQ link failure, resetting state");
        inner.state = ConnectionState::Disconnected;
        inner.assert_state = QueueAssertState::NotAsserted;
        inner.connection = None;
        inner.channel = None;
        inner.pending_assert = None;
        inner.epoch += 1;
        if let Some(handle) = inner.evictor.take() {
            handle.abort();
        }
    }

    /// Tears the link down. State is Disconnected afterwards regardless of
    /// close failures; the channel is closed before the connection, and a
    /// channel-close failure does not skip the connection close.
    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        let (connection, channel) = {
            let mut inner = self.lock_inner();
            if inner.state == ConnectionState::Disconnected {
                return Ok(());
            }
            if let Some(handle) = inner.evictor.take() {
                handle.abort();
            }
            inner.state = ConnectionState::Disconnected;
            inner.assert_state = QueueAssertState::NotAsserted;
            inner.pending_assert = None;
            inner.epoch += 1;
            (inner.connection.take(), inner.channel.take())
        };

        info!(server = %self.server, "Closing RabbitMQ link");

        let mut result = Ok(());
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                error!(error = %e, "Failed to close channel gracefully");
                result = Err(ConnectionError::CloseFailed(e.to_string()));
            }
        }
        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                error!(error = %e, "Failed to close RabbitMQ connection gracefully");
                if result.is_ok() {
                    result = Err(ConnectionError::CloseFailed(e.to_string()));
                }
            }
        }
        result
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    #[error("Failed to connect to RabbitMQ: {0}")]
    ConnectionFailed(String),

    #[error("Failed to create channel: {0}")]
    ChannelFailed(String),

    #[error("Failed to close RabbitMQ link gracefully: {0}")]
    CloseFailed(String),

    #[error("Connection attempt superseded by a disconnect")]
    Superseded,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AssertError {
    #[error("Cannot assert queue while not connected")]
    NotConnected,

    #[error("Failed to assert queue: {0}")]
    DeclareFailed(String),

    #[error("RabbitMQ link reset while queue assert was in flight")]
    LinkReset,
}
