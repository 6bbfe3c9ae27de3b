//! In-memory transport used by the lifecycle tests. Records every broker
//! call, injects failures on demand, and can fire the asynchronous
//! error/close notifications a real link would deliver.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::transport::{
    ErrorCallback, Transport, TransportChannel, TransportConnection, TransportError,
};

#[derive(Default)]
pub(crate) struct MockState {
    connect_attempts: AtomicUsize,
    assert_attempts: AtomicUsize,
    connection_closes: AtomicUsize,
    channel_closes: AtomicUsize,
    close_order: Mutex<Vec<&'static str>>,
    published: Mutex<Vec<(String, Vec<u8>)>>,

    fail_connect: AtomicBool,
    fail_channel: AtomicBool,
    fail_assert: AtomicBool,
    fail_publish: AtomicBool,
    fail_channel_close: AtomicBool,
    delay_ms: AtomicU64,

    /// Generation of the most recent link; error handlers remember the
    /// generation they were registered under.
    link_generation: AtomicUsize,
    connection_handlers: Mutex<Vec<(usize, ErrorCallback)>>,
    channel_handlers: Mutex<Vec<(usize, ErrorCallback)>>,
}

impl MockState {
    pub(crate) fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn assert_attempts(&self) -> usize {
        self.assert_attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn connection_closes(&self) -> usize {
        self.connection_closes.load(Ordering::SeqCst)
    }

    pub(crate) fn channel_closes(&self) -> usize {
        self.channel_closes.load(Ordering::SeqCst)
    }

    pub(crate) fn close_order(&self) -> Vec<&'static str> {
        self.close_order.lock().unwrap().clone()
    }

    pub(crate) fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().unwrap().clone()
    }

    pub(crate) fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_channel(&self, fail: bool) {
        self.fail_channel.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_assert(&self, fail: bool) {
        self.fail_assert.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_channel_close(&self, fail: bool) {
        self.fail_channel_close.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_delay_ms(&self, ms: u64) {
        self.delay_ms.store(ms, Ordering::SeqCst);
    }

    /// Fires error handlers registered by the current link's connection.
    pub(crate) fn fire_connection_error(&self, reason: &str) {
        let current = self.link_generation.load(Ordering::SeqCst);
        self.fire(&self.connection_handlers, reason, |generation| {
            generation == current
        });
    }

    /// Fires error handlers registered by the current link's channel.
    pub(crate) fn fire_channel_error(&self, reason: &str) {
        let current = self.link_generation.load(Ordering::SeqCst);
        self.fire(&self.channel_handlers, reason, |generation| {
            generation == current
        });
    }

    /// Fires only handlers belonging to superseded links.
    pub(crate) fn fire_stale_connection_error(&self, reason: &str) {
        let current = self.link_generation.load(Ordering::SeqCst);
        self.fire(&self.connection_handlers, reason, |generation| {
            generation < current
        });
    }

    fn fire(
        &self,
        handlers: &Mutex<Vec<(usize, ErrorCallback)>>,
        reason: &str,
        matches: impl Fn(usize) -> bool,
    ) {
        let mut handlers = handlers.lock().unwrap();
        for (generation, callback) in handlers.iter_mut() {
            if matches(*generation) {
                callback(reason.to_string());
            }
        }
    }

    async fn maybe_delay(&self) {
        let ms = self.delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

#[derive(Clone)]
pub(crate) struct MockTransport {
    pub(crate) state: Arc<MockState>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(MockState::default()),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        _uri: &str,
        _heartbeat: u16,
    ) -> Result<Arc<dyn TransportConnection>, TransportError> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);
        self.state.maybe_delay().await;
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError("connection refused".to_string()));
        }
        let generation = self.state.link_generation.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Arc::new(MockConnection {
            state: Arc::clone(&self.state),
            generation,
        }))
    }
}

struct MockConnection {
    state: Arc<MockState>,
    generation: usize,
}

#[async_trait]
impl TransportConnection for MockConnection {
    async fn create_channel(&self) -> Result<Arc<dyn TransportChannel>, TransportError> {
        if self.state.fail_channel.load(Ordering::SeqCst) {
            return Err(TransportError("channel allocation failed".to_string()));
        }
        Ok(Arc::new(MockChannel {
            state: Arc::clone(&self.state),
            generation: self.generation,
        }))
    }

    fn on_error(&self, callback: ErrorCallback) {
        self.state
            .connection_handlers
            .lock()
            .unwrap()
            .push((self.generation, callback));
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.state.connection_closes.fetch_add(1, Ordering::SeqCst);
        self.state.close_order.lock().unwrap().push("connection");
        Ok(())
    }
}

struct MockChannel {
    state: Arc<MockState>,
    generation: usize,
}

#[async_trait]
impl TransportChannel for MockChannel {
    async fn assert_queue(&self, _name: &str) -> Result<(), TransportError> {
        self.state.assert_attempts.fetch_add(1, Ordering::SeqCst);
        self.state.maybe_delay().await;
        if self.state.fail_assert.load(Ordering::SeqCst) {
            return Err(TransportError("queue declare refused".to_string()));
        }
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), TransportError> {
        if self.state.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError("publish failed".to_string()));
        }
        self.state
            .published
            .lock()
            .unwrap()
            .push((queue.to_string(), body.to_vec()));
        Ok(())
    }

    fn on_error(&self, callback: ErrorCallback) {
        self.state
            .channel_handlers
            .lock()
            .unwrap()
            .push((self.generation, callback));
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.state.fail_channel_close.load(Ordering::SeqCst) {
            return Err(TransportError("channel close refused".to_string()));
        }
        self.state.channel_closes.fetch_add(1, Ordering::SeqCst);
        self.state.close_order.lock().unwrap().push("channel");
        Ok(())
    }
}
