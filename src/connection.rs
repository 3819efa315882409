//! Broker connection state management.
//!
//! One outbound connection guarded by a single lock. Connect attempts
//! serialize through `ensure_connected`; a transport error during a
//! publish demotes the state and hands the broken connection to a
//! cleanup task over a channel, so closing it never blocks the caller
//! or runs under the state lock.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, warn};

use crate::config::Endpoint;
use crate::error::ConnectError;
use crate::transport::{Connection, Transport};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

struct Inner<C> {
    state: ConnectionState,
    conn: Option<C>,
}

/// Guards the single outbound broker connection.
pub struct ConnectionManager<T: Transport> {
    transport: T,
    endpoint: Endpoint,
    inner: Mutex<Inner<T::Conn>>,
    cleanup_tx: mpsc::UnboundedSender<T::Conn>,
}

impl<T: Transport> ConnectionManager<T> {
    /// Create the manager and spawn its cleanup task.
    pub fn new(transport: T, endpoint: Endpoint) -> Arc<Self> {
        let (cleanup_tx, mut cleanup_rx) = mpsc::unbounded_channel::<T::Conn>();

        tokio::spawn(async move {
            while let Some(conn) = cleanup_rx.recv().await {
                conn.close().await;
                debug!("closed broken connection");
            }
        });

        Arc::new(Self {
            transport,
            endpoint,
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                conn: None,
            }),
            cleanup_tx,
        })
    }

    /// Current state, for diagnostics.
    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    /// Connect unless already connected.
    ///
    /// When the state is `Connected` this returns `true` without an
    /// attempt; otherwise at most one attempt runs, serialized against
    /// every other caller by the state lock.
    pub async fn ensure_connected(&self) -> bool {
        let mut inner = self.inner.lock().await;

        if inner.state == ConnectionState::Connected {
            debug!("already connected");
            return true;
        }

        inner.state = ConnectionState::Connecting;
        debug!(endpoint = %self.endpoint, "connecting");

        match self.transport.connect(&self.endpoint).await {
            Ok(conn) => {
                inner.conn = Some(conn);
                inner.state = ConnectionState::Connected;
                true
            }
            Err(e) => {
                error!(error = %e, "failed to connect");
                inner.conn = None;
                inner.state = ConnectionState::Disconnected;
                false
            }
        }
    }

    /// Fire-and-forget publish over the live connection.
    ///
    /// A transport error demotes the state to `Disconnected` and queues
    /// the broken connection for asynchronous cleanup; the error is
    /// surfaced for logging and superseded by the next tick.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ConnectError> {
        let mut inner = self.inner.lock().await;

        let Some(conn) = inner.conn.as_ref() else {
            return Err(ConnectError::NotConnected);
        };

        match conn.publish(topic, payload).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, "publish failed, marking disconnected");
                inner.state = ConnectionState::Disconnected;
                if let Some(broken) = inner.conn.take() {
                    // Close outside the lock; the cleanup task owns it now.
                    let _ = self.cleanup_tx.send(broken);
                }
                Err(e)
            }
        }
    }

    /// Explicit shutdown. No-op when already disconnected.
    pub async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;

        if let Some(conn) = inner.conn.take() {
            inner.state = ConnectionState::Disconnected;
            conn.close().await;
            debug!("disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct MockTransport {
        attempts: Arc<AtomicUsize>,
        fail_attempts: usize,
        fail_publish: Arc<AtomicBool>,
        closed: Arc<AtomicUsize>,
    }

    impl MockTransport {
        fn new(fail_attempts: usize) -> Self {
            Self {
                attempts: Arc::new(AtomicUsize::new(0)),
                fail_attempts,
                fail_publish: Arc::new(AtomicBool::new(false)),
                closed: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    struct MockConn {
        fail_publish: Arc<AtomicBool>,
        closed: Arc<AtomicUsize>,
    }

    impl Transport for MockTransport {
        type Conn = MockConn;

        async fn connect(&self, endpoint: &Endpoint) -> Result<MockConn, ConnectError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_attempts {
                return Err(ConnectError::Connect {
                    endpoint: endpoint.to_string(),
                    message: "simulated refusal".to_string(),
                });
            }
            Ok(MockConn {
                fail_publish: self.fail_publish.clone(),
                closed: self.closed.clone(),
            })
        }
    }

    impl Connection for MockConn {
        async fn publish(&self, topic: &str, _payload: Vec<u8>) -> Result<(), ConnectError> {
            if self.fail_publish.load(Ordering::SeqCst) {
                return Err(ConnectError::Publish {
                    topic: topic.to_string(),
                    message: "simulated transport error".to_string(),
                });
            }
            Ok(())
        }

        async fn close(self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn endpoint() -> Endpoint {
        Endpoint::parse("tcp://localhost:7447").unwrap()
    }

    #[tokio::test]
    async fn test_connect_success() {
        let manager = ConnectionManager::new(MockTransport::new(0), endpoint());

        assert_eq!(manager.state().await, ConnectionState::Disconnected);
        assert!(manager.ensure_connected().await);
        assert_eq!(manager.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_connect_fails_then_succeeds() {
        let transport = MockTransport::new(1);
        let attempts = transport.attempts.clone();
        let manager = ConnectionManager::new(transport, endpoint());

        // First call attempts and fails, leaving Disconnected.
        assert!(!manager.ensure_connected().await);
        assert_eq!(manager.state().await, ConnectionState::Disconnected);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        // Second call issues exactly one more attempt and connects.
        assert!(manager.ensure_connected().await);
        assert_eq!(manager.state().await, ConnectionState::Connected);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_callers_when_connected_do_not_reconnect() {
        let transport = MockTransport::new(0);
        let attempts = transport.attempts.clone();
        let manager = ConnectionManager::new(transport, endpoint());

        assert!(manager.ensure_connected().await);

        let (a, b, c) = tokio::join!(
            manager.ensure_connected(),
            manager.ensure_connected(),
            manager.ensure_connected()
        );
        assert!(a && b && c);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_publish_error_demotes_and_cleans_up() {
        let transport = MockTransport::new(0);
        let fail_publish = transport.fail_publish.clone();
        let closed = transport.closed.clone();
        let manager = ConnectionManager::new(transport, endpoint());

        assert!(manager.ensure_connected().await);
        assert!(manager.publish("hoststats/host/stats", vec![1]).await.is_ok());

        fail_publish.store(true, Ordering::SeqCst);
        let err = manager.publish("hoststats/host/stats", vec![2]).await;
        assert!(matches!(err, Err(ConnectError::Publish { .. })));
        assert_eq!(manager.state().await, ConnectionState::Disconnected);

        // Cleanup runs on its own task.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_publish_when_disconnected() {
        let manager = ConnectionManager::new(MockTransport::new(0), endpoint());

        let err = manager.publish("hoststats/host/stats", vec![]).await;
        assert!(matches!(err, Err(ConnectError::NotConnected)));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let transport = MockTransport::new(0);
        let closed = transport.closed.clone();
        let manager = ConnectionManager::new(transport, endpoint());

        manager.disconnect().await;
        assert_eq!(closed.load(Ordering::SeqCst), 0);

        assert!(manager.ensure_connected().await);
        manager.disconnect().await;
        manager.disconnect().await;
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state().await, ConnectionState::Disconnected);
    }
}
