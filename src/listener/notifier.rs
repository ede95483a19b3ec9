//! Best-effort wakeup of registered listeners.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Sends a wakeup to one listener address.
///
/// A wakeup carries no data and no delivery guarantee: the listener learns
/// only that it should poll again.
#[async_trait]
pub trait WakeupNotifier: Send + Sync {
    /// Returns whether the listener was reached. Failures are never escalated.
    async fn notify(&self, addr: SocketAddr) -> bool;
}

/// Opens a TCP connection to the listener and closes it immediately.
pub struct TcpNotifier {
    connect_timeout: Duration,
}

impl TcpNotifier {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl WakeupNotifier for TcpNotifier {
    async fn notify(&self, addr: SocketAddr) -> bool {
        match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                drop(stream);
                tracing::debug!(listener = %addr, "Listener woken up");
                true
            }
            Ok(Err(e)) => {
                tracing::warn!(listener = %addr, error = %e, "Listener wakeup failed");
                false
            }
            Err(_) => {
                tracing::warn!(
                    listener = %addr,
                    timeout_ms = self.connect_timeout.as_millis() as u64,
                    "Listener wakeup timed out"
                );
                false
            }
        }
    }
}
