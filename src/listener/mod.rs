//! Long-poll wakeup around a [`Queue`].
//!
//! A consumer that finds the queue empty can leave a callback address. The
//! next successful put drains every registered address and pings each one so
//! the consumer knows to poll again.
//!
//! `poll`, `peek` and `put` hold one lock for their whole sequence. A message
//! put between a consumer's empty check and its registration would otherwise
//! never wake that consumer.

mod notifier;

pub use notifier::{TcpNotifier, WakeupNotifier};

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Mutex;

use crate::message::Message;
use crate::metrics::ListenerMetrics;
use crate::queue::{PeekedMessage, Queue, QueueError};
use crate::storage::MessageId;

/// Outcome of a read on a listening queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery<T> {
    /// A message was available
    Message(T),
    /// Queue empty and no callback address supplied
    Empty,
    /// Queue empty; the caller will be woken on the next put
    Pending,
}

impl<T> Delivery<T> {
    pub fn into_message(self) -> Option<T> {
        match self {
            Delivery::Message(m) => Some(m),
            Delivery::Empty | Delivery::Pending => None,
        }
    }
}

/// A queue that accepts listener registrations.
pub struct ListenerRegistry {
    queue: Queue,
    listeners: Mutex<HashSet<SocketAddr>>,
    notifier: Arc<dyn WakeupNotifier>,
}

impl ListenerRegistry {
    pub fn new(queue: Queue, notifier: Arc<dyn WakeupNotifier>) -> Self {
        Self {
            queue,
            listeners: Mutex::new(HashSet::new()),
            notifier,
        }
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Number of addresses waiting for a wakeup.
    pub async fn pending_listeners(&self) -> usize {
        self.listeners.lock().await.len()
    }

    pub async fn poll(&self, listener: Option<SocketAddr>) -> Result<Delivery<Message>, QueueError> {
        let mut listeners = self.listeners.lock().await;
        let found = self.queue.poll().await?;
        Ok(self.deliver_or_register(&mut listeners, found, listener))
    }

    pub async fn peek(
        &self,
        session_id: &str,
        listener: Option<SocketAddr>,
    ) -> Result<Delivery<PeekedMessage>, QueueError> {
        let mut listeners = self.listeners.lock().await;
        let found = self.queue.peek(session_id).await?;
        Ok(self.deliver_or_register(&mut listeners, found, listener))
    }

    fn deliver_or_register<T>(
        &self,
        listeners: &mut HashSet<SocketAddr>,
        found: Option<T>,
        listener: Option<SocketAddr>,
    ) -> Delivery<T> {
        match (found, listener) {
            (Some(message), _) => Delivery::Message(message),
            (None, None) => Delivery::Empty,
            (None, Some(addr)) => {
                if listeners.insert(addr) {
                    ListenerMetrics::record_registered();
                }
                tracing::debug!(
                    queue = %self.queue.name(),
                    listener = %addr,
                    listeners = listeners.len(),
                    "Listener registered"
                );
                Delivery::Pending
            }
        }
    }

    /// Store a message, then wake every registered listener.
    ///
    /// Listeners are only drained when the message was actually stored. Each
    /// drained address gets exactly one attempt whether or not it succeeds.
    pub async fn put(&self, message: Message) -> Result<MessageId, QueueError> {
        let mut listeners = self.listeners.lock().await;
        let id = self.queue.put(message).await?;

        if !listeners.is_empty() {
            let pending: Vec<SocketAddr> = listeners.drain().collect();
            tracing::debug!(
                queue = %self.queue.name(),
                listeners = pending.len(),
                "Waking listeners"
            );

            let results = join_all(pending.iter().map(|addr| self.notifier.notify(*addr))).await;
            for success in results {
                ListenerMetrics::record_wakeup(success);
            }
        }

        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueLimits;
    use crate::storage::MemoryBackend;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct RecordingNotifier {
        calls: std::sync::Mutex<Vec<SocketAddr>>,
        succeed: bool,
    }

    #[async_trait]
    impl WakeupNotifier for RecordingNotifier {
        async fn notify(&self, addr: SocketAddr) -> bool {
            self.calls.lock().unwrap().push(addr);
            self.succeed
        }
    }

    fn registry(notifier: Arc<dyn WakeupNotifier>, limits: QueueLimits) -> ListenerRegistry {
        let queue = Queue::new("/listen", limits, Arc::new(MemoryBackend::new()));
        ListenerRegistry::new(queue, notifier)
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_empty_poll_without_address_is_empty() {
        let reg = registry(Arc::new(RecordingNotifier::default()), QueueLimits::default());
        assert_eq!(reg.poll(None).await.unwrap(), Delivery::Empty);
        assert_eq!(reg.pending_listeners().await, 0);
    }

    #[tokio::test]
    async fn test_empty_poll_with_address_registers_once() {
        let reg = registry(Arc::new(RecordingNotifier::default()), QueueLimits::default());

        assert_eq!(reg.poll(Some(addr(9000))).await.unwrap(), Delivery::Pending);
        assert_eq!(reg.poll(Some(addr(9000))).await.unwrap(), Delivery::Pending);
        assert_eq!(reg.pending_listeners().await, 1);
    }

    #[tokio::test]
    async fn test_poll_with_message_does_not_register() {
        let reg = registry(Arc::new(RecordingNotifier::default()), QueueLimits::default());
        reg.put(Message::new("hi", "text/plain")).await.unwrap();

        let delivery = reg.poll(Some(addr(9001))).await.unwrap();
        assert_eq!(delivery.into_message().unwrap().payload, b"hi");
        assert_eq!(reg.pending_listeners().await, 0);
    }

    #[tokio::test]
    async fn test_put_wakes_each_listener_once_even_on_failure() {
        let notifier = Arc::new(RecordingNotifier::default());
        let reg = registry(notifier.clone(), QueueLimits::default());

        reg.poll(Some(addr(9002))).await.unwrap();
        reg.peek("s1", Some(addr(9003))).await.unwrap();
        assert_eq!(reg.pending_listeners().await, 2);

        reg.put(Message::new("wake", "text/plain")).await.unwrap();

        let mut calls = notifier.calls.lock().unwrap().clone();
        calls.sort();
        assert_eq!(calls, vec![addr(9002), addr(9003)]);
        assert_eq!(reg.pending_listeners().await, 0);

        // Drained listeners are not pinged again
        reg.put(Message::new("again", "text/plain")).await.unwrap();
        assert_eq!(notifier.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rejected_put_keeps_listeners() {
        let notifier = Arc::new(RecordingNotifier::default());
        let reg = registry(
            notifier.clone(),
            QueueLimits {
                max_messages: None,
                max_size: Some(2),
            },
        );

        reg.poll(Some(addr(9004))).await.unwrap();
        let err = reg.put(Message::new("too big", "x")).await.unwrap_err();
        assert!(matches!(err, QueueError::QueueFull { .. }));

        assert!(notifier.calls.lock().unwrap().is_empty());
        assert_eq!(reg.pending_listeners().await, 1);
    }

    #[tokio::test]
    async fn test_put_connects_to_real_listener() {
        let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = socket.local_addr().unwrap();

        let reg = registry(
            Arc::new(TcpNotifier::new(Duration::from_millis(500))),
            QueueLimits::default(),
        );
        assert_eq!(reg.poll(Some(listen_addr)).await.unwrap(), Delivery::Pending);

        let accept = tokio::spawn(async move { socket.accept().await.is_ok() });
        reg.put(Message::new("ping", "text/plain")).await.unwrap();

        assert!(tokio::time::timeout(Duration::from_secs(2), accept).await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_peek_delivers_message_on_listening_queue() {
        let reg = registry(Arc::new(RecordingNotifier::default()), QueueLimits::default());
        let id = reg.put(Message::new("peeked", "x")).await.unwrap();

        match reg.peek("s", Some(addr(9005))).await.unwrap() {
            Delivery::Message(peeked) => assert_eq!(peeked.id, id),
            other => panic!("expected message, got {:?}", other),
        }
        // Cursor moved past the only message
        assert_eq!(reg.peek("s", Some(addr(9005))).await.unwrap(), Delivery::Pending);
    }
}
