//! In-process relay broker.
//!
//! Gives two gateway services in the same process a shared rendezvous point
//! with the same queue semantics as the networked binding: messages sent to
//! a queue with no consumer are held until one attaches, each message is
//! delivered once, and order is preserved per queue.

use relaytun_core::{
    BoxFuture, GatewayError, GatewayResult, MessageSink, RelayConnector, RelayEndpoint, RelayLink,
    Subscription,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

#[derive(Default)]
struct MemoryQueue {
    backlog: VecDeque<Vec<u8>>,
    consumer: Option<(u64, MessageSink)>,
}

/// The shared broker state.
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, MemoryQueue>>,
    reachable: AtomicBool,
    next_consumer: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queues: Mutex::new(HashMap::new()),
            reachable: AtomicBool::new(true),
            next_consumer: AtomicU64::new(1),
        })
    }

    /// Simulate the broker going away (or coming back).
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    pub fn connector(self: &Arc<Self>) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
        }
    }

    /// Messages waiting on `queue` for a consumer.
    pub fn backlog_len(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue)
            .map(|q| q.backlog.len())
            .unwrap_or(0)
    }

    pub fn has_consumer(&self, queue: &str) -> bool {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue)
            .is_some_and(|q| q.consumer.is_some())
    }

    fn publish(&self, queue: &str, payload: Vec<u8>) {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = queues.entry(queue.to_string()).or_default();
        match entry.consumer.as_ref() {
            Some((_, sink)) => {
                if let Err(tokio::sync::mpsc::error::SendError(payload)) = sink.send(payload) {
                    entry.consumer = None;
                    entry.backlog.push_back(payload);
                }
            }
            None => entry.backlog.push_back(payload),
        }
    }

    fn attach(&self, queue: &str, sink: MessageSink) -> u64 {
        let id = self.next_consumer.fetch_add(1, Ordering::Relaxed);
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = queues.entry(queue.to_string()).or_default();
        while let Some(message) = entry.backlog.pop_front() {
            if let Err(tokio::sync::mpsc::error::SendError(message)) = sink.send(message) {
                entry.backlog.push_front(message);
                break;
            }
        }
        entry.consumer = Some((id, sink));
        id
    }

    fn detach(&self, queue: &str, consumer_id: u64) {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = queues.get_mut(queue) {
            if entry.consumer.as_ref().is_some_and(|(id, _)| *id == consumer_id) {
                entry.consumer = None;
            }
            if entry.consumer.is_none() && entry.backlog.is_empty() {
                queues.remove(queue);
            }
        }
    }
}

/// Opens [`MemoryLink`]s onto a shared [`MemoryBroker`].
#[derive(Clone)]
pub struct MemoryConnector {
    broker: Arc<MemoryBroker>,
}

impl RelayConnector for MemoryConnector {
    fn connect<'a>(
        &'a self,
        endpoint: &'a RelayEndpoint,
    ) -> BoxFuture<'a, GatewayResult<Arc<dyn RelayLink>>> {
        Box::pin(async move {
            if !self.broker.is_reachable() {
                return Err(GatewayError::Transport(format!(
                    "relay {endpoint} is unreachable"
                )));
            }
            let link: Arc<dyn RelayLink> = Arc::new(MemoryLink {
                broker: self.broker.clone(),
                endpoint: endpoint.clone(),
                closed: AtomicBool::new(false),
                consumers: Mutex::new(Vec::new()),
            });
            Ok(link)
        })
    }
}

pub struct MemoryLink {
    broker: Arc<MemoryBroker>,
    endpoint: RelayEndpoint,
    closed: AtomicBool,
    /// Consumers attached through this link, detached on close.
    consumers: Mutex<Vec<(String, u64)>>,
}

impl MemoryLink {
    fn ensure_usable(&self) -> GatewayResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport(format!(
                "relay connection to {} is closed",
                self.endpoint
            )));
        }
        if !self.broker.is_reachable() {
            self.closed.store(true, Ordering::SeqCst);
            return Err(GatewayError::Transport(format!(
                "relay {} went away",
                self.endpoint
            )));
        }
        Ok(())
    }
}

impl RelayLink for MemoryLink {
    fn endpoint(&self) -> &RelayEndpoint {
        &self.endpoint
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            let consumers =
                std::mem::take(&mut *self.consumers.lock().unwrap_or_else(PoisonError::into_inner));
            for (queue, id) in consumers {
                self.broker.detach(&queue, id);
            }
            debug!(relay = %self.endpoint, "memory relay link closed");
        })
    }

    fn ping(&self) -> BoxFuture<'_, GatewayResult<()>> {
        Box::pin(async move { self.ensure_usable() })
    }

    fn publish<'a>(
        &'a self,
        queue: &'a str,
        payload: Vec<u8>,
    ) -> BoxFuture<'a, GatewayResult<()>> {
        Box::pin(async move {
            self.ensure_usable()?;
            self.broker.publish(queue, payload);
            Ok(())
        })
    }

    fn subscribe<'a>(
        &'a self,
        queue: &'a str,
        sink: MessageSink,
    ) -> BoxFuture<'a, GatewayResult<Subscription>> {
        Box::pin(async move {
            self.ensure_usable()?;
            let id = self.broker.attach(queue, sink);
            self.consumers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((queue.to_string(), id));

            let broker = self.broker.clone();
            let queue_name = queue.to_string();
            Ok(Subscription::new(queue, move || {
                broker.detach(&queue_name, id);
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn endpoint() -> RelayEndpoint {
        RelayEndpoint::new("relay.local", 61616, false)
    }

    #[tokio::test]
    async fn buffers_until_consumer_attaches() {
        let broker = MemoryBroker::new();
        let link = broker.connector().connect(&endpoint()).await.unwrap();

        link.publish("REQ-a-b", b"one".to_vec()).await.unwrap();
        link.publish("REQ-a-b", b"two".to_vec()).await.unwrap();
        assert_eq!(broker.backlog_len("REQ-a-b"), 2);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = link.subscribe("REQ-a-b", tx).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), b"one");
        assert_eq!(rx.recv().await.unwrap(), b"two");

        link.publish("REQ-a-b", b"three".to_vec()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), b"three");
        assert_eq!(broker.backlog_len("REQ-a-b"), 0);
    }

    #[tokio::test]
    async fn dropping_subscription_detaches_consumer() {
        let broker = MemoryBroker::new();
        let link = broker.connector().connect(&endpoint()).await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let sub = link.subscribe("RESP-a-b", tx).await.unwrap();
        assert!(broker.has_consumer("RESP-a-b"));
        drop(sub);
        assert!(!broker.has_consumer("RESP-a-b"));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_ends_delivery() {
        let broker = MemoryBroker::new();
        let link = broker.connector().connect(&endpoint()).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = link.subscribe("RESP-a-b", tx).await.unwrap();

        link.close().await;
        link.close().await;
        assert!(link.is_closed());
        assert!(rx.recv().await.is_none());
        assert!(link.publish("RESP-a-b", vec![1]).await.is_err());
    }

    #[tokio::test]
    async fn unreachable_broker_refuses_connections() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);
        let err = broker.connector().connect(&endpoint()).await.err().unwrap();
        assert!(matches!(err, GatewayError::Transport(_)));
    }

    #[tokio::test]
    async fn ping_marks_link_closed_when_broker_vanishes() {
        let broker = MemoryBroker::new();
        let link = broker.connector().connect(&endpoint()).await.unwrap();
        assert!(link.ping().await.is_ok());
        broker.set_reachable(false);
        assert!(link.ping().await.is_err());
        assert!(link.is_closed());
    }
}
