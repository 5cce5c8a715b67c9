//! Abstract relay transport for relaytun.
//!
//! Broker bindings implement [`RelayConnector`] and [`RelayLink`]. Queues
//! are created implicitly by name: publishing to a queue or subscribing to it
//! is all the provisioning there is.
//!
//! Inbound delivery is push-based: the binding runs its own delivery task and
//! forwards every message on a subscribed queue to the [`MessageSink`] the
//! subscriber handed in. The sink is unbounded so that delivery never blocks
//! the broker side.

use crate::crypto::Cryptographer;
use crate::envelope::MessageType;
use crate::error::{GatewayError, GatewayResult};
use crate::keys::GatewayPublicKey;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Channel a binding pushes inbound messages onto.
pub type MessageSink = mpsc::UnboundedSender<Vec<u8>>;

/// Where a relay lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelayEndpoint {
    pub address: String,
    pub port: u16,
    /// TLS to the broker.
    pub secure: bool,
}

impl RelayEndpoint {
    pub fn new(address: impl Into<String>, port: u16, secure: bool) -> Self {
        Self {
            address: address.into(),
            port,
            secure,
        }
    }
}

impl std::fmt::Display for RelayEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// One logical connection to a relay broker.
pub trait RelayLink: Send + Sync {
    fn endpoint(&self) -> &RelayEndpoint;

    /// Whether the broker connection is known to be gone. Never fails.
    fn is_closed(&self) -> bool;

    /// Close the connection. Idempotent; errors during teardown are
    /// swallowed by the binding.
    fn close(&self) -> BoxFuture<'_, ()>;

    /// Round trip to the broker. A failure marks the link closed.
    fn ping(&self) -> BoxFuture<'_, GatewayResult<()>>;

    /// Append one message to `queue`.
    fn publish<'a>(&'a self, queue: &'a str, payload: Vec<u8>)
        -> BoxFuture<'a, GatewayResult<()>>;

    /// Start delivering messages of `queue` to `sink`. Delivery stops when
    /// the returned [`Subscription`] is dropped or the link closes; in both
    /// cases the binding drops its end of the sink.
    fn subscribe<'a>(
        &'a self,
        queue: &'a str,
        sink: MessageSink,
    ) -> BoxFuture<'a, GatewayResult<Subscription>>;
}

/// Opens [`RelayLink`]s. Fails with [`GatewayError::Transport`] when the
/// broker cannot be reached or the TLS handshake fails.
pub trait RelayConnector: Send + Sync {
    fn connect<'a>(
        &'a self,
        endpoint: &'a RelayEndpoint,
    ) -> BoxFuture<'a, GatewayResult<Arc<dyn RelayLink>>>;
}

/// Handle keeping a queue subscription alive.
pub struct Subscription {
    queue: String,
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(queue: impl Into<String>, cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            queue: queue.into(),
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("queue", &self.queue)
            .finish()
    }
}

/// Producer bound to a single queue of a link.
#[derive(Clone)]
pub struct QueueProducer {
    link: Arc<dyn RelayLink>,
    queue: String,
}

impl QueueProducer {
    pub fn new(link: Arc<dyn RelayLink>, queue: impl Into<String>) -> Self {
        Self {
            link,
            queue: queue.into(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Publish already-encoded bytes.
    pub async fn send_bytes(&self, payload: Vec<u8>) -> GatewayResult<()> {
        if self.link.is_closed() {
            return Err(GatewayError::Transport(format!(
                "relay connection to {} is closed",
                self.link.endpoint()
            )));
        }
        self.link.publish(&self.queue, payload).await
    }

    /// Seal `payload` for `recipient` and publish the envelope.
    pub async fn send(
        &self,
        crypto: &Cryptographer,
        message_type: MessageType,
        payload: &[u8],
        recipient: &GatewayPublicKey,
    ) -> GatewayResult<()> {
        let wire = crypto.seal(message_type, payload, recipient)?;
        self.send_bytes(wire).await
    }
}

impl std::fmt::Debug for QueueProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueProducer")
            .field("relay", self.link.endpoint())
            .field("queue", &self.queue)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn subscription_cancels_once_on_drop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let sub = Subscription::new("REQ-x-y", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(sub.queue(), "REQ-x-y");
        drop(sub);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn endpoint_display() {
        let endpoint = RelayEndpoint::new("relay.example", 6379, true);
        assert_eq!(endpoint.to_string(), "relay.example:6379");
    }
}
