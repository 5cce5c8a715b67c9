//! Redis relay binding.
//!
//! Each session queue is a Redis list. Producers `RPUSH` and refresh the
//! key's TTL so abandoned queues age out; consumers run a `BLPOP` loop on a
//! dedicated connection, since a blocking pop would stall every other
//! command multiplexed onto the shared one.

use redis::aio::{ConnectionManager, ConnectionManagerConfig, MultiplexedConnection};
use redis::{Client, RedisError};
use relaytun_core::{
    BoxFuture, GatewayError, GatewayResult, MessageSink, RelayConnector, RelayEndpoint, RelayLink,
    Subscription,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Seconds a `BLPOP` waits before the loop rechecks for cancellation.
const BLPOP_TIMEOUT_SECS: u64 = 1;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct RedisConnector {
    queue_ttl: Duration,
    /// PEM root certificate trusted for `rediss://` relays, in addition to
    /// the webpki roots.
    ca_cert: Option<Vec<u8>>,
}

impl RedisConnector {
    pub fn new(queue_ttl: Duration) -> Self {
        Self {
            queue_ttl,
            ca_cert: None,
        }
    }

    pub fn with_ca_cert(mut self, pem: Vec<u8>) -> Self {
        self.ca_cert = Some(pem);
        self
    }

    fn client(&self, endpoint: &RelayEndpoint) -> GatewayResult<Client> {
        let url = connection_url(endpoint);
        let client = match (&self.ca_cert, endpoint.secure) {
            (Some(ca), true) => Client::build_with_tls(
                url,
                redis::TlsCertificates {
                    client_tls: None,
                    root_cert: Some(ca.clone()),
                },
            ),
            _ => Client::open(url),
        };
        client.map_err(|e| transport_error(endpoint, e))
    }
}

fn connection_url(endpoint: &RelayEndpoint) -> String {
    let scheme = if endpoint.secure { "rediss" } else { "redis" };
    format!("{scheme}://{}:{}/", endpoint.address, endpoint.port)
}

fn transport_error(endpoint: &RelayEndpoint, err: RedisError) -> GatewayError {
    GatewayError::Transport(format!("relay {endpoint}: {err}"))
}

impl RelayConnector for RedisConnector {
    fn connect<'a>(
        &'a self,
        endpoint: &'a RelayEndpoint,
    ) -> BoxFuture<'a, GatewayResult<Arc<dyn RelayLink>>> {
        Box::pin(async move {
            let client = self.client(endpoint)?;
            // Fail fast on the first connect; the pool monitor owns reconnects.
            let config = ConnectionManagerConfig::new()
                .set_number_of_retries(1)
                .set_connection_timeout(CONNECT_TIMEOUT);
            let mut manager = ConnectionManager::new_with_config(client.clone(), config)
                .await
                .map_err(|e| transport_error(endpoint, e))?;
            let _: () = redis::cmd("PING")
                .query_async(&mut manager)
                .await
                .map_err(|e| transport_error(endpoint, e))?;

            debug!(relay = %endpoint, secure = endpoint.secure, "connected to redis relay");
            let link: Arc<dyn RelayLink> = Arc::new(RedisLink {
                endpoint: endpoint.clone(),
                client,
                manager,
                queue_ttl: self.queue_ttl,
                closed: Arc::new(AtomicBool::new(false)),
            });
            Ok(link)
        })
    }
}

pub struct RedisLink {
    endpoint: RelayEndpoint,
    client: Client,
    manager: ConnectionManager,
    queue_ttl: Duration,
    closed: Arc<AtomicBool>,
}

impl RedisLink {
    fn ensure_open(&self) -> GatewayResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport(format!(
                "relay connection to {} is closed",
                self.endpoint
            )));
        }
        Ok(())
    }
}

impl RelayLink for RedisLink {
    fn endpoint(&self) -> &RelayEndpoint {
        &self.endpoint
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            // Consumer loops observe the flag within one BLPOP timeout and
            // drop their sinks on the way out.
            if !self.closed.swap(true, Ordering::SeqCst) {
                debug!(relay = %self.endpoint, "redis relay link closed");
            }
        })
    }

    fn ping(&self) -> BoxFuture<'_, GatewayResult<()>> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut conn = self.manager.clone();
            let result: Result<(), RedisError> = redis::cmd("PING").query_async(&mut conn).await;
            result.map_err(|e| {
                self.closed.store(true, Ordering::SeqCst);
                transport_error(&self.endpoint, e)
            })
        })
    }

    fn publish<'a>(
        &'a self,
        queue: &'a str,
        payload: Vec<u8>,
    ) -> BoxFuture<'a, GatewayResult<()>> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut conn = self.manager.clone();
            let _: () = redis::pipe()
                .atomic()
                .cmd("RPUSH")
                .arg(queue)
                .arg(payload)
                .ignore()
                .cmd("EXPIRE")
                .arg(queue)
                .arg(self.queue_ttl.as_secs().max(1))
                .ignore()
                .query_async(&mut conn)
                .await
                .map_err(|e| transport_error(&self.endpoint, e))?;
            Ok(())
        })
    }

    fn subscribe<'a>(
        &'a self,
        queue: &'a str,
        sink: MessageSink,
    ) -> BoxFuture<'a, GatewayResult<Subscription>> {
        Box::pin(async move {
            self.ensure_open()?;
            let conn = self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| transport_error(&self.endpoint, e))?;

            let cancelled = Arc::new(AtomicBool::new(false));
            tokio::spawn(consume_loop(
                conn,
                queue.to_string(),
                sink,
                self.closed.clone(),
                cancelled.clone(),
                self.endpoint.clone(),
            ));

            Ok(Subscription::new(queue, move || {
                cancelled.store(true, Ordering::SeqCst);
            }))
        })
    }
}

async fn consume_loop(
    mut conn: MultiplexedConnection,
    queue: String,
    sink: MessageSink,
    closed: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    endpoint: RelayEndpoint,
) {
    loop {
        if closed.load(Ordering::SeqCst) || cancelled.load(Ordering::SeqCst) || sink.is_closed() {
            break;
        }

        let popped: Result<Option<(String, Vec<u8>)>, RedisError> = redis::cmd("BLPOP")
            .arg(&queue)
            .arg(BLPOP_TIMEOUT_SECS)
            .query_async(&mut conn)
            .await;

        match popped {
            Ok(Some((_, payload))) => {
                if let Err(tokio::sync::mpsc::error::SendError(payload)) = sink.send(payload) {
                    // Subscriber went away between the pop and the hand-off.
                    let requeued: Result<(), RedisError> = redis::cmd("LPUSH")
                        .arg(&queue)
                        .arg(payload)
                        .query_async(&mut conn)
                        .await;
                    if let Err(e) = requeued {
                        warn!(relay = %endpoint, %queue, error = %e, "failed to requeue message");
                    }
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(relay = %endpoint, %queue, error = %e, "relay consumer failed");
                closed.store(true, Ordering::SeqCst);
                break;
            }
        }
    }
    debug!(relay = %endpoint, %queue, "relay consumer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_scheme_follows_secure_flag() {
        let plain = RelayEndpoint::new("relay.cloud", 6379, false);
        let secure = RelayEndpoint::new("relay.cloud", 6380, true);
        assert_eq!(connection_url(&plain), "redis://relay.cloud:6379/");
        assert_eq!(connection_url(&secure), "rediss://relay.cloud:6380/");
    }

    #[test]
    fn client_rejects_unparseable_address() {
        let connector = RedisConnector::new(Duration::from_secs(60));
        let endpoint = RelayEndpoint::new("bad host/name", 6379, false);
        let err = connector.client(&endpoint).err();
        assert!(matches!(err, Some(GatewayError::Transport(_))));
    }

    #[tokio::test]
    async fn unreachable_relay_is_a_transport_error() {
        let connector = RedisConnector::new(Duration::from_secs(60));
        // Port 1 on loopback refuses connections.
        let endpoint = RelayEndpoint::new("127.0.0.1", 1, false);
        let err = connector.connect(&endpoint).await.err();
        assert!(matches!(err, Some(GatewayError::Transport(_))));
    }
}
