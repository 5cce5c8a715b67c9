//! Session setup and administration.
//!
//! The provider gateway is asked first: it mints the queue id, attaches to
//! the session queues named after itself, dials the real provider and hands
//! back `(queue_id, peer_name, public key)`. The consumer gateway is then
//! asked with those values; it attaches to the same four queues from the
//! other side and opens a local port for the consumer to connect to.

use super::ports::{PortGuard, PortPool};
use super::tls::LocalTls;
use super::validation::{validate_consumer_request, validate_provider_request};
use crate::relay::{RelayChannel, RelayPool};
use crate::session::{
    ConsumerSetup, ConsumerSideSocketThread, ProviderSetup, ProviderSideSocketThreadHandler,
    SessionExit, SessionKey, SessionRegistry, TunnelHandler,
};
use relaytun_core::messages::{
    ActiveSession, ConsumerConnectionRequest, ProviderConnectionRequest, ProviderConnectionResponse,
};
use relaytun_core::{
    generate_queue_id, Cryptographer, GatewayError, GatewayResult, QueueNames, RelayConnector,
    RelayEndpoint, RelayLink, Role,
};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Knobs the service needs from the configuration.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// This gateway's name; provider-side sessions derive their queue names
    /// from it.
    pub common_name: String,
    /// Address consumer-side listeners bind to.
    pub local_bind: String,
    pub buffer_size: usize,
    /// How long a consumer-side session waits for its local client, and a
    /// provider-side session for its provider.
    pub accept_timeout: Duration,
}

pub struct GatewayService {
    settings: GatewaySettings,
    crypto: Arc<Cryptographer>,
    pool: Arc<RelayPool>,
    registry: Arc<SessionRegistry>,
    ports: PortPool,
    tls: LocalTls,
}

impl GatewayService {
    pub fn new(
        settings: GatewaySettings,
        crypto: Arc<Cryptographer>,
        connector: Arc<dyn RelayConnector>,
        ports: PortPool,
        tls: LocalTls,
    ) -> Self {
        Self {
            settings,
            crypto,
            pool: Arc::new(RelayPool::new(connector)),
            registry: Arc::new(SessionRegistry::new()),
            ports,
            tls,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<RelayPool> {
        &self.pool
    }

    pub fn common_name(&self) -> &str {
        &self.settings.common_name
    }

    /// This gateway's public key, base64.
    pub fn public_key(&self) -> String {
        self.crypto.public_key().to_base64()
    }

    /// Open the provider leg of a tunnel.
    pub async fn connect_provider(
        &self,
        request: &ProviderConnectionRequest,
    ) -> GatewayResult<ProviderConnectionResponse> {
        let plan = validate_provider_request(request)?;

        let mut queue_id = generate_queue_id();
        while self.registry.contains(&queue_id).await {
            queue_id = generate_queue_id();
        }
        let peer_name = self.settings.common_name.clone();
        let names = QueueNames::derive(&peer_name, &queue_id);
        let key = SessionKey::new(Role::Provider, &queue_id);

        let link = self.acquire_link(&plan.relay, &key).await?;
        let attached = RelayChannel::attach(
            link,
            self.crypto.clone(),
            plan.consumer_key,
            Role::Provider,
            &queue_id,
            &names,
        )
        .await;
        let (channel, inbound) = match attached {
            Ok(pair) => pair,
            Err(e) => {
                self.pool.release(&plan.relay, &key).await;
                return Err(relay_failure(&plan.relay, e));
            }
        };

        let (handler, cancel) = ProviderSideSocketThreadHandler::new(&queue_id);
        let info = ActiveSession {
            queue_id: queue_id.clone(),
            peer_name: peer_name.clone(),
            role: Role::Provider,
            relay_address: plan.relay.address.clone(),
            relay_port: plan.relay.port,
            relay_secure: plan.relay.secure,
            consumer: plan.consumer,
            provider: plan.provider,
            consumer_cloud: plan.consumer_cloud,
            provider_cloud: plan.provider_cloud,
            service_definition: plan.service_definition,
            consumer_server_socket_port: None,
            started_at_unix: unix_now(),
            communication_started: false,
        };
        if let Err(e) = self.registry.register(&key, info, handler.clone()).await {
            self.pool.release(&plan.relay, &key).await;
            return Err(e);
        }

        handler.start(
            cancel,
            ProviderSetup {
                address: plan.provider_address,
                port: plan.provider_port,
                tls: self.tls.connector(),
                channel,
                inbound,
                connect_timeout: self.settings.accept_timeout,
                buffer_size: self.settings.buffer_size,
                exit: self.session_exit(&plan.relay, key),
            },
        );

        info!(
            %queue_id,
            relay = %plan.relay,
            consumer = %plan.consumer_key.short_fingerprint(),
            "provider session opened"
        );
        Ok(ProviderConnectionResponse {
            queue_id,
            peer_name,
            provider_gateway_public_key: self.public_key(),
            queues: names,
        })
    }

    /// Open the consumer leg of a tunnel. Returns the local port the
    /// consumer should connect to.
    ///
    /// The provider leg of the same queue id may live in this gateway too
    /// (loopback through an in-process relay).
    pub async fn connect_consumer(&self, request: &ConsumerConnectionRequest) -> GatewayResult<u16> {
        let plan = validate_consumer_request(request)?;
        if self
            .registry
            .contains_leg(Role::Consumer, &plan.queue_id)
            .await
        {
            return Err(GatewayError::Operational(format!(
                "session {} already exists",
                plan.queue_id
            )));
        }
        let names = QueueNames::derive(&plan.peer_name, &plan.queue_id);
        let key = SessionKey::new(Role::Consumer, &plan.queue_id);

        let (listener, port_guard) = self.bind_consumer_port().await?;
        let server_port = port_guard.port();

        let link = self.acquire_link(&plan.relay, &key).await?;
        let attached = RelayChannel::attach(
            link,
            self.crypto.clone(),
            plan.provider_key,
            Role::Consumer,
            &plan.queue_id,
            &names,
        )
        .await;
        let (channel, inbound) = match attached {
            Ok(pair) => pair,
            Err(e) => {
                self.pool.release(&plan.relay, &key).await;
                return Err(relay_failure(&plan.relay, e));
            }
        };

        let (handler, cancel) = ConsumerSideSocketThread::new(&plan.queue_id, server_port);
        let info = ActiveSession {
            queue_id: plan.queue_id.clone(),
            peer_name: plan.peer_name.clone(),
            role: Role::Consumer,
            relay_address: plan.relay.address.clone(),
            relay_port: plan.relay.port,
            relay_secure: plan.relay.secure,
            consumer: plan.consumer,
            provider: plan.provider,
            consumer_cloud: plan.consumer_cloud,
            provider_cloud: plan.provider_cloud,
            service_definition: plan.service_definition,
            consumer_server_socket_port: Some(server_port),
            started_at_unix: unix_now(),
            communication_started: false,
        };
        if let Err(e) = self.registry.register(&key, info, handler.clone()).await {
            self.pool.release(&plan.relay, &key).await;
            return Err(e);
        }

        handler.start(
            cancel,
            ConsumerSetup {
                listener,
                port_guard,
                tls: self.tls.acceptor(),
                channel,
                inbound,
                accept_timeout: self.settings.accept_timeout,
                buffer_size: self.settings.buffer_size,
                exit: self.session_exit(&plan.relay, key),
            },
        );

        info!(
            queue_id = %plan.queue_id,
            relay = %plan.relay,
            port = server_port,
            provider = %plan.provider_key.short_fingerprint(),
            "consumer session opened"
        );
        Ok(server_port)
    }

    /// Tear a session down on request, both legs if this gateway holds
    /// both. The session tells its peer.
    pub async fn close_session(&self, queue_id: &str) -> GatewayResult<()> {
        let handles = self.registry.remove_queue(queue_id).await;
        if handles.is_empty() {
            return Err(GatewayError::SessionNotFound(queue_id.to_string()));
        }
        for handle in &handles {
            handle.set_interrupted(true);
            handle.close().await;
        }
        info!(%queue_id, legs = handles.len(), "session closed by request");
        Ok(())
    }

    pub async fn active_sessions(&self, page: usize, size: usize) -> (usize, Vec<ActiveSession>) {
        self.registry.list(page, size).await
    }

    /// Close every session and relay connection.
    pub async fn shutdown(&self) {
        for (_, handle) in self.registry.handles().await {
            handle.set_interrupted(true);
            handle.close().await;
        }
        // Give the session tasks a moment to say CLOSE before the links go.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while self.registry.count().await > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.pool.close_all().await;
    }

    async fn acquire_link(
        &self,
        relay: &RelayEndpoint,
        key: &SessionKey,
    ) -> GatewayResult<Arc<dyn RelayLink>> {
        self.pool
            .acquire(relay, key)
            .await
            .map_err(|e| relay_failure(relay, e))
    }

    fn session_exit(&self, relay: &RelayEndpoint, key: SessionKey) -> SessionExit {
        SessionExit::new(self.registry.clone(), self.pool.clone(), relay.clone(), key)
    }

    /// Reserve a pool port that can actually be bound; ports held by other
    /// processes are skipped.
    async fn bind_consumer_port(&self) -> GatewayResult<(TcpListener, PortGuard)> {
        let mut busy = Vec::new();
        for _ in 0..self.ports.capacity() {
            let guard = self.ports.reserve()?;
            let addr = (self.settings.local_bind.as_str(), guard.port());
            match TcpListener::bind(addr).await {
                Ok(listener) => return Ok((listener, guard)),
                Err(e) => {
                    debug!(port = guard.port(), error = %e, "consumer port unavailable");
                    busy.push(guard);
                }
            }
        }
        warn!(busy = busy.len(), "every consumer port is unavailable");
        Err(GatewayError::Operational(
            "no consumer port could be bound".into(),
        ))
    }
}

/// Anything that goes wrong reaching the relay surfaces to the caller as an
/// operational failure.
fn relay_failure(relay: &RelayEndpoint, err: GatewayError) -> GatewayError {
    match err {
        GatewayError::Transport(msg) => {
            GatewayError::Operational(format!("relay {relay} cannot be reached: {msg}"))
        }
        other => other,
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
