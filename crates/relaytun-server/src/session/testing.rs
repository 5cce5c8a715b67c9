//! Test double for [`TunnelHandler`].

use super::handler::TunnelHandler;
use super::registry::{SessionKey, SessionRegistry};
use relaytun_core::messages::{ActiveSession, CloudDescriptor, SystemDescriptor};
use relaytun_core::{BoxFuture, Role};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub struct MockHandler {
    queue_id: String,
    started: bool,
    last_interaction: Instant,
    interrupted: AtomicBool,
    closes: AtomicUsize,
}

impl MockHandler {
    pub fn with(queue_id: &str, started: bool, last_interaction: Instant) -> Arc<Self> {
        Arc::new(Self {
            queue_id: queue_id.to_string(),
            started,
            last_interaction,
            interrupted: AtomicBool::new(false),
            closes: AtomicUsize::new(0),
        })
    }

    pub fn idle(queue_id: &str) -> Arc<Self> {
        Self::with(queue_id, false, Instant::now())
    }

    pub fn started(queue_id: &str) -> Arc<Self> {
        Self::with(queue_id, true, Instant::now())
    }

    pub fn close_calls(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Register `handler` as a provider leg and return its key.
    pub async fn register(registry: &SessionRegistry, handler: &Arc<MockHandler>) -> SessionKey {
        let key = SessionKey::new(Role::Provider, handler.queue_id());
        registry
            .register(&key, Self::info(handler.queue_id()), handler.clone())
            .await
            .unwrap();
        key
    }

    pub fn info(queue_id: &str) -> ActiveSession {
        ActiveSession {
            queue_id: queue_id.to_string(),
            peer_name: "provider.gw".into(),
            role: Role::Provider,
            relay_address: "relay.example".into(),
            relay_port: 61616,
            relay_secure: false,
            consumer: SystemDescriptor::default(),
            provider: SystemDescriptor::default(),
            consumer_cloud: CloudDescriptor::default(),
            provider_cloud: CloudDescriptor::default(),
            service_definition: "temperature".into(),
            consumer_server_socket_port: None,
            started_at_unix: 0,
            communication_started: false,
        }
    }
}

impl TunnelHandler for MockHandler {
    fn queue_id(&self) -> &str {
        &self.queue_id
    }

    fn role(&self) -> Role {
        Role::Provider
    }

    fn is_communication_started(&self) -> bool {
        self.started
    }

    fn last_interaction_time(&self) -> Instant {
        self.last_interaction
    }

    fn set_interrupted(&self, interrupted: bool) {
        self.interrupted.store(interrupted, Ordering::SeqCst);
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.closes.fetch_add(1, Ordering::SeqCst);
        })
    }
}
