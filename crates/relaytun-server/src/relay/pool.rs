//! Shared relay connections.
//!
//! One [`RelayLink`] per relay `address:port:secure`, opened on first use
//! and shared by every session routed through that relay. The pool tracks
//! which sessions ride on which link so the liveness monitor can tear them
//! down when the link dies.

use crate::session::{SessionKey, SessionRegistry, TunnelHandler};
use relaytun_core::{GatewayResult, RelayConnector, RelayEndpoint, RelayLink};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

struct PooledLink {
    link: Arc<dyn RelayLink>,
    sessions: HashSet<SessionKey>,
    /// Had no members at the previous liveness pass.
    idle: bool,
}

impl PooledLink {
    fn new(link: Arc<dyn RelayLink>, sessions: HashSet<SessionKey>) -> Self {
        Self {
            link,
            sessions,
            idle: false,
        }
    }
}

pub struct RelayPool {
    connector: Arc<dyn RelayConnector>,
    links: Mutex<HashMap<RelayEndpoint, PooledLink>>,
}

/// Add `member` to the live link of `endpoint`, if there is one.
fn join(
    links: &mut HashMap<RelayEndpoint, PooledLink>,
    endpoint: &RelayEndpoint,
    member: &SessionKey,
) -> Option<Arc<dyn RelayLink>> {
    let pooled = links.get_mut(endpoint)?;
    if pooled.link.is_closed() {
        return None;
    }
    pooled.sessions.insert(member.clone());
    pooled.idle = false;
    Some(pooled.link.clone())
}

impl RelayPool {
    pub fn new(connector: Arc<dyn RelayConnector>) -> Self {
        Self {
            connector,
            links: Mutex::new(HashMap::new()),
        }
    }

    /// Get the link for `endpoint`, connecting if there is none or the
    /// cached one is closed, and record `member` as riding on it.
    ///
    /// The pool lock is not held while connecting or closing.
    pub async fn acquire(
        &self,
        endpoint: &RelayEndpoint,
        member: &SessionKey,
    ) -> GatewayResult<Arc<dyn RelayLink>> {
        let stale = {
            let mut links = self.links.lock().await;
            if let Some(link) = join(&mut links, endpoint, member) {
                return Ok(link);
            }
            links.remove(endpoint)
        };
        if let Some(stale) = stale {
            debug!(relay = %endpoint, "discarding closed relay link");
            stale.link.close().await;
        }

        let fresh = self.connector.connect(endpoint).await?;

        let mut links = self.links.lock().await;
        if let Some(link) = join(&mut links, endpoint, member) {
            drop(links);
            debug!(relay = %endpoint, "relay connected concurrently, sharing that link");
            fresh.close().await;
            return Ok(link);
        }
        links.insert(
            endpoint.clone(),
            PooledLink::new(fresh.clone(), HashSet::from([member.clone()])),
        );
        drop(links);
        info!(relay = %endpoint, secure = endpoint.secure, "relay connection opened");
        Ok(fresh)
    }

    /// Drop `member` from the link's members; the last member out closes it.
    pub async fn release(&self, endpoint: &RelayEndpoint, member: &SessionKey) {
        let emptied = {
            let mut links = self.links.lock().await;
            let Some(pooled) = links.get_mut(endpoint) else {
                return;
            };
            // Sessions of a link the monitor already replaced are not members
            // of the fresh one.
            if !(pooled.sessions.remove(member) && pooled.sessions.is_empty()) {
                return;
            }
            links.remove(endpoint)
        };
        if let Some(pooled) = emptied {
            pooled.link.close().await;
            debug!(relay = %endpoint, "relay connection closed, no sessions left");
        }
    }

    pub async fn link_count(&self) -> usize {
        self.links.lock().await.len()
    }

    /// One liveness pass.
    ///
    /// A link that had no members for a whole pass is closed. Every other
    /// link is pinged; a dead one has its sessions closed and is replaced by
    /// a fresh connection. Returns the endpoints found dead.
    pub async fn check(&self, registry: &SessionRegistry) -> Vec<RelayEndpoint> {
        let (unused, snapshot) = {
            let mut links = self.links.lock().await;
            let expired: Vec<RelayEndpoint> = links
                .iter()
                .filter(|(_, pooled)| pooled.idle && pooled.sessions.is_empty())
                .map(|(endpoint, _)| endpoint.clone())
                .collect();
            let unused: Vec<(RelayEndpoint, PooledLink)> = expired
                .into_iter()
                .filter_map(|endpoint| links.remove(&endpoint).map(|p| (endpoint, p)))
                .collect();
            for pooled in links.values_mut() {
                pooled.idle = pooled.sessions.is_empty();
            }
            let snapshot: Vec<(RelayEndpoint, Arc<dyn RelayLink>)> = links
                .iter()
                .map(|(endpoint, pooled)| (endpoint.clone(), pooled.link.clone()))
                .collect();
            (unused, snapshot)
        };

        for (endpoint, pooled) in unused {
            debug!(relay = %endpoint, "closing unused relay connection");
            pooled.link.close().await;
        }

        let mut dead = Vec::new();
        for (endpoint, link) in snapshot {
            let alive = !link.is_closed() && link.ping().await.is_ok();
            if !alive {
                dead.push((endpoint, link));
            }
        }

        for (endpoint, link) in &dead {
            let members = {
                let mut links = self.links.lock().await;
                // Replaced concurrently by acquire(); that link is fresh.
                let still_current = links
                    .get(endpoint)
                    .is_some_and(|pooled| Arc::ptr_eq(&pooled.link, link));
                if !still_current {
                    continue;
                }
                links
                    .remove(endpoint)
                    .map(|p| p.sessions)
                    .unwrap_or_default()
            };
            warn!(relay = %endpoint, sessions = members.len(), "relay connection lost");

            link.close().await;
            for key in &members {
                if let Some(handle) = registry.remove(key).await {
                    handle.set_interrupted(true);
                    handle.close().await;
                }
            }

            match self.connector.connect(endpoint).await {
                Ok(fresh) => {
                    let mut links = self.links.lock().await;
                    if links.contains_key(endpoint) {
                        drop(links);
                        fresh.close().await;
                    } else {
                        links.insert(endpoint.clone(), PooledLink::new(fresh, HashSet::new()));
                        info!(relay = %endpoint, "relay connection re-established");
                    }
                }
                Err(e) => {
                    warn!(relay = %endpoint, error = %e, "relay still unreachable, will reconnect on demand");
                }
            }
        }

        dead.into_iter().map(|(endpoint, _)| endpoint).collect()
    }

    /// Run [`check`](Self::check) every `interval` until the task is aborted.
    pub fn spawn_monitor(
        self: Arc<Self>,
        registry: Arc<SessionRegistry>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.check(&registry).await;
            }
        })
    }

    /// Close every link; used at shutdown.
    pub async fn close_all(&self) {
        let drained: Vec<PooledLink> = self.links.lock().await.drain().map(|(_, p)| p).collect();
        for pooled in drained {
            pooled.link.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::memory::{MemoryBroker, MemoryConnector};
    use crate::session::testing::MockHandler;
    use relaytun_core::{BoxFuture, GatewayError, Role};
    use tokio::sync::Semaphore;

    /// Holds connects to `slow.example` until a permit is added.
    struct GatedConnector {
        inner: MemoryConnector,
        gate: Arc<Semaphore>,
    }

    impl RelayConnector for GatedConnector {
        fn connect<'a>(
            &'a self,
            endpoint: &'a RelayEndpoint,
        ) -> BoxFuture<'a, GatewayResult<Arc<dyn RelayLink>>> {
            Box::pin(async move {
                if endpoint.address == "slow.example" {
                    let _permit = self
                        .gate
                        .acquire()
                        .await
                        .map_err(|e| GatewayError::Transport(e.to_string()))?;
                }
                self.inner.connect(endpoint).await
            })
        }
    }

    fn endpoint() -> RelayEndpoint {
        RelayEndpoint::new("relay.example", 61616, false)
    }

    fn key(queue_id: &str) -> SessionKey {
        SessionKey::new(Role::Provider, queue_id)
    }

    #[tokio::test]
    async fn sessions_share_one_link() {
        let broker = MemoryBroker::new();
        let pool = RelayPool::new(Arc::new(broker.connector()));
        let (a_key, b_key) = (key("a"), key("b"));

        let a = pool.acquire(&endpoint(), &a_key).await.unwrap();
        let b = pool.acquire(&endpoint(), &b_key).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.link_count().await, 1);

        pool.release(&endpoint(), &a_key).await;
        assert!(!a.is_closed());
        pool.release(&endpoint(), &b_key).await;
        assert!(a.is_closed());
        assert_eq!(pool.link_count().await, 0);
    }

    #[tokio::test]
    async fn both_legs_of_one_queue_are_separate_members() {
        let broker = MemoryBroker::new();
        let pool = RelayPool::new(Arc::new(broker.connector()));
        let provider = SessionKey::new(Role::Provider, "q");
        let consumer = SessionKey::new(Role::Consumer, "q");

        let link = pool.acquire(&endpoint(), &provider).await.unwrap();
        pool.acquire(&endpoint(), &consumer).await.unwrap();

        pool.release(&endpoint(), &provider).await;
        assert!(!link.is_closed());
        pool.release(&endpoint(), &consumer).await;
        assert!(link.is_closed());
    }

    #[tokio::test]
    async fn stale_member_release_keeps_reused_queue_id_attached() {
        let broker = MemoryBroker::new();
        let pool = RelayPool::new(Arc::new(broker.connector()));
        let old = SessionKey::new(Role::Consumer, "q");
        let new = SessionKey::new(Role::Consumer, "q");

        let link = pool.acquire(&endpoint(), &old).await.unwrap();
        pool.acquire(&endpoint(), &new).await.unwrap();
        pool.release(&endpoint(), &old).await;
        assert!(!link.is_closed());
        assert_eq!(pool.link_count().await, 1);
    }

    #[tokio::test]
    async fn closed_link_is_replaced_on_acquire() {
        let broker = MemoryBroker::new();
        let pool = RelayPool::new(Arc::new(broker.connector()));
        let first = pool.acquire(&endpoint(), &key("a")).await.unwrap();
        first.close().await;

        let second = pool.acquire(&endpoint(), &key("b")).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_closed());
    }

    #[tokio::test]
    async fn unreachable_relay_fails_acquire() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);
        let pool = RelayPool::new(Arc::new(broker.connector()));
        assert!(pool.acquire(&endpoint(), &key("a")).await.is_err());
        assert_eq!(pool.link_count().await, 0);
    }

    #[tokio::test]
    async fn monitor_closes_sessions_on_dead_link() {
        let broker = MemoryBroker::new();
        let pool = RelayPool::new(Arc::new(broker.connector()));
        let registry = SessionRegistry::new();

        let handler = MockHandler::started("a");
        let a_key = MockHandler::register(&registry, &handler).await;
        pool.acquire(&endpoint(), &a_key).await.unwrap();

        assert!(pool.check(&registry).await.is_empty());
        assert_eq!(handler.close_calls(), 0);

        broker.set_reachable(false);
        let dead = pool.check(&registry).await;
        assert_eq!(dead, vec![endpoint()]);
        assert!(handler.is_interrupted());
        assert_eq!(handler.close_calls(), 1);
        assert!(registry.get(Role::Provider, "a").await.is_none());
        // Reconnect failed while the broker is down.
        assert_eq!(pool.link_count().await, 0);
    }

    #[tokio::test]
    async fn replacement_link_without_members_is_closed_after_a_pass() {
        let broker = MemoryBroker::new();
        let pool = RelayPool::new(Arc::new(broker.connector()));
        let registry = SessionRegistry::new();

        let a_key = MockHandler::register(&registry, &MockHandler::started("a")).await;
        let first = pool.acquire(&endpoint(), &a_key).await.unwrap();
        first.close().await;

        assert_eq!(pool.check(&registry).await, vec![endpoint()]);
        assert_eq!(pool.link_count().await, 1);

        // The first pass only marks the replacement as unused.
        assert!(pool.check(&registry).await.is_empty());
        assert_eq!(pool.link_count().await, 1);
        assert!(pool.check(&registry).await.is_empty());
        assert_eq!(pool.link_count().await, 0);
    }

    #[tokio::test]
    async fn replacement_link_is_reused_by_the_next_session() {
        let broker = MemoryBroker::new();
        let pool = RelayPool::new(Arc::new(broker.connector()));
        let registry = SessionRegistry::new();

        let first = pool.acquire(&endpoint(), &key("a")).await.unwrap();
        first.close().await;
        pool.check(&registry).await;
        pool.check(&registry).await;

        let b_key = key("b");
        let warm = pool.acquire(&endpoint(), &b_key).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &warm));
        pool.check(&registry).await;
        pool.check(&registry).await;
        assert!(!warm.is_closed());
        assert_eq!(pool.link_count().await, 1);
    }

    #[tokio::test]
    async fn slow_connect_does_not_stall_other_relays() {
        let broker = MemoryBroker::new();
        let gate = Arc::new(Semaphore::new(0));
        let pool = Arc::new(RelayPool::new(Arc::new(GatedConnector {
            inner: broker.connector(),
            gate: gate.clone(),
        })));
        let fast_key = key("fast");
        let fast_link = pool.acquire(&endpoint(), &fast_key).await.unwrap();

        let slow = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let slow_relay = RelayEndpoint::new("slow.example", 61616, false);
                pool.acquire(&slow_relay, &key("slow")).await.map(|_| ())
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!slow.is_finished());

        tokio::time::timeout(Duration::from_secs(1), pool.release(&endpoint(), &fast_key))
            .await
            .expect("release waited on a connect to another relay");
        assert!(fast_link.is_closed());

        gate.add_permits(1);
        slow.await.unwrap().unwrap();
        assert_eq!(pool.link_count().await, 1);
    }
}
