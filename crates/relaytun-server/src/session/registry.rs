//! Registry of live tunnel sessions.
//!
//! Entries are keyed by `(role, queue id)`: in loopback mode both legs of a
//! tunnel live in one gateway under the same queue id.

use super::handler::TunnelHandler;
use relaytun_core::messages::ActiveSession;
use relaytun_core::{GatewayError, GatewayResult, Role};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// One registration of a session leg.
///
/// A consumer-side queue id is chosen by the caller and may come back after
/// its session is gone; the serial tells the two registrations apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    role: Role,
    queue_id: String,
    serial: u64,
}

impl SessionKey {
    pub fn new(role: Role, queue_id: impl Into<String>) -> Self {
        Self {
            role,
            queue_id: queue_id.into(),
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn queue_id(&self) -> &str {
        &self.queue_id
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.queue_id, self.role)
    }
}

struct SessionEntry {
    key: SessionKey,
    info: ActiveSession,
    handle: Arc<dyn TunnelHandler>,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<(Role, String), SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session leg. A second leg with the same role and queue id is
    /// refused rather than replacing the live one.
    pub async fn register(
        &self,
        key: &SessionKey,
        info: ActiveSession,
        handle: Arc<dyn TunnelHandler>,
    ) -> GatewayResult<()> {
        let mut sessions = self.sessions.write().await;
        let slot = (key.role, key.queue_id.clone());
        if sessions.contains_key(&slot) {
            return Err(GatewayError::Operational(format!(
                "session {} already registered as {}",
                key.queue_id, key.role
            )));
        }
        info!(
            queue_id = %info.queue_id,
            role = %info.role,
            service = %info.service_definition,
            "session registered"
        );
        sessions.insert(
            slot,
            SessionEntry {
                key: key.clone(),
                info,
                handle,
            },
        );
        Ok(())
    }

    /// Remove the entry registered under `key`. A later registration that
    /// reused the queue id is left alone.
    pub async fn remove(&self, key: &SessionKey) -> Option<Arc<dyn TunnelHandler>> {
        let mut sessions = self.sessions.write().await;
        let slot = (key.role, key.queue_id.clone());
        if sessions.get(&slot).map(|entry| entry.key.serial) != Some(key.serial) {
            return None;
        }
        let removed = sessions.remove(&slot)?;
        debug!(session = %key, "session unregistered");
        Some(removed.handle)
    }

    /// Remove every leg registered under `queue_id`.
    pub async fn remove_queue(&self, queue_id: &str) -> Vec<Arc<dyn TunnelHandler>> {
        let mut sessions = self.sessions.write().await;
        let removed: Vec<_> = [Role::Consumer, Role::Provider]
            .into_iter()
            .filter_map(|role| sessions.remove(&(role, queue_id.to_string())))
            .map(|entry| entry.handle)
            .collect();
        if !removed.is_empty() {
            debug!(%queue_id, legs = removed.len(), "session unregistered");
        }
        removed
    }

    pub async fn get(&self, role: Role, queue_id: &str) -> Option<Arc<dyn TunnelHandler>> {
        self.sessions
            .read()
            .await
            .get(&(role, queue_id.to_string()))
            .map(|entry| entry.handle.clone())
    }

    /// Whether either leg of `queue_id` is registered.
    pub async fn contains(&self, queue_id: &str) -> bool {
        let sessions = self.sessions.read().await;
        [Role::Consumer, Role::Provider]
            .into_iter()
            .any(|role| sessions.contains_key(&(role, queue_id.to_string())))
    }

    pub async fn contains_leg(&self, role: Role, queue_id: &str) -> bool {
        self.sessions
            .read()
            .await
            .contains_key(&(role, queue_id.to_string()))
    }

    /// Every live handle with its key, for the removal task.
    pub async fn handles(&self) -> Vec<(SessionKey, Arc<dyn TunnelHandler>)> {
        self.sessions
            .read()
            .await
            .values()
            .map(|entry| (entry.key.clone(), entry.handle.clone()))
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// One page of sessions, oldest first, plus the total count. Pages are
    /// zero-based; a page past the end is empty.
    pub async fn list(&self, page: usize, size: usize) -> (usize, Vec<ActiveSession>) {
        let sessions = self.sessions.read().await;
        let mut all: Vec<ActiveSession> = sessions
            .values()
            .map(|entry| {
                let mut info = entry.info.clone();
                info.communication_started = entry.handle.is_communication_started();
                info
            })
            .collect();
        drop(sessions);

        all.sort_by(|a, b| {
            a.started_at_unix
                .cmp(&b.started_at_unix)
                .then_with(|| a.queue_id.cmp(&b.queue_id))
                .then_with(|| a.role.cmp(&b.role))
        });
        let total = all.len();
        let page_items = all
            .into_iter()
            .skip(page.saturating_mul(size))
            .take(size)
            .collect();
        (total, page_items)
    }
}
