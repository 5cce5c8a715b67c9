//! Periodic reclamation of idle tunnels.
//!
//! A session that has exchanged data is closed once it has been idle for
//! longer than the threshold. A session that never carried data gets one
//! extra sweep period of grace, since the far side may still be attaching.

use super::handler::TunnelHandler;
use super::registry::SessionRegistry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub struct ConnectionRemovalTask {
    registry: Arc<SessionRegistry>,
    threshold: Duration,
    period: Duration,
}

impl ConnectionRemovalTask {
    pub fn new(registry: Arc<SessionRegistry>, threshold: Duration, period: Duration) -> Self {
        Self {
            registry,
            threshold,
            period,
        }
    }

    fn is_expired(&self, handler: &dyn TunnelHandler, now: Instant) -> bool {
        let idle = now.saturating_duration_since(handler.last_interaction_time());
        if handler.is_communication_started() {
            idle > self.threshold
        } else {
            idle > self.threshold + self.period
        }
    }

    /// Close every expired session as of `now`. Sessions already being torn
    /// down are skipped. Returns the queue ids that were closed.
    pub async fn sweep(&self, now: Instant) -> Vec<String> {
        let mut closed = Vec::new();
        for (key, handler) in self.registry.handles().await {
            if handler.is_interrupted() || !self.is_expired(handler.as_ref(), now) {
                continue;
            }
            let queue_id = handler.queue_id().to_string();
            info!(
                %queue_id,
                role = %handler.role(),
                started = handler.is_communication_started(),
                "closing idle session"
            );
            handler.set_interrupted(true);
            handler.close().await;
            self.registry.remove(&key).await;
            closed.push(queue_id);
        }
        if !closed.is_empty() {
            debug!(count = closed.len(), "idle sweep finished");
        }
        closed
    }

    /// Sweep every period until the task is aborted.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep(Instant::now()).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::MockHandler;

    const THRESHOLD: Duration = Duration::from_secs(60);
    const PERIOD: Duration = Duration::from_secs(30);

    async fn task_with(handler: Arc<MockHandler>) -> ConnectionRemovalTask {
        let registry = Arc::new(SessionRegistry::new());
        MockHandler::register(&registry, &handler).await;
        ConnectionRemovalTask::new(registry, THRESHOLD, PERIOD)
    }

    #[tokio::test]
    async fn started_and_idle_past_threshold_is_closed_once() {
        let handler = MockHandler::started("a");
        let task = task_with(handler.clone()).await;
        let now = handler.last_interaction_time() + THRESHOLD + Duration::from_secs(1);

        assert_eq!(task.sweep(now).await, vec!["a".to_string()]);
        assert!(handler.is_interrupted());
        assert_eq!(handler.close_calls(), 1);

        // Already gone; a second pass must not close again.
        assert!(task.sweep(now).await.is_empty());
        assert_eq!(handler.close_calls(), 1);
    }

    #[tokio::test]
    async fn started_within_threshold_is_untouched() {
        let handler = MockHandler::started("b");
        let task = task_with(handler.clone()).await;
        let now = handler.last_interaction_time() + THRESHOLD - Duration::from_secs(1);

        assert!(task.sweep(now).await.is_empty());
        assert!(!handler.is_interrupted());
        assert_eq!(handler.close_calls(), 0);
    }

    #[tokio::test]
    async fn never_started_gets_one_period_of_grace() {
        let handler = MockHandler::idle("c");
        let task = task_with(handler.clone()).await;
        let created = handler.last_interaction_time();

        let within_grace = created + THRESHOLD + PERIOD / 2;
        assert!(task.sweep(within_grace).await.is_empty());
        assert_eq!(handler.close_calls(), 0);

        let past_grace = created + THRESHOLD + PERIOD + Duration::from_secs(1);
        assert_eq!(task.sweep(past_grace).await, vec!["c".to_string()]);
        assert!(handler.is_interrupted());
        assert_eq!(handler.close_calls(), 1);
    }

    #[tokio::test]
    async fn interrupted_sessions_are_skipped() {
        let handler = MockHandler::started("d");
        handler.set_interrupted(true);
        let task = task_with(handler.clone()).await;
        let now = handler.last_interaction_time() + THRESHOLD * 10;

        assert!(task.sweep(now).await.is_empty());
        assert_eq!(handler.close_calls(), 0);
    }
}
