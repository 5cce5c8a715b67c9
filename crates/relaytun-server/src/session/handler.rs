//! Shared tunnel machinery.
//!
//! Both ends of a tunnel run the same loop once their local socket exists:
//! read the socket and publish RAW envelopes, consume RAW envelopes and
//! write the socket, and watch the control queue for a CLOSE. They differ
//! only in how the local socket comes to be (accepted vs. dialed), which
//! lives in [`consumer`](super::consumer) and [`provider`](super::provider).
//!
//! The removal task and the admin API see sessions only through
//! [`TunnelHandler`].

use super::registry::{SessionKey, SessionRegistry};
use crate::relay::{RelayChannel, RelayInbound, RelayPool};
use relaytun_core::{BoxFuture, ControlCommand, GatewayError, RelayEndpoint, Role};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// What the cleanup task and the admin API may do with a live session.
pub trait TunnelHandler: Send + Sync {
    fn queue_id(&self) -> &str;

    fn role(&self) -> Role;

    /// True once the first data byte crossed the tunnel in either direction.
    fn is_communication_started(&self) -> bool;

    fn last_interaction_time(&self) -> Instant;

    fn set_interrupted(&self, interrupted: bool);

    fn is_interrupted(&self) -> bool;

    /// Request teardown. Returns without waiting for the I/O task to finish;
    /// calling it again is a no-op.
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Fields the I/O task writes and the cleanup task reads.
pub struct TunnelState {
    queue_id: String,
    role: Role,
    epoch: Instant,
    /// Milliseconds since `epoch`.
    last_interaction: AtomicU64,
    communication_started: AtomicBool,
    interrupted: AtomicBool,
    close_requested: AtomicBool,
    cancel_tx: mpsc::Sender<()>,
}

/// Receiving end of a [`TunnelState`]'s close request.
pub struct CancelSignal {
    rx: mpsc::Receiver<()>,
}

impl CancelSignal {
    pub async fn cancelled(&mut self) {
        let _ = self.rx.recv().await;
    }
}

impl TunnelState {
    pub fn new(queue_id: impl Into<String>, role: Role) -> (Arc<Self>, CancelSignal) {
        let (cancel_tx, rx) = mpsc::channel(1);
        let state = Arc::new(Self {
            queue_id: queue_id.into(),
            role,
            epoch: Instant::now(),
            last_interaction: AtomicU64::new(0),
            communication_started: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            close_requested: AtomicBool::new(false),
            cancel_tx,
        });
        (state, CancelSignal { rx })
    }

    pub fn queue_id(&self) -> &str {
        &self.queue_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Record a successful data transfer.
    pub fn touch(&self) {
        let elapsed = self.epoch.elapsed().as_millis() as u64;
        self.last_interaction.store(elapsed, Ordering::Release);
        self.communication_started.store(true, Ordering::Release);
    }

    pub fn is_communication_started(&self) -> bool {
        self.communication_started.load(Ordering::Acquire)
    }

    pub fn last_interaction_time(&self) -> Instant {
        self.epoch + Duration::from_millis(self.last_interaction.load(Ordering::Acquire))
    }

    pub fn set_interrupted(&self, interrupted: bool) {
        self.interrupted.store(interrupted, Ordering::Release);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Wake the I/O task so it tears down. Returns `false` if a close was
    /// already requested.
    pub fn request_close(&self) -> bool {
        if self.close_requested.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.cancel_tx.try_send(());
        true
    }
}

/// Why a tunnel ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// Local close request: admin API, removal task or relay monitor.
    Cancelled,
    /// The interrupted flag was seen set at the top of the loop.
    Interrupted,
    /// The peer gateway sent CLOSE.
    PeerClosed,
    /// The local socket reached EOF.
    LocalEof,
    SocketError,
    /// Send failed or the inbound queues stopped delivering.
    RelayLost,
    /// An envelope failed decryption or verification.
    Rejected,
    /// No local socket could be established.
    SetupFailed,
}

impl Teardown {
    /// Whether the peer gateway should be told with a CLOSE.
    pub fn notifies_peer(self) -> bool {
        !matches!(self, Teardown::PeerClosed)
    }
}

impl std::fmt::Display for Teardown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Teardown::Cancelled => "cancelled",
            Teardown::Interrupted => "interrupted",
            Teardown::PeerClosed => "peer closed",
            Teardown::LocalEof => "local eof",
            Teardown::SocketError => "socket error",
            Teardown::RelayLost => "relay lost",
            Teardown::Rejected => "rejected envelope",
            Teardown::SetupFailed => "setup failed",
        };
        f.write_str(s)
    }
}

/// Upper bound on flushing the local socket once the loop has ended.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Move bytes between `stream` and the relay until something ends the
/// session. Control messages win over data when both are ready, and a close
/// request wins over everything, including a write the local peer is not
/// draining.
pub async fn pump<S>(
    state: &TunnelState,
    channel: &RelayChannel,
    inbound: &mut RelayInbound,
    cancel: &mut CancelSignal,
    stream: S,
    buffer_size: usize,
) -> Teardown
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut buf = vec![0u8; buffer_size.clamp(1, channel.max_chunk())];
    let queue_id = state.queue_id();

    let reason = loop {
        if state.is_interrupted() {
            break Teardown::Interrupted;
        }

        tokio::select! {
            biased;

            _ = cancel.cancelled() => break Teardown::Cancelled,

            message = inbound.control.recv() => {
                let Some(raw) = message else {
                    break Teardown::RelayLost;
                };
                let plaintext = match channel.open_control(&raw) {
                    Ok(p) => p,
                    Err(e) => {
                        error!(%queue_id, error = %e, "rejected control envelope");
                        break Teardown::Rejected;
                    }
                };
                match channel.parse_control(&plaintext) {
                    Ok(ControlCommand::Close { .. }) => {
                        debug!(%queue_id, "peer requested close");
                        break Teardown::PeerClosed;
                    }
                    Ok(ControlCommand::Switch { .. }) => {
                        debug!(%queue_id, "ignoring SWITCH on a tunnel session");
                    }
                    Err(e) => {
                        error!(%queue_id, error = %e, "discarding spoofed control command");
                    }
                }
            }

            message = inbound.data.recv() => {
                let Some(raw) = message else {
                    break Teardown::RelayLost;
                };
                let plaintext = match channel.open_data(&raw) {
                    Ok(p) => p,
                    Err(e) => {
                        error!(%queue_id, error = %e, "rejected data envelope");
                        break Teardown::Rejected;
                    }
                };
                let written = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break Teardown::Cancelled,
                    result = writer.write_all(&plaintext) => result,
                };
                if let Err(e) = written {
                    warn!(%queue_id, error = %e, "local socket write failed");
                    break Teardown::SocketError;
                }
                state.touch();
            }

            read = reader.read(&mut buf) => match read {
                Ok(0) => break Teardown::LocalEof,
                Ok(n) => {
                    let sent = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break Teardown::Cancelled,
                        result = channel.send_data(&buf[..n]) => result,
                    };
                    if let Err(e) = sent {
                        warn!(%queue_id, error = %e, "relay send failed");
                        break Teardown::RelayLost;
                    }
                    state.touch();
                }
                Err(e) => {
                    warn!(%queue_id, error = %e, "local socket read failed");
                    break Teardown::SocketError;
                }
            },
        }
    };

    let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, writer.shutdown()).await;
    reason
}

/// Bookkeeping every tunnel does on its way out.
pub struct SessionExit {
    registry: Arc<SessionRegistry>,
    pool: Arc<RelayPool>,
    endpoint: RelayEndpoint,
    key: SessionKey,
}

impl SessionExit {
    pub fn new(
        registry: Arc<SessionRegistry>,
        pool: Arc<RelayPool>,
        endpoint: RelayEndpoint,
        key: SessionKey,
    ) -> Self {
        Self {
            registry,
            pool,
            endpoint,
            key,
        }
    }

    /// Tell the peer (unless it told us), stop consuming, and drop this
    /// registration from the registry and from its relay link. A newer
    /// session that reused the queue id keeps both.
    pub async fn finish(self, state: &TunnelState, mut channel: RelayChannel, reason: Teardown) {
        state.set_interrupted(true);
        let queue_id = state.queue_id();

        if reason.notifies_peer() {
            match channel.send_close().await {
                Ok(()) => debug!(%queue_id, "sent CLOSE to peer"),
                Err(GatewayError::Transport(e)) => {
                    debug!(%queue_id, error = %e, "could not send CLOSE, relay gone")
                }
                Err(e) => warn!(%queue_id, error = %e, "could not send CLOSE"),
            }
        }
        channel.detach();
        drop(channel);

        self.pool.release(&self.endpoint, &self.key).await;
        self.registry.remove(&self.key).await;
        info!(%queue_id, role = %state.role(), %reason, "tunnel closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::MemoryBroker;
    use relaytun_core::{generate_queue_id, Cryptographer, GatewayKeyPair, QueueNames, RelayConnector};

    /// The consumer leg of a session plus the provider-side channel that
    /// feeds it.
    struct Session {
        state: Arc<TunnelState>,
        cancel: CancelSignal,
        channel: RelayChannel,
        inbound: RelayInbound,
        peer: RelayChannel,
    }

    async fn session() -> Session {
        let broker = MemoryBroker::new();
        let link = broker
            .connector()
            .connect(&RelayEndpoint::new("relay", 1, false))
            .await
            .unwrap();
        let local = GatewayKeyPair::generate();
        let remote = GatewayKeyPair::generate();
        let queue_id = generate_queue_id();
        let names = QueueNames::derive("provider.gw", &queue_id);

        let (channel, inbound) = RelayChannel::attach(
            link.clone(),
            Arc::new(Cryptographer::new(local.clone())),
            remote.public_key(),
            Role::Consumer,
            &queue_id,
            &names,
        )
        .await
        .unwrap();
        let (peer, _) = RelayChannel::attach(
            link,
            Arc::new(Cryptographer::new(remote)),
            local.public_key(),
            Role::Provider,
            &queue_id,
            &names,
        )
        .await
        .unwrap();
        let (state, cancel) = TunnelState::new(&queue_id, Role::Consumer);
        Session {
            state,
            cancel,
            channel,
            inbound,
            peer,
        }
    }

    #[test]
    fn fresh_state_is_idle_and_not_started() {
        let (state, _cancel) = TunnelState::new("q", Role::Consumer);
        assert!(!state.is_communication_started());
        assert!(!state.is_interrupted());
        assert!(state.last_interaction_time() <= Instant::now());
    }

    #[test]
    fn touch_marks_started_and_advances_time() {
        let (state, _cancel) = TunnelState::new("q", Role::Provider);
        let before = state.last_interaction_time();
        std::thread::sleep(Duration::from_millis(5));
        state.touch();
        assert!(state.is_communication_started());
        assert!(state.last_interaction_time() > before);
    }

    #[tokio::test]
    async fn close_request_fires_once() {
        let (state, mut cancel) = TunnelState::new("q", Role::Consumer);
        assert!(state.request_close());
        assert!(!state.request_close());
        tokio::time::timeout(Duration::from_secs(1), cancel.cancelled())
            .await
            .unwrap();
    }

    #[test]
    fn only_peer_close_skips_notification() {
        assert!(!Teardown::PeerClosed.notifies_peer());
        assert!(Teardown::LocalEof.notifies_peer());
        assert!(Teardown::Cancelled.notifies_peer());
        assert!(Teardown::Rejected.notifies_peer());
    }

    #[tokio::test]
    async fn close_unblocks_a_write_the_local_peer_never_drains() {
        let Session {
            state,
            mut cancel,
            channel,
            mut inbound,
            peer,
        } = session().await;
        let chunk = vec![7u8; 4096];
        for _ in 0..8 {
            peer.send_data(&chunk).await.unwrap();
        }

        // Far end is kept open but never read.
        let (near, _far) = tokio::io::duplex(64);
        let running = {
            let state = state.clone();
            tokio::spawn(async move {
                pump(&state, &channel, &mut inbound, &mut cancel, near, 4096).await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!running.is_finished());
        assert!(!state.is_communication_started());

        state.set_interrupted(true);
        assert!(state.request_close());
        let reason = tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .expect("tunnel ignored the close request")
            .unwrap();
        assert_eq!(reason, Teardown::Cancelled);
    }

    #[tokio::test]
    async fn queued_close_wins_over_a_data_backlog() {
        let Session {
            state,
            mut cancel,
            channel,
            mut inbound,
            peer,
        } = session().await;
        for _ in 0..5 {
            peer.send_data(b"backlog").await.unwrap();
        }
        peer.send_close().await.unwrap();

        let (near, mut far) = tokio::io::duplex(64 * 1024);
        let reason = pump(&state, &channel, &mut inbound, &mut cancel, near, 4096).await;
        assert_eq!(reason, Teardown::PeerClosed);
        assert!(!state.is_communication_started());
        assert!(inbound.data.try_recv().is_ok());

        let mut delivered = Vec::new();
        far.read_to_end(&mut delivered).await.unwrap();
        assert!(delivered.is_empty());
    }

    #[tokio::test]
    async fn close_request_wins_over_queued_control() {
        let Session {
            state,
            mut cancel,
            channel,
            mut inbound,
            peer,
        } = session().await;
        peer.send_close().await.unwrap();
        state.request_close();

        let (near, _far) = tokio::io::duplex(1024);
        let reason = pump(&state, &channel, &mut inbound, &mut cancel, near, 4096).await;
        assert_eq!(reason, Teardown::Cancelled);
        assert!(inbound.control.try_recv().is_ok());
    }
}
