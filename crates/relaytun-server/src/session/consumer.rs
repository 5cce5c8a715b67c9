//! Consumer end of a tunnel.
//!
//! Owns a listener on a reserved local port, waits for exactly one local
//! client to connect, then pumps that connection through the relay.

use super::handler::{pump, CancelSignal, SessionExit, Teardown, TunnelHandler, TunnelState};
use crate::gateway::ports::PortGuard;
use crate::relay::{RelayChannel, RelayInbound};
use relaytun_core::{BoxFuture, Role};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Everything the consumer-side task takes ownership of.
pub struct ConsumerSetup {
    pub listener: TcpListener,
    pub port_guard: PortGuard,
    pub tls: Option<TlsAcceptor>,
    pub channel: RelayChannel,
    pub inbound: RelayInbound,
    pub accept_timeout: Duration,
    pub buffer_size: usize,
    pub exit: SessionExit,
}

pub struct ConsumerSideSocketThread {
    state: Arc<TunnelState>,
    server_port: u16,
}

impl ConsumerSideSocketThread {
    pub fn new(queue_id: &str, server_port: u16) -> (Arc<Self>, CancelSignal) {
        let (state, cancel) = TunnelState::new(queue_id, Role::Consumer);
        (Arc::new(Self { state, server_port }), cancel)
    }

    /// Port local clients connect to.
    pub fn server_port(&self) -> u16 {
        self.server_port
    }

    pub fn start(&self, cancel: CancelSignal, setup: ConsumerSetup) -> tokio::task::JoinHandle<()> {
        tokio::spawn(run(self.state.clone(), cancel, setup))
    }
}

async fn run(state: Arc<TunnelState>, mut cancel: CancelSignal, setup: ConsumerSetup) {
    let ConsumerSetup {
        listener,
        port_guard,
        tls,
        channel,
        mut inbound,
        accept_timeout,
        buffer_size,
        exit,
    } = setup;
    let queue_id = state.queue_id().to_string();
    let port = port_guard.port();

    let accepted = tokio::select! {
        _ = cancel.cancelled() => Err(Teardown::Cancelled),
        result = tokio::time::timeout(accept_timeout, listener.accept()) => match result {
            Ok(Ok(pair)) => Ok(pair),
            Ok(Err(e)) => {
                warn!(%queue_id, port, error = %e, "accept failed");
                Err(Teardown::SetupFailed)
            }
            Err(_) => {
                warn!(%queue_id, port, "no local client connected in time");
                Err(Teardown::SetupFailed)
            }
        },
    };
    // One client per session.
    drop(listener);

    let reason = match accepted {
        Err(reason) => reason,
        Ok((stream, peer)) => {
            info!(%queue_id, port, %peer, tls = tls.is_some(), "local client connected");
            let _ = stream.set_nodelay(true);
            match tls {
                None => pump(&state, &channel, &mut inbound, &mut cancel, stream, buffer_size).await,
                Some(acceptor) => {
                    match tokio::time::timeout(accept_timeout, acceptor.accept(stream)).await {
                        Ok(Ok(tls_stream)) => {
                            pump(&state, &channel, &mut inbound, &mut cancel, tls_stream, buffer_size)
                                .await
                        }
                        Ok(Err(e)) => {
                            warn!(%queue_id, error = %e, "local TLS handshake failed");
                            Teardown::SetupFailed
                        }
                        Err(_) => {
                            warn!(%queue_id, "local TLS handshake timed out");
                            Teardown::SetupFailed
                        }
                    }
                }
            }
        }
    };

    exit.finish(&state, channel, reason).await;
    drop(port_guard);
    debug!(%queue_id, port, "consumer port released");
}

impl TunnelHandler for ConsumerSideSocketThread {
    fn queue_id(&self) -> &str {
        self.state.queue_id()
    }

    fn role(&self) -> Role {
        Role::Consumer
    }

    fn is_communication_started(&self) -> bool {
        self.state.is_communication_started()
    }

    fn last_interaction_time(&self) -> Instant {
        self.state.last_interaction_time()
    }

    fn set_interrupted(&self, interrupted: bool) {
        self.state.set_interrupted(interrupted);
    }

    fn is_interrupted(&self) -> bool {
        self.state.is_interrupted()
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.state.request_close() {
                debug!(queue_id = %self.state.queue_id(), "close requested");
            }
        })
    }
}
