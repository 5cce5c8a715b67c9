//! Provider end of a tunnel.
//!
//! Dials the real provider as soon as the session is attached and pumps
//! that connection through the relay.

use super::handler::{pump, CancelSignal, SessionExit, Teardown, TunnelHandler, TunnelState};
use crate::relay::{RelayChannel, RelayInbound};
use relaytun_core::{BoxFuture, Role};
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

pub struct ProviderSetup {
    pub address: String,
    pub port: u16,
    pub tls: Option<TlsConnector>,
    pub channel: RelayChannel,
    pub inbound: RelayInbound,
    pub connect_timeout: Duration,
    pub buffer_size: usize,
    pub exit: SessionExit,
}

pub struct ProviderSideSocketThreadHandler {
    state: Arc<TunnelState>,
}

impl ProviderSideSocketThreadHandler {
    pub fn new(queue_id: &str) -> (Arc<Self>, CancelSignal) {
        let (state, cancel) = TunnelState::new(queue_id, Role::Provider);
        (Arc::new(Self { state }), cancel)
    }

    pub fn start(&self, cancel: CancelSignal, setup: ProviderSetup) -> tokio::task::JoinHandle<()> {
        tokio::spawn(run(self.state.clone(), cancel, setup))
    }
}

async fn run(state: Arc<TunnelState>, mut cancel: CancelSignal, setup: ProviderSetup) {
    let ProviderSetup {
        address,
        port,
        tls,
        channel,
        mut inbound,
        connect_timeout,
        buffer_size,
        exit,
    } = setup;
    let queue_id = state.queue_id().to_string();
    let target = format!("{address}:{port}");

    let connected = tokio::select! {
        _ = cancel.cancelled() => Err(Teardown::Cancelled),
        result = tokio::time::timeout(connect_timeout, TcpStream::connect(&target)) => match result {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => {
                warn!(%queue_id, %target, error = %e, "cannot reach provider");
                Err(Teardown::SetupFailed)
            }
            Err(_) => {
                warn!(%queue_id, %target, "provider connect timed out");
                Err(Teardown::SetupFailed)
            }
        },
    };

    let reason = match connected {
        Err(reason) => reason,
        Ok(stream) => {
            info!(%queue_id, %target, tls = tls.is_some(), "connected to provider");
            let _ = stream.set_nodelay(true);
            match tls {
                None => pump(&state, &channel, &mut inbound, &mut cancel, stream, buffer_size).await,
                Some(connector) => match ServerName::try_from(address.clone()) {
                    Err(e) => {
                        warn!(%queue_id, %address, error = %e, "provider address is not a TLS server name");
                        Teardown::SetupFailed
                    }
                    Ok(server_name) => {
                        match tokio::time::timeout(connect_timeout, connector.connect(server_name, stream))
                            .await
                        {
                            Ok(Ok(tls_stream)) => {
                                pump(&state, &channel, &mut inbound, &mut cancel, tls_stream, buffer_size)
                                    .await
                            }
                            Ok(Err(e)) => {
                                warn!(%queue_id, %target, error = %e, "provider TLS handshake failed");
                                Teardown::SetupFailed
                            }
                            Err(_) => {
                                warn!(%queue_id, %target, "provider TLS handshake timed out");
                                Teardown::SetupFailed
                            }
                        }
                    }
                },
            }
        }
    };

    exit.finish(&state, channel, reason).await;
}

impl TunnelHandler for ProviderSideSocketThreadHandler {
    fn queue_id(&self) -> &str {
        self.state.queue_id()
    }

    fn role(&self) -> Role {
        Role::Provider
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
