//! Control API server.
//!
//! Accepts local TCP connections and serves length-prefixed CBOR
//! [`ApiRequest`] frames, one [`ApiResponse`] per request, until the client
//! hangs up. Also owns the background tasks that keep the gateway tidy: the
//! idle-session sweep and the relay link monitor.

use crate::gateway::GatewayService;
use crate::session::ConnectionRemovalTask;
use relaytun_core::messages::{ApiRequest, ApiResponse};
use relaytun_core::{read_frame, write_frame, GatewayError, GatewayResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Page size used when a `list_sessions` request does not give one.
pub const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub api_bind: String,
    pub api_port: u16,
    pub inactivity_threshold: Duration,
    pub sweep_period: Duration,
    pub check_interval: Duration,
}

pub struct ControlServer {
    service: Arc<GatewayService>,
    options: ServerOptions,
}

/// Aborts the background tasks when the server future is dropped.
struct BackgroundTasks(Vec<JoinHandle<()>>);

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

impl ControlServer {
    pub fn new(service: Arc<GatewayService>, options: ServerOptions) -> Self {
        Self { service, options }
    }

    pub async fn bind(&self) -> GatewayResult<TcpListener> {
        let addr = (self.options.api_bind.as_str(), self.options.api_port);
        TcpListener::bind(addr).await.map_err(|e| {
            GatewayError::Operational(format!(
                "cannot bind control API on {}:{}: {e}",
                self.options.api_bind, self.options.api_port
            ))
        })
    }

    /// Serve the control API on `listener` until accepting fails.
    pub async fn run(self, listener: TcpListener) -> GatewayResult<()> {
        let registry = self.service.registry().clone();
        let _tasks = BackgroundTasks(vec![
            ConnectionRemovalTask::new(
                registry.clone(),
                self.options.inactivity_threshold,
                self.options.sweep_period,
            )
            .spawn(),
            self.service
                .pool()
                .clone()
                .spawn_monitor(registry, self.options.check_interval),
        ]);

        info!(
            addr = %listener.local_addr()?,
            gateway = %self.service.common_name(),
            "control API ready"
        );

        loop {
            let (stream, remote) = listener.accept().await?;
            debug!(%remote, "control client connected");
            let service = self.service.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_connection(&service, stream).await {
                    warn!(%remote, error = %e, "control connection error");
                }
                debug!(%remote, "control client disconnected");
            });
        }
    }
}

/// Answer requests on one connection until EOF.
pub async fn serve_connection<S>(service: &GatewayService, mut stream: S) -> GatewayResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(request) = read_frame::<_, ApiRequest>(&mut stream).await? {
        let response = dispatch(service, request).await;
        write_frame(&mut stream, &response).await?;
    }
    Ok(())
}

pub async fn dispatch(service: &GatewayService, request: ApiRequest) -> ApiResponse {
    let result = match request {
        ApiRequest::ConnectProvider(req) => service
            .connect_provider(&req)
            .await
            .map(ApiResponse::ProviderConnected),
        ApiRequest::ConnectConsumer(req) => service
            .connect_consumer(&req)
            .await
            .map(|server_port| ApiResponse::ConsumerConnected { server_port }),
        ApiRequest::CloseSession { queue_id } => service
            .close_session(&queue_id)
            .await
            .map(|()| ApiResponse::SessionClosed { queue_id }),
        ApiRequest::ListSessions { page, size } => {
            let (total, sessions) = service
                .active_sessions(page.unwrap_or(0), size.unwrap_or(DEFAULT_PAGE_SIZE))
                .await;
            Ok(ApiResponse::Sessions { total, sessions })
        }
        ApiRequest::PublicKey => Ok(ApiResponse::PublicKey {
            public_key: service.public_key(),
        }),
    };

    result.unwrap_or_else(|e| {
        debug!(error = %e, "request failed");
        ApiResponse::Error {
            kind: e.kind(),
            message: e.to_string(),
        }
    })
}
