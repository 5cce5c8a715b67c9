//! relaytun-server: relay tunnel gateway.
//!
//! Opens TCP tunnels between a consumer and a provider in different clouds
//! over an untrusted message relay, with every message sealed end to end
//! between the two gateways. Sessions are set up through a local control API.

mod config;
mod gateway;
mod relay;
mod server;
mod session;

use anyhow::Context;
use clap::Parser;
use config::{GatewayConfig, Overrides, RelayBackend};
use gateway::{GatewayService, GatewaySettings, LocalTls, PortPool};
use relay::{MemoryBroker, RedisConnector};
use relaytun_core::{Cryptographer, GatewayKeyPair, RelayConnector};
use server::{ControlServer, ServerOptions};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// relaytun-server: relay tunnel gateway
#[derive(Parser, Debug)]
#[command(name = "relaytun-server", version, about = "Relay tunnel gateway")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.relaytun/config.toml")]
    config: String,

    /// Gateway common name (queue names of provider-side sessions derive from it)
    #[arg(long)]
    common_name: Option<String>,

    /// Control API port
    #[arg(short, long)]
    port: Option<u16>,

    /// Gateway key file (created on first start)
    #[arg(long)]
    key_file: Option<String>,

    /// Relay backend: redis or memory
    #[arg(long, value_parser = parse_backend)]
    relay_backend: Option<RelayBackend>,

    /// TLS certificate for the local legs (PEM)
    #[arg(long)]
    cert: Option<String>,

    /// TLS private key for the local legs (PEM)
    #[arg(long)]
    key: Option<String>,

    /// CA bundle trusted when dialing providers over TLS (PEM)
    #[arg(long)]
    ca: Option<String>,

    /// Generate a self-signed certificate for the local legs
    #[arg(long)]
    generate_cert: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_backend(value: &str) -> Result<RelayBackend, String> {
    match value {
        "redis" => Ok(RelayBackend::Redis),
        "memory" => Ok(RelayBackend::Memory),
        other => Err(format!("unknown relay backend `{other}` (expected redis or memory)")),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting relaytun-server");

    let (service, server) = match start(cli).await {
        Ok(parts) => parts,
        Err(e) => {
            error!(error = %format!("{e:#}"), "failed to start gateway");
            std::process::exit(1);
        }
    };

    let listener = match server.bind().await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, "failed to start control API");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = server.run(listener) => {
            if let Err(e) = result {
                error!(error = %e, "control API error");
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    service.shutdown().await;
    info!("relaytun-server stopped");
}

/// Load configuration and key material and assemble the gateway.
async fn start(cli: Cli) -> anyhow::Result<(Arc<GatewayService>, ControlServer)> {
    let (tls_cert, tls_key, tls_ca) = if cli.generate_cert {
        let dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".relaytun");
        let name = cli.common_name.as_deref().unwrap_or("gateway.local");
        let (cert, key) = gateway::tls::generate_self_signed(&dir, name)
            .context("failed to generate self-signed certificate")?;
        info!(cert = %cert.display(), key = %key.display(), "generated self-signed certificate");
        let cert = cert.display().to_string();
        (Some(cert.clone()), Some(key.display().to_string()), Some(cert))
    } else {
        (cli.cert, cli.key, cli.ca)
    };

    let config = GatewayConfig::load(
        Some(PathBuf::from(&cli.config).as_path()),
        Overrides {
            common_name: cli.common_name,
            api_port: cli.port,
            key_path: cli.key_file,
            backend: cli.relay_backend,
            tls_cert,
            tls_key,
            tls_ca,
        },
    )
    .context("failed to load config")?;

    let keys = GatewayKeyPair::load_or_generate(&config.key_path).with_context(|| {
        format!("failed to load gateway key {}", config.key_path.display())
    })?;
    info!(
        gateway = %config.common_name,
        key = %keys.public_key().short_fingerprint(),
        "gateway identity loaded"
    );
    let crypto = Arc::new(Cryptographer::with_max_message_size(
        keys,
        config.max_message_size,
    ));

    let connector: Arc<dyn RelayConnector> = match config.backend {
        RelayBackend::Redis => {
            let mut connector = RedisConnector::new(config.queue_ttl);
            if let Some(path) = &config.relay_ca_cert {
                let pem = std::fs::read(path)
                    .with_context(|| format!("cannot read relay CA {}", path.display()))?;
                connector = connector.with_ca_cert(pem);
            }
            Arc::new(connector)
        }
        RelayBackend::Memory => {
            warn!("using the in-process relay; tunnels only work between sessions of this gateway");
            Arc::new(MemoryBroker::new().connector())
        }
    };

    let tls = if config.tls_enabled {
        let tls = LocalTls::load(&config.tls_cert, &config.tls_key, &config.tls_ca)
            .context("failed to load local TLS")?;
        info!(cert = %config.tls_cert.display(), "local TLS enabled");
        tls
    } else {
        LocalTls::disabled()
    };

    let ports = PortPool::new(config.min_port, config.max_port)?;
    let service = Arc::new(GatewayService::new(
        GatewaySettings {
            common_name: config.common_name.clone(),
            local_bind: config.local_bind.clone(),
            buffer_size: config.buffer_size,
            accept_timeout: config.accept_timeout,
        },
        crypto,
        connector,
        ports,
        tls,
    ));

    let server = ControlServer::new(
        service.clone(),
        ServerOptions {
            api_bind: config.api_bind,
            api_port: config.api_port,
            inactivity_threshold: config.inactivity_threshold,
            sweep_period: config.sweep_period,
            check_interval: config.check_interval,
        },
    );
    Ok((service, server))
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler, waiting for Ctrl+C only");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
