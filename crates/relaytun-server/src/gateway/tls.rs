//! TLS for the local legs of a tunnel.
//!
//! The consumer side terminates TLS from local clients with its own
//! certificate; the provider side dials the real provider over TLS and
//! trusts the configured CA bundle.

use relaytun_core::{GatewayError, GatewayResult};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

#[derive(Clone, Default)]
pub struct LocalTls {
    acceptor: Option<TlsAcceptor>,
    connector: Option<TlsConnector>,
}

impl LocalTls {
    /// Plain TCP on both legs.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn load(cert: &Path, key: &Path, ca: &Path) -> GatewayResult<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let server = rustls::ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(tls_error)?
            .with_no_client_auth()
            .with_single_cert(load_certs(cert)?, load_key(key)?)
            .map_err(tls_error)?;

        let mut roots = rustls::RootCertStore::empty();
        for ca_cert in load_certs(ca)? {
            roots.add(ca_cert).map_err(tls_error)?;
        }
        let client = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(tls_error)?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            acceptor: Some(TlsAcceptor::from(Arc::new(server))),
            connector: Some(TlsConnector::from(Arc::new(client))),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.acceptor.is_some()
    }

    pub fn acceptor(&self) -> Option<TlsAcceptor> {
        self.acceptor.clone()
    }

    pub fn connector(&self) -> Option<TlsConnector> {
        self.connector.clone()
    }
}

fn tls_error(e: rustls::Error) -> GatewayError {
    GatewayError::Other(format!("TLS configuration: {e}"))
}

fn load_certs(path: &Path) -> GatewayResult<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path).map_err(|e| {
        GatewayError::Other(format!("cannot read certificate {}: {e}", path.display()))
    })?;
    let certs = rustls_pemfile::certs(&mut &pem[..]).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(GatewayError::Other(format!(
            "no certificate found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> GatewayResult<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path)
        .map_err(|e| GatewayError::Other(format!("cannot read key {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut &pem[..])?
        .ok_or_else(|| GatewayError::Other(format!("no private key found in {}", path.display())))
}

/// Write a self-signed development certificate for `common_name` into `dir`.
/// The certificate doubles as its own CA for the provider leg.
pub fn generate_self_signed(dir: &Path, common_name: &str) -> GatewayResult<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(dir)?;
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");

    let rcgen_error = |e: rcgen::Error| GatewayError::Other(format!("certificate generation: {e}"));
    let mut params = rcgen::CertificateParams::new(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        common_name.to_string(),
    ])
    .map_err(rcgen_error)?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, common_name);

    let key_pair = rcgen::KeyPair::generate().map_err(rcgen_error)?;
    let cert = params.self_signed(&key_pair).map_err(rcgen_error)?;

    std::fs::write(&cert_path, cert.pem())?;
    std::fs::write(&key_path, key_pair.serialize_pem())?;
    Ok((cert_path, key_path))
}
