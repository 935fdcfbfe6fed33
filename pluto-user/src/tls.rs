use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::TlsConfig;

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("opening certificate {}", path.display()))?,
    );
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("reading certificates from {}", path.display()))?;
    if certs.is_empty() {
        return Err(anyhow!("no certificate found in {}", path.display()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("opening key {}", path.display()))?,
    );
    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("reading key from {}", path.display()))?
        .ok_or_else(|| anyhow!("no private key found in {}", path.display()))
}

fn root_store(ca_path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_path)? {
        roots.add(cert).context("adding CA root")?;
    }
    Ok(roots)
}

/// Server-auth-only acceptor for the public IMAP listener.
pub fn public_acceptor(tls: &TlsConfig) -> Result<TlsAcceptor> {
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(load_certs(&tls.cert_path)?, load_key(&tls.key_path)?)
        .context("building public TLS config")?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Mutually-authenticated acceptor for the internal RPC and sync listeners:
/// peers must present a certificate signed by the configured CA.
pub fn internal_acceptor(tls: &TlsConfig) -> Result<TlsAcceptor> {
    let verifier = WebPkiClientVerifier::builder(Arc::new(root_store(&tls.ca_path)?))
        .build()
        .context("building client certificate verifier")?;
    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(load_certs(&tls.cert_path)?, load_key(&tls.key_path)?)
        .context("building internal TLS config")?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Client side of the internal surfaces, presenting our certificate and
/// trusting only the configured CA.
pub fn internal_connector(tls: &TlsConfig) -> Result<TlsConnector> {
    let config = ClientConfig::builder()
        .with_root_certificates(root_store(&tls.ca_path)?)
        .with_client_auth_cert(load_certs(&tls.cert_path)?, load_key(&tls.key_path)?)
        .context("building internal TLS client config")?;
    Ok(TlsConnector::from(Arc::new(config)))
}
