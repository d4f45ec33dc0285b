//! TLS termination for entry points.

use crate::config::EntryPointTls;
use anyhow::{Context, Result};
use rustls::pki_types::CertificateDer;
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Build an acceptor from the entry point's PEM certificate chain and key.
pub fn acceptor(tls: &EntryPointTls) -> Result<TlsAcceptor> {
    let config = server_config(&tls.cert_file, &tls.key_file)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn server_config(cert_path: &Path, key_path: &Path) -> Result<ServerConfig> {
    let cert_file =
        File::open(cert_path).with_context(|| format!("Failed to open cert file: {:?}", cert_path))?;
    let chain: Vec<CertificateDer<'static>> = certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificates in {:?}", cert_path))?;
    if chain.is_empty() {
        anyhow::bail!("No certificate found in {:?}", cert_path);
    }

    let key_file =
        File::open(key_path).with_context(|| format!("Failed to open key file: {:?}", key_path))?;
    let key = private_key(&mut BufReader::new(key_file))
        .with_context(|| format!("Failed to parse private key in {:?}", key_path))?
        .with_context(|| format!("No private key found in {:?}", key_path))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context("Failed to select TLS protocol versions")?
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .context("Failed to build TLS config")?;

    // Enable ALPN for HTTP/2 and HTTP/1.1
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(config)
}
