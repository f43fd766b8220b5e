//! TLS support for the control server.
//!
//! Loads PEM-encoded certificate chains and private keys, builds a rustls
//! `ServerConfig`, and runs the manual accept loop that serves the axum
//! router over TLS with WebSocket upgrades enabled.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

/// Errors that can occur when loading TLS configuration.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read TLS certificate file: {0}")]
    CertRead(#[source] std::io::Error),
    #[error("failed to read TLS key file: {0}")]
    KeyRead(#[source] std::io::Error),
    #[error("no certificates found in PEM file")]
    NoCerts,
    #[error("no private key found in PEM file")]
    NoKey,
    #[error("failed to build TLS config: {0}")]
    Config(#[from] tokio_rustls::rustls::Error),
}

/// Load TLS certificate chain and private key from PEM files, returning a
/// `TlsAcceptor` ready for use with `tokio_rustls`.
pub fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, TlsError> {
    let cert_data = std::fs::read(cert_path).map_err(TlsError::CertRead)?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut &cert_data[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(TlsError::CertRead)?;
    if certs.is_empty() {
        return Err(TlsError::NoCerts);
    }

    // PKCS8, RSA or SEC1
    let key_data = std::fs::read(key_path).map_err(TlsError::KeyRead)?;
    let key = rustls_pemfile::private_key(&mut &key_data[..])
        .map_err(TlsError::KeyRead)?
        .ok_or(TlsError::NoKey)?;

    // Idempotent if a provider is already installed.
    let _ = tokio_rustls::rustls::crypto::aws_lc_rs::default_provider().install_default();

    let config = tokio_rustls::rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Accept TLS connections on `listener` and serve `app` on each until
/// `cancel` fires. Handshake failures only drop the offending connection.
pub async fn serve_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    app: axum::Router,
    cancel: CancellationToken,
) {
    loop {
        let (tcp_stream, peer_addr) = tokio::select! {
            _ = cancel.cancelled() => break,
            result = listener.accept() => match result {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to accept connection");
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let app = app.clone();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(tcp_stream).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::debug!(peer = %peer_addr, error = %e, "TLS handshake failed");
                    return;
                }
            };

            let io = hyper_util::rt::TokioIo::new(tls_stream);
            let service = hyper_util::service::TowerToHyperService::new(app);
            let builder =
                hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new());
            if let Err(e) = builder.serve_connection_with_upgrades(io, service).await {
                tracing::debug!(peer = %peer_addr, error = %e, "connection closed with error");
            }
        });
    }
}
