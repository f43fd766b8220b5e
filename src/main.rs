//! cms-backend - live preview control server
//!
//! Editors connect over a WebSocket at `/socket`. Each connection gets its
//! own session id, a preview URL, and a Hugo preview process it can start
//! and stop on demand. The content repository can be listed over the same
//! channel.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser as ClapParser;
use cms_backend::{
    api,
    config::{ConfigError, FileConfig, Overrides, Settings},
    shutdown::ShutdownCoordinator,
    tls,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long live connections get to close after Ctrl+C.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// cms-backend - live preview control server
#[derive(ClapParser, Debug)]
#[command(name = "cms-backend", version, about, long_about = None)]
struct Cli {
    /// Address to bind the HTTP/WebSocket server
    #[arg(long, env = "WS_LISTEN")]
    listen: Option<SocketAddr>,

    /// Prefix of every preview URL; the session id and `/preview/` follow
    #[arg(long, env = "HUGO_BASE_URL")]
    base_url: Option<String>,

    /// Address preview processes bind to
    #[arg(long, env = "HUGO_BIND")]
    bind: Option<String>,

    /// Site source passed to the preview engine
    #[arg(long, env = "HUGO_SOURCE")]
    source: Option<PathBuf>,

    /// Directory listed by `reqAllFiles` (default: <source>/content)
    #[arg(long, env = "HUGO_CONTENT_ROOT")]
    content_root: Option<PathBuf>,

    /// Preview program to run
    #[arg(long, env = "HUGO_PROGRAM")]
    preview_program: Option<String>,

    /// WebSocket read buffer size in bytes; also caps inbound message size
    #[arg(long, env = "WS_READ_BUFFER_SIZE")]
    read_buffer_size: Option<String>,

    /// WebSocket write buffer size in bytes
    #[arg(long, env = "WS_WRITE_BUFFER_SIZE")]
    write_buffer_size: Option<String>,

    /// Expected host of the Origin header; empty accepts any origin
    #[arg(long, env = "WS_CHECK_ORIGIN_HOST")]
    origin_host: Option<String>,

    /// Maximum number of concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// PEM certificate chain; enables TLS together with --tls-key
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// PEM private key
    #[arg(long)]
    tls_key: Option<PathBuf>,

    /// Plain-HTTP address answering with redirects to HTTPS (TLS mode only)
    #[arg(long)]
    redirect_listen: Option<SocketAddr>,

    /// TOML config file; command-line and environment values take precedence
    #[arg(long, env = "CMS_BACKEND_CONFIG")]
    config: Option<PathBuf>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            listen: self.listen,
            base_url: self.base_url.clone(),
            bind: self.bind.clone(),
            source: self.source.clone(),
            content_root: self.content_root.clone(),
            program: self.preview_program.clone(),
            read_buffer_size: self.read_buffer_size.clone(),
            write_buffer_size: self.write_buffer_size.clone(),
            origin_host: self.origin_host.clone(),
            max_sessions: self.max_sessions,
            tls_cert: self.tls_cert.clone(),
            tls_key: self.tls_key.clone(),
            redirect_listen: self.redirect_listen,
        }
    }
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("tls error: {0}")]
    Tls(#[from] tls::TlsError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    let cli = Cli::parse();
    init_tracing();

    let file = match &cli.config {
        Some(path) => FileConfig::load(path)?.unwrap_or_else(|| {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            FileConfig::default()
        }),
        None => FileConfig::default(),
    };
    let settings = Settings::resolve(cli.overrides(), file)?;

    run_server(settings).await
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "cms_backend=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn bind(addr: SocketAddr) -> Result<tokio::net::TcpListener, ServerError> {
    tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })
}

/// Serve until Ctrl+C, then close live sessions and wait briefly for them.
async fn run_server(settings: Settings) -> Result<(), ServerError> {
    tracing::info!(
        base_url = %settings.preview_base_url,
        source = %settings.preview_source.display(),
        content_root = %settings.content_root.display(),
        origin_host = %settings.upgrade.origin_host,
        "cms-backend starting"
    );

    let listen = settings.listen;
    let tls_paths = settings.tls.clone();
    let redirect_listen = settings.redirect_listen;
    let origin_host: Arc<str> = Arc::from(settings.upgrade.origin_host.as_str());

    let shutdown = ShutdownCoordinator::new();
    let state = api::AppState::new(settings, shutdown.clone());
    let app = api::router(state);

    let listener = bind(listen).await?;
    let cancel = CancellationToken::new();

    let server_handle = match tls_paths {
        Some(paths) => {
            let acceptor = tls::load_tls_config(&paths.cert, &paths.key)?;
            tracing::info!(addr = %listen, "HTTPS/WSS server listening");

            if let Some(addr) = redirect_listen {
                let redirect_listener = bind(addr).await?;
                let redirect_app = api::redirect_router(origin_host);
                let cancel = cancel.clone();
                tracing::info!(addr = %addr, "HTTP redirect listener started");
                tokio::spawn(async move {
                    let result = axum::serve(redirect_listener, redirect_app)
                        .with_graceful_shutdown(cancel.cancelled_owned())
                        .await;
                    if let Err(e) = result {
                        tracing::error!(error = %e, "redirect listener failed");
                    }
                });
            }

            tokio::spawn(tls::serve_tls(listener, acceptor, app, cancel.clone()))
        }
        None => {
            if redirect_listen.is_some() {
                tracing::warn!("--redirect-listen has no effect without TLS");
            }
            tracing::info!(addr = %listen, "HTTP/WS server listening");
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let result = axum::serve(listener, app)
                    .with_graceful_shutdown(cancel.cancelled_owned())
                    .await;
                if let Err(e) = result {
                    tracing::error!(error = %e, "HTTP server failed");
                }
            })
        }
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("received Ctrl+C");

    // Sessions send close frames, stop their previews and unregister.
    shutdown.shutdown();
    if !shutdown.wait_for_drain(DRAIN_TIMEOUT).await {
        tracing::warn!(
            remaining = shutdown.active_count(),
            "connections still open after drain timeout"
        );
    }

    cancel.cancel();
    server_handle.await?;

    tracing::info!("cms-backend exiting");
    Ok(())
}
