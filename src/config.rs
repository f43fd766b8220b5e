use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::preview::PreviewCommand;
use crate::session::Keepalive;

/// WebSocket buffer size used when none (or an unusable one) is configured.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Default HTTP/WebSocket listen address.
pub fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// On-disk configuration, loaded from TOML. Every field is optional;
/// command-line flags and environment variables take precedence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    pub listen: Option<SocketAddr>,
    pub max_sessions: Option<usize>,
    #[serde(default)]
    pub preview: PreviewSection,
    #[serde(default)]
    pub websocket: WebSocketSection,
    pub tls: Option<TlsSection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreviewSection {
    pub base_url: Option<String>,
    pub bind: Option<String>,
    pub source: Option<PathBuf>,
    pub content_root: Option<PathBuf>,
    pub program: Option<String>,
    pub args: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebSocketSection {
    pub read_buffer_size: Option<usize>,
    pub write_buffer_size: Option<usize>,
    pub origin_host: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSection {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub redirect_listen: Option<SocketAddr>,
}

impl FileConfig {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }
}

/// Errors that can occur when loading or resolving config.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {}: {}", .0.display(), .1)]
    ReadFailed(PathBuf, std::io::Error),
    #[error("Failed to parse config {}: {}", .0.display(), .1)]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("no preview base URL configured (set --base-url or HUGO_BASE_URL)")]
    MissingBaseUrl,
    #[error("TLS needs both a certificate and a key")]
    IncompleteTls,
}

/// Values supplied on the command line or through the environment.
///
/// Buffer sizes arrive as raw strings so that unusable values fall back to
/// [`DEFAULT_BUFFER_SIZE`] instead of aborting startup.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub listen: Option<SocketAddr>,
    pub base_url: Option<String>,
    pub bind: Option<String>,
    pub source: Option<PathBuf>,
    pub content_root: Option<PathBuf>,
    pub program: Option<String>,
    pub read_buffer_size: Option<String>,
    pub write_buffer_size: Option<String>,
    pub origin_host: Option<String>,
    pub max_sessions: Option<usize>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub redirect_listen: Option<SocketAddr>,
}

/// Options applied to every WebSocket upgrade. Built once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeConfig {
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    /// Expected `host[:port]` of the `Origin` header. Empty disables the check.
    pub origin_host: String,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_BUFFER_SIZE,
            write_buffer_size: DEFAULT_BUFFER_SIZE,
            origin_host: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Fully resolved, immutable server settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub listen: SocketAddr,
    /// Prefix of every preview URL; the session id and `/preview/` follow.
    pub preview_base_url: String,
    pub preview_bind: String,
    pub preview_source: PathBuf,
    /// Directory listed by `reqAllFiles`.
    pub content_root: PathBuf,
    pub preview_command: PreviewCommand,
    pub upgrade: UpgradeConfig,
    pub keepalive: Keepalive,
    pub max_sessions: Option<usize>,
    pub tls: Option<TlsPaths>,
    pub redirect_listen: Option<SocketAddr>,
}

impl Settings {
    /// Settings suitable for tests: no TLS, default timings, local preview.
    pub fn for_base_url(base_url: impl Into<String>) -> Self {
        let source = PathBuf::from(".");
        Self {
            listen: default_listen(),
            preview_base_url: base_url.into(),
            preview_bind: "127.0.0.1".to_string(),
            content_root: source.join("content"),
            preview_source: source,
            preview_command: PreviewCommand::default(),
            upgrade: UpgradeConfig::default(),
            keepalive: Keepalive::default(),
            max_sessions: None,
            tls: None,
            redirect_listen: None,
        }
    }

    /// Merge overrides on top of the file config.
    pub fn resolve(overrides: Overrides, file: FileConfig) -> Result<Self, ConfigError> {
        let preview_base_url = overrides
            .base_url
            .or(file.preview.base_url)
            .filter(|url| !url.is_empty())
            .ok_or(ConfigError::MissingBaseUrl)?;

        let preview_source = overrides
            .source
            .or(file.preview.source)
            .unwrap_or_else(|| PathBuf::from("."));
        let content_root = overrides
            .content_root
            .or(file.preview.content_root)
            .unwrap_or_else(|| preview_source.join("content"));

        let mut preview_command = PreviewCommand::default();
        if let Some(program) = overrides.program.or(file.preview.program) {
            preview_command.program = program;
        }
        if let Some(args) = file.preview.args {
            preview_command.args = args;
        }

        let read_buffer_size = match overrides.read_buffer_size {
            Some(raw) => parse_buffer_size(Some(&raw)),
            None => file.websocket.read_buffer_size.filter(|n| *n > 0).unwrap_or(DEFAULT_BUFFER_SIZE),
        };
        let write_buffer_size = match overrides.write_buffer_size {
            Some(raw) => parse_buffer_size(Some(&raw)),
            None => file.websocket.write_buffer_size.filter(|n| *n > 0).unwrap_or(DEFAULT_BUFFER_SIZE),
        };

        let file_tls = file.tls;
        let tls = match (
            overrides.tls_cert.or_else(|| file_tls.as_ref().map(|t| t.cert.clone())),
            overrides.tls_key.or_else(|| file_tls.as_ref().map(|t| t.key.clone())),
        ) {
            (Some(cert), Some(key)) => Some(TlsPaths { cert, key }),
            (None, None) => None,
            _ => return Err(ConfigError::IncompleteTls),
        };
        let redirect_listen = overrides
            .redirect_listen
            .or_else(|| file_tls.as_ref().and_then(|t| t.redirect_listen));

        let listen = overrides
            .listen
            .or(file.listen)
            .unwrap_or_else(default_listen);

        Ok(Self {
            listen,
            preview_base_url,
            preview_bind: overrides
                .bind
                .or(file.preview.bind)
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            preview_source,
            content_root,
            preview_command,
            upgrade: UpgradeConfig {
                read_buffer_size,
                write_buffer_size,
                origin_host: overrides
                    .origin_host
                    .or(file.websocket.origin_host)
                    .unwrap_or_default(),
            },
            keepalive: Keepalive::default(),
            max_sessions: overrides.max_sessions.or(file.max_sessions),
            tls,
            redirect_listen,
        })
    }
}

/// Parse a buffer size, falling back to [`DEFAULT_BUFFER_SIZE`] when the
/// value is missing, not a number, or zero.
pub fn parse_buffer_size(raw: Option<&str>) -> usize {
    match raw.map(str::trim) {
        None | Some("") => DEFAULT_BUFFER_SIZE,
        Some(value) => match value.parse::<usize>() {
            Ok(n) if n > 0 => n,
            _ => {
                tracing::warn!(value, default = DEFAULT_BUFFER_SIZE, "invalid buffer size, using default");
                DEFAULT_BUFFER_SIZE
            }
        },
    }
}

/// Check file permissions on a config file and warn if world-readable.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };

    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "Config file {} is world-readable (mode {:o}). \
             It may reveal deployment paths -- consider restricting permissions to 600.",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

/// Returns true if the given file mode has the world-readable bit set.
#[cfg(unix)]
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}
