#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cms_backend::api::{self, AppState};
use cms_backend::config::Settings;
use cms_backend::preview::PreviewCommand;
use cms_backend::shutdown::ShutdownCoordinator;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

pub const BASE_URL: &str = "http://preview.test/";

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A server bound to a random local port, with a throwaway site directory.
pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    pub shutdown: ShutdownCoordinator,
    pub site: tempfile::TempDir,
}

impl TestServer {
    pub fn socket_url(&self) -> String {
        format!("ws://{}/socket", self.addr)
    }

    /// File the preview stand-in appends its pid to on every launch.
    pub fn spawned_log(&self) -> PathBuf {
        self.site.path().join("spawned")
    }

    /// File the preview stand-in writes to when interrupted.
    pub fn stopped_log(&self) -> PathBuf {
        self.site.path().join("stopped")
    }

    pub async fn session_count(&self) -> usize {
        self.state.registry.len().await
    }
}

/// A preview stand-in that records its launch in `{source}/spawned`, and
/// its interruption in `{source}/stopped`.
pub fn recording_command() -> PreviewCommand {
    PreviewCommand {
        program: "sh".to_string(),
        args: vec![
            "-c".to_string(),
            "echo $$ >> \"$0/spawned\"; \
             trap 'echo $$ >> \"$0/stopped\"; exit 0' INT; \
             while :; do sleep 0.05; done"
                .to_string(),
            "{source}".to_string(),
        ],
    }
}

/// Start a server; `configure` may adjust settings before it binds.
pub async fn start_server(configure: impl FnOnce(&mut Settings)) -> TestServer {
    let site = tempfile::tempdir().unwrap();
    let content = site.path().join("content");
    std::fs::create_dir_all(content.join("posts")).unwrap();
    std::fs::write(content.join("_index.md"), "---\ntitle: Home\n---\n").unwrap();
    std::fs::write(content.join("posts").join("hello.md"), "# Hello").unwrap();

    let mut settings = Settings::for_base_url(BASE_URL);
    settings.preview_source = site.path().to_path_buf();
    settings.content_root = content;
    settings.preview_command = recording_command();
    configure(&mut settings);

    let shutdown = ShutdownCoordinator::new();
    let state = AppState::new(settings, shutdown.clone());
    let app = api::router(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        addr,
        state,
        shutdown,
        site,
    }
}

/// Connect and consume the preview URL pushed on admission.
pub async fn connect(server: &TestServer) -> (Client, String) {
    let (mut ws, _) = connect_async(server.socket_url()).await.unwrap();
    let preview_url = recv_text(&mut ws).await.expect("no preview url pushed");
    (ws, preview_url)
}

/// Next text frame, skipping control frames. `None` once the connection is
/// closed.
pub async fn recv_text(ws: &mut Client) -> Option<String> {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for message");
        match msg {
            Some(Ok(Message::Text(text))) => return Some(text.to_string()),
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(other)) => panic!("unexpected frame {:?}", other),
        }
    }
}

/// Next text frame if one arrives within `wait`.
pub async fn try_recv_text(ws: &mut Client, wait: Duration) -> Option<String> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let msg = tokio::time::timeout_at(deadline, ws.next()).await.ok()??;
        match msg {
            Ok(Message::Text(text)) => return Some(text.to_string()),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            _ => return None,
        }
    }
}

/// Send `{"action": action, "payload": {}}` and parse the reply.
pub async fn request(ws: &mut Client, action: &str) -> serde_json::Value {
    let frame = serde_json::json!({ "action": action, "payload": {} }).to_string();
    ws.send(Message::Text(frame.into())).await.unwrap();
    let reply = recv_text(ws).await.expect("connection closed before reply");
    serde_json::from_str(&reply).expect("reply is not JSON")
}

/// Read until the server closes the connection. Returns the close reason
/// if a close frame was received.
pub async fn wait_closed(ws: &mut Client, wait: Duration) -> Option<String> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let msg = tokio::time::timeout_at(deadline, ws.next())
            .await
            .expect("connection was not closed in time");
        match msg {
            Some(Ok(Message::Close(frame))) => {
                return frame.map(|f| f.reason.to_string());
            }
            Some(Ok(_)) => continue,
            None | Some(Err(_)) => return None,
        }
    }
}

/// Poll until `path` exists and has at least `lines` lines.
pub async fn wait_for_lines(path: &Path, lines: usize, wait: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + wait;
    while tokio::time::Instant::now() < deadline {
        if let Ok(contents) = std::fs::read_to_string(path) {
            if contents.lines().count() >= lines {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

pub fn line_count(path: &Path) -> usize {
    std::fs::read_to_string(path)
        .map(|c| c.lines().count())
        .unwrap_or(0)
}

/// Poll the registry until it holds `n` sessions.
pub async fn wait_for_sessions(server: &TestServer, n: usize, wait: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + wait;
    while tokio::time::Instant::now() < deadline {
        if server.session_count().await == n {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
