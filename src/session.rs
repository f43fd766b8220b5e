//! One live editor connection.
//!
//! A [`Session`] ties an admitted WebSocket to its registry entry and its
//! preview process. The socket is split into a reader, which runs on the
//! upgrade task and dispatches requests, and a writer task, which drains the
//! session [`Outbox`] and keeps the peer alive with pings. Whichever side
//! fails first tears the session down.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::api::ws_methods::{self, Response};
use crate::config::Settings;
use crate::preview::{PreviewProcess, PreviewTarget};
use crate::registry::{Admission, ConnectionRegistry, SessionKey};
use crate::shutdown::ShutdownSignal;

/// Frames buffered per session before senders wait on the writer.
pub const OUTBOX_CAPACITY: usize = 32;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("websocket transport error: {0}")]
    Transport(#[from] axum::Error),
    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),
}

/// Keepalive timings for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    /// How long the peer may stay silent before the connection is dropped.
    /// Every pong pushes the deadline out again.
    pub pong_wait: Duration,
    /// Upper bound on a single frame write.
    pub write_wait: Duration,
    /// Interval between pings. Must be shorter than `pong_wait`.
    pub ping_period: Duration,
}

impl Keepalive {
    /// Timings with the ping period derived as 9/10 of `pong_wait`.
    pub fn new(pong_wait: Duration, write_wait: Duration) -> Self {
        Self {
            pong_wait,
            write_wait,
            ping_period: pong_wait * 9 / 10,
        }
    }
}

impl Default for Keepalive {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(10))
    }
}

/// A frame queued for the peer.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Raw preview URL, pushed once right after admission.
    PreviewUrl(String),
    Response(Response),
    /// Close the connection with the given reason.
    Close(String),
}

impl Outbound {
    fn into_message(self) -> Result<Message, serde_json::Error> {
        Ok(match self {
            Outbound::PreviewUrl(url) => Message::Text(url.into()),
            Outbound::Response(response) => Message::Text(serde_json::to_string(&response)?.into()),
            Outbound::Close(reason) => Message::Close(Some(CloseFrame {
                code: close_code::AWAY,
                reason: reason.into(),
            })),
        })
    }
}

/// Sending half of a session's outbound queue.
///
/// Closing is separate from dropping: the registry closes the outbox when it
/// removes the session, while clones may still be held elsewhere. Sends after
/// close report `false` and never block.
#[derive(Clone, Debug)]
pub struct Outbox {
    tx: mpsc::Sender<Outbound>,
    closed: CancellationToken,
}

/// Receiving half of a session's outbound queue, owned by the writer.
pub struct OutboxReceiver {
    rx: mpsc::Receiver<Outbound>,
    closed: CancellationToken,
}

/// Create a bounded outbound queue.
pub fn outbox(capacity: usize) -> (Outbox, OutboxReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    let closed = CancellationToken::new();
    (
        Outbox {
            tx,
            closed: closed.clone(),
        },
        OutboxReceiver { rx, closed },
    )
}

impl Outbox {
    /// Queue a frame, waiting for room. Returns `false` if the session is gone.
    pub async fn send(&self, frame: Outbound) -> bool {
        if self.is_closed() {
            return false;
        }
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => false,
            sent = self.tx.send(frame) => sent.is_ok(),
        }
    }

    /// Queue a frame without waiting. Returns `false` if the session is gone
    /// or the queue is full.
    pub fn try_send(&self, frame: Outbound) -> bool {
        !self.is_closed() && self.tx.try_send(frame).is_ok()
    }

    /// Close the queue. Returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        self.closed.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolve once the queue has been closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

impl OutboxReceiver {
    /// Next queued frame. After close, frames already queued are still
    /// returned in order, then `None`.
    pub async fn recv(&mut self) -> Option<Outbound> {
        tokio::select! {
            biased;
            frame = self.rx.recv() => frame,
            _ = self.closed.cancelled() => self.rx.try_recv().ok(),
        }
    }
}

/// An admitted connection and everything it owns.
pub struct Session {
    pub key: SessionKey,
    pub id: String,
    pub preview_url: String,
    pub preview: PreviewProcess,
    /// Directory listed by `reqAllFiles`.
    pub content_root: PathBuf,
    outbox: Outbox,
    registry: ConnectionRegistry,
    keepalive: Keepalive,
    torn_down: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("preview_url", &self.preview_url)
            .field("preview", &self.preview)
            .finish()
    }
}

impl Session {
    pub fn new(
        admission: Admission,
        outbox: Outbox,
        registry: ConnectionRegistry,
        settings: &Settings,
    ) -> Self {
        let target = PreviewTarget {
            base_url: admission.preview_url.clone(),
            bind: settings.preview_bind.clone(),
            port: admission.id.clone(),
            source: settings.preview_source.to_string_lossy().into_owned(),
        };
        Self {
            key: admission.key,
            preview: PreviewProcess::new(settings.preview_command.clone(), target),
            id: admission.id,
            preview_url: admission.preview_url,
            content_root: settings.content_root.clone(),
            outbox,
            registry,
            keepalive: settings.keepalive,
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Drive the connection until either side gives up, then tear down.
    pub async fn serve(
        self: Arc<Self>,
        socket: WebSocket,
        outbound: OutboxReceiver,
        mut shutdown: ShutdownSignal,
    ) {
        let (sink, mut stream) = socket.split();

        let writer = {
            let session = self.clone();
            tokio::spawn(async move {
                if let Err(e) = session.write_loop(sink, outbound).await {
                    tracing::debug!(id = %session.id, error = %e, "writer stopped");
                }
                session.teardown().await;
            })
        };

        let pong_wait = self.keepalive.pong_wait;
        let mut deadline = Instant::now() + pong_wait;
        loop {
            tokio::select! {
                frame = tokio::time::timeout_at(deadline, stream.next()) => {
                    let msg = match frame {
                        Err(_) => {
                            tracing::info!(id = %self.id, "no pong within {:?}, dropping connection", pong_wait);
                            break;
                        }
                        Ok(None) => break,
                        Ok(Some(Err(e))) => {
                            tracing::debug!(id = %self.id, error = %e, "read error");
                            break;
                        }
                        Ok(Some(Ok(msg))) => msg,
                    };
                    match msg {
                        Message::Text(text) => self.handle_frame(text.as_bytes()).await,
                        Message::Binary(data) => self.handle_frame(&data).await,
                        Message::Pong(_) => deadline = Instant::now() + pong_wait,
                        Message::Ping(_) => {} // answered by the transport
                        Message::Close(_) => break,
                    }
                }
                _ = self.outbox.closed() => break,
                _ = shutdown.triggered() => {
                    tracing::debug!(id = %self.id, "server shutting down, closing session");
                    self.outbox.try_send(Outbound::Close("server shutting down".to_string()));
                    break;
                }
            }
        }

        drop(stream);
        self.teardown().await;
        if let Err(e) = writer.await {
            tracing::error!(id = %self.id, error = %e, "writer task failed");
        }
    }

    async fn handle_frame(&self, raw: &[u8]) {
        if let Some(response) = ws_methods::dispatch(raw, self).await {
            self.outbox.send(Outbound::Response(response)).await;
        }
    }

    async fn write_loop(
        &self,
        mut sink: SplitSink<WebSocket, Message>,
        mut outbound: OutboxReceiver,
    ) -> Result<(), SessionError> {
        let period = self.keepalive.ping_period;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                frame = outbound.recv() => {
                    let Some(frame) = frame else {
                        let close = Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: "".into(),
                        }));
                        let _ = self.write(&mut sink, close).await;
                        return Ok(());
                    };
                    let closing = matches!(frame, Outbound::Close(_));
                    let msg = match frame.into_message() {
                        Ok(msg) => msg,
                        Err(e) => {
                            tracing::error!(id = %self.id, error = %e, "failed to encode outbound frame");
                            continue;
                        }
                    };
                    self.write(&mut sink, msg).await?;
                    if closing {
                        return Ok(());
                    }
                }
                _ = ticker.tick() => {
                    self.write(&mut sink, Message::Ping(Bytes::new())).await?;
                }
            }
        }
    }

    async fn write(
        &self,
        sink: &mut SplitSink<WebSocket, Message>,
        msg: Message,
    ) -> Result<(), SessionError> {
        let wait = self.keepalive.write_wait;
        match tokio::time::timeout(wait, sink.send(msg)).await {
            Ok(result) => result.map_err(SessionError::from),
            Err(_) => Err(SessionError::WriteTimeout(wait)),
        }
    }

    /// Stop the preview and unregister. Safe to call from both loops; only
    /// the first call does anything.
    pub async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.preview.stop();
        self.registry.remove(self.key).await;
        tracing::debug!(id = %self.id, "session torn down");
    }
}
