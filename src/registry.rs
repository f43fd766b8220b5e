//! The connection registry.
//!
//! A single task owns the set of admitted sessions. Admissions and removals
//! arrive over an mpsc channel and are applied one at a time, so the set is
//! never touched concurrently and all mutations are totally ordered.

use std::collections::{HashMap, HashSet};
use std::ops::RangeInclusive;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::session::{Outbound, Outbox};

/// Session ids double as preview ports, so they are drawn from this range.
pub const DEFAULT_ID_RANGE: RangeInclusive<u16> = 2000..=9999;

const COMMAND_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("maximum number of sessions reached ({0})")]
    MaxSessionsReached(usize),
    #[error("no free session id in {0:?}")]
    IdsExhausted(RangeInclusive<u16>),
    #[error("registry task is not running")]
    Closed,
}

/// Identifies one admission. Never reused, unlike the session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey(u64);

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What the registry hands back to an admitted session.
#[derive(Debug, Clone)]
pub struct Admission {
    pub key: SessionKey,
    pub id: String,
    pub preview_url: String,
}

/// Build the preview URL for a session id.
pub fn preview_url(base_url: &str, id: &str) -> String {
    format!("{base_url}{id}/preview/")
}

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub preview_base_url: String,
    pub max_sessions: Option<usize>,
    pub id_range: RangeInclusive<u16>,
}

impl RegistryOptions {
    pub fn new(preview_base_url: impl Into<String>) -> Self {
        Self {
            preview_base_url: preview_base_url.into(),
            max_sessions: None,
            id_range: DEFAULT_ID_RANGE,
        }
    }
}

enum RegistryCommand {
    Admit {
        outbox: Outbox,
        respond_to: oneshot::Sender<Result<Admission, RegistryError>>,
    },
    Remove {
        key: SessionKey,
        respond_to: oneshot::Sender<bool>,
    },
    Ids {
        respond_to: oneshot::Sender<Vec<String>>,
    },
    Len {
        respond_to: oneshot::Sender<usize>,
    },
}

/// Handle to the registry task. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionRegistry {
    tx: mpsc::Sender<RegistryCommand>,
}

impl ConnectionRegistry {
    /// Spawn the registry task. It runs until every handle is dropped.
    pub fn spawn(options: RegistryOptions) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let actor = RegistryActor::new(rx, options);
        tokio::spawn(actor.run());
        Self { tx }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Option<T> {
        let (respond_to, rx) = oneshot::channel();
        self.tx.send(make(respond_to)).await.ok()?;
        rx.await.ok()
    }

    /// Admit a session whose frames go to `outbox`.
    ///
    /// The preview URL is pushed onto the outbox before this returns, so it
    /// is always the first frame the peer sees.
    pub async fn admit(&self, outbox: Outbox) -> Result<Admission, RegistryError> {
        self.request(|respond_to| RegistryCommand::Admit { outbox, respond_to })
            .await
            .unwrap_or(Err(RegistryError::Closed))
    }

    /// Remove a session and close its outbox.
    ///
    /// Returns `false` if the session was not registered, which makes
    /// repeated removal harmless.
    pub async fn remove(&self, key: SessionKey) -> bool {
        self.request(|respond_to| RegistryCommand::Remove { key, respond_to })
            .await
            .unwrap_or(false)
    }

    /// Ids of the currently admitted sessions, sorted.
    pub async fn ids(&self) -> Vec<String> {
        self.request(|respond_to| RegistryCommand::Ids { respond_to })
            .await
            .unwrap_or_default()
    }

    pub async fn len(&self) -> usize {
        self.request(|respond_to| RegistryCommand::Len { respond_to })
            .await
            .unwrap_or(0)
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

struct Entry {
    id: u16,
    outbox: Outbox,
}

struct RegistryActor {
    receiver: mpsc::Receiver<RegistryCommand>,
    sessions: HashMap<SessionKey, Entry>,
    ids_in_use: HashSet<u16>,
    next_key: u64,
    cursor: u16,
    options: RegistryOptions,
}

impl RegistryActor {
    fn new(receiver: mpsc::Receiver<RegistryCommand>, options: RegistryOptions) -> Self {
        Self {
            receiver,
            sessions: HashMap::new(),
            ids_in_use: HashSet::new(),
            next_key: 0,
            cursor: *options.id_range.start(),
            options,
        }
    }

    async fn run(mut self) {
        tracing::debug!("connection registry started");
        while let Some(cmd) = self.receiver.recv().await {
            match cmd {
                RegistryCommand::Admit { outbox, respond_to } => {
                    let result = self.admit(outbox);
                    let _ = respond_to.send(result);
                }
                RegistryCommand::Remove { key, respond_to } => {
                    let removed = self.remove(key);
                    let _ = respond_to.send(removed);
                }
                RegistryCommand::Ids { respond_to } => {
                    let mut ids: Vec<u16> = self.sessions.values().map(|e| e.id).collect();
                    ids.sort_unstable();
                    let _ = respond_to.send(ids.into_iter().map(|id| id.to_string()).collect());
                }
                RegistryCommand::Len { respond_to } => {
                    let _ = respond_to.send(self.sessions.len());
                }
            }
        }
        // Every handle is gone; close whatever is still registered.
        for (_, entry) in self.sessions.drain() {
            entry.outbox.close();
        }
        tracing::debug!("connection registry stopped");
    }

    fn admit(&mut self, outbox: Outbox) -> Result<Admission, RegistryError> {
        if let Some(max) = self.options.max_sessions {
            if self.sessions.len() >= max {
                tracing::warn!(sessions = self.sessions.len(), max, "registry full, rejecting connection");
                return Err(RegistryError::MaxSessionsReached(max));
            }
        }

        let id = self.allocate_id()?;
        let key = SessionKey(self.next_key);
        self.next_key += 1;

        let id_str = id.to_string();
        let url = preview_url(&self.options.preview_base_url, &id_str);
        if !outbox.try_send(Outbound::PreviewUrl(url.clone())) {
            tracing::warn!(id = %id_str, "could not queue preview url for new session");
        }

        self.ids_in_use.insert(id);
        self.sessions.insert(key, Entry { id, outbox });
        tracing::info!(id = %id_str, %key, sessions = self.sessions.len(), "session admitted");

        Ok(Admission {
            key,
            id: id_str,
            preview_url: url,
        })
    }

    fn remove(&mut self, key: SessionKey) -> bool {
        match self.sessions.remove(&key) {
            Some(entry) => {
                self.ids_in_use.remove(&entry.id);
                entry.outbox.close();
                tracing::info!(id = entry.id, %key, sessions = self.sessions.len(), "session removed");
                true
            }
            None => false,
        }
    }

    /// Next free id at or after the cursor, wrapping around the range.
    fn allocate_id(&mut self) -> Result<u16, RegistryError> {
        let (start, end) = (*self.options.id_range.start(), *self.options.id_range.end());
        let span = u32::from(end.saturating_sub(start)) + 1;
        let mut candidate = self.cursor;
        for _ in 0..span {
            let next = if candidate >= end { start } else { candidate + 1 };
            if !self.ids_in_use.contains(&candidate) {
                self.cursor = next;
                return Ok(candidate);
            }
            candidate = next;
        }
        Err(RegistryError::IdsExhausted(self.options.id_range.clone()))
    }
}
