//! Supervision of the per-session preview process.
//!
//! Each session owns one [`PreviewProcess`]. Starting it spawns the configured
//! preview program (Hugo by default) on the session's port in a background
//! task that lives exactly as long as the child does. Stopping it sends
//! SIGINT to the recorded pid without waiting for the child to exit.

use std::process::Stdio;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;

#[derive(Error, Debug)]
pub enum PreviewError {
    #[error("failed to spawn preview process `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to signal preview process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("preview process exited before reporting a pid")]
    NoPid,
}

/// Program and argument template used to launch a preview.
///
/// Arguments may contain the placeholders `{base_url}`, `{bind}`, `{port}`
/// and `{source}`, which are substituted per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for PreviewCommand {
    fn default() -> Self {
        Self {
            program: "hugo".to_string(),
            args: [
                "server",
                "--gc",
                "--minify",
                "--baseURL",
                "{base_url}",
                "--bind",
                "{bind}",
                "--port",
                "{port}",
                "--source",
                "{source}",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Session-specific values substituted into a [`PreviewCommand`].
#[derive(Debug, Clone)]
pub struct PreviewTarget {
    /// Public URL the preview is served under.
    pub base_url: String,
    /// Address the preview process binds to.
    pub bind: String,
    /// Port, equal to the session id.
    pub port: String,
    /// Content repository passed to the preview engine.
    pub source: String,
}

impl PreviewCommand {
    /// Expand the argument template for one session.
    pub fn render_args(&self, target: &PreviewTarget) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{base_url}", &target.base_url)
                    .replace("{bind}", &target.bind)
                    .replace("{port}", &target.port)
                    .replace("{source}", &target.source)
            })
            .collect()
    }

    fn build(&self, target: &PreviewTarget) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(self.render_args(target))
            .stdin(Stdio::null())
            .kill_on_drop(false);
        cmd
    }
}

/// Lifecycle of a preview process.
///
/// `Spawning` covers the short window between a start request and the OS
/// returning a pid; callers treat it as running. The generation ties a
/// background task to the start request that created it, so a task outliving
/// a stop/start cycle never clobbers the newer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Stopped,
    Spawning { generation: u64 },
    Running { pid: u32, generation: u64 },
}

impl ProcessState {
    pub fn is_running(&self) -> bool {
        !matches!(self, ProcessState::Stopped)
    }

    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessState::Running { pid, .. } => Some(*pid),
            _ => None,
        }
    }

    fn generation(&self) -> Option<u64> {
        match self {
            ProcessState::Stopped => None,
            ProcessState::Spawning { generation } | ProcessState::Running { generation, .. } => {
                Some(*generation)
            }
        }
    }
}

struct Inner {
    command: PreviewCommand,
    target: PreviewTarget,
    state: watch::Sender<ProcessState>,
    next_generation: std::sync::atomic::AtomicU64,
}

/// Handle to one session's preview process. Cheap to clone.
#[derive(Clone)]
pub struct PreviewProcess {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PreviewProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreviewProcess")
            .field("program", &self.inner.command.program)
            .field("port", &self.inner.target.port)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

impl PreviewProcess {
    pub fn new(command: PreviewCommand, target: PreviewTarget) -> Self {
        let (state, _) = watch::channel(ProcessState::Stopped);
        Self {
            inner: Arc::new(Inner {
                command,
                target,
                state,
                next_generation: std::sync::atomic::AtomicU64::new(1),
            }),
        }
    }

    /// Current state snapshot.
    pub fn state(&self) -> ProcessState {
        *self.inner.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn pid(&self) -> Option<u32> {
        self.state().pid()
    }

    /// Observe state transitions, including the background task's exit.
    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.inner.state.subscribe()
    }

    /// Wait until the supervisor reports `Stopped`.
    pub async fn wait_stopped(&self) {
        let mut rx = self.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|state| !state.is_running()).await;
    }

    /// Launch the preview process in a background task.
    ///
    /// Returns `false` without doing anything when a process is already
    /// spawning or running. The spawned task holds the process for its whole
    /// lifetime and moves the state back to `Stopped` when it exits.
    pub fn start(&self) -> bool {
        let generation = self
            .inner
            .next_generation
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let claimed = self.inner.state.send_if_modified(|state| {
            if state.is_running() {
                return false;
            }
            *state = ProcessState::Spawning { generation };
            true
        });
        if !claimed {
            return false;
        }

        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.run(generation).await {
                tracing::error!(port = %this.inner.target.port, error = %e, "preview process failed");
            }
        });
        true
    }

    async fn run(&self, generation: u64) -> Result<(), PreviewError> {
        let port = &self.inner.target.port;
        let mut child = match self.inner.command.build(&self.inner.target).spawn() {
            Ok(child) => child,
            Err(source) => {
                self.release(generation);
                return Err(PreviewError::Spawn {
                    program: self.inner.command.program.clone(),
                    source,
                });
            }
        };

        let Some(pid) = child.id() else {
            self.release(generation);
            return Err(PreviewError::NoPid);
        };

        let recorded = self.inner.state.send_if_modified(|state| {
            if *state == (ProcessState::Spawning { generation }) {
                *state = ProcessState::Running { pid, generation };
                true
            } else {
                false
            }
        });
        if recorded {
            tracing::info!(id = %port, pid, "starting preview process");
        } else {
            // Stopped while spawning.
            tracing::info!(id = %port, pid, "preview stopped before it came up, interrupting");
            if let Err(e) = interrupt(pid) {
                tracing::warn!(id = %port, pid, error = %e, "failed to interrupt preview process");
            }
        }

        match child.wait().await {
            Ok(status) => tracing::info!(id = %port, pid, %status, "preview process exited"),
            Err(e) => tracing::error!(id = %port, pid, error = %e, "error waiting for preview process"),
        }
        self.release(generation);
        Ok(())
    }

    /// Return to `Stopped` if the state still belongs to `generation`.
    fn release(&self, generation: u64) {
        self.inner.state.send_if_modified(|state| {
            if state.generation() == Some(generation) {
                *state = ProcessState::Stopped;
                true
            } else {
                false
            }
        });
    }

    /// Interrupt the running preview process.
    ///
    /// Returns `false` when nothing was running. The state is cleared to
    /// `Stopped` even if signal delivery fails; the failure is logged.
    pub fn stop(&self) -> bool {
        let mut previous = ProcessState::Stopped;
        self.inner.state.send_if_modified(|state| {
            previous = *state;
            if state.is_running() {
                *state = ProcessState::Stopped;
                true
            } else {
                false
            }
        });

        match previous {
            ProcessState::Stopped => false,
            ProcessState::Spawning { .. } => {
                tracing::debug!(id = %self.inner.target.port, "stop requested while spawning");
                true
            }
            ProcessState::Running { pid, .. } => {
                tracing::info!(id = %self.inner.target.port, pid, "stopping preview process");
                if let Err(e) = interrupt(pid) {
                    tracing::error!(id = %self.inner.target.port, pid, error = %e, "failed to stop preview process");
                }
                true
            }
        }
    }
}

/// Send SIGINT to `pid`.
#[cfg(unix)]
fn interrupt(pid: u32) -> Result<(), PreviewError> {
    let raw = i32::try_from(pid).map_err(|_| PreviewError::Signal {
        pid,
        source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
    })?;
    if raw <= 0 {
        return Err(PreviewError::Signal {
            pid,
            source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
        });
    }
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(raw, libc::SIGINT) };
    if rc == 0 {
        Ok(())
    } else {
        Err(PreviewError::Signal {
            pid,
            source: std::io::Error::last_os_error(),
        })
    }
}

#[cfg(not(unix))]
fn interrupt(pid: u32) -> Result<(), PreviewError> {
    Err(PreviewError::Signal {
        pid,
        source: std::io::Error::from(std::io::ErrorKind::Unsupported),
    })
}
