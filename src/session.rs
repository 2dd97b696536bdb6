//! Per-user sessions and the registry that maps users to them
//!
//! The registry has a two-phase lifecycle enforced by types:
//! - [`RegistryBuilder`] is filled during startup, one insertion per user
//! - [`SessionRegistry`] is the frozen result; it has no mutating methods and
//!   is what the proxy server and the shutdown path receive
//!
//! Because the proxy can only be constructed from a frozen registry, no
//! request is routed before startup has finished.

use crate::error::GateError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};

/// Cancellation handle for one backend process
///
/// `terminate` asks the task that owns the child to kill it. Only the first
/// call has an effect; later calls are no-ops and return `false`.
pub struct ProcessHandle {
    pid: Option<u32>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    exited_rx: watch::Receiver<bool>,
}

/// The side of a [`ProcessHandle`] held by the task that owns the child
pub struct ProcessControl {
    /// Resolves with `Ok(())` when termination was requested
    pub kill_rx: oneshot::Receiver<()>,
    exited_tx: watch::Sender<bool>,
}

impl ProcessControl {
    /// Report that the child is gone
    pub fn mark_exited(&self) {
        let _ = self.exited_tx.send(true);
    }
}

impl ProcessHandle {
    /// Create a connected handle/control pair for a spawned child
    pub fn new(pid: Option<u32>) -> (Self, ProcessControl) {
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(false);
        (
            Self {
                pid,
                kill_tx: Mutex::new(Some(kill_tx)),
                exited_rx,
            },
            ProcessControl { kill_rx, exited_tx },
        )
    }

    /// A handle with no process behind it (launch failed before spawn)
    pub fn inert() -> Self {
        let (_exited_tx, exited_rx) = watch::channel(true);
        Self {
            pid: None,
            kill_tx: Mutex::new(None),
            exited_rx,
        }
    }

    /// Request termination. Returns `true` only for the call that actually
    /// delivered the request.
    pub fn terminate(&self) -> bool {
        let sender = self.kill_tx.lock().take();
        match sender {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Whether terminate has been called (or there was never a process)
    pub fn is_terminated(&self) -> bool {
        self.kill_tx.lock().is_none()
    }

    /// Whether the child has exited
    pub fn has_exited(&self) -> bool {
        *self.exited_rx.borrow()
    }

    /// Wait until the owning task reports the child gone
    pub async fn wait_exited(&self) {
        let mut rx = self.exited_rx.clone();
        // A dropped sender means the owning task is gone too
        let _ = rx.wait_for(|exited| *exited).await;
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("terminated", &self.is_terminated())
            .field("exited", &self.has_exited())
            .finish()
    }
}

/// One user's backend: where it listens, its own access token, and the
/// handle to stop it
pub struct Session {
    pub user: String,
    pub port: u16,
    pub token: String,
    pub process: ProcessHandle,
}

impl Session {
    pub fn new(user: impl Into<String>, port: u16, token: impl Into<String>, process: ProcessHandle) -> Self {
        Self {
            user: user.into(),
            port,
            token: token.into(),
            process,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user", &self.user)
            .field("port", &self.port)
            .field("token", &"<redacted>")
            .field("process", &self.process)
            .finish()
    }
}

/// Startup-phase registry: insert only
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    sessions: Vec<Arc<Session>>,
    index: HashMap<String, usize>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. A second session for the same user is an error.
    pub fn insert(&mut self, session: Session) -> Result<(), GateError> {
        if self.index.contains_key(&session.user) {
            return Err(GateError::DuplicateSession(session.user));
        }
        self.index.insert(session.user.clone(), self.sessions.len());
        self.sessions.push(Arc::new(session));
        Ok(())
    }

    /// Number of sessions registered so far (the next user's ordinal)
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// End the startup phase
    pub fn freeze(self) -> SessionRegistry {
        SessionRegistry {
            sessions: self.sessions,
            index: self.index,
        }
    }
}

/// Frozen user → session map, read-only while serving
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: Vec<Arc<Session>>,
    index: HashMap<String, usize>,
}

impl SessionRegistry {
    pub fn get(&self, user: &str) -> Option<Arc<Session>> {
        self.index.get(user).map(|&i| Arc::clone(&self.sessions[i]))
    }

    /// Sessions in registration order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Session>> {
        self.sessions.iter()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
