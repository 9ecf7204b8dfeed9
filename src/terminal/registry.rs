use crate::config::{Config, SupersedePolicy};
use crate::error::AppError;
use crate::terminal::pty_process::{PtyProcess, ShellCommand};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::Mutex as TokioMutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub type SessionId = Uuid;

/// A shell bound to the directory it was started in.
#[derive(Debug)]
pub struct TerminalSession {
    id: SessionId,
    bound_directory: PathBuf,
    process: PtyProcess,
    created_at: DateTime<Utc>,
    started: Instant,
    exec_lock: TokioMutex<()>,
}

impl TerminalSession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn bound_directory(&self) -> &Path {
        &self.bound_directory
    }

    pub fn process(&self) -> &PtyProcess {
        &self.process
    }

    /// Serialises `/execute` calls on this session.
    pub async fn lock_exec(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.exec_lock.lock().await
    }

    fn info(&self, active: bool) -> SessionInfo {
        SessionInfo {
            session_id: self.id.to_string(),
            cwd: self.bound_directory.display().to_string(),
            pid: self.process.pid(),
            active,
            exited: self.process.has_exited(),
            exit_code: self.process.exit_code(),
            created_at: self.created_at.to_rfc3339(),
            runtime_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub cwd: String,
    pub pid: Option<u32>,
    pub active: bool,
    pub exited: bool,
    pub exit_code: Option<u32>,
    pub created_at: String,
    pub runtime_ms: u64,
}

#[derive(Debug, Default)]
struct RegistryState {
    sessions: HashMap<SessionId, Arc<TerminalSession>>,
    active: Option<SessionId>,
}

/// Owns every live terminal session and the single "active" designation.
///
/// The newest session becomes active. Older sessions stay alive under
/// [`SupersedePolicy::Detach`] until their own connection closes them.
#[derive(Debug)]
pub struct SessionRegistry {
    shell: ShellCommand,
    cols: u16,
    rows: u16,
    policy: SupersedePolicy,
    state: StdMutex<RegistryState>,
}

impl SessionRegistry {
    pub fn new(config: &Config) -> Self {
        Self {
            shell: ShellCommand::from_config(config),
            cols: config.terminal_cols,
            rows: config.terminal_rows,
            policy: config.supersede_policy,
            state: StdMutex::new(RegistryState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns a shell in `cwd` and makes it the active session.
    ///
    /// On failure the active pointer is left as it was.
    #[instrument(skip(self), fields(cwd = %cwd.display()))]
    pub fn create_session(&self, cwd: &Path) -> Result<Arc<TerminalSession>, AppError> {
        let process = PtyProcess::spawn(&self.shell, cwd, self.cols, self.rows).map_err(|e| {
            warn!(error = %e, "Failed to spawn terminal session");
            e
        })?;

        let session = Arc::new(TerminalSession {
            id: Uuid::new_v4(),
            bound_directory: cwd.to_path_buf(),
            process,
            created_at: Utc::now(),
            started: Instant::now(),
            exec_lock: TokioMutex::new(()),
        });

        let superseded = {
            let mut state = self.state();
            state.sessions.insert(session.id, Arc::clone(&session));
            let previous = state.active.replace(session.id);
            match (previous, self.policy) {
                (Some(prev), SupersedePolicy::Kill) => state.sessions.remove(&prev),
                _ => None,
            }
        };

        if let Some(prev) = superseded {
            info!(session_id = %prev.id, "Killing superseded terminal session");
            prev.process.kill();
        }

        info!(
            session_id = %session.id,
            pid = ?session.process.pid(),
            "Terminal session created and marked active"
        );
        Ok(session)
    }

    /// Kills the session's process and forgets it. Clears the active pointer only
    /// when it still designates this session. Safe to call more than once.
    #[instrument(skip(self, session), fields(session_id = %session.id))]
    pub fn close_session(&self, session: &TerminalSession) {
        session.process.kill();
        let mut state = self.state();
        let removed = state.sessions.remove(&session.id).is_some();
        if state.active == Some(session.id) {
            state.active = None;
            info!("Active terminal session closed");
        } else if removed {
            info!("Detached terminal session closed");
        }
    }

    pub fn active(&self) -> Option<Arc<TerminalSession>> {
        let state = self.state();
        state.active.and_then(|id| state.sessions.get(&id).cloned())
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let state = self.state();
        let mut sessions: Vec<SessionInfo> = state
            .sessions
            .values()
            .map(|session| session.info(state.active == Some(session.id)))
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    /// Kills the active session and clears the pointer. Returns whether one existed.
    #[instrument(skip(self))]
    pub fn terminate_active(&self) -> bool {
        let session = {
            let mut state = self.state();
            match state.active.take() {
                Some(id) => state.sessions.remove(&id),
                None => None,
            }
        };
        match session {
            Some(session) => {
                info!(session_id = %session.id, "Terminating active terminal session");
                session.process.kill();
                true
            }
            None => false,
        }
    }

    /// Kills every session, active or detached.
    pub fn shutdown(&self) {
        let sessions: Vec<Arc<TerminalSession>> = {
            let mut state = self.state();
            state.active = None;
            state.sessions.drain().map(|(_, s)| s).collect()
        };
        info!(count = sessions.len(), "Shutting down terminal sessions");
        for session in sessions {
            session.process.kill();
        }
    }
}
