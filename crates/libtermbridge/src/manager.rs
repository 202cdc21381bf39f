//! Session lifecycle verbs. The manager owns the registry, drives the PTY
//! driver, and reports lifecycle events to the cloud through a narrow
//! messenger capability.

use crate::error::Result;
use crate::pty::{self, ExitFn, OutputFn};
use crate::registry::{Registry, Session};
use chrono::{SecondsFormat, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use termbridge_protocol::{AgentEvent, SessionId, SessionInfo};
use tracing::{info, warn};
use uuid::Uuid;

/// Outbound capability handed to the manager: queue one JSON message for
/// the cloud. Implemented by the cloud link.
pub trait Messenger: Send + Sync {
    fn send_json(&self, payload: serde_json::Value) -> Result<()>;
}

/// How long `stop_all` waits for children to exit before escalating to a
/// forced kill.
const STOP_ALL_GRACE: std::time::Duration = std::time::Duration::from_secs(2);

pub struct SessionManager {
    registry: Arc<Registry>,
    messenger: Arc<dyn Messenger>,
}

impl SessionManager {
    pub fn new(messenger: Arc<dyn Messenger>) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            messenger,
        }
    }

    /// Spawn a new session and emit `session_started`. The request id is
    /// only used for log correlation; crash reporting for failed starts is
    /// the dispatcher's job. Empty command and workdir fall back to the
    /// defaults `claude` and `.`.
    pub fn start(
        &self,
        request_id: &str,
        command: &str,
        workdir: &str,
        env: HashMap<String, String>,
    ) -> Result<SessionId> {
        let command = if command.is_empty() { "claude" } else { command };
        let workdir = if workdir.is_empty() { "." } else { workdir };
        let session_id = Uuid::new_v4().to_string();

        info!(%session_id, request_id, command, workdir, "starting session");

        let output_messenger = Arc::clone(&self.messenger);
        let on_output: OutputFn = Box::new(move |sid, data| {
            emit(
                output_messenger.as_ref(),
                AgentEvent::SessionOutput {
                    session_id: sid.to_string(),
                    data,
                },
            );
        });

        let exit_messenger = Arc::clone(&self.messenger);
        let exit_registry = Arc::clone(&self.registry);
        let on_exit: ExitFn = Box::new(move |sid, exit_code, error| {
            info!(session_id = sid, exit_code, ?error, "session exited");
            exit_registry.remove(sid);
            let event = match error {
                Some(error) => AgentEvent::SessionCrashed {
                    session_id: sid.to_string(),
                    error,
                },
                None => AgentEvent::SessionStopped {
                    session_id: sid.to_string(),
                    exit_code: Some(exit_code),
                },
            };
            emit(exit_messenger.as_ref(), event);
        });

        let (io, pid) = pty::spawn(&session_id, command, workdir, &env, on_output, on_exit)?;

        let session = Arc::new(Session {
            id: session_id.clone(),
            pid,
            process_name: command.to_string(),
            workdir: workdir.to_string(),
            started_at: Utc::now(),
            io,
        });
        self.registry.add(Arc::clone(&session));

        self.emit(AgentEvent::SessionStarted {
            session: SessionInfo {
                id: session_id.clone(),
                pid,
                process_name: session.process_name.clone(),
                workdir: session.workdir.clone(),
                started_at: session
                    .started_at
                    .to_rfc3339_opts(SecondsFormat::Secs, true),
            },
        });

        Ok(session_id)
    }

    /// Request termination. Removal from the registry happens on the reaper
    /// path once the child actually exits.
    pub fn stop(&self, session_id: &str, force: bool) -> Result<()> {
        let session = self.registry.get(session_id)?;
        info!(session_id, force, "stopping session");
        session.io.stop(force)
    }

    pub fn pause(&self, session_id: &str) -> Result<()> {
        let session = self.registry.get(session_id)?;
        info!(session_id, "pausing session");
        session.io.pause()
    }

    pub fn resume(&self, session_id: &str) -> Result<()> {
        let session = self.registry.get(session_id)?;
        info!(session_id, "resuming session");
        session.io.resume()
    }

    /// Forward base64-encoded input bytes to the session's terminal.
    pub fn write_input(&self, session_id: &str, data: &str) -> Result<()> {
        let session = self.registry.get(session_id)?;
        session.io.write_input(data)
    }

    pub fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<()> {
        let session = self.registry.get(session_id)?;
        session.io.resize(cols, rows)
    }

    pub fn count(&self) -> usize {
        self.registry.count()
    }

    pub fn snapshot_ids(&self) -> Vec<SessionId> {
        self.registry
            .snapshot()
            .into_iter()
            .map(|s| s.id.clone())
            .collect()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Graceful stop of every live session, with a forced kill fallback for
    /// children that ignore the terminate signal (interactive shells do).
    /// Blocks up to the grace period; called once, on supervisor shutdown.
    pub fn stop_all(&self) {
        for session in self.registry.snapshot() {
            info!(session_id = %session.id, "stopping session on shutdown");
            if session.io.stop(false).is_err() {
                let _ = session.io.stop(true);
            }
        }

        let deadline = std::time::Instant::now() + STOP_ALL_GRACE;
        while self.registry.count() > 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(50));
        }

        for session in self.registry.snapshot() {
            info!(session_id = %session.id, "session did not exit, killing");
            let _ = session.io.stop(true);
            session.io.close();
        }
    }

    fn emit(&self, event: AgentEvent) {
        emit(self.messenger.as_ref(), event);
    }
}

/// Serialise and queue one event; send failures are logged and suppressed.
fn emit(messenger: &dyn Messenger, event: AgentEvent) {
    match serde_json::to_value(&event) {
        Ok(value) => {
            if let Err(err) = messenger.send_json(value) {
                warn!(%err, "failed to send event");
            }
        }
        Err(err) => warn!(%err, "failed to encode event"),
    }
}
