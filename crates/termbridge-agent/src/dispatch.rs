//! Routes inbound cloud commands to session manager verbs. One consumer,
//! processing frames in arrival order; a bad message is logged and dropped
//! so it can never take the agent down.

use crate::link::Frame;
use libtermbridge::{Messenger, SessionManager};
use std::sync::Arc;
use termbridge_protocol::{is_known_command, AgentEvent, CloudCommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub async fn run(
    mut inbound: mpsc::Receiver<Frame>,
    manager: Arc<SessionManager>,
    link: Arc<dyn Messenger>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = inbound.recv() => {
                let Some(frame) = frame else { break };
                handle(&frame, &manager, link.as_ref());
            }
        }
    }
    debug!("dispatcher stopped");
}

fn handle(frame: &Frame, manager: &SessionManager, link: &dyn Messenger) {
    debug!(msg_type = %frame.msg_type, "handling message");

    if !is_known_command(&frame.msg_type) {
        warn!(msg_type = %frame.msg_type, "unknown message type");
        return;
    }

    let command: CloudCommand = match serde_json::from_str(&frame.raw) {
        Ok(command) => command,
        Err(err) => {
            error!(%err, msg_type = %frame.msg_type, "failed to parse command");
            return;
        }
    };

    match command {
        CloudCommand::StartSession {
            request_id,
            mut command,
            mut workdir,
            env,
        } => {
            if command.is_empty() {
                command = "claude".to_string();
            }
            if workdir.is_empty() {
                workdir = ".".to_string();
            }
            info!(%request_id, %command, %workdir, "start_session");

            match manager.start(&request_id, &command, &workdir, env) {
                Ok(session_id) => info!(%session_id, "session started"),
                Err(err) => {
                    error!(%err, %request_id, "start_session failed");
                    // Crash notification carries the request id so the cloud
                    // can correlate the failure with its request.
                    let crashed = AgentEvent::SessionCrashed {
                        session_id: request_id,
                        error: err.to_string(),
                    };
                    if let Ok(value) = serde_json::to_value(&crashed) {
                        let _ = link.send_json(value);
                    }
                }
            }
        }

        CloudCommand::StopSession { session_id, force } => {
            info!(%session_id, force, "stop_session");
            if let Err(err) = manager.stop(&session_id, force) {
                warn!(%err, %session_id, "stop_session failed");
            }
        }

        CloudCommand::PauseSession { session_id } => {
            info!(%session_id, "pause_session");
            if let Err(err) = manager.pause(&session_id) {
                warn!(%err, %session_id, "pause_session failed");
            }
        }

        CloudCommand::ResumeSession { session_id } => {
            info!(%session_id, "resume_session");
            if let Err(err) = manager.resume(&session_id) {
                warn!(%err, %session_id, "resume_session failed");
            }
        }

        CloudCommand::SessionInput { session_id, data } => {
            if let Err(err) = manager.write_input(&session_id, &data) {
                warn!(%err, %session_id, "session_input write failed");
            }
        }

        CloudCommand::Resize {
            session_id,
            cols,
            rows,
        } => {
            debug!(%session_id, cols, rows, "resize");
            if let Err(err) = manager.resize(&session_id, cols, rows) {
                warn!(%err, %session_id, "resize failed");
            }
        }

        CloudCommand::Ping => {
            debug!("ping received");
            // Minimal heartbeat, the pong-equivalent the cloud expects.
            if let Err(err) = link.send_json(serde_json::json!({"type": "heartbeat"})) {
                warn!(%err, "ping reply failed");
            }
        }
    }
}
