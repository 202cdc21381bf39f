use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unique identifier for a session.
pub type SessionId = String;

/// Capacity of the outbound cloud link queue. Messages enqueued beyond this
/// are dropped, newest first.
pub const SEND_QUEUE_CAPACITY: usize = 256;

/// Cloud-to-agent commands, distinguished by the `type` field of the
/// envelope. Field names are camelCase on the wire.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum CloudCommand {
    StartSession {
        request_id: String,
        #[serde(default)]
        command: String,
        #[serde(default)]
        workdir: String,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    StopSession {
        session_id: SessionId,
        #[serde(default)]
        force: bool,
    },
    PauseSession {
        session_id: SessionId,
    },
    ResumeSession {
        session_id: SessionId,
    },
    SessionInput {
        session_id: SessionId,
        /// Base64-encoded raw terminal input.
        data: String,
    },
    Resize {
        session_id: SessionId,
        cols: u16,
        rows: u16,
    },
    Ping,
}

/// The `type` values the dispatcher recognises. Anything else is logged
/// and ignored.
pub const COMMAND_TYPES: &[&str] = &[
    "start_session",
    "stop_session",
    "pause_session",
    "resume_session",
    "session_input",
    "resize",
    "ping",
];

pub fn is_known_command(msg_type: &str) -> bool {
    COMMAND_TYPES.contains(&msg_type)
}

/// Agent-to-cloud messages.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AgentEvent {
    Register {
        machine_id: String,
        name: String,
        os: String,
        hostname: String,
        version: String,
    },
    Heartbeat {
        machine_id: String,
        cpu: f64,
        memory: f64,
        disk: f64,
        session_count: usize,
    },
    SessionStarted {
        session: SessionInfo,
    },
    SessionStopped {
        session_id: SessionId,
        exit_code: Option<i32>,
    },
    SessionCrashed {
        session_id: SessionId,
        error: String,
    },
    SessionOutput {
        session_id: SessionId,
        /// Base64-encoded terminal output chunk.
        data: String,
    },
    /// Sent after each reconnect so the server can re-learn which sessions
    /// are still alive on this machine.
    Resync {
        session_ids: Vec<SessionId>,
    },
}

/// Session description carried by `session_started`.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub pid: u32,
    pub process_name: String,
    pub workdir: String,
    /// RFC3339 UTC timestamp.
    pub started_at: String,
}
