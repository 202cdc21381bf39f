use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("command {0:?} is not allowed; permitted: claude, bash, zsh, sh, powershell, cmd")]
    DisallowedCommand(String),

    #[error("command {0:?} not found on PATH")]
    ResolveFailed(String),

    #[error("failed to spawn {0:?}: {1}")]
    SpawnFailed(String, String),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("invalid base64 input: {0}")]
    BadEncoding(#[from] base64::DecodeError),

    #[error("{0} is not supported on this platform")]
    NotSupported(&'static str),

    #[error("send buffer full")]
    SendBufferFull,

    #[error("pty error: {0}")]
    Pty(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
