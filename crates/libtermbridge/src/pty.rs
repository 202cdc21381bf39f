//! Child process driver: spawns the requested command under a PTY (pipes on
//! platforms without one), streams its output as base64 chunks, and reaps
//! the exit status.

use crate::error::{BridgeError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::{spawn, SessionIo};

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::{spawn, SessionIo};

/// Called with `(session_id, base64_chunk)` on each output flush.
pub type OutputFn = Box<dyn Fn(&str, String) + Send + Sync + 'static>;

/// Called exactly once with `(session_id, exit_code, error)` after the child
/// has been reaped and the final output chunk flushed.
pub type ExitFn = Box<dyn FnOnce(&str, i32, Option<String>) + Send + 'static>;

/// Process names the agent may spawn.
pub const ALLOWED_COMMANDS: &[&str] = &["claude", "bash", "zsh", "sh", "powershell", "cmd"];

const READ_BUF_BYTES: usize = 4096;

/// Output coalescing cadence (~60 Hz).
const FLUSH_INTERVAL: Duration = Duration::from_millis(16);

const IO_THREAD_STACK_BYTES: usize = 64 * 1024;

/// Reduce a command to the base name used for the allow-list check: the
/// final path component, with the `.exe` suffix stripped on Windows.
fn normalized_base(command: &str) -> String {
    let base = command.rsplit('/').next().unwrap_or(command);
    let base = base.rsplit('\\').next().unwrap_or(base);
    if cfg!(windows) {
        let lower = base.to_ascii_lowercase();
        lower
            .strip_suffix(".exe")
            .map(str::to_string)
            .unwrap_or(lower)
    } else {
        base.to_string()
    }
}

/// Enforce the allow-list, then resolve the command to an executable path.
pub(crate) fn resolve_command(command: &str) -> Result<PathBuf> {
    let base = normalized_base(command);
    if !ALLOWED_COMMANDS.contains(&base.as_str()) {
        return Err(BridgeError::DisallowedCommand(command.to_string()));
    }
    lookup_path(command)
}

/// Mirror of the usual shell lookup: a command containing a path separator
/// is checked directly, anything else is searched on PATH.
fn lookup_path(command: &str) -> Result<PathBuf> {
    if command.contains('/') || command.contains('\\') {
        let candidate = Path::new(command);
        if is_executable(candidate) {
            return Ok(candidate.to_path_buf());
        }
        return Err(BridgeError::ResolveFailed(command.to_string()));
    }

    let path_var = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path_var) {
        let full = dir.join(command);
        if is_executable(&full) {
            return Ok(full);
        }
        if cfg!(windows) {
            let exe = dir.join(format!("{command}.exe"));
            if is_executable(&exe) {
                return Ok(exe);
            }
        }
    }
    Err(BridgeError::ResolveFailed(command.to_string()))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Blocking read loop feeding raw chunks to the output pump. Ends on EOF or
/// read error; dropping the sender is what terminates the pump.
pub(crate) fn pump_reader(mut reader: impl Read, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; READ_BUF_BYTES];
    loop {
        match reader.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    return;
                }
            }
        }
    }
}

/// Accumulates raw output and flushes it as one base64 chunk per
/// `FLUSH_INTERVAL`. The final flush happens when every reader has dropped
/// its sender, so pending bytes are never lost on exit.
pub(crate) fn run_output_pump(session_id: String, rx: mpsc::Receiver<Vec<u8>>, on_output: OutputFn) {
    let mut pending: Vec<u8> = Vec::new();
    let mut deadline = Instant::now() + FLUSH_INTERVAL;
    loop {
        let now = Instant::now();
        if now >= deadline {
            flush_pending(&session_id, &mut pending, &on_output);
            deadline = now + FLUSH_INTERVAL;
        }
        match rx.recv_timeout(deadline.saturating_duration_since(now)) {
            Ok(chunk) => pending.extend_from_slice(&chunk),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                flush_pending(&session_id, &mut pending, &on_output);
                return;
            }
        }
    }
}

fn flush_pending(session_id: &str, pending: &mut Vec<u8>, on_output: &OutputFn) {
    if pending.is_empty() {
        return;
    }
    let encoded = STANDARD.encode(&pending);
    on_output(session_id, encoded);
    pending.clear();
}

pub(crate) fn io_thread(name: String) -> std::thread::Builder {
    std::thread::Builder::new()
        .name(name)
        .stack_size(IO_THREAD_STACK_BYTES)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn allow_list_accepts_bare_and_pathed_shells() {
        assert!(resolve_command("bash").is_ok());
        assert!(resolve_command("/usr/bin/bash").is_ok() || resolve_command("/bin/bash").is_ok());
        assert!(resolve_command("sh").is_ok());
    }

    #[test]
    fn allow_list_rejects_other_binaries() {
        for cmd in ["python", "/usr/bin/python", "rm", "curl", "bash2"] {
            match resolve_command(cmd) {
                Err(BridgeError::DisallowedCommand(c)) => assert_eq!(c, cmd),
                other => panic!("expected DisallowedCommand for {cmd}, got {other:?}"),
            }
        }
    }

    #[test]
    fn allowed_but_missing_command_is_resolve_failure() {
        // powershell is on the allow-list but not installed on test hosts.
        match resolve_command("powershell") {
            Err(BridgeError::ResolveFailed(c)) => assert_eq!(c, "powershell"),
            Ok(_) => {} // machine actually has it; nothing to assert
            other => panic!("expected ResolveFailed, got {other:?}"),
        }
    }

    #[test]
    fn base_name_strips_both_separator_kinds() {
        assert_eq!(normalized_base("/usr/bin/zsh"), "zsh");
        assert_eq!(normalized_base(r"C:\tools\bash"), "bash");
        assert_eq!(normalized_base("sh"), "sh");
    }

    #[test]
    fn output_pump_coalesces_and_encodes() {
        let chunks: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&chunks);
        let on_output: OutputFn = Box::new(move |sid, data| {
            assert_eq!(sid, "s1");
            sink.lock().unwrap().push(data);
        });

        let (tx, rx) = mpsc::channel();
        let pump = std::thread::spawn(move || run_output_pump("s1".to_string(), rx, on_output));

        tx.send(b"hel".to_vec()).unwrap();
        tx.send(b"lo".to_vec()).unwrap();
        drop(tx);
        pump.join().unwrap();

        let collected = chunks.lock().unwrap();
        let decoded: Vec<u8> = collected
            .iter()
            .flat_map(|c| STANDARD.decode(c).unwrap())
            .collect();
        assert_eq!(decoded, b"hello");
    }

    #[test]
    fn output_pump_final_flush_drains_pending() {
        let chunks: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&chunks);
        let on_output: OutputFn = Box::new(move |_, data| sink.lock().unwrap().push(data));

        let (tx, rx) = mpsc::channel();
        tx.send(b"tail".to_vec()).unwrap();
        drop(tx);
        run_output_pump("s1".to_string(), rx, on_output);

        let collected = chunks.lock().unwrap();
        assert_eq!(collected.len(), 1);
        assert_eq!(STANDARD.decode(&collected[0]).unwrap(), b"tail");
    }

    #[test]
    fn base64_round_trip_law() {
        let payload: Vec<u8> = (0u8..=255).collect();
        let encoded = STANDARD.encode(&payload);
        assert_eq!(STANDARD.decode(encoded).unwrap(), payload);
    }
}
