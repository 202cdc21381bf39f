//! Pipe-backed driver for hosts without a usable PTY. The child runs with
//! stdin/stdout/stderr pipes; resize is a no-op, pause/resume are
//! unavailable, and stop always kills.

use super::{io_thread, pump_reader, resolve_command, run_output_pump, ExitFn, OutputFn};
use crate::error::{BridgeError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::HashMap;
use std::io::Write;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const REAP_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct SessionIo {
    stdin: Mutex<Option<ChildStdin>>,
    child: Arc<Mutex<Child>>,
}

pub fn spawn(
    session_id: &str,
    command: &str,
    workdir: &str,
    env: &HashMap<String, String>,
    on_output: OutputFn,
    on_exit: ExitFn,
) -> Result<(Arc<SessionIo>, u32)> {
    let binary = resolve_command(command)?;

    let mut cmd = Command::new(binary);
    cmd.current_dir(workdir)
        .envs(env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| BridgeError::SpawnFailed(command.to_string(), e.to_string()))?;
    let pid = child.id();

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| BridgeError::Pty("child stdin missing".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| BridgeError::Pty("child stdout missing".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| BridgeError::Pty("child stderr missing".to_string()))?;

    let child = Arc::new(Mutex::new(child));
    let io = Arc::new(SessionIo {
        stdin: Mutex::new(Some(stdin)),
        child: Arc::clone(&child),
    });

    // stdout and stderr merge into the same chunk channel, so the pump sees
    // a single interleaved stream.
    let (chunk_tx, chunk_rx) = mpsc::channel::<Vec<u8>>();
    let err_tx = chunk_tx.clone();

    io_thread(format!("tb-read-{session_id}"))
        .spawn(move || pump_reader(stdout, chunk_tx))
        .map_err(BridgeError::Io)?;
    io_thread(format!("tb-readerr-{session_id}"))
        .spawn(move || pump_reader(stderr, err_tx))
        .map_err(BridgeError::Io)?;

    let pump_sid = session_id.to_string();
    let pump = io_thread(format!("tb-pump-{session_id}"))
        .spawn(move || run_output_pump(pump_sid, chunk_rx, on_output))
        .map_err(BridgeError::Io)?;

    let reap_sid = session_id.to_string();
    let reap_io = Arc::clone(&io);
    std::thread::Builder::new()
        .name(format!("tb-wait-{session_id}"))
        .spawn(move || {
            // The child is shared with stop(), so poll rather than holding
            // the lock across a blocking wait.
            let status = loop {
                match child.lock().expect("child lock poisoned").try_wait() {
                    Ok(Some(status)) => break Ok(status),
                    Ok(None) => {}
                    Err(err) => break Err(err),
                }
                std::thread::sleep(REAP_POLL_INTERVAL);
            };
            reap_io.close();
            let _ = pump.join();
            match status {
                Ok(status) => on_exit(&reap_sid, status.code().unwrap_or(1), None),
                Err(err) => on_exit(&reap_sid, -1, Some(err.to_string())),
            }
        })
        .map_err(BridgeError::Io)?;

    Ok((io, pid))
}

impl SessionIo {
    pub fn write_input(&self, data: &str) -> Result<()> {
        let decoded = STANDARD.decode(data)?;
        let mut guard = self.stdin.lock().expect("stdin lock poisoned");
        let stdin = guard
            .as_mut()
            .ok_or_else(|| BridgeError::Pty("child stdin closed".to_string()))?;
        stdin.write_all(&decoded)?;
        stdin.flush()?;
        Ok(())
    }

    /// No PTY, nothing to resize.
    pub fn resize(&self, _cols: u16, _rows: u16) -> Result<()> {
        Ok(())
    }

    /// Pipe mode has no graceful terminate signal; both forms kill.
    pub fn stop(&self, _force: bool) -> Result<()> {
        self.child
            .lock()
            .expect("child lock poisoned")
            .kill()
            .map_err(BridgeError::Io)
    }

    pub fn pause(&self) -> Result<()> {
        Err(BridgeError::NotSupported("pause"))
    }

    pub fn resume(&self) -> Result<()> {
        Err(BridgeError::NotSupported("resume"))
    }

    pub fn close(&self) {
        self.stdin.lock().expect("stdin lock poisoned").take();
    }
}
