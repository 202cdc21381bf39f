//! PTY-backed driver for Unix hosts.

use super::{io_thread, pump_reader, resolve_command, run_output_pump, ExitFn, OutputFn};
use crate::error::{BridgeError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::Write;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// Handle to one spawned child and its PTY master. The master and writer
/// are dropped exactly once, by `close` or by the reaper after child exit.
pub struct SessionIo {
    pid: u32,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

/// Spawn `command` under a fresh PTY. `on_output` receives coalesced
/// base64 chunks; `on_exit` fires once after the final chunk is flushed.
pub fn spawn(
    session_id: &str,
    command: &str,
    workdir: &str,
    env: &HashMap<String, String>,
    on_output: OutputFn,
    on_exit: ExitFn,
) -> Result<(Arc<SessionIo>, u32)> {
    let binary = resolve_command(command)?;

    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| BridgeError::SpawnFailed(command.to_string(), e.to_string()))?;

    let mut cmd = CommandBuilder::new(binary);
    cmd.cwd(workdir);
    for (key, value) in env {
        cmd.env(key, value);
    }
    cmd.env("TERM", "xterm-256color");

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| BridgeError::SpawnFailed(command.to_string(), e.to_string()))?;
    // The parent must not hold the slave open or the master never sees EOF.
    drop(pair.slave);

    let pid = child.process_id().unwrap_or_default();
    let killer = child.clone_killer();
    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| BridgeError::Pty(e.to_string()))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| BridgeError::Pty(e.to_string()))?;

    let io = Arc::new(SessionIo {
        pid,
        master: Mutex::new(Some(pair.master)),
        writer: Mutex::new(Some(writer)),
        killer: Mutex::new(killer),
    });

    let (chunk_tx, chunk_rx) = mpsc::channel::<Vec<u8>>();

    io_thread(format!("tb-read-{session_id}"))
        .spawn(move || pump_reader(reader, chunk_tx))
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
            let mut child = child;
            let status = child.wait();
            // Closing the master unblocks the reader; joining the pump
            // guarantees the last output chunk precedes the exit event.
            reap_io.close();
            let _ = pump.join();
            match status {
                Ok(status) => {
                    let code = i32::try_from(status.exit_code()).unwrap_or(1);
                    on_exit(&reap_sid, code, None);
                }
                Err(err) => on_exit(&reap_sid, -1, Some(err.to_string())),
            }
        })
        .map_err(BridgeError::Io)?;

    Ok((io, pid))
}

impl SessionIo {
    /// Decode base64 input and write the raw bytes to the PTY master.
    pub fn write_input(&self, data: &str) -> Result<()> {
        let decoded = STANDARD.decode(data)?;
        let mut guard = self.writer.lock().expect("writer lock poisoned");
        let writer = guard
            .as_mut()
            .ok_or_else(|| BridgeError::Pty("pty writer closed".to_string()))?;
        writer.write_all(&decoded)?;
        writer.flush()?;
        Ok(())
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let guard = self.master.lock().expect("master lock poisoned");
        let master = guard
            .as_ref()
            .ok_or_else(|| BridgeError::Pty("pty master closed".to_string()))?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| BridgeError::Pty(e.to_string()))
    }

    /// SIGTERM, or SIGKILL when `force` is set.
    pub fn stop(&self, force: bool) -> Result<()> {
        if force {
            return self
                .killer
                .lock()
                .expect("killer lock poisoned")
                .kill()
                .map_err(BridgeError::Io);
        }
        signal(self.pid, libc::SIGTERM)
    }

    pub fn pause(&self) -> Result<()> {
        signal(self.pid, libc::SIGSTOP)
    }

    pub fn resume(&self) -> Result<()> {
        signal(self.pid, libc::SIGCONT)
    }

    /// Release the PTY master and writer. Idempotent.
    pub fn close(&self) {
        self.writer.lock().expect("writer lock poisoned").take();
        self.master.lock().expect("master lock poisoned").take();
    }
}

fn signal(pid: u32, sig: libc::c_int) -> Result<()> {
    // SAFETY: kill() with a valid pid and signal number has no memory
    // preconditions.
    let rc = unsafe { libc::kill(pid as libc::pid_t, sig) };
    if rc == 0 {
        Ok(())
    } else {
        Err(BridgeError::Io(std::io::Error::last_os_error()))
    }
}
