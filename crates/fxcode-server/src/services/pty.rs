//! PTY wrapper using portable-pty.
//!
//! Opens a pseudo-terminal running a resolved shell launch, providing
//! blocking read/write (for `spawn_blocking` contexts), resize, wait and
//! kill.

use fxcode_core::{FxError, FxResult};
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Mutex;
use tracing::{debug, info};

/// What to run inside the PTY.
#[derive(Debug, Clone, Default)]
pub struct PtyLaunch {
    pub executable: String,
    pub args: Vec<String>,
    pub cwd: String,
    /// Complete environment; the parent environment is not inherited.
    pub env: HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
}

/// A managed PTY instance.
pub struct PtyHandle {
    reader: Mutex<Box<dyn Read + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    /// The master for resize operations (Mutex because MasterPty is not Sync).
    master: Mutex<Box<dyn MasterPty + Send>>,
    child: Mutex<Box<dyn portable_pty::Child + Send + Sync>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    pid: Option<u32>,
}

impl PtyHandle {
    pub fn spawn(launch: &PtyLaunch) -> FxResult<Self> {
        let pty_system = native_pty_system();
        let size = PtySize {
            rows: launch.rows.max(1),
            cols: launch.cols.max(1),
            pixel_width: 0,
            pixel_height: 0,
        };
        let pair = pty_system
            .openpty(size)
            .map_err(|e| FxError::Other(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&launch.executable);
        cmd.args(&launch.args);
        if !launch.cwd.is_empty() {
            cmd.cwd(&launch.cwd);
        }
        cmd.env_clear();
        for (key, value) in &launch.env {
            cmd.env(key, value);
        }
        if !launch.env.contains_key("TERM") {
            cmd.env("TERM", "xterm-256color");
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| FxError::Other(format!("failed to spawn {}: {e}", launch.executable)))?;
        let pid = child.process_id();
        let killer = child.clone_killer();
        info!(executable = %launch.executable, ?pid, cols = size.cols, rows = size.rows, "PTY spawned");

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| FxError::Other(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| FxError::Other(format!("failed to take PTY writer: {e}")))?;

        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            master: Mutex::new(pair.master),
            child: Mutex::new(child),
            killer: Mutex::new(killer),
            pid,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Read from the PTY output (blocking; call from a spawn_blocking context).
    pub fn read_blocking(&self, buf: &mut [u8]) -> FxResult<usize> {
        let mut reader = self
            .reader
            .lock()
            .map_err(|_| FxError::Other("PTY reader lock poisoned".into()))?;
        Ok(reader.read(buf)?)
    }

    /// Write to the PTY input (blocking; call from a spawn_blocking context).
    pub fn write_blocking(&self, data: &[u8]) -> FxResult<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| FxError::Other("PTY writer lock poisoned".into()))?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    pub fn resize(&self, cols: u16, rows: u16) -> FxResult<()> {
        let size = PtySize {
            rows: rows.max(1),
            cols: cols.max(1),
            pixel_width: 0,
            pixel_height: 0,
        };
        self.master
            .lock()
            .map_err(|_| FxError::Other("PTY master lock poisoned".into()))?
            .resize(size)
            .map_err(|e| FxError::Other(format!("PTY resize failed: {e}")))?;
        debug!(cols, rows, "PTY resized");
        Ok(())
    }

    /// Wait for the child process to exit (blocking). Returns the exit code.
    pub fn wait_blocking(&self) -> FxResult<i32> {
        let mut child = self
            .child
            .lock()
            .map_err(|_| FxError::Other("PTY child lock poisoned".into()))?;
        let status = child
            .wait()
            .map_err(|e| FxError::Other(format!("wait error: {e}")))?;
        let code = i32::try_from(status.exit_code()).unwrap_or(-1);
        info!(code, pid = ?self.pid, "PTY child exited");
        Ok(code)
    }

    pub fn kill(&self) -> FxResult<()> {
        self.killer
            .lock()
            .map_err(|_| FxError::Other("PTY killer lock poisoned".into()))?
            .kill()
            .map_err(|e| FxError::Other(format!("kill failed: {e}")))
    }
}
