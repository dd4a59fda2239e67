//! Built-in console drivers

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex};

use tb_core::error::DriverError;
use tb_core::traits::{ConsoleDriver, ConsoleEvent};

/// Bytes read from a child process per event
const READ_CHUNK: usize = 4096;

/// Pause before restarting a console process that exited
const RESPAWN_DELAY: Duration = Duration::from_millis(500);

/// Console that echoes every write back as target output
pub struct LoopbackConsole {
    enabled: AtomicBool,
    tx: mpsc::UnboundedSender<ConsoleEvent>,
    rx: Mutex<mpsc::UnboundedReceiver<ConsoleEvent>>,
}

impl LoopbackConsole {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            enabled: AtomicBool::new(false),
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Report a restart of the far end, as a rebooting board would
    pub fn simulate_restart(&self) {
        let _ = self.tx.send(ConsoleEvent::Restarted);
    }

    /// Report that the far end went away, as an unplugged adapter would
    pub fn simulate_close(&self) {
        let _ = self.tx.send(ConsoleEvent::Closed);
    }

    /// Inject output as if the target had produced it
    pub fn inject(&self, data: impl Into<Bytes>) {
        let _ = self.tx.send(ConsoleEvent::Data(data.into()));
    }
}

impl Default for LoopbackConsole {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConsoleDriver for LoopbackConsole {
    async fn enable(&self) -> Result<(), DriverError> {
        self.enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disable(&self) -> Result<(), DriverError> {
        self.enabled.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn write(&self, data: &[u8]) -> Result<(), DriverError> {
        if !self.enabled.load(Ordering::SeqCst) {
            return Err(DriverError::Closed);
        }
        self.tx
            .send(ConsoleEvent::Data(Bytes::copy_from_slice(data)))
            .map_err(|_| DriverError::Closed)
    }

    async fn next_event(&self) -> Result<ConsoleEvent, DriverError> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await.unwrap_or(ConsoleEvent::Closed))
    }
}

/// Console backed by a child process: writes go to its stdin, its stdout
/// is the console stream
///
/// With `respawn` set, a process that exits while the console is enabled
/// is started again and the restart is reported to the multiplexer.
pub struct CommandConsole {
    program: String,
    args: Vec<String>,
    respawn: bool,
    enabled: AtomicBool,
    // Lock order: stdout, child, stdin
    stdout: Mutex<Option<ChildStdout>>,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
}

impl CommandConsole {
    pub fn new(program: impl Into<String>, args: Vec<String>, respawn: bool) -> Self {
        Self {
            program: program.into(),
            args,
            respawn,
            enabled: AtomicBool::new(false),
            stdout: Mutex::new(None),
            child: Mutex::new(None),
            stdin: Mutex::new(None),
        }
    }

    fn spawn(&self) -> Result<(Child, ChildStdin, ChildStdout), DriverError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child.stdin.take().ok_or(DriverError::Closed)?;
        let stdout = child.stdout.take().ok_or(DriverError::Closed)?;
        tracing::debug!(program = %self.program, pid = ?child.id(), "Console process started");
        Ok((child, stdin, stdout))
    }

    async fn stop_child(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.start_kill() {
                tracing::debug!(program = %self.program, "Console process already gone: {}", e);
            }
            let _ = child.wait().await;
        }
    }
}

#[async_trait]
impl ConsoleDriver for CommandConsole {
    async fn enable(&self) -> Result<(), DriverError> {
        let mut stdout = self.stdout.lock().await;
        self.stop_child().await;

        let (child, stdin, out) = self.spawn()?;
        *self.child.lock().await = Some(child);
        *self.stdin.lock().await = Some(stdin);
        *stdout = Some(out);
        self.enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disable(&self) -> Result<(), DriverError> {
        self.enabled.store(false, Ordering::SeqCst);
        self.stdin.lock().await.take();
        self.stop_child().await;
        Ok(())
    }

    async fn write(&self, data: &[u8]) -> Result<(), DriverError> {
        let mut stdin = self.stdin.lock().await;
        let pipe = stdin.as_mut().ok_or(DriverError::Closed)?;
        pipe.write_all(data).await?;
        pipe.flush().await?;
        Ok(())
    }

    async fn next_event(&self) -> Result<ConsoleEvent, DriverError> {
        let mut stdout = self.stdout.lock().await;
        let Some(out) = stdout.as_mut() else {
            return Ok(ConsoleEvent::Closed);
        };

        let mut buf = vec![0u8; READ_CHUNK];
        let n = out.read(&mut buf).await?;
        if n > 0 {
            buf.truncate(n);
            return Ok(ConsoleEvent::Data(Bytes::from(buf)));
        }

        *stdout = None;
        if !self.respawn || !self.enabled.load(Ordering::SeqCst) {
            return Ok(ConsoleEvent::Closed);
        }

        tracing::info!(program = %self.program, "Console process exited, restarting");
        self.stop_child().await;
        tokio::time::sleep(RESPAWN_DELAY).await;

        let (child, stdin, out) = self.spawn()?;
        *self.child.lock().await = Some(child);
        *self.stdin.lock().await = Some(stdin);
        *stdout = Some(out);
        Ok(ConsoleEvent::Restarted)
    }
}
