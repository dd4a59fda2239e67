//! Built-in power drivers

use std::process::Output;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::process::Command;

use tb_core::error::DriverError;
use tb_core::traits::PowerDriver;

/// In-memory power point for emulated targets and tests
#[derive(Debug)]
pub struct SimulatedPower {
    powered: AtomicBool,
}

impl SimulatedPower {
    pub fn new(initial: bool) -> Self {
        Self {
            powered: AtomicBool::new(initial),
        }
    }
}

#[async_trait]
impl PowerDriver for SimulatedPower {
    async fn on(&self) -> Result<(), DriverError> {
        self.powered.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn off(&self) -> Result<(), DriverError> {
        self.powered.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn state(&self) -> Result<bool, DriverError> {
        Ok(self.powered.load(Ordering::SeqCst))
    }
}

/// Power point driven by shell commands
///
/// `on` and `off` must exit 0; `state` exits 0 when powered and non-zero
/// when not.
#[derive(Debug, Clone)]
pub struct CommandPower {
    on: String,
    off: String,
    state: String,
}

impl CommandPower {
    pub fn new(on: impl Into<String>, off: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            on: on.into(),
            off: off.into(),
            state: state.into(),
        }
    }

    async fn run(command: &str) -> Result<Output, DriverError> {
        tracing::debug!(command, "Running power command");
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .kill_on_drop(true)
            .output()
            .await?;
        Ok(output)
    }

    async fn run_checked(command: &str) -> Result<(), DriverError> {
        let output = Self::run(command).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(DriverError::Command {
            command: command.to_string(),
            reason: format!("{} {}", output.status, stderr.trim()).trim().to_string(),
        })
    }
}

#[async_trait]
impl PowerDriver for CommandPower {
    async fn on(&self) -> Result<(), DriverError> {
        Self::run_checked(&self.on).await
    }

    async fn off(&self) -> Result<(), DriverError> {
        Self::run_checked(&self.off).await
    }

    async fn state(&self) -> Result<bool, DriverError> {
        let output = Self::run(&self.state).await?;
        // Killed by a signal is neither on nor off
        match output.status.code() {
            Some(0) => Ok(true),
            Some(_) => Ok(false),
            None => Err(DriverError::Command {
                command: self.state.clone(),
                reason: output.status.to_string(),
            }),
        }
    }
}
