//! Console capability

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::DriverError;

/// Something a console driver observed on its stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleEvent {
    /// Bytes produced by the target
    Data(Bytes),
    /// The far end restarted; previously produced bytes are stale
    Restarted,
    /// The stream ended and will produce nothing more until re-enabled
    Closed,
}

/// A byte-stream console of a target (serial port, QEMU chardev...)
#[async_trait]
pub trait ConsoleDriver: Send + Sync {
    /// Start the stream
    async fn enable(&self) -> Result<(), DriverError>;

    /// Stop the stream
    async fn disable(&self) -> Result<(), DriverError>;

    /// Send bytes to the target
    async fn write(&self, data: &[u8]) -> Result<(), DriverError>;

    /// Wait for the next event on the stream
    ///
    /// Only called while the console is enabled; must be cancel-safe since
    /// the reader task drops it when the console is disabled.
    async fn next_event(&self) -> Result<ConsoleEvent, DriverError>;
}
