//! Power capability

use async_trait::async_trait;
use std::time::Duration;

use crate::error::DriverError;

/// One power-control point of a target's rail (a relay, a PDU outlet, a
/// QEMU process...)
#[async_trait]
pub trait PowerDriver: Send + Sync {
    /// Turn the component on
    async fn on(&self) -> Result<(), DriverError>;

    /// Turn the component off
    async fn off(&self) -> Result<(), DriverError>;

    /// Query whether the component is currently powered
    async fn state(&self) -> Result<bool, DriverError>;

    /// Power cycle the component, waiting `settle` between off and on
    ///
    /// Drivers with a native cycle primitive may override this.
    async fn cycle(&self, settle: Duration) -> Result<(), DriverError> {
        self.off().await?;
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }
        self.on().await
    }
}
