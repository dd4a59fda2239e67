//! Console multiplexer
//!
//! Reads only take a shared lock on the stream for the duration of a
//! copy, so clients may poll as often as they like. Writes, enable and
//! disable of one console are serialized by that console's control lock,
//! which keeps keystrokes in arrival order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use tb_core::{BrokerError, TargetId};

use super::stream::Stream;
use super::{ConsoleChunk, ConsoleInfo};
use crate::drivers::DriverFactory;
use crate::registry::TargetRegistry;

/// Owns every console stream of every target
pub struct ConsoleMultiplexer {
    /// Consoles per target, in configuration order
    consoles: HashMap<TargetId, Vec<Arc<Stream>>>,
    /// Consoles to enable at startup
    autostart: Vec<Arc<Stream>>,
    chunk_size: usize,
    driver_timeout: Duration,
    cancel: CancellationToken,
}

/// Size limits applied to every console
#[derive(Debug, Clone, Copy)]
pub struct ConsoleLimits {
    /// Most bytes returned by one read
    pub chunk_size: usize,
    /// Most bytes of one generation kept in memory per console
    pub buffer_limit: usize,
}

impl ConsoleMultiplexer {
    /// Bind a driver to every configured console; all start disabled
    pub fn new(
        registry: &TargetRegistry,
        drivers: &dyn DriverFactory,
        limits: ConsoleLimits,
        driver_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let mut consoles = HashMap::new();
        let mut autostart = Vec::new();
        for entry in registry.list() {
            let streams: Vec<Arc<Stream>> = entry
                .config
                .consoles
                .iter()
                .map(|config| {
                    let stream = Arc::new(Stream::new(
                        entry.id.clone(),
                        config.name.clone(),
                        drivers.console(&entry.id, config),
                        limits.buffer_limit,
                    ));
                    if config.enabled {
                        autostart.push(Arc::clone(&stream));
                    }
                    stream
                })
                .collect();
            consoles.insert(entry.id.clone(), streams);
        }

        Self {
            consoles,
            autostart,
            chunk_size: limits.chunk_size,
            driver_timeout,
            cancel,
        }
    }

    /// Enable the consoles configured to start enabled
    ///
    /// Failures are logged; the console stays disabled until enabled again.
    pub async fn start(&self) {
        for stream in &self.autostart {
            if let Err(e) = self.enable_stream(stream).await {
                tracing::warn!(
                    target_id = %stream.target,
                    console = %stream.name,
                    "Console not enabled at startup: {}",
                    e
                );
            }
        }
    }

    fn streams(&self, target: &TargetId) -> Result<&[Arc<Stream>], BrokerError> {
        self.consoles
            .get(target)
            .map(Vec::as_slice)
            .ok_or_else(|| BrokerError::NotFound(format!("target {}", target)))
    }

    fn stream(&self, target: &TargetId, console: &str) -> Result<&Arc<Stream>, BrokerError> {
        self.streams(target)?
            .iter()
            .find(|s| s.name == console)
            .ok_or_else(|| BrokerError::NotFound(format!("console {}/{}", target, console)))
    }

    /// Name of the target's first console, used when none is given
    pub fn default_console(&self, target: &TargetId) -> Result<String, BrokerError> {
        self.streams(target)?
            .first()
            .map(|s| s.name.clone())
            .ok_or_else(|| BrokerError::NotFound(format!("target {} has no consoles", target)))
    }

    /// Reads up to one chunk of console output starting at `offset`.
    ///
    /// If the generation is not current the read returns no data. The
    /// caller must then discard its offset and start over from 0 in the
    /// returned generation. An offset whose bytes were already dropped from
    /// memory reads from the oldest byte still kept.
    ///
    /// # Arguments
    ///
    /// * `target` - Target owning the console
    /// * `console` - Console name
    /// * `offset` - Byte offset within the generation
    /// * `generation` - Generation the caller's offset belongs to, if known
    pub fn read(
        &self,
        target: &TargetId,
        console: &str,
        offset: u64,
        generation: Option<u64>,
    ) -> Result<ConsoleChunk, BrokerError> {
        let stream = self.stream(target, console)?;
        Ok(stream.read(offset, generation, self.chunk_size))
    }

    /// Send bytes to the console; writes are applied in arrival order
    pub async fn write(
        &self,
        target: &TargetId,
        console: &str,
        data: &[u8],
    ) -> Result<(), BrokerError> {
        let stream = self.stream(target, console)?;
        let control = stream.control.lock().await;
        if control.is_none() || !stream.state.read().enabled {
            return Err(BrokerError::NotEnabled(format!(
                "console {}/{} is disabled",
                target, console
            )));
        }
        stream
            .bounded("write", self.driver_timeout, stream.driver.write(data))
            .await?;
        tracing::trace!(target_id = %target, console, bytes = data.len(), "Console input");
        Ok(())
    }

    /// Enable a console, starting a fresh generation
    ///
    /// Enabling an enabled console changes nothing. Returns the current
    /// generation.
    pub async fn enable(&self, target: &TargetId, console: &str) -> Result<u64, BrokerError> {
        let stream = self.stream(target, console)?;
        self.enable_stream(stream).await
    }

    async fn enable_stream(&self, stream: &Arc<Stream>) -> Result<u64, BrokerError> {
        let mut control = stream.control.lock().await;
        if stream.reading(&control) {
            return Ok(stream.state.read().generation);
        }
        // A reader that stopped on its own
        if let Some(reader) = control.take() {
            reader.stop().await;
        }

        stream
            .bounded("enable", self.driver_timeout, stream.driver.enable())
            .await?;
        let (generation, epoch) = stream.open_generation();
        *control = Some(stream.spawn_reader(epoch, &self.cancel));

        tracing::info!(
            target_id = %stream.target,
            console = %stream.name,
            generation,
            "Console enabled"
        );
        Ok(generation)
    }

    /// Disable a console; writes are refused and reads return no data
    /// until it is enabled again
    pub async fn disable(&self, target: &TargetId, console: &str) -> Result<(), BrokerError> {
        let stream = self.stream(target, console)?;
        let mut control = stream.control.lock().await;
        let Some(reader) = control.take() else {
            return Ok(());
        };

        stream.state.write().enabled = false;
        reader.stop().await;
        tracing::info!(target_id = %target, console, "Console disabled");

        stream
            .bounded("disable", self.driver_timeout, stream.driver.disable())
            .await
    }

    /// Record a restart of the far end noticed outside the driver, such
    /// as a power cycle; returns the new generation
    pub fn notify_restart(&self, target: &TargetId, console: &str) -> Result<u64, BrokerError> {
        let stream = self.stream(target, console)?;
        stream.restart(None).ok_or_else(|| {
            BrokerError::NotEnabled(format!("console {}/{} is disabled", target, console))
        })
    }

    /// Position of every console of a target
    pub fn list(&self, target: &TargetId) -> Result<Vec<ConsoleInfo>, BrokerError> {
        Ok(self.streams(target)?.iter().map(|s| s.info()).collect())
    }

    /// Current `(generation, size)` of a console, `None` when disabled
    pub fn size(&self, target: &TargetId, console: &str) -> Result<Option<(u64, u64)>, BrokerError> {
        let info = self.stream(target, console)?.info();
        Ok(info.enabled.then_some((info.generation, info.size)))
    }
}
