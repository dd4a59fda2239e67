//! One console stream and the task that fills it

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tb_core::error::DriverError;
use tb_core::traits::{ConsoleDriver, ConsoleEvent};
use tb_core::{BrokerError, TargetId};

use super::{ConsoleChunk, ConsoleInfo};

/// Position and contents of a stream
#[derive(Debug, Default)]
pub(super) struct StreamState {
    pub(super) generation: u64,
    /// Bumped on every enable; a reader task only appends while the epoch
    /// it was started in is current
    pub(super) epoch: u64,
    pub(super) enabled: bool,
    /// Offset of `buffer[0]` in the current generation
    pub(super) base: u64,
    /// Newest bytes of the current generation, at most the buffer limit
    pub(super) buffer: Vec<u8>,
}

impl StreamState {
    /// `b`: every byte seen in this generation, retained or not
    fn size(&self) -> u64 {
        self.base + self.buffer.len() as u64
    }

    fn reset(&mut self) {
        self.generation += 1;
        self.base = 0;
        self.buffer.clear();
    }

    fn append(&mut self, data: &[u8], limit: usize) {
        self.buffer.extend_from_slice(data);
        let excess = self.buffer.len().saturating_sub(limit);
        if excess > 0 {
            self.buffer.drain(..excess);
            self.base += excess as u64;
        }
    }
}

pub(super) struct Reader {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub(super) struct Stream {
    pub(super) target: TargetId,
    pub(super) name: String,
    pub(super) driver: Arc<dyn ConsoleDriver>,
    /// Most bytes of one generation kept in memory
    buffer_limit: usize,
    pub(super) state: RwLock<StreamState>,
    /// Serializes enable, disable and writes; held across driver calls
    pub(super) control: tokio::sync::Mutex<Option<Reader>>,
}

impl Stream {
    pub(super) fn new(
        target: TargetId,
        name: String,
        driver: Arc<dyn ConsoleDriver>,
        buffer_limit: usize,
    ) -> Self {
        Self {
            target,
            name,
            driver,
            buffer_limit,
            state: RwLock::new(StreamState::default()),
            control: tokio::sync::Mutex::new(None),
        }
    }

    fn driver_error(&self, action: &str, source: DriverError) -> BrokerError {
        tracing::warn!(
            target_id = %self.target,
            component = %self.name,
            action,
            "Console driver failed: {}",
            source
        );
        BrokerError::driver(self.target.as_str(), self.name.as_str(), action, source)
    }

    pub(super) async fn bounded<T>(
        &self,
        action: &str,
        timeout: Duration,
        call: impl std::future::Future<Output = Result<T, DriverError>>,
    ) -> Result<T, BrokerError> {
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(self.driver_error(action, e)),
            Err(_) => Err(self.driver_error(action, DriverError::Timeout(timeout))),
        }
    }

    /// Read without blocking writers for longer than a copy
    ///
    /// An offset older than the oldest retained byte reads from that byte
    /// instead; `ConsoleChunk::offset` says where the data starts.
    pub(super) fn read(&self, offset: u64, generation: Option<u64>, chunk: usize) -> ConsoleChunk {
        let state = self.state.read();
        let size = state.size();
        let mut result = ConsoleChunk {
            generation: state.generation,
            size,
            offset,
            enabled: state.enabled,
            data: Bytes::new(),
        };

        let stale = generation.is_some_and(|g| g != state.generation);
        if stale || !state.enabled || offset >= size {
            return result;
        }

        result.offset = offset.max(state.base);
        // base <= offset < size, so the index fits in the buffer
        let start = (result.offset - state.base) as usize;
        let end = state.buffer.len().min(start.saturating_add(chunk));
        result.data = Bytes::copy_from_slice(&state.buffer[start..end]);
        result
    }

    pub(super) fn info(&self) -> ConsoleInfo {
        let state = self.state.read();
        ConsoleInfo {
            name: self.name.clone(),
            enabled: state.enabled,
            generation: state.generation,
            size: state.size(),
        }
    }

    /// Whether a reader is running for the current enable
    pub(super) fn reading(&self, control: &Option<Reader>) -> bool {
        let running = control
            .as_ref()
            .is_some_and(|reader| !reader.task.is_finished());
        running && self.state.read().enabled
    }

    /// Start a fresh generation; caller holds `control`
    pub(super) fn open_generation(&self) -> (u64, u64) {
        let mut state = self.state.write();
        state.reset();
        state.epoch += 1;
        state.enabled = true;
        (state.generation, state.epoch)
    }

    /// Bump the generation of an enabled stream after its far end restarted
    pub(super) fn restart(&self, epoch: Option<u64>) -> Option<u64> {
        let mut state = self.state.write();
        if !state.enabled || epoch.is_some_and(|e| e != state.epoch) {
            return None;
        }
        state.reset();
        tracing::info!(
            target_id = %self.target,
            console = %self.name,
            generation = state.generation,
            "Console restarted"
        );
        Some(state.generation)
    }

    /// Start the reader task for `epoch`
    pub(super) fn spawn_reader(self: &Arc<Self>, epoch: u64, parent: &CancellationToken) -> Reader {
        let cancel = parent.child_token();
        let task = tokio::spawn(pump(Arc::clone(self), epoch, cancel.clone()));
        Reader { cancel, task }
    }
}

impl Reader {
    /// Stop the task and wait until it no longer touches the driver
    pub(super) async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::error!("Console reader task failed: {}", e);
        }
    }
}

/// Move driver output into the stream until cancelled or the driver ends
async fn pump(stream: Arc<Stream>, epoch: u64, cancel: CancellationToken) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = stream.driver.next_event() => event,
        };

        match event {
            Ok(ConsoleEvent::Data(data)) => {
                let mut state = stream.state.write();
                if state.epoch != epoch || !state.enabled {
                    break;
                }
                state.append(&data, stream.buffer_limit);
                tracing::trace!(
                    target_id = %stream.target,
                    console = %stream.name,
                    bytes = data.len(),
                    size = state.size(),
                    "Console output"
                );
            }
            Ok(ConsoleEvent::Restarted) => {
                if stream.restart(Some(epoch)).is_none() {
                    break;
                }
            }
            Ok(ConsoleEvent::Closed) => {
                tracing::info!(target_id = %stream.target, console = %stream.name, "Console stream closed");
                break;
            }
            Err(e) => {
                tracing::warn!(
                    target_id = %stream.target,
                    component = %stream.name,
                    action = "read",
                    "Console driver failed: {}",
                    e
                );
                break;
            }
        }
    }

    // Nothing feeds the stream any more; it takes an enable to resume
    if !cancel.is_cancelled() {
        let mut state = stream.state.write();
        if state.epoch == epoch && state.enabled {
            state.enabled = false;
            tracing::info!(
                target_id = %stream.target,
                console = %stream.name,
                "Console disabled after its reader stopped"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_drops_oldest_past_limit() {
        let mut state = StreamState::default();
        state.append(b"abcd", 4);
        assert_eq!((state.base, state.size()), (0, 4));

        state.append(b"ef", 4);
        assert_eq!(state.buffer, b"cdef");
        assert_eq!((state.base, state.size()), (2, 6));

        state.reset();
        assert_eq!((state.generation, state.base, state.size()), (1, 0, 0));
    }
}
