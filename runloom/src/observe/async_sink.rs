use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::event::RunEvent;
use super::sink::{EventSink, SinkError};

/// Per-event deadline for the downstream sink while draining.
const DRAIN_DEADLINE: Duration = Duration::from_secs(5);

const DEFAULT_BUFFER: usize = 256;

/// Asynchronous buffered sink: a bounded channel with a single dedicated
/// consumer draining into the downstream sink.
///
/// `emit` never blocks the runtime hot path. When the channel is full the
/// event is dropped silently; when the sink is closing, emission is a
/// no-op. [`AsyncSink::close`] signals shutdown, drains the backlog, and
/// waits for the consumer task to exit.
pub struct AsyncSink {
    sender: Mutex<Option<flume::Sender<RunEvent>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    dropped: Arc<std::sync::atomic::AtomicU64>,
}

impl AsyncSink {
    /// Spawn the consumer task for `downstream`. A `buffer` of zero selects
    /// the default capacity of 256.
    #[must_use]
    pub fn new(downstream: Arc<dyn EventSink>, buffer: usize) -> Self {
        let capacity = if buffer == 0 { DEFAULT_BUFFER } else { buffer };
        let (tx, rx) = flume::bounded::<RunEvent>(capacity);
        let handle = tokio::spawn(async move {
            while let Ok(event) = rx.recv_async().await {
                // Downstream failures and deadline overruns are dropped:
                // observability must not fail the runtime.
                let _ = timeout(DRAIN_DEADLINE, downstream.emit(event)).await;
            }
        });
        Self {
            sender: Mutex::new(Some(tx)),
            consumer: Mutex::new(Some(handle)),
            dropped: Arc::new(std::sync::atomic::AtomicU64::new(0)),
        }
    }

    /// Number of events dropped because the channel was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Signal no further writes, drain the backlog, and join the consumer.
    /// Idempotent: later calls are no-ops.
    pub async fn close(&self) {
        let sender = self.sender.lock().take();
        drop(sender);
        let handle = self.consumer.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[async_trait]
impl EventSink for AsyncSink {
    async fn emit(&self, mut event: RunEvent) -> Result<(), SinkError> {
        event.normalize();
        let sender = match self.sender.lock().as_ref() {
            Some(tx) => tx.clone(),
            // Closing: drop silently.
            None => return Ok(()),
        };
        match sender.try_send(event) {
            Ok(()) => Ok(()),
            Err(flume::TrySendError::Full(_)) => {
                self.dropped
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                Ok(())
            }
            Err(flume::TrySendError::Disconnected(_)) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observe::{EventKind, MemorySink};

    #[tokio::test]
    async fn close_drains_backlog() {
        let downstream = Arc::new(MemorySink::new());
        let sink = AsyncSink::new(downstream.clone(), 16);
        for i in 0..10 {
            sink.emit(RunEvent::new(format!("run-{i}"), EventKind::Queue))
                .await
                .unwrap();
        }
        sink.close().await;
        assert_eq!(downstream.snapshot().len(), 10);
    }

    #[tokio::test]
    async fn emit_after_close_is_silent() {
        let downstream = Arc::new(MemorySink::new());
        let sink = AsyncSink::new(downstream.clone(), 4);
        sink.close().await;
        sink.emit(RunEvent::new("run-1", EventKind::Queue))
            .await
            .unwrap();
        assert!(downstream.snapshot().is_empty());
    }
}
