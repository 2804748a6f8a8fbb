//! Side-channel diagnostics for external monitoring
//!
//! Events here never influence control flow; collectors that lag or
//! disconnect are silently dropped by the broadcast channel.

use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetryEvent {
    /// The loop detector crossed its threshold
    SelectionLoopDetected { count: usize, window_seconds: u64 },
}

#[derive(Clone)]
pub struct TelemetrySink {
    tx: broadcast::Sender<TelemetryEvent>,
}

impl TelemetrySink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: TelemetryEvent) {
        match &event {
            TelemetryEvent::SelectionLoopDetected {
                count,
                window_seconds,
            } => {
                tracing::warn!(count, window_seconds, "selection loop detected");
            }
        }
        // No subscribers is fine; diagnostics are best-effort
        let _ = self.tx.send(event);
    }
}

impl Default for TelemetrySink {
    fn default() -> Self {
        Self::new(16)
    }
}
