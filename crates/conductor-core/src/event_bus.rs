use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use conductor_types::{EventPayload, OrchestratorEvent};

/// Typed broadcast bus. Publishing never blocks and never fails; slow
/// subscribers lag and the lag is counted rather than back-pressuring the
/// execution plane.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OrchestratorEvent>,
    lagged: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(2048)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            lagged: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: OrchestratorEvent) {
        let _ = self.tx.send(event);
    }

    pub fn publish_payload(&self, correlation_id: &str, payload: EventPayload) {
        self.publish(OrchestratorEvent::new(correlation_id, payload));
    }

    /// Record a subscriber-observed lag (skipped deliveries).
    pub fn note_lag(&self, skipped: u64) {
        self.lagged.fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn lagged_total(&self) -> u64 {
        self.lagged.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receive the next event, folding lag reports into the bus counter so a
/// slow dashboard shows up in metrics instead of silently losing events.
pub async fn recv_counting_lag(
    bus: &EventBus,
    rx: &mut broadcast::Receiver<OrchestratorEvent>,
) -> Option<OrchestratorEvent> {
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => bus.note_lag(skipped),
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
