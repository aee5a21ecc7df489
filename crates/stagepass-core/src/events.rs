//! Event surface consumed by UI layers
//!
//! Every service exposes a broadcast channel; subscribing returns a
//! receiver and dropping it is the unsubscribe. Emission never blocks and
//! never fails: with no subscribers the event is simply discarded.

use tokio::sync::broadcast;

use crate::models::{
    ConflictDetail, Mutation, MutationId, QueueItem, ReplayResult, SyncPhase, SyncProgress,
    SyncResult,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Broadcast fan-out for one event type
#[derive(Debug)]
pub struct EventBus<T: Clone> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone> EventBus<T> {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribe; drop the receiver to unsubscribe
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    /// Emit to all current subscribers
    pub fn emit(&self, event: T) {
        // Err means no live receivers, which is fine
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Emitted by the mutation queue on every durable change
#[derive(Debug, Clone)]
pub enum QueueEvent {
    Added { item: QueueItem },
    Completed { id: MutationId },
    Failed {
        id: MutationId,
        error: String,
        permanent: bool,
    },
    Cleared,
}

/// Emitted by the offline mutation handler
#[derive(Debug, Clone)]
pub enum MutationEvent {
    Added(Mutation),
    Completed { id: MutationId },
    Failed { id: MutationId, error: String },
    Conflict {
        id: MutationId,
        detail: Box<ConflictDetail>,
    },
    ReplayStarted,
    ReplayCompleted(ReplayResult),
}

/// Emitted by the sync manager over a pass
#[derive(Debug, Clone)]
pub enum SyncEvent {
    PhaseChanged { from: SyncPhase, to: SyncPhase },
    Progress(SyncProgress),
    TaskStarted { entity_type: String },
    TaskCompleted {
        entity_type: String,
        pulled: u64,
        pushed: u64,
    },
    TaskFailed {
        entity_type: String,
        error: String,
    },
    Completed(SyncResult),
    Failed { reason: String },
}
