//! Event and subscription types.

use crate::types::BatchId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for a subscription.
#[derive(Clone, Debug)]
pub struct EventConfig {
    /// Max buffered events before dropping the subscriber.
    /// Default: 1000
    pub buffer_size: usize,

    /// Filter criteria.
    pub filter: EventFilter,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            filter: EventFilter::all(),
        }
    }
}

/// Filter criteria for subscriptions.
#[derive(Clone, Debug, Default)]
pub struct EventFilter {
    /// Only these keys (None = every key). Applies to per-key events.
    pub keys: Option<Vec<String>>,

    /// Include updated/combined state events.
    pub include_states: bool,

    /// Include lost key events.
    pub include_losses: bool,

    /// Include batch commit events.
    pub include_batches: bool,

    /// Include checkpoint events.
    pub include_checkpoints: bool,
}

impl EventFilter {
    /// Per-key events for specific keys.
    pub fn keys(keys: Vec<String>) -> Self {
        Self {
            keys: Some(keys),
            include_states: true,
            include_losses: true,
            ..Default::default()
        }
    }

    /// Batch commit events only.
    pub fn batches() -> Self {
        Self {
            include_batches: true,
            ..Default::default()
        }
    }

    /// Everything.
    pub fn all() -> Self {
        Self {
            keys: None,
            include_states: true,
            include_losses: true,
            include_batches: true,
            include_checkpoints: true,
        }
    }

    pub(crate) fn matches_key(&self, key: &str) -> bool {
        match self.keys {
            Some(ref keys) => keys.iter().any(|k| k == key),
            None => true,
        }
    }
}

/// Events emitted by the engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    // --- Key Events ---
    /// An unsplit key applied its batch.
    StateUpdated { key: String, batch: BatchId },

    /// All shards of a key reported and were combined.
    StateCombined {
        key: String,
        batch: BatchId,
        shards: usize,
    },

    /// A key's contribution to a batch was lost or rejected; its prior
    /// state is retained.
    KeyLost {
        key: String,
        batch: BatchId,
        reason: String,
    },

    // --- Batch Events ---
    /// A batch was committed to the store.
    BatchCommitted {
        batch: BatchId,
        processed: usize,
        lost: usize,
    },

    /// A checkpoint was written.
    CheckpointWritten { batch: BatchId, path: PathBuf },

    // --- Lifecycle Events ---
    /// Subscription was dropped.
    Dropped { reason: DropReason },
}

/// Why a subscription was dropped.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly unsubscribed.
    Unsubscribed,
    /// Engine shut down.
    Shutdown,
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Handle to receive a subscription's events.
pub struct EventHandle {
    pub id: SubscriptionId,
    /// Channel to receive events.
    pub receiver: crossbeam_channel::Receiver<EngineEvent>,
}

impl EventHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<EngineEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<EngineEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<EngineEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain every event currently buffered.
    pub fn drain(&self) -> Vec<EngineEvent> {
        self.receiver.try_iter().collect()
    }
}
