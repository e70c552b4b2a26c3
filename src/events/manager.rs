//! Subscription manager for broadcasting engine events.

use crate::types::BatchId;
use crossbeam_channel::{bounded, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use super::types::{DropReason, EngineEvent, EventConfig, EventHandle, SubscriptionId};

/// Internal subscription state.
struct Subscription {
    config: EventConfig,
    sender: Sender<EngineEvent>,
}

impl Subscription {
    /// Try to send an event. Returns false if the buffer is full or the
    /// receiver is gone (subscriber will be dropped).
    fn try_send(&self, event: EngineEvent) -> bool {
        self.sender.try_send(event).is_ok()
    }

    fn wants_state(&self, key: &str) -> bool {
        self.config.filter.include_states && self.config.filter.matches_key(key)
    }

    fn wants_loss(&self, key: &str) -> bool {
        self.config.filter.include_losses && self.config.filter.matches_key(key)
    }
}

/// Manages subscriptions and broadcasts events.
pub struct EventManager {
    /// Active subscriptions by ID.
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
}

impl EventManager {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Create a new subscription.
    pub fn subscribe(&self, config: EventConfig) -> EventHandle {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(config.buffer_size.max(1));

        self.subscriptions
            .write()
            .insert(id, Subscription { config, sender });

        EventHandle { id, receiver }
    }

    /// Unsubscribe and clean up.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        if let Some(sub) = self.subscriptions.write().remove(&id) {
            let _ = sub.sender.try_send(EngineEvent::Dropped {
                reason: DropReason::Unsubscribed,
            });
        }
    }

    /// Drop every subscription with the given reason.
    pub fn close_all(&self, reason: DropReason) {
        for (_, sub) in self.subscriptions.write().drain() {
            let _ = sub.sender.try_send(EngineEvent::Dropped {
                reason: reason.clone(),
            });
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    // --- Broadcasting ---

    pub fn broadcast_updated(&self, key: &str, batch: BatchId) {
        let event = EngineEvent::StateUpdated {
            key: key.to_string(),
            batch,
        };
        self.broadcast(|sub| sub.wants_state(key), event);
    }

    pub fn broadcast_combined(&self, key: &str, batch: BatchId, shards: usize) {
        let event = EngineEvent::StateCombined {
            key: key.to_string(),
            batch,
            shards,
        };
        self.broadcast(|sub| sub.wants_state(key), event);
    }

    pub fn broadcast_lost(&self, key: &str, batch: BatchId, reason: String) {
        let event = EngineEvent::KeyLost {
            key: key.to_string(),
            batch,
            reason,
        };
        self.broadcast(|sub| sub.wants_loss(key), event);
    }

    pub fn broadcast_batch(&self, batch: BatchId, processed: usize, lost: usize) {
        let event = EngineEvent::BatchCommitted {
            batch,
            processed,
            lost,
        };
        self.broadcast(|sub| sub.config.filter.include_batches, event);
    }

    pub fn broadcast_checkpoint(&self, batch: BatchId, path: &Path) {
        let event = EngineEvent::CheckpointWritten {
            batch,
            path: path.to_path_buf(),
        };
        self.broadcast(|sub| sub.config.filter.include_checkpoints, event);
    }

    /// Internal broadcast helper. Drops subscribers that fail to receive.
    fn broadcast<F>(&self, filter: F, event: EngineEvent)
    where
        F: Fn(&Subscription) -> bool,
    {
        let mut to_remove = Vec::new();

        {
            let subs = self.subscriptions.read();
            if subs.is_empty() {
                return;
            }
            for (id, sub) in subs.iter() {
                if filter(sub) && !sub.try_send(event.clone()) {
                    to_remove.push(*id);
                }
            }
        }

        if !to_remove.is_empty() {
            let mut subs = self.subscriptions.write();
            for id in to_remove {
                if let Some(sub) = subs.remove(&id) {
                    debug!(subscription = id.0, "dropping slow subscriber");
                    let _ = sub.sender.try_send(EngineEvent::Dropped {
                        reason: DropReason::BufferOverflow,
                    });
                }
            }
        }
    }
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new()
    }
}
