//! Event subscriptions for engine activity.
//!
//! Subscribers receive events on bounded channels:
//! - Per-key outcomes (updated, combined, lost)
//! - Batch commits
//! - Checkpoints
//!
//! A subscriber whose buffer fills up is dropped rather than slowing
//! the engine down.
//!
//! # Example
//!
//! ```ignore
//! let handle = engine.subscribe(EventConfig {
//!     filter: EventFilter::keys(vec!["mod1".to_string()]),
//!     ..Default::default()
//! });
//!
//! loop {
//!     match handle.recv() {
//!         Ok(EngineEvent::StateCombined { key, batch, .. }) => println!("{key} @ {batch}"),
//!         Ok(EngineEvent::Dropped { .. }) | Err(_) => break,
//!         Ok(_) => {}
//!     }
//! }
//! ```

mod manager;
mod types;

pub use manager::EventManager;
pub use types::{DropReason, EngineEvent, EventConfig, EventFilter, EventHandle, SubscriptionId};
