//! # Hydra
//!
//! A keyed, stateful stream-processing engine whose large per-key states
//! are split into fixed shards and updated in parallel.
//!
//! ## Core Concepts
//!
//! - **Models**: Named states of `n` local and `m` parameter variables
//! - **Shards**: Contiguous pieces of a large state, fixed once per key
//! - **Batches**: Inputs delivered per interval, applied in arrival order
//! - **Barrier**: All shards of a key must report before the key commits
//!
//! ## Example
//!
//! ```ignore
//! use hydra::{create, Batch, BatchId, Engine, EngineConfig, InputVector};
//!
//! let engine = Engine::new(EngineConfig::default())?;
//!
//! // m = 80 > tau_local = 6, so this key is split into 14 shards
//! engine.register(create("mod1", 10, 80, 0.5)?)?;
//!
//! let batch = Batch::broadcast(BatchId(1), ["mod1"], InputVector::zeros(91));
//! let report = engine.process_batch(&batch)?;
//! assert_eq!(report.processed(), 1);
//!
//! let state = engine.full_state("mod1")?;
//! ```

pub mod checkpoint;
pub mod engine;
pub mod error;
pub mod events;
pub mod metrics;
pub mod source;
pub mod state;
pub mod store;
pub mod throughput;
pub mod types;
pub mod workers;

// Re-exports
pub use checkpoint::{Checkpoint, CheckpointConfig, CheckpointStore};
pub use engine::{BatchReport, Engine, EngineConfig, KeyOutcome, RunSummary};
pub use error::{EngineError, Result};
pub use events::{
    DropReason, EngineEvent, EventConfig, EventFilter, EventHandle, EventManager, SubscriptionId,
};
pub use metrics::{ThroughputCounter, ThroughputSnapshot};
pub use source::{random_input, Batch, QueueSource};
pub use state::{
    combine, create, full_state_update, linspace, partial_state_update, population, shard_layout,
    validate_key_state, Splitter,
};
pub use store::{KeyedStateStore, MemoryStateStore};
pub use throughput::{
    linear_fit, measure, reports_to_json, run_sweep, LinearFit, ThroughputReport, ThroughputSweep,
};
pub use types::*;
pub use workers::WorkerPool;
