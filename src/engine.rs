//! Main Engine struct tying all components together.

use crate::checkpoint::{Checkpoint, CheckpointConfig, CheckpointStore};
use crate::error::{EngineError, Result};
use crate::events::{DropReason, EventConfig, EventHandle, EventManager, SubscriptionId};
use crate::metrics::ThroughputCounter;
use crate::source::Batch;
use crate::state::{
    combine, full_state_update, partial_state_update, validate_key_state, Splitter,
};
use crate::store::{KeyedStateStore, MemoryStateStore};
use crate::types::{
    BatchId, EngineStats, InputVector, KeyState, ModelState, PartialState, ShardLayout, Timestamp,
};
use crate::workers::WorkerPool;
use crossbeam_channel::{unbounded, RecvTimeoutError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Engine configuration. Missing fields take their defaults when
/// deserialized.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Keys with more than this many parameter variables are split.
    pub tau_local: usize,

    /// Number of worker threads.
    pub workers: usize,

    /// Length of one batch interval.
    pub batch_interval: Duration,

    /// Shards of a key must all report within this many batch intervals.
    pub barrier_timeout_factor: u32,

    /// Sleep out the rest of each batch interval in [`Engine::run`].
    pub paced: bool,

    /// Periodic checkpoints (None = disabled).
    pub checkpoint: Option<CheckpointConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tau_local: 6,
            workers: 4,
            batch_interval: Duration::from_millis(50),
            barrier_timeout_factor: 20,
            paced: false,
            checkpoint: None,
        }
    }
}

impl EngineConfig {
    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.tau_local == 0 {
            return Err(EngineError::InvalidConfig("tau_local must be at least 1".into()));
        }
        if self.workers == 0 {
            return Err(EngineError::InvalidConfig("workers must be at least 1".into()));
        }
        if self.batch_interval.is_zero() {
            return Err(EngineError::InvalidConfig("batch_interval must be positive".into()));
        }
        if self.barrier_timeout_factor == 0 {
            return Err(EngineError::InvalidConfig(
                "barrier_timeout_factor must be at least 1".into(),
            ));
        }
        let timeout = self.barrier_timeout()?;
        if Instant::now().checked_add(timeout).is_none() {
            return Err(EngineError::InvalidConfig(
                "barrier timeout is too large to schedule".into(),
            ));
        }
        if let Some(ref checkpoint) = self.checkpoint {
            if checkpoint.every_batches == 0 {
                return Err(EngineError::InvalidConfig(
                    "checkpoint.every_batches must be at least 1".into(),
                ));
            }
        }
        Ok(())
    }

    /// How long a batch waits for every shard of a key.
    pub fn barrier_timeout(&self) -> Result<Duration> {
        self.batch_interval
            .checked_mul(self.barrier_timeout_factor)
            .ok_or_else(|| {
                EngineError::InvalidConfig(
                    "batch_interval * barrier_timeout_factor overflows".into(),
                )
            })
    }
}

/// What happened to one key in a batch.
#[derive(Debug)]
pub enum KeyOutcome {
    /// Unsplit key updated and committed.
    Updated,

    /// Every shard reported; the combined state was committed.
    Combined { shards: usize },

    /// The barrier expired before every shard reported. Prior state kept.
    Lost { received: usize, expected: usize },

    /// The update failed (e.g. wrong input dimension). Prior state kept.
    Rejected(EngineError),

    /// No state is registered under the key.
    UnknownKey,
}

impl KeyOutcome {
    /// Whether the key's new state was committed.
    pub fn is_processed(&self) -> bool {
        matches!(self, KeyOutcome::Updated | KeyOutcome::Combined { .. })
    }
}

/// Result of processing one batch.
#[derive(Debug)]
pub struct BatchReport {
    pub batch: BatchId,

    /// Per-key outcomes in first-arrival order.
    pub outcomes: Vec<(String, KeyOutcome)>,

    /// Checkpoint written after this batch, if any.
    pub checkpoint: Option<PathBuf>,

    pub elapsed: Duration,
}

impl BatchReport {
    /// Keys whose new state was committed.
    pub fn processed(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_processed()).count()
    }

    /// Keys whose contribution was not committed.
    pub fn lost(&self) -> usize {
        self.outcomes.len() - self.processed()
    }

    pub fn outcome(&self, key: &str) -> Option<&KeyOutcome> {
        self.outcomes.iter().find(|(k, _)| k == key).map(|(_, o)| o)
    }
}

/// Totals of an [`Engine::run`] call.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub batches: u64,
    pub processed: u64,
    pub lost: u64,
    pub last_batch: Option<BatchId>,
    pub elapsed: Duration,
}

/// Progress of the stream, guarded so batches commit one at a time.
#[derive(Default)]
struct Progress {
    last_batch: Option<BatchId>,
    batches_committed: u64,
}

enum Work {
    Full(Result<ModelState>),
    Shard(Result<PartialState>),
}

struct WorkResult {
    slot: usize,
    work: Work,
}

enum Pending<'a> {
    Unknown(&'a str),
    Waiting(Barrier<'a>),
}

/// Collects the results of one key's jobs for one batch.
struct Barrier<'a> {
    key: &'a str,
    layout: Option<ShardLayout>,
    expected: usize,
    received: usize,
    full: Option<ModelState>,
    shards: Vec<PartialState>,
    error: Option<EngineError>,
}

impl Barrier<'_> {
    fn is_complete(&self) -> bool {
        self.received >= self.expected
    }
}

/// The state-update engine.
///
/// Provides a unified interface for:
/// - Registering models (split or unsplit, decided once per key)
/// - Applying batches across a worker pool with a per-key shard barrier
/// - Checkpointing and recovering the state table
/// - Counting processed states and broadcasting events
pub struct Engine<S: KeyedStateStore = MemoryStateStore> {
    config: EngineConfig,
    store: S,
    splitter: Splitter,
    pool: WorkerPool,
    counter: ThroughputCounter,
    events: EventManager,
    checkpoints: Option<CheckpointStore>,

    /// Lock held for a whole batch to keep per-key order.
    progress: Mutex<Progress>,
}

impl Engine<MemoryStateStore> {
    /// Create an engine with an in-memory store.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_store(config, MemoryStateStore::new())
    }

    /// Create an engine and restore the newest valid checkpoint, if any.
    pub fn recover(config: EngineConfig) -> Result<Self> {
        let engine = Self::new(config)?;
        engine.restore_latest()?;
        Ok(engine)
    }
}

impl<S: KeyedStateStore> Engine<S> {
    /// Create an engine over the given store.
    pub fn with_store(config: EngineConfig, store: S) -> Result<Self> {
        config.validate()?;

        let splitter = Splitter::new(config.tau_local)?;
        let pool = WorkerPool::new(config.workers)?;
        let checkpoints = config
            .checkpoint
            .as_ref()
            .map(CheckpointStore::open)
            .transpose()?;

        debug!(
            workers = config.workers,
            tau_local = config.tau_local,
            checkpoints = checkpoints.is_some(),
            "engine started"
        );

        Ok(Self {
            config,
            store,
            splitter,
            pool,
            counter: ThroughputCounter::new(),
            events: EventManager::new(),
            checkpoints,
            progress: Mutex::new(Progress::default()),
        })
    }

    // --- Registration ---

    /// Register a model. States above the threshold are split here, once.
    pub fn register(&self, state: ModelState) -> Result<()> {
        let key = state.name().to_string();
        if self.store.get(&key).is_some() {
            return Err(EngineError::KeyExists(key));
        }
        if state.vector.len() != state.params.state_len() {
            return Err(EngineError::DimensionMismatch {
                key,
                expected: state.params.state_len(),
                got: state.vector.len(),
            });
        }

        let key_state = if self.splitter.needs_split(&state.params) {
            let layout = self.splitter.layout_for(&state.params)?;
            let shards = self.splitter.split(&state)?;
            KeyState::Sharded { layout, shards }
        } else {
            KeyState::Unsplit(state)
        };

        debug!(
            key = %key,
            shards = key_state.shard_count(),
            "registered model"
        );
        self.store.insert(&key, key_state)
    }

    /// Register several models. Returns how many were registered.
    pub fn register_all(&self, states: impl IntoIterator<Item = ModelState>) -> Result<usize> {
        let mut count = 0;
        for state in states {
            self.register(state)?;
            count += 1;
        }
        info!(count, keys = self.store.len(), "registered models");
        Ok(count)
    }

    // --- Batch Processing ---

    /// Apply one batch to every key it names.
    ///
    /// Work for all keys runs on the pool concurrently. A sharded key is
    /// committed only once all of its shards report; keys that miss the
    /// barrier or fail keep their prior state and are reported as such.
    /// Batches must arrive with increasing ids.
    pub fn process_batch(&self, batch: &Batch) -> Result<BatchReport> {
        let started = Instant::now();
        let mut progress = self.progress.lock();

        if let Some(last) = progress.last_batch {
            if batch.id <= last {
                return Err(EngineError::StaleBatch(batch.id, last));
            }
        }

        // Group inputs per key, keeping first-arrival order of keys and
        // arrival order of inputs within a key.
        let mut slots: HashMap<&str, usize> = HashMap::new();
        let mut groups: Vec<(&str, Vec<Arc<InputVector>>)> = Vec::new();
        for (key, input) in &batch.inputs {
            let slot = *slots.entry(key.as_str()).or_insert_with(|| {
                groups.push((key.as_str(), Vec::new()));
                groups.len() - 1
            });
            groups[slot].1.push(Arc::clone(input));
        }

        let (tx, rx) = unbounded::<WorkResult>();
        let mut pending = Vec::with_capacity(groups.len());
        let mut outstanding = 0usize;

        for (slot, (key, inputs)) in groups.into_iter().enumerate() {
            let Some(state) = self.store.get(key) else {
                pending.push(Pending::Unknown(key));
                continue;
            };
            let inputs: Arc<[Arc<InputVector>]> = inputs.into();

            let barrier = match state {
                KeyState::Unsplit(model) => {
                    let tx = tx.clone();
                    let inputs = Arc::clone(&inputs);
                    self.pool.execute(move || {
                        let work = Work::Full(apply_full(model, &inputs));
                        let _ = tx.send(WorkResult { slot, work });
                    })?;
                    Barrier {
                        key,
                        layout: None,
                        expected: 1,
                        received: 0,
                        full: None,
                        shards: Vec::new(),
                        error: None,
                    }
                }
                KeyState::Sharded { layout, shards } => {
                    let expected = shards.len();
                    for shard in shards {
                        let tx = tx.clone();
                        let inputs = Arc::clone(&inputs);
                        self.pool.execute(move || {
                            let work = Work::Shard(apply_partial(shard, &inputs));
                            let _ = tx.send(WorkResult { slot, work });
                        })?;
                    }
                    Barrier {
                        key,
                        layout: Some(layout),
                        expected,
                        received: 0,
                        full: None,
                        shards: Vec::with_capacity(expected),
                        error: None,
                    }
                }
            };
            outstanding += 1;
            pending.push(Pending::Waiting(barrier));
        }
        drop(tx);

        let deadline = started
            .checked_add(self.config.barrier_timeout()?)
            .ok_or_else(|| EngineError::InvalidConfig("barrier deadline overflows".into()))?;
        while outstanding > 0 {
            let result = match rx.recv_deadline(deadline) {
                Ok(result) => result,
                Err(RecvTimeoutError::Timeout) => {
                    debug!(batch = batch.id.0, outstanding, "barrier expired");
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let Some(Pending::Waiting(barrier)) = pending.get_mut(result.slot) else {
                continue;
            };
            barrier.received += 1;
            match result.work {
                Work::Full(Ok(state)) => barrier.full = Some(state),
                Work::Shard(Ok(shard)) => barrier.shards.push(shard),
                Work::Full(Err(e)) | Work::Shard(Err(e)) => {
                    barrier.error.get_or_insert(e);
                }
            }
            if barrier.is_complete() {
                outstanding -= 1;
            }
        }
        drop(rx);

        let mut outcomes = Vec::with_capacity(pending.len());
        for entry in pending {
            match entry {
                Pending::Unknown(key) => {
                    warn!(key, batch = batch.id.0, "input for unregistered key");
                    self.events
                        .broadcast_lost(key, batch.id, "unregistered key".to_string());
                    outcomes.push((key.to_string(), KeyOutcome::UnknownKey));
                }
                Pending::Waiting(barrier) => {
                    let key = barrier.key.to_string();
                    let outcome = self.resolve(batch.id, barrier);
                    outcomes.push((key, outcome));
                }
            }
        }

        let processed = outcomes.iter().filter(|(_, o)| o.is_processed()).count();
        let lost = outcomes.len() - processed;
        self.counter.record_lost(lost as u64);
        self.counter.record_batch();

        progress.last_batch = Some(batch.id);
        progress.batches_committed += 1;
        self.events.broadcast_batch(batch.id, processed, lost);

        let checkpoint = match (&self.checkpoints, &self.config.checkpoint) {
            (Some(store), Some(config))
                if progress.batches_committed % config.every_batches == 0 =>
            {
                Some(self.write_checkpoint(store, batch.id)?)
            }
            _ => None,
        };

        let elapsed = started.elapsed();
        debug!(
            batch = batch.id.0,
            keys = outcomes.len(),
            processed,
            lost,
            elapsed_us = elapsed.as_micros() as u64,
            "batch committed"
        );

        Ok(BatchReport {
            batch: batch.id,
            outcomes,
            checkpoint,
            elapsed,
        })
    }

    /// Process batches until the source is exhausted or `until` passes.
    ///
    /// With `paced` set, each batch occupies at least one batch interval.
    pub fn run(
        &self,
        batches: impl IntoIterator<Item = Batch>,
        until: Option<Instant>,
    ) -> Result<RunSummary> {
        let started = Instant::now();
        let mut summary = RunSummary::default();

        for batch in batches {
            if until.is_some_and(|deadline| Instant::now() >= deadline) {
                break;
            }
            let batch_started = Instant::now();
            let report = self.process_batch(&batch)?;

            summary.batches += 1;
            summary.processed += report.processed() as u64;
            summary.lost += report.lost() as u64;
            summary.last_batch = Some(report.batch);

            if self.config.paced {
                let next = batch_started.checked_add(self.config.batch_interval);
                let wake = match (next, until) {
                    (Some(next), Some(deadline)) => Some(next.min(deadline)),
                    (next, None) => next,
                    (None, deadline) => deadline,
                };
                if let Some(wait) = wake.and_then(|w| w.checked_duration_since(Instant::now())) {
                    std::thread::sleep(wait);
                }
            }
        }

        summary.elapsed = started.elapsed();
        info!(
            batches = summary.batches,
            processed = summary.processed,
            lost = summary.lost,
            "run finished"
        );
        Ok(summary)
    }

    /// Commit a finished barrier, or explain why it was not committed.
    fn resolve(&self, batch: BatchId, mut barrier: Barrier<'_>) -> KeyOutcome {
        let key = barrier.key;

        if let Some(error) = barrier.error.take() {
            warn!(key, batch = batch.0, error = %error, "update rejected");
            self.events.broadcast_lost(key, batch, error.to_string());
            return KeyOutcome::Rejected(error);
        }

        if !barrier.is_complete() {
            warn!(
                key,
                batch = batch.0,
                received = barrier.received,
                expected = barrier.expected,
                "shards missed the barrier"
            );
            self.events.broadcast_lost(
                key,
                batch,
                format!(
                    "barrier expired with {}/{} shards",
                    barrier.received, barrier.expected
                ),
            );
            return KeyOutcome::Lost {
                received: barrier.received,
                expected: barrier.expected,
            };
        }

        let (state, outcome) = match (barrier.layout, barrier.full) {
            (None, Some(model)) => (KeyState::Unsplit(model), KeyOutcome::Updated),
            (Some(layout), _) => {
                let mut shards = barrier.shards;
                shards.sort_by_key(|s| s.shard_index);
                if let Err(error) = combine(shards.iter().cloned()) {
                    warn!(key, batch = batch.0, error = %error, "combine failed");
                    self.events.broadcast_lost(key, batch, error.to_string());
                    return KeyOutcome::Rejected(error);
                }
                let count = shards.len();
                (
                    KeyState::Sharded { layout, shards },
                    KeyOutcome::Combined { shards: count },
                )
            }
            (None, None) => {
                return KeyOutcome::Lost {
                    received: barrier.received,
                    expected: barrier.expected,
                }
            }
        };

        if let Err(error) = self.store.put(key, state) {
            warn!(key, batch = batch.0, error = %error, "commit failed");
            self.events.broadcast_lost(key, batch, error.to_string());
            return KeyOutcome::Rejected(error);
        }

        self.counter.record_processed(1);
        match outcome {
            KeyOutcome::Combined { shards } => self.events.broadcast_combined(key, batch, shards),
            _ => self.events.broadcast_updated(key, batch),
        }
        outcome
    }

    // --- Checkpoints ---

    /// Write a checkpoint of the current table now.
    ///
    /// Returns None when checkpoints are disabled.
    pub fn checkpoint_now(&self) -> Result<Option<PathBuf>> {
        let progress = self.progress.lock();
        let batch = progress.last_batch.unwrap_or_default();
        match self.checkpoints {
            Some(ref store) => Ok(Some(self.write_checkpoint(store, batch)?)),
            None => Ok(None),
        }
    }

    fn write_checkpoint(&self, store: &CheckpointStore, batch: BatchId) -> Result<PathBuf> {
        let checkpoint = Checkpoint {
            batch,
            timestamp: Timestamp::now(),
            tau_local: self.config.tau_local,
            entries: self.store.snapshot(),
        };
        let path = store.write(&checkpoint)?;
        info!(batch = batch.0, path = %path.display(), "checkpoint written");
        self.events.broadcast_checkpoint(batch, &path);
        Ok(path)
    }

    /// Replace the table with the newest valid checkpoint.
    ///
    /// Returns the batch the checkpoint reflects, or None when there is
    /// nothing to restore. Every restored entry must satisfy the state
    /// invariants and match the layout this engine would compute.
    pub fn restore_latest(&self) -> Result<Option<BatchId>> {
        let Some(ref store) = self.checkpoints else {
            return Ok(None);
        };
        let Some(checkpoint) = store.latest()? else {
            return Ok(None);
        };

        if checkpoint.tau_local != self.config.tau_local {
            return Err(EngineError::InvalidConfig(format!(
                "checkpoint was taken with tau_local = {}, engine uses {}",
                checkpoint.tau_local, self.config.tau_local
            )));
        }

        for (key, state) in &checkpoint.entries {
            validate_key_state(key, state)?;
            let params = state
                .params()
                .ok_or_else(|| EngineError::Corruption(format!("{} has no shards", key)))?;
            match state {
                KeyState::Unsplit(_) if self.splitter.needs_split(params) => {
                    return Err(EngineError::Corruption(format!(
                        "{} is stored unsplit but exceeds tau_local",
                        key
                    )));
                }
                KeyState::Sharded { .. } if !self.splitter.needs_split(params) => {
                    return Err(EngineError::Corruption(format!(
                        "{} is stored sharded but is within tau_local",
                        key
                    )));
                }
                KeyState::Sharded { layout, .. } => {
                    if *layout != self.splitter.layout_for(params)? {
                        return Err(EngineError::Corruption(format!(
                            "{} has a shard layout this engine would not produce",
                            key
                        )));
                    }
                }
                KeyState::Unsplit(_) => {}
            }
        }

        let mut progress = self.progress.lock();
        self.splitter.clear();
        for (key, state) in &checkpoint.entries {
            if let KeyState::Sharded { layout, .. } = state {
                self.splitter.record_layout(key, layout)?;
            }
        }
        let keys = checkpoint.entries.len();
        self.store.restore(checkpoint.entries);
        progress.last_batch = Some(checkpoint.batch);

        info!(batch = checkpoint.batch.0, keys, "restored checkpoint");
        Ok(Some(checkpoint.batch))
    }

    // --- Queries ---

    /// Observable full state of a key, combining shards if needed.
    pub fn full_state(&self, key: &str) -> Result<ModelState> {
        match self.store.get(key) {
            Some(KeyState::Unsplit(state)) => Ok(state),
            Some(KeyState::Sharded { shards, .. }) => combine(shards),
            None => Err(EngineError::KeyNotFound(key.to_string())),
        }
    }

    /// Stored state of a key.
    pub fn key_state(&self, key: &str) -> Option<KeyState> {
        self.store.get(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.store.keys()
    }

    /// Last committed (or restored) batch.
    pub fn last_batch(&self) -> Option<BatchId> {
        self.progress.lock().last_batch
    }

    /// Shared handle to the processed-state counter.
    pub fn counter(&self) -> ThroughputCounter {
        self.counter.clone()
    }

    pub fn subscribe(&self, config: EventConfig) -> EventHandle {
        self.events.subscribe(config)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.events.unsubscribe(id)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn worker_count(&self) -> usize {
        self.pool.size()
    }

    pub fn stats(&self) -> EngineStats {
        let progress = self.progress.lock();
        let mut stats = EngineStats {
            batches_committed: progress.batches_committed,
            states_processed: self.counter.processed(),
            states_lost: self.counter.lost(),
            last_batch: progress.last_batch,
            ..Default::default()
        };
        for (_, state) in self.store.snapshot() {
            stats.key_count += 1;
            if state.is_sharded() {
                stats.sharded_key_count += 1;
            }
            stats.shard_count += state.shard_count() as u64;
        }
        stats
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &WorkerPool {
        &self.pool
    }
}

impl<S: KeyedStateStore> Drop for Engine<S> {
    fn drop(&mut self) {
        self.events.close_all(DropReason::Shutdown);
    }
}

fn apply_full(state: ModelState, inputs: &[Arc<InputVector>]) -> Result<ModelState> {
    inputs
        .iter()
        .try_fold(state, |state, input| full_state_update(&state, input))
}

fn apply_partial(shard: PartialState, inputs: &[Arc<InputVector>]) -> Result<PartialState> {
    inputs
        .iter()
        .try_fold(shard, |shard, input| partial_state_update(&shard, input))
}
