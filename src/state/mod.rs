//! Model state construction, update, splitting and recombination.
//!
//! A key whose parameter count `m` stays within `tau_local` is updated as
//! one unit with [`full_state_update`]. Larger keys are split once into a
//! fixed set of contiguous shards; each shard is updated on its own with
//! [`partial_state_update`] and the set is folded back with [`combine`].
//!
//! The update rule is element-wise, so for any state `s` and input `x`:
//!
//! ```ignore
//! let shards = splitter.split(&s)?;
//! let updated = shards
//!     .iter()
//!     .map(|shard| partial_state_update(shard, &x))
//!     .collect::<Result<Vec<_>>>()?;
//! assert_eq!(combine(updated)?, full_state_update(&s, &x)?);
//! ```

mod combine;
mod factory;
mod split;
mod update;

pub use combine::{combine, validate_key_state};
pub use factory::{create, linspace, population};
pub use split::{shard_layout, Splitter};
pub use update::{full_state_update, partial_state_update};
