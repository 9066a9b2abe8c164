//! TaskSequencer - strictly ordered delayed-task queue
//!
//! A [`Sequencer`] runs caller-supplied tasks one at a time, in the order
//! they were added. Each task waits its own delay, measured from the moment
//! the previous task finished, before its body runs. It is a pacing pipeline
//! for side-effecting work such as rate-limited prompts or staged API calls,
//! not a thread pool.
//!
//! # Core Concepts
//!
//! - **Wait/exec pairs**: every task is a wait unit `<id>_delay` followed by
//!   a zero-delay exec unit `<id>` that depends on it
//! - **Cooperative cancellation**: cancel flags are checked when a unit
//!   starts; running bodies are never interrupted
//! - **Suspend flag**: `pause`/`resume` gate whether the next unit may start
//! - **Two body flavors**: direct closures and suspending (async) closures,
//!   both holding the single worker until they complete
//!
//! # Modules
//!
//! - [`config`] - Configuration types and loading
//! - [`unit`] - Delayed units and their cancel handles
//! - [`error`] - Failures contained at unit boundaries

mod queue;
mod sequencer;

pub mod config;
pub mod error;
pub mod unit;

pub use config::SequencerConfig;
pub use error::UnitFailure;
pub use queue::{QueueEntry, QueueEntryStatus, QueueState, SequencerStats, UnitRole};
pub use sequencer::{DELAY_SUFFIX, Sequencer};
pub use unit::{DelayedUnit, UnitHandle, UnitOutcome, UnitState};
