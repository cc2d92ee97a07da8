//! Pooled asynchronous completion engine.
//!
//! An operation is created as a pair of handles: a [`Deferred`] producer, which completes it
//! exactly once as resolved, rejected, or canceled, and a [`Promise`] consumer, which chains
//! continuations onto it, awaits it, or blocks on it. Operation state lives in pooled cells which
//! are recycled once both sides are done with them, with generation tags making stale handles
//! fail loudly rather than alias a reused operation.
//!
//! Cancellation is cooperative, through [`CancelSource`] and [`CancelToken`]. Groups of operations
//! can be joined ([`AllGroup`], [`MergeGroup`]), raced ([`RaceGroup`]), or iterated in completion
//! order ([`EachGroup`]).

#[macro_use]
extern crate tracing;

mod util;
mod promise;
mod cancel;
mod group;
mod context;
pub mod config;
pub mod pool;
pub mod diagnostics;

pub use crate::{
    cancel::{CancelRegistration, CancelSource, CancelToken, Registration},
    config::Config,
    context::{Context, ExecutionContext, ManualContext, Schedule, Task, TokioContext},
    group::{
        each::{Completed, EachGroup, EachSequence},
        join::{AllGroup, AllResultsGroup},
        merge::{Append, MergeGroup, MergeResultsGroup, MergeTuple},
        race::{RaceGroup, RaceWithIndexGroup},
        shorthand::{all, race, race_first},
    },
    promise::{Deferred, Outcome, Promise, Retained, State},
};

/// Error types
pub mod error;

/// Future types
pub mod future {
    pub use crate::group::each::MoveNext;
}
