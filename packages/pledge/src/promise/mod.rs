// the completion core.
//
// the organization of these modules is as such:
//
//      cell: The pooled shared state of an operation and its state machine. Presents an
//      |     abstraction which is safe but panicky and inconvenient.
//      |
//      api:  Producer and consumer handles, which adapt cell into a convenient and defensive
//      |     API. Blocking waits are built on the polling module.
//      |
//      chain: Chaining continuations onto handles.

pub(crate) mod cell;
mod api;
mod chain;
mod outcome;
mod polling;

pub(crate) use self::chain::guard;
pub use self::{
    api::{Deferred, Promise, Retained},
    outcome::{Outcome, State},
};
pub(crate) use self::api::misuse;
