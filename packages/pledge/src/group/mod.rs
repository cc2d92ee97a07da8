// fan-in combinators.
//
// every combinator is an accumulator shared (through an `Arc`) between its builder and one
// observer continuation per constituent operation. the builder counts as one extra constituent,
// which "completes" when it is sealed, so the accumulator can never settle while constituents
// are still being added, even if all the ones added so far already completed.
//
// if built with a cancel token, the accumulator owns a group-internal cancel source linked to
// that token, and hands out a token of the internal source for constituents to observe. what
// signals the internal source early depends on the combinator.

pub(crate) mod join;
pub(crate) mod merge;
pub(crate) mod race;
pub(crate) mod each;
pub(crate) mod shorthand;

use crate::{
    cancel::{CancelSource, CancelToken},
    error::{AggregateError, InvalidOperation},
    promise::misuse,
    util::spin::SpinLock,
};
use std::sync::atomic::{
    AtomicBool,
    AtomicU32,
    Ordering::{AcqRel, Acquire},
};


// builder version which marks the accumulator sealed.
const SEALED: u32 = u32::MAX;

// version check shared by every accumulator. each builder value carries the version it expects,
// and adding or sealing advances it, so a builder value can only be used once.
#[derive(Default)]
pub(crate) struct Version(AtomicU32);

impl Version {
    #[track_caller]
    pub(crate) fn advance(&self, expected: u32) -> u32 {
        let next = expected.wrapping_add(1);
        if expected == SEALED
            || next == SEALED
            || self.0.compare_exchange(expected, next, AcqRel, Acquire).is_err()
        {
            misuse(InvalidOperation::InvalidGroup);
        }
        next
    }

    #[track_caller]
    pub(crate) fn seal(&self, expected: u32) {
        if self.0.compare_exchange(expected, SEALED, AcqRel, Acquire).is_err() {
            misuse(InvalidOperation::InvalidGroup);
        }
    }
}


// group-internal cancellation.
pub(crate) struct GroupCancel {
    source: Option<CancelSource>,
    signaled: AtomicBool,
    // errors raised by the internal source's callbacks when this group signaled it.
    callback_error: SpinLock<Option<AggregateError>>,
}

impl GroupCancel {
    // construct, linked to `token` if given, and return the token for constituents to observe.
    //
    // panics if `token` is stale.
    #[track_caller]
    pub(crate) fn new(token: Option<&CancelToken>) -> (Self, CancelToken) {
        let source = token.map(|token| {
            if let Err(e) = token.ensure_valid() {
                misuse(e);
            }
            CancelSource::linked(token.as_slice())
        });
        let group_token = source.as_ref().map(CancelSource::token).unwrap_or_default();
        let cancel = GroupCancel {
            source,
            signaled: AtomicBool::new(false),
            callback_error: SpinLock::new(None),
        };
        (cancel, group_token)
    }

    // cancel the internal source, once.
    pub(crate) fn signal(&self) {
        let Some(source) = &self.source else { return };
        if self.signaled.swap(true, AcqRel) {
            return;
        }
        trace!("group signaling its constituents");
        if let Err(e) = source.cancel() {
            *self.callback_error.lock() = Some(e);
        }
    }

    pub(crate) fn take_error(&self) -> Option<AggregateError> {
        self.callback_error.lock().take()
    }
}
