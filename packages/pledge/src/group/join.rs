// joining: wait for every constituent, then settle from all of their outcomes at once.

use crate::{
    cancel::CancelToken,
    error::{AggregateError, CancelCallbackError, InvalidOperation, Reason},
    group::{GroupCancel, Version},
    promise::{cell::Observer, misuse, Deferred, Outcome, Promise},
    util::spin::SpinLock,
};
use smallvec::SmallVec;
use std::{
    fmt::{self, Debug, Formatter},
    mem::take,
    sync::{
        atomic::{AtomicUsize, Ordering::AcqRel},
        Arc,
    },
};


type Settle<S> = Box<dyn FnOnce(Vec<Outcome<S>>, Option<AggregateError>) + Send>;

// accumulator shared by every joining group. `S` is the slot type.
pub(crate) struct JoinCore<S> {
    pub(crate) version: Version,
    slots: SpinLock<Vec<Option<Outcome<S>>>>,
    // constituents yet to complete, plus one for the builder until sealed.
    pending: AtomicUsize,
    cancel: GroupCancel,
    settle: SpinLock<Option<Settle<S>>>,
}

impl<S: Send + 'static> JoinCore<S> {
    #[track_caller]
    pub(crate) fn new(capacity: usize, token: Option<&CancelToken>) -> (Self, CancelToken) {
        let (cancel, group_token) = GroupCancel::new(token);
        let core = JoinCore {
            version: Version::default(),
            slots: SpinLock::new(Vec::with_capacity(capacity)),
            pending: AtomicUsize::new(1),
            cancel,
            settle: SpinLock::new(None),
        };
        (core, group_token)
    }

    // reserve the next slot for a constituent about to be observed.
    pub(crate) fn add_slot(&self) -> usize {
        self.pending.fetch_add(1, AcqRel);
        let mut slots = self.slots.lock();
        slots.push(None);
        slots.len() - 1
    }

    // stop accepting constituents. `settle` runs once every constituent has completed.
    pub(crate) fn seal(&self, settle: Settle<S>) {
        *self.settle.lock() = Some(settle);
        self.arrive();
    }

    pub(crate) fn record(&self, index: usize, outcome: Outcome<S>) {
        if !outcome.is_resolved() {
            self.cancel.signal();
        }
        self.slots.lock()[index] = Some(outcome);
        self.arrive();
    }

    fn arrive(&self) {
        if self.pending.fetch_sub(1, AcqRel) != 1 {
            return;
        }
        let slots = take(&mut *self.slots.lock());
        let settle = self.settle.lock().take();
        let slots = slots
            .into_iter()
            .map(|slot| slot.expect("group slot empty after every constituent arrived (internal bug)"))
            .collect();
        let settle = settle.expect("group settled before sealed (internal bug)");
        trace!("group settling");
        settle(slots, self.cancel.take_error());
    }
}

impl<S: Send + 'static> Observer<S> for JoinCore<S> {
    fn observe(self: Arc<Self>, index: usize, outcome: Outcome<S>) {
        self.record(index, outcome);
    }
}

// aggregate rejection from reasons in add order, with callback errors nested after them.
pub(crate) fn aggregate(
    mut reasons: SmallVec<[Reason; 2]>,
    callback_error: Option<AggregateError>,
) -> Reason {
    if let Some(e) = callback_error {
        reasons.push(Reason::new(CancelCallbackError(e)));
    }
    AggregateError::new(reasons).into()
}

// combine slots by priority: rejected over canceled over resolved.
pub(crate) fn join_outcomes<S>(
    slots: Vec<Outcome<S>>,
    callback_error: Option<AggregateError>,
) -> Outcome<Vec<S>> {
    let mut values = Vec::with_capacity(slots.len());
    let mut reasons = SmallVec::new();
    let mut canceled = false;
    for slot in slots {
        match slot {
            Outcome::Resolved(value) => values.push(value),
            Outcome::Rejected(reason) => reasons.push(reason),
            Outcome::Canceled => canceled = true,
        }
    }
    if !reasons.is_empty() || callback_error.is_some() {
        Outcome::Rejected(aggregate(reasons, callback_error))
    } else if canceled {
        Outcome::Canceled
    } else {
        Outcome::Resolved(values)
    }
}

// resolve with every slot as-is, unless cancel callbacks failed.
pub(crate) fn join_results<S>(
    slots: Vec<Outcome<S>>,
    callback_error: Option<AggregateError>,
) -> Outcome<Vec<Outcome<S>>> {
    match callback_error {
        Some(e) => Outcome::Rejected(aggregate(SmallVec::new(), Some(e))),
        None => Outcome::Resolved(slots),
    }
}

#[track_caller]
pub(crate) fn core_of<C>(core: Option<Arc<C>>) -> Arc<C> {
    core.unwrap_or_else(|| misuse(InvalidOperation::InvalidGroup))
}


macro_rules! join_group {
    (
        $(#[$attr:meta])*
        $name:ident => $output:ty, $join:ident
    ) => {
        $(#[$attr])*
        pub struct $name<T: Send + 'static> {
            core: Option<Arc<JoinCore<T>>>,
            version: u32,
        }

        impl<T: Send + 'static> $name<T> {
            /// Construct, expecting about `capacity` operations
            #[track_caller]
            pub fn new(capacity: usize) -> Self {
                let (core, _) = JoinCore::new(capacity, None);
                $name { core: Some(Arc::new(core)), version: 0 }
            }

            /// Construct, linked to `token`, and return the group token
            ///
            /// The group token is canceled when `token` is, or when the first operation completes
            /// without resolving. Pass it on to the operations being joined so they can stop
            /// early. Panics if `token` is stale.
            #[track_caller]
            pub fn with_cancel(capacity: usize, token: &CancelToken) -> (Self, CancelToken) {
                let (core, group_token) = JoinCore::new(capacity, Some(token));
                ($name { core: Some(Arc::new(core)), version: 0 }, group_token)
            }

            /// Add an operation
            ///
            /// Panics if this builder is default-constructed.
            #[track_caller]
            pub fn add(self, promise: Promise<T>) -> Self {
                let core = core_of(self.core);
                let version = core.version.advance(self.version);
                let index = core.add_slot();
                promise.observe(Arc::clone(&core) as _, index);
                $name { core: Some(core), version }
            }

            /// Finish adding operations, and get the joined operation
            ///
            /// With no operations added, the joined operation is immediately resolved. Panics if
            /// this builder is default-constructed.
            #[track_caller]
            pub fn wait_async(self) -> Promise<$output> {
                let core = core_of(self.core);
                core.version.seal(self.version);
                let (deferred, promise) = Deferred::new();
                core.seal(Box::new(move |slots: Vec<Outcome<T>>, callback_error: Option<AggregateError>| {
                    deferred.settle_in(None, $join(slots, callback_error))
                        .expect("group operation completed twice (internal bug)");
                }));
                promise
            }
        }

        impl<T: Send + 'static> Default for $name<T> {
            fn default() -> Self {
                $name { core: None, version: 0 }
            }
        }

        impl<T: Send + 'static> Debug for $name<T> {
            fn fmt(&self, f: &mut Formatter) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("valid", &self.core.is_some())
                    .field("version", &self.version)
                    .finish()
            }
        }
    };
}

join_group!(
    /// Builder joining operations of one type into an operation resolving with all their values
    ///
    /// The joined operation waits for every operation added, even after one fails. Then it
    /// rejects with an [`AggregateError`] of every rejection reason in the order the operations
    /// were added, if any rejected, or else is canceled, if any was canceled, or else resolves
    /// with the values in the order the operations were added.
    AllGroup => Vec<T>, join_outcomes
);

join_group!(
    /// Builder joining operations of one type into an operation resolving with all their outcomes
    ///
    /// Like [`AllGroup`], but resolves with every outcome in the order the operations were added,
    /// whatever they are.
    AllResultsGroup => Vec<Outcome<T>>, join_results
);


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cancel::CancelSource, error::Failure};

    fn reasons_of(failure: Failure) -> Vec<String> {
        let reason = failure.reason().cloned().expect("expected rejection");
        let aggregate = reason.as_aggregate().expect("expected aggregate");
        aggregate.reasons().iter().map(|r| r.to_string()).collect()
    }

    #[test]
    fn all_resolved_in_add_order_test() {
        let (d0, p0) = Deferred::<u32>::new();
        let (d1, p1) = Deferred::<u32>::new();
        let mut joined = AllGroup::new(2).add(p0).add(p1).wait_async();
        d1.resolve(1);
        assert!(joined.is_pending());
        d0.resolve(0);
        assert_eq!(joined.wait().unwrap(), vec![0, 1]);
    }

    #[test]
    fn empty_all_test() {
        let mut joined = AllGroup::<u32>::new(0).wait_async();
        assert_eq!(joined.wait().unwrap(), Vec::<u32>::new());
    }

    #[test]
    fn priority_test() {
        let mut joined = AllGroup::new(3)
            .add(Promise::resolved(1u32))
            .add(Promise::canceled())
            .add(Promise::rejected(Reason::msg("e")))
            .wait_async();
        assert_eq!(reasons_of(joined.wait().unwrap_err()), vec!["e"]);

        let mut joined = AllGroup::new(2)
            .add(Promise::resolved(1u32))
            .add(Promise::canceled())
            .wait_async();
        assert!(joined.wait().unwrap_err().is_canceled());
    }

    #[test]
    fn aggregate_containment_test() {
        let (d0, p0) = Deferred::<u32>::new();
        let (d1, p1) = Deferred::<u32>::new();
        let (d2, p2) = Deferred::<u32>::new();
        let mut joined = AllGroup::new(3).add(p0).add(p1).add(p2).wait_async();
        d2.reject(Reason::msg("third"));
        d1.resolve(1);
        d0.reject(Reason::msg("first"));
        assert_eq!(reasons_of(joined.wait().unwrap_err()), vec!["first", "third"]);
    }

    #[test]
    fn results_never_reject_test() {
        let mut joined = AllResultsGroup::new(3)
            .add(Promise::resolved(1u32))
            .add(Promise::rejected(Reason::msg("e")))
            .add(Promise::canceled())
            .wait_async();
        let outcomes = joined.wait().unwrap();
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].value(), Some(&1));
        assert_eq!(outcomes[1].reason().unwrap().to_string(), "e");
        assert!(matches!(outcomes[2], Outcome::Canceled));
    }

    #[test]
    fn signals_group_token_and_waits_test() {
        let source = CancelSource::new();
        let (group, group_token) = AllGroup::with_cancel(2, &source.token());
        let (d0, p0) = Deferred::<u32>::new();
        let (d1, p1) = Deferred::<u32>::new();
        d1.cancel_on(&group_token);
        let mut joined = group.add(p0).add(p1).wait_async();

        assert!(!group_token.is_cancel_requested());
        d0.reject(Reason::msg("boom"));
        // the still-running operation observed the group token and canceled itself
        assert!(group_token.is_cancel_requested());
        assert!(!d1.is_pending());
        assert!(!source.is_cancel_requested());
        assert_eq!(reasons_of(joined.wait().unwrap_err()), vec!["boom"]);
    }

    #[test]
    fn external_token_reaches_constituents_test() {
        let source = CancelSource::new();
        let (group, group_token) = AllGroup::<u32>::with_cancel(1, &source.token());
        let (deferred, promise) = Deferred::<u32>::new();
        deferred.cancel_on(&group_token);
        let mut joined = group.add(promise).wait_async();
        source.cancel().unwrap();
        assert!(joined.wait().unwrap_err().is_canceled());
    }

    #[test]
    fn callback_error_nested_test() {
        let source = CancelSource::new();
        let (group, group_token) = AllResultsGroup::<u32>::with_cancel(2, &source.token());
        group_token.register(|| panic!("bad callback"));
        let (d1, p1) = Deferred::<u32>::new();
        let mut joined = group.add(Promise::canceled()).add(p1).wait_async();
        d1.resolve(1);

        let reason = joined.wait().unwrap_err().reason().cloned().unwrap();
        let aggregate = reason.as_aggregate().unwrap();
        assert_eq!(aggregate.len(), 1);
        let nested = aggregate.reasons()[0].downcast_ref::<CancelCallbackError>().unwrap();
        assert_eq!(nested.0.reasons()[0].to_string(), "callback panicked: bad callback");
    }

    #[test]
    #[should_panic(expected = "promise group is invalid")]
    fn default_builder_add_panics_test() {
        let _ = AllGroup::<u32>::default().add(Promise::resolved(1));
    }

    #[test]
    #[should_panic(expected = "promise group is invalid")]
    fn default_builder_seal_panics_test() {
        let _ = AllResultsGroup::<u32>::default().wait_async();
    }

    #[test]
    #[should_panic(expected = "cancel token refers to a disposed source")]
    fn stale_token_panics_test() {
        let source = CancelSource::new();
        let token = source.token();
        drop(source);
        let _ = AllGroup::<u32>::with_cancel(0, &token);
    }
}
