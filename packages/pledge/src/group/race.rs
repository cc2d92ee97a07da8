// racing: settle like the first constituent to complete.
//
// the first arrival that qualifies (any arrival, or only resolutions if non-resolved arrivals
// should not win) is the winner. the group token is then signaled so the losers can stop early,
// and only after that signal returns is the group settled, so that errors from cancel callbacks
// can be folded in. losers are still observed to completion; their rejections are reported as
// unhandled unless suppressed.

use crate::{
    cancel::CancelToken,
    diagnostics,
    error::{AggregateError, InvalidOperation, Reason},
    group::{
        join::{aggregate, core_of},
        GroupCancel,
        Version,
    },
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


type Settle<T> = Box<dyn FnOnce(Outcome<(usize, T)>) + Send>;
type Rejections = SmallVec<[(usize, Reason); 2]>;

pub(crate) struct RaceCore<T> {
    version: Version,
    // constituents yet to complete, plus one for the builder until sealed.
    pending: AtomicUsize,
    cancel: GroupCancel,
    state: SpinLock<RaceState<T>>,
}

struct RaceState<T> {
    cancel_on_non_resolved: bool,
    suppress: bool,
    added: usize,
    decided: bool,
    // the winner has been decided and the group token signaled.
    signaled: bool,
    winner: Option<(usize, Outcome<T>)>,
    // rejections that arrived while undecided.
    rejections: Rejections,
    settle: Option<Settle<T>>,
}

// final outcome from the winner, if any, and the rejections to fold in.
fn conclude<T>(
    winner: Option<(usize, Outcome<T>)>,
    mut rejections: Rejections,
    callback_error: Option<AggregateError>,
) -> Outcome<(usize, T)> {
    match winner {
        Some((index, Outcome::Resolved(value))) if callback_error.is_none() => {
            return Outcome::Resolved((index, value));
        }
        Some((_, Outcome::Canceled)) if callback_error.is_none() => return Outcome::Canceled,
        Some((index, Outcome::Rejected(reason))) => rejections.push((index, reason)),
        Some(_) => (),
        None if rejections.is_empty() && callback_error.is_none() => return Outcome::Canceled,
        None => (),
    }
    rejections.sort_by_key(|&(index, _)| index);
    let reasons = rejections.into_iter().map(|(_, reason)| reason).collect();
    Outcome::Rejected(aggregate(reasons, callback_error))
}

impl<T: Send + 'static> RaceCore<T> {
    #[track_caller]
    fn new(token: Option<&CancelToken>) -> (Self, CancelToken) {
        let (cancel, group_token) = GroupCancel::new(token);
        let core = RaceCore {
            version: Version::default(),
            pending: AtomicUsize::new(1),
            cancel,
            state: SpinLock::new(RaceState {
                cancel_on_non_resolved: true,
                suppress: false,
                added: 0,
                decided: false,
                signaled: false,
                winner: None,
                rejections: SmallVec::new(),
                settle: None,
            }),
        };
        (core, group_token)
    }

    fn add(&self) -> usize {
        self.pending.fetch_add(1, AcqRel);
        let mut state = self.state.lock();
        state.added += 1;
        state.added - 1
    }

    // checked before the result operation exists, so the panic leaves nothing pending behind.
    #[track_caller]
    fn ensure_nonempty(&self) {
        let added = self.state.lock().added;
        if added == 0 {
            misuse(InvalidOperation::EmptyRace);
        }
    }

    fn seal(&self, settle: Settle<T>) {
        let ready = {
            let mut state = self.state.lock();
            if state.signaled {
                let winner = state.winner.take();
                Some((settle, winner, take(&mut state.rejections)))
            } else {
                state.settle = Some(settle);
                None
            }
        };
        if let Some((settle, winner, rejections)) = ready {
            settle(conclude(winner, rejections, self.cancel.take_error()));
        }
        self.arrive();
    }

    fn record(&self, index: usize, outcome: Outcome<T>) {
        let mut unhandled = SmallVec::<[Reason; 2]>::new();
        let won = {
            let mut state = self.state.lock();
            if state.decided {
                if let (Outcome::Rejected(reason), false) = (outcome, state.suppress) {
                    unhandled.push(reason);
                }
                false
            } else if outcome.is_resolved() || state.cancel_on_non_resolved {
                state.decided = true;
                // rejections which arrived earlier are only folded into a rejected winner
                if !matches!(outcome, Outcome::Rejected(_)) {
                    let rejections = take(&mut state.rejections);
                    if !state.suppress {
                        unhandled.extend(rejections.into_iter().map(|(_, reason)| reason));
                    }
                }
                state.winner = Some((index, outcome));
                true
            } else {
                if let Outcome::Rejected(reason) = outcome {
                    state.rejections.push((index, reason));
                }
                false
            }
        };
        for reason in unhandled {
            diagnostics::report_unhandled(reason);
        }

        if won {
            trace!(index, "race decided");
            self.cancel.signal();
            let ready = {
                let mut state = self.state.lock();
                state.signaled = true;
                state.settle.take().map(|settle| {
                    (settle, state.winner.take(), take(&mut state.rejections))
                })
            };
            if let Some((settle, winner, rejections)) = ready {
                settle(conclude(winner, rejections, self.cancel.take_error()));
            }
        }
        self.arrive();
    }

    fn arrive(&self) {
        if self.pending.fetch_sub(1, AcqRel) != 1 {
            return;
        }
        // every constituent completed without a winner
        let ready = {
            let mut state = self.state.lock();
            if state.decided {
                None
            } else {
                state.settle.take().map(|settle| (settle, take(&mut state.rejections)))
            }
        };
        if let Some((settle, rejections)) = ready {
            trace!("race completed without a winner");
            settle(conclude(None, rejections, self.cancel.take_error()));
        }
    }
}

impl<T: Send + 'static> Observer<T> for RaceCore<T> {
    fn observe(self: Arc<Self>, index: usize, outcome: Outcome<T>) {
        self.record(index, outcome);
    }
}


macro_rules! race_group {
    (
        $(#[$attr:meta])*
        $name:ident => $output:ty, $project:expr
    ) => {
        $(#[$attr])*
        pub struct $name<T: Send + 'static> {
            core: Option<Arc<RaceCore<T>>>,
            version: u32,
        }

        impl<T: Send + 'static> $name<T> {
            /// Construct
            ///
            /// The capacity hint is accepted for symmetry with the other groups; a race keeps no
            /// per-operation storage.
            #[track_caller]
            pub fn new(_capacity: usize) -> Self {
                let (core, _) = RaceCore::new(None);
                $name { core: Some(Arc::new(core)), version: 0 }
            }

            /// Construct, linked to `token`, and return the group token
            ///
            /// The group token is canceled when `token` is, or once the race is decided. Pass it
            /// on to the operations being raced so the losers can stop early. Panics if `token`
            /// is stale.
            #[track_caller]
            pub fn with_cancel(_capacity: usize, token: &CancelToken) -> (Self, CancelToken) {
                let (core, group_token) = RaceCore::new(Some(token));
                ($name { core: Some(Arc::new(core)), version: 0 }, group_token)
            }

            /// Set whether an operation completing without resolving wins the race
            ///
            /// Defaults to true. If false, the race waits for an operation to resolve, and only
            /// if none does is it rejected with every rejection reason, or otherwise canceled.
            #[track_caller]
            pub fn with_cancel_on_non_resolved(self, cancel_on_non_resolved: bool) -> Self {
                self.state_mut(|state| state.cancel_on_non_resolved = cancel_on_non_resolved)
            }

            /// Set whether rejections of operations which lost the race go unreported
            ///
            /// Defaults to false, in which case they are reported as unhandled rejections.
            #[track_caller]
            pub fn with_suppress_unobserved_rejections(self, suppress: bool) -> Self {
                self.state_mut(|state| state.suppress = suppress)
            }

            #[track_caller]
            fn state_mut<F: FnOnce(&mut RaceState<T>)>(self, f: F) -> Self {
                let core = core_of(self.core);
                f(&mut core.state.lock());
                $name { core: Some(core), version: self.version }
            }

            /// Add an operation
            ///
            /// Panics if this builder is default-constructed.
            #[track_caller]
            pub fn add(self, promise: Promise<T>) -> Self {
                let core = core_of(self.core);
                let version = core.version.advance(self.version);
                let index = core.add();
                promise.observe(Arc::clone(&core) as _, index);
                $name { core: Some(core), version }
            }

            /// Finish adding operations, and get the racing operation
            ///
            /// Panics if no operations were added, or if this builder is default-constructed.
            #[track_caller]
            pub fn wait_async(self) -> Promise<$output> {
                let core = core_of(self.core);
                core.version.seal(self.version);
                core.ensure_nonempty();
                let (deferred, promise) = Deferred::new();
                core.seal(Box::new(move |outcome: Outcome<(usize, T)>| {
                    deferred.settle_in(None, outcome.map($project))
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

race_group!(
    /// Builder racing operations of one type
    ///
    /// The racing operation completes like the first operation to complete. If that one rejected,
    /// the race rejects with an [`AggregateError`] containing its reason.
    RaceGroup => T, |(_, value): (usize, T)| value
);

race_group!(
    /// Builder racing operations of one type, resolving with the winner's index as well
    ///
    /// Like [`RaceGroup`], but resolves with the index, in the order added, of the operation
    /// which won alongside its value.
    RaceWithIndexGroup => (usize, T), |pair: (usize, T)| pair
);


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cancel::CancelSource,
        config::{install, test_lock, Config},
        error::{CancelCallbackError, Failure},
    };
    use std::sync::Mutex;

    #[test]
    fn first_completion_wins_test() {
        let (d0, p0) = Deferred::<u32>::new();
        let (d1, p1) = Deferred::<u32>::new();
        let mut raced = RaceGroup::new(2).add(p0).add(p1).wait_async();
        d1.resolve(1);
        assert_eq!(raced.wait().unwrap(), 1);
        d0.resolve(0);
    }

    #[test]
    fn with_index_test() {
        let (d0, p0) = Deferred::<&str>::new();
        let (_d1, p1) = Deferred::<&str>::new();
        let mut raced = RaceWithIndexGroup::new(2).add(p1).add(p0).wait_async();
        d0.resolve("zero");
        assert_eq!(raced.wait().unwrap(), (1, "zero"));
    }

    #[test]
    fn non_resolved_winner_test() {
        let (d0, p0) = Deferred::<u32>::new();
        let mut raced = RaceGroup::new(2).add(p0).add(Promise::canceled()).wait_async();
        assert!(raced.wait().unwrap_err().is_canceled());
        d0.resolve(0);

        let mut raced = RaceGroup::new(1)
            .add(Promise::<u32>::rejected(Reason::msg("first")))
            .wait_async();
        let reason = raced.wait().unwrap_err().reason().cloned().unwrap();
        assert_eq!(reason.as_aggregate().unwrap().reasons()[0].to_string(), "first");
    }

    #[test]
    fn resolution_preferred_test() {
        let (d1, p1) = Deferred::<u32>::new();
        let mut raced = RaceGroup::new(2)
            .with_cancel_on_non_resolved(false)
            .add(Promise::canceled())
            .add(p1)
            .wait_async();
        assert!(raced.is_pending());
        d1.resolve(5);
        assert_eq!(raced.wait().unwrap(), 5);
    }

    #[test]
    fn no_resolution_test() {
        let mut raced = RaceGroup::<u32>::new(3)
            .with_cancel_on_non_resolved(false)
            .with_suppress_unobserved_rejections(true)
            .add(Promise::rejected(Reason::msg("b")))
            .add(Promise::canceled())
            .add(Promise::rejected(Reason::msg("c")))
            .wait_async();
        let reason = raced.wait().unwrap_err().reason().cloned().unwrap();
        let reasons = reason.as_aggregate().unwrap().reasons().iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>();
        assert_eq!(reasons, vec!["b", "c"]);

        let mut raced = RaceGroup::<u32>::new(1)
            .with_cancel_on_non_resolved(false)
            .add(Promise::canceled())
            .wait_async();
        assert!(matches!(raced.wait(), Err(Failure::Canceled)));
    }

    #[test]
    fn losers_signaled_test() {
        let source = CancelSource::new();
        let (group, group_token) = RaceGroup::with_cancel(2, &source.token());
        let (slow, p_slow) = Deferred::<u32>::new();
        slow.cancel_on(&group_token);
        let (fast, p_fast) = Deferred::<u32>::new();
        let mut raced = group.add(p_slow).add(p_fast).wait_async();
        fast.resolve(2);
        assert!(!slow.is_pending());
        assert_eq!(raced.wait().unwrap(), 2);
    }

    #[test]
    fn loser_rejections_reported_test() {
        let _guard = test_lock();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_2 = Arc::clone(&seen);
        install(Config::new().with_unhandled_rejection_hook(move |reason| {
            seen_2.lock().unwrap().push(reason.to_string());
        }));

        let (d0, p0) = Deferred::<u32>::new();
        let (d1, p1) = Deferred::<u32>::new();
        let mut raced = RaceGroup::new(2).add(p0).add(p1).wait_async();
        d0.resolve(0);
        d1.reject(Reason::msg("loud loser"));
        assert_eq!(raced.wait().unwrap(), 0);

        let (d0, p0) = Deferred::<u32>::new();
        let (d1, p1) = Deferred::<u32>::new();
        let mut raced = RaceGroup::new(2)
            .with_suppress_unobserved_rejections(true)
            .add(p0)
            .add(p1)
            .wait_async();
        d0.resolve(0);
        d1.reject(Reason::msg("quiet loser"));
        assert_eq!(raced.wait().unwrap(), 0);

        install(Config::new());
        let seen = seen.lock().unwrap();
        assert!(seen.iter().any(|s| s == "loud loser"));
        assert!(!seen.iter().any(|s| s == "quiet loser"));
    }

    #[test]
    fn callback_error_nested_test() {
        let source = CancelSource::new();
        let (group, group_token) = RaceGroup::with_cancel(2, &source.token());
        group_token.register(|| panic!("bad callback"));
        let (_d0, p0) = Deferred::<u32>::new();
        let mut raced = group.add(p0).add(Promise::resolved(1)).wait_async();

        let reason = raced.wait().unwrap_err().reason().cloned().unwrap();
        let aggregate = reason.as_aggregate().unwrap();
        assert!(aggregate.reasons()[0].downcast_ref::<CancelCallbackError>().is_some());
    }

    #[test]
    #[should_panic(expected = "a race requires at least one promise")]
    fn empty_race_panics_test() {
        let _ = RaceGroup::<u32>::new(0).wait_async();
    }

    #[test]
    fn empty_race_leaves_no_leak_test() {
        struct Unraced;

        let _guard = test_lock();
        let leaks = Arc::new(Mutex::new(Vec::<&'static str>::new()));
        let leaks_2 = Arc::clone(&leaks);
        install(Config::new()
            .with_validation(true)
            .with_leak_hook(move |report| leaks_2.lock().unwrap().push(report.type_name)));

        let result = std::panic::catch_unwind(|| {
            let _ = RaceGroup::<Unraced>::new(0).wait_async();
        });
        install(Config::new());
        assert!(result.is_err());
        assert!(!leaks.lock().unwrap().iter().any(|name| name.contains("Unraced")));
    }

    #[test]
    #[should_panic(expected = "promise group is invalid")]
    fn default_race_panics_test() {
        let _ = RaceWithIndexGroup::<u32>::default().add(Promise::resolved(1));
    }
}
