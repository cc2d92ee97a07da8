// iterating: yield constituents' outcomes in the order they complete.
//
// arrivals are queued with a sequence number. either of two cancellation inputs ends iteration,
// the caller's token or an iteration token attached to the sequence, and records the sequence
// number at which it was observed: arrivals from before that point are still yielded, and only
// then does iteration end.
//
// iteration does not observe the group token itself. it observes the caller's token through a
// registration made after the group token's link to it, so by the time iteration is marked
// canceled, every callback on the group token has already run, whenever it was registered.
// constituents which cancel themselves in response therefore always arrive first.
//
// disposing the sequence early signals the group token. constituents which complete after that
// have their rejections collected for the operation returned by dispose, which settles once every
// constituent has completed.

use crate::{
    cancel::{CancelRegistration, CancelToken, Registration},
    diagnostics,
    error::{AggregateError, Failure, Reason},
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
    collections::VecDeque,
    fmt::{self, Debug, Formatter},
    future::Future,
    mem::take,
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context as TaskContext, Poll, Waker},
};


/// Outcome of one operation of an [`EachGroup`], tagged with the order it was added in
#[derive(Debug, Clone)]
pub struct Completed<T> {
    /// Index of the operation, in the order added
    pub index: usize,
    /// How the operation completed
    pub outcome: Outcome<T>,
}

pub(crate) struct EachCore<T> {
    version: Version,
    cancel: GroupCancel,
    state: SpinLock<EachState<T>>,
}

struct EachState<T> {
    suppress: bool,
    added: usize,
    // added but not yet completed.
    remaining: usize,
    next_seq: u64,
    ready: VecDeque<(u64, Completed<T>)>,
    // sequence number at which iteration was canceled.
    canceled_at: Option<u64>,
    waker: Option<Waker>,
    disposed: bool,
    // rejections of constituents which completed after dispose.
    late: SmallVec<[Reason; 2]>,
    // present once dispose has finished signaling.
    on_disposed: Option<Deferred<()>>,
    // registration on the caller's token, which ends iteration.
    linked: Option<CancelRegistration>,
}

impl<T: Send + 'static> EachCore<T> {
    #[track_caller]
    fn new(capacity: usize, token: Option<&CancelToken>) -> (Self, CancelToken) {
        let (cancel, group_token) = GroupCancel::new(token);
        let core = EachCore {
            version: Version::default(),
            cancel,
            state: SpinLock::new(EachState {
                suppress: false,
                added: 0,
                remaining: 0,
                next_seq: 0,
                ready: VecDeque::with_capacity(capacity),
                canceled_at: None,
                waker: None,
                disposed: false,
                late: SmallVec::new(),
                on_disposed: None,
                linked: None,
            }),
        };
        (core, group_token)
    }

    fn add(&self) -> usize {
        let mut state = self.state.lock();
        state.remaining += 1;
        state.added += 1;
        state.added - 1
    }

    fn record(&self, index: usize, outcome: Outcome<T>) {
        let mut waker = None;
        let mut disposed = None;
        {
            let mut state = self.state.lock();
            state.remaining -= 1;
            let seq = state.next_seq;
            state.next_seq += 1;
            if state.disposed {
                if let (Outcome::Rejected(reason), false) = (outcome, state.suppress) {
                    state.late.push(reason);
                }
                if state.remaining == 0 {
                    disposed = state.on_disposed.take().map(|deferred| (deferred, take(&mut state.late)));
                }
            } else {
                state.ready.push_back((seq, Completed { index, outcome }));
                waker = state.waker.take();
            }
        }
        if let Some(waker) = waker {
            waker.wake();
        }
        if let Some((deferred, late)) = disposed {
            self.finish_dispose(deferred, late);
        }
    }

    // end iteration once the arrivals so far have been yielded.
    fn mark_canceled(&self) {
        let waker = {
            let mut state = self.state.lock();
            if state.canceled_at.is_none() {
                state.canceled_at = Some(state.next_seq);
                trace!(seq = state.next_seq, "each iteration canceled");
            }
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn poll_next(&self, cx: &mut TaskContext) -> Poll<Result<Option<Completed<T>>, Failure>> {
        let mut state = self.state.lock();
        let canceled_at = state.canceled_at;
        let yield_front = state.ready.front()
            .is_some_and(|&(seq, _)| canceled_at.map_or(true, |canceled_at| seq < canceled_at));
        if yield_front {
            let (_, completed) = state.ready.pop_front().expect("unreachable");
            return Poll::Ready(Ok(Some(completed)));
        }
        if canceled_at.is_some() {
            return Poll::Ready(Err(Failure::Canceled));
        }
        if state.remaining == 0 && state.ready.is_empty() {
            return Poll::Ready(Ok(None));
        }
        match &state.waker {
            Some(waker) if waker.will_wake(cx.waker()) => (),
            _ => state.waker = Some(cx.waker().clone()),
        }
        Poll::Pending
    }

    fn dispose(&self) -> Promise<()> {
        let (deferred, promise) = Deferred::new();
        let (unyielded, linked) = {
            let mut state = self.state.lock();
            state.disposed = true;
            state.waker = None;
            let suppress = state.suppress;
            let unyielded = take(&mut state.ready)
                .into_iter()
                .filter_map(|(_, completed)| match completed.outcome {
                    Outcome::Rejected(reason) if !suppress => Some(reason),
                    _ => None,
                })
                .collect::<SmallVec<[Reason; 2]>>();
            (unyielded, state.linked.take())
        };
        if let Some(linked) = linked {
            linked.try_unregister();
        }
        for reason in unyielded {
            diagnostics::report_unhandled(reason);
        }

        self.cancel.signal();

        let late = {
            let mut state = self.state.lock();
            if state.remaining == 0 {
                Some(take(&mut state.late))
            } else {
                trace!(remaining = state.remaining, "each disposed with operations still running");
                state.on_disposed = Some(deferred.clone());
                None
            }
        };
        if let Some(late) = late {
            self.finish_dispose(deferred, late);
        }
        promise
    }

    fn finish_dispose(&self, deferred: Deferred<()>, late: SmallVec<[Reason; 2]>) {
        let callback_error: Option<AggregateError> = self.cancel.take_error();
        let outcome = if late.is_empty() && callback_error.is_none() {
            Outcome::Resolved(())
        } else {
            Outcome::Rejected(aggregate(late, callback_error))
        };
        deferred.settle_in(None, outcome).expect("dispose completed twice (internal bug)");
    }
}

impl<T: Send + 'static> Observer<T> for EachCore<T> {
    fn observe(self: Arc<Self>, index: usize, outcome: Outcome<T>) {
        self.record(index, outcome);
    }
}

// register a callback ending iteration on `core` when `token` is canceled.
fn cancel_iteration_on<T: Send + 'static>(core: &Arc<EachCore<T>>, token: &CancelToken) -> Registration {
    let core = Arc::downgrade(core);
    token.register(move || {
        if let Some(core) = Weak::upgrade(&core) {
            core.mark_canceled();
        }
    })
}


/// Builder for iterating over operations in the order they complete
pub struct EachGroup<T: Send + 'static> {
    core: Option<Arc<EachCore<T>>>,
    version: u32,
}

impl<T: Send + 'static> EachGroup<T> {
    /// Construct, expecting about `capacity` operations
    #[track_caller]
    pub fn new(capacity: usize) -> Self {
        let (core, _) = EachCore::new(capacity, None);
        EachGroup { core: Some(Arc::new(core)), version: 0 }
    }

    /// Construct, linked to `token`, and return the group token
    ///
    /// The group token is canceled when `token` is, or when the sequence is disposed of early.
    /// Cancellation of `token` ends iteration, but only after every callback on the group token
    /// has run, so operations which cancel themselves in response are still yielded first. Panics
    /// if `token` is stale.
    #[track_caller]
    pub fn with_cancel(capacity: usize, token: &CancelToken) -> (Self, CancelToken) {
        let (core, group_token) = EachCore::new(capacity, Some(token));
        let core = Arc::new(core);
        // registered after the group token's own link, so it runs after the group token's callbacks
        if let Registration::Active(registration) = cancel_iteration_on(&core, token) {
            core.state.lock().linked = Some(registration);
        }
        (EachGroup { core: Some(core), version: 0 }, group_token)
    }

    /// Set whether rejections nobody iterated over go unreported
    ///
    /// Defaults to false.
    #[track_caller]
    pub fn with_suppress_unobserved_rejections(self, suppress: bool) -> Self {
        let core = core_of(self.core);
        core.state.lock().suppress = suppress;
        EachGroup { core: Some(core), version: self.version }
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
        EachGroup { core: Some(core), version }
    }

    /// Finish adding operations, and get the sequence of their outcomes
    ///
    /// Panics if this builder is default-constructed.
    #[track_caller]
    pub fn get_async_sequence(self) -> EachSequence<T> {
        let core = core_of(self.core);
        core.version.seal(self.version);
        EachSequence { core, iteration: None, disposed: false, ended: false }
    }
}

impl<T: Send + 'static> Default for EachGroup<T> {
    fn default() -> Self {
        EachGroup { core: None, version: 0 }
    }
}

impl<T: Send + 'static> Debug for EachGroup<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("EachGroup")
            .field("valid", &self.core.is_some())
            .field("version", &self.version)
            .finish()
    }
}


/// Single-pass sequence of the outcomes of an [`EachGroup`]'s operations, in completion order
///
/// Dropping the sequence disposes of it, and forgets the operation dispose returns.
pub struct EachSequence<T: Send + 'static> {
    core: Arc<EachCore<T>>,
    iteration: Option<CancelRegistration>,
    disposed: bool,
    // for the stream, which ends after yielding cancellation.
    ended: bool,
}

impl<T: Send + 'static> EachSequence<T> {
    /// End iteration when `token` is canceled
    ///
    /// Outcomes of operations which completed before that are still yielded. Unlike the group
    /// token, this does not signal the operations. Replaces any previous iteration token. Panics
    /// if `token` is stale.
    #[track_caller]
    pub fn with_cancel(mut self, token: &CancelToken) -> Self {
        if let Err(e) = token.ensure_valid() {
            misuse(e);
        }
        if let Some(previous) = self.iteration.take() {
            previous.try_unregister();
        }
        if let Registration::Active(registration) = cancel_iteration_on(&self.core, token) {
            self.iteration = Some(registration);
        }
        self
    }

    /// Wait for the next outcome
    ///
    /// Resolves to `Ok(None)` once every outcome has been yielded, or `Err(Failure::Canceled)`
    /// once iteration has been canceled.
    pub fn move_next(&mut self) -> MoveNext<'_, T> {
        MoveNext { sequence: self }
    }

    /// Stop iterating, signaling the operations which have not completed yet
    ///
    /// The returned operation completes once every operation has. It rejects with every
    /// rejection of an operation which completed after this call, unless rejections are
    /// suppressed. Rejections of operations which completed before this call but were never
    /// yielded are reported as unhandled instead.
    pub fn dispose(mut self) -> Promise<()> {
        self.dispose_inner()
    }

    fn dispose_inner(&mut self) -> Promise<()> {
        self.disposed = true;
        if let Some(registration) = self.iteration.take() {
            registration.try_unregister();
        }
        self.core.dispose()
    }
}

impl<T: Send + 'static> Drop for EachSequence<T> {
    fn drop(&mut self) {
        if !self.disposed {
            self.dispose_inner().forget();
        }
    }
}

impl<T: Send + 'static> Debug for EachSequence<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let state = self.core.state.lock();
        f.debug_struct("EachSequence")
            .field("added", &state.added)
            .field("remaining", &state.remaining)
            .field("ready", &state.ready.len())
            .field("canceled", &state.canceled_at.is_some())
            .finish()
    }
}

#[cfg(feature = "futures")]
impl<T: Send + 'static> futures::stream::Stream for EachSequence<T> {
    type Item = Result<Completed<T>, Failure>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.ended {
            return Poll::Ready(None);
        }
        match this.core.poll_next(cx) {
            Poll::Ready(Ok(Some(completed))) => Poll::Ready(Some(Ok(completed))),
            Poll::Ready(Ok(None)) => {
                this.ended = true;
                Poll::Ready(None)
            }
            Poll::Ready(Err(failure)) => {
                this.ended = true;
                Poll::Ready(Some(Err(failure)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(feature = "futures")]
impl<T: Send + 'static> futures::stream::FusedStream for EachSequence<T> {
    fn is_terminated(&self) -> bool {
        self.ended
    }
}


/// Future for [`EachSequence::move_next`]
pub struct MoveNext<'a, T: Send + 'static> {
    sequence: &'a mut EachSequence<T>,
}

impl<'a, T: Send + 'static> Future for MoveNext<'a, T> {
    type Output = Result<Option<Completed<T>>, Failure>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext) -> Poll<Self::Output> {
        self.get_mut().sequence.core.poll_next(cx)
    }
}

impl<'a, T: Send + 'static> Debug for MoveNext<'a, T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str("MoveNext { .. }")
    }
}
