// the pooled shared state of one operation.
//
// each operation is an `OpCell` acquired from the pool. handles to it pair an `Arc` of the cell
// with the generation it had when the operation was created:
//
//   Deferred (producers, any number) ---\
//                                        >--- Arc<OpCell<T>> { word: gen | state, inner, .. }
//   Promise / Retained (one consumer) ---/
//
// the state machine lives in the low byte of `word`. completing is a compare-and-swap from
// (gen, PENDING) to (gen, COMPLETING), so exactly one completion attempt per generation can win,
// and any handle from an older generation fails it. the winner then publishes the outcome under
// the lock and drains the continuations.
//
// a cell goes back to the pool once two things have happened, in either order:
//
// - CONSUMED: the consumer handle let go (attached its continuation, took the outcome by polling,
//   or was dropped).
// - DRAINED: the operation completed and every continuation attached so far has been dispatched.
//
// whoever sets the second of those bits retires the cell. recycling bumps the generation, which
// makes every remaining producer handle stale.

use crate::{
    config,
    context::{Context, Schedule},
    diagnostics::{self, LeakReport, LiveOperation},
    error::{InvalidOperation, Reason},
    pool::{self, PoolLink, Recycle},
    promise::outcome::{Outcome, State},
    util::spin::SpinLock,
};
use smallvec::SmallVec;
use std::{
    any::type_name,
    mem::take,
    panic::Location,
    sync::{
        atomic::{
            AtomicU64,
            AtomicU8,
            Ordering::{AcqRel, Acquire, Release},
        },
        Arc,
    },
    task::{self, Poll, Waker},
};


const PENDING: u64 = State::Pending as u64;
// the transition has been won, but the outcome is not yet published.
const COMPLETING: u64 = 4;

const CONSUMED: u8 = 1;
const DRAINED: u8 = 2;


/// Observer of many operations, each of which it knows by an index
///
/// Lets one shared accumulator be attached to many operations without allocating a callback per
/// operation.
pub(crate) trait Observer<T>: Send + Sync + 'static {
    fn observe(self: Arc<Self>, index: usize, outcome: Outcome<T>);
}

// callback taking an outcome and the context it ends up running on.
pub(crate) type Callback<T> = Box<dyn FnOnce(Outcome<T>, Option<&Context>) + Send>;

pub(crate) fn callback<T, F>(f: F) -> Callback<T>
where
    F: FnOnce(Outcome<T>, Option<&Context>) + Send + 'static,
{
    Box::new(f)
}

// something waiting for an operation's outcome.
pub(crate) enum Continuation<T> {
    Callback {
        f: Callback<T>,
        schedule: Schedule,
    },
    Observer {
        observer: Arc<dyn Observer<T>>,
        index: usize,
    },
}

impl<T: Send + 'static> Continuation<T> {
    fn dispatch(self, outcome: Outcome<T>, current: Option<&Context>) {
        match self {
            Continuation::Callback { f, schedule } => schedule.run(current, move |cx| f(outcome, cx)),
            Continuation::Observer { observer, index } => observer.observe(index, outcome),
        }
    }
}


// operation which can be waited on, for walking chains of adopted operations.
pub(crate) trait Chained: Send + Sync {
    fn waiting_on(&self) -> Option<Arc<dyn Chained>>;
}

fn addr(op: &Arc<dyn Chained>) -> *const () {
    Arc::as_ptr(op) as *const ()
}


pub(crate) struct OpCell<T> {
    link: PoolLink,
    // (generation << 8) | state
    word: AtomicU64,
    // CONSUMED | DRAINED
    release: AtomicU8,
    inner: SpinLock<Inner<T>>,
    // operation this one has adopted, if validation is enabled.
    waiting_on: SpinLock<Option<Arc<dyn Chained>>>,
}

struct Inner<T> {
    outcome: Option<Outcome<T>>,
    continuations: SmallVec<[Continuation<T>; 1]>,
    // waker of the consumer polling this operation as a future.
    waker: Option<Waker>,
    // completed, and not currently draining.
    drained: bool,
    draining: bool,
    // set when retained, after which continuations get clones of the outcome.
    retained: Option<fn(&Outcome<T>) -> Outcome<T>>,
    // consumer let go without observing the outcome.
    abandoned: bool,
    // some consumer has received or will receive the outcome.
    observed: bool,
    // live producer handles, while pending.
    producers: usize,
    location: Option<&'static Location<'static>>,
}

impl<T> Default for Inner<T> {
    fn default() -> Self {
        Inner {
            outcome: None,
            continuations: SmallVec::new(),
            waker: None,
            drained: false,
            draining: false,
            retained: None,
            abandoned: false,
            observed: false,
            producers: 0,
            location: None,
        }
    }
}

impl<T> Inner<T> {
    // produce the outcome for one continuation.
    fn hand_out(&mut self) -> Outcome<T> {
        let outcome = match self.retained {
            Some(clone) => self.outcome.as_ref().map(clone),
            None => self.outcome.take(),
        };
        outcome.expect("operation outcome handed out twice (internal bug)")
    }

    // rejection reason to report, if the outcome is a rejection nobody observed.
    fn unobserved_rejection(&mut self) -> Option<Reason> {
        if self.observed {
            return None;
        }
        match &self.outcome {
            Some(Outcome::Rejected(reason)) => {
                self.observed = true;
                Some(reason.clone())
            }
            _ => None,
        }
    }
}

impl<T> Default for OpCell<T> {
    fn default() -> Self {
        OpCell {
            link: PoolLink::new(),
            word: AtomicU64::new(PENDING),
            release: AtomicU8::new(0),
            inner: SpinLock::new(Inner::default()),
            waiting_on: SpinLock::new(None),
        }
    }
}

impl<T: Send + 'static> Recycle for OpCell<T> {
    fn link(&self) -> &PoolLink {
        &self.link
    }

    fn recycle(&self) {
        let (inner, waiting_on) = {
            let mut inner = self.inner.lock();
            let gen = self.word.load(Acquire) >> 8;
            self.word.store(((gen + 1) << 8) | PENDING, Release);
            self.release.store(0, Release);
            (take(&mut *inner), self.waiting_on.lock().take())
        };
        // outcome and continuations are dropped outside the critical section
        drop((inner, waiting_on));
    }
}

impl<T: Send + 'static> Chained for OpCell<T> {
    fn waiting_on(&self) -> Option<Arc<dyn Chained>> {
        self.waiting_on.lock().clone()
    }
}

impl<T: Send + 'static> OpCell<T> {
    // acquire a pending cell with one producer, and return it with its generation.
    pub(crate) fn acquire(location: &'static Location<'static>) -> (Arc<Self>, u64) {
        let cell = pool::acquire::<Self>();
        let id = cell.word.load(Acquire) >> 8;
        {
            let mut inner = cell.inner.lock();
            inner.producers = 1;
            inner.location = Some(location);
        }
        if config::track_leaks() {
            diagnostics::track(cell.key(), LiveOperation {
                type_name: type_name::<T>(),
                location,
            });
        }
        trace!(id, type_name = type_name::<T>(), "operation created");
        (cell, id)
    }

    fn key(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }

    // state of generation `id`, or none if the cell has since been recycled.
    pub(crate) fn state(&self, id: u64) -> Option<State> {
        let word = self.word.load(Acquire);
        if word >> 8 != id {
            return None;
        }
        Some(State::from_u8(word as u8).unwrap_or(State::Pending))
    }

    // transition generation `id` to a terminal state and dispatch continuations.
    pub(crate) fn complete(
        self: &Arc<Self>,
        id: u64,
        outcome: Outcome<T>,
        current: Option<&Context>,
    ) -> Result<(), InvalidOperation> {
        let pending = (id << 8) | PENDING;
        if let Err(actual) = self.word.compare_exchange(pending, (id << 8) | COMPLETING, AcqRel, Acquire) {
            return Err(if actual >> 8 == id {
                InvalidOperation::AlreadyCompleted
            } else {
                InvalidOperation::StaleHandle
            });
        }

        let state = outcome.state();
        let adopted = self.waiting_on.lock().take();
        drop(adopted);
        {
            let mut inner = self.inner.lock();
            inner.outcome = Some(outcome);
            inner.draining = true;
            self.word.store((id << 8) | state as u64, Release);
            // woken under the lock, so a blocking waiter's waker may point into its stack. the
            // lock is not reentrant: a waker must not poll this operation inline.
            if let Some(waker) = inner.waker.take() {
                waker.wake();
            }
        }
        if config::track_leaks() {
            diagnostics::untrack(self.key());
        }
        trace!(id, ?state, "operation completed");

        self.drain(current);
        Ok(())
    }

    // dispatch continuations until none are left, then mark drained.
    fn drain(self: &Arc<Self>, current: Option<&Context>) {
        let unhandled = loop {
            let batch = {
                let mut inner = self.inner.lock();
                if inner.continuations.is_empty() {
                    inner.draining = false;
                    inner.drained = true;
                    break if inner.abandoned { inner.unobserved_rejection() } else { None };
                }
                let continuations = take(&mut inner.continuations);
                continuations
                    .into_iter()
                    .map(|continuation| (continuation, inner.hand_out()))
                    .collect::<SmallVec<[_; 1]>>()
            };
            for (continuation, outcome) in batch {
                continuation.dispatch(outcome, current);
            }
        };
        if let Some(reason) = unhandled {
            diagnostics::report_unhandled(reason);
        }
        self.finish_side(DRAINED);
    }

    // let go of the consumer side after taking the outcome by polling.
    pub(crate) fn finish_consumer(self: &Arc<Self>) {
        self.finish_side(CONSUMED);
    }

    // set one of the release bits, and retire the cell if both are now set.
    fn finish_side(self: &Arc<Self>, bit: u8) {
        let prev = self.release.fetch_or(bit, AcqRel);
        debug_assert!(prev & bit == 0, "operation release bit set twice (internal bug)");
        if prev | bit == CONSUMED | DRAINED {
            trace!("operation retired");
            pool::release(Arc::clone(self));
        }
    }

    // attach a continuation. dispatches immediately if already completed and drained.
    pub(crate) fn subscribe(self: &Arc<Self>, continuation: Continuation<T>, current: Option<&Context>) {
        let ready = {
            let mut inner = self.inner.lock();
            inner.observed = true;
            if inner.drained {
                let outcome = inner.hand_out();
                Some((continuation, outcome))
            } else {
                inner.continuations.push(continuation);
                None
            }
        };
        if let Some((continuation, outcome)) = ready {
            continuation.dispatch(outcome, current);
        }
    }

    // attach the consumer's one continuation and let go of the consumer side.
    pub(crate) fn attach(self: &Arc<Self>, continuation: Continuation<T>, current: Option<&Context>) {
        self.subscribe(continuation, current);
        self.finish_side(CONSUMED);
    }

    // poll for the outcome as the consumer. on ready, the caller must let go of the consumer side.
    pub(crate) fn poll_outcome(&self, cx: &mut task::Context) -> Poll<Outcome<T>> {
        let mut inner = self.inner.lock();
        if inner.outcome.is_some() {
            inner.observed = true;
            inner.waker = None;
            return Poll::Ready(inner.hand_out());
        }
        match &inner.waker {
            Some(waker) if waker.will_wake(cx.waker()) => (),
            _ => inner.waker = Some(cx.waker().clone()),
        }
        Poll::Pending
    }

    pub(crate) fn clear_waker(&self) {
        let waker = self.inner.lock().waker.take();
        drop(waker);
    }

    // let go of the consumer side without observing the outcome.
    pub(crate) fn abandon(self: &Arc<Self>) {
        let unhandled = {
            let mut inner = self.inner.lock();
            inner.waker = None;
            if inner.outcome.is_some() {
                inner.unobserved_rejection()
            } else {
                inner.abandoned = true;
                None
            }
        };
        if let Some(reason) = unhandled {
            diagnostics::report_unhandled(reason);
        }
        self.finish_side(CONSUMED);
    }

    // switch to handing out clones of the outcome.
    pub(crate) fn retain(&self)
    where
        T: Clone,
    {
        self.inner.lock().retained = Some(Outcome::clone);
    }

    pub(crate) fn add_producer(&self, id: u64) {
        let mut inner = self.inner.lock();
        if self.word.load(Acquire) == (id << 8) | PENDING {
            inner.producers += 1;
        }
    }

    pub(crate) fn drop_producer(&self, id: u64) {
        let leaked = {
            let mut inner = self.inner.lock();
            if self.word.load(Acquire) != (id << 8) | PENDING {
                return;
            }
            inner.producers -= 1;
            if inner.producers == 0 {
                inner.location
            } else {
                return;
            }
        };
        if config::validation_enabled() {
            diagnostics::report_leak(LeakReport {
                type_name: type_name::<T>(),
                location: leaked,
            });
        }
    }

    // record that generation `id` of this operation waits on `upstream`.
    pub(crate) fn wait_on(
        self: &Arc<Self>,
        upstream: Arc<dyn Chained>,
    ) -> Result<(), InvalidOperation> {
        let this = Arc::as_ptr(self) as *const ();
        if addr(&upstream) == this {
            return Err(InvalidOperation::SelfAwait);
        }
        if !config::validation_enabled() {
            return Ok(());
        }
        // the recorded chains are acyclic, since every edge is checked here before recording it
        let mut next = Some(Arc::clone(&upstream));
        while let Some(op) = next {
            if addr(&op) == this {
                return Err(InvalidOperation::CircularChain);
            }
            next = op.waiting_on();
        }
        *self.waiting_on.lock() = Some(upstream);
        Ok(())
    }
}
