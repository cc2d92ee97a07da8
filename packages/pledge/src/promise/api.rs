// exposed handles to operations.

use crate::{
    cancel::CancelToken,
    context::{Context, Schedule},
    error::{Failure, InvalidOperation, Reason, TryWaitError, WouldBlockError},
    promise::{
        cell::{callback, Continuation, Observer, OpCell},
        outcome::{Outcome, State},
        polling::{block_on, DropWakers, Timeout},
    },
};
use std::{
    fmt::{self, Debug, Formatter},
    future::Future,
    panic::Location,
    pin::Pin,
    sync::Arc,
    task::{Context as TaskContext, Poll},
    time::{Duration, Instant},
};


// panic with a protocol error.
#[track_caller]
pub(crate) fn misuse(error: InvalidOperation) -> ! {
    panic!("{}", error)
}


/// Consumer handle to an operation
///
/// A promise has exactly one consumer: chaining methods such as [`then`](Self::then) consume it,
/// as does awaiting it or waiting on it. To give an outcome to several consumers, convert the
/// promise into a [`Retained`] first.
///
/// Dropping a promise without consuming it forgets the operation. If it is or later becomes
/// rejected, the rejection is reported as unhandled.
///
/// When awaited, the task's waker is woken from the thread that completes the operation, while
/// that operation's internal lock is held. `Waker::wake` must therefore only schedule the task:
/// a waker which polls the promise synchronously from inside `wake` never returns.
pub struct Promise<T: Send + 'static>(pub(crate) Option<Handle<T>>);

pub(crate) struct Handle<T> {
    pub(crate) cell: Arc<OpCell<T>>,
    pub(crate) id: u64,
}

impl<T: Send + 'static> Promise<T> {
    /// Construct an already-resolved promise
    #[track_caller]
    pub fn resolved(value: T) -> Self {
        Promise::settled(Outcome::Resolved(value))
    }

    /// Construct an already-rejected promise
    #[track_caller]
    pub fn rejected<R: Into<Reason>>(reason: R) -> Self {
        Promise::settled(Outcome::Rejected(reason.into()))
    }

    /// Construct an already-canceled promise
    #[track_caller]
    pub fn canceled() -> Self {
        Promise::settled(Outcome::Canceled)
    }

    /// Construct an already-completed promise from an outcome
    #[track_caller]
    pub fn settled(outcome: Outcome<T>) -> Self {
        let (deferred, promise) = Deferred::new();
        deferred.settle(outcome);
        promise
    }

    /// Run `f` on the given context and resolve with its return value
    ///
    /// If `f` panics, the promise is rejected with a [`PanicError`](crate::error::PanicError).
    /// Continuations scheduled on the same context run inline after `f` returns.
    #[track_caller]
    pub fn run<F>(cx: &Context, f: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let (deferred, promise) = Deferred::new();
        cx.post(move |cx| {
            let outcome = crate::promise::guard(|| Outcome::Resolved(f()));
            deferred.settle_in(Some(cx), outcome)
                .expect("fresh operation already completed (internal bug)");
        });
        promise
    }

    // borrow the handle, panicking if already consumed by polling.
    #[track_caller]
    pub(crate) fn handle(&self) -> &Handle<T> {
        match &self.0 {
            Some(handle) => handle,
            None => panic!("Promise used after it resolved"),
        }
    }

    // take the handle, leaving nothing for drop to do.
    #[track_caller]
    pub(crate) fn take_handle(mut self) -> Handle<T> {
        match self.0.take() {
            Some(handle) => handle,
            None => panic!("Promise used after it resolved"),
        }
    }

    // attach the one continuation.
    pub(crate) fn attach(self, continuation: Continuation<T>) {
        let handle = self.take_handle();
        handle.cell.attach(continuation, None);
    }

    // attach a callback which runs per `schedule` with the outcome.
    pub(crate) fn attach_callback<F>(self, schedule: Schedule, f: F)
    where
        F: FnOnce(Outcome<T>, Option<&Context>) + Send + 'static,
    {
        self.attach(Continuation::Callback { f: callback(f), schedule });
    }

    // attach a group observer, which will receive the outcome under `index`.
    pub(crate) fn observe(self, observer: Arc<dyn Observer<T>>, index: usize) {
        self.attach(Continuation::Observer { observer, index });
    }

    /// Current state of the operation
    ///
    /// Panics if this promise already resolved by being polled or waited on.
    pub fn state(&self) -> State {
        let handle = self.handle();
        handle.cell.state(handle.id).expect("consumer outlived its operation (internal bug)")
    }

    /// Whether the operation is still pending
    pub fn is_pending(&self) -> bool {
        self.state() == State::Pending
    }

    /// Explicitly give up interest in the operation
    ///
    /// Equivalent to dropping. If the operation is or later becomes rejected, the rejection is
    /// reported as unhandled.
    pub fn forget(self) {
        drop(self);
    }

    /// Convert into a handle which can give the outcome to any number of consumers
    pub fn retain(self) -> Retained<T>
    where
        T: Clone,
    {
        let handle = self.take_handle();
        handle.cell.retain();
        Retained { cell: handle.cell, id: handle.id }
    }

    /// Whether this promise already resolved by being polled or waited on
    pub fn is_terminated(&self) -> bool {
        self.0.is_none()
    }

    /// Try to resolve this promise immediately without blocking
    ///
    /// If this returns anything other than [`WouldBlockError`], this promise has resolved. This
    /// method panics if this promise has already resolved.
    pub fn try_now(&mut self) -> Result<T, TryWaitError> {
        assert!(!self.is_terminated(), "Promise.try_now called after terminated");
        map_try_wait(block_on(self, Timeout::NonBlocking))
    }

    /// Block until this promise resolves
    ///
    /// When this method returns, this promise has resolved. This method panics if this promise
    /// has already resolved.
    pub fn wait(&mut self) -> Result<T, Failure> {
        assert!(!self.is_terminated(), "Promise.wait called after terminated");
        block_on(self, Timeout::Never).expect("block_on timed out with Timeout::Never")
    }

    /// Block until this promise resolves or a timeout elapses
    ///
    /// If this returns anything other than [`WouldBlockError`], this promise has resolved. This
    /// method panics if this promise has already resolved.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<T, TryWaitError> {
        self.wait_deadline(Instant::now() + timeout)
    }

    /// Block until this promise resolves or the deadline is reached
    ///
    /// If this returns anything other than [`WouldBlockError`], this promise has resolved. This
    /// method panics if this promise has already resolved.
    pub fn wait_deadline(&mut self, deadline: Instant) -> Result<T, TryWaitError> {
        assert!(!self.is_terminated(), "Promise.wait_deadline called after terminated");
        map_try_wait(block_on(self, Timeout::At(deadline)))
    }
}

fn map_try_wait<T>(result: Option<Result<T, Failure>>) -> Result<T, TryWaitError> {
    match result {
        Some(result) => result.map_err(TryWaitError::from),
        None => Err(WouldBlockError.into()),
    }
}

impl<T: Send + 'static> Future for Promise<T> {
    type Output = Result<T, Failure>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext) -> Poll<Self::Output> {
        let this = self.get_mut();
        // for implementation of FusedFuture
        let Some(handle) = &this.0 else { return Poll::Pending };
        match handle.cell.poll_outcome(cx) {
            Poll::Ready(outcome) => {
                let handle = this.0.take().expect("unreachable");
                handle.cell.finish_consumer();
                Poll::Ready(outcome.into_result())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

// safety: an operation cell holds at most one waker, clears it under its lock when the outcome is
//         taken, and only wakes it under that same lock.
unsafe impl<T: Send + 'static> DropWakers for Promise<T> {
    fn drop_wakers(&mut self) {
        if let Some(handle) = &self.0 {
            handle.cell.clear_waker();
        }
    }
}

#[cfg(feature = "futures")]
impl<T: Send + 'static> futures::future::FusedFuture for Promise<T> {
    fn is_terminated(&self) -> bool {
        Self::is_terminated(self)
    }
}

impl<T: Send + 'static> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.cell.abandon();
        }
    }
}

impl<T: Send + 'static> Debug for Promise<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match &self.0 {
            Some(handle) => f.debug_struct("Promise")
                .field("id", &handle.id)
                .field("state", &handle.cell.state(handle.id))
                .finish(),
            None => f.write_str("Promise(<terminated>)"),
        }
    }
}


/// Producer handle to an operation
///
/// Cloneable; every clone can attempt to complete the operation, and exactly one attempt wins.
/// Once the operation has completed and its consumer has let go, the operation is recycled and
/// remaining producer handles become stale.
///
/// If the last producer handle is dropped while the operation is still pending, the operation is
/// reported as abandoned to the leak hook (when validation is enabled).
pub struct Deferred<T: Send + 'static> {
    cell: Arc<OpCell<T>>,
    id: u64,
}

impl<T: Send + 'static> Deferred<T> {
    /// Create a pending operation, returning its producer and consumer handles
    #[track_caller]
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (Deferred<T>, Promise<T>) {
        let (cell, id) = OpCell::acquire(Location::caller());
        let promise = Promise(Some(Handle { cell: Arc::clone(&cell), id }));
        (Deferred { cell, id }, promise)
    }

    /// Try to complete the operation with the given outcome
    ///
    /// Fails with [`InvalidOperation::AlreadyCompleted`] if the operation already completed, or
    /// [`InvalidOperation::StaleHandle`] if it has since been recycled.
    pub fn try_settle(&self, outcome: Outcome<T>) -> Result<(), InvalidOperation> {
        self.settle_in(None, outcome)
    }

    /// Complete the operation with the given outcome
    ///
    /// Panics if the operation already completed.
    #[track_caller]
    pub fn settle(&self, outcome: Outcome<T>) {
        if let Err(e) = self.try_settle(outcome) {
            misuse(e);
        }
    }

    /// Try to resolve the operation
    pub fn try_resolve(&self, value: T) -> Result<(), InvalidOperation> {
        self.try_settle(Outcome::Resolved(value))
    }

    /// Resolve the operation
    ///
    /// Panics if the operation already completed.
    #[track_caller]
    pub fn resolve(&self, value: T) {
        self.settle(Outcome::Resolved(value))
    }

    /// Try to reject the operation
    pub fn try_reject<R: Into<Reason>>(&self, reason: R) -> Result<(), InvalidOperation> {
        self.try_settle(Outcome::Rejected(reason.into()))
    }

    /// Reject the operation
    ///
    /// Panics if the operation already completed.
    #[track_caller]
    pub fn reject<R: Into<Reason>>(&self, reason: R) {
        self.settle(Outcome::Rejected(reason.into()))
    }

    /// Try to cancel the operation
    pub fn try_cancel(&self) -> Result<(), InvalidOperation> {
        self.try_settle(Outcome::Canceled)
    }

    /// Cancel the operation
    ///
    /// Panics if the operation already completed.
    #[track_caller]
    pub fn cancel(&self) {
        self.settle(Outcome::Canceled)
    }

    /// Resolve the operation from code running on the given context
    ///
    /// Continuations scheduled on `cx` then run inline rather than being posted.
    #[track_caller]
    pub fn resolve_in(&self, cx: &Context, value: T) {
        if let Err(e) = self.settle_in(Some(cx), Outcome::Resolved(value)) {
            misuse(e);
        }
    }

    pub(crate) fn settle_in(
        &self,
        current: Option<&Context>,
        outcome: Outcome<T>,
    ) -> Result<(), InvalidOperation> {
        self.cell.complete(self.id, outcome, current)
    }

    /// Complete the operation with whatever outcome `promise` completes with
    ///
    /// Fails with [`InvalidOperation::SelfAwait`] if `promise` is this operation's own promise, or
    /// with [`InvalidOperation::CircularChain`] (when validation is enabled) if `promise` is
    /// itself waiting on this operation through a chain of adoptions. On failure, `promise` is
    /// dropped.
    pub fn adopt(&self, promise: Promise<T>) -> Result<(), InvalidOperation> {
        self.adopt_in(None, promise)
    }

    pub(crate) fn adopt_in(
        &self,
        current: Option<&Context>,
        promise: Promise<T>,
    ) -> Result<(), InvalidOperation> {
        let Some(upstream) = &promise.0 else { return Err(InvalidOperation::StaleHandle) };
        if self.cell.state(self.id) != Some(State::Pending) {
            return Err(InvalidOperation::AlreadyCompleted);
        }
        self.cell.wait_on(Arc::clone(&upstream.cell) as _)?;
        let deferred = self.clone();
        let handle = promise.take_handle();
        let continuation = Continuation::Callback {
            // the adopting operation may have been canceled meanwhile
            f: callback(move |outcome, cx| drop(deferred.settle_in(cx, outcome))),
            schedule: Schedule::Synchronous,
        };
        handle.cell.attach(continuation, current);
        Ok(())
    }

    /// Cancel the operation when `token` is canceled, if still pending then
    pub fn cancel_on(&self, token: &CancelToken) {
        let deferred = self.clone();
        token.register(move || drop(deferred.try_cancel()));
    }

    /// Whether the operation is still pending
    pub fn is_pending(&self) -> bool {
        self.cell.state(self.id) == Some(State::Pending)
    }
}

impl<T: Send + 'static> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        self.cell.add_producer(self.id);
        Deferred { cell: Arc::clone(&self.cell), id: self.id }
    }
}

impl<T: Send + 'static> Drop for Deferred<T> {
    fn drop(&mut self) {
        self.cell.drop_producer(self.id);
    }
}

impl<T: Send + 'static> Debug for Deferred<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("id", &self.id)
            .field("state", &self.cell.state(self.id))
            .finish()
    }
}


/// Consumer handle to an operation whose outcome can be given to any number of consumers
///
/// Every consumer receives a clone of the outcome, in the order the consumers were attached. The
/// operation is not recycled until this handle is dropped.
pub struct Retained<T: Send + 'static> {
    cell: Arc<OpCell<T>>,
    id: u64,
}

impl<T: Clone + Send + 'static> Retained<T> {
    // attach another continuation.
    pub(crate) fn subscribe<F>(&self, schedule: Schedule, f: F)
    where
        F: FnOnce(Outcome<T>, Option<&Context>) + Send + 'static,
    {
        self.cell.subscribe(Continuation::Callback { f: callback(f), schedule }, None);
    }

    /// Get another promise for the same outcome
    #[track_caller]
    pub fn duplicate(&self) -> Promise<T> {
        let (deferred, promise) = Deferred::new();
        self.subscribe(Schedule::Synchronous, move |outcome, cx| {
            deferred.settle_in(cx, outcome).expect("fresh operation already completed (internal bug)");
        });
        promise
    }

    /// Current state of the operation
    pub fn state(&self) -> State {
        self.cell.state(self.id).expect("consumer outlived its operation (internal bug)")
    }
}

impl<T: Send + 'static> Drop for Retained<T> {
    fn drop(&mut self) {
        self.cell.abandon();
    }
}

impl<T: Send + 'static> Debug for Retained<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Retained")
            .field("id", &self.id)
            .field("state", &self.cell.state(self.id))
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{install, test_lock, Config},
        context::ManualContext,
        diagnostics::LeakReport,
    };
    use std::{
        sync::{mpsc, Mutex},
        task::{Wake, Waker},
        thread,
        time::Duration,
    };

    // waker which only schedules: it reports the wake on a channel.
    struct SendOnWake(Mutex<mpsc::Sender<()>>);

    impl Wake for SendOnWake {
        fn wake(self: Arc<Self>) {
            let _ = self.0.lock().unwrap().send(());
        }
    }

    #[test]
    fn wake_from_completing_thread_test() {
        let (deferred, mut promise) = Deferred::<u32>::new();
        let (send, recv) = mpsc::channel();
        let waker = Waker::from(Arc::new(SendOnWake(Mutex::new(send))));
        let mut cx = TaskContext::from_waker(&waker);
        assert!(Pin::new(&mut promise).poll(&mut cx).is_pending());

        let join = thread::spawn(move || deferred.resolve(7));
        recv.recv_timeout(Duration::from_secs(10)).unwrap();
        join.join().unwrap();
        // polled again by the task, outside the wake
        match Pin::new(&mut promise).poll(&mut cx) {
            Poll::Ready(Ok(value)) => assert_eq!(value, 7),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        assert!(promise.is_terminated());
    }

    #[test]
    fn wait_timeout_test() {
        let (deferred, mut promise) = Deferred::<u32>::new();
        let start = Instant::now();
        assert!(matches!(
            promise.wait_timeout(Duration::from_millis(20)),
            Err(TryWaitError::WouldBlock(_)),
        ));
        assert!(start.elapsed() >= Duration::from_millis(20));

        let join = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            deferred.resolve(3);
        });
        assert_eq!(promise.wait_timeout(Duration::from_secs(10)).unwrap(), 3);
        join.join().unwrap();
    }

    #[test]
    fn exactly_once_transition_test() {
        let (deferred, mut promise) = Deferred::<u32>::new();
        let other = deferred.clone();
        deferred.resolve(1);
        assert_eq!(other.try_resolve(2), Err(InvalidOperation::AlreadyCompleted));
        assert_eq!(other.try_reject(Reason::msg("no")), Err(InvalidOperation::AlreadyCompleted));
        assert_eq!(other.try_cancel(), Err(InvalidOperation::AlreadyCompleted));
        assert!(!other.is_pending());
        assert_eq!(promise.state(), State::Resolved);
        assert_eq!(promise.wait().unwrap(), 1);
    }

    #[test]
    #[should_panic(expected = "operation was already completed")]
    fn double_resolve_panics_test() {
        let (deferred, _promise) = Deferred::<u32>::new();
        deferred.resolve(1);
        deferred.resolve(2);
    }

    #[test]
    fn wait_across_threads_test() {
        let (deferred, mut promise) = Deferred::<String>::new();
        let join = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            deferred.resolve("hello".to_owned());
        });
        assert_eq!(promise.wait_timeout(Duration::from_secs(5)).unwrap(), "hello");
        assert!(promise.is_terminated());
        join.join().unwrap();
    }

    #[test]
    fn try_now_test() {
        let (deferred, mut promise) = Deferred::<u32>::new();
        assert!(matches!(promise.try_now(), Err(TryWaitError::WouldBlock(_))));
        assert!(matches!(
            promise.wait_timeout(Duration::from_millis(10)),
            Err(TryWaitError::WouldBlock(_)),
        ));
        deferred.cancel();
        assert!(matches!(promise.try_now(), Err(TryWaitError::Terminal(Failure::Canceled))));
    }

    #[test]
    fn await_test() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let (deferred, promise) = Deferred::<u32>::new();
        let join = thread::spawn(move || deferred.resolve(7));
        let value = rt.block_on(promise).unwrap();
        assert_eq!(value, 7);
        join.join().unwrap();
    }

    #[test]
    fn retained_fan_out_test() {
        let (deferred, promise) = Deferred::<u32>::new();
        let retained = promise.retain();
        let mut a = retained.duplicate();
        let mut b = retained.duplicate();
        deferred.resolve(3);
        let mut c = retained.duplicate();
        assert_eq!(retained.state(), State::Resolved);
        assert_eq!(a.wait().unwrap(), 3);
        assert_eq!(b.wait().unwrap(), 3);
        assert_eq!(c.wait().unwrap(), 3);
    }

    #[test]
    fn resolve_in_runs_inline_on_same_context_test() {
        let manual = ManualContext::new();
        let cx = Context::from(Arc::clone(&manual));
        let (deferred, promise) = Deferred::<u32>::new();
        let mut promise = promise.then_on(Schedule::On(cx.clone()), |n| n + 1);

        deferred.resolve_in(&cx, 1);
        assert_eq!(manual.pending(), 0);
        assert_eq!(promise.try_now().unwrap(), 2);
    }

    #[test]
    fn posts_when_not_on_context_test() {
        let manual = ManualContext::new();
        let cx = Context::from(Arc::clone(&manual));
        let (deferred, promise) = Deferred::<u32>::new();
        let mut promise = promise.then_on(Schedule::On(cx.clone()), |n| n * 10);

        deferred.resolve(4);
        assert!(matches!(promise.try_now(), Err(TryWaitError::WouldBlock(_))));
        assert_eq!(manual.run_pending(), 1);
        assert_eq!(promise.try_now().unwrap(), 40);
    }

    #[test]
    fn run_on_context_test() {
        let manual = ManualContext::new();
        let cx = Context::from(Arc::clone(&manual));
        let mut promise = Promise::run(&cx, || 5u32);
        manual.run_pending();
        assert_eq!(promise.wait().unwrap(), 5);

        let mut promise = Promise::<u32>::run(&cx, || panic!("kaboom"));
        manual.run_pending();
        let failure = promise.wait().unwrap_err();
        let reason = failure.reason().unwrap();
        assert_eq!(reason.downcast_ref::<crate::error::PanicError>().unwrap().message(), "kaboom");
    }

    #[test]
    fn adopt_self_test() {
        let (deferred, promise) = Deferred::<u32>::new();
        assert_eq!(deferred.adopt(promise), Err(InvalidOperation::SelfAwait));
        deferred.resolve(0);
    }

    #[test]
    fn adopt_circular_test() {
        let _guard = test_lock();
        install(Config::new().with_validation(true));

        let (d1, p1) = Deferred::<u32>::new();
        let (d2, p2) = Deferred::<u32>::new();
        d1.adopt(p2).unwrap();
        assert_eq!(d2.adopt(p1), Err(InvalidOperation::CircularChain));
        d2.resolve(9);
        assert!(!d1.is_pending());

        install(Config::new());
    }

    #[test]
    fn unhandled_rejection_test() {
        let _guard = test_lock();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_2 = Arc::clone(&seen);
        install(Config::new().with_unhandled_rejection_hook(move |reason| {
            seen_2.lock().unwrap().push(reason.to_string());
        }));

        // forgotten before rejection
        let (deferred, promise) = Deferred::<u32>::new();
        promise.forget();
        deferred.reject(Reason::msg("forgotten first"));

        // forgotten after rejection
        let (deferred, promise) = Deferred::<u32>::new();
        deferred.reject(Reason::msg("rejected first"));
        drop(promise);

        // observed
        let (deferred, mut promise) = Deferred::<u32>::new();
        deferred.reject(Reason::msg("observed"));
        assert!(promise.wait().is_err());

        install(Config::new());
        let seen = seen.lock().unwrap();
        assert!(seen.iter().any(|s| s == "forgotten first"));
        assert!(seen.iter().any(|s| s == "rejected first"));
        assert!(!seen.iter().any(|s| s == "observed"));
    }

    #[test]
    fn leak_hook_test() {
        let _guard = test_lock();
        let leaks = Arc::new(Mutex::new(Vec::<LeakReport>::new()));
        let leaks_2 = Arc::clone(&leaks);
        install(Config::new()
            .with_validation(true)
            .with_leak_hook(move |report| leaks_2.lock().unwrap().push(report.clone())));

        let line = line!() + 1;
        let (deferred, _promise) = Deferred::<u64>::new();
        let clone = deferred.clone();
        drop(deferred);
        assert!(leaks.lock().unwrap().is_empty());
        drop(clone);

        install(Config::new());
        let leaks = leaks.lock().unwrap();
        assert!(leaks.iter().any(|report| {
            report.type_name == "u64" && report.location.map(|l| l.line()) == Some(line)
        }));
    }
}
