// chaining continuations onto operations.
//
// every chaining method is the same shape underneath: attach one callback which computes the
// outcome of a new downstream operation from the upstream outcome. the callback runs wherever its
// schedule says, and the downstream operation is completed from that same context, so a chain of
// continuations on one context runs inline without posting at every link.

use crate::{
    context::{Context, Schedule},
    error::Reason,
    promise::{
        api::{Deferred, Promise, Retained},
        outcome::Outcome,
    },
};
use std::panic::{catch_unwind, AssertUnwindSafe};


// run a user callback, converting a panic into a rejection.
pub(crate) fn guard<U, F>(f: F) -> Outcome<U>
where
    F: FnOnce() -> Outcome<U>,
{
    catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Outcome::Rejected(Reason::from_panic(payload)))
}

// create the downstream operation and a callback to attach upstream which completes it.
#[track_caller]
fn link<T, U, F>(f: F) -> (impl FnOnce(Outcome<T>, Option<&Context>) + Send + 'static, Promise<U>)
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnOnce(Outcome<T>) -> Outcome<U> + Send + 'static,
{
    let (deferred, promise) = Deferred::new();
    let callback = move |outcome: Outcome<T>, cx: Option<&Context>| {
        let outcome = guard(|| f(outcome));
        deferred.settle_in(cx, outcome).expect("fresh operation already completed (internal bug)");
    };
    (callback, promise)
}

impl<T: Send + 'static> Promise<T> {
    /// Attach a callback computing the downstream outcome from this operation's outcome, run per
    /// `schedule`
    ///
    /// This is the most general chaining method; the others are built on it. A panic in `f`
    /// rejects the downstream operation with a [`PanicError`](crate::error::PanicError).
    #[track_caller]
    pub fn map_outcome_on<U, F>(self, schedule: Schedule, f: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(Outcome<T>) -> Outcome<U> + Send + 'static,
    {
        let (callback, promise) = link(f);
        self.attach_callback(schedule, callback);
        promise
    }

    /// Transform the value once resolved
    ///
    /// Rejection and cancellation pass through to the downstream operation unchanged.
    #[track_caller]
    pub fn then<U, F>(self, f: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.then_on(Schedule::Synchronous, f)
    }

    /// Version of [`then`](Self::then) which runs `f` per `schedule`
    #[track_caller]
    pub fn then_on<U, F>(self, schedule: Schedule, f: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.map_outcome_on(schedule, move |outcome| outcome.map(f))
    }

    /// Transform the value once resolved, with a fallible callback
    ///
    /// If `f` returns an error, the downstream operation is rejected with it.
    #[track_caller]
    pub fn try_then<U, E, F>(self, f: F) -> Promise<U>
    where
        U: Send + 'static,
        E: Into<Reason>,
        F: FnOnce(T) -> Result<U, E> + Send + 'static,
    {
        self.map_outcome_on(Schedule::Synchronous, move |outcome| match outcome {
            Outcome::Resolved(value) => match f(value) {
                Ok(value) => Outcome::Resolved(value),
                Err(e) => Outcome::Rejected(e.into()),
            },
            Outcome::Rejected(reason) => Outcome::Rejected(reason),
            Outcome::Canceled => Outcome::Canceled,
        })
    }

    /// Continue with another operation once resolved
    ///
    /// The downstream operation completes with whatever the operation returned by `f` completes
    /// with. If adopting that operation would make it wait on itself, the downstream operation is
    /// rejected with the [`InvalidOperation`](crate::error::InvalidOperation) instead.
    #[track_caller]
    pub fn and_then<U, F>(self, f: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Promise<U> + Send + 'static,
    {
        let (deferred, promise) = Deferred::new();
        self.attach_callback(Schedule::Synchronous, move |outcome, cx| {
            let next = match outcome {
                Outcome::Resolved(value) => catch_unwind(AssertUnwindSafe(|| f(value)))
                    .map_err(Reason::from_panic),
                Outcome::Rejected(reason) => Err(reason),
                Outcome::Canceled => {
                    drop(deferred.settle_in(cx, Outcome::Canceled));
                    return;
                }
            };
            let result = match next {
                Ok(next) => deferred.adopt_in(cx, next).map_err(Reason::from),
                Err(reason) => Err(reason),
            };
            if let Err(reason) = result {
                drop(deferred.settle_in(cx, Outcome::Rejected(reason)));
            }
        });
        promise
    }

    /// Recover from rejection
    ///
    /// Resolution and cancellation pass through unchanged.
    #[track_caller]
    pub fn catch<F>(self, f: F) -> Promise<T>
    where
        F: FnOnce(Reason) -> T + Send + 'static,
    {
        self.map_outcome_on(Schedule::Synchronous, move |outcome| match outcome {
            Outcome::Rejected(reason) => Outcome::Resolved(f(reason)),
            outcome => outcome,
        })
    }

    /// Recover from cancellation
    ///
    /// Resolution and rejection pass through unchanged.
    #[track_caller]
    pub fn catch_cancel<F>(self, f: F) -> Promise<T>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        self.map_outcome_on(Schedule::Synchronous, move |outcome| match outcome {
            Outcome::Canceled => Outcome::Resolved(f()),
            outcome => outcome,
        })
    }

    /// Continue with the outcome, whatever it is
    #[track_caller]
    pub fn continue_with<U, F>(self, f: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(Outcome<T>) -> U + Send + 'static,
    {
        self.continue_with_on(Schedule::Synchronous, f)
    }

    /// Version of [`continue_with`](Self::continue_with) which runs `f` per `schedule`
    #[track_caller]
    pub fn continue_with_on<U, F>(self, schedule: Schedule, f: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(Outcome<T>) -> U + Send + 'static,
    {
        self.map_outcome_on(schedule, move |outcome| Outcome::Resolved(f(outcome)))
    }

    /// Run `f` once completed, passing the outcome through
    ///
    /// If `f` panics, the downstream operation is rejected with the panic instead.
    #[track_caller]
    pub fn finally<F>(self, f: F) -> Promise<T>
    where
        F: FnOnce() + Send + 'static,
    {
        self.map_outcome_on(Schedule::Synchronous, move |outcome| {
            f();
            outcome
        })
    }
}

impl<T: Clone + Send + 'static> Retained<T> {
    /// Transform a clone of the value once resolved
    ///
    /// Like [`Promise::then`], but may be called any number of times.
    #[track_caller]
    pub fn then<U, F>(&self, f: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let (callback, promise) = link(move |outcome: Outcome<T>| outcome.map(f));
        self.subscribe(Schedule::Synchronous, callback);
        promise
    }

    /// Continue with a clone of the outcome, whatever it is
    ///
    /// Like [`Promise::continue_with`], but may be called any number of times.
    #[track_caller]
    pub fn continue_with<U, F>(&self, f: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(Outcome<T>) -> U + Send + 'static,
    {
        let (callback, promise) = link(move |outcome| Outcome::Resolved(f(outcome)));
        self.subscribe(Schedule::Synchronous, callback);
        promise
    }
}


#[cfg(test)]
mod tests {
    use crate::{
        config::{install, test_lock, Config},
        error::{Failure, PanicError, Reason},
        promise::{Deferred, Outcome, Promise},
    };
    use std::sync::{Arc, Mutex};

    #[test]
    fn continuation_order_test() {
        let (deferred, promise) = Deferred::<u32>::new();
        let retained = promise.retain();
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut chained = Vec::new();
        for i in 0..3 {
            let log = Arc::clone(&log);
            chained.push(retained.then(move |_| log.lock().unwrap().push(i)));
        }
        deferred.resolve(0);
        for i in 3..6 {
            let log = Arc::clone(&log);
            chained.push(retained.then(move |_| log.lock().unwrap().push(i)));
        }
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
        for mut promise in chained {
            promise.wait().unwrap();
        }
    }

    #[test]
    fn propagation_test() {
        let mut p = Promise::<u32>::rejected(Reason::msg("bad"))
            .then(|n| n + 1)
            .then(|n| n * 2);
        assert_eq!(p.wait().unwrap_err().reason().unwrap().to_string(), "bad");

        let mut p = Promise::<u32>::canceled().then(|n| n + 1);
        assert!(p.wait().unwrap_err().is_canceled());

        let mut p = Promise::<u32>::rejected(Reason::msg("bad")).catch(|_| 9).then(|n| n + 1);
        assert_eq!(p.wait().unwrap(), 10);

        let mut p = Promise::<u32>::canceled().catch(|_| 9).catch_cancel(|| 3);
        assert_eq!(p.wait().unwrap(), 3);
    }

    #[test]
    fn try_then_test() {
        let mut p = Promise::resolved("12").try_then(|s| s.parse::<u32>().map_err(Reason::new));
        assert_eq!(p.wait().unwrap(), 12);

        let mut p = Promise::resolved("x").try_then(|s| s.parse::<u32>().map_err(Reason::new));
        assert!(p.wait().unwrap_err().reason().unwrap().downcast_ref::<std::num::ParseIntError>().is_some());
    }

    #[test]
    fn panic_rejects_downstream_test() {
        let mut p = Promise::resolved(1u32).then(|_| -> u32 { panic!("oops") });
        let failure = p.wait().unwrap_err();
        assert_eq!(failure.reason().unwrap().downcast_ref::<PanicError>().unwrap().message(), "oops");

        let mut p = Promise::resolved(1u32).finally(|| panic!("in finally"));
        assert!(matches!(p.wait(), Err(Failure::Rejected(_))));
    }

    #[test]
    fn continue_with_and_finally_test() {
        let ran = Arc::new(Mutex::new(false));
        let ran_2 = Arc::clone(&ran);
        let mut p = Promise::<u32>::canceled()
            .finally(move || *ran_2.lock().unwrap() = true)
            .continue_with(|outcome| matches!(outcome, Outcome::Canceled));
        assert!(p.wait().unwrap());
        assert!(*ran.lock().unwrap());
    }

    #[test]
    fn and_then_test() {
        let (inner_deferred, inner) = Deferred::<String>::new();
        let mut p = Promise::resolved(2u32).and_then(move |n| inner.then(move |s| format!("{s}{n}")));
        assert!(p.is_pending());
        inner_deferred.resolve("x".to_owned());
        assert_eq!(p.wait().unwrap(), "x2");
    }

    #[test]
    fn and_then_circular_test() {
        let _guard = test_lock();
        install(Config::new().with_validation(true));

        let (d_x, x) = Deferred::<u32>::new();
        let (d_2, p_2) = Deferred::<u32>::new();
        let p = x.and_then(move |_| p_2);
        // d_2 waits on p, which will wait on p_2
        d_2.adopt(p).unwrap();
        d_x.resolve(0);
        // the circular adoption was caught inside the continuation and rejected the adopter
        assert!(!d_2.is_pending());

        install(Config::new());
    }
}
