// waiting on operations from synchronous code.
//
// the waiting thread polls the operation with a waker whose data pointer is a `Parker` living on
// the waiting thread's own stack, and sleeps on the parker's condvar between polls. nothing is
// allocated per wait. the parker must outlive every copy of the waker, which is what
// `DropWakers` guarantees.

use std::{
    future::Future,
    pin::Pin,
    sync::{Condvar, Mutex, MutexGuard},
    task::{Context, Poll, RawWaker, RawWakerVTable, Waker},
    time::Instant,
};


// future which can be made to let go of every waker it was ever given.
//
// implementors guarantee that:
//
// - once `poll` returns `Ready` or unwinds, no waker cloned during any earlier `poll` is still
//   alive.
// - once `drop_wakers` returns, no waker cloned during any earlier `poll` is still alive.
//
// `block_on` hands out wakers pointing into its stack frame, so breaking either of these is
// undefined behavior.
//
// implementors wake while holding their own lock, so `wake` must never poll the future inline.
// the parker's wake only flips a flag.
pub(crate) unsafe trait DropWakers: Future {
    fn drop_wakers(&mut self);
}

// how long to block waiting for a future.
pub(crate) enum Timeout {
    // block until it resolves.
    Never,
    // give up at the given deadline.
    At(Instant),
    // give up if it cannot resolve without blocking.
    NonBlocking,
}

// poll the future on this thread until it resolves, or return none if the timeout comes first.
pub(crate) fn block_on<F>(fut: &mut F, timeout: Timeout) -> Option<F::Output>
where
    F: Future + DropWakers + Unpin,
{
    let parker = Parker::new();
    // safety: `parker` is only dropped after the match below, by which point the future has
    //         either resolved or been told to drop its wakers.
    let waker = unsafe { parker.waker() };
    let mut cx = Context::from_waker(&waker);

    let output = loop {
        if let Poll::Ready(output) = Pin::new(&mut *fut).poll(&mut cx) {
            break Some(output);
        }
        let woken = match timeout {
            Timeout::Never => parker.park(None),
            Timeout::At(deadline) => parker.park(Some(deadline)),
            Timeout::NonBlocking => false,
        };
        if !woken {
            break None;
        }
    };
    if output.is_none() {
        fut.drop_wakers();
    }
    output
}


// wake flag plus condvar, shared between the blocked thread and whoever wakes it.
struct Parker {
    notified: Mutex<bool>,
    cond: Condvar,
}

impl Parker {
    fn new() -> Self {
        Parker {
            notified: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn flag(&self) -> MutexGuard<'_, bool> {
        self.notified.lock().unwrap_or_else(|e| e.into_inner())
    }

    // wait until notified, consuming the notification. returns false if the deadline passed
    // first. a notification from before the call returns immediately.
    fn park(&self, deadline: Option<Instant>) -> bool {
        let mut notified = self.flag();
        while !*notified {
            notified = match deadline {
                None => self.cond.wait(notified).unwrap_or_else(|e| e.into_inner()),
                Some(deadline) => {
                    let Some(remaining) = deadline.checked_duration_since(Instant::now())
                        else { return false };
                    self.cond
                        .wait_timeout(notified, remaining)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
            };
        }
        *notified = false;
        true
    }

    fn notify(&self) {
        *self.flag() = true;
        self.cond.notify_one();
    }

    // waker borrowing this parker without reference counting.
    //
    // unsafe because every clone of the returned waker must be dropped before the parker is.
    unsafe fn waker(&self) -> Waker {
        Waker::from_raw(RawWaker::new(self as *const Parker as *const (), &PARKER_WAKER))
    }
}

static PARKER_WAKER: RawWakerVTable =
    RawWakerVTable::new(clone_parker_waker, wake_parker, wake_parker, drop_parker_waker);

unsafe fn clone_parker_waker(parker: *const ()) -> RawWaker {
    RawWaker::new(parker, &PARKER_WAKER)
}

unsafe fn wake_parker(parker: *const ()) {
    (*(parker as *const Parker)).notify();
}

unsafe fn drop_parker_waker(_: *const ()) {}
