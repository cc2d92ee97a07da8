// cooperative cancellation.
//
// a `CancelSource` owns a pooled `SourceCell`. tokens and registrations pair an `Arc` of the cell
// with the generation it had when the source was created, the same way operation handles do:
// disposing the source recycles the cell and bumps its generation, so every token and
// registration from before becomes stale at once, without needing to be found.
//
// the canceled and disposed flags live in the low bits of the cell's word. both flags are set
// while holding the registration lock, and registering checks them under that same lock, so a
// callback is either in the list when cancel takes the list, or is run inline by register, but
// never both and never neither.

use crate::{
    error::{AggregateError, Failure, InvalidOperation, Reason},
    pool::{Pool, PoolLink, Recycle},
    util::spin::SpinLock,
};
use smallvec::SmallVec;
use std::{
    fmt::{self, Debug, Formatter},
    mem::take,
    panic::{catch_unwind, resume_unwind, AssertUnwindSafe},
    slice,
    sync::{
        atomic::{
            AtomicU64,
            Ordering::{Acquire, Release},
        },
        Arc,
    },
};


const CANCELED: u64 = 1;
const DISPOSED: u64 = 2;
const FLAGS: u64 = 0xff;

type Callback = Box<dyn FnOnce() + Send>;


#[derive(Default)]
struct SourceCell {
    link: PoolLink,
    // (generation << 8) | flags
    word: AtomicU64,
    regs: SpinLock<Registrations>,
}

#[derive(Default)]
struct Registrations {
    next_key: u64,
    entries: SmallVec<[(u64, Callback); 2]>,
}

impl Recycle for SourceCell {
    fn link(&self) -> &PoolLink {
        &self.link
    }

    fn recycle(&self) {
        let entries = {
            let mut regs = self.regs.lock();
            let gen = self.word.load(Acquire) >> 8;
            self.word.store((gen + 1) << 8, Release);
            regs.next_key = 0;
            take(&mut regs.entries)
        };
        drop(entries);
    }

    fn pool() -> &'static Pool<Self> {
        static POOL: Pool<SourceCell> = Pool::new();
        &POOL
    }
}

impl SourceCell {
    // flags of generation `id`, or none if stale.
    fn flags(&self, id: u64) -> Option<u64> {
        let word = self.word.load(Acquire);
        (word >> 8 == id).then_some(word & FLAGS)
    }

    fn cancel(&self, id: u64) -> Result<(), AggregateError> {
        let entries = {
            let mut regs = self.regs.lock();
            let word = self.word.load(Acquire);
            if word >> 8 != id || word & (CANCELED | DISPOSED) != 0 {
                return Ok(());
            }
            self.word.store(word | CANCELED, Release);
            take(&mut regs.entries)
        };
        trace!(id, registrations = entries.len(), "cancel source canceled");

        let mut errors = SmallVec::new();
        for (_, callback) in entries {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(callback)) {
                errors.push(Reason::from_panic(payload));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(AggregateError::new(errors))
        }
    }

    // mark disposed and drop unrun registrations. the caller then recycles the cell.
    fn dispose(&self, id: u64) {
        let entries = {
            let mut regs = self.regs.lock();
            let word = self.word.load(Acquire);
            if word >> 8 != id {
                return;
            }
            self.word.store(word | DISPOSED, Release);
            take(&mut regs.entries)
        };
        drop(entries);
    }
}


/// Owner of a cancellation signal
///
/// Hands out [`CancelToken`]s, which operations observe. Canceling is set-once. Dropping the
/// source disposes it: unrun registrations are dropped, and tokens from it become stale.
pub struct CancelSource {
    cell: Arc<SourceCell>,
    id: u64,
    // registrations on the tokens this source is linked to.
    links: SmallVec<[CancelRegistration; 1]>,
}

impl CancelSource {
    /// Construct a source which has not been canceled
    pub fn new() -> Self {
        let cell = SourceCell::pool().acquire();
        let id = cell.word.load(Acquire) >> 8;
        CancelSource { cell, id, links: SmallVec::new() }
    }

    /// Construct a source which is canceled when any of the given tokens is canceled
    ///
    /// If any of them already is, the new source starts out canceled. Errors raised by callbacks
    /// registered on the new source while it is being canceled this way are propagated, nested in
    /// an [`AggregateError`], to whichever call canceled the linked token.
    pub fn linked(tokens: &[CancelToken]) -> Self {
        let mut source = CancelSource::new();
        for token in tokens {
            let cell = Arc::clone(&source.cell);
            let id = source.id;
            let registration = token.register(move || {
                if let Err(e) = cell.cancel(id) {
                    resume_unwind(Box::new(e));
                }
            });
            if let Registration::Active(registration) = registration {
                source.links.push(registration);
            }
        }
        source
    }

    /// Get a token which observes this source
    pub fn token(&self) -> CancelToken {
        CancelToken {
            cell: Some(Arc::clone(&self.cell)),
            id: self.id,
        }
    }

    /// Cancel, running every registered callback in registration order on the calling thread
    ///
    /// Set-once: calls after the first run nothing and return `Ok`. Every callback runs even if
    /// some panic; their panics are caught and returned together.
    pub fn cancel(&self) -> Result<(), AggregateError> {
        self.cell.cancel(self.id)
    }

    /// Whether cancellation has been requested
    pub fn is_cancel_requested(&self) -> bool {
        self.cell.flags(self.id).is_some_and(|flags| flags & CANCELED != 0)
    }

    /// Dispose of the source
    ///
    /// Equivalent to dropping.
    pub fn dispose(self) {
        drop(self);
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        CancelSource::new()
    }
}

impl Drop for CancelSource {
    fn drop(&mut self) {
        for link in self.links.drain(..) {
            link.try_unregister();
        }
        self.cell.dispose(self.id);
        trace!(id = self.id, "cancel source disposed");
        SourceCell::pool().release(Arc::clone(&self.cell));
    }
}

impl Debug for CancelSource {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("CancelSource")
            .field("id", &self.id)
            .field("cancel_requested", &self.is_cancel_requested())
            .finish()
    }
}


/// Observer of a [`CancelSource`]
///
/// Cheap to clone. [`CancelToken::none`] never cancels. A token whose source was disposed is
/// stale: it reports not canceled, fails [`ensure_valid`](Self::ensure_valid), and registering on
/// it returns [`Registration::Dead`].
#[derive(Clone, Default)]
pub struct CancelToken {
    cell: Option<Arc<SourceCell>>,
    id: u64,
}

impl CancelToken {
    /// A token which is never canceled
    pub fn none() -> Self {
        CancelToken::default()
    }

    /// A token which is already canceled
    pub fn canceled() -> Self {
        // not pooled and never disposed, so it stays canceled
        let cell = Arc::new(SourceCell::default());
        cell.word.store(CANCELED, Release);
        CancelToken { cell: Some(cell), id: 0 }
    }

    /// Register a callback to run when the source is canceled
    ///
    /// If the source is already canceled, `f` runs inline before this returns, and a panic from
    /// it propagates to the caller.
    pub fn register<F>(&self, f: F) -> Registration
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(cell) = &self.cell else { return Registration::Dead };
        let mut regs = cell.regs.lock();
        let word = cell.word.load(Acquire);
        if word >> 8 != self.id || word & DISPOSED != 0 {
            return Registration::Dead;
        }
        if word & CANCELED != 0 {
            drop(regs);
            f();
            return Registration::AlreadyCanceled;
        }
        let key = regs.next_key;
        regs.next_key += 1;
        regs.entries.push((key, Box::new(f)));
        Registration::Active(CancelRegistration {
            cell: Arc::clone(cell),
            id: self.id,
            key,
        })
    }

    /// Whether cancellation has been requested
    pub fn is_cancel_requested(&self) -> bool {
        match &self.cell {
            Some(cell) => cell.flags(self.id).is_some_and(|flags| flags & CANCELED != 0),
            None => false,
        }
    }

    /// Whether this token could ever be canceled
    pub fn can_be_canceled(&self) -> bool {
        match &self.cell {
            Some(cell) => cell.flags(self.id).is_some_and(|flags| flags & DISPOSED == 0),
            None => false,
        }
    }

    /// Whether this token is not stale
    pub fn is_valid(&self) -> bool {
        match &self.cell {
            Some(cell) => cell.flags(self.id).is_some_and(|flags| flags & DISPOSED == 0),
            None => true,
        }
    }

    /// Fail with [`InvalidOperation::StaleToken`] if this token is stale
    pub fn ensure_valid(&self) -> Result<(), InvalidOperation> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(InvalidOperation::StaleToken)
        }
    }

    /// Fail with [`Failure::Canceled`] if cancellation has been requested
    pub fn check(&self) -> Result<(), Failure> {
        if self.is_cancel_requested() {
            Err(Failure::Canceled)
        } else {
            Ok(())
        }
    }

    // view as a one-element slice, for linking.
    pub(crate) fn as_slice(&self) -> &[CancelToken] {
        slice::from_ref(self)
    }
}

impl Debug for CancelToken {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match &self.cell {
            Some(_) => f.debug_struct("CancelToken")
                .field("id", &self.id)
                .field("cancel_requested", &self.is_cancel_requested())
                .field("valid", &self.is_valid())
                .finish(),
            None => f.write_str("CancelToken(none)"),
        }
    }
}


/// Result of registering a cancellation callback
#[derive(Debug)]
pub enum Registration {
    /// The callback is registered and will run if the source is canceled
    Active(CancelRegistration),
    /// The source was already canceled, so the callback already ran
    AlreadyCanceled,
    /// The source was disposed, or the token can never be canceled, so the callback was dropped
    Dead,
}

/// Handle to a registered cancellation callback
///
/// Dropping the handle leaves the callback registered.
pub struct CancelRegistration {
    cell: Arc<SourceCell>,
    id: u64,
    key: u64,
}

impl CancelRegistration {
    /// Remove the callback if it has not yet run
    ///
    /// Returns true iff the callback was removed before running. Returns false if it already ran
    /// or is running, was already removed, or the source was disposed. Safe to race against a
    /// concurrent cancel: exactly one of them gets the callback.
    pub fn try_unregister(&self) -> bool {
        let removed = {
            let mut regs = self.cell.regs.lock();
            if self.cell.word.load(Acquire) >> 8 != self.id {
                return false;
            }
            let position = regs.entries.iter().position(|&(key, _)| key == self.key);
            position.map(|i| regs.entries.remove(i))
        };
        removed.is_some()
    }
}

impl Debug for CancelRegistration {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("CancelRegistration")
            .field("id", &self.id)
            .field("key", &self.key)
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering::SeqCst},
            Mutex,
        },
        thread,
    };

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Box<dyn FnOnce() + Send>) {
        let count = Arc::new(AtomicUsize::new(0));
        let count_2 = Arc::clone(&count);
        (count, move || {
            let count = Arc::clone(&count_2);
            Box::new(move || {
                count.fetch_add(1, SeqCst);
            })
        })
    }

    #[test]
    fn cancel_idempotence_test() {
        let (count, make) = counter();
        let source = CancelSource::new();
        let token = source.token();
        let registration = match token.register(make()) {
            Registration::Active(registration) => registration,
            other => panic!("unexpected {:?}", other),
        };
        token.register(make());

        source.cancel().unwrap();
        source.cancel().unwrap();
        assert_eq!(count.load(SeqCst), 2);
        assert!(!registration.try_unregister());
        assert!(token.is_cancel_requested());
        assert!(token.check().unwrap_err().is_canceled());
    }

    #[test]
    fn registration_order_test() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let source = CancelSource::new();
        for i in 0..5 {
            let log = Arc::clone(&log);
            source.token().register(move || log.lock().unwrap().push(i));
        }
        source.cancel().unwrap();
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn unregister_test() {
        let (count, make) = counter();
        let source = CancelSource::new();
        let Registration::Active(registration) = source.token().register(make()) else {
            panic!("not active");
        };
        assert!(registration.try_unregister());
        assert!(!registration.try_unregister());
        source.cancel().unwrap();
        assert_eq!(count.load(SeqCst), 0);
    }

    #[test]
    fn already_canceled_runs_inline_test() {
        let (count, make) = counter();
        let token = CancelToken::canceled();
        assert!(matches!(token.register(make()), Registration::AlreadyCanceled));
        assert_eq!(count.load(SeqCst), 1);

        let source = CancelSource::new();
        source.cancel().unwrap();
        assert!(matches!(source.token().register(make()), Registration::AlreadyCanceled));
        assert_eq!(count.load(SeqCst), 2);
    }

    #[test]
    fn dispose_test() {
        let (count, make) = counter();
        let source = CancelSource::new();
        let token = source.token();
        let Registration::Active(registration) = token.register(make()) else {
            panic!("not active");
        };
        assert!(token.is_valid());
        source.dispose();

        assert!(!token.is_valid());
        assert!(!token.can_be_canceled());
        assert_eq!(token.ensure_valid(), Err(InvalidOperation::StaleToken));
        assert!(matches!(token.register(make()), Registration::Dead));
        assert!(!registration.try_unregister());
        assert_eq!(count.load(SeqCst), 0);
    }

    #[test]
    fn none_token_test() {
        let token = CancelToken::none();
        assert!(token.is_valid());
        assert!(!token.can_be_canceled());
        assert!(matches!(token.register(|| ()), Registration::Dead));
        assert!(token.check().is_ok());
    }

    #[test]
    fn panicking_callbacks_aggregate_test() {
        let (count, make) = counter();
        let source = CancelSource::new();
        source.token().register(|| panic!("first"));
        source.token().register(make());
        source.token().register(|| panic!("second"));

        let aggregate = source.cancel().unwrap_err();
        assert_eq!(count.load(SeqCst), 1);
        let messages = aggregate.reasons().iter().map(|r| r.to_string()).collect::<Vec<_>>();
        assert_eq!(messages, vec!["callback panicked: first", "callback panicked: second"]);
    }

    #[test]
    fn linked_test() {
        let parent_a = CancelSource::new();
        let parent_b = CancelSource::new();
        let child = CancelSource::linked(&[parent_a.token(), parent_b.token()]);
        child.token().register(|| panic!("child callback"));

        assert!(!child.is_cancel_requested());
        let aggregate = parent_b.cancel().unwrap_err();
        assert!(child.is_cancel_requested());
        // the child's aggregate is nested in the parent's
        let nested = aggregate.reasons()[0].as_aggregate().unwrap();
        assert_eq!(nested.reasons()[0].to_string(), "callback panicked: child callback");

        // disposing the child unlinks it from the parent it wasn't canceled through
        child.dispose();
        parent_a.cancel().unwrap();
    }

    #[test]
    fn concurrent_cancel_and_unregister_test() {
        for _ in 0..200 {
            let (count, make) = counter();
            let source = CancelSource::new();
            let Registration::Active(registration) = source.token().register(make()) else {
                panic!("not active");
            };
            let join = thread::spawn(move || registration.try_unregister());
            source.cancel().unwrap();
            let unregistered = join.join().unwrap();
            // exactly one of them got the callback
            assert_eq!(count.load(SeqCst) + unregistered as usize, 1);
        }
    }
}
