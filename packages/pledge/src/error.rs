// error types.
//
// there are two disjoint classes:
//
// - protocol errors (`InvalidOperation`) are bugs in the calling code. they are reported
//   synchronously to whoever misused the API and never turn into a rejection.
// - asynchronous outcomes (`Reason`, `Failure`) are the payloads that operations settle with.

use smallvec::SmallVec;
use std::{
    any::Any,
    fmt::{self, Debug, Display, Formatter},
    sync::Arc,
};
use thiserror::Error;


// ==== protocol errors ====


/// Misuse of the API, detected synchronously at the point of misuse
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Error)]
pub enum InvalidOperation {
    /// The handle refers to an operation which has already been consumed and recycled
    #[error("operation handle is stale: the operation was already consumed or recycled")]
    StaleHandle,
    /// The operation has already transitioned to a terminal state
    #[error("operation was already completed")]
    AlreadyCompleted,
    /// An operation was made to wait on itself
    #[error("an operation cannot wait on itself")]
    SelfAwait,
    /// Adopting the operation would create a cycle of operations waiting on each other
    #[error("circular promise chain detected")]
    CircularChain,
    /// The group builder is default-constructed or was already sealed
    #[error("promise group is invalid: it is default-constructed or was already sealed")]
    InvalidGroup,
    /// A race was sealed without any constituents
    #[error("a race requires at least one promise")]
    EmptyRace,
    /// The cancel token refers to a source which has been disposed and recycled
    #[error("cancel token refers to a disposed source")]
    StaleToken,
}


// ==== rejection reasons ====


/// Reason an operation was rejected
///
/// Cheap to clone. Wraps an [`anyhow::Error`], so arbitrary error types and diagnostic context
/// can be carried.
#[derive(Clone)]
pub struct Reason(Arc<anyhow::Error>);

impl Reason {
    /// Wrap an error as a rejection reason
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Reason(Arc::new(anyhow::Error::new(error)))
    }

    /// Construct a rejection reason from a message
    pub fn msg<M>(message: M) -> Self
    where
        M: Display + Debug + Send + Sync + 'static,
    {
        Reason(Arc::new(anyhow::Error::msg(message)))
    }

    /// Borrow the underlying error
    pub fn error(&self) -> &anyhow::Error {
        &self.0
    }

    /// Attempt to downcast the underlying error to a concrete type
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: Display + Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    /// If this reason is an [`AggregateError`], borrow it
    pub fn as_aggregate(&self) -> Option<&AggregateError> {
        self.downcast_ref::<AggregateError>()
    }

    /// Whether two reasons are the same shared allocation
    pub fn ptr_eq(a: &Reason, b: &Reason) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    // convert a caught panic payload into a reason.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        // cancel propagation between linked sources unwinds with the aggregate as its payload,
        // so that it nests rather than getting flattened into a message.
        let payload = match payload.downcast::<AggregateError>() {
            Ok(aggregate) => return Reason::new(*aggregate),
            Err(payload) => payload,
        };
        let payload = match payload.downcast::<Reason>() {
            Ok(reason) => return *reason,
            Err(payload) => payload,
        };
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "<non-string panic payload>".to_owned()
        };
        Reason::new(PanicError { message })
    }
}

impl From<anyhow::Error> for Reason {
    fn from(error: anyhow::Error) -> Self {
        Reason(Arc::new(error))
    }
}

impl From<InvalidOperation> for Reason {
    fn from(error: InvalidOperation) -> Self {
        Reason::new(error)
    }
}

impl From<AggregateError> for Reason {
    fn from(error: AggregateError) -> Self {
        Reason::new(error)
    }
}

impl Debug for Reason {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Debug::fmt(&*self.0, f)
    }
}

impl Display for Reason {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Display::fmt(&*self.0, f)
    }
}

impl std::error::Error for Reason {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}


/// A user callback panicked
#[derive(Debug, Clone, Error)]
#[error("callback panicked: {message}")]
pub struct PanicError {
    message: String,
}

impl PanicError {
    /// The panic message, if the payload was a string
    pub fn message(&self) -> &str {
        &self.message
    }
}


/// Multiple rejection reasons, in the order of the operations they came from
#[derive(Debug, Clone, Error)]
pub struct AggregateError {
    reasons: SmallVec<[Reason; 2]>,
}

impl AggregateError {
    pub(crate) fn new(reasons: SmallVec<[Reason; 2]>) -> Self {
        debug_assert!(!reasons.is_empty(), "empty AggregateError (internal bug)");
        AggregateError { reasons }
    }

    /// The aggregated reasons
    pub fn reasons(&self) -> &[Reason] {
        &self.reasons
    }

    /// Number of aggregated reasons
    pub fn len(&self) -> usize {
        self.reasons.len()
    }

    /// Always false; aggregates are never constructed empty
    pub fn is_empty(&self) -> bool {
        self.reasons.is_empty()
    }
}

impl Display for AggregateError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{} operation(s) failed: [", self.reasons.len())?;
        for (i, reason) in self.reasons.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            Display::fmt(reason, f)?;
        }
        f.write_str("]")
    }
}


/// Cancel registration callbacks failed while a group was cancelling its constituents
///
/// This is nested inside a group's aggregate rather than flattened alongside the constituents'
/// own reasons, so its origin remains distinguishable.
#[derive(Debug, Clone, Error)]
#[error("cancel registration callback failed: {0}")]
pub struct CancelCallbackError(pub AggregateError);


// ==== outcome errors ====


/// Non-success terminal state of an operation
#[derive(Debug, Clone, Error)]
pub enum Failure {
    /// The operation was rejected
    #[error("operation rejected: {0}")]
    Rejected(Reason),
    /// The operation was canceled
    #[error("operation canceled")]
    Canceled,
}

impl Failure {
    /// Whether this is the canceled state
    pub fn is_canceled(&self) -> bool {
        matches!(self, Failure::Canceled)
    }

    /// The rejection reason, if rejected
    pub fn reason(&self) -> Option<&Reason> {
        match self {
            Failure::Rejected(reason) => Some(reason),
            Failure::Canceled => None,
        }
    }
}

/// Error for attempting to wait on an operation with no or limited blocking, and the operation
/// not completing immediately or by the specified deadline
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Error)]
#[error("operation would block")]
pub struct WouldBlockError;

macro_rules! compound_from {
    ($compound:ident {$(
        $variant:ident($inner:ty),
    )*})=>{$(
        impl From<$inner> for $compound {
            fn from(inner: $inner) -> Self {
                Self::$variant(inner)
            }
        }
    )*};
}

/// Error for waiting on an operation with no or limited blocking
#[derive(Debug, Clone, Error)]
pub enum TryWaitError {
    /// The operation settled in a non-success terminal state
    #[error(transparent)]
    Terminal(Failure),
    /// The operation could not be resolved immediately or by the specified deadline
    #[error(transparent)]
    WouldBlock(WouldBlockError),
}

compound_from!(TryWaitError {
    Terminal(Failure),
    WouldBlock(WouldBlockError),
});
