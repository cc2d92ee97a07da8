// terminal outcomes and states.

use crate::error::{Failure, Reason};


/// State of an operation
///
/// Every state but `Pending` is terminal. An operation leaves `Pending` at most once.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum State {
    /// Not yet completed
    Pending = 0,
    /// Completed with a value
    Resolved = 1,
    /// Completed with a rejection reason
    Rejected = 2,
    /// Completed by cancellation
    Canceled = 3,
}

impl State {
    pub(crate) fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(State::Pending),
            1 => Some(State::Resolved),
            2 => Some(State::Rejected),
            3 => Some(State::Canceled),
            _ => None,
        }
    }

    /// Whether this is a terminal state
    pub fn is_terminal(self) -> bool {
        self != State::Pending
    }
}


/// Terminal outcome of an operation, with its payload
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    /// Completed with a value
    Resolved(T),
    /// Completed with a rejection reason
    Rejected(Reason),
    /// Completed by cancellation
    Canceled,
}

impl<T> Outcome<T> {
    /// The terminal state this outcome represents
    pub fn state(&self) -> State {
        match self {
            Outcome::Resolved(_) => State::Resolved,
            Outcome::Rejected(_) => State::Rejected,
            Outcome::Canceled => State::Canceled,
        }
    }

    /// Whether this is the resolved outcome
    pub fn is_resolved(&self) -> bool {
        matches!(self, Outcome::Resolved(_))
    }

    /// Borrow the value, if resolved
    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Resolved(value) => Some(value),
            _ => None,
        }
    }

    /// Borrow the rejection reason, if rejected
    pub fn reason(&self) -> Option<&Reason> {
        match self {
            Outcome::Rejected(reason) => Some(reason),
            _ => None,
        }
    }

    /// Map the value, if resolved
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Outcome<U> {
        match self {
            Outcome::Resolved(value) => Outcome::Resolved(f(value)),
            Outcome::Rejected(reason) => Outcome::Rejected(reason),
            Outcome::Canceled => Outcome::Canceled,
        }
    }

    /// Convert into a result
    pub fn into_result(self) -> Result<T, Failure> {
        match self {
            Outcome::Resolved(value) => Ok(value),
            Outcome::Rejected(reason) => Err(Failure::Rejected(reason)),
            Outcome::Canceled => Err(Failure::Canceled),
        }
    }
}

impl<T> From<Result<T, Failure>> for Outcome<T> {
    fn from(result: Result<T, Failure>) -> Self {
        match result {
            Ok(value) => Outcome::Resolved(value),
            Err(failure) => failure.into(),
        }
    }
}

impl<T> From<Failure> for Outcome<T> {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::Rejected(reason) => Outcome::Rejected(reason),
            Failure::Canceled => Outcome::Canceled,
        }
    }
}
