//! Low-level concurrency utility.

pub(crate) mod spin;
