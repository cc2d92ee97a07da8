// shorthands for groups built straight from an iterator.

use crate::{
    group::{join::AllGroup, race::RaceGroup},
    promise::Promise,
};


/// Join all operations, resolving with their values in order
///
/// Shorthand for an [`AllGroup`](crate::AllGroup) without a cancel token.
#[track_caller]
pub fn all<T, I>(promises: I) -> Promise<Vec<T>>
where
    T: Send + 'static,
    I: IntoIterator<Item = Promise<T>>,
{
    let promises = promises.into_iter();
    let group = AllGroup::new(promises.size_hint().0);
    promises.fold(group, AllGroup::add).wait_async()
}

/// Race operations, completing like the first of them to complete
///
/// Shorthand for a [`RaceGroup`](crate::RaceGroup) without a cancel token. Panics if `promises`
/// is empty.
#[track_caller]
pub fn race<T, I>(promises: I) -> Promise<T>
where
    T: Send + 'static,
    I: IntoIterator<Item = Promise<T>>,
{
    let promises = promises.into_iter();
    let group = RaceGroup::new(promises.size_hint().0);
    promises.fold(group, RaceGroup::add).wait_async()
}

/// Race operations, resolving like the first of them to resolve
///
/// Only if none of them resolve does this complete with a non-resolved outcome. Rejections of the
/// operations which lost are not reported. Panics if `promises` is empty.
#[track_caller]
pub fn race_first<T, I>(promises: I) -> Promise<T>
where
    T: Send + 'static,
    I: IntoIterator<Item = Promise<T>>,
{
    let promises = promises.into_iter();
    let group = RaceGroup::new(promises.size_hint().0)
        .with_cancel_on_non_resolved(false)
        .with_suppress_unobserved_rejections(true);
    promises.fold(group, RaceGroup::add).wait_async()
}
