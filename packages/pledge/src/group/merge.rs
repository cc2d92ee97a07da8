// merging: joining operations of different types into a tuple.
//
// the accumulator is a join over type-erased slots. the builder's type parameter tracks the tuple
// of value types added so far, so that sealing can downcast every slot back.

use crate::{
    cancel::CancelToken,
    error::AggregateError,
    group::join::{core_of, join_outcomes, join_results, JoinCore},
    promise::{cell::Observer, Deferred, Outcome, Promise},
};
use std::{
    any::{type_name, Any},
    fmt::{self, Debug, Formatter},
    marker::PhantomData,
    sync::Arc,
};


type Erased = Box<dyn Any + Send>;

pub(crate) struct MergeCore(JoinCore<Erased>);

impl<U: Send + 'static> Observer<U> for MergeCore {
    fn observe(self: Arc<Self>, index: usize, outcome: Outcome<U>) {
        self.0.record(index, outcome.map(|value| Box::new(value) as Erased));
    }
}

fn unerase<T: 'static>(value: Option<Erased>) -> T {
    let value = value.expect("merge slot missing (internal bug)");
    match value.downcast::<T>() {
        Ok(value) => *value,
        Err(_) => panic!("merge slot is not a {} (internal bug)", type_name::<T>()),
    }
}


/// Tuple of value types a [`MergeGroup`] can resolve with
pub trait MergeTuple: Sized + Send + 'static {
    /// Tuple of the outcomes of the same types
    type Results: Send + 'static;

    #[doc(hidden)]
    fn from_values(values: Vec<Box<dyn Any + Send>>) -> Self;

    #[doc(hidden)]
    fn results_from(outcomes: Vec<Outcome<Box<dyn Any + Send>>>) -> Self::Results;
}

/// Tuple which can have one more element type appended
pub trait Append<U> {
    /// The tuple with `U` appended
    type Output: MergeTuple;
}

macro_rules! merge_tuple {
    ($($t:ident)*) => {
        impl<$($t: Send + 'static,)*> MergeTuple for ($($t,)*) {
            type Results = ($(Outcome<$t>,)*);

            #[allow(unused_variables, unused_mut, clippy::unused_unit)]
            fn from_values(values: Vec<Box<dyn Any + Send>>) -> Self {
                let mut values = values.into_iter();
                ($(unerase::<$t>(values.next()),)*)
            }

            #[allow(unused_variables, unused_mut, clippy::unused_unit)]
            fn results_from(outcomes: Vec<Outcome<Box<dyn Any + Send>>>) -> Self::Results {
                let mut outcomes = outcomes.into_iter();
                ($(
                    outcomes.next()
                        .expect("merge slot missing (internal bug)")
                        .map(|value| unerase::<$t>(Some(value))),
                )*)
            }
        }
    };
}

macro_rules! append {
    ($($t:ident)*) => {
        impl<$($t: Send + 'static,)* Next: Send + 'static> Append<Next> for ($($t,)*) {
            type Output = ($($t,)* Next,);
        }
    };
}

merge_tuple!();
merge_tuple!(A);
merge_tuple!(A B);
merge_tuple!(A B C);
merge_tuple!(A B C D);
merge_tuple!(A B C D E);
merge_tuple!(A B C D E F);
merge_tuple!(A B C D E F G);
merge_tuple!(A B C D E F G H);

append!();
append!(A);
append!(A B);
append!(A B C);
append!(A B C D);
append!(A B C D E);
append!(A B C D E F);
append!(A B C D E F G);


macro_rules! merge_group {
    (
        $(#[$attr:meta])*
        $name:ident => $output:ty, $join:ident, $convert:path
    ) => {
        $(#[$attr])*
        pub struct $name<Tup> {
            core: Option<Arc<MergeCore>>,
            version: u32,
            _tuple: PhantomData<fn() -> Tup>,
        }

        impl $name<()> {
            /// Construct, expecting about `capacity` operations
            #[track_caller]
            pub fn new(capacity: usize) -> Self {
                let (core, _) = JoinCore::new(capacity, None);
                $name { core: Some(Arc::new(MergeCore(core))), version: 0, _tuple: PhantomData }
            }

            /// Construct, linked to `token`, and return the group token
            ///
            /// The group token is canceled when `token` is, or when the first operation completes
            /// without resolving. Panics if `token` is stale.
            #[track_caller]
            pub fn with_cancel(capacity: usize, token: &CancelToken) -> (Self, CancelToken) {
                let (core, group_token) = JoinCore::new(capacity, Some(token));
                let group = $name { core: Some(Arc::new(MergeCore(core))), version: 0, _tuple: PhantomData };
                (group, group_token)
            }
        }

        impl<Tup> $name<Tup> {
            /// Add an operation, appending its value type to the tuple
            ///
            /// Panics if this builder is default-constructed.
            #[track_caller]
            pub fn add<U>(self, promise: Promise<U>) -> $name<Tup::Output>
            where
                U: Send + 'static,
                Tup: Append<U>,
            {
                let core = core_of(self.core);
                let version = core.0.version.advance(self.version);
                let index = core.0.add_slot();
                promise.observe(Arc::clone(&core) as _, index);
                $name { core: Some(core), version, _tuple: PhantomData }
            }

            /// Finish adding operations, and get the merged operation
            ///
            /// Panics if this builder is default-constructed.
            #[track_caller]
            pub fn wait_async(self) -> Promise<$output>
            where
                Tup: MergeTuple,
            {
                let core = core_of(self.core);
                core.0.version.seal(self.version);
                let (deferred, promise) = Deferred::new();
                core.0.seal(Box::new(move |slots: Vec<Outcome<Erased>>, callback_error: Option<AggregateError>| {
                    let outcome = $join(slots, callback_error).map($convert);
                    deferred.settle_in(None, outcome)
                        .expect("group operation completed twice (internal bug)");
                }));
                promise
            }
        }

        impl<Tup> Default for $name<Tup> {
            fn default() -> Self {
                $name { core: None, version: 0, _tuple: PhantomData }
            }
        }

        impl<Tup> Debug for $name<Tup> {
            fn fmt(&self, f: &mut Formatter) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("valid", &self.core.is_some())
                    .field("version", &self.version)
                    .field("tuple", &type_name::<Tup>())
                    .finish()
            }
        }
    };
}

merge_group!(
    /// Builder joining operations of different types into an operation resolving with a tuple
    ///
    /// Up to eight operations can be merged. Settles by the same rules as an
    /// [`AllGroup`](crate::AllGroup): rejected if any rejected, else canceled if any was
    /// canceled, else resolved, always after every operation completed.
    MergeGroup => Tup, join_outcomes, Tup::from_values
);

merge_group!(
    /// Builder joining operations of different types into an operation resolving with a tuple of
    /// their outcomes
    MergeResultsGroup => Tup::Results, join_results, Tup::results_from
);
