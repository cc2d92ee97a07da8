// per-type object pools.
//
// each pooled type has its own pool, and each pool is a free-list stack guarded by a spinlock,
// so acquire and release are O(1) with one short critical section each.
//
// the free-list is linked through indices rather than pointers:
//
//   FreeList.slots: [ sentinel | slot 1 | slot 2 | ... ]
//                      ^   |
//                      \---/  the sentinel's `next` is itself, and a list is empty iff its head
//                             is `SENTINEL`.
//
// slots form two lists through the same `next` field: `head` links the slots holding an idle
// object, `vacant` links the empty ones. an object only occupies a slot while it sits idle in
// the pool. its `PoolLink` records that slot, tagged with the pool's epoch, and is reset when
// the object is taken out again, so dropping an acquired object never strands a slot. clearing
// a pool bumps its epoch, which invalidates every recorded index at once.
//
// there is no per-instantiation static in rust, so pools for generic types are found through a
// registry keyed by `TypeId`. non-generic types can skip the lookup by overriding
// `Recycle::pool` to return a dedicated static. either way, an object remembers the pool it
// came from, and `release` sends it back there without consulting the registry.

use crate::{
    config,
    util::spin::SpinLock,
};
use dashmap::DashMap;
use std::{
    any::{type_name, Any, TypeId},
    ptr,
    sync::{
        atomic::{
            AtomicBool,
            AtomicPtr,
            AtomicU64,
            Ordering::{AcqRel, Acquire, Relaxed, Release},
        },
        Arc,
        OnceLock,
    },
};


// index of the sentinel slot.
const SENTINEL: u32 = 0;

// PoolLink value for an object which is not idle in a pool.
const UNLINKED: u64 = u64::MAX;

// a pool, type-erased so an object's link can point back to it.
type ErasedPool = &'static (dyn Any + Send + Sync);


/// Intrusive free-list link embedded in every pooled object
pub struct PoolLink {
    // (epoch << 32) | slot index while idle in a pool, otherwise UNLINKED.
    slot: AtomicU64,
    // the pool this object was allocated by or last released to, or null.
    home: AtomicPtr<ErasedPool>,
}

impl PoolLink {
    /// Construct unlinked
    pub const fn new() -> Self {
        PoolLink {
            slot: AtomicU64::new(UNLINKED),
            home: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn set_home<T: Recycle>(&self, pool: &'static Pool<T>) {
        self.home.store(pool.erased() as *const ErasedPool as *mut ErasedPool, Release);
    }

    fn home<T: Recycle>(&self) -> Option<&'static Pool<T>> {
        let home = self.home.load(Acquire);
        // safety: only ever set by `set_home`, to a `'static` pool's `erased` field
        let erased: ErasedPool = *unsafe { home.as_ref() }?;
        erased.downcast_ref::<Pool<T>>()
    }
}

impl Default for PoolLink {
    fn default() -> Self {
        PoolLink::new()
    }
}

/// Type which can be kept in a [`Pool`] for reuse
pub trait Recycle: Default + Send + Sync + Sized + 'static {
    /// Borrow the object's free-list link
    fn link(&self) -> &PoolLink;

    /// Reset the object to a reusable state
    ///
    /// Called on every release, including when pooling is disabled and the object is about to be
    /// dropped, so that other handles to it can observe that it was retired.
    fn recycle(&self);

    /// The pool for this type
    fn pool() -> &'static Pool<Self> {
        of::<Self>()
    }
}


/// Free-list of reusable objects of one type
pub struct Pool<T> {
    free: SpinLock<FreeList<T>>,
    // whether this pool has been added to the clear registry.
    registered: AtomicBool,
    erased: OnceLock<ErasedPool>,
}

struct FreeList<T> {
    epoch: u32,
    // first slot holding an idle object.
    head: u32,
    // first empty slot.
    vacant: u32,
    // number of objects currently stored.
    idle: usize,
    // empty until the first release, after which slot 0 is the sentinel.
    slots: Vec<FreeSlot<T>>,
}

struct FreeSlot<T> {
    obj: Option<Arc<T>>,
    next: u32,
}

impl<T: Recycle> Pool<T> {
    /// Construct empty
    pub const fn new() -> Self {
        Pool {
            free: SpinLock::new(FreeList {
                epoch: 0,
                head: SENTINEL,
                vacant: SENTINEL,
                idle: 0,
                slots: Vec::new(),
            }),
            registered: AtomicBool::new(false),
            erased: OnceLock::new(),
        }
    }

    /// Take an object from the pool, or allocate one if the pool is empty or pooling is disabled
    pub fn acquire(&'static self) -> Arc<T> {
        if config::pooling_enabled() {
            let mut free = self.free.lock();
            let idx = free.head;
            if idx != SENTINEL {
                let vacant = free.vacant;
                let slot = &mut free.slots[idx as usize];
                let obj = slot.obj.take().expect("free-list slot empty (internal bug)");
                let next = slot.next;
                slot.next = vacant;
                free.head = next;
                free.vacant = idx;
                free.idle -= 1;
                obj.link().slot.store(UNLINKED, Relaxed);
                return obj;
            }
        }
        trace!(type_name = type_name::<T>(), "pool allocating");
        let obj = Arc::new(T::default());
        obj.link().set_home(self);
        obj
    }

    /// Return an object to the pool, or drop it if pooling is disabled
    pub fn release(&'static self, obj: Arc<T>) {
        obj.recycle();
        if !config::pooling_enabled() {
            return;
        }
        self.register();
        obj.link().set_home(self);

        let mut free = self.free.lock();
        if free.slots.is_empty() {
            free.slots.push(FreeSlot { obj: None, next: SENTINEL });
        }

        let packed = obj.link().slot.load(Relaxed);
        if packed != UNLINKED && (packed >> 32) as u32 == free.epoch {
            debug_assert!(false, "object released to pool twice");
            return;
        }

        // take an empty slot, growing the list only if none is left
        let idx = if free.vacant != SENTINEL {
            let idx = free.vacant;
            free.vacant = free.slots[idx as usize].next;
            idx
        } else {
            let Ok(idx) = u32::try_from(free.slots.len()) else {
                // pool is full; just let the object be dropped
                return;
            };
            free.slots.push(FreeSlot { obj: None, next: SENTINEL });
            idx
        };
        obj.link().slot.store((u64::from(free.epoch) << 32) | u64::from(idx), Relaxed);

        let head = free.head;
        let slot = &mut free.slots[idx as usize];
        slot.obj = Some(obj);
        slot.next = head;
        free.head = idx;
        free.idle += 1;
    }

    /// Number of idle objects currently stored
    pub fn len(&self) -> usize {
        self.free.lock().idle
    }

    /// Whether no idle objects are currently stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every idle object
    pub fn clear(&self) {
        let drained = {
            let mut free = self.free.lock();
            free.epoch = free.epoch.wrapping_add(1);
            free.head = SENTINEL;
            free.vacant = SENTINEL;
            free.idle = 0;
            free.slots.drain(..).filter_map(|slot| slot.obj).collect::<Vec<_>>()
        };
        // objects are dropped outside the critical section
        drop(drained);
    }

    // add this pool to the clear registry, once.
    fn register(&'static self) {
        if !self.registered.load(Acquire) && !self.registered.swap(true, AcqRel) {
            clear_registry().lock().push(self);
        }
    }

    fn erased(&'static self) -> &'static ErasedPool {
        self.erased.get_or_init(|| self as ErasedPool)
    }
}

impl<T: Recycle> Default for Pool<T> {
    fn default() -> Self {
        Pool::new()
    }
}


// type-erased pool, for the clear registry.
trait Clear: Send + Sync {
    fn clear(&self);
}

impl<T: Recycle> Clear for Pool<T> {
    fn clear(&self) {
        Pool::clear(self)
    }
}

fn clear_registry() -> &'static SpinLock<Vec<&'static dyn Clear>> {
    static CLEARS: SpinLock<Vec<&'static dyn Clear>> = SpinLock::new(Vec::new());
    &CLEARS
}

/// Drop the idle objects of every pool that has ever had an object released to it
///
/// Intended for shutdown and test teardown boundaries.
pub fn clear_all() {
    let pools = clear_registry().lock().clone();
    debug!(pools = pools.len(), "clearing all pools");
    for pool in pools {
        pool.clear();
    }
}


/// The pool for a type, found through the type registry
///
/// The first call for a type creates its pool, which then lives for the rest of the process.
pub fn of<T: Recycle>() -> &'static Pool<T> {
    static REGISTRY: OnceLock<DashMap<TypeId, ErasedPool>> = OnceLock::new();

    let registry = REGISTRY.get_or_init(DashMap::new);
    let pool = match registry.get(&TypeId::of::<T>()) {
        Some(pool) => *pool,
        None => *registry.entry(TypeId::of::<T>()).or_insert_with(|| {
            let pool: &'static Pool<T> = Box::leak(Box::new(Pool::new()));
            pool as ErasedPool
        }),
    };
    pool.downcast_ref::<Pool<T>>().expect("pool registry type mismatch (internal bug)")
}

/// Take an object of type `T` from its pool
pub fn acquire<T: Recycle>() -> Arc<T> {
    T::pool().acquire()
}

/// Return an object of type `T` to the pool it came from
///
/// Objects which never passed through a pool go to `T::pool()`.
pub fn release<T: Recycle>(obj: Arc<T>) {
    let pool = obj.link().home::<T>().unwrap_or_else(T::pool);
    pool.release(obj)
}
