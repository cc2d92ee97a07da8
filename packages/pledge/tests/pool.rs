use pledge::{
    config::{install, Config},
    pool::{self, PoolLink, Recycle},
    Deferred,
};
use std::sync::{Arc, Mutex, MutexGuard};


// tests in this file install configs, so they must not interleave.
fn config_lock() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct Buffer {
    link: PoolLink,
    bytes: Mutex<Vec<u8>>,
}

impl Recycle for Buffer {
    fn link(&self) -> &PoolLink {
        &self.link
    }

    fn recycle(&self) {
        self.bytes.lock().unwrap().clear();
    }
}

#[test]
fn reuse_when_enabled() {
    let _guard = config_lock();
    install(Config::new());

    let a = pool::acquire::<Buffer>();
    a.bytes.lock().unwrap().extend_from_slice(b"hello");
    let addr = Arc::as_ptr(&a);
    pool::release(a);

    let b = pool::acquire::<Buffer>();
    assert_eq!(Arc::as_ptr(&b), addr);
    assert!(b.bytes.lock().unwrap().is_empty());
    pool::release(b);
}

#[test]
fn no_reuse_when_disabled() {
    let _guard = config_lock();
    install(Config::new().with_pooling(false));

    let a = pool::acquire::<Buffer>();
    let weak = Arc::downgrade(&a);
    pool::release(a);
    assert!(weak.upgrade().is_none());

    install(Config::new());
}

#[test]
fn clear_drops_idle_objects() {
    let _guard = config_lock();
    install(Config::new());

    let a = pool::acquire::<Buffer>();
    let weak = Arc::downgrade(&a);
    pool::release(a);
    assert!(weak.upgrade().is_some());
    pool::clear_all();
    assert!(weak.upgrade().is_none());
}

#[test]
fn operations_survive_recycling() {
    let _guard = config_lock();
    install(Config::new());

    // every round recycles the operation cell of the previous one
    for i in 0..100u32 {
        let (deferred, promise) = Deferred::new();
        let mut promise = promise.then(move |n: u32| n + i);
        deferred.resolve(1);
        assert_eq!(promise.wait().unwrap(), 1 + i);
        assert!(deferred.try_resolve(0).is_err());
    }
}
