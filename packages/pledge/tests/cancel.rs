use pledge::{CancelSource, CancelToken, Registration};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering::SeqCst},
        Arc,
        Barrier,
    },
    thread,
};


fn counting(count: &Arc<AtomicUsize>) -> impl FnOnce() + Send + 'static {
    let count = Arc::clone(count);
    move || {
        count.fetch_add(1, SeqCst);
    }
}

#[test]
fn cancel_twice_runs_callbacks_once() {
    let count = Arc::new(AtomicUsize::new(0));
    let source = CancelSource::new();
    let token = source.token();
    let registrations = (0..4).map(|_| token.register(counting(&count))).collect::<Vec<_>>();

    source.cancel().unwrap();
    source.cancel().unwrap();
    assert_eq!(count.load(SeqCst), 4);

    for registration in registrations {
        match registration {
            Registration::Active(registration) => assert!(!registration.try_unregister()),
            other => panic!("unexpected {:?}", other),
        }
    }
}

#[test]
fn unregister_races_cancel() {
    for _ in 0..200 {
        let count = Arc::new(AtomicUsize::new(0));
        let source = CancelSource::new();
        let registration = match source.token().register(counting(&count)) {
            Registration::Active(registration) => registration,
            other => panic!("unexpected {:?}", other),
        };
        let barrier = Arc::new(Barrier::new(2));

        let barrier_2 = Arc::clone(&barrier);
        let unregister = thread::spawn(move || {
            barrier_2.wait();
            registration.try_unregister()
        });
        barrier.wait();
        source.cancel().unwrap();
        let unregistered = unregister.join().unwrap();

        // exactly one of them got the callback
        assert_ne!(unregistered, count.load(SeqCst) == 1);
    }
}

#[test]
fn linked_source_follows_every_parent() {
    let a = CancelSource::new();
    let b = CancelSource::new();
    let linked = CancelSource::linked(&[a.token(), b.token()]);
    let count = Arc::new(AtomicUsize::new(0));
    linked.token().register(counting(&count));

    b.cancel().unwrap();
    assert!(linked.is_cancel_requested());
    assert!(!a.is_cancel_requested());
    a.cancel().unwrap();
    assert_eq!(count.load(SeqCst), 1);
}

#[test]
fn disposed_source_is_dead() {
    let source = CancelSource::new();
    let token = source.token();
    assert!(token.can_be_canceled());
    source.dispose();

    assert!(!token.is_valid());
    assert!(!token.can_be_canceled());
    assert!(!token.is_cancel_requested());
    assert!(token.ensure_valid().is_err());
    assert!(matches!(token.register(|| panic!("must not run")), Registration::Dead));
}

#[test]
fn register_races_dispose() {
    for _ in 0..500 {
        let count = Arc::new(AtomicUsize::new(0));
        let source = CancelSource::new();
        let token = source.token();
        let barrier = Arc::new(Barrier::new(2));

        let barrier_2 = Arc::clone(&barrier);
        let count_2 = Arc::clone(&count);
        let register = thread::spawn(move || {
            barrier_2.wait();
            let registrations = (0..4)
                .map(|_| token.register(counting(&count_2)))
                .collect::<Vec<_>>();
            (token, registrations)
        });
        barrier.wait();
        source.dispose();
        let (token, registrations) = register.join().unwrap();

        // a registration that got in before disposal was dropped unrun
        for registration in registrations {
            match registration {
                Registration::Active(registration) => assert!(!registration.try_unregister()),
                Registration::Dead => (),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(!token.is_valid());
        assert!(matches!(token.register(counting(&count)), Registration::Dead));
        assert_eq!(count.load(SeqCst), 0);
        // the disposed callbacks released their captures
        assert_eq!(Arc::strong_count(&count), 1);
    }
}

#[test]
fn canceled_token_runs_inline() {
    let count = Arc::new(AtomicUsize::new(0));
    let token = CancelToken::canceled();
    assert!(matches!(token.register(counting(&count)), Registration::AlreadyCanceled));
    assert_eq!(count.load(SeqCst), 1);
    assert!(token.check().unwrap_err().is_canceled());
    assert!(CancelToken::none().check().is_ok());
}
