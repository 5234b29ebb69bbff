use fw_sync::{Tpl, TplMutex};
use std::panic::{AssertUnwindSafe, catch_unwind};

#[test]
fn guard_releases_on_drop() {
    let lock = TplMutex::new(Tpl::NOTIFY, "counter", 0_u32);
    *lock.lock() = 41;
    *lock.lock() += 1;
    assert_eq!(*lock.lock(), 42);
    assert!(!lock.is_locked());
}

#[test]
fn held_lock_reports_its_level_and_name() {
    let lock = TplMutex::new(Tpl::HIGH_LEVEL, "high", ());
    let guard = lock.lock();
    assert!(lock.is_locked());
    assert_eq!(lock.tpl(), Tpl::HIGH_LEVEL);
    assert_eq!(lock.name(), "high");
    assert!(format!("{lock:?}").contains("held: true"));
    drop(guard);
    assert!(!lock.is_locked());
}

#[test]
fn try_lock_fails_while_held() {
    let lock = TplMutex::new(Tpl::NOTIFY, "try", 1_u8);
    let held = lock.try_lock().expect("free lock");
    assert_eq!(*held, 1);
    assert!(lock.try_lock().is_none());
    drop(held);
    assert!(lock.try_lock().is_some());
}

#[test]
fn reentry_panics_with_the_lock_name() {
    let lock = TplMutex::new(Tpl::NOTIFY, "memory lock", 0_u8);
    let _held = lock.lock();
    let payload = catch_unwind(AssertUnwindSafe(|| drop(lock.lock())))
        .expect_err("re-entry must panic");
    let message = payload.downcast_ref::<String>().cloned().unwrap_or_default();
    assert_eq!(message, "lock memory lock re-entered");
}

#[test]
fn with_lock_survives_a_panicking_closure() {
    let lock = TplMutex::new(Tpl::NOTIFY, "unwind", String::from("a"));
    assert_eq!(lock.with_lock(|s| { s.push('b'); s.len() }), 2);

    let result = catch_unwind(AssertUnwindSafe(|| {
        lock.with_lock(|s| {
            s.push('c');
            panic!("boom");
        });
    }));
    assert!(result.is_err());
    assert!(!lock.is_locked());
    assert_eq!(lock.with_lock(|s| s.clone()), "abc");
}

#[test]
fn exclusive_access_skips_locking() {
    let mut lock = TplMutex::new(Tpl::NOTIFY, "owned", vec![1, 2, 3]);
    lock.get_mut().push(4);
    assert!(!lock.is_locked());
    assert_eq!(lock.into_inner(), [1, 2, 3, 4]);
}

#[test]
fn shareable_across_threads() {
    fn assert_sync<S: Sync + Send>() {}
    assert_sync::<TplMutex<Vec<u64>>>();
}
